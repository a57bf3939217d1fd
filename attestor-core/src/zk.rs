//! ZK operator (C3): given a ciphertext record, a key-stream position, and a
//! plaintext redaction mask, produce a proof that the ciphertext decrypts to
//! plaintext equal to the mask on non-redacted positions.
//!
//! The proving/verifying backend itself is out of scope here (the spec
//! treats it as opaque WASM + proving keys consumed over RPC); this module
//! is the trait boundary and cipher-suite-keyed cache the engine drives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use sha3::{Digest, Keccak256};
use subtle::ConstantTimeEq;

use http_provider::bytes::REDACTION_BYTE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    Aes256Ctr,
    Aes128Ctr,
    ChaCha20,
}

/// A proof that `ciphertext` decrypts, starting at `keystream_offset`, to a
/// plaintext equal to `mask` wherever `mask[i] != REDACTION_BYTE`.
#[derive(Debug, Clone)]
pub struct RedactionProof {
    pub cipher_suite: CipherSuite,
    /// Opaque proof bytes; this system treats the underlying proving system
    /// as a black box and only asserts the shape of the interface.
    pub proof_bytes: Vec<u8>,
}

pub trait ZkOperator: Send + Sync {
    fn cipher_suite(&self) -> CipherSuite;

    fn prove(&self, ciphertext: &[u8], keystream_offset: usize, mask: &[u8]) -> Result<RedactionProof>;

    fn verify(&self, ciphertext: &[u8], keystream_offset: usize, mask: &[u8], proof: &RedactionProof) -> Result<bool>;
}

/// A stub operator good enough to exercise the C7 orchestration and its
/// tests without pulling in a real proving system; the real circuit lives
/// behind this same trait when one is wired in.
struct StubOperator(CipherSuite);

impl ZkOperator for StubOperator {
    fn cipher_suite(&self) -> CipherSuite {
        self.0
    }

    fn prove(&self, ciphertext: &[u8], keystream_offset: usize, mask: &[u8]) -> Result<RedactionProof> {
        if mask.len() > ciphertext.len() {
            bail!("mask longer than ciphertext");
        }
        let mut hasher = Keccak256::new();
        hasher.update(ciphertext);
        hasher.update(keystream_offset.to_be_bytes());
        hasher.update(mask);
        Ok(RedactionProof {
            cipher_suite: self.0,
            proof_bytes: hasher.finalize().to_vec(),
        })
    }

    fn verify(&self, ciphertext: &[u8], keystream_offset: usize, mask: &[u8], proof: &RedactionProof) -> Result<bool> {
        if proof.cipher_suite != self.0 {
            return Ok(false);
        }
        let recomputed = self.prove(ciphertext, keystream_offset, mask)?;
        Ok(recomputed.proof_bytes.ct_eq(&proof.proof_bytes).into())
    }
}

/// Stateless-per-proof, cached-per-suite operator pool. Operators carry no
/// state across proofs (§5); the cache just avoids reconstructing one per
/// call.
#[derive(Clone, Default)]
pub struct OperatorCache {
    operators: Arc<Mutex<HashMap<CipherSuite, Arc<dyn ZkOperator>>>>,
}

impl OperatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, suite: CipherSuite) -> Arc<dyn ZkOperator> {
        let mut operators = self.operators.lock().expect("operator cache mutex poisoned");
        operators
            .entry(suite)
            .or_insert_with(|| Arc::new(StubOperator(suite)) as Arc<dyn ZkOperator>)
            .clone()
    }
}

/// Threshold-OPRF nullifier: a fixed-length tag over a hidden byte range,
/// used to replace a `hash = "oprf"` redaction's captured bytes so the
/// revealed output discloses nothing about the input beyond equality.
///
/// The real protocol is a round trip with the attestor's `toprf` RPC (§6);
/// this computes the client-visible masking step plaintiffs feed into that
/// exchange.
pub fn mask_for_oprf(captured: &[u8]) -> Vec<u8> {
    let mut hasher = Keccak256::new();
    hasher.update(b"oprf-mask");
    hasher.update(captured);
    hasher.finalize().to_vec()
}

/// Combine the client-side mask with the attestor's threshold responses into
/// the final nullifier revealed in place of the redacted byte range.
pub fn nullifier_from_responses(mask: &[u8], responses: &[Vec<u8>]) -> Vec<u8> {
    let mut hasher = Keccak256::new();
    hasher.update(mask);
    for r in responses {
        hasher.update(r);
    }
    hasher.finalize().to_vec()
}

/// Build the `zk` reveal mask for a record: `data` with each redaction range
/// overwritten with [`REDACTION_BYTE`].
pub fn build_redacted_mask(data: &[u8], redactions: &[std::ops::Range<usize>]) -> Vec<u8> {
    let mut mask = data.to_vec();
    http_provider::bytes::redact_in_place(&mut mask, redactions);
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prove_then_verify_round_trips() {
        let cache = OperatorCache::new();
        let op = cache.get(CipherSuite::Aes256Ctr);
        let ciphertext = b"some-ciphertext-bytes";
        let mask = build_redacted_mask(b"GET /secret HTTP/1.1", &[4..11]);
        let proof = op.prove(ciphertext, 0, &mask).unwrap();
        assert!(op.verify(ciphertext, 0, &mask, &proof).unwrap());
    }

    #[test]
    fn verify_rejects_mismatched_cipher_suite() {
        let cache = OperatorCache::new();
        let aes = cache.get(CipherSuite::Aes256Ctr);
        let chacha = cache.get(CipherSuite::ChaCha20);
        let ciphertext = b"bytes";
        let mask = b"bytes";
        let proof = aes.prove(ciphertext, 0, mask).unwrap();
        assert!(!chacha.verify(ciphertext, 0, mask, &proof).unwrap());
    }

    #[test]
    fn operator_cache_reuses_same_suite_instance() {
        let cache = OperatorCache::new();
        let a = cache.get(CipherSuite::Aes128Ctr);
        let b = cache.get(CipherSuite::Aes128Ctr);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn build_redacted_mask_fills_only_given_ranges() {
        let mask = build_redacted_mask(b"abcdefgh", &[2..4]);
        assert_eq!(&mask, &[b'a', b'b', REDACTION_BYTE, REDACTION_BYTE, b'e', b'f', b'g', b'h']);
    }

    #[test]
    fn nullifier_is_deterministic_for_same_inputs() {
        let mask = mask_for_oprf(b"secret-value");
        let responses = vec![vec![1, 2, 3], vec![4, 5, 6]];
        let a = nullifier_from_responses(&mask, &responses);
        let b = nullifier_from_responses(&mask, &responses);
        assert_eq!(a, b);
    }
}
