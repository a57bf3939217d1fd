//! Claim construction, canonical JSON, and the claim identifier (C7 step 7).

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// Re-serialize `value` with object keys sorted lexicographically at every
/// level and no incidental whitespace. Done explicitly (rather than relying
/// on `serde_json`'s default `BTreeMap`-backed `Map`) so canonicalization
/// holds regardless of whether a transitive dependency enables the
/// `preserve_order` feature.
pub fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(&sort_keys(value)).expect("canonicalized value always serializes")
}

fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> =
                map.iter().map(|(k, v)| (k.clone(), sort_keys(v))).collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// A 20-byte address, hex-encoded with a `0x` prefix for display/serde.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address(pub [u8; 20]);

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)?;
        let arr: [u8; 20] = bytes.try_into().map_err(|_| serde::de::Error::custom("address must be 20 bytes"))?;
        Ok(Address(arr))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub provider: String,
    /// Canonical JSON of the provider parameters.
    pub parameters: String,
    /// Canonical JSON of the verifier-extracted context.
    pub context: String,
    pub owner: Address,
    pub timestamp_s: u32,
    /// `keccak256(canonicalJson({provider, parameters, owner, timestampS, context, epoch}))`
    pub identifier: [u8; 32],
    pub epoch: u32,
}

impl Claim {
    pub fn build(
        provider: &str,
        parameters: &serde_json::Value,
        context: &serde_json::Value,
        owner: Address,
        timestamp_s: u32,
        epoch: u32,
    ) -> Self {
        let parameters_json = canonical_json(parameters);
        let context_json = canonical_json(context);
        let identifier = compute_identifier(provider, &parameters_json, owner, timestamp_s, &context_json, epoch);

        Claim {
            provider: provider.to_string(),
            parameters: parameters_json,
            context: context_json,
            owner,
            timestamp_s,
            identifier,
            epoch,
        }
    }
}

fn compute_identifier(
    provider: &str,
    parameters_json: &str,
    owner: Address,
    timestamp_s: u32,
    context_json: &str,
    epoch: u32,
) -> [u8; 32] {
    // `parameters`/`context` are already canonical JSON strings; embed them
    // as nested raw values so the identifier's own canonicalization doesn't
    // re-escape already-serialized JSON into a JSON string.
    let envelope = format!(
        r#"{{"context":{context_json},"epoch":{epoch},"owner":"0x{owner}","parameters":{parameters_json},"provider":{provider_json},"timestampS":{timestamp_s}}}"#,
        owner = hex::encode(owner.0),
        provider_json = serde_json::to_string(provider).expect("string always serializes"),
    );

    let mut hasher = Keccak256::new();
    hasher.update(envelope.as_bytes());
    hasher.finalize().into()
}

/// `{claim, signatures}` -- the verifier-presentable output of one
/// successful engine invocation. Each signature is 65 bytes (r‖s‖v).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedClaim {
    pub claim: Claim,
    pub signatures: Vec<[u8; 65]>,
    /// Signature over the whole claim-tunnel response, distinct from the
    /// per-attestor claim signatures above.
    pub result_signature: [u8; 65],
}

impl SignedClaim {
    pub fn claim_signature_hex(&self) -> Vec<String> {
        self.signatures.iter().map(hex::encode).collect()
    }
}

/// Sign a claim identifier with an ECDSA (secp256k1) key, returning the
/// 65-byte recoverable `r‖s‖v` signature.
pub fn sign_identifier(identifier: &[u8; 32], signing_key: &k256::ecdsa::SigningKey) -> Result<[u8; 65]> {
    use k256::ecdsa::{RecoveryId, Signature};

    let (signature, recovery_id): (Signature, RecoveryId) = signing_key
        .sign_prehash_recoverable(identifier)
        .context("failed to sign claim identifier")?;

    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&signature.to_bytes());
    out[64] = recovery_id.to_byte();
    Ok(out)
}

/// Derive the 20-byte address bound to a signing key the same way the
/// corpus signs request bytes with the proxy's `k256` key -- keccak256 of
/// the uncompressed public key (minus the leading tag byte), last 20 bytes.
pub fn address_from_signing_key(signing_key: &k256::ecdsa::SigningKey) -> Address {
    let verifying_key = signing_key.verifying_key();
    let encoded = verifying_key.to_encoded_point(false);
    let mut hasher = Keccak256::new();
    hasher.update(&encoded.as_bytes()[1..]);
    let hash = hasher.finalize();
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&hash[12..]);
    Address(addr)
}
