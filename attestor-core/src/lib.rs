//! Attestor core: the TLS-aware transcript recorder (C2), the ZK redaction
//! operator (C3), the attestor claim engine (C7), the WebSocket RPC surface
//! it speaks, and the retry classifier that governs it.
//!
//! This crate never sees an un-redacted secret byte outlive a single
//! function call: everything that crosses the RPC boundary in `rpc` has
//! already been through `http_provider`'s composer/planner redaction step.

pub mod claim;
pub mod engine;
pub mod retry;
pub mod rpc;
pub mod transcript;
pub mod zk;

pub use claim::{address_from_signing_key, canonical_json, sign_identifier, Address, Claim, SignedClaim};
pub use engine::{create_claim_on_attestor, handle_claim_tunnel, run_claim, AttestorRpcClient, ClaimOutcome, ClaimRequest, OnStep, StepName, TunnelTransport};
pub use retry::{should_retry, DEFAULT_MAX_RETRIES};
pub use rpc::{AttestorError, AttestorErrorKind, ClaimTunnelRequest, ClaimTunnelResponse, RpcMessage};
pub use transcript::{RecordContext, RecordType, RevealDescriptor, Sender, Transcript, TlsVersion, WriteRedactionMode};
pub use zk::{CipherSuite, OperatorCache, RedactionProof, ZkOperator};
