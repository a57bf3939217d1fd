//! WebSocket RPC surface (§6): message types exchanged between a client
//! driving C7 and an `attestor-server` process, plus the closed error
//! taxonomy carried in `claimTunnel` responses.

use serde::{Deserialize, Serialize};

/// The attestor's closed error taxonomy (§7), layered under `anyhow::Error`
/// at call sites rather than replacing it -- callers still use
/// `.context(...)`; only the retry classifier and the wire protocol need
/// the closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttestorErrorKind {
    #[serde(rename = "ERROR_BAD_REQUEST")]
    BadRequest,
    #[serde(rename = "ERROR_INVALID_CLAIM")]
    InvalidClaim,
    #[serde(rename = "ERROR_AUTHENTICATION_FAILED")]
    AuthenticationFailed,
    #[serde(rename = "ERROR_NOT_FOUND")]
    NotFound,
    #[serde(rename = "ERROR_INTERNAL")]
    Internal,
    #[serde(rename = "ERROR_NETWORK")]
    Network,
    #[serde(rename = "ERROR_NO_ERROR")]
    NoError,
}

impl AttestorErrorKind {
    pub fn wire_code(&self) -> &'static str {
        match self {
            AttestorErrorKind::BadRequest => "ERROR_BAD_REQUEST",
            AttestorErrorKind::InvalidClaim => "ERROR_INVALID_CLAIM",
            AttestorErrorKind::AuthenticationFailed => "ERROR_AUTHENTICATION_FAILED",
            AttestorErrorKind::NotFound => "ERROR_NOT_FOUND",
            AttestorErrorKind::Internal => "ERROR_INTERNAL",
            AttestorErrorKind::Network => "ERROR_NETWORK",
            AttestorErrorKind::NoError => "ERROR_NO_ERROR",
        }
    }
}

/// A typed error with its wire code plus a human detail string -- the
/// `anyhow::Error`-wrapped payload call sites downcast against. Following
/// the corpus's own style (no `thiserror` anywhere in its crates), this
/// implements `std::error::Error` by hand.
#[derive(Debug, Clone)]
pub struct AttestorError {
    pub kind: AttestorErrorKind,
    pub detail: String,
}

impl std::fmt::Display for AttestorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.wire_code(), self.detail)
    }
}

impl std::error::Error for AttestorError {}

impl AttestorError {
    pub fn new(kind: AttestorErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    pub client_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResponseMetadata {
    pub signature_type: String,
    pub toprf_public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResponse {
    pub metadata: InitResponseMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTunnelRequest {
    pub id: u64,
    pub host: String,
    pub port: u16,
    pub geo_location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTunnelAck {
    pub id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelMessage {
    pub tunnel_id: u64,
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToprfRequest {
    pub masked_data: Vec<u8>,
    pub engine: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToprfResponse {
    pub responses: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimTunnelRequest {
    pub request: Vec<u8>,
    pub data: serde_json::Value,
    /// The provider parameters the request was composed from -- provider
    /// configs are public, so the attestor re-validates structurally
    /// against the same declared params rather than needing its own
    /// out-of-band registry (see DESIGN.md).
    pub params: http_provider::params::HttpProviderParams,
    pub transcript_len: usize,
    pub fixed_server_iv: Vec<u8>,
    pub fixed_client_iv: Vec<u8>,
    pub zk_engine: String,
    /// 65-byte r‖s‖v signature over the canonical encoding of this request,
    /// produced with the owner key (§4.C7 step 8).
    pub request_signature: [u8; 65],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimTunnelResponse {
    pub claim: Option<crate::claim::Claim>,
    pub signatures: Vec<[u8; 65]>,
    pub error: Option<AttestorErrorKind>,
    pub error_detail: Option<String>,
}

/// The tagged union of every message exchanged on the attestor WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RpcMessage {
    Init(InitRequest),
    InitResponse(InitResponse),
    CreateTunnel(CreateTunnelRequest),
    CreateTunnelAck(CreateTunnelAck),
    TunnelMessage(TunnelMessage),
    Toprf(ToprfRequest),
    ToprfResponse(ToprfResponse),
    ClaimTunnel(Box<ClaimTunnelRequest>),
    ClaimTunnelResponse(Box<ClaimTunnelResponse>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_round_trips_through_wire_code() {
        let kind = AttestorErrorKind::InvalidClaim;
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, "\"ERROR_INVALID_CLAIM\"");
        let back: AttestorErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn rpc_message_tags_by_type() {
        let msg = RpcMessage::Toprf(ToprfRequest {
            masked_data: vec![1, 2, 3],
            engine: "poseidon".into(),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "Toprf");
    }
}
