//! Retry classifier (§8 testable properties): decides whether a failed
//! attestor invocation is worth retrying.

use crate::rpc::{AttestorError, AttestorErrorKind};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Errors that look like a programming mistake (a malformed call, not a
/// transient condition) are never retried, matching `shouldRetry(TypeError)
/// == false` in the spec's testable properties. There is no `TypeError`
/// type in Rust; the closest analogue this system can produce is a bad
/// request surfaced before any network I/O happened.
pub fn should_retry(error: &anyhow::Error) -> bool {
    if let Some(attestor_error) = error.downcast_ref::<AttestorError>() {
        return matches!(attestor_error.kind, AttestorErrorKind::Network);
    }

    // Not a typed AttestorError: it came from the underlying TLS/IO layer.
    // The one case the spec requires string-sniffing rather than kind
    // matching (§7).
    let message = error.to_string();
    message.contains("stream ended before headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_claim_is_not_retried() {
        let err = anyhow::Error::new(AttestorError::new(AttestorErrorKind::InvalidClaim, "status 403"));
        assert!(!should_retry(&err));
    }

    #[test]
    fn network_error_is_retried() {
        let err = anyhow::Error::new(AttestorError::new(AttestorErrorKind::Network, "connection reset"));
        assert!(should_retry(&err));
    }

    #[test]
    fn bad_request_is_not_retried() {
        let err = anyhow::Error::new(AttestorError::new(AttestorErrorKind::BadRequest, "auth parameters not set"));
        assert!(!should_retry(&err));
    }

    #[test]
    fn stream_ended_before_headers_is_retried() {
        let err = anyhow::anyhow!("stream ended before headers");
        assert!(should_retry(&err));
    }

    #[test]
    fn stream_ended_before_body_is_not_retried() {
        let err = anyhow::anyhow!("stream ended before body");
        assert!(!should_retry(&err));
    }

    #[test]
    fn authentication_failed_is_not_retried() {
        let err = anyhow::Error::new(AttestorError::new(AttestorErrorKind::AuthenticationFailed, "no auth"));
        assert!(!should_retry(&err));
    }
}
