//! Provider-side verification (C8): re-parses a redacted transcript and
//! checks it actually represents a call to the declared provider.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::bytes::REDACTION_BYTE;
use crate::params::HttpProviderParams;
use crate::parser::{self, ParsedResponse};

/// Maximum allowed skew between the `Date` response header and the local
/// clock, beyond which a replayed/pre-recorded transcript is suspected.
pub const MAX_DATE_SKEW_SECONDS: i64 = 5 * 60;

#[derive(Debug, Clone)]
pub struct VerifiedRequest {
    pub method: String,
    pub path: String,
    pub host: String,
}

#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub request: VerifiedRequest,
    pub response: ParsedResponse,
    pub extracted: Vec<(String, String)>,
}

/// Re-parse the redacted request bytes and assert method/path/host match the
/// provider's declared parameters.
pub fn verify_request(redacted_request: &[u8], params: &HttpProviderParams) -> Result<VerifiedRequest> {
    if redacted_request.is_empty() || redacted_request.iter().all(|&b| b == REDACTION_BYTE) {
        anyhow::bail!("first client message request is redacted");
    }

    let text = String::from_utf8_lossy(redacted_request);
    let mut lines = text.splitn(2, "\r\n");
    let request_line = lines.next().context("empty request transcript")?;

    let mut parts = request_line.split(' ');
    let method = parts.next().context("malformed request line: missing method")?;
    let path = parts.next().context("malformed request line: missing path")?;

    let expected_url = url::Url::parse(&params.url).context("invalid provider url")?;
    if expected_url.scheme() != "https" {
        anyhow::bail!("provider url scheme must be https, got \"{}\"", expected_url.scheme());
    }
    let expected_path = {
        let mut p = expected_url.path().to_string();
        if let Some(q) = expected_url.query() {
            p.push('?');
            p.push_str(q);
        }
        p
    };

    if !method.eq_ignore_ascii_case(&params.method) {
        anyhow::bail!("method mismatch: transcript has \"{method}\", provider expects \"{}\"", params.method);
    }
    if path != expected_path {
        anyhow::bail!("path mismatch: transcript has \"{path}\", provider expects \"{expected_path}\"");
    }

    let host = find_header(&text, "host").context("request transcript missing Host header")?;
    let expected_host = expected_url.host_str().context("provider url missing host")?;
    if !host.eq_ignore_ascii_case(expected_host) {
        anyhow::bail!("host mismatch: transcript has \"{host}\", provider expects \"{expected_host}\"");
    }

    Ok(VerifiedRequest {
        method: method.to_string(),
        path: path.to_string(),
        host,
    })
}

fn find_header(text: &str, name: &str) -> Option<String> {
    text.lines()
        .skip(1)
        .take_while(|l| !l.is_empty())
        .find_map(|l| l.split_once(':').filter(|(n, _)| n.trim().eq_ignore_ascii_case(name)).map(|(_, v)| v.trim().to_string()))
}

/// Re-parse the redacted response, check status, and assert the `Date`
/// header (if present) falls within [`MAX_DATE_SKEW_SECONDS`] of `now`.
pub fn verify_response(redacted_response: &[u8], now: DateTime<Utc>) -> Result<ParsedResponse> {
    let mut parsed = parser::parse(redacted_response)?;
    if parsed.status_line_end_index == 0 && parsed.status_code == 0 {
        anyhow::bail!("response transcript has no parsable status line");
    }
    if !parsed.complete {
        let _ = parser::finalize_on_stream_end(redacted_response, &mut parsed);
    }

    if let Some(date_header) = parsed.header("date") {
        let parsed_date = DateTime::parse_from_rfc2822(&date_header.value)
            .context("response Date header is not a valid HTTP-date")?
            .with_timezone(&Utc);
        let skew = (now - parsed_date).num_seconds().abs();
        if skew > MAX_DATE_SKEW_SECONDS {
            anyhow::bail!("response Date header skew of {skew}s exceeds the {MAX_DATE_SKEW_SECONDS}s limit");
        }
    }

    Ok(parsed)
}

/// Extract named captures declared via a regex-based response redaction's
/// sibling "extract" rules -- named groups not marked `hash` are revealed
/// verbatim and returned as provider-visible key/value pairs.
pub fn extract_named_captures(revealed_body: &str, pattern: &str) -> Result<Vec<(String, String)>> {
    let re = regex::Regex::new(pattern).context("invalid extraction regex")?;
    let mut out = Vec::new();
    if let Some(caps) = re.captures(revealed_body) {
        for name in re.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                out.push((name.to_string(), m.as_str().to_string()));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn params() -> HttpProviderParams {
        HttpProviderParams {
            url: "https://api.example.com/v1/data?x=1".into(),
            method: "GET".into(),
            body: None,
            headers: vec![],
            geo_location: None,
            response_matches: vec![],
            response_redactions: vec![],
            param_values: HashMap::new(),
            write_redaction_mode: None,
            additional_client_options: None,
        }
    }

    #[test]
    fn verify_request_accepts_matching_transcript() {
        let req = b"GET /v1/data?x=1 HTTP/1.1\r\nHost: api.example.com\r\n\r\n";
        let verified = verify_request(req, &params()).unwrap();
        assert_eq!(verified.method, "GET");
        assert_eq!(verified.host, "api.example.com");
    }

    #[test]
    fn verify_request_rejects_path_mismatch() {
        let req = b"GET /v1/other HTTP/1.1\r\nHost: api.example.com\r\n\r\n";
        let err = verify_request(req, &params()).unwrap_err().to_string();
        assert!(err.contains("path mismatch"));
    }

    #[test]
    fn verify_request_rejects_host_mismatch() {
        let req = b"GET /v1/data?x=1 HTTP/1.1\r\nHost: evil.example.com\r\n\r\n";
        let err = verify_request(req, &params()).unwrap_err().to_string();
        assert!(err.contains("host mismatch"));
    }

    #[test]
    fn verify_request_rejects_non_https_provider_url() {
        let mut p = params();
        p.url = "http://api.example.com/v1/data?x=1".into();
        let req = b"GET /v1/data?x=1 HTTP/1.1\r\nHost: api.example.com\r\n\r\n";
        let err = verify_request(req, &p).unwrap_err().to_string();
        assert!(err.contains("https"));
    }

    #[test]
    fn verify_request_rejects_fully_redacted_transcript() {
        let req = vec![REDACTION_BYTE; 32];
        let err = verify_request(&req, &params()).unwrap_err().to_string();
        assert_eq!(err, "first client message request is redacted");
    }

    #[test]
    fn verify_request_rejects_empty_transcript() {
        let err = verify_request(&[], &params()).unwrap_err().to_string();
        assert_eq!(err, "first client message request is redacted");
    }

    #[test]
    fn verify_response_rejects_stale_date() {
        let resp = b"HTTP/1.1 200 OK\r\nDate: Mon, 01 Jan 2001 00:00:00 GMT\r\nContent-Length: 0\r\n\r\n";
        let now = Utc::now();
        let err = verify_response(resp, now).unwrap_err().to_string();
        assert!(err.contains("skew"));
    }

    #[test]
    fn verify_response_accepts_fresh_date() {
        let now = Utc::now();
        let header = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let resp = format!("HTTP/1.1 200 OK\r\nDate: {header}\r\nContent-Length: 0\r\n\r\n");
        let parsed = verify_response(resp.as_bytes(), now).unwrap();
        assert_eq!(parsed.status_code, 200);
    }

    #[test]
    fn extract_named_captures_pulls_out_groups() {
        let captures = extract_named_captures(r#"{"id":"abc123"}"#, r#""id":"(?P<id>[a-z0-9]+)""#).unwrap();
        assert_eq!(captures, vec![("id".to_string(), "abc123".to_string())]);
    }
}
