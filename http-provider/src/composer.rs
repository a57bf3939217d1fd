//! HTTP request composer (C4): builds a byte-exact HTTP/1.1 (or HTTP/2)
//! request where every secret byte forms part of a single contiguous,
//! redactable range.

use std::collections::HashMap;
use std::ops::Range;

use anyhow::{bail, Context, Result};

use crate::bytes::merge_ranges;
use crate::params::{HttpProviderParams, SecretParams};

const TECHNICAL_HEADERS: &[&str] = &["host", "connection", "content-length"];
const PRIORITY_HEADER: &str = "priority";

/// A composed request plus the byte ranges that must stay hidden from the
/// attestor (and from any log).
#[derive(Debug, Clone)]
pub struct ComposedRequest {
    pub data: Vec<u8>,
    /// Sorted, non-overlapping, merged redaction ranges over `data`.
    pub redactions: Vec<Range<usize>>,
    /// The single contiguous range covering all secret headers (for the
    /// secret-range redaction invariant test).
    pub secret_header_range: Option<Range<usize>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alpn {
    Http11,
    H2,
}

/// Compose the request. `alpn` selects HTTP/1.1 vs HTTP/2 framing (§4.C4).
pub fn compose_request(
    params: &HttpProviderParams,
    secret: &SecretParams,
    alpn: Alpn,
) -> Result<ComposedRequest> {
    if !secret.has_auth_material() {
        bail!("auth parameters not set");
    }

    let (url, url_hidden) =
        crate::params::substitute_placeholders(&params.url, &params.param_values, &secret.param_values)?;
    let (body, body_hidden) = match &params.body {
        Some(b) => {
            let (resolved, hidden) =
                crate::params::substitute_placeholders(b, &params.param_values, &secret.param_values)?;
            (Some(resolved), hidden)
        }
        None => (None, Vec::new()),
    };

    let parsed = url::Url::parse(&url).context("invalid provider url")?;
    let path_and_query = {
        let mut p = parsed.path().to_string();
        if let Some(q) = parsed.query() {
            p.push('?');
            p.push_str(q);
        }
        p
    };
    let host = parsed
        .host_str()
        .context("provider url missing host")?
        .to_string();

    let headers = merge_headers(params, secret)?;

    match alpn {
        Alpn::Http11 => {
            compose_http11(&params.method, &path_and_query, &headers, body.as_deref(), &url, &url_hidden, &body_hidden)
        }
        Alpn::H2 => compose_h2(&params.method, &path_and_query, &host, &headers, body.as_deref(), &body_hidden),
    }
}

/// One merged header, tagged by whether it came from a secret source.
struct MergedHeader {
    name: String,
    value: String,
    secret: bool,
}

fn merge_headers(params: &HttpProviderParams, secret: &SecretParams) -> Result<Vec<MergedHeader>> {
    let mut merged: Vec<MergedHeader> = Vec::new();
    let mut seen_public: HashMap<String, usize> = HashMap::new();

    for (name, value) in &params.headers {
        let lower = name.to_ascii_lowercase();
        if TECHNICAL_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if let Some(&idx) = seen_public.get(&lower) {
            merged[idx].value = value.clone();
        } else {
            seen_public.insert(lower, merged.len());
            merged.push(MergedHeader {
                name: name.clone(),
                value: value.clone(),
                secret: false,
            });
        }
    }

    let mut cookie_parts = Vec::new();
    for (name, value) in &secret.headers {
        if name.eq_ignore_ascii_case("cookie") {
            cookie_parts.push(value.clone());
            continue;
        }
        merged.push(MergedHeader {
            name: name.clone(),
            value: value.clone(),
            secret: true,
        });
    }

    if let Some(decoded) = secret.decoded_cookie()? {
        cookie_parts.push(decoded);
    }
    if !cookie_parts.is_empty() {
        merged.push(MergedHeader {
            name: "Cookie".to_string(),
            value: cookie_parts.join("; "),
            secret: true,
        });
    }

    if let Some(auth) = &secret.authorisation_header {
        merged.push(MergedHeader {
            name: "Authorization".to_string(),
            value: auth.clone(),
            secret: true,
        });
    }

    // Pseudo-priority header, if present, is emitted last among its own kind.
    if let Some(pos) = merged.iter().position(|h| h.name.eq_ignore_ascii_case(PRIORITY_HEADER)) {
        let priority = merged.remove(pos);
        merged.push(priority);
    }

    Ok(merged)
}

fn compose_http11(
    method: &str,
    path_and_query: &str,
    headers: &[MergedHeader],
    body: Option<&str>,
    full_url: &str,
    url_hidden: &[Range<usize>],
    body_hidden: &[Range<usize>],
) -> Result<ComposedRequest> {
    let mut data = Vec::new();
    let mut redactions = Vec::new();

    let request_line = format!("{method} {path_and_query} HTTP/1.1\r\n");
    data.extend_from_slice(request_line.as_bytes());

    // The `path_and_query` is a suffix of `full_url`; compute the offset of
    // hidden URL ranges relative to the request line.
    if let Some(url_offset_in_full) = full_url.find(path_and_query) {
        let request_line_offset = method.len() + 1; // "<METHOD> "
        for hidden in url_hidden {
            let rebased_start = hidden.start.checked_sub(url_offset_in_full);
            if let Some(start) = rebased_start {
                let abs_start = request_line_offset + start;
                let abs_end = abs_start + (hidden.end - hidden.start);
                redactions.push(abs_start..abs_end);
            }
        }
    }

    let public_headers: Vec<&MergedHeader> = headers.iter().filter(|h| !h.secret).collect();
    let secret_headers: Vec<&MergedHeader> = headers.iter().filter(|h| h.secret).collect();

    for h in &public_headers {
        data.extend_from_slice(format!("{}: {}\r\n", h.name, h.value).as_bytes());
    }

    let secret_start = data.len();
    for h in &secret_headers {
        data.extend_from_slice(format!("{}: {}\r\n", h.name, h.value).as_bytes());
    }
    let secret_end = data.len();
    let secret_header_range = if secret_end > secret_start {
        let range = secret_start..secret_end;
        redactions.push(range.clone());
        Some(range)
    } else {
        None
    };

    data.extend_from_slice(b"\r\n");

    let body_start = data.len();
    if let Some(body) = body {
        data.extend_from_slice(body.as_bytes());
        for hidden in body_hidden {
            redactions.push((body_start + hidden.start)..(body_start + hidden.end));
        }
    }

    Ok(ComposedRequest {
        data,
        redactions: merge_ranges(&redactions),
        secret_header_range,
    })
}

fn compose_h2(
    method: &str,
    path: &str,
    authority: &str,
    headers: &[MergedHeader],
    body: Option<&str>,
    body_hidden: &[Range<usize>],
) -> Result<ComposedRequest> {
    // A simplified HTTP/2 HEADERS-frame-shaped payload: pseudo-headers first
    // (un-indexed literal representation: 0x00 length-prefixed name/value
    // pairs), then literal headers in the same public/secret order as the
    // HTTP/1.1 path so the redaction ranges line up the same way.
    let mut data = Vec::new();
    let mut redactions = Vec::new();

    let push_literal = |data: &mut Vec<u8>, name: &str, value: &str| {
        data.push(0x00); // literal header field without indexing
        data.push(name.len() as u8);
        data.extend_from_slice(name.as_bytes());
        data.push(value.len() as u8);
        data.extend_from_slice(value.as_bytes());
    };

    push_literal(&mut data, ":method", method);
    push_literal(&mut data, ":path", path);
    push_literal(&mut data, ":scheme", "https");
    push_literal(&mut data, ":authority", authority);

    for h in headers.iter().filter(|h| !h.secret) {
        push_literal(&mut data, &h.name.to_ascii_lowercase(), &h.value);
    }

    let secret_start = data.len();
    for h in headers.iter().filter(|h| h.secret) {
        push_literal(&mut data, &h.name.to_ascii_lowercase(), &h.value);
    }
    let secret_end = data.len();
    let secret_header_range = if secret_end > secret_start {
        let range = secret_start..secret_end;
        redactions.push(range.clone());
        Some(range)
    } else {
        None
    };

    let body_start = data.len();
    if let Some(body) = body {
        data.extend_from_slice(body.as_bytes());
        for hidden in body_hidden {
            redactions.push((body_start + hidden.start)..(body_start + hidden.end));
        }
    }

    Ok(ComposedRequest {
        data,
        redactions: merge_ranges(&redactions),
        secret_header_range,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::HttpProviderParams;

    fn base_params() -> HttpProviderParams {
        HttpProviderParams {
            url: "https://api.example.com/v1/data".into(),
            method: "GET".into(),
            body: None,
            headers: vec![("Accept".into(), "application/json".into())],
            geo_location: None,
            response_matches: vec![],
            response_redactions: vec![],
            param_values: HashMap::new(),
            write_redaction_mode: None,
            additional_client_options: None,
        }
    }

    #[test]
    fn rejects_missing_auth_material() {
        let params = base_params();
        let secret = SecretParams::default();
        let err = compose_request(&params, &secret, Alpn::Http11).unwrap_err().to_string();
        assert_eq!(err, "auth parameters not set");
    }

    #[test]
    fn secret_range_covers_exactly_the_secret_headers() {
        let params = base_params();
        use base64::Engine;
        let secret = SecretParams {
            cookie_str: Some(base64::engine::general_purpose::STANDARD.encode("JSESSIONID=abc; sid=xyz")),
            authorisation_header: Some("Bearer t0k3n".into()),
            ..Default::default()
        };

        let composed = compose_request(&params, &secret, Alpn::Http11).unwrap();
        let range = composed.secret_header_range.expect("secret range present");

        let text = String::from_utf8_lossy(&composed.data[range.clone()]);
        assert!(text.starts_with("Cookie: JSESSIONID=abc; sid=xyz\r\n"));
        assert!(text.trim_end_matches("\r\n").ends_with("Bearer t0k3n"));

        // no public header byte falls inside the redaction
        let accept_pos = composed
            .data
            .windows(6)
            .position(|w| w == b"Accept")
            .unwrap();
        assert!(!range.contains(&accept_pos));
    }

    #[test]
    fn secret_headers_contribute_one_contiguous_redaction() {
        let mut params = base_params();
        params.headers.push(("X-Public".into(), "v".into()));
        let secret = SecretParams {
            headers: vec![("X-Secret-One".into(), "a".into()), ("X-Secret-Two".into(), "b".into())],
            ..Default::default()
        };

        let composed = compose_request(&params, &secret, Alpn::Http11).unwrap();
        assert_eq!(composed.redactions.len(), 1);
    }

    #[test]
    fn drops_technical_headers() {
        let mut params = base_params();
        params.headers.push(("Host".into(), "evil.example.com".into()));
        params.headers.push(("Content-Length".into(), "999".into()));
        let secret = SecretParams {
            authorisation_header: Some("Bearer t".into()),
            ..Default::default()
        };

        let composed = compose_request(&params, &secret, Alpn::Http11).unwrap();
        let text = String::from_utf8_lossy(&composed.data);
        assert!(!text.contains("Host:"));
        assert!(!text.contains("Content-Length:"));
    }

    #[test]
    fn hidden_body_param_is_redacted() {
        let mut params = base_params();
        params.method = "POST".into();
        params.body = Some(r#"{"token":"{{secret_tok}}"}"#.into());
        let mut secret = SecretParams {
            authorisation_header: Some("Bearer t".into()),
            ..Default::default()
        };
        secret.param_values.insert("secret_tok".into(), "xyz123".into());

        let composed = compose_request(&params, &secret, Alpn::Http11).unwrap();
        let body_idx = composed
            .data
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap()
            + 4;
        let body = &composed.data[body_idx..];
        let tok_idx = body.windows(6).position(|w| w == b"xyz123").unwrap();
        let abs = body_idx + tok_idx;
        assert!(composed.redactions.iter().any(|r| r.start <= abs && abs < r.end));
    }
}
