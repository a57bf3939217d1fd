//! Provider parameter types (the `Provider::Http` data model).
//!
//! Modeled as a tagged variant per the Design Notes: today only `Http`
//! exists, but the enum leaves room for future provider kinds without
//! changing callers that match on it exhaustively today -- the "room" is the
//! enum shape itself, not a speculative extra variant.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A declarative description of one API endpoint a provider rule targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Provider {
    Http(HttpProviderParams),
}

/// Public request parameters -- safe to log, hash into `claim.parameters`,
/// and send to the attestor as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProviderParams {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub geo_location: Option<String>,
    #[serde(default)]
    pub response_matches: Vec<ResponseMatch>,
    #[serde(default)]
    pub response_redactions: Vec<ResponseRedaction>,
    #[serde(default)]
    pub param_values: HashMap<String, String>,
    #[serde(default)]
    pub write_redaction_mode: Option<WriteRedactionMode>,
    #[serde(default)]
    pub additional_client_options: Option<serde_json::Value>,
}

impl HttpProviderParams {
    /// Validate and normalize the params, deduplicating `response_matches`
    /// (resolving the "duplicated rule" Open Question: dedupe + warn, treat
    /// the remainder as an AND of distinct assertions).
    pub fn validate(&mut self) -> Result<()> {
        if self.method.trim().is_empty() {
            bail!("provider parameters missing method");
        }
        if self.url.trim().is_empty() {
            bail!("provider parameters missing url");
        }

        let before = self.response_matches.len();
        let mut seen = std::collections::HashSet::new();
        self.response_matches.retain(|m| {
            let key = (m.kind, m.value.clone(), m.invert);
            seen.insert(key)
        });
        if self.response_matches.len() != before {
            warn!(
                dropped = before - self.response_matches.len(),
                "deduplicated identical responseMatches entries"
            );
        }

        for redaction in &self.response_redactions {
            redaction.validate()?;
        }

        Ok(())
    }
}

/// Secret request parameters -- must never appear in a log record, error
/// message, or claim field unredacted.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct SecretParams {
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub cookie_str: Option<String>,
    #[serde(default)]
    pub authorisation_header: Option<String>,
    #[serde(default)]
    pub param_values: HashMap<String, String>,
}

impl std::fmt::Debug for SecretParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretParams")
            .field("headers", &self.headers.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("cookie_str", &self.cookie_str.as_ref().map(|_| "<redacted>"))
            .field(
                "authorisation_header",
                &self.authorisation_header.as_ref().map(|_| "<redacted>"),
            )
            .field("param_values", &self.param_values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretParams {
    /// Decode `cookie_str` (base64) to the literal `Cookie` header value, if present.
    pub fn decoded_cookie(&self) -> Result<Option<String>> {
        let Some(raw) = &self.cookie_str else {
            return Ok(None);
        };
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(raw.trim())
            .context("secretParams.cookieStr is not valid base64")?;
        Ok(Some(
            String::from_utf8(decoded).context("decoded cookieStr is not valid UTF-8")?,
        ))
    }

    /// Per the composer's auth-parameters invariant: at least one of cookie,
    /// authorization, or secret headers must be present.
    pub fn has_auth_material(&self) -> bool {
        self.cookie_str.is_some() || self.authorisation_header.is_some() || !self.headers.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Regex,
    Contains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMatch {
    #[serde(rename = "type")]
    pub kind: MatchType,
    pub value: String,
    #[serde(default)]
    pub invert: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgo {
    Oprf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseRedaction {
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub json_path: Option<String>,
    #[serde(default)]
    pub x_path: Option<String>,
    #[serde(default)]
    pub hash: Option<HashAlgo>,
}

impl ResponseRedaction {
    fn validate(&self) -> Result<()> {
        if self.hash.is_some() {
            let pattern = self
                .regex
                .as_ref()
                .context("a hashed redaction requires a regex with exactly one named capture group")?;
            let re = regex::Regex::new(pattern).context("invalid regex in hashed redaction")?;
            if re.capture_names().flatten().count() != 1 {
                bail!("hashed redaction regex must have exactly one named capture group");
            }
        }
        Ok(())
    }
}

/// Placeholder substitution (`{{name}}`) resolved against public params first,
/// then secret params. Returns the resolved string plus the byte ranges (in
/// the resolved string) that came from a *secret* value and must be redacted.
pub fn substitute_placeholders(
    template: &str,
    public_values: &HashMap<String, String>,
    secret_values: &HashMap<String, String>,
) -> Result<(String, Vec<std::ops::Range<usize>>)> {
    let mut result = String::with_capacity(template.len());
    let mut hidden_ranges = Vec::new();
    let bytes = template.as_bytes();
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            let Some(close_rel) = template[i..].find("}}") else {
                result.push_str(&template[i..]);
                break;
            };
            let close = i + close_rel;
            let name = template[i + 2..close].trim();

            if let Some(value) = public_values.get(name) {
                result.push_str(value);
            } else if let Some(value) = secret_values.get(name) {
                let start = result.len();
                result.push_str(value);
                hidden_ranges.push(start..result.len());
            } else {
                bail!("parameter \"{name}\" not found");
            }

            i = close + 2;
        } else {
            // Advance by one UTF-8 scalar at a time.
            let ch_len = template[i..].chars().next().map(char::len_utf8).unwrap_or(1);
            result.push_str(&template[i..i + ch_len]);
            i += ch_len;
        }
    }

    Ok((result, hidden_ranges))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn substitutes_public_before_secret() {
        let public = map(&[("id", "42")]);
        let secret = map(&[("token", "sekrit")]);
        let (resolved, hidden) =
            substitute_placeholders("id={{id}}&auth={{token}}", &public, &secret).unwrap();
        assert_eq!(resolved, "id=42&auth=sekrit");
        assert_eq!(hidden, vec![8..14]);
    }

    #[test]
    fn missing_placeholder_errors() {
        let err = substitute_placeholders("{{missing}}", &HashMap::new(), &HashMap::new())
            .unwrap_err()
            .to_string();
        assert!(err.contains("parameter \"missing\" not found"));
    }

    #[test]
    fn dedup_response_matches_warns_and_shrinks() {
        let mut params = HttpProviderParams {
            url: "https://example.com".into(),
            method: "GET".into(),
            body: None,
            headers: vec![],
            geo_location: None,
            response_matches: vec![
                ResponseMatch {
                    kind: MatchType::Regex,
                    value: "a".into(),
                    invert: false,
                },
                ResponseMatch {
                    kind: MatchType::Regex,
                    value: "a".into(),
                    invert: false,
                },
            ],
            response_redactions: vec![],
            param_values: HashMap::new(),
            write_redaction_mode: None,
            additional_client_options: None,
        };
        params.validate().unwrap();
        assert_eq!(params.response_matches.len(), 1);
    }

    #[test]
    fn secret_params_debug_never_prints_values() {
        let secret = SecretParams {
            headers: vec![("Authorization".into(), "Bearer xyz".into())],
            cookie_str: Some("abc".into()),
            authorisation_header: Some("Bearer xyz".into()),
            param_values: HashMap::new(),
        };
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("xyz"));
        assert!(!rendered.contains("abc"));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteRedactionMode {
    KeyUpdate,
    Zk,
}
