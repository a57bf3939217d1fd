//! Provider configuration registry (§6 "Proxy addon interface"): the
//! declarative, file-loaded description of each provider rule the
//! dispatcher matches live flows against.

use std::collections::HashMap;

use anyhow::{Context, Result};
use http_provider::{HttpProviderParams, ResponseMatch, ResponseRedaction};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRule {
    pub id: String,
    /// Domains this rule targets; entries may use a single leading `*.`
    /// wildcard (`*.example.com`).
    pub domains: Vec<String>,
    /// Regex matched against the request path (not the full URL).
    pub path_regex: String,
    pub methods: Vec<String>,
    /// One or more example URLs used by C10 as match candidates (tolerant
    /// of volatile query parameters per §6).
    pub urls: Vec<String>,
    #[serde(default)]
    pub response_matches: Vec<ResponseMatch>,
    #[serde(default)]
    pub response_redactions: Vec<ResponseRedaction>,
    #[serde(default)]
    pub geo_location: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub verification_type: VerificationType,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationType {
    #[default]
    Http,
}

impl ProviderRule {
    pub fn matches_domain(&self, host: &str) -> bool {
        self.domains.iter().any(|pattern| domain_matches(pattern, host))
    }

    pub fn matches_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    pub fn matches_path(&self, path: &str) -> Result<bool> {
        let re = regex::Regex::new(&self.path_regex).context("invalid path_regex in provider rule")?;
        Ok(re.is_match(path))
    }

    /// Build the public-side provider parameters this rule would send to
    /// the attestor for a concrete request URL/method/body.
    pub fn to_params(&self, url: String, method: String, body: Option<String>, public_headers: Vec<(String, String)>) -> HttpProviderParams {
        HttpProviderParams {
            url,
            method,
            body,
            headers: public_headers,
            geo_location: self.geo_location.clone(),
            response_matches: self.response_matches.clone(),
            response_redactions: self.response_redactions.clone(),
            param_values: HashMap::new(),
            write_redaction_mode: None,
            additional_client_options: None,
        }
    }
}

fn domain_matches(pattern: &str, host: &str) -> bool {
    let host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
    match pattern.strip_prefix("*.") {
        Some(suffix) => host == suffix || host.ends_with(&format!(".{suffix}")),
        None => pattern == host,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderRegistry {
    rules: Vec<ProviderRule>,
}

impl ProviderRegistry {
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).with_context(|| format!("reading {}", path.as_ref().display()))?;
        let registry: ProviderRegistry = serde_json::from_str(&text).context("parsing provider registry JSON")?;
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<&ProviderRule> {
        self.rules.iter().find(|r| r.id == id && r.enabled)
    }

    pub fn enabled_rules(&self) -> impl Iterator<Item = &ProviderRule> {
        self.rules.iter().filter(|r| r.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_domain_matches_subdomains_only() {
        let rule = ProviderRule {
            id: "p1".into(),
            domains: vec!["*.example.com".into()],
            path_regex: ".*".into(),
            methods: vec!["GET".into()],
            urls: vec![],
            response_matches: vec![],
            response_redactions: vec![],
            geo_location: None,
            enabled: true,
            priority: 0,
            verification_type: VerificationType::Http,
        };
        assert!(rule.matches_domain("api.example.com"));
        assert!(rule.matches_domain("example.com"));
        assert!(!rule.matches_domain("example.org"));
    }

    #[test]
    fn method_match_is_case_insensitive() {
        let rule = ProviderRule {
            id: "p1".into(),
            domains: vec![],
            path_regex: ".*".into(),
            methods: vec!["get".into()],
            urls: vec![],
            response_matches: vec![],
            response_redactions: vec![],
            geo_location: None,
            enabled: true,
            priority: 0,
            verification_type: VerificationType::Http,
        };
        assert!(rule.matches_method("GET"));
    }
}
