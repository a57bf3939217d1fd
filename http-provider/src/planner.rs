//! Response redaction/reveal planner (C6).
//!
//! Turns a provider's `response_matches`/`response_redactions` rules plus a
//! parsed response into a reveal set: the status line, the header/body
//! separator, the `Date` header, and whatever the redaction rules select.
//! The complement of that set over the response buffer is what actually
//! gets redacted before the transcript reaches the attestor.

use std::ops::Range;

use anyhow::{Context, Result};

use crate::bytes::{complement, merge_ranges};
use crate::params::{HashAlgo, HttpProviderParams, MatchType, ResponseRedaction};
use crate::parser::ParsedResponse;

/// A reveal-set range whose content must be replaced with an OPRF nullifier
/// rather than disclosed verbatim (§4.C6 "hash = oprf").
#[derive(Debug, Clone)]
pub struct PlannedHashRange {
    pub range: Range<usize>,
    pub hash: HashAlgo,
}

#[derive(Debug, Clone, Default)]
pub struct RedactionPlan {
    /// Byte ranges (over the full response buffer), merged and sorted, that
    /// are safe to reveal to the attestor as-is.
    pub reveal_ranges: Vec<Range<usize>>,
    /// Sub-ranges of the reveal set whose content must be substituted with
    /// an OPRF nullifier instead of being disclosed raw.
    pub hash_ranges: Vec<PlannedHashRange>,
}

impl RedactionPlan {
    /// The ranges that must actually be redacted: the complement of the
    /// reveal set over the response buffer (§4.C6 "emit their complement...
    /// as actual redactions").
    pub fn redaction_ranges(&self, total_len: usize) -> Vec<Range<usize>> {
        complement(&self.reveal_ranges, total_len)
    }
}

/// Build the redaction plan for a parsed response, given the provider's
/// declared `response_redactions` rules.
///
/// `response_bytes` is the full response buffer `parsed` was derived from.
pub fn plan_redactions(
    response_bytes: &[u8],
    parsed: &ParsedResponse,
    params: &HttpProviderParams,
) -> Result<RedactionPlan> {
    // Mandatory always-reveal ranges (§4.C6): the status line, the blank
    // line separating headers from body, and the Date header if present.
    let mut reveal_ranges = vec![
        0..parsed.status_line_end_index,
        parsed.header_end_idx..(parsed.header_end_idx + 4),
    ];
    if let Some(date_header) = parsed.header("date") {
        reveal_ranges.push(date_header.range.start..(date_header.range.end + 2));
    }

    // Redaction rules match against the logical body -- chunk-encoding
    // framing reassembled away -- since that's the only form a jsonPath or
    // a pattern meant to span chunk data can meaningfully match against.
    let (body, origins) = reassembled_body(response_bytes, parsed);
    let mut hash_ranges = Vec::new();

    for rule in &params.response_redactions {
        let (ranges, hash_subranges) = resolve_rule(&body, rule)?;
        for range in ranges {
            reveal_ranges.extend(map_to_absolute(&origins, range));
        }
        for range in hash_subranges {
            let abs = map_to_absolute(&origins, range);
            if abs.len() != 1 {
                anyhow::bail!("hash redaction spans a chunk boundary");
            }
            let hash = rule.hash.context("hash sub-range produced without a hash algorithm set")?;
            hash_ranges.push(PlannedHashRange { range: abs.into_iter().next().unwrap(), hash });
        }
    }

    Ok(RedactionPlan {
        reveal_ranges: merge_ranges(&reveal_ranges),
        hash_ranges,
    })
}

/// The body with HTTP chunk framing removed, alongside `origins`: for each
/// byte of the returned buffer, its absolute position in `response_bytes`.
/// Non-chunked responses reassemble to themselves (identity mapping).
fn reassembled_body(response_bytes: &[u8], parsed: &ParsedResponse) -> (Vec<u8>, Vec<usize>) {
    if parsed.chunks.is_empty() {
        let body = response_bytes[parsed.body_start_index..].to_vec();
        let origins = (parsed.body_start_index..response_bytes.len()).collect();
        return (body, origins);
    }
    let mut body = Vec::new();
    let mut origins = Vec::new();
    for chunk in &parsed.chunks {
        body.extend_from_slice(&response_bytes[chunk.clone()]);
        origins.extend(chunk.clone());
    }
    (body, origins)
}

/// Map a range over the reassembled body back to one or more absolute
/// ranges, splitting wherever the underlying bytes aren't contiguous in the
/// original buffer (i.e. the range crosses a chunk boundary).
fn map_to_absolute(origins: &[usize], logical: Range<usize>) -> Vec<Range<usize>> {
    if logical.start >= logical.end || logical.end > origins.len() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut seg_start = origins[logical.start];
    let mut seg_end = seg_start + 1;
    for &abs in &origins[logical.start + 1..logical.end] {
        if abs == seg_end {
            seg_end += 1;
        } else {
            out.push(seg_start..seg_end);
            seg_start = abs;
            seg_end = abs + 1;
        }
    }
    out.push(seg_start..seg_end);
    out
}

/// Resolve one `response_redactions` rule against the body, returning
/// `(reveal_ranges, hash_sub_ranges)`. `hash_sub_ranges` is only non-empty
/// for a regex rule with `hash` set, and is always a subset of the
/// corresponding reveal range.
fn resolve_rule(body: &[u8], rule: &ResponseRedaction) -> Result<(Vec<Range<usize>>, Vec<Range<usize>>)> {
    if let Some(pattern) = &rule.regex {
        return resolve_regex(body, pattern, rule.hash);
    }
    if let Some(path) = &rule.json_path {
        return Ok((resolve_json_path(body, path)?, Vec::new()));
    }
    if let Some(path) = &rule.x_path {
        return Ok((resolve_x_path(body, path)?, Vec::new()));
    }
    Ok((Vec::new(), Vec::new()))
}

fn resolve_regex(body: &[u8], pattern: &str, hash: Option<HashAlgo>) -> Result<(Vec<Range<usize>>, Vec<Range<usize>>)> {
    let text = std::str::from_utf8(body).context("response body is not valid UTF-8 for a regex redaction")?;
    let re = regex::Regex::new(pattern).context("invalid response redaction regex")?;

    let mut reveal = Vec::new();
    let mut hash_ranges = Vec::new();
    for caps in re.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        // The whole match is revealed raw; when a hash is requested, the
        // named group inside it is additionally marked for nullifier
        // substitution rather than literal disclosure.
        reveal.push(whole.start()..whole.end());
        if hash.is_some() {
            // `HttpProviderParams::validate` already rejects a hashed
            // redaction whose regex lacks exactly one named group.
            if let Some(name) = re.capture_names().flatten().next() {
                if let Some(m) = caps.name(name) {
                    hash_ranges.push(m.start()..m.end());
                }
            }
        }
    }
    Ok((reveal, hash_ranges))
}

fn resolve_json_path(body: &[u8], path: &str) -> Result<Vec<Range<usize>>> {
    let text = std::str::from_utf8(body).context("response body is not valid UTF-8 for a jsonPath redaction")?;
    let value: serde_json::Value = serde_json::from_str(text).context("response body is not valid JSON")?;

    let selected =
        jsonpath_lib::select(&value, path).map_err(|e| anyhow::anyhow!("invalid jsonPath \"{path}\": {e}"))?;

    // jsonpath_lib gives us matched values, not byte offsets; re-locate each
    // value's serialized form in the original text. This is exact for scalar
    // leaves (the common case for a redaction target) and best-effort for
    // duplicated literal values.
    let mut ranges = Vec::new();
    for v in selected {
        let rendered = match v {
            serde_json::Value::String(s) => format!("\"{s}\""),
            other => other.to_string(),
        };
        if let Some(pos) = text.find(&rendered) {
            ranges.push(pos..(pos + rendered.len()));
        }
    }
    Ok(ranges)
}

fn resolve_x_path(body: &[u8], path: &str) -> Result<Vec<Range<usize>>> {
    let text = std::str::from_utf8(body).context("response body is not valid UTF-8 for an xPath redaction")?;
    let doc = roxmltree::Document::parse(text).context("response body is not valid XML/HTML for an xPath redaction")?;

    // roxmltree has no xpath engine; support the subset of xpath this system
    // needs -- "//tag" and "//tag/@attr" -- by tag-name match, since it's the
    // one library in the corpus that preserves original-text byte offsets
    // per node (required to produce exact redaction ranges).
    let (tag, attr) = match path.trim_start_matches('/').split_once("/@") {
        Some((tag, attr)) => (tag, Some(attr)),
        None => (path.trim_start_matches('/'), None),
    };

    let mut ranges = Vec::new();
    for node in doc.descendants().filter(|n| n.has_tag_name(tag)) {
        if let Some(attr_name) = attr {
            if let Some(a) = node.attribute(attr_name) {
                if let Some(pos) = text.find(a) {
                    ranges.push(pos..(pos + a.len()));
                }
            }
        } else if let Some(text_node) = node.children().find(|c| c.is_text()) {
            ranges.push(text_node.range());
        }
    }
    Ok(ranges)
}

/// A reveal plan scoped to response matching: given `response_matches`,
/// evaluate whether the (revealed, i.e. non-redacted) body satisfies every
/// assertion.
pub fn matches_assertions(revealed_text: &str, params: &HttpProviderParams) -> Result<bool> {
    for m in &params.response_matches {
        let hit = match m.kind {
            MatchType::Contains => revealed_text.contains(&m.value),
            MatchType::Regex => {
                let re = regex::Regex::new(&m.value).context("invalid responseMatch regex")?;
                re.is_match(revealed_text)
            }
        };
        if hit == m.invert {
            return Ok(false);
        }
    }
    Ok(true)
}
