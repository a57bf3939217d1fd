//! URL matcher (C10): base-URL-exact + weighted string-similarity scorer
//! used to match a live intercepted flow against a provider's configured
//! URL(s) (§4.C10).

use strsim::levenshtein;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub score: f64,
    pub base_exact_match: bool,
}

/// Default threshold (§4.C10 step 4): a candidate matches iff its base is
/// byte-equal to the live URL's base, or the weighted score clears this bar.
pub const DEFAULT_THRESHOLD: f64 = 0.8;

pub fn score(live_url: &str, candidate_url: &str) -> MatchResult {
    let (live_base, live_query) = split_base_query(live_url);
    let (cand_base, cand_query) = split_base_query(candidate_url);

    let base_exact_match = live_base == cand_base;

    let score = if base_exact_match {
        0.9 + 0.1 * similarity(live_query, cand_query)
    } else {
        0.6 * similarity(live_base, cand_base) + 0.4 * similarity(live_query, cand_query)
    };

    MatchResult { score, base_exact_match }
}

pub fn is_match(live_url: &str, candidate_url: &str, threshold: f64) -> bool {
    let result = score(live_url, candidate_url);
    result.base_exact_match || result.score >= threshold
}

fn split_base_query(url: &str) -> (&str, &str) {
    match url.split_once('?') {
        Some((base, query)) => (base, query),
        None => (url, ""),
    }
}

/// Mean of three normalized similarities: LCS ratio, Jaccard over character
/// multisets, and `1 - Levenshtein/maxLen`. Symmetric and `1.0` on equal
/// inputs by construction (each term is).
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let lcs = lcs_ratio(a, b);
    let jaccard = jaccard_multiset(a, b);
    let lev = levenshtein_similarity(a, b);
    (lcs + jaccard + lev) / 3.0
}

fn lcs_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return if a.is_empty() && b.is_empty() { 1.0 } else { 0.0 };
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb { prev[j] + 1 } else { prev[j + 1].max(curr[j]) };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let lcs_len = prev[b.len()];
    let max_len = a.len().max(b.len());
    lcs_len as f64 / max_len as f64
}

fn jaccard_multiset(a: &str, b: &str) -> f64 {
    use std::collections::HashMap;
    let mut counts_a: HashMap<char, i64> = HashMap::new();
    for c in a.chars() {
        *counts_a.entry(c).or_insert(0) += 1;
    }
    let mut counts_b: HashMap<char, i64> = HashMap::new();
    for c in b.chars() {
        *counts_b.entry(c).or_insert(0) += 1;
    }
    if counts_a.is_empty() && counts_b.is_empty() {
        return 1.0;
    }

    let mut intersection = 0i64;
    let mut union = 0i64;
    let mut all_chars: std::collections::HashSet<char> = counts_a.keys().copied().collect();
    all_chars.extend(counts_b.keys().copied());
    for c in all_chars {
        let na = *counts_a.get(&c).unwrap_or(&0);
        let nb = *counts_b.get(&c).unwrap_or(&0);
        intersection += na.min(nb);
        union += na.max(nb);
    }
    if union == 0 {
        1.0
    } else {
        intersection as f64 / union as f64
    }
}

fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}
