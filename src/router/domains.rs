//! Keyword-based domain detection
//!
//! Pure functions over the query text: domain relevance scores, risk-domain
//! scanning and the intent/complexity labels written to the decision log.
//! Matching is case-insensitive and respects word boundaries, so "key" does
//! not match inside "keyboard".

use super::{Complexity, DomainScore, round1};
use crate::config::{DomainConfig, RiskDomainConfig};

/// Points per distinct keyword matched
const UNIQUE_MATCH_POINTS: f64 = 25.0;
/// Points per unit of keyword density (matches / words)
const DENSITY_POINTS: f64 = 50.0;

/// Count word-bounded occurrences of `needle` in `haystack`
///
/// Both arguments must already be lowercase.
pub fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let bytes = haystack.as_bytes();
    let mut count = 0;
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let begin = start + pos;
        let end = begin + needle.len();
        let before_ok = begin == 0 || !is_word_byte(bytes[begin - 1]);
        let after_ok = end == bytes.len() || !is_word_byte(bytes[end]);
        if before_ok && after_ok {
            count += 1;
            start = end;
        } else {
            start = begin
                + haystack[begin..]
                    .chars()
                    .next()
                    .map_or(1, char::len_utf8);
        }
        if start >= haystack.len() {
            break;
        }
    }
    count
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

/// Number of whitespace-separated words, at least 1
pub fn word_count(query: &str) -> usize {
    query.split_whitespace().count().max(1)
}

/// First keyword from `keywords` present in `query`
pub fn first_match<'a>(query: &str, keywords: &'a [String]) -> Option<&'a str> {
    let lower = query.to_lowercase();
    keywords
        .iter()
        .find(|k| count_occurrences(&lower, &k.to_lowercase()) > 0)
        .map(String::as_str)
}

/// Score every configured domain and keep the `max` most relevant
///
/// score = min(100, unique_matches * 25 + density * 50), where density is
/// total matches divided by word count. Domains without a match are
/// dropped. Ties keep configuration order.
pub fn detect_domains(query: &str, domains: &[DomainConfig], max: usize) -> Vec<DomainScore> {
    let lower = query.to_lowercase();
    let words = word_count(query) as f64;

    let mut scores: Vec<DomainScore> = domains
        .iter()
        .filter_map(|domain| {
            let mut matched = Vec::new();
            let mut total = 0usize;
            for keyword in &domain.keywords {
                let hits = count_occurrences(&lower, &keyword.to_lowercase());
                if hits > 0 && !matched.contains(keyword) {
                    matched.push(keyword.clone());
                    total += hits;
                }
            }
            if matched.is_empty() {
                return None;
            }
            let density = total as f64 / words;
            let score =
                (matched.len() as f64 * UNIQUE_MATCH_POINTS + density * DENSITY_POINTS).min(100.0);
            Some(DomainScore {
                domain: domain.name.clone(),
                score: round1(score),
                matched_keywords: matched,
            })
        })
        .collect();

    scores.sort_by(|a, b| b.score.total_cmp(&a.score));
    scores.truncate(max);
    scores
}

/// A risk domain triggered by the query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskMatch<'a> {
    pub domain: &'a RiskDomainConfig,
    pub keyword: &'a str,
}

impl RiskMatch<'_> {
    /// Human-readable override reason
    pub fn reason(&self) -> String {
        match &self.domain.reason {
            Some(reason) => format!("{} (matched '{}')", reason, self.keyword),
            None => format!(
                "{} risk domain detected (matched '{}')",
                self.domain.name, self.keyword
            ),
        }
    }
}

/// First risk domain, in configuration order, with a keyword in the query
pub fn detect_risk<'a>(query: &str, risk_domains: &'a [RiskDomainConfig]) -> Option<RiskMatch<'a>> {
    risk_domains.iter().find_map(|domain| {
        first_match(query, &domain.keywords).map(|keyword| RiskMatch { domain, keyword })
    })
}

/// Intent label: the most relevant domain, or "general"
pub fn classify_intent(domains: &[DomainScore]) -> String {
    domains
        .first()
        .map(|d| d.domain.clone())
        .unwrap_or_else(|| "general".to_string())
}

/// Coarse complexity from query length, domain spread and context size
pub fn classify_complexity(query: &str, domains: &[DomainScore], context_tokens: u64) -> Complexity {
    let words = word_count(query);
    if context_tokens > 100_000 || domains.len() >= 3 || words > 150 {
        Complexity::Complex
    } else if words <= 20 && domains.len() <= 1 && context_tokens < 10_000 {
        Complexity::Simple
    } else {
        Complexity::Moderate
    }
}
