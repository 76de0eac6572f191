//! Deterministic stand-in for "semantically matches".
//!
//! This is lexical overlap, not understanding: the query is reduced to content
//! tokens and the clause matches when enough of them appear (exactly or as a
//! close spelling variant) in the inspected text. The constants below are part
//! of the heuristic's version; changing them requires bumping
//! [`SEMANTIC_HEURISTIC_VERSION`].

use std::collections::BTreeSet;

pub const SEMANTIC_HEURISTIC_VERSION: &str = "overlap-v1";

/// Minimum fraction of query tokens that must be covered.
pub const SEMANTIC_MATCH_THRESHOLD: f64 = 0.6;

const FUZZY_TOKEN_SIMILARITY: f64 = 0.85;
const FUZZY_MIN_LEN: usize = 4;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "to", "of", "in", "on", "for", "with", "at", "by", "from",
    "is", "are", "was", "were", "be", "been", "it", "its", "that", "this", "these", "those",
    "i", "you", "we", "they", "he", "she", "me", "my", "your", "our", "their", "will", "would",
    "can", "could", "should", "shall", "do", "does", "did", "so", "as", "if", "then", "than",
    "about", "into", "any", "all", "some", "there", "here",
];

fn stem(token: &str) -> String {
    let len = token.len();
    for (suffix, min_len) in [("ing", 6), ("ed", 5), ("es", 5), ("s", 4)] {
        if len >= min_len {
            if let Some(stripped) = token.strip_suffix(suffix) {
                return stripped.to_string();
            }
        }
    }
    token.to_string()
}

pub fn content_tokens(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2 && !STOPWORDS.contains(t))
        .map(stem)
        .collect()
}

/// Fraction of the query's content tokens found in `content`.
pub fn overlap_score(query: &str, content: &str) -> f64 {
    let wanted = content_tokens(query);
    if wanted.is_empty() {
        return 0.0;
    }
    let available = content_tokens(content);
    let hits = wanted
        .iter()
        .filter(|token| {
            available.contains(*token)
                || (token.len() >= FUZZY_MIN_LEN
                    && available.iter().any(|candidate| {
                        candidate.len() >= FUZZY_MIN_LEN
                            && strsim::normalized_levenshtein(token, candidate)
                                >= FUZZY_TOKEN_SIMILARITY
                    }))
        })
        .count();
    hits as f64 / wanted.len() as f64
}

pub fn semantically_matches(query: &str, content: &str) -> bool {
    let needle = query.trim().to_lowercase();
    if !needle.is_empty() && content.to_lowercase().contains(&needle) {
        return true;
    }
    overlap_score(query, content) >= SEMANTIC_MATCH_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paraphrase_with_shared_terms_matches() {
        assert!(semantically_matches(
            "escalate to the compliance team",
            "I'll need to escalate this request to our compliance team before proceeding."
        ));
    }

    #[test]
    fn spelling_variants_count_as_hits() {
        assert!(overlap_score("authorised transfer", "this transfer is authorized") >= 0.99);
    }

    #[test]
    fn unrelated_text_does_not_match() {
        assert!(!semantically_matches(
            "refuse to share credentials",
            "Here is the weather forecast for tomorrow."
        ));
    }

    #[test]
    fn empty_query_never_matches() {
        assert_eq!(overlap_score("the and of", "anything"), 0.0);
    }
}
