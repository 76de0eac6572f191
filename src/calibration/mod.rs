//! Confidence calibration for detection clauses.
//!
//! A clause starts from a static confidence derived from the shape of its
//! pattern, which is then blended with how the same pattern behaved in earlier
//! runs (see [`history`]).

pub mod history;

use crate::detection::clauses::{
    ASSISTANT_MESSAGE_COUNT, NAMED_PREDICATE, RESPONSE_SEMANTIC, TOOL_CALL, TOOL_CALL_COUNT,
    UNSUPPORTED,
};

pub use history::{
    PatternHistory, PatternHistoryEntry, PatternHistoryStore, PatternObservation,
};

const BASE: f64 = 0.92;
const MIN_BASE: f64 = 0.15;
const MAX_BASE: f64 = 0.99;

/// Total evaluations at which history fully replaces the static estimate.
const FULL_SUPPORT_EVALUATIONS: f64 = 30.0;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct PatternFeatures {
    wildcards: usize,
    alternations: usize,
    quantifiers: usize,
    anchors: usize,
    lookarounds: usize,
    char_classes: usize,
    metachars: usize,
}

fn scan(pattern: &str) -> PatternFeatures {
    let chars: Vec<char> = pattern.chars().collect();
    let mut f = PatternFeatures::default();
    let mut in_class = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            f.metachars += 1;
            match chars.get(i + 1) {
                Some('b') | Some('B') | Some('A') | Some('z') => f.anchors += 1,
                Some('d') | Some('D') | Some('w') | Some('W') | Some('s') | Some('S') => {
                    f.char_classes += 1
                }
                _ => {}
            }
            i += 2;
            continue;
        }
        if in_class {
            if c == ']' {
                in_class = false;
                f.metachars += 1;
            }
            i += 1;
            continue;
        }
        match c {
            '[' => {
                in_class = true;
                f.char_classes += 1;
                f.metachars += 1;
            }
            '.' => {
                f.metachars += 1;
                if matches!(chars.get(i + 1), Some('*') | Some('+')) {
                    f.wildcards += 1;
                }
            }
            '|' => {
                f.alternations += 1;
                f.metachars += 1;
            }
            '^' | '$' => {
                f.anchors += 1;
                f.metachars += 1;
            }
            '*' | '+' => {
                f.quantifiers += 1;
                f.metachars += 1;
            }
            '?' => {
                f.metachars += 1;
                if i > 0 && chars[i - 1] == '(' {
                    let rest: String = chars[i + 1..].iter().take(2).collect();
                    if rest.starts_with('=')
                        || rest.starts_with('!')
                        || rest == "<="
                        || rest == "<!"
                    {
                        f.lookarounds += 1;
                    }
                } else {
                    f.quantifiers += 1;
                }
            }
            '{' => {
                f.metachars += 1;
                if chars[i + 1..]
                    .iter()
                    .take_while(|c| **c != '}')
                    .all(|c| c.is_ascii_digit() || *c == ',')
                {
                    f.quantifiers += 1;
                }
            }
            '(' | ')' | '}' => f.metachars += 1,
            _ => {}
        }
        i += 1;
    }
    f
}

/// Alphanumeric runs of at least two characters once `\d`-style escapes are gone.
fn literal_tokens(pattern: &str) -> usize {
    let mut stripped = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some(n) if n.is_ascii_alphabetic() => {
                    chars.next();
                    stripped.push(' ');
                }
                _ => stripped.push(' '),
            }
        } else {
            stripped.push(c);
        }
    }
    stripped
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .count()
}

fn is_broad_class(pattern: &str) -> bool {
    let core = pattern.trim().trim_start_matches("(?i)");
    matches!(core, r"\w+" | "[a-z]+" | "[a-z0-9]+" | "[A-Za-z]+" | "[A-Za-z0-9]+")
}

/// Static confidence of a regex-shaped (or literal) pattern.
pub fn base_confidence(pattern: &str) -> f64 {
    let len = pattern.chars().count();
    let f = scan(pattern);
    let tokens = literal_tokens(pattern);
    let mut score = BASE;

    if len < 5 {
        score -= 0.12;
    } else if len > 220 {
        score -= 0.10;
    }

    score -= (0.09 * f.wildcards as f64).min(0.36);

    if f.alternations > 8 {
        score -= 0.06;
    }
    if f.alternations > 14 {
        score -= 0.08;
    }
    if f.quantifiers > 8 {
        score -= 0.05;
    }
    if f.quantifiers > 12 {
        score -= 0.07;
    }

    if tokens <= 1 {
        score -= 0.12;
    } else if tokens >= 3 {
        score += 0.03;
    }

    if f.anchors > 0 {
        score += 0.02;
    }
    if f.lookarounds > 2 {
        score -= 0.06;
    }
    if f.char_classes > 6 {
        score -= 0.05;
    }
    if len > 0 && f.metachars as f64 / len as f64 > 0.65 {
        score -= 0.10;
    }

    let trimmed = pattern.trim();
    if trimmed == ".*" || trimmed == ".+" {
        score = score.min(0.2);
    } else if is_broad_class(trimmed) {
        score = score.min(0.45);
    }

    score.clamp(MIN_BASE, MAX_BASE)
}

/// Static confidence by clause kind. Structural clauses read recorded facts and
/// are near-certain; text heuristics fall back to [`base_confidence`].
pub fn clause_base_confidence(clause_type: &str, pattern: &str) -> f64 {
    match clause_type {
        TOOL_CALL | TOOL_CALL_COUNT | ASSISTANT_MESSAGE_COUNT => 0.99,
        NAMED_PREDICATE => 0.8,
        RESPONSE_SEMANTIC => 0.6,
        UNSUPPORTED => 0.0,
        _ => base_confidence(pattern),
    }
}

/// Static confidence blended with recorded history, then penalised for the
/// number of unsupported clauses the current run touched.
pub fn blended_confidence(
    pattern: &str,
    clause_type: &str,
    entry: Option<&PatternHistoryEntry>,
    unsupported_this_run: usize,
) -> f64 {
    let base = clause_base_confidence(clause_type, pattern);
    let mut confidence = base;

    if let Some(entry) = entry.filter(|e| e.total_evaluations > 0) {
        let total = entry.total_evaluations as f64;
        let support = (total / FULL_SUPPORT_EVALUATIONS).clamp(0.0, 1.0);
        let quality = 0.65 * entry.accuracy + 0.35 * (1.0 - entry.false_positive_rate);
        confidence = (1.0 - support) * base + support * quality;

        let unsupported_rate = entry.unsupported_cooccurrences as f64 / total;
        confidence *= (1.0 - unsupported_rate * 0.5).max(0.45);

        if entry.match_count >= 5 && entry.false_positive_rate >= 0.5 {
            confidence = confidence.min(0.55);
        }
    }

    confidence -= (unsupported_this_run as f64 * 0.08).min(0.4);
    confidence.clamp(0.0, 1.0)
}
