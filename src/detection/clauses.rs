//! Atomic clause shapes.
//!
//! A [`ClauseShape`] recognises clause text and binds it into a [`BoundClause`]
//! that can be evaluated against an [`ArtifactView`]. The [`ClauseRegistry`]
//! tries shapes in registration order; text no shape accepts stays unbound and
//! evaluates as unsupported.

use std::{fmt, sync::Arc};

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use super::{predicates::NamedPredicate, semantic, view::ArtifactView};

pub const TOOL_CALL: &str = "tool_call";
pub const TOOL_CALL_COUNT: &str = "tool_call_count";
pub const RESPONSE_CONTAINS: &str = "response_contains";
pub const RESPONSE_NOT_CONTAINS: &str = "response_not_contains";
pub const RESPONSE_REGEX: &str = "response_regex";
pub const RESPONSE_SEMANTIC: &str = "response_semantic";
pub const RESPONSE_SEQUENCE: &str = "response_sequence";
pub const ASSISTANT_MESSAGE_COUNT: &str = "assistant_message_count";
pub const NAMED_PREDICATE: &str = "named_predicate";
pub const UNSUPPORTED: &str = "unsupported";

const QUOTED: &str = r#""((?:[^"\\]|\\.)*)""#;

static RE_TOOL_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^tool_call\s*==\s*"?([A-Za-z0-9_.:\-/]+)"?$"#).expect("tool_call shape")
});

static RE_TOOL_CALL_COUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)^tool_call_count\s*\(\s*"?([A-Za-z0-9_.:\-/]+)"?\s*\)\s*(>=|<=|==|>|<)\s*(\d+)$"#,
    )
    .expect("tool_call_count shape")
});

static RE_NOT_CONTAINS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^response\s+(?:not\s+contains|does\s+not\s+contain)\s+{QUOTED}$"
    ))
    .expect("not contains shape")
});

static RE_CONTAINS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)^response\s+contains\s+{QUOTED}$")).expect("contains shape")
});

static RE_MATCHES_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)^response\s+matches\s+regex\s+{QUOTED}$")).expect("regex shape")
});

static RE_SEMANTIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)^response\s+semantically\s+matches\s+{QUOTED}$"))
        .expect("semantic shape")
});

static RE_SEQUENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^response\s+sequence\s+regex\s+{QUOTED}\s+then\s+regex\s+{QUOTED}$"
    ))
    .expect("sequence shape")
});

static RE_MESSAGE_COUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^assistant_message_count\s*(>=|<=|==|>|<)\s*(\d+)$")
        .expect("message count shape")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClauseOutcome {
    pub matched: bool,
    pub applicable: bool,
}

impl ClauseOutcome {
    pub fn matched(matched: bool) -> Self {
        Self {
            matched,
            applicable: true,
        }
    }

    pub fn not_applicable() -> Self {
        Self {
            matched: false,
            applicable: false,
        }
    }
}

/// A recognised clause ready for evaluation.
pub trait BoundClause: fmt::Debug + Send + Sync {
    /// Stable kind name used as the calibration history namespace.
    fn clause_type(&self) -> &'static str;
    /// The pattern text calibration keys and scores.
    fn pattern(&self) -> &str;
    fn evaluate(&self, view: &ArtifactView<'_>) -> ClauseOutcome;
}

/// Recognises one family of clause text.
pub trait ClauseShape: Send + Sync {
    fn name(&self) -> &'static str;
    fn bind(&self, text: &str) -> Option<Arc<dyn BoundClause>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

impl Comparison {
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            ">" => Some(Comparison::Gt),
            ">=" => Some(Comparison::Ge),
            "<" => Some(Comparison::Lt),
            "<=" => Some(Comparison::Le),
            "==" => Some(Comparison::Eq),
            _ => None,
        }
    }

    pub fn apply(&self, left: usize, right: usize) -> bool {
        match self {
            Comparison::Gt => left > right,
            Comparison::Ge => left >= right,
            Comparison::Lt => left < right,
            Comparison::Le => left <= right,
            Comparison::Eq => left == right,
        }
    }
}

fn unescape(literal: &str) -> String {
    literal.replace("\\\"", "\"")
}

fn compile(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .ok()
}

/// Clauses the default registry understands.
#[derive(Debug)]
pub enum BuiltinClause {
    ToolCall {
        name: String,
    },
    ToolCallCount {
        name: String,
        op: Comparison,
        count: usize,
        pattern: String,
    },
    Contains {
        needle: String,
        negated: bool,
    },
    MatchesRegex {
        source: String,
        regex: Regex,
    },
    Semantic {
        query: String,
    },
    Sequence {
        pattern: String,
        first: Regex,
        second: Regex,
    },
    AssistantMessageCount {
        op: Comparison,
        count: usize,
        pattern: String,
    },
    Predicate(NamedPredicate),
}

impl BoundClause for BuiltinClause {
    fn clause_type(&self) -> &'static str {
        match self {
            BuiltinClause::ToolCall { .. } => TOOL_CALL,
            BuiltinClause::ToolCallCount { .. } => TOOL_CALL_COUNT,
            BuiltinClause::Contains { negated: false, .. } => RESPONSE_CONTAINS,
            BuiltinClause::Contains { negated: true, .. } => RESPONSE_NOT_CONTAINS,
            BuiltinClause::MatchesRegex { .. } => RESPONSE_REGEX,
            BuiltinClause::Semantic { .. } => RESPONSE_SEMANTIC,
            BuiltinClause::Sequence { .. } => RESPONSE_SEQUENCE,
            BuiltinClause::AssistantMessageCount { .. } => ASSISTANT_MESSAGE_COUNT,
            BuiltinClause::Predicate(_) => NAMED_PREDICATE,
        }
    }

    fn pattern(&self) -> &str {
        match self {
            BuiltinClause::ToolCall { name } => name,
            BuiltinClause::ToolCallCount { pattern, .. } => pattern,
            BuiltinClause::Contains { needle, .. } => needle,
            BuiltinClause::MatchesRegex { source, .. } => source,
            BuiltinClause::Semantic { query } => query,
            BuiltinClause::Sequence { pattern, .. } => pattern,
            BuiltinClause::AssistantMessageCount { pattern, .. } => pattern,
            BuiltinClause::Predicate(predicate) => predicate.label(),
        }
    }

    fn evaluate(&self, view: &ArtifactView<'_>) -> ClauseOutcome {
        match self {
            BuiltinClause::ToolCall { name } => {
                ClauseOutcome::matched(view.tool_calls().any(|call| &call.name == name))
            }
            BuiltinClause::ToolCallCount {
                name, op, count, ..
            } => {
                let seen = view.tool_calls().filter(|call| &call.name == name).count();
                ClauseOutcome::matched(op.apply(seen, *count))
            }
            BuiltinClause::Contains { needle, negated } => {
                let needle = needle.to_lowercase();
                let found = view
                    .responses()
                    .any(|entry| entry.content.to_lowercase().contains(&needle));
                ClauseOutcome::matched(found != *negated)
            }
            BuiltinClause::MatchesRegex { regex, .. } => {
                ClauseOutcome::matched(regex.is_match(&view.response_text()))
            }
            BuiltinClause::Semantic { query } => {
                let text = view.response_text();
                ClauseOutcome::matched(!text.is_empty() && semantic::semantically_matches(query, &text))
            }
            BuiltinClause::Sequence { first, second, .. } => {
                let text = view.response_text();
                let ordered = first
                    .find(&text)
                    .map_or(false, |m| second.find_at(&text, m.end()).is_some());
                ClauseOutcome::matched(ordered)
            }
            BuiltinClause::AssistantMessageCount { op, count, .. } => {
                let seen = view.responses().count();
                ClauseOutcome::matched(op.apply(seen, *count))
            }
            BuiltinClause::Predicate(predicate) => predicate.evaluate(view),
        }
    }
}

/// A shape backed by a plain recogniser function.
pub struct FnShape {
    name: &'static str,
    recognize: fn(&str) -> Option<BuiltinClause>,
}

impl FnShape {
    pub const fn new(name: &'static str, recognize: fn(&str) -> Option<BuiltinClause>) -> Self {
        Self { name, recognize }
    }
}

impl ClauseShape for FnShape {
    fn name(&self) -> &'static str {
        self.name
    }

    fn bind(&self, text: &str) -> Option<Arc<dyn BoundClause>> {
        (self.recognize)(text).map(|clause| Arc::new(clause) as Arc<dyn BoundClause>)
    }
}

fn recognize_tool_call(text: &str) -> Option<BuiltinClause> {
    let caps = RE_TOOL_CALL.captures(text)?;
    Some(BuiltinClause::ToolCall {
        name: caps[1].to_string(),
    })
}

fn recognize_tool_call_count(text: &str) -> Option<BuiltinClause> {
    let caps = RE_TOOL_CALL_COUNT.captures(text)?;
    let op = Comparison::parse(&caps[2])?;
    let count = caps[3].parse().ok()?;
    Some(BuiltinClause::ToolCallCount {
        name: caps[1].to_string(),
        op,
        count,
        pattern: format!("{}{}{}", &caps[1], &caps[2], count),
    })
}

fn recognize_not_contains(text: &str) -> Option<BuiltinClause> {
    let caps = RE_NOT_CONTAINS.captures(text)?;
    Some(BuiltinClause::Contains {
        needle: unescape(&caps[1]),
        negated: true,
    })
}

fn recognize_contains(text: &str) -> Option<BuiltinClause> {
    let caps = RE_CONTAINS.captures(text)?;
    Some(BuiltinClause::Contains {
        needle: unescape(&caps[1]),
        negated: false,
    })
}

fn recognize_regex(text: &str) -> Option<BuiltinClause> {
    let caps = RE_MATCHES_REGEX.captures(text)?;
    let source = unescape(&caps[1]);
    let regex = compile(&source)?;
    Some(BuiltinClause::MatchesRegex { source, regex })
}

fn recognize_semantic(text: &str) -> Option<BuiltinClause> {
    let caps = RE_SEMANTIC.captures(text)?;
    let query = unescape(&caps[1]);
    if semantic::content_tokens(&query).is_empty() {
        return None;
    }
    Some(BuiltinClause::Semantic { query })
}

fn recognize_sequence(text: &str) -> Option<BuiltinClause> {
    let caps = RE_SEQUENCE.captures(text)?;
    let (p1, p2) = (unescape(&caps[1]), unescape(&caps[2]));
    Some(BuiltinClause::Sequence {
        first: compile(&p1)?,
        second: compile(&p2)?,
        pattern: format!("{p1} then {p2}"),
    })
}

fn recognize_message_count(text: &str) -> Option<BuiltinClause> {
    let caps = RE_MESSAGE_COUNT.captures(text)?;
    let op = Comparison::parse(&caps[1])?;
    let count = caps[2].parse().ok()?;
    Some(BuiltinClause::AssistantMessageCount {
        op,
        count,
        pattern: format!("{}{}", &caps[1], count),
    })
}

fn recognize_predicate(text: &str) -> Option<BuiltinClause> {
    NamedPredicate::from_text(text).map(BuiltinClause::Predicate)
}

/// Ordered set of clause shapes. The first shape that binds wins.
pub struct ClauseRegistry {
    shapes: Vec<Arc<dyn ClauseShape>>,
}

impl Default for ClauseRegistry {
    fn default() -> Self {
        let builtin: [FnShape; 9] = [
            FnShape::new(TOOL_CALL, recognize_tool_call),
            FnShape::new(TOOL_CALL_COUNT, recognize_tool_call_count),
            FnShape::new(RESPONSE_NOT_CONTAINS, recognize_not_contains),
            FnShape::new(RESPONSE_CONTAINS, recognize_contains),
            FnShape::new(RESPONSE_REGEX, recognize_regex),
            FnShape::new(RESPONSE_SEMANTIC, recognize_semantic),
            FnShape::new(RESPONSE_SEQUENCE, recognize_sequence),
            FnShape::new(ASSISTANT_MESSAGE_COUNT, recognize_message_count),
            FnShape::new(NAMED_PREDICATE, recognize_predicate),
        ];
        Self {
            shapes: builtin
                .into_iter()
                .map(|shape| Arc::new(shape) as Arc<dyn ClauseShape>)
                .collect(),
        }
    }
}

impl ClauseRegistry {
    pub fn empty() -> Self {
        Self { shapes: Vec::new() }
    }

    /// Appends a shape after the built-ins.
    pub fn register(&mut self, shape: Arc<dyn ClauseShape>) {
        self.shapes.push(shape);
    }

    pub fn shape_names(&self) -> Vec<&'static str> {
        self.shapes.iter().map(|shape| shape.name()).collect()
    }

    pub fn bind(&self, text: &str) -> Option<Arc<dyn BoundClause>> {
        let text = text.trim();
        self.shapes.iter().find_map(|shape| shape.bind(text))
    }
}

impl fmt::Debug for ClauseRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClauseRegistry")
            .field("shapes", &self.shape_names())
            .finish()
    }
}
