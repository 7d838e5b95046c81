//! Declarative match-tree compiler.
//!
//! A match tree is a JSON value describing the shape an event must have for a
//! rule case to fire. Compilation produces a [`Pattern`] that answers two
//! questions about an event: does it conform (`matches`), and what values did
//! the tree extract (`bind`). Both are pure and total — a missing nested
//! field makes the predicate false, never a panic.
//!
//! Tree semantics:
//! - an object matches when every key matches recursively
//! - an array matches when the target is an array and each pattern element is
//!   matched by some target element (no positional correspondence)
//! - a string shaped `/…/flags` is a regex test; `(?<name>…)` captures become
//!   bindings, and mixing named with unnamed groups is a compile error
//! - any other string is strict equality
//! - a non-string scalar is strict identity
//! - the sentinel string `"undefined"` requires the field to be absent

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};

use crate::errors::MatchError;

/// Sentinel requiring a field to be absent from the event.
const ABSENT_SENTINEL: &str = "undefined";

/// Compiled match tree node.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Conjunction over named fields
    Object(Vec<(String, Pattern)>),
    /// Existence quantifier over array elements
    Array(Vec<Pattern>),
    /// Regex test over a string target
    Regex {
        regex: Regex,
        /// Named capture groups, in definition order
        named: Vec<String>,
    },
    /// Strict string equality
    Literal(String),
    /// Strict identity for non-string scalars
    Scalar(Value),
    /// Field must be missing
    Absent,
}

impl Pattern {
    /// Compile a JSON match tree.
    pub fn compile(tree: &Value) -> Result<Self, MatchError> {
        match tree {
            Value::Object(fields) => {
                let mut compiled = Vec::with_capacity(fields.len());
                for (key, child) in fields {
                    compiled.push((key.clone(), Self::compile(child)?));
                }
                Ok(Pattern::Object(compiled))
            }
            Value::Array(elements) => {
                let compiled = elements
                    .iter()
                    .map(Self::compile)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Pattern::Array(compiled))
            }
            Value::String(s) if s == ABSENT_SENTINEL => Ok(Pattern::Absent),
            Value::String(s) => match parse_regex_notation(s) {
                Some((body, flags)) => compile_regex(body, flags),
                None => Ok(Pattern::Literal(s.clone())),
            },
            Value::Null | Value::Bool(_) | Value::Number(_) => {
                Ok(Pattern::Scalar(tree.clone()))
            }
        }
    }

    /// True iff the target conforms to this pattern. `None` means the field
    /// is absent from the event.
    pub fn matches(&self, target: Option<&Value>) -> bool {
        match self {
            Pattern::Absent => target.is_none(),
            _ => {
                let Some(value) = target else {
                    return false;
                };
                match self {
                    Pattern::Object(fields) => match value.as_object() {
                        Some(obj) => fields
                            .iter()
                            .all(|(key, pattern)| pattern.matches(obj.get(key))),
                        None => false,
                    },
                    Pattern::Array(patterns) => match value.as_array() {
                        Some(items) => patterns
                            .iter()
                            .all(|p| items.iter().any(|item| p.matches(Some(item)))),
                        None => false,
                    },
                    Pattern::Regex { regex, .. } => {
                        value.as_str().is_some_and(|s| regex.is_match(s))
                    }
                    Pattern::Literal(expected) => value.as_str() == Some(expected),
                    Pattern::Scalar(expected) => value == expected,
                    Pattern::Absent => unreachable!(),
                }
            }
        }
    }

    /// Extract bindings from a conforming target. Returns `Some` exactly when
    /// [`Pattern::matches`] returns true; the binding tree mirrors the match
    /// tree, with regex nodes replaced by their captures.
    pub fn bind(&self, target: Option<&Value>) -> Option<Value> {
        match self {
            Pattern::Absent => target.is_none().then_some(Value::Null),
            _ => {
                let value = target?;
                match self {
                    Pattern::Object(fields) => {
                        let obj = value.as_object()?;
                        let mut bound = Map::new();
                        for (key, pattern) in fields {
                            let child = pattern.bind(obj.get(key))?;
                            // Absence checks contribute no binding
                            if !matches!(pattern, Pattern::Absent) {
                                bound.insert(key.clone(), child);
                            }
                        }
                        Some(Value::Object(bound))
                    }
                    Pattern::Array(patterns) => {
                        let items = value.as_array()?;
                        let mut bound = Vec::with_capacity(patterns.len());
                        for pattern in patterns {
                            let hit = items
                                .iter()
                                .find_map(|item| pattern.bind(Some(item)))?;
                            bound.push(hit);
                        }
                        Some(Value::Array(bound))
                    }
                    Pattern::Regex { regex, named } => {
                        let s = value.as_str()?;
                        let caps = regex.captures(s)?;
                        if named.is_empty() {
                            return Some(Value::String(s.to_string()));
                        }
                        let mut bound = Map::new();
                        for name in named {
                            if let Some(group) = caps.name(name) {
                                bound.insert(
                                    name.clone(),
                                    Value::String(group.as_str().to_string()),
                                );
                            }
                        }
                        Some(Value::Object(bound))
                    }
                    Pattern::Literal(expected) => (value.as_str() == Some(expected))
                        .then(|| Value::String(expected.clone())),
                    Pattern::Scalar(expected) => (value == expected).then(|| expected.clone()),
                    Pattern::Absent => unreachable!(),
                }
            }
        }
    }
}

/// Split a `/body/flags` string into its parts. Returns `None` when the
/// string is not regex notation, including when the trailing segment holds
/// characters that are not regex flags (URI-shaped strings like
/// `/sample/uri` stay literals).
fn parse_regex_notation(s: &str) -> Option<(&str, &str)> {
    let rest = s.strip_prefix('/')?;
    let close = rest.rfind('/')?;
    let (body, flags) = (&rest[..close], &rest[close + 1..]);
    if flags.chars().all(|c| matches!(c, 'i' | 'm' | 's' | 'x' | 'u' | 'g' | 'y')) {
        Some((body, flags))
    } else {
        None
    }
}

fn compile_regex(body: &str, flags: &str) -> Result<Pattern, MatchError> {
    let mut builder = RegexBuilder::new(body);
    // `u`, `g` and `y` have no Rust counterpart worth carrying: matching is
    // always unicode, and the engine only ever tests once per value.
    builder
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .ignore_whitespace(flags.contains('x'));
    let regex = builder.build().map_err(|e| MatchError::InvalidRegex {
        pattern: body.to_string(),
        details: e.to_string(),
    })?;

    let named: Vec<String> = regex
        .capture_names()
        .flatten()
        .map(str::to_string)
        .collect();
    let unnamed = regex.captures_len() - 1 - named.len();
    if !named.is_empty() && unnamed > 0 {
        return Err(MatchError::MixedCaptureGroups {
            pattern: body.to_string(),
        });
    }
    Ok(Pattern::Regex { regex, named })
}
