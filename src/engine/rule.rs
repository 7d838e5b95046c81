//! Declarative propagation rules.
//!
//! A rule binds a bus topic to an ordered list of cases. Each case pairs an
//! optional match tree (and an optional `match_not` anti-pattern) with the
//! exec steps to run when the case fires. At most one case fires per event:
//! the first whose `match` holds and whose `match_not` does not.
//!
//! Rules are immutable after construction. Construction compiles every match
//! tree, classifier stanza and exec template up front, so an invalid rule is
//! fatal at start-up rather than a per-event surprise.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::constants::{
    DEFAULT_IGNORE, DEFAULT_RETRY_DELAY_MS, DEFAULT_RETRY_FACTOR, DEFAULT_RETRY_LIMIT,
    DEFAULT_RETRY_ON,
};
use crate::errors::RuleError;

use super::classifier::ResultClassifier;
use super::matcher::Pattern;
use super::template::RequestTemplate;

/// Serde model of one rule body in the rules document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleSpec {
    pub topic: Option<String>,
    pub retry_on: Option<Value>,
    pub ignore: Option<Value>,
    pub retry_delay: Option<u64>,
    pub retry_limit: Option<u32>,
    pub retry_factor: Option<f64>,
    pub decode_results: Option<bool>,
    pub cases: Option<Vec<CaseSpec>>,
    #[serde(rename = "match")]
    pub match_: Option<Value>,
    pub match_not: Option<Value>,
    pub exec: Option<Value>,
}

/// Serde model of one entry in a rule's `cases` array.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaseSpec {
    #[serde(rename = "match")]
    pub match_: Option<Value>,
    pub match_not: Option<Value>,
    pub exec: Option<Value>,
}

/// One exec step of a case.
#[derive(Debug, Clone)]
pub enum ExecStep {
    /// Dispatch an HTTP request
    Http(RequestTemplate),
    /// Produce a derived event onto a bus topic
    Produce {
        /// Target topic, possibly templated
        topic: Value,
        /// Message template; absent means the source event is forwarded
        message: Option<Value>,
    },
}

/// A compiled rule case.
#[derive(Debug, Clone)]
pub struct RuleCase {
    matcher: Option<Pattern>,
    anti_matcher: Option<Pattern>,
    exec: Vec<ExecStep>,
}

impl RuleCase {
    fn compile(spec: &CaseSpec, rule_name: &str, default_timeout: Duration) -> Result<Self, RuleError> {
        let compile_tree = |tree: &Option<Value>| -> Result<Option<Pattern>, RuleError> {
            tree.as_ref()
                .map(Pattern::compile)
                .transpose()
                .map_err(|source| RuleError::InvalidMatch {
                    rule_name: rule_name.to_string(),
                    source,
                })
        };

        let exec = match &spec.exec {
            None => Vec::new(),
            Some(Value::Array(entries)) => entries
                .iter()
                .map(|entry| compile_exec_step(entry, rule_name, default_timeout))
                .collect::<Result<Vec<_>, _>>()?,
            Some(single) => vec![compile_exec_step(single, rule_name, default_timeout)?],
        };

        Ok(Self {
            matcher: compile_tree(&spec.match_)?,
            anti_matcher: compile_tree(&spec.match_not)?,
            exec,
        })
    }

    fn fires(&self, event: &Value) -> bool {
        let matched = self
            .matcher
            .as_ref()
            .is_none_or(|m| m.matches(Some(event)));
        if !matched {
            return false;
        }
        !self
            .anti_matcher
            .as_ref()
            .is_some_and(|m| m.matches(Some(event)))
    }
}

fn compile_exec_step(
    entry: &Value,
    rule_name: &str,
    default_timeout: Duration,
) -> Result<ExecStep, RuleError> {
    if let Some(obj) = entry.as_object() {
        if let Some(topic) = obj.get("produce_to_topic") {
            if !topic.is_string() {
                return Err(RuleError::InvalidTemplate {
                    rule_name: rule_name.to_string(),
                    details: format!("produce_to_topic must be a string, got {topic}"),
                });
            }
            return Ok(ExecStep::Produce {
                topic: topic.clone(),
                message: obj.get("message").cloned(),
            });
        }
    }
    RequestTemplate::compile(entry, default_timeout)
        .map(ExecStep::Http)
        .map_err(|e| RuleError::InvalidTemplate {
            rule_name: rule_name.to_string(),
            details: e.to_string(),
        })
}

/// A compiled, immutable propagation rule.
#[derive(Debug, Clone)]
pub struct Rule {
    name: String,
    topic: String,
    retry_on: ResultClassifier,
    ignore: ResultClassifier,
    retry_delay: Duration,
    retry_limit: u32,
    retry_factor: f64,
    decode_results: bool,
    cases: Vec<RuleCase>,
}

impl Rule {
    /// Compile a rule from its name and document body.
    pub fn new(name: &str, spec: &RuleSpec, default_timeout: Duration) -> Result<Self, RuleError> {
        let topic = spec
            .topic
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RuleError::MissingTopic {
                rule_name: name.to_string(),
            })?;

        let compile_classifier = |stanza: &Option<Value>, fallback: &str| {
            let spec = match stanza {
                Some(value) => value.clone(),
                None => serde_json::from_str(fallback).expect("default classifier spec"),
            };
            ResultClassifier::compile(&spec).map_err(|source| RuleError::InvalidClassifier {
                rule_name: name.to_string(),
                source,
            })
        };

        let case_specs = match &spec.cases {
            Some(cases) => cases.clone(),
            // no cases array: the rule body itself is the single case
            None => vec![CaseSpec {
                match_: spec.match_.clone(),
                match_not: spec.match_not.clone(),
                exec: spec.exec.clone(),
            }],
        };
        let cases = case_specs
            .iter()
            .map(|case| RuleCase::compile(case, name, default_timeout))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: name.to_string(),
            topic,
            retry_on: compile_classifier(&spec.retry_on, DEFAULT_RETRY_ON)?,
            ignore: compile_classifier(&spec.ignore, DEFAULT_IGNORE)?,
            retry_delay: Duration::from_millis(spec.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY_MS)),
            retry_limit: spec.retry_limit.unwrap_or(DEFAULT_RETRY_LIMIT),
            retry_factor: spec.retry_factor.unwrap_or(DEFAULT_RETRY_FACTOR),
            decode_results: spec.decode_results.unwrap_or(false),
            cases,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    pub fn decode_results(&self) -> bool {
        self.decode_results
    }

    /// Index of the first case that fires for the event, if any.
    pub fn test(&self, event: &Value) -> Option<usize> {
        self.cases.iter().position(|case| case.fires(event))
    }

    /// Bindings for case `idx` over the event. An unconditional case binds
    /// nothing.
    pub fn expand(&self, idx: usize, event: &Value) -> Value {
        self.cases[idx]
            .matcher
            .as_ref()
            .and_then(|m| m.bind(Some(event)))
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    /// Ordered exec steps of case `idx`.
    pub fn exec_steps(&self, idx: usize) -> &[ExecStep] {
        &self.cases[idx].exec
    }

    /// A case with no exec steps consumes the event without side effects.
    pub fn is_noop(&self, idx: usize) -> bool {
        self.cases[idx].exec.is_empty()
    }

    pub fn should_retry(&self, result: &Value) -> bool {
        self.retry_on.classify(result)
    }

    pub fn should_ignore(&self, result: &Value) -> bool {
        self.ignore.classify(result)
    }

    /// Backoff before consuming a retry envelope carrying `retries_left`.
    /// Forms the geometric series `retry_delay * retry_factor^k` as the
    /// counter descends from `retry_limit`.
    pub fn retry_delay_for(&self, retries_left: u32) -> Duration {
        let exponent = self.retry_limit.saturating_sub(retries_left);
        let millis = self.retry_delay.as_millis() as f64 * self.retry_factor.powi(exponent as i32);
        Duration::from_millis(millis as u64)
    }
}
