//! Rule registry: topic-indexed lookup of compiled rules.
//!
//! Built once at start-up and immutable afterwards. The registry also owns
//! the topic-name conventions: source subscriptions are datacenter-prefixed,
//! each rule gets a dedicated retry topic, and terminal failures all land on
//! a single error topic.

use std::collections::HashMap;
use std::sync::Arc;

use crate::constants::{ERROR_TOPIC, RETRY_TOPIC_PREFIX};
use crate::engine::Rule;
use crate::errors::RuleError;

/// Immutable topic → rules index.
#[derive(Debug)]
pub struct RuleRegistry {
    by_topic: HashMap<String, Vec<Arc<Rule>>>,
    by_retry_topic: HashMap<String, Arc<Rule>>,
}

impl RuleRegistry {
    /// Index a set of compiled rules. Rule names must be unique.
    pub fn new(rules: Vec<Rule>) -> Result<Self, RuleError> {
        let mut by_topic: HashMap<String, Vec<Arc<Rule>>> = HashMap::new();
        let mut by_retry_topic = HashMap::new();
        for rule in rules {
            let rule = Arc::new(rule);
            let retry_topic = retry_topic_name(rule.name());
            if by_retry_topic.insert(retry_topic, rule.clone()).is_some() {
                return Err(RuleError::DuplicateName {
                    rule_name: rule.name().to_string(),
                });
            }
            by_topic
                .entry(rule.topic().to_string())
                .or_default()
                .push(rule);
        }
        Ok(Self {
            by_topic,
            by_retry_topic,
        })
    }

    /// Rules bound to a source topic, in declaration order.
    pub fn rules_for(&self, topic: &str) -> &[Arc<Rule>] {
        self.by_topic.get(topic).map_or(&[], Vec::as_slice)
    }

    /// The rule owning a retry topic.
    pub fn rule_for_retry(&self, retry_topic: &str) -> Option<&Arc<Rule>> {
        self.by_retry_topic.get(retry_topic)
    }

    /// Distinct source topics, for worker spawning.
    pub fn source_topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.by_topic.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }

    /// All per-rule retry topics.
    pub fn retry_topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.by_retry_topic.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }
}

/// `change-prop.retry.<rule_name>`
pub fn retry_topic_name(rule_name: &str) -> String {
    format!("{RETRY_TOPIC_PREFIX}{rule_name}")
}

/// Topic terminal failures are reported to.
pub fn error_topic_name() -> &'static str {
    ERROR_TOPIC
}

/// Physical name of a source topic in a datacenter. Retry and error topics
/// are not prefixed.
pub fn prefixed_topic(dc: &str, topic: &str) -> String {
    format!("{dc}.{topic}")
}
