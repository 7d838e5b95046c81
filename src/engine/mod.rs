//! Rule compilation and evaluation engine.
//!
//! The engine turns the declarative rules document into compiled artifacts:
//! match trees become [`matcher::Pattern`] predicates with binders, retry and
//! ignore stanzas become [`classifier::ResultClassifier`] predicates, and
//! exec entries become [`template::RequestTemplate`] instances. A
//! [`rule::Rule`] bundles them with the retry policy.

pub mod classifier;
pub mod matcher;
pub mod rule;
pub mod template;

pub use classifier::ResultClassifier;
pub use matcher::Pattern;
pub use rule::{CaseSpec, ExecStep, Rule, RuleCase, RuleSpec};
pub use template::{RequestSpec, RequestTemplate};
