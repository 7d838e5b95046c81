//! # changeprop
//!
//! changeprop is a rule-driven change-propagation engine. It consumes events
//! from a partitioned, ordered log, matches each event against declarative
//! rules, and fans out HTTP requests (or derived events) per match, with
//! bounded retries, exponential backoff, ignore-policies, and a delayed
//! retry queue implemented as dedicated log topics.
//!
//! ## Architecture Overview
//!
//! The service is built around several core components:
//!
//! ### Rule Engine
//! - **Rules** bind a bus topic to exec steps, gated by match trees
//! - Match trees compile to predicate + binder pairs over opaque JSON events
//! - `retry_on` / `ignore` stanzas compile to result classifiers
//!
//! ### Execution
//! - The executor drives each event through its topic's rules, classifies
//!   every HTTP result, and schedules retries onto per-rule retry topics
//! - Retry and error envelopes validate against published JSON schemas
//!
//! ### Bus Coordination
//! - Manual offset management: commits happen only after terminal outcomes
//! - The guaranteed producer resolves produce calls on delivery reports
//! - Per-partition processing is serialized; partitions run in parallel
//!
//! ## Configuration
//!
//! The service is configured via environment variables. Key variables:
//! - `CHANGEPROP_RULES`: path to the rules document
//! - `CHANGEPROP_BROKER_LIST`: bus broker connection string
//! - `CHANGEPROP_CONSUME_DC` / `CHANGEPROP_PRODUCE_DC`: datacenter prefixes
//!
//! ## Error Handling
//!
//! All error strings use the format: `error-changeprop-<domain>-<number>
//! <message>: <details>`. Workers never terminate on per-event errors.

/// Log-bus abstraction: consumer/producer traits, the in-memory bus, and
/// the delivery-confirmed guaranteed producer.
pub mod bus;

/// Configuration management for the changeprop service.
///
/// Environment-variable loading with typed validation, the rules document
/// parser, and the Kafka client settings handed to the bus binding.
pub mod config;

pub(crate) mod constants;

/// Consumer workers: per-(topic, group) fetch → dispatch → commit loops
/// with per-partition serialization.
pub mod consumer;

/// Rule compilation and evaluation: match trees, result classifiers,
/// request templates and the rule model.
pub mod engine;

/// Retry and error envelopes with JSON-schema validation.
pub mod envelope;

pub mod errors;

/// Bus events and their typed metadata view.
pub mod event;

/// Per-event rule execution: dispatch, classification, retry scheduling.
pub mod executor;

/// Metrics collection for service observability.
pub mod metrics;

/// Topic-indexed rule lookup and topic naming conventions.
pub mod registry;

/// Service assembly: rule compilation and worker topology spawning.
pub mod service;
