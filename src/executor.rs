//! Per-event rule execution.
//!
//! The executor drives one decoded event through every rule bound to its
//! topic: test the cases, render the firing case's exec steps, dispatch them
//! in order, and classify each result as success, ignorable, retryable or
//! fatal. Retryable failures are re-submitted onto the rule's retry topic
//! with a decrementing counter; exhaustion is reported onto the error topic.
//! Rules for one event run concurrently but all terminate before the worker
//! commits the offset, so per-partition ordering is preserved.
//!
//! Failure policy: a non-2xx result that neither the `ignore` nor the
//! `retry_on` classifier claims stops the case with an error log but emits
//! nothing — only retry exhaustion (or the inability to produce a retry
//! envelope) is reported onto the error topic.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::bus::GuaranteedProducer;
use crate::constants::{HEADER_REQUEST_ID, HEADER_TRIGGERED_BY};
use crate::engine::template::expand_template;
use crate::engine::{ExecStep, RequestSpec, RequestTemplate, Rule};
use crate::envelope::{ErrorEnvelope, RetryEnvelope};
use crate::event::Event;
use crate::metrics::SharedMetricsPublisher;
use crate::registry::{prefixed_topic, RuleRegistry};

/// Immutable executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Service identity stamped into envelopes
    pub emitter_id: String,
    /// `user-agent` on every egress request
    pub user_agent: String,
    /// Datacenter prefix for produce exec steps
    pub produce_dc: String,
    /// Hard bound on the triggered-by chain
    pub max_chain_length: usize,
}

/// Outcome of a single dispatched request.
enum ExecOutcome {
    Success,
    Ignored,
    Retryable(Value),
    Fatal(String),
}

/// Evaluates rules for decoded events and drives retries.
pub struct Executor {
    registry: Arc<RuleRegistry>,
    producer: Arc<GuaranteedProducer>,
    http: reqwest::Client,
    metrics: SharedMetricsPublisher,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        registry: Arc<RuleRegistry>,
        producer: Arc<GuaranteedProducer>,
        http: reqwest::Client,
        metrics: SharedMetricsPublisher,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            producer,
            http,
            metrics,
            config,
        }
    }

    /// An HTTP client honoring the egress contract: no redirects, identified
    /// by the service user-agent.
    pub fn default_http_client(user_agent: &str) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(user_agent)
            .build()
    }

    /// Process one event consumed from a source topic. Every matching rule
    /// reaches a terminal outcome before this returns.
    #[instrument(skip_all, fields(topic = %topic, uri = %event.meta().uri))]
    pub async fn process_source(&self, topic: &str, event: &Event) {
        if self.chain_exceeded(event).await {
            return;
        }
        if let Some(chain) = event.triggered_by() {
            let token = event.chain_token();
            if chain.split(',').any(|t| t == token) {
                warn!(token = %token, chain = %chain, "Propagation loop detected, skipping event");
                self.metrics.incr("loops.detected").await;
                return;
            }
        }

        let rules = self.registry.rules_for(topic);
        if rules.is_empty() {
            debug!("No rules bound to topic");
            return;
        }
        let chain = event.extended_chain();
        join_all(
            rules
                .iter()
                .map(|rule| self.process_rule(rule, event, event, None, &chain)),
        )
        .await;
    }

    /// Process one retry envelope consumed from a per-rule retry topic.
    /// Sleeps out the remaining backoff before re-entering the rule.
    #[instrument(skip_all, fields(topic = %retry_topic))]
    pub async fn process_retry(&self, retry_topic: &str, envelope_event: &Event) {
        let Some(rule) = self.registry.rule_for_retry(retry_topic) else {
            warn!("Retry envelope for unknown rule, skipping");
            return;
        };
        let envelope: RetryEnvelope = match serde_json::from_value(envelope_event.raw().clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "Retry envelope malformed, skipping");
                return;
            }
        };
        if self.chain_exceeded(envelope_event).await {
            return;
        }

        // the delay is anchored at envelope emission: sleep only what remains
        let delay = rule.retry_delay_for(envelope.retries_left);
        let elapsed = (Utc::now() - envelope.meta.dt).to_std().unwrap_or_default();
        if delay > elapsed {
            tokio::time::sleep(delay - elapsed).await;
        }

        let exec_event = match Event::from_value(envelope.original_event.clone()) {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "Retry envelope carries undecodable original event");
                return;
            }
        };
        let chain = envelope_event.extended_chain();
        self.process_rule(
            rule,
            &exec_event,
            envelope_event,
            Some(envelope.retries_left),
            &chain,
        )
        .await;
    }

    async fn chain_exceeded(&self, event: &Event) -> bool {
        let inherited = event
            .triggered_by()
            .map(|chain| chain.split(',').count())
            .unwrap_or(0);
        if inherited + 1 > self.config.max_chain_length {
            warn!(
                length = inherited + 1,
                bound = self.config.max_chain_length,
                "Triggered-by chain over bound, skipping event"
            );
            self.metrics.incr("loops.detected").await;
            return true;
        }
        false
    }

    /// Run one rule over one event. `exec_event` is what templates and
    /// matchers see (the original event on retries); `consumed` is what came
    /// off the bus and seeds any emitted envelope.
    async fn process_rule(
        &self,
        rule: &Rule,
        exec_event: &Event,
        consumed: &Event,
        retries_left: Option<u32>,
        chain: &str,
    ) {
        let Some(case_idx) = rule.test(exec_event.raw()) else {
            return;
        };
        if rule.is_noop(case_idx) {
            debug!(rule = rule.name(), "No-op rule case, recording success");
            self.metrics
                .incr_with_tags("exec.noop", &[("rule", rule.name())])
                .await;
            return;
        }

        let bindings = rule.expand(case_idx, exec_event.raw());
        let started = Instant::now();
        for step in rule.exec_steps(case_idx) {
            let outcome = match step {
                ExecStep::Http(template) => {
                    self.dispatch_http(rule, template, exec_event, &bindings, chain)
                        .await
                }
                ExecStep::Produce { topic, message } => {
                    self.dispatch_produce(topic, message.as_ref(), exec_event, &bindings, chain)
                        .await
                }
            };
            match outcome {
                ExecOutcome::Success => {
                    self.metrics
                        .incr_with_tags("exec.success", &[("rule", rule.name())])
                        .await;
                }
                ExecOutcome::Ignored => {
                    self.metrics
                        .incr_with_tags("exec.ignored", &[("rule", rule.name())])
                        .await;
                }
                ExecOutcome::Retryable(result) => {
                    self.metrics
                        .incr_with_tags("exec.retry", &[("rule", rule.name())])
                        .await;
                    self.schedule_retry(rule, consumed, retries_left, &result)
                        .await;
                    break;
                }
                ExecOutcome::Fatal(message) => {
                    error!(
                        rule = rule.name(),
                        uri = %exec_event.meta().uri,
                        message = %message,
                        "Exec step failed terminally, stopping case"
                    );
                    self.metrics
                        .incr_with_tags("exec.fatal", &[("rule", rule.name())])
                        .await;
                    break;
                }
            }
        }
        self.metrics
            .time("exec.latency", started.elapsed().as_millis() as u64)
            .await;
    }

    async fn dispatch_http(
        &self,
        rule: &Rule,
        template: &RequestTemplate,
        event: &Event,
        bindings: &Value,
        chain: &str,
    ) -> ExecOutcome {
        let spec = match template.render(event.raw(), bindings) {
            Ok(spec) => spec,
            Err(e) => return ExecOutcome::Fatal(e.to_string()),
        };
        debug!(method = %spec.method, uri = %spec.uri, "Dispatching request");

        let response = match self.send_request(event, &spec, chain).await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                // request expiry classifies like an upstream gateway timeout
                let result = json!({"status": 504, "body": "request timeout"});
                return self.classify(rule, result);
            }
            Err(e) => return ExecOutcome::Fatal(e.to_string()),
        };

        let status = response.status();
        if status.is_success() {
            return ExecOutcome::Success;
        }
        let result = materialize_result(response, rule.decode_results()).await;
        self.classify(rule, result)
    }

    fn classify(&self, rule: &Rule, result: Value) -> ExecOutcome {
        if rule.should_ignore(&result) {
            return ExecOutcome::Ignored;
        }
        if rule.should_retry(&result) {
            return ExecOutcome::Retryable(result);
        }
        let status = result.get("status").and_then(Value::as_u64);
        ExecOutcome::Fatal(match status {
            Some(status) => format!("HTTP {status}"),
            None => result.to_string(),
        })
    }

    async fn send_request(
        &self,
        event: &Event,
        spec: &RequestSpec,
        chain: &str,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let method = reqwest::Method::from_bytes(spec.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut request = self
            .http
            .request(method, &spec.uri)
            .timeout(spec.timeout)
            .header(HEADER_REQUEST_ID, event.meta().request_id.as_str())
            .header(HEADER_TRIGGERED_BY, chain)
            .header(reqwest::header::USER_AGENT, self.config.user_agent.as_str());
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &spec.body {
            request = request.json(body);
        }
        request.send().await
    }

    async fn dispatch_produce(
        &self,
        topic_template: &Value,
        message_template: Option<&Value>,
        event: &Event,
        bindings: &Value,
        chain: &str,
    ) -> ExecOutcome {
        let topic = match expand_template(topic_template, event.raw(), bindings) {
            Value::String(s) if !s.is_empty() => s,
            other => {
                return ExecOutcome::Fatal(format!("produce topic rendered to {other}"));
            }
        };

        let mut message = match message_template {
            Some(template) => expand_template(template, event.raw(), bindings),
            None => event.raw().clone(),
        };
        stamp_derived_meta(&mut message, &topic, event);
        message["triggered_by"] = Value::String(chain.to_string());

        let physical = prefixed_topic(&self.config.produce_dc, &topic);
        let payload = message.to_string().into_bytes();
        match self
            .producer
            .produce(&physical, None, payload, &event.meta().request_id)
            .await
        {
            Ok(_) => {
                info!(topic = %physical, "Produced derived event");
                self.metrics.incr("produce.derived").await;
                ExecOutcome::Success
            }
            Err(e) => ExecOutcome::Fatal(e.to_string()),
        }
    }

    /// Re-submit onto the retry topic, or report exhaustion.
    async fn schedule_retry(
        &self,
        rule: &Rule,
        consumed: &Event,
        retries_left: Option<u32>,
        result: &Value,
    ) {
        let next = match retries_left {
            // first failure: the full budget
            None => rule.retry_limit(),
            Some(left) => left.saturating_sub(1),
        };
        let exhausted = match retries_left {
            None => rule.retry_limit() == 0,
            Some(left) => left <= 1,
        };
        if exhausted {
            warn!(
                rule = rule.name(),
                uri = %consumed.meta().uri,
                "Retry budget exhausted"
            );
            self.metrics
                .incr_with_tags("retry.exhausted", &[("rule", rule.name())])
                .await;
            self.emit_error(consumed, format!("retry exhausted: {result}"))
                .await;
            return;
        }

        let envelope = RetryEnvelope::new(rule.name(), next, consumed, &self.config.emitter_id);
        let payload = match envelope.validate() {
            Ok(value) => value.to_string().into_bytes(),
            Err(e) => {
                error!(error = %e, "Refusing to produce invalid retry envelope");
                self.emit_error(consumed, e.to_string()).await;
                return;
            }
        };
        match self
            .producer
            .produce(
                &envelope.meta.topic,
                None,
                payload,
                &consumed.meta().request_id,
            )
            .await
        {
            Ok(_) => {
                info!(
                    rule = rule.name(),
                    retries_left = next,
                    topic = %envelope.meta.topic,
                    "Scheduled retry"
                );
                self.metrics
                    .incr_with_tags("retry.produced", &[("rule", rule.name())])
                    .await;
            }
            Err(e) => {
                // the retry is lost; report the event as failed instead
                error!(error = %e, rule = rule.name(), "Retry produce failed");
                self.emit_error(consumed, e.to_string()).await;
            }
        }
    }

    async fn emit_error(&self, consumed: &Event, message: String) {
        let envelope = ErrorEnvelope::new(consumed, &self.config.emitter_id, message);
        let payload = match envelope.validate() {
            Ok(value) => value.to_string().into_bytes(),
            Err(e) => {
                error!(error = %e, "Error envelope failed schema validation, dropping");
                return;
            }
        };
        if let Err(e) = self
            .producer
            .produce(
                &envelope.meta.topic,
                None,
                payload,
                &consumed.meta().request_id,
            )
            .await
        {
            error!(error = %e, "Error envelope produce failed");
        } else {
            self.metrics.incr("errors.produced").await;
        }
    }
}

/// Stamp routing metadata onto a derived event: the logical target topic, a
/// fresh id and emission time, inherited correlation fields.
fn stamp_derived_meta(message: &mut Value, topic: &str, source: &Event) {
    if !message.is_object() {
        *message = Value::Object(Map::new());
    }
    let source_meta = source.meta();
    let meta = message
        .as_object_mut()
        .expect("derived message forced to object")
        .entry("meta")
        .or_insert_with(|| Value::Object(Map::new()));
    if !meta.is_object() {
        *meta = Value::Object(Map::new());
    }
    let meta = meta.as_object_mut().expect("meta forced to object");
    meta.insert("topic".to_string(), Value::String(topic.to_string()));
    meta.insert(
        "dt".to_string(),
        Value::String(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
    );
    meta.insert(
        "id".to_string(),
        Value::String(ulid::Ulid::new().to_string()),
    );
    meta.entry("uri".to_string())
        .or_insert_with(|| Value::String(source_meta.uri.clone()));
    meta.entry("request_id".to_string())
        .or_insert_with(|| Value::String(source_meta.request_id.clone()));
    meta.entry("domain".to_string())
        .or_insert_with(|| Value::String(source_meta.domain.clone()));
}

/// Flatten an HTTP response into the JSON shape classifiers inspect. The
/// body stays a raw string unless the rule opted into decoding.
async fn materialize_result(response: reqwest::Response, decode: bool) -> Value {
    let status = response.status().as_u16();
    let mut headers = Map::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), Value::String(value.to_string()));
        }
    }
    let body_text = response.text().await.unwrap_or_default();
    let body = if decode {
        serde_json::from_str(&body_text).unwrap_or(Value::String(body_text))
    } else {
        Value::String(body_text)
    };
    json!({"status": status, "headers": headers, "body": body})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_derived_meta_overrides_routing_keeps_correlation() {
        let source = Event::from_value(json!({
            "meta": {
                "topic": "test_dc.kafka_producing_rule",
                "uri": "/sample/uri",
                "request_id": "rid-1",
                "domain": "test.wiki.example",
                "dt": "2024-01-01T00:00:00Z"
            }
        }))
        .unwrap();
        let mut message = source.raw().clone();
        stamp_derived_meta(&mut message, "simple_test_rule", &source);
        assert_eq!(message["meta"]["topic"], json!("simple_test_rule"));
        assert_eq!(message["meta"]["uri"], json!("/sample/uri"));
        assert_eq!(message["meta"]["request_id"], json!("rid-1"));
        // fresh emission time and id
        assert_ne!(message["meta"]["dt"], json!("2024-01-01T00:00:00Z"));
        assert!(message["meta"]["id"].is_string());
    }

    #[test]
    fn test_stamp_derived_meta_builds_missing_structure() {
        let source = Event::from_value(json!({
            "meta": {
                "topic": "t",
                "uri": "/u",
                "request_id": "r",
                "domain": "d",
                "dt": "2024-01-01T00:00:00Z"
            }
        }))
        .unwrap();
        let mut message = json!("not-an-object");
        stamp_derived_meta(&mut message, "target", &source);
        assert_eq!(message["meta"]["topic"], json!("target"));
        assert_eq!(message["meta"]["domain"], json!("d"));
    }
}
