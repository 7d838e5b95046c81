//! End-to-end propagation scenarios over the in-memory bus and a mock
//! HTTP target.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use changeprop::bus::{BusConsumer, BusProducer, GuaranteedProducer, MemoryBus};
use changeprop::config;
use changeprop::envelope::{ErrorEnvelope, RetryEnvelope};
use changeprop::executor::{Executor, ExecutorConfig};
use changeprop::metrics::{NoOpMetricsPublisher, SharedMetricsPublisher};
use changeprop::registry::RuleRegistry;
use changeprop::service::{self, ServiceHandles};
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const REQUEST_ID: &str = "sample-request-id";

/// Spin up the full worker topology over a fresh in-memory bus.
async fn start_service(rules: Value) -> (Arc<MemoryBus>, ServiceHandles) {
    let specs = config::parse_rules(&rules.to_string()).unwrap();
    let compiled = service::compile_rules(&specs, Duration::from_secs(5)).unwrap();
    let registry = Arc::new(RuleRegistry::new(compiled).unwrap());

    let bus = MemoryBus::new();
    let producer = GuaranteedProducer::with_poll_interval(
        Arc::new(bus.producer()),
        Duration::from_millis(10),
    );
    let http = Executor::default_http_client("changeprop-test/0").unwrap();
    let metrics: SharedMetricsPublisher = Arc::new(NoOpMetricsPublisher::new());

    let handles = service::start(
        registry,
        |group| Arc::new(bus.consumer(group)) as Arc<dyn BusConsumer>,
        producer,
        http,
        metrics,
        "changeprop-test",
        "test_dc",
        ExecutorConfig {
            emitter_id: "changeprop#test".to_string(),
            user_agent: "changeprop-test/0".to_string(),
            produce_dc: "test_dc".to_string(),
            max_chain_length: 10,
        },
    );
    // let the workers subscribe before producing: new subscriptions start
    // at the log end
    tokio::time::sleep(Duration::from_millis(100)).await;
    (bus, handles)
}

fn simple_rule(mock_uri: &str) -> Value {
    json!({
        "simple_test_rule": {
            "topic": "simple_test_rule",
            "retry_delay": 50,
            "retry_factor": 1,
            "retry_limit": 2,
            "match": {"message": "test"},
            "exec": {
                "method": "post",
                "uri": format!("{mock_uri}/"),
                "body": {
                    "test_field_name": "test_field_value",
                    "derived_field": "{{message.message}}"
                }
            }
        }
    })
}

fn sample_event(topic: &str, payload: Value) -> Value {
    let mut event = json!({
        "meta": {
            "topic": topic,
            "uri": "/sample/uri",
            "request_id": REQUEST_ID,
            "domain": "test.wiki.example",
            "dt": chrono::Utc::now().to_rfc3339()
        }
    });
    if let Some(fields) = payload.as_object() {
        for (key, value) in fields {
            event[key] = value.clone();
        }
    }
    event
}

async fn send(bus: &Arc<MemoryBus>, physical_topic: &str, event: &Value) {
    bus.producer()
        .send(
            physical_topic,
            None,
            event.to_string().into_bytes(),
            REQUEST_ID,
        )
        .await
        .unwrap();
}

async fn send_raw(bus: &Arc<MemoryBus>, physical_topic: &str, payload: &[u8]) {
    bus.producer()
        .send(physical_topic, None, payload.to_vec(), REQUEST_ID)
        .await
        .unwrap();
}

async fn settle(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

#[tokio::test]
async fn test_simple_match_and_dispatch() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("x-request-id", REQUEST_ID))
        .and(header("x-triggered-by", "simple_test_rule:/sample/uri"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (bus, handles) = start_service(simple_rule(&mock_server.uri())).await;

    // only the second event matches the rule
    send(
        &bus,
        "test_dc.simple_test_rule",
        &sample_event("simple_test_rule", json!({"message": "no"})),
    )
    .await;
    send(
        &bus,
        "test_dc.simple_test_rule",
        &sample_event("simple_test_rule", json!({"message": "test"})),
    )
    .await;
    send(
        &bus,
        "test_dc.simple_test_rule",
        &sample_event("simple_test_rule", json!({})),
    )
    .await;

    settle(500).await;
    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(
        body,
        json!({
            "test_field_name": "test_field_value",
            "derived_field": "test"
        })
    );
    mock_server.verify().await;

    bus.close().await;
    handles.shutdown().await;
}

#[tokio::test]
async fn test_retry_on_500_then_success() {
    let mock_server = MockServer::start().await;
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(move |_req: &Request| {
            if attempts_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(500)
            } else {
                ResponseTemplate::new(200)
            }
        })
        .expect(2)
        .mount(&mock_server)
        .await;

    let (bus, handles) = start_service(simple_rule(&mock_server.uri())).await;
    send(
        &bus,
        "test_dc.simple_test_rule",
        &sample_event("simple_test_rule", json!({"message": "test"})),
    )
    .await;

    settle(1500).await;
    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);

    // the retried request carries the extended chain
    let chain = requests[1]
        .headers
        .get("x-triggered-by")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(
        chain,
        "simple_test_rule:/sample/uri,change-prop.retry.simple_test_rule:/sample/uri"
    );

    // exactly one schema-valid envelope on the retry topic
    let envelopes = bus.payloads("change-prop.retry.simple_test_rule").await;
    assert_eq!(envelopes.len(), 1);
    let envelope: RetryEnvelope = serde_json::from_slice(&envelopes[0]).unwrap();
    envelope.validate().unwrap();
    assert_eq!(envelope.triggered_by, "simple_test_rule:/sample/uri");
    assert_eq!(envelope.retries_left, 2);
    assert_eq!(envelope.original_event["message"], json!("test"));

    // success on retry: nothing on the error topic
    assert!(bus.payloads("change-prop.error").await.is_empty());

    bus.close().await;
    handles.shutdown().await;
}

#[tokio::test]
async fn test_retry_exhaustion_reports_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&mock_server)
        .await;

    let (bus, handles) = start_service(simple_rule(&mock_server.uri())).await;
    send(
        &bus,
        "test_dc.simple_test_rule",
        &sample_event("simple_test_rule", json!({"message": "test"})),
    )
    .await;

    settle(2000).await;
    // original attempt plus retry_limit retries
    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);

    // at most retry_limit envelopes, with a descending counter
    let envelopes = bus.payloads("change-prop.retry.simple_test_rule").await;
    assert_eq!(envelopes.len(), 2);
    let counters: Vec<u32> = envelopes
        .iter()
        .map(|payload| {
            serde_json::from_slice::<RetryEnvelope>(payload)
                .unwrap()
                .retries_left
        })
        .collect();
    assert_eq!(counters, vec![2, 1]);

    // exactly one schema-valid error envelope, then silence
    let errors = bus.payloads("change-prop.error").await;
    assert_eq!(errors.len(), 1);
    let error: ErrorEnvelope = serde_json::from_slice(&errors[0]).unwrap();
    error.validate().unwrap();
    assert_eq!(error.meta.request_id, REQUEST_ID);
    assert!(error.message.contains("retry exhausted"));

    bus.close().await;
    handles.shutdown().await;
}

#[tokio::test]
async fn test_no_retry_on_404() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (bus, handles) = start_service(simple_rule(&mock_server.uri())).await;
    send(
        &bus,
        "test_dc.simple_test_rule",
        &sample_event("simple_test_rule", json!({"message": "test"})),
    )
    .await;

    settle(700).await;
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 1);
    // 404 is not in retry_on: no retry, and no error report either
    assert!(bus
        .payloads("change-prop.retry.simple_test_rule")
        .await
        .is_empty());
    assert!(bus.payloads("change-prop.error").await.is_empty());

    bus.close().await;
    handles.shutdown().await;
}

#[tokio::test]
async fn test_unparseable_event_is_skipped_not_fatal() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (bus, handles) = start_service(simple_rule(&mock_server.uri())).await;
    send_raw(&bus, "test_dc.simple_test_rule", b"non-parsable-json").await;
    send(
        &bus,
        "test_dc.simple_test_rule",
        &sample_event("simple_test_rule", json!({"message": "test"})),
    )
    .await;

    settle(500).await;
    // the worker commits past the garbage and processes the valid event
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 1);
    assert_eq!(
        bus.committed(
            "changeprop-test-simple_test_rule",
            "test_dc.simple_test_rule",
            0
        )
        .await,
        Some(1)
    );

    bus.close().await;
    handles.shutdown().await;
}

#[tokio::test]
async fn test_produce_exec_fans_out_through_second_rule() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(header(
            "x-triggered-by",
            "test_dc.kafka_producing_rule:/sample/uri,simple_test_rule:/sample/uri",
        ))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut rules = simple_rule(&mock_server.uri());
    rules["kafka_producing_rule"] = json!({
        "topic": "kafka_producing_rule",
        "match": {"message": "test"},
        "exec": {"produce_to_topic": "simple_test_rule"}
    });

    let (bus, handles) = start_service(rules).await;
    send(
        &bus,
        "test_dc.kafka_producing_rule",
        &sample_event("test_dc.kafka_producing_rule", json!({"message": "test"})),
    )
    .await;

    settle(1000).await;
    // the derived event landed on the produce-dc-prefixed topic
    let derived = bus.payloads("test_dc.simple_test_rule").await;
    assert_eq!(derived.len(), 1);
    let derived: Value = serde_json::from_slice(&derived[0]).unwrap();
    assert_eq!(derived["meta"]["topic"], json!("simple_test_rule"));
    assert_eq!(
        derived["triggered_by"],
        json!("test_dc.kafka_producing_rule:/sample/uri")
    );

    // and fanned out through the simple rule with the full chain
    mock_server.verify().await;
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 1);

    bus.close().await;
    handles.shutdown().await;
}

#[tokio::test]
async fn test_self_produce_loop_is_detected() {
    // a rule that produces back onto its own topic would spin forever
    // without the chain membership check
    let rules = json!({
        "loop_rule": {
            "topic": "loop_rule",
            "match": {"message": "test"},
            "exec": {"produce_to_topic": "loop_rule"}
        }
    });

    let (bus, handles) = start_service(rules).await;
    send(
        &bus,
        "test_dc.loop_rule",
        &sample_event("loop_rule", json!({"message": "test"})),
    )
    .await;

    settle(1000).await;
    // one derived event was produced, consumed, and dropped by loop
    // detection; no second generation appears
    assert_eq!(bus.payloads("test_dc.loop_rule").await.len(), 2);

    bus.close().await;
    handles.shutdown().await;
}
