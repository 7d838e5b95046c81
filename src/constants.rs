//! Application-wide constants

/// Prefix for per-rule retry topics: `change-prop.retry.<rule_name>`
pub(crate) const RETRY_TOPIC_PREFIX: &str = "change-prop.retry.";

/// Topic all terminal failures are reported to
pub(crate) const ERROR_TOPIC: &str = "change-prop.error";

/// Datacenter name used when the config names none
pub(crate) const DEFAULT_DC_NAME: &str = "datacenter1";

/// Header carrying the request id inherited from the source event
pub(crate) const HEADER_REQUEST_ID: &str = "x-request-id";

/// Header carrying the comma-joined `rule:uri` provenance chain
pub(crate) const HEADER_TRIGGERED_BY: &str = "x-triggered-by";

/// Default classifier spec for `retry_on` when a rule gives none
pub(crate) const DEFAULT_RETRY_ON: &str = r#"{"status": ["50x"]}"#;

/// Default classifier spec for `ignore` when a rule gives none
pub(crate) const DEFAULT_IGNORE: &str = r#"{"status": [412]}"#;

/// Default initial retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 60_000;

/// Default retry attempt budget per event
pub(crate) const DEFAULT_RETRY_LIMIT: u32 = 2;

/// Default exponential backoff multiplier
pub(crate) const DEFAULT_RETRY_FACTOR: f64 = 6.0;

/// Default egress request timeout in milliseconds
pub(crate) const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

/// Default bound on the triggered-by chain length
pub(crate) const DEFAULT_MAX_CHAIN_LENGTH: usize = 10;

/// Interval between delivery-report polls of the underlying producer
pub(crate) const PRODUCER_POLL_INTERVAL_MS: u64 = 500;
