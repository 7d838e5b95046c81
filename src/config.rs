//! Service configuration.
//!
//! Configuration is loaded from environment variables (`dotenvy` honored in
//! development) with typed newtype validation, plus a rules document read
//! from the path named by `CHANGEPROP_RULES`. The Kafka stanzas mirror the
//! client settings the bus binding needs; nested `default_topic_conf`
//! objects are lifted into topic configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::constants::{DEFAULT_DC_NAME, DEFAULT_HTTP_TIMEOUT_MS, DEFAULT_MAX_CHAIN_LENGTH};
use crate::engine::RuleSpec;
use crate::errors::ConfigError;

type Result<T> = std::result::Result<T, ConfigError>;

/// Kafka broker list configuration.
///
/// Wraps the `metadata_broker_list` connection string. Required; the service
/// has no local fallback bus in production.
#[derive(Clone, Debug)]
pub struct BrokerList(String);

impl TryFrom<String> for BrokerList {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        if value.trim().is_empty() {
            return Err(ConfigError::InvalidBrokerList { value });
        }
        Ok(Self(value))
    }
}

impl AsRef<str> for BrokerList {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Egress HTTP timeout configuration.
///
/// Default timeout for requests dispatched by exec steps; individual
/// templates may override it per request.
#[derive(Clone, Debug)]
pub struct HttpClientTimeout(Duration);

impl Default for HttpClientTimeout {
    fn default() -> Self {
        Self(Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS))
    }
}

impl TryFrom<String> for HttpClientTimeout {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        let millis = value
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidDuration {
                value: value.clone(),
            })?;
        if millis == 0 {
            return Err(ConfigError::InvalidDuration { value });
        }
        Ok(Self(Duration::from_millis(millis)))
    }
}

impl AsRef<Duration> for HttpClientTimeout {
    fn as_ref(&self) -> &Duration {
        &self.0
    }
}

/// Startup delay configuration.
///
/// Optional pause before the first subscription, giving the surrounding
/// deployment time to settle topic metadata.
#[derive(Clone, Debug, Default)]
pub struct StartupDelay(Option<Duration>);

impl TryFrom<String> for StartupDelay {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        if value.is_empty() {
            return Ok(Self(None));
        }
        let millis = value
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidDuration {
                value: value.clone(),
            })?;
        Ok(Self((millis > 0).then(|| Duration::from_millis(millis))))
    }
}

impl StartupDelay {
    pub fn get(&self) -> Option<Duration> {
        self.0
    }
}

/// Bound on the triggered-by chain length.
#[derive(Clone, Debug)]
pub struct MaxChainLength(usize);

impl Default for MaxChainLength {
    fn default() -> Self {
        Self(DEFAULT_MAX_CHAIN_LENGTH)
    }
}

impl TryFrom<String> for MaxChainLength {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        let length = value
            .parse::<usize>()
            .map_err(|_| ConfigError::InvalidChainLength {
                value: value.clone(),
            })?;
        if length == 0 {
            return Err(ConfigError::InvalidChainLength { value });
        }
        Ok(Self(length))
    }
}

impl AsRef<usize> for MaxChainLength {
    fn as_ref(&self) -> &usize {
        &self.0
    }
}

/// Datacenter names for topic prefixing.
///
/// `consume_dc` and `produce_dc` fall back to `dc_name`, which itself falls
/// back to a fixed default, so a single-datacenter deployment needs no
/// configuration at all.
#[derive(Clone, Debug)]
pub struct DcNames {
    pub consume_dc: String,
    pub produce_dc: String,
}

impl DcNames {
    pub fn resolve(
        dc_name: Option<String>,
        consume_dc: Option<String>,
        produce_dc: Option<String>,
    ) -> Self {
        let base = dc_name.unwrap_or_else(|| DEFAULT_DC_NAME.to_string());
        Self {
            consume_dc: consume_dc.unwrap_or_else(|| base.clone()),
            produce_dc: produce_dc.unwrap_or_else(|| base.clone()),
        }
    }
}

/// One Kafka client stanza: flat settings plus topic-level settings lifted
/// from a nested `default_topic_conf` object.
#[derive(Clone, Debug, Default)]
pub struct KafkaClientConf {
    pub conf: HashMap<String, String>,
    pub default_topic_conf: HashMap<String, String>,
}

impl KafkaClientConf {
    /// Parse a JSON stanza override from the environment.
    pub fn from_json(stanza: &str, which: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(stanza).map_err(|e| ConfigError::InvalidClientConf {
                stanza: which.to_string(),
                details: e.to_string(),
            })?;
        let Some(map) = value.as_object() else {
            return Err(ConfigError::InvalidClientConf {
                stanza: which.to_string(),
                details: format!("expected an object, got {value}"),
            });
        };
        let mut parsed = Self::default();
        for (key, entry) in map {
            if key == "default_topic_conf" {
                let Some(nested) = entry.as_object() else {
                    return Err(ConfigError::InvalidClientConf {
                        stanza: which.to_string(),
                        details: "default_topic_conf must be an object".to_string(),
                    });
                };
                for (topic_key, topic_value) in nested {
                    parsed
                        .default_topic_conf
                        .insert(topic_key.clone(), scalar_setting(topic_value));
                }
            } else {
                parsed.conf.insert(key.clone(), scalar_setting(entry));
            }
        }
        Ok(parsed)
    }
}

fn scalar_setting(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Bus client configuration handed to the Kafka binding.
#[derive(Clone, Debug)]
pub struct KafkaConfig {
    pub broker_list: BrokerList,
    pub consumer: KafkaClientConf,
    pub producer: KafkaClientConf,
}

impl KafkaConfig {
    /// Consumer settings as key-value pairs: manual commits, new
    /// subscriptions starting at the log end, overrides applied last.
    pub fn consumer_settings(&self, group: &str) -> Vec<(String, String)> {
        let mut settings = vec![
            (
                "metadata.broker.list".to_string(),
                self.broker_list.as_ref().to_string(),
            ),
            ("group.id".to_string(), group.to_string()),
            ("enable.auto.commit".to_string(), "false".to_string()),
        ];
        settings.extend(
            self.consumer
                .conf
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        settings
    }

    /// Topic-level consumer settings with the `largest` reset default.
    pub fn consumer_topic_settings(&self) -> Vec<(String, String)> {
        let mut settings = vec![("auto.offset.reset".to_string(), "largest".to_string())];
        settings.extend(
            self.consumer
                .default_topic_conf
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        settings
    }

    /// Producer settings: single-ack delivery reports plus overrides.
    pub fn producer_settings(&self) -> Vec<(String, String)> {
        let mut settings = vec![
            (
                "metadata.broker.list".to_string(),
                self.broker_list.as_ref().to_string(),
            ),
            ("request.required.acks".to_string(), "1".to_string()),
        ];
        settings.extend(
            self.producer
                .conf
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        settings
    }
}

/// Full service configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub version: String,
    pub user_agent: String,
    pub consumer_group: String,
    pub rules_path: String,
    pub kafka: KafkaConfig,
    pub dc: DcNames,
    pub startup_delay: StartupDelay,
    pub http_timeout: HttpClientTimeout,
    pub max_chain_length: MaxChainLength,
    pub metrics_host: Option<String>,
    pub metrics_prefix: String,
}

impl Config {
    /// Load configuration from the environment.
    pub fn new() -> Result<Self> {
        let version = version()?;
        let user_agent = format!("changeprop/{version}");

        let consumer = match optional_env("CHANGEPROP_CONSUMER_CONF") {
            Some(stanza) => KafkaClientConf::from_json(&stanza, "consumer")?,
            None => KafkaClientConf::default(),
        };
        let producer = match optional_env("CHANGEPROP_PRODUCER_CONF") {
            Some(stanza) => KafkaClientConf::from_json(&stanza, "producer")?,
            None => KafkaClientConf::default(),
        };

        Ok(Self {
            version,
            user_agent,
            consumer_group: env_var_default("CHANGEPROP_CONSUMER_GROUP", "changeprop"),
            rules_path: required_env("CHANGEPROP_RULES")?,
            kafka: KafkaConfig {
                broker_list: BrokerList::try_from(required_env("CHANGEPROP_BROKER_LIST")?)?,
                consumer,
                producer,
            },
            dc: DcNames::resolve(
                optional_env("CHANGEPROP_DC_NAME"),
                optional_env("CHANGEPROP_CONSUME_DC"),
                optional_env("CHANGEPROP_PRODUCE_DC"),
            ),
            startup_delay: optional_env("CHANGEPROP_STARTUP_DELAY_MS")
                .map(StartupDelay::try_from)
                .transpose()?
                .unwrap_or_default(),
            http_timeout: optional_env("CHANGEPROP_HTTP_TIMEOUT_MS")
                .map(HttpClientTimeout::try_from)
                .transpose()?
                .unwrap_or_default(),
            max_chain_length: optional_env("CHANGEPROP_MAX_CHAIN_LENGTH")
                .map(MaxChainLength::try_from)
                .transpose()?
                .unwrap_or_default(),
            metrics_host: optional_env("CHANGEPROP_METRICS_HOST"),
            metrics_prefix: env_var_default("CHANGEPROP_METRICS_PREFIX", "changeprop"),
        })
    }

    /// The service identity stamped into envelopes.
    pub fn emitter_id(&self) -> String {
        format!("changeprop#{}", self.consumer_group)
    }
}

/// Load and parse the rules document: a JSON object mapping rule names to
/// rule bodies, in declaration order.
pub fn load_rules(path: &str) -> Result<Vec<(String, RuleSpec)>> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::RulesUnreadable {
        path: path.to_string(),
        details: e.to_string(),
    })?;
    parse_rules(&raw)
}

/// Parse a rules document from its raw text.
pub fn parse_rules(raw: &str) -> Result<Vec<(String, RuleSpec)>> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ConfigError::RulesMalformed {
        details: e.to_string(),
    })?;
    let Some(map) = value.as_object() else {
        return Err(ConfigError::RulesMalformed {
            details: format!("expected an object of rules, got {value}"),
        });
    };
    map.iter()
        .map(|(name, body)| {
            let spec: RuleSpec =
                serde_json::from_value(body.clone()).map_err(|e| ConfigError::RulesMalformed {
                    details: format!("rule {name}: {e}"),
                })?;
            Ok((name.clone(), spec))
        })
        .collect()
}

/// Retrieves the service version from compile-time environment variables.
pub fn version() -> Result<String> {
    option_env!("GIT_HASH")
        .or(option_env!("CARGO_PKG_VERSION"))
        .map(|val| val.to_string())
        .ok_or(ConfigError::VersionNotAvailable)
}

fn required_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| ConfigError::EnvVarRequired {
        var_name: name.to_string(),
    })
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_var_default(name: &str, default_value: &str) -> String {
    std::env::var(name).unwrap_or(default_value.to_string())
}
