use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error-changeprop-config-1 Required environment variable not set: {var_name}")]
    EnvVarRequired { var_name: String },

    #[error("error-changeprop-config-2 Version not available")]
    VersionNotAvailable,

    #[error("error-changeprop-config-3 Invalid duration value: {value}")]
    InvalidDuration { value: String },

    #[error("error-changeprop-config-4 Rules document unreadable: {path}: {details}")]
    RulesUnreadable { path: String, details: String },

    #[error("error-changeprop-config-5 Rules document malformed: {details}")]
    RulesMalformed { details: String },

    #[error("error-changeprop-config-6 Invalid broker list: {value}")]
    InvalidBrokerList { value: String },

    #[error("error-changeprop-config-7 Invalid client conf override: {stanza}: {details}")]
    InvalidClientConf { stanza: String, details: String },

    #[error("error-changeprop-config-8 Invalid chain length bound: {value}")]
    InvalidChainLength { value: String },
}

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("error-changeprop-match-1 Invalid match tree: {details}")]
    InvalidMatch { details: String },

    #[error("error-changeprop-match-2 Invalid regex pattern: {pattern}: {details}")]
    InvalidRegex { pattern: String, details: String },

    #[error(
        "error-changeprop-match-3 Regex mixes named and unnamed capture groups: {pattern}"
    )]
    MixedCaptureGroups { pattern: String },
}

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("error-changeprop-classifier-1 Invalid retry condition: {details}")]
    InvalidRetryCondition { details: String },

    #[error("error-changeprop-classifier-2 Invalid status pattern: {pattern}")]
    InvalidStatusPattern { pattern: String },
}

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("error-changeprop-rule-1 Rule has no topic: {rule_name}")]
    MissingTopic { rule_name: String },

    #[error("error-changeprop-rule-2 Invalid rule {rule_name}: {source}")]
    InvalidMatch {
        rule_name: String,
        #[source]
        source: MatchError,
    },

    #[error("error-changeprop-rule-3 Invalid rule {rule_name}: {source}")]
    InvalidClassifier {
        rule_name: String,
        #[source]
        source: ClassifierError,
    },

    #[error("error-changeprop-rule-4 Invalid exec template in rule {rule_name}: {details}")]
    InvalidTemplate { rule_name: String, details: String },

    #[error("error-changeprop-rule-5 Duplicate rule name: {rule_name}")]
    DuplicateName { rule_name: String },
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("error-changeprop-event-1 Event decode failed: {details}")]
    DecodeFailed { details: String },

    #[error("error-changeprop-event-2 Event meta missing or malformed: {details}")]
    InvalidMeta { details: String },
}

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("error-changeprop-template-0 Invalid exec template: {details}")]
    InvalidSpec { details: String },

    #[error("error-changeprop-template-1 Template rendered no uri")]
    MissingUri,

    #[error("error-changeprop-template-2 Invalid method after expansion: {method}")]
    InvalidMethod { method: String },

    #[error("error-changeprop-template-3 Header value not a string after expansion: {name}")]
    NonStringHeader { name: String },
}

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("error-changeprop-producer-1 Produce key must not be empty: topic {topic}")]
    EmptyKey { topic: String },

    #[error("error-changeprop-producer-2 Duplicate in-flight produce key: {key}")]
    DuplicateKey { key: String },

    #[error("error-changeprop-producer-3 Produce failed: {topic}: {details}")]
    ProduceFailed { topic: String, details: String },

    #[error("error-changeprop-producer-4 Producer shut down while produce pending: {key}")]
    Shutdown { key: String },
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("error-changeprop-consumer-1 Subscribe failed: {topic}: {details}")]
    SubscribeFailed { topic: String, details: String },

    #[error("error-changeprop-consumer-2 Offset commit failed: {topic}/{partition}@{offset}: {details}")]
    CommitFailed {
        topic: String,
        partition: i32,
        offset: i64,
        details: String,
    },
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("error-changeprop-executor-1 Retry envelope rejected by schema: {details}")]
    InvalidRetryEnvelope { details: String },

    #[error("error-changeprop-executor-2 Error envelope rejected by schema: {details}")]
    InvalidErrorEnvelope { details: String },
}
