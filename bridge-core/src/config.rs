//! Bridge configuration, read from `BRIDGE_*` environment variables.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use bridge_kafka::sink::DeadLetterConfig;
use bridge_kafka::source::KafkaSourceConfig;
use bridge_kafka::{KafkaSaslAuth, ResetPolicy, TlsClientAuthCerts, TlsConfig};
use reqwest::Url;

use crate::error::{Error, Result};
use crate::retry::BackoffPolicy;

const ENV_KAFKA_BROKERS: &str = "BRIDGE_KAFKA_BROKERS";
const ENV_KAFKA_TOPIC: &str = "BRIDGE_KAFKA_TOPIC";
const ENV_KAFKA_GROUP_ID: &str = "BRIDGE_KAFKA_GROUP_ID";
const ENV_KAFKA_RESET_POLICY: &str = "BRIDGE_KAFKA_RESET_POLICY";
const ENV_KAFKA_RAW_CONFIG: &str = "BRIDGE_KAFKA_RAW_CONFIG";
const ENV_KAFKA_SASL_MECHANISM: &str = "BRIDGE_KAFKA_SASL_MECHANISM";
const ENV_KAFKA_SASL_USERNAME: &str = "BRIDGE_KAFKA_SASL_USERNAME";
const ENV_KAFKA_SASL_PASSWORD: &str = "BRIDGE_KAFKA_SASL_PASSWORD";
const ENV_KAFKA_TLS_ENABLED: &str = "BRIDGE_KAFKA_TLS_ENABLED";
const ENV_KAFKA_TLS_CA_CERT: &str = "BRIDGE_KAFKA_TLS_CA_CERT";
const ENV_KAFKA_TLS_CLIENT_CERT: &str = "BRIDGE_KAFKA_TLS_CLIENT_CERT";
const ENV_KAFKA_TLS_CLIENT_KEY: &str = "BRIDGE_KAFKA_TLS_CLIENT_KEY";
const ENV_KAFKA_TLS_INSECURE_SKIP_VERIFY: &str = "BRIDGE_KAFKA_TLS_INSECURE_SKIP_VERIFY";
const ENV_HTTP_ENDPOINT: &str = "BRIDGE_HTTP_ENDPOINT";
const ENV_HTTP_REQUEST_TIMEOUT_MS: &str = "BRIDGE_HTTP_REQUEST_TIMEOUT_MS";
const ENV_HTTP_HEADERS: &str = "BRIDGE_HTTP_HEADERS";
const ENV_HTTP_FORWARD_RECORD_METADATA: &str = "BRIDGE_HTTP_FORWARD_RECORD_METADATA";
const ENV_HTTP_PROPAGATE_RECORD_HEADERS: &str = "BRIDGE_HTTP_PROPAGATE_RECORD_HEADERS";
const ENV_DELIVERY_GUARANTEE: &str = "BRIDGE_DELIVERY_GUARANTEE";
const ENV_BATCH_SIZE: &str = "BRIDGE_BATCH_SIZE";
const ENV_MAX_POLL_WAIT_MS: &str = "BRIDGE_MAX_POLL_WAIT_MS";
const ENV_RETRY_BUDGET: &str = "BRIDGE_RETRY_BUDGET";
const ENV_BACKOFF_INITIAL_MS: &str = "BRIDGE_BACKOFF_INITIAL_MS";
const ENV_BACKOFF_MAX_MS: &str = "BRIDGE_BACKOFF_MAX_MS";
const ENV_BACKOFF_FACTOR: &str = "BRIDGE_BACKOFF_FACTOR";
const ENV_BACKOFF_JITTER: &str = "BRIDGE_BACKOFF_JITTER";
const ENV_ON_RETRIES_EXHAUSTED: &str = "BRIDGE_ON_RETRIES_EXHAUSTED";
const ENV_ON_TERMINAL_FAILURE: &str = "BRIDGE_ON_TERMINAL_FAILURE";
const ENV_DEAD_LETTER_TOPIC: &str = "BRIDGE_DEAD_LETTER_TOPIC";
const ENV_DEAD_LETTER_BROKERS: &str = "BRIDGE_DEAD_LETTER_BROKERS";
const ENV_METRICS_PORT: &str = "BRIDGE_METRICS_PORT";

/// librdkafka properties owned by the bridge, since they decide when offsets are committed.
const RESERVED_RAW_CONFIG: [&str; 4] = [
    "group.id",
    "enable.auto.commit",
    "enable.auto.offset.store",
    "auto.offset.reset",
];

const DEFAULT_KAFKA_BROKERS: &str = "localhost:9092";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_MAX_POLL_WAIT_MS: u64 = 1000;
const DEFAULT_RETRY_BUDGET: u32 = 5;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 100;
const DEFAULT_BACKOFF_MAX_MS: u64 = 10_000;
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
const DEFAULT_BACKOFF_JITTER: f64 = 0.2;
const DEFAULT_METRICS_PORT: u16 = 2469;

/// When offsets are committed relative to delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryGuarantee {
    /// Commit on fetch, before delivery. A failed delivery is never repeated.
    AtMostOnce,
    /// Commit only after the record was delivered or explicitly disposed of.
    #[default]
    AtLeastOnce,
    /// Never commit, a restart replays from the reset policy.
    None,
}

impl FromStr for DeliveryGuarantee {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "at-most-once" => Ok(DeliveryGuarantee::AtMostOnce),
            "at-least-once" => Ok(DeliveryGuarantee::AtLeastOnce),
            "none" => Ok(DeliveryGuarantee::None),
            other => Err(Error::Config(format!(
                "Unknown delivery guarantee {other:?}, expected at-most-once, at-least-once or none"
            ))),
        }
    }
}

impl Display for DeliveryGuarantee {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            DeliveryGuarantee::AtMostOnce => write!(f, "at-most-once"),
            DeliveryGuarantee::AtLeastOnce => write!(f, "at-least-once"),
            DeliveryGuarantee::None => write!(f, "none"),
        }
    }
}

/// What happens to a record whose retry budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustedStrategy {
    /// Stop consuming the partition without committing past the record.
    #[default]
    Block,
    DeadLetter,
    /// Skip the record with an error log.
    Drop,
}

impl FromStr for ExhaustedStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "block" => Ok(ExhaustedStrategy::Block),
            "dead-letter" => Ok(ExhaustedStrategy::DeadLetter),
            "drop" => Ok(ExhaustedStrategy::Drop),
            other => Err(Error::Config(format!(
                "Unknown retries-exhausted strategy {other:?}, expected block, dead-letter or drop"
            ))),
        }
    }
}

impl Display for ExhaustedStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            ExhaustedStrategy::Block => write!(f, "block"),
            ExhaustedStrategy::DeadLetter => write!(f, "dead-letter"),
            ExhaustedStrategy::Drop => write!(f, "drop"),
        }
    }
}

/// What happens to a record the endpoint rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminalStrategy {
    DeadLetter,
    #[default]
    Drop,
}

impl FromStr for TerminalStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "dead-letter" => Ok(TerminalStrategy::DeadLetter),
            "drop" => Ok(TerminalStrategy::Drop),
            other => Err(Error::Config(format!(
                "Unknown terminal-failure strategy {other:?}, expected dead-letter or drop"
            ))),
        }
    }
}

impl Display for TerminalStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            TerminalStrategy::DeadLetter => write!(f, "dead-letter"),
            TerminalStrategy::Drop => write!(f, "drop"),
        }
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase().replace('_', "-")
}

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub group_id: String,
    pub reset_policy: ResetPolicy,
    pub auth: Option<KafkaSaslAuth>,
    pub tls: Option<TlsConfig>,
    pub raw_config: HashMap<String, String>,
}

/// Which record attributes become request headers, besides the static ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderPolicy {
    pub forward_record_metadata: bool,
    pub propagate_record_headers: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpSinkConfig {
    pub endpoint: Url,
    pub request_timeout: Duration,
    /// Sent with every request, e.g. credentials for the endpoint.
    pub headers: Vec<(String, String)>,
    pub header_policy: HeaderPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwarderConfig {
    pub guarantee: DeliveryGuarantee,
    pub batch_size: usize,
    pub max_poll_wait: Duration,
    /// Total delivery attempts per record, the first one included.
    pub retry_budget: u32,
    pub backoff: BackoffPolicy,
    pub on_retries_exhausted: ExhaustedStrategy,
    pub on_terminal_failure: TerminalStrategy,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            guarantee: DeliveryGuarantee::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_poll_wait: Duration::from_millis(DEFAULT_MAX_POLL_WAIT_MS),
            retry_budget: DEFAULT_RETRY_BUDGET,
            backoff: BackoffPolicy::default(),
            on_retries_exhausted: ExhaustedStrategy::default(),
            on_terminal_failure: TerminalStrategy::default(),
        }
    }
}

impl ForwarderConfig {
    pub(crate) fn uses_dead_letter(&self) -> bool {
        self.on_terminal_failure == TerminalStrategy::DeadLetter
            || (self.guarantee != DeliveryGuarantee::AtMostOnce
                && self.on_retries_exhausted == ExhaustedStrategy::DeadLetter)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub kafka: KafkaConfig,
    pub http: HttpSinkConfig,
    pub forwarder: ForwarderConfig,
    pub dead_letter: Option<DeadLetterConfig>,
    pub metrics_port: u16,
}

impl Settings {
    /// Builds the settings from environment variables, e.g. `Settings::load(std::env::vars())`.
    pub fn load(env_vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let env = Env(env_vars
            .into_iter()
            .filter(|(key, value)| key.starts_with("BRIDGE_") && !value.trim().is_empty())
            .collect());

        let kafka = KafkaConfig {
            brokers: env
                .get(ENV_KAFKA_BROKERS)
                .unwrap_or(DEFAULT_KAFKA_BROKERS)
                .split(',')
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty())
                .collect(),
            topic: env.required(ENV_KAFKA_TOPIC)?,
            group_id: env.required(ENV_KAFKA_GROUP_ID)?,
            reset_policy: match env.get(ENV_KAFKA_RESET_POLICY).map(normalize).as_deref() {
                None | Some("earliest") => ResetPolicy::Earliest,
                Some("latest") => ResetPolicy::Latest,
                Some(other) => {
                    return Err(Error::Config(format!(
                        "Unknown reset policy {other:?}, expected earliest or latest"
                    )));
                }
            },
            auth: env.sasl_auth()?,
            tls: env.tls()?,
            raw_config: env
                .pairs(ENV_KAFKA_RAW_CONFIG)?
                .into_iter()
                .collect(),
        };
        if kafka.brokers.is_empty() {
            return Err(Error::Config(format!("{ENV_KAFKA_BROKERS} is empty")));
        }
        if let Some(key) = kafka
            .raw_config
            .keys()
            .find(|key| RESERVED_RAW_CONFIG.contains(&key.as_str()))
        {
            return Err(Error::Config(format!(
                "{key} cannot be set through {ENV_KAFKA_RAW_CONFIG}, it is managed by the bridge"
            )));
        }

        let endpoint = env.required(ENV_HTTP_ENDPOINT)?;
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| Error::Config(format!("Invalid {ENV_HTTP_ENDPOINT} {endpoint:?}: {e}")))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "{ENV_HTTP_ENDPOINT} must be an http or https URL, got {endpoint}"
            )));
        }
        let http = HttpSinkConfig {
            endpoint,
            request_timeout: Duration::from_millis(
                env.parse(ENV_HTTP_REQUEST_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS)?,
            ),
            headers: env.pairs(ENV_HTTP_HEADERS)?,
            header_policy: HeaderPolicy {
                forward_record_metadata: env.parse(ENV_HTTP_FORWARD_RECORD_METADATA, false)?,
                propagate_record_headers: env.parse(ENV_HTTP_PROPAGATE_RECORD_HEADERS, false)?,
            },
        };

        let forwarder = ForwarderConfig {
            guarantee: env.parse(ENV_DELIVERY_GUARANTEE, DeliveryGuarantee::default())?,
            batch_size: env.parse(ENV_BATCH_SIZE, DEFAULT_BATCH_SIZE)?,
            max_poll_wait: Duration::from_millis(
                env.parse(ENV_MAX_POLL_WAIT_MS, DEFAULT_MAX_POLL_WAIT_MS)?,
            ),
            retry_budget: env.parse(ENV_RETRY_BUDGET, DEFAULT_RETRY_BUDGET)?,
            backoff: BackoffPolicy {
                initial_interval: Duration::from_millis(
                    env.parse(ENV_BACKOFF_INITIAL_MS, DEFAULT_BACKOFF_INITIAL_MS)?,
                ),
                max_interval: Duration::from_millis(
                    env.parse(ENV_BACKOFF_MAX_MS, DEFAULT_BACKOFF_MAX_MS)?,
                ),
                factor: env.parse(ENV_BACKOFF_FACTOR, DEFAULT_BACKOFF_FACTOR)?,
                jitter: env.parse(ENV_BACKOFF_JITTER, DEFAULT_BACKOFF_JITTER)?,
            },
            on_retries_exhausted: env
                .parse(ENV_ON_RETRIES_EXHAUSTED, ExhaustedStrategy::default())?,
            on_terminal_failure: env
                .parse(ENV_ON_TERMINAL_FAILURE, TerminalStrategy::default())?,
        };
        validate_forwarder(&forwarder)?;

        let dead_letter = match env.get(ENV_DEAD_LETTER_TOPIC) {
            Some(topic) => Some(DeadLetterConfig {
                brokers: match env.get(ENV_DEAD_LETTER_BROKERS) {
                    Some(brokers) => brokers.split(',').map(|b| b.trim().to_string()).collect(),
                    None => kafka.brokers.clone(),
                },
                topic: topic.to_string(),
                auth: kafka.auth.clone(),
                tls: kafka.tls.clone(),
            }),
            None if forwarder.uses_dead_letter() => {
                return Err(Error::Config(format!(
                    "{ENV_DEAD_LETTER_TOPIC} is required when a failure strategy is dead-letter"
                )));
            }
            None => None,
        };

        Ok(Settings {
            kafka,
            http,
            forwarder,
            dead_letter,
            metrics_port: env.parse(ENV_METRICS_PORT, DEFAULT_METRICS_PORT)?,
        })
    }

    pub fn kafka_source_config(&self) -> KafkaSourceConfig {
        KafkaSourceConfig {
            brokers: self.kafka.brokers.clone(),
            topic: self.kafka.topic.clone(),
            consumer_group: self.kafka.group_id.clone(),
            reset_policy: self.kafka.reset_policy,
            commit_on_revoke: self.forwarder.guarantee != DeliveryGuarantee::None,
            auth: self.kafka.auth.clone(),
            tls: self.kafka.tls.clone(),
            kafka_raw_config: self.kafka.raw_config.clone(),
        }
    }
}

fn validate_forwarder(config: &ForwarderConfig) -> Result<()> {
    if config.batch_size == 0 {
        return Err(Error::Config(format!("{ENV_BATCH_SIZE} must be at least 1")));
    }
    if config.retry_budget == 0 {
        return Err(Error::Config(format!("{ENV_RETRY_BUDGET} must be at least 1")));
    }
    if config.backoff.factor < 1.0 {
        return Err(Error::Config(format!("{ENV_BACKOFF_FACTOR} must be at least 1.0")));
    }
    if !(0.0..=1.0).contains(&config.backoff.jitter) {
        return Err(Error::Config(format!(
            "{ENV_BACKOFF_JITTER} must be between 0.0 and 1.0"
        )));
    }
    if config.backoff.initial_interval > config.backoff.max_interval {
        return Err(Error::Config(format!(
            "{ENV_BACKOFF_INITIAL_MS} must not exceed {ENV_BACKOFF_MAX_MS}"
        )));
    }
    Ok(())
}

struct Env(HashMap<String, String>);

impl Env {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.trim())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.get(key)
            .map(str::to_string)
            .ok_or_else(|| Error::Config(format!("{key} is not set")))
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|e| Error::Config(format!("Failed to parse {key}={value:?}: {e}"))),
        }
    }

    /// Parses `name=value` pairs separated by commas.
    fn pairs(&self, key: &str) -> Result<Vec<(String, String)>> {
        let Some(value) = self.get(key) else {
            return Ok(vec![]);
        };
        value
            .split(',')
            .filter(|pair| !pair.trim().is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((name, value)) if !name.trim().is_empty() => {
                    Ok((name.trim().to_string(), value.trim().to_string()))
                }
                _ => Err(Error::Config(format!(
                    "Invalid entry {pair:?} in {key}, expected name=value"
                ))),
            })
            .collect()
    }

    fn sasl_auth(&self) -> Result<Option<KafkaSaslAuth>> {
        let Some(mechanism) = self.get(ENV_KAFKA_SASL_MECHANISM) else {
            return Ok(None);
        };
        let username = self.required(ENV_KAFKA_SASL_USERNAME)?;
        let password = self.required(ENV_KAFKA_SASL_PASSWORD)?;
        match mechanism.to_uppercase().as_str() {
            "PLAIN" => Ok(Some(KafkaSaslAuth::Plain { username, password })),
            "SCRAM-SHA-256" => Ok(Some(KafkaSaslAuth::ScramSha256 { username, password })),
            "SCRAM-SHA-512" => Ok(Some(KafkaSaslAuth::ScramSha512 { username, password })),
            other => Err(Error::Config(format!(
                "Unsupported SASL mechanism {other:?}, expected PLAIN, SCRAM-SHA-256 or SCRAM-SHA-512"
            ))),
        }
    }

    fn tls(&self) -> Result<Option<TlsConfig>> {
        if !self.parse(ENV_KAFKA_TLS_ENABLED, false)? {
            return Ok(None);
        }
        let client_auth = match (
            self.get(ENV_KAFKA_TLS_CLIENT_CERT),
            self.get(ENV_KAFKA_TLS_CLIENT_KEY),
        ) {
            (Some(cert), Some(key)) => Some(TlsClientAuthCerts {
                client_cert: cert.to_string(),
                client_cert_private_key: key.to_string(),
            }),
            (None, None) => None,
            _ => {
                return Err(Error::Config(format!(
                    "{ENV_KAFKA_TLS_CLIENT_CERT} and {ENV_KAFKA_TLS_CLIENT_KEY} must be set together"
                )));
            }
        };
        Ok(Some(TlsConfig {
            insecure_skip_verify: self.parse(ENV_KAFKA_TLS_INSECURE_SKIP_VERIFY, false)?,
            ca_cert: self.get(ENV_KAFKA_TLS_CA_CERT).map(str::to_string),
            client_auth,
        }))
    }
}
