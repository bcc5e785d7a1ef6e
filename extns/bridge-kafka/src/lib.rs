//! Kafka plumbing for the bridge.
//!
//! [source::KafkaSource] is a consumer-group member that hands out records per partition and owns
//! the group's offset bookkeeping ([GroupState]). [sink::DeadLetterProducer] writes records that
//! could not be delivered to a dead-letter topic.

use std::collections::HashMap;

use rdkafka::config::ClientConfig;
use tracing::warn;

pub mod sink;
pub mod source;
mod state;

pub use state::{GroupState, PartitionState};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Committing offset {offset} of partition {partition} - {error}")]
    Commit {
        partition: i32,
        offset: i64,
        error: String,
    },

    /// The partition is not (or no longer) owned under the given assignment.
    #[error("Partition {0} is not assigned to this consumer")]
    NotAssigned(i32),

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("{0}")]
    Other(String),
}

/// One ownership period of a partition. The generation changes on every assignment, so a handle
/// kept by a superseded task is told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Assignment {
    pub partition: i32,
    pub generation: u64,
}

/// Where to start reading a partition that has no committed offset for the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetPolicy {
    #[default]
    Earliest,
    Latest,
}

impl ResetPolicy {
    fn as_config_value(self) -> &'static str {
        match self {
            ResetPolicy::Earliest => "earliest",
            ResetPolicy::Latest => "latest",
        }
    }
}

/// SASL credentials passed through to librdkafka.
#[derive(Debug, Clone, PartialEq)]
pub enum KafkaSaslAuth {
    Plain { username: String, password: String },
    ScramSha256 { username: String, password: String },
    ScramSha512 { username: String, password: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    pub ca_cert: Option<String>,
    pub client_auth: Option<TlsClientAuthCerts>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsClientAuthCerts {
    pub client_cert: String,
    pub client_cert_private_key: String,
}

/// Applies SASL/TLS settings and any raw librdkafka overrides on top of a client config.
pub(crate) fn apply_client_settings(
    client_config: &mut ClientConfig,
    auth: Option<&KafkaSaslAuth>,
    tls: Option<&TlsConfig>,
    raw_config: &HashMap<String, String>,
) {
    let protocol = match (auth.is_some(), tls.is_some()) {
        (true, true) => "SASL_SSL",
        (true, false) => "SASL_PLAINTEXT",
        (false, true) => "SSL",
        (false, false) => "PLAINTEXT",
    };
    client_config.set("security.protocol", protocol);

    if let Some(auth) = auth {
        let (mechanism, username, password) = match auth {
            KafkaSaslAuth::Plain { username, password } => ("PLAIN", username, password),
            KafkaSaslAuth::ScramSha256 { username, password } => {
                ("SCRAM-SHA-256", username, password)
            }
            KafkaSaslAuth::ScramSha512 { username, password } => {
                ("SCRAM-SHA-512", username, password)
            }
        };
        client_config
            .set("sasl.mechanisms", mechanism)
            .set("sasl.username", username)
            .set("sasl.password", password);
    }

    if let Some(tls) = tls {
        if tls.insecure_skip_verify {
            warn!(
                "'insecureSkipVerify' is set to true, certificate validation will not be performed when connecting to Kafka server"
            );
            client_config
                .set("enable.ssl.certificate.verification", "false")
                .set("ssl.endpoint.identification.algorithm", "none");
        }
        if let Some(ca_cert) = &tls.ca_cert {
            client_config.set("ssl.ca.location", ca_cert);
        }
        if let Some(client_auth) = &tls.client_auth {
            client_config
                .set("ssl.certificate.location", &client_auth.client_cert)
                .set("ssl.key.location", &client_auth.client_cert_private_key);
        }
    }

    for (key, value) in raw_config {
        client_config.set(key, value);
    }
}
