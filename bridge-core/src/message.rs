use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A record read from the log. Immutable once handed to the forwarder.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Record {
    pub(crate) topic: String,
    pub(crate) partition: i32,
    pub(crate) offset: i64,
    pub(crate) key: Option<Bytes>,
    pub(crate) value: Bytes,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) timestamp: Option<DateTime<Utc>>,
}

/// Result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeliveryOutcome {
    Success,
    Failure { retryable: bool, cause: String },
}

impl DeliveryOutcome {
    pub(crate) fn retryable(cause: impl Into<String>) -> Self {
        DeliveryOutcome::Failure {
            retryable: true,
            cause: cause.into(),
        }
    }

    pub(crate) fn terminal(cause: impl Into<String>) -> Self {
        DeliveryOutcome::Failure {
            retryable: false,
            cause: cause.into(),
        }
    }
}

/// One ownership period of a partition, see [bridge_kafka::Assignment].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Assignment {
    pub(crate) partition: i32,
    pub(crate) generation: u64,
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.generation)
    }
}

impl From<bridge_kafka::Assignment> for Assignment {
    fn from(value: bridge_kafka::Assignment) -> Self {
        Self {
            partition: value.partition,
            generation: value.generation,
        }
    }
}

impl From<Assignment> for bridge_kafka::Assignment {
    fn from(value: Assignment) -> Self {
        Self {
            partition: value.partition,
            generation: value.generation,
        }
    }
}
