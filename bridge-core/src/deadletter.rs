//! Destination for records that could not be delivered and must not be silently discarded.

use bridge_kafka::sink::{DeadLetterConfig, DeadLetterMessage, DeadLetterProducer, new_producer};

use crate::error::{Error, Result};
use crate::message::Record;

pub(crate) const SOURCE_TOPIC_HEADER: &str = "x-bridge-source-topic";
pub(crate) const SOURCE_PARTITION_HEADER: &str = "x-bridge-source-partition";
pub(crate) const SOURCE_OFFSET_HEADER: &str = "x-bridge-source-offset";
pub(crate) const FAILURE_CAUSE_HEADER: &str = "x-bridge-failure-cause";

#[trait_variant::make(DeadLetterSink: Send)]
pub(crate) trait LocalDeadLetterSink {
    /// Stores the record with the reason it could not be delivered. Only returns once the record
    /// is durably stored.
    async fn route(&self, record: &Record, cause: &str) -> Result<()>;
}

/// Dead-letter topic on Kafka.
#[derive(Clone)]
pub(crate) struct KafkaDeadLetter {
    producer: DeadLetterProducer,
}

impl KafkaDeadLetter {
    pub(crate) fn new(config: DeadLetterConfig) -> Result<Self> {
        let producer = new_producer(config)
            .map_err(|e| Error::DeadLetter(format!("Creating dead-letter producer: {e}")))?;
        Ok(Self { producer })
    }
}

fn dead_letter_message(record: &Record, cause: &str) -> DeadLetterMessage {
    let mut headers = record.headers.clone();
    headers.insert(SOURCE_TOPIC_HEADER.to_string(), record.topic.clone());
    headers.insert(
        SOURCE_PARTITION_HEADER.to_string(),
        record.partition.to_string(),
    );
    headers.insert(SOURCE_OFFSET_HEADER.to_string(), record.offset.to_string());
    headers.insert(FAILURE_CAUSE_HEADER.to_string(), cause.to_string());
    DeadLetterMessage {
        key: record.key.clone(),
        payload: record.value.clone(),
        headers,
    }
}

impl DeadLetterSink for KafkaDeadLetter {
    async fn route(&self, record: &Record, cause: &str) -> Result<()> {
        self.producer
            .send(dead_letter_message(record, cause))
            .await
            .map_err(|e| {
                Error::DeadLetter(format!(
                    "Routing offset {} of partition {} to {}: {e}",
                    record.offset,
                    record.partition,
                    self.producer.topic()
                ))
            })
    }
}
