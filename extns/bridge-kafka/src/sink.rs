use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::ClientConfig;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::error;

use crate::{Error, KafkaSaslAuth, Result, TlsConfig, apply_client_settings};

/// How long a dead-letter produce may wait for the broker's acknowledgement.
const PRODUCE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub auth: Option<KafkaSaslAuth>,
    pub tls: Option<TlsConfig>,
}

/// A record as it is written to the dead-letter topic.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterMessage {
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
}

/// Producer for the dead-letter topic. Clones share the underlying librdkafka producer.
#[derive(Clone)]
pub struct DeadLetterProducer {
    topic: String,
    producer: FutureProducer,
}

pub fn new_producer(config: DeadLetterConfig) -> Result<DeadLetterProducer> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.brokers.join(","))
        .set("message.timeout.ms", PRODUCE_TIMEOUT.as_millis().to_string())
        .set("enable.idempotence", "true")
        .set("client.id", "kafka-http-bridge-dead-letter")
        .set_log_level(RDKafkaLogLevel::Warning);
    apply_client_settings(
        &mut client_config,
        config.auth.as_ref(),
        config.tls.as_ref(),
        &HashMap::new(),
    );

    let producer: FutureProducer = client_config
        .create()
        .map_err(|e| Error::Kafka(format!("Failed to create producer: {e}")))?;

    Ok(DeadLetterProducer {
        topic: config.topic,
        producer,
    })
}

impl DeadLetterProducer {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Produces one message and waits for the broker to acknowledge it.
    pub async fn send(&self, message: DeadLetterMessage) -> Result<()> {
        let mut headers = OwnedHeaders::new_with_capacity(message.headers.len());
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key,
                value: Some(value),
            });
        }

        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&self.topic)
            .headers(headers)
            .payload(message.payload.as_ref());
        if let Some(key) = &message.key {
            record = record.key(key.as_ref());
        }

        self.producer
            .send(record, PRODUCE_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(e, _)| {
                error!(?e, topic = self.topic, "Producing to dead-letter topic");
                Error::Kafka(format!("Producing to dead-letter topic {}: {e:?}", self.topic))
            })
    }
}

#[cfg(all(test, feature = "kafka-tests"))]
mod tests {
    use std::time::Duration;

    use rdkafka::consumer::{Consumer, StreamConsumer};
    use rdkafka::message::{Headers, Message};

    use super::*;

    #[tokio::test]
    async fn test_dead_letter_roundtrip() {
        let topic = format!("bridge-dlq-{}", uuid::Uuid::new_v4());
        let producer = new_producer(DeadLetterConfig {
            brokers: vec!["localhost:9092".to_string()],
            topic: topic.clone(),
            auth: None,
            tls: None,
        })
        .unwrap();

        producer
            .send(DeadLetterMessage {
                key: Some(Bytes::from_static(b"key")),
                payload: Bytes::from_static(b"rejected"),
                headers: HashMap::from([(
                    "x-bridge-failure-cause".to_string(),
                    "400 Bad Request".to_string(),
                )]),
            })
            .await
            .unwrap();

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .set("group.id", format!("{topic}-reader"))
            .set("auto.offset.reset", "earliest")
            .create()
            .unwrap();
        consumer.subscribe(&[&topic]).unwrap();
        let message = tokio::time::timeout(Duration::from_secs(30), consumer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload(), Some(&b"rejected"[..]));
        assert_eq!(message.key(), Some(&b"key"[..]));
        let cause = message
            .headers()
            .unwrap()
            .iter()
            .find(|h| h.key == "x-bridge-failure-cause")
            .and_then(|h| h.value)
            .unwrap();
        assert_eq!(cause, b"400 Bad Request");
    }
}
