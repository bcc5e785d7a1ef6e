use std::collections::HashMap;

use bytes::Bytes;

use crate::config::HeaderPolicy;
use crate::message::{DeliveryOutcome, Record};

/// POSTs payloads to the configured endpoint.
pub(crate) mod http;

#[cfg(test)]
pub(crate) mod test_utils;

pub(crate) const TOPIC_HEADER: &str = "X-Kafka-Topic";
pub(crate) const PARTITION_HEADER: &str = "X-Kafka-Partition";
pub(crate) const OFFSET_HEADER: &str = "X-Kafka-Offset";
pub(crate) const KEY_HEADER: &str = "X-Kafka-Key";
pub(crate) const TIMESTAMP_HEADER: &str = "X-Kafka-Timestamp";

const METADATA_HEADERS: [&str; 5] = [
    TOPIC_HEADER,
    PARTITION_HEADER,
    OFFSET_HEADER,
    KEY_HEADER,
    TIMESTAMP_HEADER,
];

/// Delivers one payload per call and classifies the outcome. Implementations make exactly one
/// attempt per call, retrying is up to the caller.
#[trait_variant::make(DeliverySink: Send)]
pub(crate) trait LocalDeliverySink {
    async fn send(&self, payload: Bytes, headers: &HashMap<String, String>) -> DeliveryOutcome;
}

/// Per-record request headers allowed by the policy. While metadata is forwarded, record headers
/// named like a metadata header in any letter case are left out, HTTP header names being case
/// insensitive.
pub(crate) fn record_headers(record: &Record, policy: &HeaderPolicy) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if policy.propagate_record_headers {
        headers.extend(
            record
                .headers
                .iter()
                .filter(|(name, _)| {
                    !policy.forward_record_metadata
                        || !METADATA_HEADERS
                            .iter()
                            .any(|reserved| reserved.eq_ignore_ascii_case(name))
                })
                .map(|(name, value)| (name.clone(), value.clone())),
        );
    }
    if policy.forward_record_metadata {
        headers.insert(TOPIC_HEADER.to_string(), record.topic.clone());
        headers.insert(PARTITION_HEADER.to_string(), record.partition.to_string());
        headers.insert(OFFSET_HEADER.to_string(), record.offset.to_string());
        if let Some(key) = &record.key {
            headers.insert(
                KEY_HEADER.to_string(),
                String::from_utf8_lossy(key).to_string(),
            );
        }
        if let Some(timestamp) = record.timestamp {
            headers.insert(
                TIMESTAMP_HEADER.to_string(),
                timestamp.timestamp_millis().to_string(),
            );
        }
    }
    headers
}
