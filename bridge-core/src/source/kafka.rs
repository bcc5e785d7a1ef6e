use std::time::Duration;

use bridge_kafka::source::{KafkaRecord, KafkaSource, KafkaSourceConfig, PartitionEvent};
use chrono::DateTime;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::Error;
use crate::message::{Assignment, Record};
use crate::source::{GroupEvent, LogSource};

impl From<KafkaRecord> for Record {
    fn from(record: KafkaRecord) -> Self {
        Record {
            topic: record.topic,
            partition: record.partition,
            offset: record.offset,
            key: record.key,
            value: record.value,
            headers: record.headers,
            timestamp: record.timestamp.and_then(DateTime::from_timestamp_millis),
        }
    }
}

impl From<PartitionEvent> for GroupEvent {
    fn from(event: PartitionEvent) -> Self {
        match event {
            PartitionEvent::Assigned(assignments) => {
                GroupEvent::Assigned(assignments.into_iter().map(Assignment::from).collect())
            }
            PartitionEvent::Revoked(partitions) => GroupEvent::Revoked(partitions),
        }
    }
}

impl From<bridge_kafka::Error> for Error {
    fn from(value: bridge_kafka::Error) -> Self {
        match value {
            bridge_kafka::Error::Connection { server, error } => {
                Error::Connection(format!("{server} - {error}"))
            }
            bridge_kafka::Error::Commit { .. } => Error::Commit(value.to_string()),
            bridge_kafka::Error::NotAssigned(partition) => Error::Revoked(partition),
            bridge_kafka::Error::Kafka(e) | bridge_kafka::Error::Other(e) => Error::Source(e),
        }
    }
}

/// Joins the consumer group and returns the source with its stream of [GroupEvent]s.
pub(crate) async fn new_kafka_source(
    config: KafkaSourceConfig,
    batch_size: usize,
) -> crate::Result<(KafkaSource, mpsc::UnboundedReceiver<GroupEvent>)> {
    let topic = config.topic.clone();
    let (source, mut partition_events) = KafkaSource::connect(config, batch_size).await?;
    info!(topic, "Joined consumer group");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = partition_events.recv().await {
            if events_tx.send(GroupEvent::from(event)).is_err() {
                break;
            }
        }
    });
    Ok((source, events_rx))
}

impl LogSource for KafkaSource {
    async fn poll(&self, assignment: Assignment, max_wait: Duration) -> crate::Result<Vec<Record>> {
        let records = KafkaSource::poll(self, assignment.into(), max_wait).await?;
        Ok(records.into_iter().map(Record::from).collect())
    }

    async fn commit(&self, assignment: Assignment, offset: i64) -> crate::Result<()> {
        Ok(KafkaSource::commit(self, assignment.into(), offset).await?)
    }

    async fn mark_handled(&self, assignment: Assignment, offset: i64) -> crate::Result<()> {
        Ok(KafkaSource::mark_handled(self, assignment.into(), offset).await?)
    }

    async fn pause(&self, assignment: Assignment) -> crate::Result<()> {
        Ok(KafkaSource::pause(self, assignment.into()).await?)
    }
}
