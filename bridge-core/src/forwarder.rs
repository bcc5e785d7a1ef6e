//! Per-partition forwarding loop: poll a batch, deliver each record in log order, and commit
//! according to the [DeliveryGuarantee].
//!
//! Every record goes through `fetched -> delivering -> {delivered | failed-retryable |
//! failed-terminal}`. Retryable failures are retried with exponential backoff until the retry
//! budget runs out. A record counts as handled once it is delivered, dead-lettered or dropped,
//! and only handled records are ever committed under at-least-once.

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{
    DeliveryGuarantee, ExhaustedStrategy, ForwarderConfig, HeaderPolicy, TerminalStrategy,
};
use crate::deadletter::DeadLetterSink;
use crate::error::{Error, Result};
use crate::message::{Assignment, DeliveryOutcome, Record};
use crate::metrics::{Labels, bridge_metrics, failure_labels, partition_labels};
use crate::retry::sleep_or_cancelled;
use crate::sink::{DeliverySink, record_headers};
use crate::source::LogSource;

/// How a partition task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PartitionExit {
    Shutdown,
    Revoked,
    /// A record exhausted its retries and the partition stopped in front of it.
    Blocked { offset: i64 },
}

/// What was done with a record that could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    DeadLetter,
    Drop,
    Block,
}

impl From<TerminalStrategy> for Disposition {
    fn from(value: TerminalStrategy) -> Self {
        match value {
            TerminalStrategy::DeadLetter => Disposition::DeadLetter,
            TerminalStrategy::Drop => Disposition::Drop,
        }
    }
}

impl From<ExhaustedStrategy> for Disposition {
    fn from(value: ExhaustedStrategy) -> Self {
        match value {
            ExhaustedStrategy::Block => Disposition::Block,
            ExhaustedStrategy::DeadLetter => Disposition::DeadLetter,
            ExhaustedStrategy::Drop => Disposition::Drop,
        }
    }
}

/// Final state of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Delivered,
    Disposed,
    Blocked,
    /// Shutdown began while the record was backing off.
    Interrupted,
}

pub(crate) struct PartitionForwarder<S, K, D> {
    assignment: Assignment,
    source: S,
    sink: K,
    dead_letter: Option<D>,
    config: ForwarderConfig,
    header_policy: HeaderPolicy,
    cln_token: CancellationToken,
    handled: Option<i64>,
    committed: Option<i64>,
    labels: Labels,
}

impl<S, K, D> PartitionForwarder<S, K, D>
where
    S: LogSource,
    K: DeliverySink,
    D: DeadLetterSink,
{
    pub(crate) fn new(
        assignment: Assignment,
        source: S,
        sink: K,
        dead_letter: Option<D>,
        config: ForwarderConfig,
        header_policy: HeaderPolicy,
        cln_token: CancellationToken,
    ) -> Self {
        Self {
            assignment,
            source,
            sink,
            dead_letter,
            config,
            header_policy,
            cln_token,
            handled: None,
            committed: None,
            labels: partition_labels(assignment.partition),
        }
    }

    pub(crate) async fn run(mut self) -> Result<PartitionExit> {
        let partition = self.assignment.partition;
        info!(
            assignment = %self.assignment,
            guarantee = %self.config.guarantee,
            "Starting partition forwarder"
        );
        bridge_metrics()
            .blocked_partitions
            .get_or_create(&self.labels)
            .set(0);

        let mut reconnect = self.config.backoff.delays(None);
        let exit = loop {
            if self.cln_token.is_cancelled() {
                break PartitionExit::Shutdown;
            }

            let polled = tokio::select! {
                biased;
                _ = self.cln_token.cancelled() => break PartitionExit::Shutdown,
                polled = self.source.poll(self.assignment, self.config.max_poll_wait) => polled,
            };
            let records = match polled {
                Ok(records) => {
                    reconnect.reset();
                    records
                }
                Err(Error::Revoked(_)) => break PartitionExit::Revoked,
                Err(Error::Connection(e)) => {
                    let delay = reconnect
                        .next()
                        .unwrap_or(self.config.backoff.max_interval);
                    warn!(partition, error = e, ?delay, "Polling failed, backing off");
                    if !sleep_or_cancelled(delay, &self.cln_token).await {
                        break PartitionExit::Shutdown;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            if records.is_empty() {
                continue;
            }

            match self.forward_batch(records).await {
                Ok(None) => {}
                Ok(Some(exit)) => break exit,
                Err(Error::Revoked(_)) => break PartitionExit::Revoked,
                Err(e) => return Err(e),
            }
        };

        let exit = match self.finish(exit).await {
            Err(Error::Revoked(_)) => PartitionExit::Revoked,
            result => result?,
        };
        info!(partition, ?exit, committed = ?self.committed, "Stopped partition forwarder");
        Ok(exit)
    }

    async fn finish(&mut self, exit: PartitionExit) -> Result<PartitionExit> {
        match exit {
            PartitionExit::Shutdown => self.flush().await?,
            PartitionExit::Blocked { offset } => {
                self.flush().await?;
                self.source.pause(self.assignment).await?;
                bridge_metrics()
                    .blocked_partitions
                    .get_or_create(&self.labels)
                    .set(1);
                error!(
                    partition = self.assignment.partition,
                    offset, "Partition blocked, consuming stops until it is reassigned"
                );
            }
            // Handled offsets are committed by the rebalance itself.
            PartitionExit::Revoked => {}
        }
        Ok(exit)
    }

    /// Resolves one polled batch. Returns the exit if the partition must stop.
    async fn forward_batch(&mut self, records: Vec<Record>) -> Result<Option<PartitionExit>> {
        let read_bytes: usize = records.iter().map(|r| r.value.len()).sum();
        bridge_metrics()
            .read_total
            .get_or_create(&self.labels)
            .inc_by(records.len() as u64);
        bridge_metrics()
            .read_bytes_total
            .get_or_create(&self.labels)
            .inc_by(read_bytes as u64);

        if self.config.guarantee == DeliveryGuarantee::AtMostOnce {
            if let Some(last) = records.last() {
                self.commit(last.offset).await?;
            }
        }

        for record in records {
            // The rest of the batch is redelivered after a restart, unless it is already committed.
            if self.cln_token.is_cancelled()
                && self.config.guarantee != DeliveryGuarantee::AtMostOnce
            {
                return Ok(Some(PartitionExit::Shutdown));
            }

            let offset = record.offset;
            match self.resolve(record).await? {
                Resolution::Delivered | Resolution::Disposed => {
                    self.source.mark_handled(self.assignment, offset).await?;
                    self.handled = Some(offset);
                }
                Resolution::Blocked => return Ok(Some(PartitionExit::Blocked { offset })),
                Resolution::Interrupted => return Ok(Some(PartitionExit::Shutdown)),
            }
        }

        if self.config.guarantee == DeliveryGuarantee::AtLeastOnce {
            self.flush().await?;
        }
        Ok(None)
    }

    /// Delivers one record, retrying as the guarantee allows, and applies the disposition when
    /// it cannot be delivered.
    async fn resolve(&mut self, record: Record) -> Result<Resolution> {
        let headers = record_headers(&record, &self.header_policy);
        let retries_allowed = self.config.guarantee != DeliveryGuarantee::AtMostOnce;
        let mut delays = self
            .config
            .backoff
            .delays(Some(self.config.retry_budget.saturating_sub(1)));
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let start = Instant::now();
            let outcome = self.sink.send(record.value.clone(), &headers).await;
            bridge_metrics()
                .delivery_attempts_total
                .get_or_create(&self.labels)
                .inc();
            bridge_metrics()
                .delivery_time
                .get_or_create(&self.labels)
                .observe(start.elapsed().as_micros() as f64);

            let (retryable, cause) = match outcome {
                DeliveryOutcome::Success => {
                    bridge_metrics()
                        .delivered_total
                        .get_or_create(&self.labels)
                        .inc();
                    debug!(
                        partition = record.partition,
                        offset = record.offset,
                        attempt,
                        "Delivered record"
                    );
                    return Ok(Resolution::Delivered);
                }
                DeliveryOutcome::Failure { retryable, cause } => (retryable, cause),
            };
            bridge_metrics()
                .delivery_failures_total
                .get_or_create(&failure_labels(record.partition, retryable))
                .inc();

            if !retryable || !retries_allowed {
                let disposition = self.config.on_terminal_failure.into();
                return self.dispose(&record, disposition, &cause, attempt).await;
            }

            let Some(delay) = delays.next() else {
                let disposition = self.config.on_retries_exhausted.into();
                return self.dispose(&record, disposition, &cause, attempt).await;
            };
            warn!(
                partition = record.partition,
                offset = record.offset,
                attempt,
                cause,
                ?delay,
                "Delivery failed, retrying"
            );
            if !sleep_or_cancelled(delay, &self.cln_token).await {
                warn!(
                    partition = record.partition,
                    offset = record.offset,
                    "Cancellation received while backing off, record stays uncommitted"
                );
                return Ok(Resolution::Interrupted);
            }
        }
    }

    async fn dispose(
        &mut self,
        record: &Record,
        disposition: Disposition,
        cause: &str,
        attempts: u32,
    ) -> Result<Resolution> {
        match disposition {
            Disposition::Drop => {
                error!(
                    partition = record.partition,
                    offset = record.offset,
                    attempts,
                    cause,
                    "Dropping undeliverable record"
                );
                bridge_metrics()
                    .dropped_total
                    .get_or_create(&self.labels)
                    .inc();
                Ok(Resolution::Disposed)
            }
            Disposition::DeadLetter => {
                let Some(dead_letter) = &self.dead_letter else {
                    return Err(Error::Forwarder(
                        "dead-letter disposition configured without a dead-letter destination"
                            .to_string(),
                    ));
                };
                dead_letter.route(record, cause).await?;
                warn!(
                    partition = record.partition,
                    offset = record.offset,
                    attempts,
                    cause,
                    "Routed undeliverable record to dead-letter"
                );
                bridge_metrics()
                    .dead_lettered_total
                    .get_or_create(&self.labels)
                    .inc();
                Ok(Resolution::Disposed)
            }
            Disposition::Block => {
                error!(
                    partition = record.partition,
                    offset = record.offset,
                    attempts,
                    cause,
                    "Retries exhausted, blocking partition"
                );
                Ok(Resolution::Blocked)
            }
        }
    }

    async fn commit(&mut self, offset: i64) -> Result<()> {
        if self.config.guarantee == DeliveryGuarantee::None
            || self.committed.is_some_and(|committed| offset <= committed)
        {
            return Ok(());
        }
        self.source.commit(self.assignment, offset).await?;
        self.committed = Some(offset);
        bridge_metrics()
            .commit_total
            .get_or_create(&self.labels)
            .inc();
        Ok(())
    }

    /// Commits the highest handled offset.
    async fn flush(&mut self) -> Result<()> {
        match self.handled {
            Some(handled) => self.commit(handled).await,
            None => Ok(()),
        }
    }
}
