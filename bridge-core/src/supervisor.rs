//! Runs one [PartitionForwarder] per owned partition and follows the group's rebalances.
//!
//! A partition is forwarded by at most one task at a time. When a partition comes back before
//! the task of its previous assignment finished, the new assignment waits for it. A fatal error
//! of any task stops every task.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ForwarderConfig, HeaderPolicy};
use crate::deadletter::DeadLetterSink;
use crate::error::{Error, Result};
use crate::forwarder::{PartitionExit, PartitionForwarder};
use crate::message::Assignment;
use crate::sink::DeliverySink;
use crate::source::{GroupEvent, LogSource};

type TaskResult = (Assignment, Result<PartitionExit>);

pub(crate) struct Supervisor<S, K, D> {
    source: S,
    sink: K,
    dead_letter: Option<D>,
    config: ForwarderConfig,
    header_policy: HeaderPolicy,
    events: UnboundedReceiver<GroupEvent>,
    cln_token: CancellationToken,
}

/// Partition task bookkeeping.
#[derive(Default)]
struct Partitions {
    running: HashMap<i32, (Assignment, CancellationToken)>,
    /// Assignments waiting for the previous task of the same partition to finish.
    pending: HashMap<i32, Assignment>,
}

impl<S, K, D> Supervisor<S, K, D>
where
    S: LogSource + Clone + Send + Sync + 'static,
    K: DeliverySink + Clone + Send + Sync + 'static,
    D: DeadLetterSink + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        source: S,
        sink: K,
        dead_letter: Option<D>,
        config: ForwarderConfig,
        header_policy: HeaderPolicy,
        events: UnboundedReceiver<GroupEvent>,
        cln_token: CancellationToken,
    ) -> Self {
        Self {
            source,
            sink,
            dead_letter,
            config,
            header_policy,
            events,
            cln_token,
        }
    }

    /// Runs until the token is cancelled or a partition task fails fatally. Waits for every
    /// partition task before returning.
    pub(crate) async fn run(mut self) -> Result<()> {
        let tasks_token = self.cln_token.child_token();
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut partitions = Partitions::default();

        let mut result = loop {
            tokio::select! {
                biased;
                _ = self.cln_token.cancelled() => {
                    info!("Cancellation received, stopping partition forwarders");
                    break Ok(());
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let (assignment, exit) = match joined {
                        Ok(task_result) => task_result,
                        Err(e) => break Err(Error::Forwarder(format!("Partition task failed: {e}"))),
                    };
                    if let Err(e) = exit {
                        error!(%assignment, ?e, "Partition forwarder failed");
                        break Err(e);
                    }
                    partitions.finished(assignment);
                    if let Some(next) = partitions.pending.remove(&assignment.partition) {
                        self.spawn(&mut tasks, &mut partitions, &tasks_token, next);
                    }
                }
                event = self.events.recv() => match event {
                    Some(GroupEvent::Assigned(assignments)) => {
                        for assignment in assignments {
                            if let Some((previous, token)) = partitions.running.get(&assignment.partition) {
                                info!(%assignment, %previous, "Waiting for the previous forwarder of the partition");
                                token.cancel();
                                partitions.pending.insert(assignment.partition, assignment);
                            } else {
                                self.spawn(&mut tasks, &mut partitions, &tasks_token, assignment);
                            }
                        }
                    }
                    Some(GroupEvent::Revoked(revoked)) => {
                        for partition in revoked {
                            partitions.pending.remove(&partition);
                            if let Some((assignment, token)) = partitions.running.get(&partition) {
                                info!(%assignment, "Partition revoked, stopping its forwarder");
                                token.cancel();
                            }
                        }
                    }
                    None => break Err(Error::Source("Consumer group event stream closed".to_string())),
                },
            }
        };

        tasks_token.cancel();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((assignment, Err(e))) => {
                    error!(%assignment, ?e, "Partition forwarder failed during shutdown");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(e) => {
                    warn!(?e, "Partition task failed during shutdown");
                    if result.is_ok() {
                        result = Err(Error::Forwarder(format!("Partition task failed: {e}")));
                    }
                }
            }
        }
        result
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<TaskResult>,
        partitions: &mut Partitions,
        tasks_token: &CancellationToken,
        assignment: Assignment,
    ) {
        let token = tasks_token.child_token();
        let forwarder = PartitionForwarder::new(
            assignment,
            self.source.clone(),
            self.sink.clone(),
            self.dead_letter.clone(),
            self.config.clone(),
            self.header_policy,
            token.clone(),
        );
        partitions
            .running
            .insert(assignment.partition, (assignment, token));
        tasks.spawn(async move { (assignment, forwarder.run().await) });
    }
}

impl Partitions {
    fn finished(&mut self, assignment: Assignment) {
        if let Some((running, _)) = self.running.get(&assignment.partition) {
            if *running == assignment {
                self.running.remove(&assignment.partition);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bridge_kafka::ResetPolicy;

    use super::*;
    use crate::config::DeliveryGuarantee;
    use crate::deadletter::test_utils::RecordingDeadLetter;
    use crate::message::DeliveryOutcome;
    use crate::retry::BackoffPolicy;
    use crate::sink::test_utils::ScriptedSink;
    use crate::source::test_utils::{Entry, InMemoryLog};

    fn config() -> ForwarderConfig {
        ForwarderConfig {
            guarantee: DeliveryGuarantee::AtLeastOnce,
            batch_size: 10,
            max_poll_wait: Duration::from_millis(10),
            retry_budget: 3,
            backoff: BackoffPolicy {
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(5),
                factor: 2.0,
                jitter: 0.0,
            },
            ..Default::default()
        }
    }

    fn committed(partition: i32, offset: i64) -> impl Fn(&[Entry]) -> bool {
        move |entries| entries.contains(&Entry::Commit { partition, offset })
    }

    fn start(
        log: &InMemoryLog,
        events: UnboundedReceiver<GroupEvent>,
        cln_token: &CancellationToken,
    ) -> (ScriptedSink, tokio::task::JoinHandle<Result<()>>) {
        start_with(log, events, cln_token, config())
    }

    fn start_with(
        log: &InMemoryLog,
        events: UnboundedReceiver<GroupEvent>,
        cln_token: &CancellationToken,
        config: ForwarderConfig,
    ) -> (ScriptedSink, tokio::task::JoinHandle<Result<()>>) {
        let journal = log.journal();
        let sink = ScriptedSink::new(journal.clone());
        let supervisor = Supervisor::new(
            log.clone(),
            sink.clone(),
            Some(RecordingDeadLetter::new(journal)),
            config,
            HeaderPolicy::default(),
            events,
            cln_token.clone(),
        );
        (sink, tokio::spawn(supervisor.run()))
    }

    async fn join(handle: tokio::task::JoinHandle<Result<()>>) -> Result<()> {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor did not stop")
            .expect("supervisor panicked")
    }

    #[tokio::test]
    async fn test_partitions_forwarded_independently_in_order() {
        let (log, events) = InMemoryLog::new(ResetPolicy::Earliest, 10);
        for offset in 0..5 {
            log.append(0, offset, &format!("p0-{offset}"));
            log.append(1, offset, &format!("p1-{offset}"));
        }
        let cln_token = CancellationToken::new();
        let (sink, handle) = start(&log, events, &cln_token);
        // A stuck record on partition 1 must not hold back partition 0.
        sink.script(
            "p1-2",
            vec![DeliveryOutcome::retryable("503"), DeliveryOutcome::retryable("503")],
        );
        log.assign(&[0, 1]);

        let journal = log.journal();
        journal.wait_for(committed(0, 4)).await;
        journal.wait_for(committed(1, 4)).await;
        cln_token.cancel();
        assert_eq!(join(handle).await, Ok(()));

        for partition in ["p0", "p1"] {
            let attempted: Vec<String> = journal
                .attempted()
                .into_iter()
                .filter(|p| p.starts_with(partition))
                .collect();
            let mut expected: Vec<String> = (0..5).map(|o| format!("{partition}-{o}")).collect();
            if partition == "p1" {
                expected.splice(2..2, ["p1-2".to_string(), "p1-2".to_string()]);
            }
            assert_eq!(attempted, expected);
        }
    }

    #[tokio::test]
    async fn test_fatal_error_stops_supervisor() {
        let (log, events) = InMemoryLog::new(ResetPolicy::Earliest, 10);
        log.append(0, 0, "m0");
        log.append(1, 0, "n0");
        log.fail_commits();
        let cln_token = CancellationToken::new();
        let (_sink, handle) = start(&log, events, &cln_token);
        log.assign(&[0, 1]);

        let result = join(handle).await;
        assert!(matches!(result, Err(Error::Commit(_))), "{result:?}");
        assert!(!cln_token.is_cancelled());
        assert_eq!(log.committed(0), None);
        assert_eq!(log.committed(1), None);
    }

    #[tokio::test]
    async fn test_reassigned_partition_resumes_after_commit() {
        let (log, events) = InMemoryLog::new(ResetPolicy::Earliest, 10);
        log.append(0, 0, "m0");
        log.append(0, 1, "m1");
        let cln_token = CancellationToken::new();
        let (_sink, handle) = start(&log, events, &cln_token);
        let journal = log.journal();

        log.assign(&[0]);
        journal.wait_for(committed(0, 1)).await;
        log.revoke(&[0]);
        log.append(0, 2, "m2");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(journal.attempts("m2"), 0);

        log.assign(&[0]);
        journal.wait_for(committed(0, 2)).await;
        cln_token.cancel();
        assert_eq!(join(handle).await, Ok(()));
        assert_eq!(journal.attempted(), vec!["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn test_blocked_partition_does_not_stop_others() {
        let (log, events) = InMemoryLog::new(ResetPolicy::Earliest, 10);
        log.append(0, 0, "m0");
        log.append(1, 0, "n0");
        log.append(1, 1, "n1");
        let cln_token = CancellationToken::new();
        let (sink, handle) = start(&log, events, &cln_token);
        sink.script("m0", vec![DeliveryOutcome::retryable("503"); 3]);
        log.assign(&[0, 1]);

        let journal = log.journal();
        journal.wait_for(committed(1, 1)).await;
        journal
            .wait_for(|entries| {
                entries
                    .iter()
                    .filter(|e| matches!(e, Entry::Attempt { payload } if payload == "m0"))
                    .count()
                    == 3
            })
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(log.is_paused(0));
        assert_eq!(log.committed(0), None);
        assert!(!handle.is_finished());

        cln_token.cancel();
        assert_eq!(join(handle).await, Ok(()));
    }

    #[tokio::test]
    async fn test_revocation_commits_handled_offsets_unless_none() {
        for (guarantee, expected) in [
            (DeliveryGuarantee::AtLeastOnce, Some(1)),
            (DeliveryGuarantee::None, None),
        ] {
            let (log, events) = InMemoryLog::new(ResetPolicy::Earliest, 10);
            let log = log.with_commit_on_revoke(guarantee != DeliveryGuarantee::None);
            for offset in 0..5 {
                log.append(0, offset, &format!("m{offset}"));
            }
            let mut config = config();
            config.guarantee = guarantee;
            config.backoff.initial_interval = Duration::from_secs(60);
            config.backoff.max_interval = Duration::from_secs(60);

            let cln_token = CancellationToken::new();
            let (sink, handle) = start_with(&log, events, &cln_token, config);
            // m2 backs off in the middle of the batch, so m0 and m1 are handled but not committed.
            sink.script("m2", vec![DeliveryOutcome::retryable("503")]);
            log.assign(&[0]);

            let journal = log.journal();
            journal
                .wait_for(|entries| entries.contains(&Entry::Attempt { payload: "m2".into() }))
                .await;
            assert_eq!(log.committed(0), None, "{guarantee}");
            assert_eq!(log.handled(0), Some(1), "{guarantee}");

            log.revoke(&[0]);
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_eq!(log.committed(0), expected, "{guarantee}");
            assert_eq!(journal.attempts("m2"), 1, "{guarantee}");
            assert_eq!(journal.attempts("m3"), 0, "{guarantee}");

            cln_token.cancel();
            assert_eq!(join(handle).await, Ok(()), "{guarantee}");
            assert_eq!(log.committed(0), expected, "{guarantee}");
        }
    }
}
