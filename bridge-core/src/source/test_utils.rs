use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bridge_kafka::ResetPolicy;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::message::{Assignment, Record};
use crate::source::{GroupEvent, LogSource};

/// Observable side effects, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Entry {
    Commit { partition: i32, offset: i64 },
    Attempt { payload: String },
    DeadLetter { payload: String, cause: String },
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<Entry>>>);

impl Journal {
    pub(crate) fn push(&self, entry: Entry) {
        self.0.lock().push(entry);
    }

    pub(crate) fn entries(&self) -> Vec<Entry> {
        self.0.lock().clone()
    }

    pub(crate) fn attempts(&self, payload: &str) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|e| matches!(e, Entry::Attempt { payload: p } if p == payload))
            .count()
    }

    pub(crate) fn attempted(&self) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| match e {
                Entry::Attempt { payload } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn commits(&self) -> Vec<(i32, i64)> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| match e {
                Entry::Commit { partition, offset } => Some((*partition, *offset)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn dead_letters(&self) -> Vec<(String, String)> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| match e {
                Entry::DeadLetter { payload, cause } => Some((payload.clone(), cause.clone())),
                _ => None,
            })
            .collect()
    }

    /// Waits until `condition` holds for the journal, panicking after five seconds.
    pub(crate) async fn wait_for(&self, condition: impl Fn(&[Entry]) -> bool) {
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if condition(&self.0.lock()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "timed out waiting, journal: {:?}", self.entries());
    }
}

/// Broker side of the log, shared across restarts.
struct Store {
    topic: String,
    partitions: BTreeMap<i32, Vec<Record>>,
    committed: HashMap<i32, i64>,
    fail_commits: bool,
    next_generation: u64,
}

/// Consumer side of the log, lost on restart.
#[derive(Default)]
struct Session {
    generations: HashMap<i32, u64>,
    position: HashMap<i32, usize>,
    consumed: HashMap<i32, i64>,
    handled: HashMap<i32, i64>,
    paused: HashSet<i32>,
}

impl Session {
    fn check(&self, assignment: Assignment) -> Result<()> {
        match self.generations.get(&assignment.partition) {
            Some(generation) if *generation == assignment.generation => Ok(()),
            _ => Err(Error::Revoked(assignment.partition)),
        }
    }
}

/// A log kept in memory that behaves like one consumer-group member.
#[derive(Clone)]
pub(crate) struct InMemoryLog {
    store: Arc<Mutex<Store>>,
    session: Arc<Mutex<Session>>,
    journal: Journal,
    reset_policy: ResetPolicy,
    batch_size: usize,
    commit_on_revoke: bool,
    events_tx: mpsc::UnboundedSender<GroupEvent>,
}

impl InMemoryLog {
    pub(crate) fn new(
        reset_policy: ResetPolicy,
        batch_size: usize,
    ) -> (Self, mpsc::UnboundedReceiver<GroupEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let log = Self {
            store: Arc::new(Mutex::new(Store {
                topic: "from-statefun".to_string(),
                partitions: BTreeMap::new(),
                committed: HashMap::new(),
                fail_commits: false,
                next_generation: 0,
            })),
            session: Arc::new(Mutex::new(Session::default())),
            journal: Journal::default(),
            reset_policy,
            batch_size,
            commit_on_revoke: true,
            events_tx,
        };
        (log, events_rx)
    }

    /// Whether handled offsets are committed when partitions are revoked, as the Kafka source
    /// does for every guarantee except `none`.
    pub(crate) fn with_commit_on_revoke(mut self, commit_on_revoke: bool) -> Self {
        self.commit_on_revoke = commit_on_revoke;
        self
    }

    /// A fresh consumer session on the same log and group, as after a process restart.
    pub(crate) fn restart(&self) -> (Self, mpsc::UnboundedReceiver<GroupEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let log = Self {
            store: Arc::clone(&self.store),
            session: Arc::new(Mutex::new(Session::default())),
            journal: self.journal.clone(),
            reset_policy: self.reset_policy,
            batch_size: self.batch_size,
            commit_on_revoke: self.commit_on_revoke,
            events_tx,
        };
        (log, events_rx)
    }

    pub(crate) fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub(crate) fn append(&self, partition: i32, offset: i64, payload: &str) {
        let mut store = self.store.lock();
        let record = Record {
            topic: store.topic.clone(),
            partition,
            offset,
            key: Some(Bytes::from(format!("key-{offset}"))),
            value: Bytes::from(payload.to_string()),
            headers: HashMap::from([("origin".to_string(), "test".to_string())]),
            timestamp: None,
        };
        store.partitions.entry(partition).or_default().push(record);
    }

    /// Assigns partitions to this member, starting after the committed offset or at the reset
    /// point, and publishes the assignment.
    pub(crate) fn assign(&self, partitions: &[i32]) -> Vec<Assignment> {
        let mut store = self.store.lock();
        let mut session = self.session.lock();
        let mut assignments = vec![];
        for partition in partitions {
            store.next_generation += 1;
            let generation = store.next_generation;
            let records = store.partitions.get(partition).map(Vec::as_slice).unwrap_or_default();
            let position = match store.committed.get(partition) {
                Some(committed) => records.iter().take_while(|r| r.offset <= *committed).count(),
                None => match self.reset_policy {
                    ResetPolicy::Earliest => 0,
                    ResetPolicy::Latest => records.len(),
                },
            };
            session.generations.insert(*partition, generation);
            session.position.insert(*partition, position);
            session.consumed.remove(partition);
            session.handled.remove(partition);
            session.paused.remove(partition);
            assignments.push(Assignment {
                partition: *partition,
                generation,
            });
        }
        let _ = self
            .events_tx
            .send(GroupEvent::Assigned(assignments.clone()));
        assignments
    }

    /// Revokes partitions, first committing their handled offsets if enabled.
    pub(crate) fn revoke(&self, partitions: &[i32]) {
        {
            let mut store = self.store.lock();
            let mut session = self.session.lock();
            for partition in partitions {
                session.generations.remove(partition);
                let Some(handled) = session.handled.get(partition).copied() else {
                    continue;
                };
                let behind = store
                    .committed
                    .get(partition)
                    .is_none_or(|committed| handled > *committed);
                if self.commit_on_revoke && behind && !store.fail_commits {
                    store.committed.insert(*partition, handled);
                    self.journal.push(Entry::Commit {
                        partition: *partition,
                        offset: handled,
                    });
                }
            }
        }
        let _ = self.events_tx.send(GroupEvent::Revoked(partitions.to_vec()));
    }

    pub(crate) fn committed(&self, partition: i32) -> Option<i64> {
        self.store.lock().committed.get(&partition).copied()
    }

    pub(crate) fn handled(&self, partition: i32) -> Option<i64> {
        self.session.lock().handled.get(&partition).copied()
    }

    pub(crate) fn is_paused(&self, partition: i32) -> bool {
        self.session.lock().paused.contains(&partition)
    }

    /// Makes every following commit fail as if the broker rejected it.
    pub(crate) fn fail_commits(&self) {
        self.store.lock().fail_commits = true;
    }
}

impl LogSource for InMemoryLog {
    async fn poll(&self, assignment: Assignment, max_wait: Duration) -> Result<Vec<Record>> {
        let batch = {
            let store = self.store.lock();
            let mut session = self.session.lock();
            session.check(assignment)?;
            if session.paused.contains(&assignment.partition) {
                vec![]
            } else {
                let position = session
                    .position
                    .get(&assignment.partition)
                    .copied()
                    .unwrap_or_default();
                let batch: Vec<Record> = store
                    .partitions
                    .get(&assignment.partition)
                    .map(|records| {
                        records
                            .iter()
                            .skip(position)
                            .take(self.batch_size)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                if let Some(last) = batch.last() {
                    session
                        .position
                        .insert(assignment.partition, position + batch.len());
                    session.consumed.insert(assignment.partition, last.offset);
                }
                batch
            }
        };

        if batch.is_empty() {
            tokio::time::sleep(max_wait).await;
        }
        Ok(batch)
    }

    async fn commit(&self, assignment: Assignment, offset: i64) -> Result<()> {
        let mut store = self.store.lock();
        let session = self.session.lock();
        session.check(assignment)?;
        if store.fail_commits {
            return Err(Error::Commit(format!(
                "broker rejected commit of offset {offset} on partition {}",
                assignment.partition
            )));
        }
        if store
            .committed
            .get(&assignment.partition)
            .is_some_and(|committed| offset <= *committed)
        {
            return Ok(());
        }
        if session
            .consumed
            .get(&assignment.partition)
            .is_none_or(|consumed| offset > *consumed)
        {
            return Err(Error::Commit(format!(
                "offset {offset} of partition {} is ahead of the consumed offset",
                assignment.partition
            )));
        }
        store.committed.insert(assignment.partition, offset);
        self.journal.push(Entry::Commit {
            partition: assignment.partition,
            offset,
        });
        Ok(())
    }

    async fn mark_handled(&self, assignment: Assignment, offset: i64) -> Result<()> {
        let mut session = self.session.lock();
        session.check(assignment)?;
        session.handled.insert(assignment.partition, offset);
        Ok(())
    }

    async fn pause(&self, assignment: Assignment) -> Result<()> {
        let mut session = self.session.lock();
        session.check(assignment)?;
        session.paused.insert(assignment.partition);
        Ok(())
    }
}
