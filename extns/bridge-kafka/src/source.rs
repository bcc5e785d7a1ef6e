use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::message::{Headers, Message};
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    Assignment, Error, GroupState, KafkaSaslAuth, ResetPolicy, Result, TlsConfig,
    apply_client_settings,
};

/// Bound for metadata and committed-offset lookups against the brokers.
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive read failures after which waiting polls are failed instead of kept parked.
const MAX_FAILURE_COUNT: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSourceConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub consumer_group: String,
    pub reset_policy: ResetPolicy,
    /// Commit handled offsets of revoked partitions before they are relinquished.
    pub commit_on_revoke: bool,
    pub auth: Option<KafkaSaslAuth>,
    pub tls: Option<TlsConfig>,
    pub kafka_raw_config: HashMap<String, String>,
}

/// A record read from Kafka.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: HashMap<String, String>,
    /// Milliseconds since the epoch, when the broker reported one.
    pub timestamp: Option<i64>,
}

impl KafkaRecord {
    pub fn from_message<M: Message>(message: &M) -> Self {
        let headers = match message.headers() {
            Some(headers) => headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_string(),
                        String::from_utf8_lossy(header.value.unwrap_or_default()).to_string(),
                    )
                })
                .collect(),
            None => HashMap::new(),
        };

        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(Bytes::copy_from_slice),
            value: message
                .payload()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
            headers,
            timestamp: message.timestamp().to_millis(),
        }
    }
}

/// Group membership changes, published after the consumer's view of the group was updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionEvent {
    Assigned(Vec<Assignment>),
    Revoked(Vec<i32>),
}

// Callbacks run by librdkafka on the thread polling the consumer, which is always the actor task.
struct GroupContext {
    topic: String,
    state: Arc<Mutex<GroupState>>,
    commit_on_revoke: bool,
    events_tx: mpsc::UnboundedSender<PartitionEvent>,
}

impl GroupContext {
    fn partitions_of(&self, tpl: &TopicPartitionList) -> Vec<i32> {
        tpl.elements_for_topic(&self.topic)
            .iter()
            .map(|elem| elem.partition())
            .collect()
    }

    /// Commits handled-but-uncommitted offsets of the revoked partitions.
    fn flush_revoked(&self, consumer: &BaseConsumer<Self>, partitions: &[i32]) {
        let pending = self.state.lock().pending_commits(partitions);
        if pending.is_empty() {
            return;
        }

        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in &pending {
            if let Err(e) =
                tpl.add_partition_offset(&self.topic, *partition, Offset::Offset(offset + 1))
            {
                error!(?e, partition, offset, "Failed to build commit for revoked partition");
                return;
            }
        }

        match consumer.commit(&tpl, CommitMode::Sync) {
            Ok(()) => {
                let mut state = self.state.lock();
                for (partition, offset) in &pending {
                    state.record_committed(*partition, *offset);
                }
                info!(?pending, "Committed handled offsets of revoked partitions");
            }
            Err(e) => error!(
                ?e,
                ?pending,
                "Failed to commit handled offsets before giving up partitions, records after the last commit will be redelivered"
            ),
        }
    }
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Pre rebalance {:?}", rebalance);
        let Rebalance::Revoke(tpl) = rebalance else {
            return;
        };

        let partitions = self.partitions_of(tpl);
        if self.commit_on_revoke {
            self.flush_revoked(consumer, &partitions);
        }
        {
            let mut state = self.state.lock();
            for partition in &partitions {
                state.revoke(*partition);
            }
        }
        let _ = self.events_tx.send(PartitionEvent::Revoked(partitions));
    }

    fn post_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Post rebalance {:?}", rebalance);
        let Rebalance::Assign(tpl) = rebalance else {
            return;
        };

        let committed = match consumer.committed_offsets((*tpl).clone(), METADATA_TIMEOUT) {
            Ok(committed) => committed,
            Err(e) => {
                warn!(?e, "Failed to read committed offsets of assigned partitions");
                TopicPartitionList::new()
            }
        };

        let assignments: Vec<Assignment> = {
            let mut state = self.state.lock();
            self.partitions_of(tpl)
                .into_iter()
                .map(|partition| {
                    let last_committed = committed
                        .find_partition(&self.topic, partition)
                        .and_then(|elem| match elem.offset() {
                            Offset::Offset(next) if next > 0 => Some(next - 1),
                            _ => None,
                        });
                    state.assign(partition, last_committed)
                })
                .collect()
        };
        let _ = self.events_tx.send(PartitionEvent::Assigned(assignments));
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        debug!(?result, ?offsets, "Committed offsets");
    }
}

type GroupConsumer = StreamConsumer<GroupContext>;

enum KafkaActorMessage {
    Poll {
        assignment: Assignment,
        max_wait: Duration,
        respond_to: oneshot::Sender<Result<Vec<KafkaRecord>>>,
    },
    Commit {
        assignment: Assignment,
        offset: i64,
        respond_to: oneshot::Sender<Result<()>>,
    },
    MarkHandled {
        assignment: Assignment,
        offset: i64,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Pause {
        assignment: Assignment,
        respond_to: oneshot::Sender<Result<()>>,
    },
    State {
        respond_to: oneshot::Sender<GroupState>,
    },
}

struct ParkedPoll {
    deadline: Instant,
    respond_to: oneshot::Sender<Result<Vec<KafkaRecord>>>,
}

/// Fetch buffer of one partition for one assignment.
struct Fetch {
    assignment: Assignment,
    records: VecDeque<KafkaRecord>,
    flow_paused: bool,
    blocked: bool,
    parked: Option<ParkedPoll>,
}

impl Fetch {
    fn new(assignment: Assignment) -> Self {
        Self {
            assignment,
            records: VecDeque::new(),
            flow_paused: false,
            blocked: false,
            parked: None,
        }
    }
}

struct KafkaActor {
    consumer: Arc<GroupConsumer>,
    topic: String,
    batch_size: usize,
    state: Arc<Mutex<GroupState>>,
    fetches: HashMap<i32, Fetch>,
    handler_rx: mpsc::Receiver<KafkaActorMessage>,
}

fn set_paused(consumer: &GroupConsumer, topic: &str, partition: i32, paused: bool) {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition(topic, partition);
    let result = if paused {
        consumer.pause(&tpl)
    } else {
        consumer.resume(&tpl)
    };
    if let Err(e) = result {
        warn!(?e, partition, paused, "Failed to change fetch state of partition");
    }
}

/// Consumer properties. Group membership and offset handling are set last so the raw
/// passthrough config cannot re-enable automatic commits.
fn consumer_config(config: &KafkaSourceConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.brokers.join(","))
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set_log_level(RDKafkaLogLevel::Warning);
    apply_client_settings(
        &mut client_config,
        config.auth.as_ref(),
        config.tls.as_ref(),
        &config.kafka_raw_config,
    );
    client_config
        .set("group.id", &config.consumer_group)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", config.reset_policy.as_config_value());
    client_config
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl KafkaActor {
    async fn start(
        config: KafkaSourceConfig,
        batch_size: usize,
        handler_rx: mpsc::Receiver<KafkaActorMessage>,
    ) -> Result<mpsc::UnboundedReceiver<PartitionEvent>> {
        let servers = config.brokers.join(",");
        let client_config = consumer_config(&config);

        let state = Arc::new(Mutex::new(GroupState::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = GroupContext {
            topic: config.topic.clone(),
            state: Arc::clone(&state),
            commit_on_revoke: config.commit_on_revoke,
            events_tx,
        };

        let consumer: GroupConsumer =
            client_config
                .create_with_context(context)
                .map_err(|err| Error::Connection {
                    server: servers.clone(),
                    error: err.to_string(),
                })?;
        let consumer = Arc::new(consumer);

        // Subscribing is lazy and does not report unreachable brokers or bad credentials,
        // a metadata round-trip does.
        let metadata_consumer = Arc::clone(&consumer);
        let topic = config.topic.clone();
        let topic_found = tokio::task::spawn_blocking(move || {
            metadata_consumer
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map(|metadata| {
                    metadata
                        .topics()
                        .first()
                        .is_some_and(|t| t.error().is_none() && !t.partitions().is_empty())
                })
        })
        .await
        .map_err(|e| Error::Other(format!("Waiting for metadata task: {e:?}")))?
        .map_err(|err| Error::Connection {
            server: servers.clone(),
            error: err.to_string(),
        })?;
        if !topic_found {
            warn!(
                topic = config.topic,
                "Topic not found, consuming will start once it is created"
            );
        }

        consumer
            .subscribe(&[&config.topic])
            .map_err(|err| Error::Kafka(format!("Failed to subscribe to topic: {err}")))?;

        let actor = KafkaActor {
            consumer,
            topic: config.topic,
            batch_size,
            state,
            fetches: HashMap::new(),
            handler_rx,
        };
        tokio::spawn(async move {
            info!(topic = actor.topic, "Starting Kafka consumer...");
            actor.run().await;
        });

        Ok(events_rx)
    }

    async fn run(mut self) {
        let consumer = Arc::clone(&self.consumer);
        let mut continuous_failure_count = 0;
        loop {
            let next_deadline = self
                .fetches
                .values()
                .filter_map(|fetch| fetch.parked.as_ref().map(|p| p.deadline))
                .min();

            tokio::select! {
                biased;

                msg = self.handler_rx.recv() => {
                    let Some(msg) = msg else {
                        break;
                    };
                    self.handle_message(msg).await;
                }

                message = consumer.recv() => {
                    match message {
                        Ok(message) => {
                            continuous_failure_count = 0;
                            let record = KafkaRecord::from_message(&message);
                            self.on_record(record);
                        }
                        Err(e) => {
                            continuous_failure_count += 1;
                            if continuous_failure_count > MAX_FAILURE_COUNT {
                                self.fail_parked(Error::Connection {
                                    server: self.topic.clone(),
                                    error: format!(
                                        "Failed to read messages after {MAX_FAILURE_COUNT} retries: {e:?}"
                                    ),
                                });
                                continuous_failure_count = 0;
                            }
                            error!(
                                ?e,
                                "Failed to read messages, will retry after 100 milliseconds"
                            );
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                    self.prune_stale();
                }

                _ = wait_until(next_deadline) => {
                    self.expire_parked();
                }
            }
        }
        info!("Kafka consumer stopped");
    }

    async fn handle_message(&mut self, msg: KafkaActorMessage) {
        match msg {
            KafkaActorMessage::Poll {
                assignment,
                max_wait,
                respond_to,
            } => self.poll(assignment, max_wait, respond_to),
            KafkaActorMessage::Commit {
                assignment,
                offset,
                respond_to,
            } => {
                let status = self.commit(assignment, offset).await;
                let _ = respond_to.send(status);
            }
            KafkaActorMessage::MarkHandled {
                assignment,
                offset,
                respond_to,
            } => {
                let status = self.state.lock().record_handled(assignment, offset);
                let _ = respond_to.send(status);
            }
            KafkaActorMessage::Pause {
                assignment,
                respond_to,
            } => {
                let status = self.block(assignment);
                let _ = respond_to.send(status);
            }
            KafkaActorMessage::State { respond_to } => {
                let _ = respond_to.send(self.state.lock().clone());
            }
        }
    }

    /// Makes the fetch entry of a partition match its current assignment, dropping buffers and
    /// waiting polls left over from an earlier one. Returns the current assignment.
    fn sync_fetch(&mut self, partition: i32) -> Option<Assignment> {
        let current = self.state.lock().partition(partition).map(|s| Assignment {
            partition,
            generation: s.generation,
        });

        let stale = self
            .fetches
            .get(&partition)
            .is_some_and(|fetch| Some(fetch.assignment) != current);
        if stale {
            if let Some(mut fetch) = self.fetches.remove(&partition) {
                if let Some(parked) = fetch.parked.take() {
                    let _ = parked.respond_to.send(Err(Error::NotAssigned(partition)));
                }
                if (fetch.flow_paused || fetch.blocked) && current.is_some() {
                    set_paused(&self.consumer, &self.topic, partition, false);
                }
                debug!(
                    partition,
                    dropped = fetch.records.len(),
                    "Dropped fetch state of a previous assignment"
                );
            }
        }

        let current = current?;
        self.fetches
            .entry(partition)
            .or_insert_with(|| Fetch::new(current));
        Some(current)
    }

    fn prune_stale(&mut self) {
        let partitions: Vec<i32> = self.fetches.keys().copied().collect();
        for partition in partitions {
            self.sync_fetch(partition);
        }
    }

    fn on_record(&mut self, record: KafkaRecord) {
        let partition = record.partition;
        if self.sync_fetch(partition).is_none() {
            debug!(
                partition,
                offset = record.offset,
                "Discarding record of a partition that is not assigned"
            );
            return;
        }

        let batch_size = self.batch_size;
        let Some(fetch) = self.fetches.get_mut(&partition) else {
            return;
        };
        if fetch.blocked {
            return;
        }
        fetch.records.push_back(record);

        if let Some(parked) = fetch.parked.take() {
            let batch = self.hand_out(partition);
            let _ = parked.respond_to.send(batch);
        } else if fetch.records.len() >= batch_size && !fetch.flow_paused {
            fetch.flow_paused = true;
            set_paused(&self.consumer, &self.topic, partition, true);
        }
    }

    /// Drains up to one batch of buffered records and marks them consumed.
    fn hand_out(&mut self, partition: i32) -> Result<Vec<KafkaRecord>> {
        let batch_size = self.batch_size;
        let Some(fetch) = self.fetches.get_mut(&partition) else {
            return Err(Error::NotAssigned(partition));
        };
        let count = fetch.records.len().min(batch_size);
        let batch: Vec<KafkaRecord> = fetch.records.drain(..count).collect();

        if let Some(last) = batch.last() {
            self.state
                .lock()
                .record_consumed(fetch.assignment, last.offset)?;
        }
        if fetch.flow_paused && fetch.records.len() < batch_size {
            fetch.flow_paused = false;
            set_paused(&self.consumer, &self.topic, partition, false);
        }
        Ok(batch)
    }

    fn poll(
        &mut self,
        assignment: Assignment,
        max_wait: Duration,
        respond_to: oneshot::Sender<Result<Vec<KafkaRecord>>>,
    ) {
        let partition = assignment.partition;
        if self.sync_fetch(partition) != Some(assignment) {
            let _ = respond_to.send(Err(Error::NotAssigned(partition)));
            return;
        }
        let Some(fetch) = self.fetches.get_mut(&partition) else {
            let _ = respond_to.send(Err(Error::NotAssigned(partition)));
            return;
        };

        if !fetch.records.is_empty() {
            let batch = self.hand_out(partition);
            let _ = respond_to.send(batch);
            return;
        }

        let parked = ParkedPoll {
            deadline: Instant::now() + max_wait,
            respond_to,
        };
        if let Some(previous) = fetch.parked.replace(parked) {
            let _ = previous.respond_to.send(Ok(vec![]));
        }
    }

    fn expire_parked(&mut self) {
        let now = Instant::now();
        for fetch in self.fetches.values_mut() {
            if fetch.parked.as_ref().is_some_and(|p| p.deadline <= now) {
                if let Some(parked) = fetch.parked.take() {
                    let _ = parked.respond_to.send(Ok(vec![]));
                }
            }
        }
    }

    fn fail_parked(&mut self, error: Error) {
        for fetch in self.fetches.values_mut() {
            if let Some(parked) = fetch.parked.take() {
                let _ = parked.respond_to.send(Err(error.clone()));
            }
        }
    }

    async fn commit(&mut self, assignment: Assignment, offset: i64) -> Result<()> {
        let partition = assignment.partition;
        let planned = self.state.lock().plan_commit(assignment, offset)?;
        let Some(offset) = planned else {
            debug!(partition, offset, "Offset already committed");
            return Ok(());
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))
            .map_err(|e| Error::Commit {
                partition,
                offset,
                error: e.to_string(),
            })?;

        // A synchronous commit blocks until the broker answers.
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| Error::Other(format!("Waiting for commit task: {e:?}")))?
            .map_err(|e| Error::Commit {
                partition,
                offset,
                error: e.to_string(),
            })?;

        self.state.lock().record_committed(partition, offset);
        debug!(partition, offset, "Committed offset");
        Ok(())
    }

    fn block(&mut self, assignment: Assignment) -> Result<()> {
        let partition = assignment.partition;
        if self.sync_fetch(partition) != Some(assignment) {
            return Err(Error::NotAssigned(partition));
        }
        if let Some(fetch) = self.fetches.get_mut(&partition) {
            fetch.blocked = true;
            fetch.records.clear();
            if let Some(parked) = fetch.parked.take() {
                let _ = parked.respond_to.send(Ok(vec![]));
            }
        }
        set_paused(&self.consumer, &self.topic, partition, true);
        info!(partition, "Paused partition");
        Ok(())
    }
}

/// Handle to the Kafka consumer actor. Cheap to clone, the actor stops once every handle is
/// dropped.
#[derive(Clone)]
pub struct KafkaSource {
    actor_tx: mpsc::Sender<KafkaActorMessage>,
}

impl KafkaSource {
    /// Joins the consumer group. Fails with [Error::Connection] if the brokers cannot be reached.
    /// Returns the handle and the stream of partition assignment changes.
    pub async fn connect(
        config: KafkaSourceConfig,
        batch_size: usize,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PartitionEvent>)> {
        let (tx, rx) = mpsc::channel(64);
        let events = KafkaActor::start(config, batch_size.max(1), rx).await?;
        Ok((Self { actor_tx: tx }, events))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> KafkaActorMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.actor_tx
            .send(make(tx))
            .await
            .map_err(|_| Error::Other("Kafka actor stopped".into()))?;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))
    }

    /// Waits up to `max_wait` for records of the partition, in log order.
    pub async fn poll(
        &self,
        assignment: Assignment,
        max_wait: Duration,
    ) -> Result<Vec<KafkaRecord>> {
        self.request(|respond_to| KafkaActorMessage::Poll {
            assignment,
            max_wait,
            respond_to,
        })
        .await?
    }

    /// Commits every record of the partition up to and including `offset`.
    pub async fn commit(&self, assignment: Assignment, offset: i64) -> Result<()> {
        self.request(|respond_to| KafkaActorMessage::Commit {
            assignment,
            offset,
            respond_to,
        })
        .await?
    }

    pub async fn mark_handled(&self, assignment: Assignment, offset: i64) -> Result<()> {
        self.request(|respond_to| KafkaActorMessage::MarkHandled {
            assignment,
            offset,
            respond_to,
        })
        .await?
    }

    /// Stops fetching the partition for the rest of the assignment.
    pub async fn pause(&self, assignment: Assignment) -> Result<()> {
        self.request(|respond_to| KafkaActorMessage::Pause {
            assignment,
            respond_to,
        })
        .await?
    }

    pub async fn group_state(&self) -> Result<GroupState> {
        self.request(|respond_to| KafkaActorMessage::State { respond_to })
            .await
    }
}
