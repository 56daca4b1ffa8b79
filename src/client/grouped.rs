//! The grouped-consumer façade: partition ownership is divided among the
//! members of a named group, coordinated through the consensus service and
//! the broker-side group protocol.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::consumer::{
    json_deserializer, ConsumedBatch, ConsumerConfig, ConsumerCore, DeserializerFn,
};
use super::error::{Error, Result};
use super::{instance_name, validate_group_timing, Client};
use crate::allocator::{naive_round_robin, partition_label, AllocatorFn};
use crate::backoff::Backoff;
use crate::cluster::{Cluster, TopicPartition};
use crate::coordinator::{CoordinatorService, Party, SharedSet};
use crate::group::{GroupConfig, GroupPhase, GroupSession, PartitionUniverse, StableView};
use crate::offsets::Start;
use crate::protocol::error::{Error as ApiError, ErrorClass};
use crate::protocol::messages::{
    OffsetCommitRequest, OffsetCommitRequestPartition, OffsetCommitRequestTopic,
    OffsetFetchRequest, OffsetFetchRequestTopic, NO_STORED_OFFSET,
};
use crate::protocol::primitives::{Array, Int32, Int64, NullableString, String_};

/// Builder for [`GroupedConsumer`].
pub struct GroupedConsumerBuilder {
    seeds: Vec<String>,
    client: Option<Arc<Cluster>>,
    group: String,
    coordinator: Option<Arc<dyn CoordinatorService>>,
    allocator: AllocatorFn,
    autocommit: bool,
    session_timeout: Duration,
    heartbeat_interval: Option<Duration>,
    deserializer: DeserializerFn,
    max_wait_time: Duration,
    min_bytes: i32,
    max_bytes: i32,
    deadline: Option<Duration>,
}

impl GroupedConsumerBuilder {
    /// Start from seed broker addresses and a group name.
    pub fn new(seeds: Vec<String>, group: impl Into<String>) -> Self {
        Self {
            seeds,
            client: None,
            group: group.into(),
            coordinator: None,
            allocator: Arc::new(naive_round_robin),
            autocommit: true,
            session_timeout: Duration::from_secs(30),
            heartbeat_interval: None,
            deserializer: json_deserializer(),
            max_wait_time: Duration::from_millis(1000),
            min_bytes: 1,
            max_bytes: 1024 * 1024,
            deadline: None,
        }
    }

    /// Share the cluster of an existing [`Client`].
    pub fn from_client(client: &Client, group: impl Into<String>) -> Self {
        let mut builder = Self::new(vec![], group);
        builder.client = Some(client.cluster());
        builder
    }

    /// The consensus-coordinator session tracking group membership.
    pub fn coordinator(mut self, coordinator: Arc<dyn CoordinatorService>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Replace the partition allocator. Must be stable: every member runs
    /// it and they have to agree.
    pub fn allocator(mut self, allocator: AllocatorFn) -> Self {
        self.allocator = allocator;
        self
    }

    /// Commit offsets automatically after every successful consume.
    pub fn autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = autocommit;
        self
    }

    /// How long the broker waits for heartbeats before evicting us.
    pub fn session_timeout(mut self, session_timeout: Duration) -> Self {
        self.session_timeout = session_timeout;
        self
    }

    /// Heartbeat cadence; defaults to a third of the session timeout.
    pub fn heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = Some(heartbeat_interval);
        self
    }

    /// Replace the value deserializer.
    pub fn deserializer(mut self, deserializer: DeserializerFn) -> Self {
        self.deserializer = deserializer;
        self
    }

    /// Broker-side wait before answering an otherwise-empty fetch.
    pub fn max_wait_time(mut self, max_wait_time: Duration) -> Self {
        self.max_wait_time = max_wait_time;
        self
    }

    /// Broker-side minimum payload before answering a fetch.
    pub fn min_bytes(mut self, min_bytes: i32) -> Self {
        self.min_bytes = min_bytes;
        self
    }

    /// Total fetch budget, divided evenly across assigned partitions.
    pub fn max_bytes(mut self, max_bytes: i32) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Overall deadline per consume call.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Connect: join the membership party, seed the shared partition set,
    /// and start the group session.
    pub async fn connect(self) -> Result<GroupedConsumer> {
        if self.group.is_empty() {
            return Err(Error::Configuration("empty group name".to_owned()));
        }
        let coordinator = self.coordinator.ok_or_else(|| {
            Error::Configuration("grouped consumer requires a coordinator service".to_owned())
        })?;
        let heartbeat_interval = self
            .heartbeat_interval
            .unwrap_or(self.session_timeout / 3);
        validate_group_timing(heartbeat_interval, self.session_timeout)?;

        let config = ConsumerConfig {
            deserializer: self.deserializer,
            max_wait_time: self.max_wait_time,
            min_bytes: self.min_bytes,
            max_bytes: self.max_bytes,
            deadline: self.deadline,
        };
        config.validate()?;

        let cluster = match self.client {
            Some(cluster) => cluster,
            None => super::ClientBuilder::new(self.seeds).build().await?.cluster(),
        };

        let name = instance_name(env!("CARGO_PKG_NAME"));
        let members_path = format!("/{}/groups/{}/members", env!("CARGO_PKG_NAME"), self.group);
        let partitions_path = format!(
            "/{}/groups/{}/partitions",
            env!("CARGO_PKG_NAME"),
            self.group
        );

        let party = Arc::new(Party::new(Arc::clone(&coordinator), name.clone(), members_path));
        let shared = Arc::new(SharedSet::new(Arc::clone(&coordinator), partitions_path));

        let member_watch = party.start().await.map_err(group_error)?;
        let data_watch = shared.start().await.map_err(group_error)?;
        party.join().await.map_err(group_error)?;

        // the shared set starts out as the full partition universe the
        // cluster knows about
        let state = cluster.state();
        let mut seed_labels = BTreeSet::new();
        for topic in state.topic_names() {
            for partition in state.partitions(&topic) {
                seed_labels.insert(partition_label(&topic, partition));
            }
        }
        if !seed_labels.is_empty() {
            shared.add_items(&seed_labels).await.map_err(group_error)?;
        }

        let (trigger_tx, trigger_rx) = broadcast::channel(16);
        let forwarder = spawn_rebalance_forwarder(
            Arc::clone(&party),
            member_watch,
            data_watch,
            trigger_tx,
        );

        let universe = Arc::new(GroupUniverse {
            shared: Arc::clone(&shared),
            cluster: Arc::clone(&cluster),
        });

        let session = GroupSession::spawn(
            Arc::clone(&cluster),
            GroupConfig {
                group: self.group.clone(),
                protocol_name: "round-robin".to_owned(),
                session_timeout: self.session_timeout,
                heartbeat_interval,
                allocator: self.allocator,
            },
            universe,
            trigger_rx,
        );

        info!(group = self.group.as_str(), name = name.as_str(), "Grouped consumer connected");

        Ok(GroupedConsumer {
            core: ConsumerCore::new(cluster, config),
            name,
            group: self.group,
            autocommit: self.autocommit,
            session,
            party,
            shared,
            topics_to_commit: Mutex::new(HashSet::new()),
            last_generation: AtomicI32::new(-1),
            forwarder,
        })
    }
}

fn group_error(e: crate::coordinator::Error) -> Error {
    Error::Group(e.to_string())
}

fn spawn_rebalance_forwarder(
    party: Arc<Party<dyn CoordinatorService>>,
    mut member_watch: broadcast::Receiver<Vec<String>>,
    mut data_watch: broadcast::Receiver<Option<Vec<u8>>>,
    trigger_tx: broadcast::Sender<Vec<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let members = tokio::select! {
                members = member_watch.recv() => match members {
                    Ok(members) => members,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        party.members().await.unwrap_or_default()
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = data_watch.recv() => match changed {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        party.members().await.unwrap_or_default()
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if trigger_tx.send(members).is_err() {
                break;
            }
        }
    })
}

/// The partition universe the leader allocates from: the shared set, with
/// cluster metadata as a fallback before the set is populated.
struct GroupUniverse {
    shared: Arc<SharedSet<dyn CoordinatorService>>,
    cluster: Arc<Cluster>,
}

#[async_trait]
impl PartitionUniverse for GroupUniverse {
    async fn partitions(&self) -> Vec<String> {
        if let Ok(items) = self.shared.items().await {
            if !items.is_empty() {
                return items.into_iter().collect();
            }
        }

        let state = self.cluster.state();
        let mut labels = vec![];
        for topic in state.topic_names() {
            for partition in state.partitions(&topic) {
                labels.push(partition_label(&topic, partition));
            }
        }
        labels.sort();
        labels
    }

    async fn topics(&self) -> Vec<String> {
        let mut topics: BTreeSet<String> = self
            .partitions()
            .await
            .iter()
            .filter_map(|label| crate::allocator::parse_partition_label(label))
            .map(|(topic, _)| topic)
            .collect();

        if topics.is_empty() {
            topics = self.cluster.state().topic_names().into_iter().collect();
        }
        topics.into_iter().collect()
    }
}

/// A consumer sharing the partitions of its topics with the other members
/// of a named group.
///
/// Delivery is at-most-once across rebalances: a commit that is lost with a
/// dying generation can lead to duplicate delivery in the next one.
pub struct GroupedConsumer {
    core: ConsumerCore,
    name: String,
    group: String,
    autocommit: bool,
    session: GroupSession,
    party: Arc<Party<dyn CoordinatorService>>,
    shared: Arc<SharedSet<dyn CoordinatorService>>,
    topics_to_commit: Mutex<HashSet<String>>,
    last_generation: AtomicI32,
    forwarder: JoinHandle<()>,
}

impl GroupedConsumer {
    /// The member name used in the party and in commit metadata.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current group phase, for observability.
    pub fn group_phase(&self) -> GroupPhase {
        self.session.phase()
    }

    /// This member's share of the group's partitions, once stable.
    pub async fn assignment(&self) -> Result<std::collections::BTreeMap<String, Vec<i32>>> {
        Ok(self.session.wait_stable().await?.assignment)
    }

    /// Consume the next batch from the partitions of `topic` assigned to
    /// this member.
    ///
    /// Blocks while the group is mid-rebalance. With `autocommit`, offsets
    /// are committed after delivery.
    pub async fn consume(&self, topic: &str, start: Start) -> Result<ConsumedBatch> {
        self.core.cluster.ensure_topic(topic).await?;

        let view = self.session.wait_stable().await?;
        self.handle_generation(&view);

        let partitions = view.assignment.get(topic).cloned().unwrap_or_default();
        if partitions.is_empty() {
            // not ours this generation; make sure the topic is in the shared
            // universe so the next rebalance can hand it out
            self.ensure_in_universe(topic).await?;
            debug!(topic, "No partitions assigned this generation");
            return Ok(ConsumedBatch::default());
        }

        if !self.core.offsets.lock().is_synced(topic) {
            self.sync_group_offsets(topic, &partitions, &view, start).await?;
            self.core.offsets.lock().mark_synced(topic);
        }

        let batch = self.core.fetch(topic, &partitions, start).await?;

        self.topics_to_commit.lock().await.insert(topic.to_owned());
        if self.autocommit {
            self.commit_offsets().await?;
        }

        Ok(batch)
    }

    /// Push the stored offsets of every consumed topic to the group
    /// coordinator.
    pub async fn commit_offsets(&self) -> Result<()> {
        let view = self.session.wait_stable().await?;
        self.handle_generation(&view);

        let topics: HashSet<String> = self.topics_to_commit.lock().await.iter().cloned().collect();
        if topics.is_empty() {
            return Ok(());
        }

        let values = self.core.offsets.lock().commit_values(&topics);
        if values.is_empty() {
            return Ok(());
        }

        let mut metadata = format!("committed by {}", self.name);
        let mut backoff = Backoff::new(&crate::backoff::BackoffConfig::default());

        for _attempt in 0..4 {
            let request = commit_request(&self.group, &view, &values, &metadata);
            let response = self
                .core
                .cluster
                .request_broker(view.coordinator_id, request)
                .await?;

            let mut retry = false;
            let mut adjust_metadata = false;
            let mut committed_topics: HashSet<String> = topics.clone();

            for topic in &response.topics {
                for partition in &topic.partitions {
                    let tp = TopicPartition::new(topic.name.0.clone(), partition.partition_index.0);
                    match partition.error {
                        None => {
                            if let Some(offset) = values.get(&tp) {
                                self.core.offsets.lock().mark_committed(tp, *offset);
                            }
                        }
                        Some(ApiError::OffsetMetadataTooLarge) => {
                            warn!(commit_metadata = metadata.as_str(), "Commit metadata too long");
                            committed_topics.remove(&topic.name.0);
                            retry = true;
                            adjust_metadata = true;
                        }
                        Some(e) if e.classify() != ErrorClass::Fatal => {
                            committed_topics.remove(&topic.name.0);
                            retry = true;
                        }
                        Some(e) => {
                            return Err(Error::Broker(e));
                        }
                    }
                }
            }

            {
                let mut to_commit = self.topics_to_commit.lock().await;
                for topic in &committed_topics {
                    to_commit.remove(topic);
                }
            }

            if !retry {
                return Ok(());
            }
            if adjust_metadata {
                metadata.clear();
            }
            tokio::time::sleep(backoff.next()).await;
        }

        Err(Error::Group("offset commit retries exhausted".to_owned()))
    }

    /// Leave the group: flush commits if autocommitting, tell the broker
    /// goodbye, and drop out of the party.
    pub async fn close(mut self) -> Result<()> {
        let commit_result = if self.autocommit && self.session.phase() == GroupPhase::Stable {
            self.commit_offsets().await
        } else {
            Ok(())
        };

        self.session.leave().await;
        self.party.leave().await.map_err(group_error)?;
        self.forwarder.abort();

        commit_result
    }

    fn handle_generation(&self, view: &StableView) {
        let previous = self.last_generation.swap(view.generation_id, Ordering::SeqCst);
        if previous != view.generation_id && previous != -1 {
            info!(
                group = self.group.as_str(),
                generation = view.generation_id,
                "New generation, re-syncing offsets"
            );
            self.core.offsets.lock().desync_all();
        }
    }

    async fn ensure_in_universe(&self, topic: &str) -> Result<()> {
        let labels: BTreeSet<String> = self
            .core
            .cluster
            .state()
            .partitions(topic)
            .into_iter()
            .map(|p| partition_label(topic, p))
            .collect();
        if labels.is_empty() {
            return Ok(());
        }
        self.shared.add_items(&labels).await.map_err(group_error)
    }

    /// Seed offsets for newly assigned partitions: the remote store first,
    /// the start hint for whatever has no stored offset.
    async fn sync_group_offsets(
        &self,
        topic: &str,
        partitions: &[i32],
        view: &StableView,
        start: Start,
    ) -> Result<()> {
        info!(
            group = self.group.as_str(),
            topic, "Fetching committed offsets"
        );

        let mut backoff = Backoff::new(&crate::backoff::BackoffConfig::default());
        'attempts: for _attempt in 0..4 {
            let request = OffsetFetchRequest {
                group_id: String_(self.group.clone()),
                topics: vec![OffsetFetchRequestTopic {
                    name: String_(topic.to_owned()),
                    partition_indexes: Array(Some(
                        partitions.iter().map(|p| Int32(*p)).collect(),
                    )),
                }],
            };

            let response = self
                .core
                .cluster
                .request_broker(view.coordinator_id, request)
                .await?;

            let mut missing = vec![];
            for topic_response in &response.topics {
                for partition in &topic_response.partitions {
                    match partition.error {
                        None => {
                            if partition.committed_offset == NO_STORED_OFFSET {
                                missing.push(partition.partition_index.0);
                            } else {
                                let tp = TopicPartition::new(topic, partition.partition_index.0);
                                debug!(
                                    %tp,
                                    offset = partition.committed_offset.0,
                                    "Found stored group offset"
                                );
                                self.core
                                    .offsets
                                    .lock()
                                    .seed(tp, partition.committed_offset.0);
                            }
                        }
                        Some(e) if e.classify() != ErrorClass::Fatal => {
                            debug!(error = %e, "Offset fetch not ready, retrying");
                            tokio::time::sleep(backoff.next()).await;
                            continue 'attempts;
                        }
                        Some(e) => return Err(Error::Broker(e)),
                    }
                }
            }

            if !missing.is_empty() {
                self.core.seed_from_start(topic, &missing, start).await?;
            }
            return Ok(());
        }

        Err(Error::Group("offset fetch retries exhausted".to_owned()))
    }
}

fn commit_request(
    group: &str,
    view: &StableView,
    values: &std::collections::BTreeMap<TopicPartition, i64>,
    metadata: &str,
) -> OffsetCommitRequest {
    let mut topics: std::collections::BTreeMap<String, Vec<OffsetCommitRequestPartition>> =
        std::collections::BTreeMap::new();
    for (tp, offset) in values {
        topics
            .entry(tp.topic.clone())
            .or_default()
            .push(OffsetCommitRequestPartition {
                partition_index: Int32(tp.partition),
                committed_offset: Int64(*offset),
                timestamp: None,
                metadata: NullableString(Some(metadata.to_owned())),
            });
    }

    OffsetCommitRequest {
        group_id: String_(group.to_owned()),
        generation_id: Some(Int32(view.generation_id)),
        member_id: Some(String_(view.member_id.clone())),
        retention_time_ms: Some(Int64(-1)),
        topics: topics
            .into_iter()
            .map(|(name, partitions)| OffsetCommitRequestTopic {
                name: String_(name),
                partitions,
            })
            .collect(),
    }
}

impl Drop for GroupedConsumer {
    fn drop(&mut self) {
        // dropping without close() is "dying": the forwarder goes away, the
        // coordinator session expires, and the peers rebalance
        self.forwarder.abort();
    }
}

impl std::fmt::Debug for GroupedConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupedConsumer")
            .field("group", &self.group)
            .field("name", &self.name)
            .field("autocommit", &self.autocommit)
            .finish_non_exhaustive()
    }
}
