//! Cluster model: an immutable snapshot of broker liveness and partition
//! leadership, plus the routing engine that fans logical operations out to
//! the right brokers and reassembles per-partition results.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::client::error::{Error, Result};
use crate::connection::{BrokerConnection, BrokerConnector};
use crate::messenger::RequestError;
use crate::protocol::error::{Error as ApiError, ErrorClass};
use crate::protocol::messages::{
    DescribeGroupsRequest, DescribedGroup, FetchRequest, FetchRequestPartition, FetchRequestTopic,
    GroupCoordinatorRequest, ListGroupsRequest, ListOffsetsRequest, ListOffsetsRequestPartition,
    ListOffsetsRequestTopic, ListedGroup, MetadataRequest, MetadataResponse, ProduceRequest,
    ProduceRequestPartition, ProduceRequestTopic, ReadVersionedType, RequestBody,
    WriteVersionedType, NORMAL_CONSUMER,
};
use crate::protocol::primitives::{Array, Int16, Int32, Int64, String_};
use crate::protocol::record::MessageSet;

/// One node of the broker cluster. Immutable; replaced wholesale on refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerDescriptor {
    pub broker_id: i32,
    pub host: String,
    pub port: u16,
}

/// Leadership and replication state of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub partition_id: i32,

    /// Leader broker ID, `-1` when no leader is available.
    pub leader: i32,

    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub topic: String,
    pub partitions: Vec<PartitionMetadata>,
}

/// A `(topic, partition)` pair, the unit of routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// A consistent view of the cluster.
///
/// Published behind an `Arc` and replaced wholesale on refresh; readers
/// never observe a torn mix of old and new metadata.
#[derive(Debug, Default)]
pub struct ClusterState {
    brokers: HashMap<i32, BrokerDescriptor>,
    topics: HashMap<String, TopicMetadata>,
}

impl ClusterState {
    pub(crate) fn from_response(response: &MetadataResponse) -> Self {
        let brokers: HashMap<i32, BrokerDescriptor> = response
            .brokers
            .iter()
            .map(|b| {
                (
                    b.node_id.0,
                    BrokerDescriptor {
                        broker_id: b.node_id.0,
                        host: b.host.0.clone(),
                        port: b.port.0 as u16,
                    },
                )
            })
            .collect();

        let mut topics = HashMap::new();
        for topic in &response.topics {
            if let Some(e) = topic.error {
                warn!(topic = topic.name.0.as_str(), error = %e, "Topic metadata carries an error");
                if e == ApiError::UnknownTopicOrPartition || e == ApiError::InvalidTopic {
                    continue;
                }
            }

            topics.insert(
                topic.name.0.clone(),
                TopicMetadata {
                    topic: topic.name.0.clone(),
                    partitions: topic
                        .partitions
                        .iter()
                        .map(|p| PartitionMetadata {
                            partition_id: p.partition_index.0,
                            leader: p.leader_id.0,
                            replicas: p
                                .replica_nodes
                                .0
                                .clone()
                                .unwrap_or_default()
                                .into_iter()
                                .map(|r| r.0)
                                .collect(),
                            isr: p
                                .isr_nodes
                                .0
                                .clone()
                                .unwrap_or_default()
                                .into_iter()
                                .map(|r| r.0)
                                .collect(),
                            error: p.error,
                        })
                        .collect(),
                },
            );
        }

        Self { brokers, topics }
    }

    pub fn broker(&self, broker_id: i32) -> Option<&BrokerDescriptor> {
        self.brokers.get(&broker_id)
    }

    pub fn brokers(&self) -> impl Iterator<Item = &BrokerDescriptor> {
        self.brokers.values()
    }

    pub fn topic(&self, topic: &str) -> Option<&TopicMetadata> {
        self.topics.get(topic)
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.topics.keys().cloned().collect();
        names.sort();
        names
    }

    /// The routable partitions of a topic, sorted.
    ///
    /// A partition is routable when its leader is a broker this snapshot
    /// knows; leaderless partitions stay invisible until the next refresh.
    pub fn partitions(&self, topic: &str) -> Vec<i32> {
        let mut ids: Vec<_> = self
            .topics
            .get(topic)
            .map(|t| {
                t.partitions
                    .iter()
                    .filter(|p| p.leader >= 0 && self.brokers.contains_key(&p.leader))
                    .map(|p| p.partition_id)
                    .collect()
            })
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// The leader broker of a partition, `None` when unroutable.
    pub fn leader(&self, topic: &str, partition: i32) -> Option<&BrokerDescriptor> {
        let meta = self
            .topics
            .get(topic)?
            .partitions
            .iter()
            .find(|p| p.partition_id == partition)?;
        if meta.leader < 0 {
            return None;
        }
        self.brokers.get(&meta.leader)
    }
}

/// Per-partition outcomes of one logical operation.
pub type PartitionResults<T> = BTreeMap<TopicPartition, Result<T>>;

/// An operation that targets partition leaders and can be scattered across
/// brokers.
#[async_trait]
pub(crate) trait PartitionedOp: Sync {
    type Payload: Send + Sync + Clone;
    type Output: Send;

    fn name(&self) -> &'static str;

    /// Issue one wire request covering `items` on the given connection and
    /// split the response back into per-partition outcomes.
    async fn dispatch(
        &self,
        connection: BrokerConnection,
        items: Vec<(TopicPartition, Self::Payload)>,
    ) -> Result<Vec<(TopicPartition, Result<Self::Output, ApiError>)>, RequestError>;
}

fn group_by_leader<P: Clone>(
    snapshot: &ClusterState,
    pending: &BTreeMap<TopicPartition, P>,
) -> (
    BTreeMap<i32, Vec<(TopicPartition, P)>>,
    Vec<TopicPartition>,
) {
    let mut by_leader: BTreeMap<i32, Vec<(TopicPartition, P)>> = BTreeMap::new();
    let mut unroutable = vec![];

    for (tp, payload) in pending {
        match snapshot.leader(&tp.topic, tp.partition) {
            Some(broker) => by_leader
                .entry(broker.broker_id)
                .or_default()
                .push((tp.clone(), payload.clone())),
            None => unroutable.push(tp.clone()),
        }
    }

    (by_leader, unroutable)
}

enum LeaderOutcome<T> {
    PerPartition(Vec<(TopicPartition, Result<T, ApiError>)>),
    BrokerFailed {
        partitions: Vec<TopicPartition>,
        message: String,
        retriable: bool,
    },
}

/// Owns the cluster state and every broker connection.
pub struct Cluster {
    connector: Arc<BrokerConnector>,
    seeds: Vec<String>,
    state: RwLock<Arc<ClusterState>>,
    refresh_lock: AsyncMutex<()>,
    refresh_generation: AtomicU64,
    refresh_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    backoff_config: BackoffConfig,
    max_attempts: usize,
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.lock().take() {
            task.abort();
        }
    }
}

impl Cluster {
    pub(crate) fn new(
        connector: Arc<BrokerConnector>,
        seeds: Vec<String>,
        backoff_config: BackoffConfig,
        max_attempts: usize,
    ) -> Self {
        Self {
            connector,
            seeds,
            state: RwLock::new(Arc::new(ClusterState::default())),
            refresh_lock: AsyncMutex::new(()),
            refresh_generation: AtomicU64::new(0),
            refresh_task: parking_lot::Mutex::new(None),
            backoff_config,
            max_attempts,
        }
    }

    /// Refresh metadata on a timer until the cluster is dropped.
    ///
    /// The task holds only a weak handle, so it does not keep the cluster
    /// alive on its own.
    pub(crate) fn start_background_refresh(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(cluster) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = cluster.refresh_metadata().await {
                    warn!(%e, "Background metadata refresh failed");
                }
            }
        });

        if let Some(previous) = self.refresh_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// The current snapshot. Cheap; holds no lock beyond the clone.
    pub fn state(&self) -> Arc<ClusterState> {
        Arc::clone(&self.state.read())
    }

    fn apply(&self, response: &MetadataResponse) {
        let state = Arc::new(ClusterState::from_response(response));
        debug!(
            brokers = state.brokers.len(),
            topics = state.topics.len(),
            "Applying new cluster state"
        );
        *self.state.write() = state;
        self.refresh_generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Connect to the seed hosts and take the initial snapshot.
    pub async fn bootstrap(&self) -> Result<()> {
        let response = self.connector.bootstrap(&self.seeds).await?;
        self.apply(&response);
        let state = self.state();
        let alive: Vec<_> = state.brokers.keys().copied().collect();
        self.connector.retain(&alive).await;
        info!(brokers = alive.len(), "Cluster bootstrapped");
        Ok(())
    }

    /// Fetch fresh metadata and atomically swap the snapshot.
    ///
    /// Single-flight: a caller that finds a refresh already under way waits
    /// for it instead of issuing another metadata request.
    pub async fn refresh_metadata(&self) -> Result<()> {
        let generation = self.refresh_generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;
        if self.refresh_generation.load(Ordering::Acquire) != generation {
            debug!("Coalesced into a refresh that was already in flight");
            return Ok(());
        }

        let response = self.metadata_from_any_broker().await?;
        self.apply(&response);
        let state = self.state();
        let alive: Vec<_> = state.brokers.keys().copied().collect();
        self.connector.retain(&alive).await;
        Ok(())
    }

    async fn metadata_from_any_broker(&self) -> Result<MetadataResponse> {
        match self.any_connection().await {
            Ok(connection) => match connection.request(MetadataRequest { topics: vec![] }).await {
                Ok(response) => return Ok(response),
                Err(e) => warn!(%e, "Metadata request on cached connection failed, re-bootstrapping"),
            },
            Err(e) => warn!(%e, "No cached broker reachable, re-bootstrapping"),
        }

        Ok(self.connector.bootstrap(&self.seeds).await?)
    }

    async fn any_connection(&self) -> Result<BrokerConnection> {
        let state = self.state();
        let brokers: Vec<(i32, String, u16)> = state
            .brokers()
            .map(|b| (b.broker_id, b.host.clone(), b.port))
            .collect();
        if brokers.is_empty() {
            return Err(Error::Connection("no brokers known".to_owned()));
        }
        Ok(self.connector.any(&brokers).await?)
    }

    /// Make sure a topic is present in the snapshot, refreshing once if not.
    pub async fn ensure_topic(&self, topic: &str) -> Result<()> {
        if self.state().topic(topic).is_some() {
            return Ok(());
        }
        debug!(topic, "Topic unknown, refreshing metadata");
        self.refresh_metadata().await?;
        if self.state().topic(topic).is_some() {
            return Ok(());
        }
        Err(Error::Broker(ApiError::UnknownTopicOrPartition))
    }

    /// Issue a request on the connection of a specific broker.
    pub(crate) async fn request_broker<R>(
        &self,
        broker_id: i32,
        msg: R,
    ) -> Result<R::ResponseBody>
    where
        R: RequestBody + Send + WriteVersionedType<Vec<u8>>,
        R::ResponseBody: ReadVersionedType<std::io::Cursor<Vec<u8>>>,
    {
        let state = self.state();
        let broker = state
            .broker(broker_id)
            .ok_or_else(|| Error::Connection(format!("broker {broker_id} not in cluster state")))?;
        let connection = self
            .connector
            .get(broker.broker_id, &broker.host, broker.port)
            .await?;
        Ok(connection.request(msg).await?)
    }

    /// Issue a request any live broker can answer, preferring the least
    /// recently used connection.
    pub(crate) async fn request_any<R>(&self, msg: R) -> Result<R::ResponseBody>
    where
        R: RequestBody + Send + WriteVersionedType<Vec<u8>>,
        R::ResponseBody: ReadVersionedType<std::io::Cursor<Vec<u8>>>,
    {
        let connection = self.any_connection().await?;
        Ok(connection.request(msg).await?)
    }

    /// Locate the coordinator broker of a group, retrying through metadata
    /// refreshes until the coordinator is part of the snapshot.
    pub async fn find_coordinator(&self, group: &str) -> Result<i32> {
        let mut backoff = Backoff::new(&self.backoff_config);
        let group = group.to_owned();

        backoff
            .retry_with_backoff("find coordinator", self.max_attempts, || async {
                let response = match self
                    .request_any(GroupCoordinatorRequest {
                        group_id: String_(group.clone()),
                    })
                    .await
                {
                    Ok(response) => response,
                    Err(e @ Error::Connection(_)) => {
                        return std::ops::ControlFlow::Continue(e);
                    }
                    Err(e) => return std::ops::ControlFlow::Break(Err(e)),
                };

                match response.error {
                    None => {
                        let coordinator_id = response.coordinator_id.0;
                        if self.state().broker(coordinator_id).is_none() {
                            if let Err(e) = self.refresh_metadata().await {
                                return std::ops::ControlFlow::Continue(e);
                            }
                        }
                        if self.state().broker(coordinator_id).is_none() {
                            return std::ops::ControlFlow::Continue(Error::Connection(format!(
                                "coordinator broker {coordinator_id} not in cluster state"
                            )));
                        }
                        std::ops::ControlFlow::Break(Ok(coordinator_id))
                    }
                    Some(e) => match e.classify() {
                        ErrorClass::Fatal => std::ops::ControlFlow::Break(Err(Error::Broker(e))),
                        _ => std::ops::ControlFlow::Continue(Error::Broker(e)),
                    },
                }
            })
            .await
            .unwrap_or_else(|e| Err(e))
    }

    /// List groups across every broker of the cluster.
    pub async fn list_groups(&self) -> Result<Vec<ListedGroup>> {
        let state = self.state();
        let futures: Vec<_> = state
            .brokers()
            .map(|broker| {
                let broker = broker.clone();
                async move {
                    self.request_broker(broker.broker_id, ListGroupsRequest {})
                        .await
                }
            })
            .collect();

        let mut groups = vec![];
        for result in join_all(futures).await {
            let response = result?;
            if let Some(e) = response.error {
                return Err(Error::Broker(e));
            }
            groups.extend(response.groups);
        }
        groups.sort_by(|a, b| a.group_id.0.cmp(&b.group_id.0));
        Ok(groups)
    }

    /// Describe a group on its coordinator broker.
    pub async fn describe_group(&self, group: &str) -> Result<DescribedGroup> {
        let coordinator_id = self.find_coordinator(group).await?;
        let response = self
            .request_broker(
                coordinator_id,
                DescribeGroupsRequest {
                    groups: Array(Some(vec![String_(group.to_owned())])),
                },
            )
            .await?;

        response
            .groups
            .into_iter()
            .find(|g| g.group_id.0 == group)
            .ok_or_else(|| {
                Error::InvalidResponse(format!("coordinator did not describe group '{group}'"))
            })
    }

    /// Scatter a partitioned operation across the current leaders, gather
    /// the per-partition outcomes, and retry the retriable ones.
    ///
    /// Stale-leadership errors trigger a metadata refresh before the next
    /// attempt; fatal errors surface per partition alongside successes. When
    /// `deadline` elapses, whatever is still outstanding is marked
    /// [`Error::TimedOut`] and abandoned.
    pub(crate) async fn dispatch<O>(
        &self,
        op: &O,
        items: Vec<(TopicPartition, O::Payload)>,
        deadline: Option<Duration>,
    ) -> PartitionResults<O::Output>
    where
        O: PartitionedOp,
    {
        let started = Instant::now();
        let mut pending: BTreeMap<TopicPartition, O::Payload> = items.into_iter().collect();
        let mut results: PartitionResults<O::Output> = BTreeMap::new();
        let mut last_errors: BTreeMap<TopicPartition, Error> = BTreeMap::new();
        let mut backoff = Backoff::new(&self.backoff_config);

        for attempt in 1..=self.max_attempts {
            if pending.is_empty() {
                break;
            }

            let remaining = match deadline {
                Some(deadline) => match deadline.checked_sub(started.elapsed()) {
                    Some(remaining) => Some(remaining),
                    None => break,
                },
                None => None,
            };

            let snapshot = self.state();
            let (by_leader, unroutable) = group_by_leader(&snapshot, &pending);
            let mut need_refresh = !unroutable.is_empty();
            for tp in unroutable {
                last_errors.insert(tp, Error::Broker(ApiError::LeaderNotAvailable));
            }

            let futures: Vec<_> = by_leader
                .into_iter()
                .map(|(broker_id, group)| {
                    let broker = snapshot
                        .broker(broker_id)
                        .expect("leader resolved from the same snapshot")
                        .clone();
                    async move {
                        let partitions: Vec<_> = group.iter().map(|(tp, _)| tp.clone()).collect();
                        let connection = match self
                            .connector
                            .get(broker.broker_id, &broker.host, broker.port)
                            .await
                        {
                            Ok(connection) => connection,
                            Err(e) => {
                                return LeaderOutcome::BrokerFailed {
                                    partitions,
                                    message: e.to_string(),
                                    retriable: true,
                                }
                            }
                        };

                        match op.dispatch(connection, group).await {
                            Ok(outcomes) => LeaderOutcome::PerPartition(outcomes),
                            Err(e) => LeaderOutcome::BrokerFailed {
                                partitions,
                                retriable: e.is_connection_error(),
                                message: e.to_string(),
                            },
                        }
                    }
                })
                .collect();

            let outcomes = match remaining {
                Some(remaining) => match tokio::time::timeout(remaining, join_all(futures)).await {
                    Ok(outcomes) => outcomes,
                    Err(_) => {
                        debug!(op = op.name(), "Deadline elapsed, abandoning sub-requests");
                        break;
                    }
                },
                None => join_all(futures).await,
            };

            for outcome in outcomes {
                match outcome {
                    LeaderOutcome::PerPartition(per_partition) => {
                        for (tp, result) in per_partition {
                            match result {
                                Ok(output) => {
                                    pending.remove(&tp);
                                    last_errors.remove(&tp);
                                    results.insert(tp, Ok(output));
                                }
                                Err(api_error) => match api_error.classify() {
                                    ErrorClass::Fatal => {
                                        pending.remove(&tp);
                                        last_errors.remove(&tp);
                                        results.insert(tp, Err(Error::Broker(api_error)));
                                    }
                                    ErrorClass::Retriable => {
                                        last_errors.insert(tp, Error::Broker(api_error));
                                    }
                                    ErrorClass::Refresh => {
                                        need_refresh = true;
                                        last_errors.insert(tp, Error::Broker(api_error));
                                    }
                                },
                            }
                        }
                    }
                    LeaderOutcome::BrokerFailed {
                        partitions,
                        message,
                        retriable,
                    } => {
                        need_refresh |= retriable;
                        for tp in partitions {
                            if retriable {
                                last_errors.insert(tp, Error::Connection(message.clone()));
                            } else {
                                pending.remove(&tp);
                                last_errors.remove(&tp);
                                results.insert(tp, Err(Error::Connection(message.clone())));
                            }
                        }
                    }
                }
            }

            if pending.is_empty() || attempt == self.max_attempts {
                break;
            }

            if need_refresh {
                if let Err(e) = self.refresh_metadata().await {
                    warn!(%e, "Metadata refresh between attempts failed");
                }
            }
            tokio::time::sleep(backoff.next()).await;
        }

        let deadline_hit = deadline.is_some_and(|d| started.elapsed() >= d);
        for (tp, _) in pending {
            let error = if deadline_hit {
                Error::TimedOut
            } else {
                last_errors
                    .remove(&tp)
                    .unwrap_or(Error::Broker(ApiError::RequestTimedOut))
            };
            results.insert(tp, Err(error));
        }

        results
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("seeds", &self.seeds)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Produce message sets to partition leaders.
pub(crate) struct ProduceOp {
    pub required_acks: Int16,
    pub timeout_ms: Int32,
}

#[async_trait]
impl PartitionedOp for ProduceOp {
    type Payload = MessageSet;
    type Output = i64;

    fn name(&self) -> &'static str {
        "produce"
    }

    async fn dispatch(
        &self,
        connection: BrokerConnection,
        items: Vec<(TopicPartition, Self::Payload)>,
    ) -> Result<Vec<(TopicPartition, Result<Self::Output, ApiError>)>, RequestError> {
        let mut topics: BTreeMap<String, Vec<ProduceRequestPartition>> = BTreeMap::new();
        for (tp, message_set) in items {
            topics.entry(tp.topic).or_default().push(ProduceRequestPartition {
                index: Int32(tp.partition),
                message_set,
            });
        }

        let request = ProduceRequest {
            required_acks: self.required_acks,
            timeout_ms: self.timeout_ms,
            topics: topics
                .into_iter()
                .map(|(name, partitions)| ProduceRequestTopic {
                    name: String_(name),
                    partitions,
                })
                .collect(),
        };

        let response = connection.request(request).await?;

        let mut outcomes = vec![];
        for topic in response.topics {
            for partition in topic.partitions {
                let tp = TopicPartition::new(topic.name.0.clone(), partition.index.0);
                outcomes.push((
                    tp,
                    match partition.error {
                        None => Ok(partition.base_offset.0),
                        Some(e) => Err(e),
                    },
                ));
            }
        }
        Ok(outcomes)
    }
}

/// What to fetch from one partition.
#[derive(Debug, Clone)]
pub(crate) struct FetchPosition {
    pub offset: i64,
    pub max_bytes: i32,
}

/// Fetched records plus the partition's high watermark.
#[derive(Debug)]
pub(crate) struct FetchedPartition {
    pub message_set: MessageSet,
    pub high_watermark: i64,
}

/// Fetch message sets from partition leaders.
pub(crate) struct FetchOp {
    pub max_wait_ms: Int32,
    pub min_bytes: Int32,
}

#[async_trait]
impl PartitionedOp for FetchOp {
    type Payload = FetchPosition;
    type Output = FetchedPartition;

    fn name(&self) -> &'static str {
        "fetch"
    }

    async fn dispatch(
        &self,
        connection: BrokerConnection,
        items: Vec<(TopicPartition, Self::Payload)>,
    ) -> Result<Vec<(TopicPartition, Result<Self::Output, ApiError>)>, RequestError> {
        let mut topics: BTreeMap<String, Vec<FetchRequestPartition>> = BTreeMap::new();
        for (tp, position) in items {
            topics.entry(tp.topic).or_default().push(FetchRequestPartition {
                partition: Int32(tp.partition),
                fetch_offset: Int64(position.offset),
                max_bytes: Int32(position.max_bytes),
            });
        }

        let request = FetchRequest {
            replica_id: NORMAL_CONSUMER,
            max_wait_ms: self.max_wait_ms,
            min_bytes: self.min_bytes,
            topics: topics
                .into_iter()
                .map(|(name, partitions)| FetchRequestTopic {
                    name: String_(name),
                    partitions,
                })
                .collect(),
        };

        let response = connection.request(request).await?;

        let mut outcomes = vec![];
        for topic in response.topics {
            for partition in topic.partitions {
                let tp = TopicPartition::new(topic.name.0.clone(), partition.partition.0);
                outcomes.push((
                    tp,
                    match partition.error {
                        None => Ok(FetchedPartition {
                            message_set: partition.message_set,
                            high_watermark: partition.high_watermark.0,
                        }),
                        Some(e) => Err(e),
                    },
                ));
            }
        }
        Ok(outcomes)
    }
}

/// Resolve offsets by timestamp on partition leaders.
pub(crate) struct ListOffsetsOp {}

#[derive(Debug, Clone)]
pub(crate) struct OffsetQuery {
    pub timestamp: i64,
    pub max_num_offsets: i32,
}

#[async_trait]
impl PartitionedOp for ListOffsetsOp {
    type Payload = OffsetQuery;
    type Output = Vec<i64>;

    fn name(&self) -> &'static str {
        "list offsets"
    }

    async fn dispatch(
        &self,
        connection: BrokerConnection,
        items: Vec<(TopicPartition, Self::Payload)>,
    ) -> Result<Vec<(TopicPartition, Result<Self::Output, ApiError>)>, RequestError> {
        let mut topics: BTreeMap<String, Vec<ListOffsetsRequestPartition>> = BTreeMap::new();
        for (tp, query) in items {
            topics
                .entry(tp.topic)
                .or_default()
                .push(ListOffsetsRequestPartition {
                    partition_index: Int32(tp.partition),
                    timestamp: Int64(query.timestamp),
                    max_num_offsets: Int32(query.max_num_offsets),
                });
        }

        let request = ListOffsetsRequest {
            replica_id: NORMAL_CONSUMER,
            topics: topics
                .into_iter()
                .map(|(name, partitions)| ListOffsetsRequestTopic {
                    name: String_(name),
                    partitions,
                })
                .collect(),
        };

        let response = connection.request(request).await?;

        let mut outcomes = vec![];
        for topic in response.topics {
            for partition in topic.partitions {
                let tp = TopicPartition::new(topic.name.0.clone(), partition.partition_index.0);
                outcomes.push((
                    tp,
                    match partition.error {
                        None => Ok(partition
                            .offsets
                            .0
                            .unwrap_or_default()
                            .into_iter()
                            .map(|o| o.0)
                            .collect()),
                        Some(e) => Err(e),
                    },
                ));
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::messages::{
        MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
    };

    fn synthetic_state(partitions_per_broker: &[(i32, Vec<i32>)]) -> ClusterState {
        let brokers = partitions_per_broker
            .iter()
            .map(|(broker_id, _)| MetadataResponseBroker {
                node_id: Int32(*broker_id),
                host: String_(format!("broker-{broker_id}")),
                port: Int32(9092),
            })
            .collect();

        let partitions = partitions_per_broker
            .iter()
            .flat_map(|(broker_id, partitions)| {
                partitions.iter().map(|p| MetadataResponsePartition {
                    error: None,
                    partition_index: Int32(*p),
                    leader_id: Int32(*broker_id),
                    replica_nodes: Array(Some(vec![Int32(*broker_id)])),
                    isr_nodes: Array(Some(vec![Int32(*broker_id)])),
                })
            })
            .collect();

        ClusterState::from_response(&MetadataResponse {
            brokers,
            topics: vec![MetadataResponseTopic {
                error: None,
                name: String_("colors".to_owned()),
                partitions,
            }],
        })
    }

    #[test]
    fn test_leader_lookup() {
        let state = synthetic_state(&[(1, vec![0, 2]), (2, vec![1, 3])]);

        assert_eq!(state.leader("colors", 0).unwrap().broker_id, 1);
        assert_eq!(state.leader("colors", 1).unwrap().broker_id, 2);
        assert_eq!(state.leader("colors", 3).unwrap().broker_id, 2);
        assert!(state.leader("colors", 9).is_none());
        assert!(state.leader("shapes", 0).is_none());

        assert_eq!(state.partitions("colors"), vec![0, 1, 2, 3]);
        assert!(state.partitions("shapes").is_empty());
    }

    #[test]
    fn test_leaderless_partition_is_unroutable() {
        let state = ClusterState::from_response(&MetadataResponse {
            brokers: vec![MetadataResponseBroker {
                node_id: Int32(1),
                host: String_("broker-1".to_owned()),
                port: Int32(9092),
            }],
            topics: vec![MetadataResponseTopic {
                error: None,
                name: String_("colors".to_owned()),
                partitions: vec![
                    MetadataResponsePartition {
                        error: None,
                        partition_index: Int32(0),
                        leader_id: Int32(1),
                        replica_nodes: Array(Some(vec![])),
                        isr_nodes: Array(Some(vec![])),
                    },
                    MetadataResponsePartition {
                        error: Some(ApiError::LeaderNotAvailable),
                        partition_index: Int32(1),
                        leader_id: Int32(-1),
                        replica_nodes: Array(Some(vec![])),
                        isr_nodes: Array(Some(vec![])),
                    },
                    // leader not in the broker map
                    MetadataResponsePartition {
                        error: None,
                        partition_index: Int32(2),
                        leader_id: Int32(7),
                        replica_nodes: Array(Some(vec![])),
                        isr_nodes: Array(Some(vec![])),
                    },
                ],
            }],
        });

        assert_eq!(state.partitions("colors"), vec![0]);
        assert!(state.leader("colors", 1).is_none());
        assert!(state.leader("colors", 2).is_none());
    }

    #[test]
    fn test_group_by_leader_emits_one_group_per_involved_leader() {
        let state = synthetic_state(&[(1, vec![0, 2]), (2, vec![1, 3]), (3, vec![4])]);

        let pending: BTreeMap<TopicPartition, ()> = (0..4)
            .map(|p| (TopicPartition::new("colors", p), ()))
            .collect();

        let (by_leader, unroutable) = group_by_leader(&state, &pending);

        assert!(unroutable.is_empty());
        // broker 3 leads partition 4 only, which is not part of the request
        assert_eq!(by_leader.len(), 2);

        let partitions_of = |broker_id: i32| -> Vec<i32> {
            by_leader[&broker_id]
                .iter()
                .map(|(tp, _)| tp.partition)
                .collect()
        };
        assert_eq!(partitions_of(1), vec![0, 2]);
        assert_eq!(partitions_of(2), vec![1, 3]);
    }

    #[test]
    fn test_group_by_leader_reports_unroutable() {
        let state = synthetic_state(&[(1, vec![0])]);

        let pending: BTreeMap<TopicPartition, ()> = (0..2)
            .map(|p| (TopicPartition::new("colors", p), ()))
            .collect();

        let (by_leader, unroutable) = group_by_leader(&state, &pending);
        assert_eq!(by_leader.len(), 1);
        assert_eq!(unroutable, vec![TopicPartition::new("colors", 1)]);
    }
}
