//! The consume path shared by the single and the grouped consumer, plus the
//! single-consumer façade.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::error::{Error, Result};
use super::Client;
use crate::cluster::{
    Cluster, FetchOp, FetchPosition, ListOffsetsOp, OffsetQuery, TopicPartition,
};
use crate::offsets::{OffsetTable, Start};
use crate::protocol::error::Error as ApiError;
use crate::protocol::primitives::Int32;
use crate::record::Record;

/// Deserializes record bytes into a value. The default parses JSON.
pub type DeserializerFn = Arc<dyn Fn(&[u8]) -> Result<Value> + Send + Sync>;

pub(crate) fn json_deserializer() -> DeserializerFn {
    Arc::new(|raw| Ok(serde_json::from_slice(raw)?))
}

/// The outcome of one consume call: records for the partitions that
/// answered, error markers for the ones that did not.
#[derive(Debug, Default)]
pub struct ConsumedBatch {
    /// Delivered records, in per-partition offset order.
    pub records: Vec<Record>,

    /// Partitions that failed, alongside the successes.
    pub errors: BTreeMap<i32, Error>,
}

impl ConsumedBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.errors.is_empty()
    }
}

/// Configuration shared by both consumer flavors.
#[derive(Clone)]
pub(crate) struct ConsumerConfig {
    pub deserializer: DeserializerFn,
    pub max_wait_time: Duration,
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub deadline: Option<Duration>,
}

impl ConsumerConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_bytes <= 0 {
            return Err(Error::Configuration(format!(
                "max_bytes must be positive, got {}",
                self.max_bytes
            )));
        }
        if self.min_bytes < 0 {
            return Err(Error::Configuration(format!(
                "min_bytes must not be negative, got {}",
                self.min_bytes
            )));
        }
        Ok(())
    }
}

/// Offset-tracking fetch engine used by both consumer flavors.
pub(crate) struct ConsumerCore {
    pub(crate) cluster: Arc<Cluster>,
    pub(crate) config: ConsumerConfig,
    pub(crate) offsets: Mutex<OffsetTable>,
}

impl ConsumerCore {
    pub(crate) fn new(cluster: Arc<Cluster>, config: ConsumerConfig) -> Self {
        Self {
            cluster,
            config,
            offsets: Mutex::new(OffsetTable::default()),
        }
    }

    /// Resolve offsets for `partitions` of a topic from a start hint and
    /// seed the table with them.
    pub(crate) async fn seed_from_start(
        &self,
        topic: &str,
        partitions: &[i32],
        start: Start,
    ) -> Result<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        debug!(topic, ?start, ?partitions, "Resolving start offsets");

        let query = OffsetQuery {
            timestamp: start.to_timestamp(),
            max_num_offsets: 1,
        };
        let items: Vec<_> = partitions
            .iter()
            .map(|p| (TopicPartition::new(topic, *p), query.clone()))
            .collect();

        let results = self
            .cluster
            .dispatch(&ListOffsetsOp {}, items, self.config.deadline)
            .await;

        for (tp, result) in results {
            match result {
                Ok(offsets) => match offsets.first() {
                    Some(offset) => self.offsets.lock().seed(tp, *offset),
                    None => {
                        return Err(Error::InvalidResponse(format!(
                            "no offset returned for {tp}"
                        )))
                    }
                },
                Err(e) => {
                    error!(%tp, error = %e, "Unable to determine start offset");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Fetch once from the given partitions, deserializing and advancing
    /// offsets past everything delivered.
    ///
    /// Partitions whose stored offset fell out of the broker's range are
    /// re-seeded from `start` and fetched again in the same call.
    pub(crate) async fn fetch(
        &self,
        topic: &str,
        partitions: &[i32],
        start: Start,
    ) -> Result<ConsumedBatch> {
        if partitions.is_empty() {
            return Err(Error::Configuration(format!(
                "cannot split max_bytes across zero partitions of topic '{topic}'"
            )));
        }
        let per_partition_bytes = self.config.max_bytes / partitions.len() as i32;

        let mut batch = ConsumedBatch::default();
        let mut targets: Vec<i32> = partitions.to_vec();

        // one recovery pass: out-of-range partitions are re-seeded from the
        // start hint and fetched a second time
        for recovery_pass in [false, true] {
            let items: Vec<_> = {
                let offsets = self.offsets.lock();
                targets
                    .iter()
                    .map(|p| {
                        let tp = TopicPartition::new(topic, *p);
                        let offset = offsets.next_offset(&tp).unwrap_or(0);
                        (
                            tp,
                            FetchPosition {
                                offset,
                                max_bytes: per_partition_bytes,
                            },
                        )
                    })
                    .collect()
            };

            let op = FetchOp {
                max_wait_ms: Int32(self.config.max_wait_time.as_millis() as i32),
                min_bytes: Int32(self.config.min_bytes),
            };
            let results = self.cluster.dispatch(&op, items, self.config.deadline).await;

            let mut out_of_range = vec![];
            for (tp, result) in results {
                match result {
                    Ok(fetched) => {
                        self.deliver(&tp, fetched.message_set.0, &mut batch);
                    }
                    Err(Error::Broker(ApiError::OffsetOutOfRange)) if !recovery_pass => {
                        warn!(%tp, "Offset out of range, re-applying start position");
                        out_of_range.push(tp.partition);
                    }
                    Err(e) => {
                        batch.errors.insert(tp.partition, e);
                    }
                }
            }

            if out_of_range.is_empty() {
                break;
            }
            self.seed_from_start(topic, &out_of_range, start).await?;
            targets = out_of_range;
        }

        Ok(batch)
    }

    fn deliver(
        &self,
        tp: &TopicPartition,
        entries: Vec<crate::protocol::record::MessageSetEntry>,
        batch: &mut ConsumedBatch,
    ) {
        for entry in entries {
            let value = match entry.message.value.as_deref() {
                Some(raw) => match (self.config.deserializer)(raw) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        error!(%tp, offset = entry.offset, error = %e, "Error deserializing record, skipping");
                        None
                    }
                },
                None => {
                    debug!(%tp, offset = entry.offset, "Skipping record with null value");
                    None
                }
            };

            // the cursor moves past skipped records too, or the next fetch
            // would loop on them forever
            self.offsets.lock().record_delivered(tp.clone(), entry.offset);

            if let Some(value) = value {
                batch.records.push(Record {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    offset: entry.offset,
                    key: entry.message.key,
                    value,
                });
            }
        }
    }
}

/// Builder for [`SingleConsumer`].
pub struct SingleConsumerBuilder {
    seeds: Vec<String>,
    client: Option<Arc<Cluster>>,
    deserializer: DeserializerFn,
    max_wait_time: Duration,
    min_bytes: i32,
    max_bytes: i32,
    deadline: Option<Duration>,
}

impl SingleConsumerBuilder {
    /// Start from seed broker addresses.
    pub fn new(seeds: Vec<String>) -> Self {
        Self {
            seeds,
            client: None,
            deserializer: json_deserializer(),
            max_wait_time: Duration::from_millis(1000),
            min_bytes: 1,
            max_bytes: 1024 * 1024,
            deadline: None,
        }
    }

    /// Share the cluster of an existing [`Client`].
    pub fn from_client(client: &Client) -> Self {
        let mut builder = Self::new(vec![]);
        builder.client = Some(client.cluster());
        builder
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

    /// Total fetch budget, divided evenly across the partitions of a topic.
    ///
    /// The split is approximate; brokers may exceed their share by framing
    /// overhead.
    pub fn max_bytes(mut self, max_bytes: i32) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Overall deadline per consume call.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Connect and return the consumer.
    pub async fn connect(self) -> Result<SingleConsumer> {
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

        Ok(SingleConsumer {
            core: ConsumerCore::new(cluster, config),
        })
    }
}

/// A consumer that runs on its own and reads every partition of the topics
/// it consumes.
pub struct SingleConsumer {
    core: ConsumerCore,
}

impl SingleConsumer {
    /// Consume the next batch from every partition of a topic.
    ///
    /// `start` is honored on the first consumption of the topic and again
    /// after an offset-out-of-range error; otherwise the stored offsets
    /// decide where to resume.
    pub async fn consume(&self, topic: &str, start: Start) -> Result<ConsumedBatch> {
        self.core.cluster.ensure_topic(topic).await?;
        let partitions = self.core.cluster.state().partitions(topic);

        if !self.core.offsets.lock().is_synced(topic) {
            self.core.seed_from_start(topic, &partitions, start).await?;
            self.core.offsets.lock().mark_synced(topic);
        }

        self.core.fetch(topic, &partitions, start).await
    }

    /// Wind the consumer down. The single consumer keeps no remote state,
    /// so this is immediate.
    pub async fn close(self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for SingleConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleConsumer").finish_non_exhaustive()
    }
}
