//! The produce façade: serialize, pick a partition, batch, and flush to the
//! partition leaders.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::prelude::*;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::error::{Error, Result};
use super::Client;
use crate::cluster::{Cluster, ProduceOp, TopicPartition};
use crate::protocol::error::{Error as ApiError, ErrorClass};
use crate::protocol::primitives::{Int16, Int32};
use crate::protocol::record::{Message, MessageCompression, MessageSet};

/// Serializes a value into record bytes. The default JSON-encodes with
/// sorted keys.
pub type SerializerFn = Arc<dyn Fn(&Value) -> Result<Vec<u8>> + Send + Sync>;

/// Derives an optional record key from a value. The default produces none.
pub type KeyMakerFn = Arc<dyn Fn(&Value) -> Option<Vec<u8>> + Send + Sync>;

/// Picks a partition for a key among the routable partitions of the topic.
/// The default picks at random.
pub type PartitionerFn = Arc<dyn Fn(Option<&[u8]>, &[i32]) -> i32 + Send + Sync>;

fn json_serializer() -> SerializerFn {
    // serde_json maps are ordered, so equal values produce equal bytes
    Arc::new(|value| Ok(serde_json::to_vec(value)?))
}

fn null_key_maker() -> KeyMakerFn {
    Arc::new(|_| None)
}

fn random_partitioner() -> PartitionerFn {
    Arc::new(|_, partitions| {
        *partitions
            .choose(&mut thread_rng())
            .expect("partitioner is never offered an empty partition list")
    })
}

/// Builder for [`Producer`].
pub struct ProducerBuilder {
    client: ClientSource,
    serializer: SerializerFn,
    key_maker: KeyMakerFn,
    partitioner: PartitionerFn,
    batch_size: usize,
    compression: MessageCompression,
    required_acks: i16,
    ack_timeout: Duration,
    deadline: Option<Duration>,
}

enum ClientSource {
    Seeds(Vec<String>),
    Built(Arc<Cluster>),
}

impl ProducerBuilder {
    /// Start from seed broker addresses.
    pub fn new(seeds: Vec<String>) -> Self {
        Self::with_source(ClientSource::Seeds(seeds))
    }

    /// Share the cluster of an existing [`Client`].
    pub fn from_client(client: &Client) -> Self {
        Self::with_source(ClientSource::Built(client.cluster()))
    }

    fn with_source(client: ClientSource) -> Self {
        Self {
            client,
            serializer: json_serializer(),
            key_maker: null_key_maker(),
            partitioner: random_partitioner(),
            batch_size: 1,
            compression: MessageCompression::NoCompression,
            required_acks: -1,
            ack_timeout: Duration::from_millis(500),
            deadline: None,
        }
    }

    /// Replace the value serializer.
    pub fn serializer(mut self, serializer: SerializerFn) -> Self {
        self.serializer = serializer;
        self
    }

    /// Replace the key maker.
    pub fn key_maker(mut self, key_maker: KeyMakerFn) -> Self {
        self.key_maker = key_maker;
        self
    }

    /// Replace the partitioner.
    pub fn partitioner(mut self, partitioner: PartitionerFn) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// Messages to accumulate before a flush; `1` flushes on every produce.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Compress flushed batches with the given codec.
    pub fn compression(mut self, compression: MessageCompression) -> Self {
        self.compression = compression;
        self
    }

    /// Acknowledgments required from the broker: `1` for the leader only,
    /// `-1` for the full in-sync replica set.
    pub fn required_acks(mut self, required_acks: i16) -> Self {
        self.required_acks = required_acks;
        self
    }

    /// Broker-side wait for acknowledgments.
    pub fn ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    /// Overall deadline per flush; unfinished partitions report
    /// [`Error::TimedOut`].
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Connect and return the producer.
    pub async fn connect(self) -> Result<Producer> {
        if self.required_acks == 0 {
            // acks=0 means the broker sends no response frame at all, which
            // the correlation layer cannot represent
            return Err(Error::Configuration(
                "required_acks must be 1 or -1".to_owned(),
            ));
        }
        if !matches!(self.required_acks, -1 | 1) {
            return Err(Error::Configuration(format!(
                "invalid required_acks: {}",
                self.required_acks
            )));
        }

        let cluster = match self.client {
            ClientSource::Built(cluster) => cluster,
            ClientSource::Seeds(seeds) => super::ClientBuilder::new(seeds).build().await?.cluster(),
        };

        Ok(Producer {
            cluster,
            serializer: self.serializer,
            key_maker: self.key_maker,
            partitioner: self.partitioner,
            batch_size: self.batch_size,
            compression: self.compression,
            required_acks: self.required_acks,
            ack_timeout: self.ack_timeout,
            deadline: self.deadline,
            unsent: Mutex::new(BTreeMap::new()),
            closing: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

/// Publishes records to topics.
pub struct Producer {
    cluster: Arc<Cluster>,
    serializer: SerializerFn,
    key_maker: KeyMakerFn,
    partitioner: PartitionerFn,
    batch_size: usize,
    compression: MessageCompression,
    required_acks: i16,
    ack_timeout: Duration,
    deadline: Option<Duration>,

    /// Serialized but unflushed messages per topic.
    unsent: Mutex<BTreeMap<String, Vec<Message>>>,
    closing: std::sync::atomic::AtomicBool,
}

impl Producer {
    /// Queue one value for a topic, flushing when the batch is full.
    ///
    /// With the default batch size of 1 this sends immediately and reports
    /// the outcome for the message's partition.
    pub async fn produce(&self, topic: &str, value: &Value) -> Result<()> {
        let key = (self.key_maker)(value);
        self.produce_keyed(topic, value, key).await
    }

    /// Like [`produce`](Self::produce) with an explicit record key,
    /// bypassing the key maker.
    pub async fn produce_keyed(
        &self,
        topic: &str,
        value: &Value,
        key: Option<Vec<u8>>,
    ) -> Result<()> {
        if self.closing.load(std::sync::atomic::Ordering::SeqCst) {
            warn!(topic, "Producing while closing");
            return Err(Error::Configuration("producer is closing".to_owned()));
        }

        self.cluster.ensure_topic(topic).await?;

        let message = Message {
            magic: 0,
            attributes: 0,
            timestamp: None,
            key,
            value: Some((self.serializer)(value)?),
        };

        let unsent_count = {
            let mut unsent = self.unsent.lock().await;
            unsent.entry(topic.to_owned()).or_default().push(message);
            unsent.values().map(Vec::len).sum::<usize>()
        };

        if self.batch_size <= 1 || unsent_count >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Send everything queued, topic by topic, leader by leader.
    ///
    /// Messages whose partitions failed retriably are queued again for the
    /// next flush; fatal per-partition errors surface here.
    pub async fn flush(&self) -> Result<()> {
        let drained: BTreeMap<String, Vec<Message>> =
            std::mem::take(&mut *self.unsent.lock().await);
        if drained.is_empty() {
            return Ok(());
        }

        let state = self.cluster.state();
        let mut items: Vec<(TopicPartition, MessageSet)> = vec![];
        let mut to_retry: BTreeMap<String, Vec<Message>> = BTreeMap::new();
        let mut per_partition: BTreeMap<TopicPartition, Vec<Message>> = BTreeMap::new();

        for (topic, messages) in drained {
            let partitions = state.partitions(&topic);
            if partitions.is_empty() {
                debug!(topic = topic.as_str(), "No routable partitions, queueing for retry");
                to_retry.entry(topic).or_default().extend(messages);
                continue;
            }

            for message in messages {
                let partition = (self.partitioner)(message.key.as_deref(), &partitions);
                per_partition
                    .entry(TopicPartition::new(topic.clone(), partition))
                    .or_default()
                    .push(message);
            }
        }

        for (tp, messages) in &per_partition {
            let message_set = MessageSet::compressed(self.compression, messages.clone())?;
            items.push((tp.clone(), message_set));
        }

        let mut first_error = None;

        if !items.is_empty() {
            let op = ProduceOp {
                required_acks: Int16(self.required_acks),
                timeout_ms: Int32(self.ack_timeout.as_millis() as i32),
            };

            let results = self.cluster.dispatch(&op, items, self.deadline).await;

            for (tp, result) in results {
                match result {
                    Ok(base_offset) => {
                        debug!(%tp, base_offset, "Produced batch");
                    }
                    Err(e @ (Error::Connection(_) | Error::Broker(_)))
                        if !matches!(&e, Error::Broker(code) if code.classify() == ErrorClass::Fatal) =>
                    {
                        // the dispatcher exhausted its budget on a transient
                        // error; keep the messages for the next flush
                        warn!(%tp, error = %e, "Queueing messages for retry");
                        let messages = per_partition.get(&tp).cloned().unwrap_or_default();
                        to_retry.entry(tp.topic.clone()).or_default().extend(messages);
                        first_error.get_or_insert(e);
                    }
                    Err(e) => {
                        error!(%tp, error = %e, "Dropping batch after fatal produce error");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        if !to_retry.is_empty() {
            {
                let mut unsent = self.unsent.lock().await;
                for (topic, messages) in to_retry {
                    unsent.entry(topic).or_default().extend(messages);
                }
            }
            self.cluster.refresh_metadata().await.ok();
            first_error.get_or_insert(Error::Broker(ApiError::LeaderNotAvailable));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of messages queued but not yet flushed.
    pub async fn unsent_count(&self) -> usize {
        self.unsent.lock().await.values().map(Vec::len).sum()
    }

    /// Flush pending messages and wind the producer down.
    pub async fn close(&self) -> Result<()> {
        self.closing.store(true, std::sync::atomic::Ordering::SeqCst);
        self.flush().await
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("batch_size", &self.batch_size)
            .field("compression", &self.compression)
            .field("required_acks", &self.required_acks)
            .finish_non_exhaustive()
    }
}
