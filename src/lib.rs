//! An async client for partitioned, replicated commit-log broker clusters.
//!
//! The engine underneath the façades:
//!
//! * [`protocol`]: the versioned binary wire codec, including the
//!   message-set format and its compression envelopes
//! * [`messenger`]: one framed, correlated channel per broker
//! * [`cluster`]: the snapshot cluster model and scatter/gather routing
//! * [`group`]: the broker-side group membership state machine
//! * [`coordinator`]: the consensus-coordinator seam used for group
//!   membership
//!
//! The public surface is the three façades: [`client::producer::Producer`],
//! [`client::consumer::SingleConsumer`], and
//! [`client::grouped::GroupedConsumer`], built from their builders with a
//! JSON default for value (de)serialization.

pub mod allocator;
pub mod backoff;
pub mod client;
pub mod cluster;
pub mod connection;
pub mod coordinator;
pub mod group;
pub mod messenger;
pub mod offsets;
pub mod protocol;
pub mod record;

pub use client::consumer::{ConsumedBatch, SingleConsumer, SingleConsumerBuilder};
pub use client::error::{Error, Result};
pub use client::grouped::{GroupedConsumer, GroupedConsumerBuilder};
pub use client::producer::{Producer, ProducerBuilder};
pub use client::{Client, ClientBuilder, Topic};
pub use offsets::Start;
pub use record::Record;
