//! The record type handed to consumers.

use serde_json::Value;

/// One record consumed from a partition, with its value already run through
/// the consumer's deserializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The topic the record came from.
    pub topic: String,

    /// The partition within the topic.
    pub partition: i32,

    /// The record's offset; monotonic per `(topic, partition)`.
    pub offset: i64,

    /// The record key, if one was produced.
    pub key: Option<Vec<u8>>,

    /// The deserialized value.
    pub value: Value,
}
