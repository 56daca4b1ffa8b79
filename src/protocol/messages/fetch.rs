use std::io::{Read, Write};

use super::{
    produce::{read_sized_message_set, write_sized_message_set},
    read_versioned_array, write_versioned_array, ReadVersionedError, ReadVersionedType,
    RequestBody, WriteVersionedError, WriteVersionedType,
};
use crate::protocol::{
    api_key::ApiKey,
    api_version::{ApiVersion, ApiVersionRange},
    error::Error as ApiError,
    primitives::{Int16, Int32, Int64, String_},
    record::MessageSet,
    traits::{ReadType, WriteType},
};

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FetchRequest {
    /// The broker ID of the follower, or -1 for a normal consumer.
    pub replica_id: Int32,

    /// The maximum time in milliseconds the broker waits before answering an
    /// otherwise-empty fetch.
    pub max_wait_ms: Int32,

    /// The minimum bytes to accumulate before the broker responds.
    pub min_bytes: Int32,

    /// The topics to fetch.
    pub topics: Vec<FetchRequestTopic>,
}

impl RequestBody for FetchRequest {
    type ResponseBody = FetchResponse;

    const API_KEY: ApiKey = ApiKey::Fetch;

    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion(Int16(0)), ApiVersion(Int16(0)));
}

impl<W> WriteVersionedType<W> for FetchRequest
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert_eq!(version.0 .0, 0);

        self.replica_id.write(writer)?;
        self.max_wait_ms.write(writer)?;
        self.min_bytes.write(writer)?;
        write_versioned_array(writer, version, Some(&self.topics))
    }
}

impl<R> ReadVersionedType<R> for FetchRequest
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            replica_id: Int32::read(reader)?,
            max_wait_ms: Int32::read(reader)?,
            min_bytes: Int32::read(reader)?,
            topics: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FetchRequestTopic {
    /// The name of the topic to fetch.
    pub name: String_,

    /// The partitions to fetch.
    pub partitions: Vec<FetchRequestPartition>,
}

impl<W> WriteVersionedType<W> for FetchRequestTopic
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        self.name.write(writer)?;
        write_versioned_array(writer, version, Some(&self.partitions))
    }
}

impl<R> ReadVersionedType<R> for FetchRequestTopic
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            name: String_::read(reader)?,
            partitions: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FetchRequestPartition {
    /// The partition index.
    pub partition: Int32,

    /// The offset to start fetching from.
    pub fetch_offset: Int64,

    /// The maximum bytes to fetch from this partition.
    pub max_bytes: Int32,
}

impl<W> WriteVersionedType<W> for FetchRequestPartition
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        _version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        self.partition.write(writer)?;
        self.fetch_offset.write(writer)?;
        self.max_bytes.write(writer)?;
        Ok(())
    }
}

impl<R> ReadVersionedType<R> for FetchRequestPartition
where
    R: Read,
{
    fn read_versioned(reader: &mut R, _version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            partition: Int32::read(reader)?,
            fetch_offset: Int64::read(reader)?,
            max_bytes: Int32::read(reader)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FetchResponse {
    /// Results per topic.
    pub topics: Vec<FetchResponseTopic>,
}

impl<R> ReadVersionedType<R> for FetchResponse
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            topics: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

impl<W> WriteVersionedType<W> for FetchResponse
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert_eq!(version.0 .0, 0);
        write_versioned_array(writer, version, Some(&self.topics))
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FetchResponseTopic {
    /// The topic name.
    pub name: String_,

    /// Results per partition.
    pub partitions: Vec<FetchResponsePartition>,
}

impl<R> ReadVersionedType<R> for FetchResponseTopic
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            name: String_::read(reader)?,
            partitions: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

impl<W> WriteVersionedType<W> for FetchResponseTopic
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        self.name.write(writer)?;
        write_versioned_array(writer, version, Some(&self.partitions))
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FetchResponsePartition {
    /// The partition index.
    pub partition: Int32,

    /// The partition error, if any.
    pub error: Option<ApiError>,

    /// The offset one past the last committed message of the partition.
    pub high_watermark: Int64,

    /// The fetched messages, compression envelopes already unwrapped.
    pub message_set: MessageSet,
}

impl<R> ReadVersionedType<R> for FetchResponsePartition
where
    R: Read,
{
    fn read_versioned(reader: &mut R, _version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            partition: Int32::read(reader)?,
            error: ApiError::new(Int16::read(reader)?.0),
            high_watermark: Int64::read(reader)?,
            message_set: read_sized_message_set(reader)?,
        })
    }
}

impl<W> WriteVersionedType<W> for FetchResponsePartition
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        _version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        self.partition.write(writer)?;
        Int16(self.error.map(|e| e.code()).unwrap_or_default()).write(writer)?;
        self.high_watermark.write(writer)?;
        write_sized_message_set(writer, &self.message_set)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::messages::test_versioned_roundtrip;
    use crate::protocol::record::{Message, MessageSetEntry};

    #[test]
    fn test_request_roundtrip() {
        test_versioned_roundtrip(
            FetchRequest {
                replica_id: Int32(-1),
                max_wait_ms: Int32(1000),
                min_bytes: Int32(1),
                topics: vec![FetchRequestTopic {
                    name: String_("colors".to_owned()),
                    partitions: vec![
                        FetchRequestPartition {
                            partition: Int32(0),
                            fetch_offset: Int64(12),
                            max_bytes: Int32(524_288),
                        },
                        FetchRequestPartition {
                            partition: Int32(1),
                            fetch_offset: Int64(0),
                            max_bytes: Int32(524_288),
                        },
                    ],
                }],
            },
            ApiVersion(Int16(0)),
        );
    }

    #[test]
    fn test_response_roundtrip() {
        test_versioned_roundtrip(
            FetchResponse {
                topics: vec![FetchResponseTopic {
                    name: String_("colors".to_owned()),
                    partitions: vec![
                        FetchResponsePartition {
                            partition: Int32(0),
                            error: None,
                            high_watermark: Int64(2),
                            message_set: MessageSet(vec![MessageSetEntry {
                                offset: 1,
                                message: Message {
                                    magic: 0,
                                    attributes: 0,
                                    timestamp: None,
                                    key: Some(b"k".to_vec()),
                                    value: Some(b"v".to_vec()),
                                },
                            }]),
                        },
                        FetchResponsePartition {
                            partition: Int32(1),
                            error: Some(ApiError::OffsetOutOfRange),
                            high_watermark: Int64(-1),
                            message_set: MessageSet::default(),
                        },
                    ],
                }],
            },
            ApiVersion(Int16(0)),
        );
    }
}
