use std::io::{Read, Write};

use super::{
    read_versioned_array, write_versioned_array, ReadVersionedError, ReadVersionedType,
    RequestBody, WriteVersionedError, WriteVersionedType,
};
use crate::protocol::{
    api_key::ApiKey,
    api_version::{ApiVersion, ApiVersionRange},
    error::Error as ApiError,
    primitives::{Int16, Int32, Int64, String_},
    record::MessageSet,
    traits::{ReadError, ReadType, WriteError, WriteType},
};

/// Serialize a message set with its `Int32` size prefix.
pub(crate) fn write_sized_message_set<W>(
    writer: &mut W,
    message_set: &MessageSet,
) -> Result<(), WriteError>
where
    W: Write,
{
    let mut raw = vec![];
    message_set.write(&mut raw)?;
    let len = i32::try_from(raw.len()).map_err(WriteError::Overflow)?;
    Int32(len).write(writer)?;
    writer.write_all(&raw)?;
    Ok(())
}

/// Read a message set preceded by its `Int32` size prefix.
pub(crate) fn read_sized_message_set<R>(reader: &mut R) -> Result<MessageSet, ReadError>
where
    R: Read,
{
    let size = Int32::read(reader)?.0;
    let size = usize::try_from(size).map_err(|e| ReadError::Malformed(Box::new(e)))?;
    MessageSet::read(reader, size)
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ProduceRequest {
    /// The number of acknowledgments the producer requires the leader to have
    /// received before considering a request complete.
    ///
    /// 0 for none, 1 for only the leader, -1 for the full ISR.
    pub required_acks: Int16,

    /// The timeout to await acknowledgments, in milliseconds.
    pub timeout_ms: Int32,

    /// Each topic to produce to.
    pub topics: Vec<ProduceRequestTopic>,
}

impl RequestBody for ProduceRequest {
    type ResponseBody = ProduceResponse;

    const API_KEY: ApiKey = ApiKey::Produce;

    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion(Int16(0)), ApiVersion(Int16(0)));
}

impl<W> WriteVersionedType<W> for ProduceRequest
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert_eq!(version.0 .0, 0);

        self.required_acks.write(writer)?;
        self.timeout_ms.write(writer)?;
        write_versioned_array(writer, version, Some(&self.topics))
    }
}

impl<R> ReadVersionedType<R> for ProduceRequest
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            required_acks: Int16::read(reader)?,
            timeout_ms: Int32::read(reader)?,
            topics: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ProduceRequestTopic {
    /// The topic name.
    pub name: String_,

    /// Each partition to produce to.
    pub partitions: Vec<ProduceRequestPartition>,
}

impl<W> WriteVersionedType<W> for ProduceRequestTopic
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

impl<R> ReadVersionedType<R> for ProduceRequestTopic
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
pub struct ProduceRequestPartition {
    /// The partition index.
    pub index: Int32,

    /// The messages to append.
    pub message_set: MessageSet,
}

impl<W> WriteVersionedType<W> for ProduceRequestPartition
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        _version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        self.index.write(writer)?;
        write_sized_message_set(writer, &self.message_set)?;
        Ok(())
    }
}

impl<R> ReadVersionedType<R> for ProduceRequestPartition
where
    R: Read,
{
    fn read_versioned(reader: &mut R, _version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            index: Int32::read(reader)?,
            message_set: read_sized_message_set(reader)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ProduceResponse {
    /// Results per topic.
    pub topics: Vec<ProduceResponseTopic>,
}

impl<R> ReadVersionedType<R> for ProduceResponse
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

impl<W> WriteVersionedType<W> for ProduceResponse
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
pub struct ProduceResponseTopic {
    /// The topic name.
    pub name: String_,

    /// Results per partition.
    pub partitions: Vec<ProduceResponsePartition>,
}

impl<R> ReadVersionedType<R> for ProduceResponseTopic
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

impl<W> WriteVersionedType<W> for ProduceResponseTopic
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
pub struct ProduceResponsePartition {
    /// The partition index.
    pub index: Int32,

    /// The partition error, if any.
    pub error: Option<ApiError>,

    /// The offset assigned to the first message in the appended set.
    pub base_offset: Int64,
}

impl<R> ReadVersionedType<R> for ProduceResponsePartition
where
    R: Read,
{
    fn read_versioned(reader: &mut R, _version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            index: Int32::read(reader)?,
            error: ApiError::new(Int16::read(reader)?.0),
            base_offset: Int64::read(reader)?,
        })
    }
}

impl<W> WriteVersionedType<W> for ProduceResponsePartition
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        _version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        self.index.write(writer)?;
        Int16(self.error.map(|e| e.code()).unwrap_or_default()).write(writer)?;
        self.base_offset.write(writer)?;
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
            ProduceRequest {
                required_acks: Int16(-1),
                timeout_ms: Int32(500),
                topics: vec![ProduceRequestTopic {
                    name: String_("colors".to_owned()),
                    partitions: vec![ProduceRequestPartition {
                        index: Int32(0),
                        message_set: MessageSet(vec![MessageSetEntry {
                            offset: -1,
                            message: Message {
                                magic: 0,
                                attributes: 0,
                                timestamp: None,
                                key: None,
                                value: Some(br#"{"color":"blue"}"#.to_vec()),
                            },
                        }]),
                    }],
                }],
            },
            ApiVersion(Int16(0)),
        );
    }

    #[test]
    fn test_response_roundtrip() {
        test_versioned_roundtrip(
            ProduceResponse {
                topics: vec![ProduceResponseTopic {
                    name: String_("colors".to_owned()),
                    partitions: vec![
                        ProduceResponsePartition {
                            index: Int32(0),
                            error: None,
                            base_offset: Int64(42),
                        },
                        ProduceResponsePartition {
                            index: Int32(1),
                            error: Some(ApiError::NotLeaderForPartition),
                            base_offset: Int64(-1),
                        },
                    ],
                }],
            },
            ApiVersion(Int16(0)),
        );
    }
}
