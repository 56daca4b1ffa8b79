use std::io::{Read, Write};

use super::{
    read_versioned_array, write_versioned_array, ReadVersionedError, ReadVersionedType,
    RequestBody, WriteVersionedError, WriteVersionedType,
};
use crate::protocol::{
    api_key::ApiKey,
    api_version::{ApiVersion, ApiVersionRange},
    error::Error as ApiError,
    primitives::{Array, Int16, Int32, Int64, String_},
    traits::{ReadType, WriteType},
};

/// Timestamp value asking for the very latest offset.
pub const OFFSET_END: Int64 = Int64(-1);

/// Timestamp value asking for the earliest available offset.
pub const OFFSET_BEGINNING: Int64 = Int64(-2);

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ListOffsetsRequest {
    /// The broker ID of the requester, -1 for a normal consumer.
    pub replica_id: Int32,

    /// Each topic to list offsets for.
    pub topics: Vec<ListOffsetsRequestTopic>,
}

impl RequestBody for ListOffsetsRequest {
    type ResponseBody = ListOffsetsResponse;

    const API_KEY: ApiKey = ApiKey::ListOffsets;

    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion(Int16(0)), ApiVersion(Int16(0)));
}

impl<W> WriteVersionedType<W> for ListOffsetsRequest
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
        write_versioned_array(writer, version, Some(&self.topics))
    }
}

impl<R> ReadVersionedType<R> for ListOffsetsRequest
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            replica_id: Int32::read(reader)?,
            topics: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ListOffsetsRequestTopic {
    /// The topic name.
    pub name: String_,

    /// Each partition to list offsets for.
    pub partitions: Vec<ListOffsetsRequestPartition>,
}

impl<W> WriteVersionedType<W> for ListOffsetsRequestTopic
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

impl<R> ReadVersionedType<R> for ListOffsetsRequestTopic
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
pub struct ListOffsetsRequestPartition {
    /// The partition index.
    pub partition_index: Int32,

    /// Epoch milliseconds, or [`OFFSET_END`] / [`OFFSET_BEGINNING`].
    pub timestamp: Int64,

    /// The maximum number of offsets to report.
    pub max_num_offsets: Int32,
}

impl<W> WriteVersionedType<W> for ListOffsetsRequestPartition
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        _version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        self.partition_index.write(writer)?;
        self.timestamp.write(writer)?;
        self.max_num_offsets.write(writer)?;
        Ok(())
    }
}

impl<R> ReadVersionedType<R> for ListOffsetsRequestPartition
where
    R: Read,
{
    fn read_versioned(reader: &mut R, _version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            partition_index: Int32::read(reader)?,
            timestamp: Int64::read(reader)?,
            max_num_offsets: Int32::read(reader)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ListOffsetsResponse {
    /// Results per topic.
    pub topics: Vec<ListOffsetsResponseTopic>,
}

impl<R> ReadVersionedType<R> for ListOffsetsResponse
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

impl<W> WriteVersionedType<W> for ListOffsetsResponse
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
pub struct ListOffsetsResponseTopic {
    /// The topic name.
    pub name: String_,

    /// Results per partition.
    pub partitions: Vec<ListOffsetsResponsePartition>,
}

impl<R> ReadVersionedType<R> for ListOffsetsResponseTopic
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

impl<W> WriteVersionedType<W> for ListOffsetsResponseTopic
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
pub struct ListOffsetsResponsePartition {
    /// The partition index.
    pub partition_index: Int32,

    /// The partition error, if any.
    pub error: Option<ApiError>,

    /// Offsets at or before the requested timestamp, newest first.
    pub offsets: Array<Int64>,
}

impl<R> ReadVersionedType<R> for ListOffsetsResponsePartition
where
    R: Read,
{
    fn read_versioned(reader: &mut R, _version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            partition_index: Int32::read(reader)?,
            error: ApiError::new(Int16::read(reader)?.0),
            offsets: Array::read(reader)?,
        })
    }
}

impl<W> WriteVersionedType<W> for ListOffsetsResponsePartition
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        _version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        self.partition_index.write(writer)?;
        Int16(self.error.map(|e| e.code()).unwrap_or_default()).write(writer)?;
        self.offsets.write(writer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::messages::test_versioned_roundtrip;

    #[test]
    fn test_request_roundtrip() {
        test_versioned_roundtrip(
            ListOffsetsRequest {
                replica_id: Int32(-1),
                topics: vec![ListOffsetsRequestTopic {
                    name: String_("colors".to_owned()),
                    partitions: vec![ListOffsetsRequestPartition {
                        partition_index: Int32(0),
                        timestamp: OFFSET_BEGINNING,
                        max_num_offsets: Int32(1),
                    }],
                }],
            },
            ApiVersion(Int16(0)),
        );
    }

    #[test]
    fn test_response_roundtrip() {
        test_versioned_roundtrip(
            ListOffsetsResponse {
                topics: vec![ListOffsetsResponseTopic {
                    name: String_("colors".to_owned()),
                    partitions: vec![
                        ListOffsetsResponsePartition {
                            partition_index: Int32(0),
                            error: None,
                            offsets: Array(Some(vec![Int64(500)])),
                        },
                        ListOffsetsResponsePartition {
                            partition_index: Int32(1),
                            error: Some(ApiError::UnknownTopicOrPartition),
                            offsets: Array(Some(vec![])),
                        },
                    ],
                }],
            },
            ApiVersion(Int16(0)),
        );
    }
}
