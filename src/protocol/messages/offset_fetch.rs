use std::io::{Read, Write};

use super::{
    read_versioned_array, write_versioned_array, ReadVersionedError, ReadVersionedType,
    RequestBody, WriteVersionedError, WriteVersionedType,
};
use crate::protocol::{
    api_key::ApiKey,
    api_version::{ApiVersion, ApiVersionRange},
    error::Error as ApiError,
    primitives::{Array, Int16, Int32, Int64, NullableString, String_},
    traits::{ReadType, WriteType},
};

/// Committed offset signalling "nothing stored for this partition".
pub const NO_STORED_OFFSET: Int64 = Int64(-1);

/// Fetch the committed offsets of a group.
///
/// Version 0 reads from the coordinator-service store, version 1 from the
/// broker-internal offsets topic; the wire shape is identical.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OffsetFetchRequest {
    /// The group to fetch offsets for.
    pub group_id: String_,

    /// The topics and partitions to fetch.
    pub topics: Vec<OffsetFetchRequestTopic>,
}

impl RequestBody for OffsetFetchRequest {
    type ResponseBody = OffsetFetchResponse;

    const API_KEY: ApiKey = ApiKey::OffsetFetch;

    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion(Int16(0)), ApiVersion(Int16(1)));
}

impl<W> WriteVersionedType<W> for OffsetFetchRequest
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert!(version.0 .0 <= 1);

        self.group_id.write(writer)?;
        write_versioned_array(writer, version, Some(&self.topics))
    }
}

impl<R> ReadVersionedType<R> for OffsetFetchRequest
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert!(version.0 .0 <= 1);

        Ok(Self {
            group_id: String_::read(reader)?,
            topics: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OffsetFetchRequestTopic {
    /// The topic name.
    pub name: String_,

    /// The partition indexes to fetch.
    pub partition_indexes: Array<Int32>,
}

impl<W> WriteVersionedType<W> for OffsetFetchRequestTopic
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        _version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        self.name.write(writer)?;
        self.partition_indexes.write(writer)?;
        Ok(())
    }
}

impl<R> ReadVersionedType<R> for OffsetFetchRequestTopic
where
    R: Read,
{
    fn read_versioned(reader: &mut R, _version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            name: String_::read(reader)?,
            partition_indexes: Array::read(reader)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OffsetFetchResponse {
    /// Results per topic.
    pub topics: Vec<OffsetFetchResponseTopic>,
}

impl<R> ReadVersionedType<R> for OffsetFetchResponse
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert!(version.0 .0 <= 1);

        Ok(Self {
            topics: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

impl<W> WriteVersionedType<W> for OffsetFetchResponse
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert!(version.0 .0 <= 1);
        write_versioned_array(writer, version, Some(&self.topics))
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OffsetFetchResponseTopic {
    /// The topic name.
    pub name: String_,

    /// Results per partition.
    pub partitions: Vec<OffsetFetchResponsePartition>,
}

impl<R> ReadVersionedType<R> for OffsetFetchResponseTopic
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

impl<W> WriteVersionedType<W> for OffsetFetchResponseTopic
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
pub struct OffsetFetchResponsePartition {
    /// The partition index.
    pub partition_index: Int32,

    /// The committed offset, [`NO_STORED_OFFSET`] if nothing is stored.
    pub committed_offset: Int64,

    /// Metadata stored with the offset.
    pub metadata: NullableString,

    /// The fetch error, if any.
    pub error: Option<ApiError>,
}

impl<R> ReadVersionedType<R> for OffsetFetchResponsePartition
where
    R: Read,
{
    fn read_versioned(reader: &mut R, _version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            partition_index: Int32::read(reader)?,
            committed_offset: Int64::read(reader)?,
            metadata: NullableString::read(reader)?,
            error: ApiError::new(Int16::read(reader)?.0),
        })
    }
}

impl<W> WriteVersionedType<W> for OffsetFetchResponsePartition
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        _version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        self.partition_index.write(writer)?;
        self.committed_offset.write(writer)?;
        self.metadata.write(writer)?;
        Int16(self.error.map(|e| e.code()).unwrap_or_default()).write(writer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::messages::test_versioned_roundtrip;

    #[test]
    fn test_roundtrip_all_versions() {
        for v in 0..=1i16 {
            test_versioned_roundtrip(
                OffsetFetchRequest {
                    group_id: String_("workers".to_owned()),
                    topics: vec![OffsetFetchRequestTopic {
                        name: String_("colors".to_owned()),
                        partition_indexes: Array(Some(vec![Int32(0), Int32(1)])),
                    }],
                },
                ApiVersion(Int16(v)),
            );

            test_versioned_roundtrip(
                OffsetFetchResponse {
                    topics: vec![OffsetFetchResponseTopic {
                        name: String_("colors".to_owned()),
                        partitions: vec![
                            OffsetFetchResponsePartition {
                                partition_index: Int32(0),
                                committed_offset: Int64(23),
                                metadata: NullableString(None),
                                error: None,
                            },
                            OffsetFetchResponsePartition {
                                partition_index: Int32(1),
                                committed_offset: NO_STORED_OFFSET,
                                metadata: NullableString(None),
                                error: None,
                            },
                        ],
                    }],
                },
                ApiVersion(Int16(v)),
            );
        }
    }
}
