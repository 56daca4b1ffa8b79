use std::io::{Read, Write};

use super::{
    read_versioned_array, write_versioned_array, ReadVersionedError, ReadVersionedType,
    RequestBody, WriteVersionedError, WriteVersionedType,
};
use crate::protocol::{
    api_key::ApiKey,
    api_version::{ApiVersion, ApiVersionRange},
    error::Error as ApiError,
    primitives::{Int16, Int32, Int64, NullableString, String_},
    traits::{ReadType, WriteType},
};

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OffsetCommitRequest {
    /// The group the offsets belong to.
    pub group_id: String_,

    /// The generation of the group.
    ///
    /// Added in version 1. `-1` when committing outside a generation.
    pub generation_id: Option<Int32>,

    /// The member committing.
    ///
    /// Added in version 1.
    pub member_id: Option<String_>,

    /// How long the broker keeps the committed offsets, in milliseconds.
    ///
    /// Added in version 2. `-1` selects the broker default.
    pub retention_time_ms: Option<Int64>,

    /// Offsets per topic.
    pub topics: Vec<OffsetCommitRequestTopic>,
}

impl RequestBody for OffsetCommitRequest {
    type ResponseBody = OffsetCommitResponse;

    const API_KEY: ApiKey = ApiKey::OffsetCommit;

    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion(Int16(0)), ApiVersion(Int16(2)));
}

impl<W> WriteVersionedType<W> for OffsetCommitRequest
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        let v = version.0 .0;
        assert!(v <= 2);

        if v < 1 && (self.generation_id.is_some() || self.member_id.is_some()) {
            return Err(WriteVersionedError::FieldNotAvailable {
                field: "generation_id/member_id".to_string(),
                version,
            });
        }
        if v < 2 && self.retention_time_ms.is_some() {
            return Err(WriteVersionedError::FieldNotAvailable {
                field: "retention_time_ms".to_string(),
                version,
            });
        }

        self.group_id.write(writer)?;
        if v >= 1 {
            self.generation_id.unwrap_or(Int32(-1)).write(writer)?;
            self.member_id.clone().unwrap_or_default().write(writer)?;
        }
        if v >= 2 {
            self.retention_time_ms.unwrap_or(Int64(-1)).write(writer)?;
        }
        write_versioned_array(writer, version, Some(&self.topics))
    }
}

impl<R> ReadVersionedType<R> for OffsetCommitRequest
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        let v = version.0 .0;
        assert!(v <= 2);

        Ok(Self {
            group_id: String_::read(reader)?,
            generation_id: (v >= 1).then(|| Int32::read(reader)).transpose()?,
            member_id: (v >= 1).then(|| String_::read(reader)).transpose()?,
            retention_time_ms: (v >= 2).then(|| Int64::read(reader)).transpose()?,
            topics: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OffsetCommitRequestTopic {
    /// The topic name.
    pub name: String_,

    /// Offsets per partition.
    pub partitions: Vec<OffsetCommitRequestPartition>,
}

impl<W> WriteVersionedType<W> for OffsetCommitRequestTopic
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

impl<R> ReadVersionedType<R> for OffsetCommitRequestTopic
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
pub struct OffsetCommitRequestPartition {
    /// The partition index.
    pub partition_index: Int32,

    /// The offset to commit (the next offset the group will fetch).
    pub committed_offset: Int64,

    /// Commit timestamp.
    ///
    /// Only present in version 1. `-1` lets the broker stamp it.
    pub timestamp: Option<Int64>,

    /// Free-form metadata stored with the offset.
    pub metadata: NullableString,
}

impl<W> WriteVersionedType<W> for OffsetCommitRequestPartition
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        let v = version.0 .0;

        if v != 1 && self.timestamp.is_some() {
            return Err(WriteVersionedError::FieldNotAvailable {
                field: "timestamp".to_string(),
                version,
            });
        }

        self.partition_index.write(writer)?;
        self.committed_offset.write(writer)?;
        if v == 1 {
            self.timestamp.unwrap_or(Int64(-1)).write(writer)?;
        }
        self.metadata.write(writer)?;
        Ok(())
    }
}

impl<R> ReadVersionedType<R> for OffsetCommitRequestPartition
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        let v = version.0 .0;

        Ok(Self {
            partition_index: Int32::read(reader)?,
            committed_offset: Int64::read(reader)?,
            timestamp: (v == 1).then(|| Int64::read(reader)).transpose()?,
            metadata: NullableString::read(reader)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OffsetCommitResponse {
    /// Results per topic.
    pub topics: Vec<OffsetCommitResponseTopic>,
}

impl<R> ReadVersionedType<R> for OffsetCommitResponse
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert!(version.0 .0 <= 2);

        Ok(Self {
            topics: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

impl<W> WriteVersionedType<W> for OffsetCommitResponse
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert!(version.0 .0 <= 2);
        write_versioned_array(writer, version, Some(&self.topics))
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OffsetCommitResponseTopic {
    /// The topic name.
    pub name: String_,

    /// Results per partition.
    pub partitions: Vec<OffsetCommitResponsePartition>,
}

impl<R> ReadVersionedType<R> for OffsetCommitResponseTopic
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

impl<W> WriteVersionedType<W> for OffsetCommitResponseTopic
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
pub struct OffsetCommitResponsePartition {
    /// The partition index.
    pub partition_index: Int32,

    /// The commit error, if any.
    pub error: Option<ApiError>,
}

impl<R> ReadVersionedType<R> for OffsetCommitResponsePartition
where
    R: Read,
{
    fn read_versioned(reader: &mut R, _version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            partition_index: Int32::read(reader)?,
            error: ApiError::new(Int16::read(reader)?.0),
        })
    }
}

impl<W> WriteVersionedType<W> for OffsetCommitResponsePartition
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
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    use crate::protocol::messages::test_versioned_roundtrip;

    fn partition(v: i16) -> OffsetCommitRequestPartition {
        OffsetCommitRequestPartition {
            partition_index: Int32(0),
            committed_offset: Int64(101),
            timestamp: (v == 1).then_some(Int64(-1)),
            metadata: NullableString(Some("committed by host:1".to_owned())),
        }
    }

    #[test]
    fn test_request_roundtrip_all_versions() {
        for v in 0..=2i16 {
            test_versioned_roundtrip(
                OffsetCommitRequest {
                    group_id: String_("workers".to_owned()),
                    generation_id: (v >= 1).then_some(Int32(7)),
                    member_id: (v >= 1).then_some(String_("member-a".to_owned())),
                    retention_time_ms: (v >= 2).then_some(Int64(-1)),
                    topics: vec![OffsetCommitRequestTopic {
                        name: String_("colors".to_owned()),
                        partitions: vec![partition(v)],
                    }],
                },
                ApiVersion(Int16(v)),
            );
        }
    }

    #[test]
    fn test_generation_not_available_in_v0() {
        let request = OffsetCommitRequest {
            group_id: String_("workers".to_owned()),
            generation_id: Some(Int32(7)),
            member_id: Some(String_("member-a".to_owned())),
            retention_time_ms: None,
            topics: vec![],
        };

        let mut buf = vec![];
        let err = request
            .write_versioned(&mut buf, ApiVersion(Int16(0)))
            .unwrap_err();
        assert_matches!(err, WriteVersionedError::FieldNotAvailable { .. });
    }

    #[test]
    fn test_response_roundtrip() {
        test_versioned_roundtrip(
            OffsetCommitResponse {
                topics: vec![OffsetCommitResponseTopic {
                    name: String_("colors".to_owned()),
                    partitions: vec![
                        OffsetCommitResponsePartition {
                            partition_index: Int32(0),
                            error: None,
                        },
                        OffsetCommitResponsePartition {
                            partition_index: Int32(1),
                            error: Some(ApiError::OffsetMetadataTooLarge),
                        },
                    ],
                }],
            },
            ApiVersion(Int16(2)),
        );
    }
}
