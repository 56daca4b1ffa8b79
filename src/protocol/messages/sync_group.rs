use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use super::{
    read_versioned_array, write_versioned_array, ReadVersionedError, ReadVersionedType,
    RequestBody, WriteVersionedError, WriteVersionedType,
};
use crate::protocol::{
    api_key::ApiKey,
    api_version::{ApiVersion, ApiVersionRange},
    error::Error as ApiError,
    primitives::{Array, Int16, Int32, NullableBytes, String_},
    traits::{ReadError, ReadType, WriteError, WriteType},
};

/// Payload of a sync-group `assignment` blob for the `consumer` protocol
/// type: the partitions handed to one member.
///
/// Topics are ordered, so equal assignments serialize identically.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct ConsumerGroupMemberAssignment {
    pub version: i16,
    pub assignment: BTreeMap<String, Vec<i32>>,
    pub user_data: Option<Vec<u8>>,
}

impl ConsumerGroupMemberAssignment {
    pub fn to_bytes(&self) -> Result<Vec<u8>, WriteError> {
        let mut buf = vec![];
        Int16(self.version).write(&mut buf)?;
        let len = i32::try_from(self.assignment.len()).map_err(WriteError::Overflow)?;
        Int32(len).write(&mut buf)?;
        for (topic, partitions) in &self.assignment {
            String_(topic.clone()).write(&mut buf)?;
            Array(Some(partitions.iter().map(|p| Int32(*p)).collect())).write(&mut buf)?;
        }
        NullableBytes(self.user_data.clone()).write(&mut buf)?;
        Ok(buf)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, ReadError> {
        let mut cursor = Cursor::new(raw);
        let version = Int16::read(&mut cursor)?.0;

        let n_topics = Int32::read(&mut cursor)?.0;
        let n_topics = usize::try_from(n_topics).map_err(|e| ReadError::Malformed(Box::new(e)))?;
        let mut assignment = BTreeMap::new();
        for _ in 0..n_topics {
            let topic = String_::read(&mut cursor)?.0;
            let partitions = Array::<Int32>::read(&mut cursor)?
                .0
                .unwrap_or_default()
                .into_iter()
                .map(|p| p.0)
                .collect();
            assignment.insert(topic, partitions);
        }

        let user_data = NullableBytes::read(&mut cursor)?.0;
        Ok(Self {
            version,
            assignment,
            user_data,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SyncGroupRequest {
    /// The group to sync.
    pub group_id: String_,

    /// The generation entered by the preceding join round.
    pub generation_id: Int32,

    /// The member syncing.
    pub member_id: String_,

    /// Per-member assignments; empty unless the member is the leader.
    pub assignments: Vec<SyncGroupRequestAssignment>,
}

impl RequestBody for SyncGroupRequest {
    type ResponseBody = SyncGroupResponse;

    const API_KEY: ApiKey = ApiKey::SyncGroup;

    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion(Int16(0)), ApiVersion(Int16(0)));
}

impl<W> WriteVersionedType<W> for SyncGroupRequest
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert_eq!(version.0 .0, 0);

        self.group_id.write(writer)?;
        self.generation_id.write(writer)?;
        self.member_id.write(writer)?;
        write_versioned_array(writer, version, Some(&self.assignments))
    }
}

impl<R> ReadVersionedType<R> for SyncGroupRequest
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            group_id: String_::read(reader)?,
            generation_id: Int32::read(reader)?,
            member_id: String_::read(reader)?,
            assignments: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SyncGroupRequestAssignment {
    /// The member this assignment is for.
    pub member_id: String_,

    /// Serialized [`ConsumerGroupMemberAssignment`].
    pub assignment: NullableBytes,
}

impl<W> WriteVersionedType<W> for SyncGroupRequestAssignment
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        _version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        self.member_id.write(writer)?;
        self.assignment.write(writer)?;
        Ok(())
    }
}

impl<R> ReadVersionedType<R> for SyncGroupRequestAssignment
where
    R: Read,
{
    fn read_versioned(reader: &mut R, _version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            member_id: String_::read(reader)?,
            assignment: NullableBytes::read(reader)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SyncGroupResponse {
    /// The sync error, if any.
    pub error: Option<ApiError>,

    /// The requester's serialized [`ConsumerGroupMemberAssignment`].
    pub assignment: NullableBytes,
}

impl<R> ReadVersionedType<R> for SyncGroupResponse
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            error: ApiError::new(Int16::read(reader)?.0),
            assignment: NullableBytes::read(reader)?,
        })
    }
}

impl<W> WriteVersionedType<W> for SyncGroupResponse
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert_eq!(version.0 .0, 0);

        Int16(self.error.map(|e| e.code()).unwrap_or_default()).write(writer)?;
        self.assignment.write(writer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::messages::test_versioned_roundtrip;

    #[test]
    fn test_assignment_roundtrip() {
        let assignment = ConsumerGroupMemberAssignment {
            version: 0,
            assignment: BTreeMap::from([
                ("colors".to_owned(), vec![0, 2]),
                ("shapes".to_owned(), vec![1]),
            ]),
            user_data: None,
        };
        let raw = assignment.to_bytes().unwrap();
        assert_eq!(
            ConsumerGroupMemberAssignment::from_bytes(&raw).unwrap(),
            assignment
        );
    }

    #[test]
    fn test_assignment_serialization_is_stable() {
        let a = ConsumerGroupMemberAssignment {
            version: 0,
            assignment: BTreeMap::from([
                ("b".to_owned(), vec![1]),
                ("a".to_owned(), vec![0]),
            ]),
            user_data: None,
        };
        let b = ConsumerGroupMemberAssignment {
            version: 0,
            assignment: BTreeMap::from([
                ("a".to_owned(), vec![0]),
                ("b".to_owned(), vec![1]),
            ]),
            user_data: None,
        };
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
    }

    #[test]
    fn test_request_roundtrip() {
        let assignment = ConsumerGroupMemberAssignment {
            version: 0,
            assignment: BTreeMap::from([("colors".to_owned(), vec![0, 1])]),
            user_data: None,
        };

        test_versioned_roundtrip(
            SyncGroupRequest {
                group_id: String_("workers".to_owned()),
                generation_id: Int32(3),
                member_id: String_("member-a".to_owned()),
                assignments: vec![SyncGroupRequestAssignment {
                    member_id: String_("member-a".to_owned()),
                    assignment: NullableBytes(Some(assignment.to_bytes().unwrap())),
                }],
            },
            ApiVersion(Int16(0)),
        );
    }

    #[test]
    fn test_response_roundtrip() {
        test_versioned_roundtrip(
            SyncGroupResponse {
                error: Some(ApiError::RebalanceInProgress),
                assignment: NullableBytes(None),
            },
            ApiVersion(Int16(0)),
        );
    }
}
