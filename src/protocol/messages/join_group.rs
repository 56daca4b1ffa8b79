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

/// The protocol type every consumer group member announces.
pub const CONSUMER_PROTOCOL_TYPE: &str = "consumer";

/// Payload of a join-group protocol's `metadata` bytes for the `consumer`
/// protocol type: the topics the member wants to consume.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ConsumerGroupMemberMetadata {
    pub version: i16,
    pub topics: Vec<String>,
    pub user_data: Option<Vec<u8>>,
}

impl ConsumerGroupMemberMetadata {
    pub fn to_bytes(&self) -> Result<Vec<u8>, WriteError> {
        let mut buf = vec![];
        Int16(self.version).write(&mut buf)?;
        Array(Some(
            self.topics.iter().map(|t| String_(t.clone())).collect(),
        ))
        .write(&mut buf)?;
        NullableBytes(self.user_data.clone()).write(&mut buf)?;
        Ok(buf)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, ReadError> {
        let mut cursor = Cursor::new(raw);
        let version = Int16::read(&mut cursor)?.0;
        let topics = Array::<String_>::read(&mut cursor)?
            .0
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.0)
            .collect();
        let user_data = NullableBytes::read(&mut cursor)?.0;
        Ok(Self {
            version,
            topics,
            user_data,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct JoinGroupRequest {
    /// The group to join.
    pub group_id: String_,

    /// How long the coordinator waits between heartbeats before evicting the
    /// member, in milliseconds.
    pub session_timeout_ms: Int32,

    /// The member ID assigned by a previous join, empty on first contact.
    pub member_id: String_,

    /// The class of protocols the member speaks, `"consumer"` here.
    pub protocol_type: String_,

    /// The partition-assignment protocols the member supports, in preference
    /// order.
    pub protocols: Vec<JoinGroupRequestProtocol>,
}

impl RequestBody for JoinGroupRequest {
    type ResponseBody = JoinGroupResponse;

    const API_KEY: ApiKey = ApiKey::JoinGroup;

    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion(Int16(0)), ApiVersion(Int16(0)));
}

impl<W> WriteVersionedType<W> for JoinGroupRequest
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
        self.session_timeout_ms.write(writer)?;
        self.member_id.write(writer)?;
        self.protocol_type.write(writer)?;
        write_versioned_array(writer, version, Some(&self.protocols))
    }
}

impl<R> ReadVersionedType<R> for JoinGroupRequest
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            group_id: String_::read(reader)?,
            session_timeout_ms: Int32::read(reader)?,
            member_id: String_::read(reader)?,
            protocol_type: String_::read(reader)?,
            protocols: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct JoinGroupRequestProtocol {
    /// The protocol name, e.g. `"round-robin"`.
    pub name: String_,

    /// Serialized [`ConsumerGroupMemberMetadata`].
    pub metadata: NullableBytes,
}

impl<W> WriteVersionedType<W> for JoinGroupRequestProtocol
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        _version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        self.name.write(writer)?;
        self.metadata.write(writer)?;
        Ok(())
    }
}

impl<R> ReadVersionedType<R> for JoinGroupRequestProtocol
where
    R: Read,
{
    fn read_versioned(reader: &mut R, _version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            name: String_::read(reader)?,
            metadata: NullableBytes::read(reader)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct JoinGroupResponse {
    /// The join error, if any.
    pub error: Option<ApiError>,

    /// The generation entered by this join round.
    pub generation_id: Int32,

    /// The assignment protocol the coordinator selected.
    pub protocol_name: String_,

    /// The member the coordinator elected leader for this generation.
    pub leader: String_,

    /// The member ID assigned to the requester.
    pub member_id: String_,

    /// All members of the group; empty unless the requester is the leader.
    pub members: Vec<JoinGroupResponseMember>,
}

impl<R> ReadVersionedType<R> for JoinGroupResponse
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            error: ApiError::new(Int16::read(reader)?.0),
            generation_id: Int32::read(reader)?,
            protocol_name: String_::read(reader)?,
            leader: String_::read(reader)?,
            member_id: String_::read(reader)?,
            members: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

impl<W> WriteVersionedType<W> for JoinGroupResponse
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
        self.generation_id.write(writer)?;
        self.protocol_name.write(writer)?;
        self.leader.write(writer)?;
        self.member_id.write(writer)?;
        write_versioned_array(writer, version, Some(&self.members))
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct JoinGroupResponseMember {
    /// The member ID.
    pub member_id: String_,

    /// The member's serialized [`ConsumerGroupMemberMetadata`].
    pub metadata: NullableBytes,
}

impl<R> ReadVersionedType<R> for JoinGroupResponseMember
where
    R: Read,
{
    fn read_versioned(reader: &mut R, _version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            member_id: String_::read(reader)?,
            metadata: NullableBytes::read(reader)?,
        })
    }
}

impl<W> WriteVersionedType<W> for JoinGroupResponseMember
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        _version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        self.member_id.write(writer)?;
        self.metadata.write(writer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::messages::test_versioned_roundtrip;

    #[test]
    fn test_member_metadata_roundtrip() {
        let metadata = ConsumerGroupMemberMetadata {
            version: 0,
            topics: vec!["colors".to_owned(), "shapes".to_owned()],
            user_data: None,
        };
        let raw = metadata.to_bytes().unwrap();
        assert_eq!(ConsumerGroupMemberMetadata::from_bytes(&raw).unwrap(), metadata);
    }

    #[test]
    fn test_request_roundtrip() {
        let metadata = ConsumerGroupMemberMetadata {
            version: 0,
            topics: vec!["colors".to_owned()],
            user_data: None,
        };

        test_versioned_roundtrip(
            JoinGroupRequest {
                group_id: String_("workers".to_owned()),
                session_timeout_ms: Int32(30_000),
                member_id: String_(String::new()),
                protocol_type: String_(CONSUMER_PROTOCOL_TYPE.to_owned()),
                protocols: vec![JoinGroupRequestProtocol {
                    name: String_("round-robin".to_owned()),
                    metadata: NullableBytes(Some(metadata.to_bytes().unwrap())),
                }],
            },
            ApiVersion(Int16(0)),
        );
    }

    #[test]
    fn test_response_roundtrip() {
        test_versioned_roundtrip(
            JoinGroupResponse {
                error: None,
                generation_id: Int32(3),
                protocol_name: String_("round-robin".to_owned()),
                leader: String_("member-a".to_owned()),
                member_id: String_("member-a".to_owned()),
                members: vec![
                    JoinGroupResponseMember {
                        member_id: String_("member-a".to_owned()),
                        metadata: NullableBytes(Some(vec![0, 0])),
                    },
                    JoinGroupResponseMember {
                        member_id: String_("member-b".to_owned()),
                        metadata: NullableBytes(None),
                    },
                ],
            },
            ApiVersion(Int16(0)),
        );
    }
}
