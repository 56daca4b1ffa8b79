use std::io::{Read, Write};

use super::{
    read_versioned_array, write_versioned_array, ReadVersionedError, ReadVersionedType,
    RequestBody, WriteVersionedError, WriteVersionedType,
};
use crate::protocol::{
    api_key::ApiKey,
    api_version::{ApiVersion, ApiVersionRange},
    error::Error as ApiError,
    primitives::{Array, Int16, NullableBytes, String_},
    traits::{ReadType, WriteType},
};

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DescribeGroupsRequest {
    /// The names of the groups to describe.
    pub groups: Array<String_>,
}

impl RequestBody for DescribeGroupsRequest {
    type ResponseBody = DescribeGroupsResponse;

    const API_KEY: ApiKey = ApiKey::DescribeGroups;

    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion(Int16(0)), ApiVersion(Int16(0)));
}

impl<W> WriteVersionedType<W> for DescribeGroupsRequest
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert_eq!(version.0 .0, 0);
        self.groups.write(writer)?;
        Ok(())
    }
}

impl<R> ReadVersionedType<R> for DescribeGroupsRequest
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);
        Ok(Self {
            groups: Array::read(reader)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DescribeGroupsResponse {
    /// One description per requested group.
    pub groups: Vec<DescribedGroup>,
}

impl<R> ReadVersionedType<R> for DescribeGroupsResponse
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            groups: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

impl<W> WriteVersionedType<W> for DescribeGroupsResponse
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert_eq!(version.0 .0, 0);
        write_versioned_array(writer, version, Some(&self.groups))
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DescribedGroup {
    /// The describe error, if any.
    pub error: Option<ApiError>,

    /// The group name.
    pub group_id: String_,

    /// The coordinator-side group state, e.g. `"Stable"`.
    pub state: String_,

    /// The protocol type, `"consumer"` for consumers.
    pub protocol_type: String_,

    /// The agreed assignment protocol, empty unless the group is stable.
    pub protocol_data: String_,

    /// The group members.
    pub members: Vec<DescribedGroupMember>,
}

impl<R> ReadVersionedType<R> for DescribedGroup
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            error: ApiError::new(Int16::read(reader)?.0),
            group_id: String_::read(reader)?,
            state: String_::read(reader)?,
            protocol_type: String_::read(reader)?,
            protocol_data: String_::read(reader)?,
            members: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

impl<W> WriteVersionedType<W> for DescribedGroup
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        Int16(self.error.map(|e| e.code()).unwrap_or_default()).write(writer)?;
        self.group_id.write(writer)?;
        self.state.write(writer)?;
        self.protocol_type.write(writer)?;
        self.protocol_data.write(writer)?;
        write_versioned_array(writer, version, Some(&self.members))
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DescribedGroupMember {
    /// The member ID assigned by the coordinator.
    pub member_id: String_,

    /// The client ID the member announced.
    pub client_id: String_,

    /// The host the member connected from.
    pub client_host: String_,

    /// The member's join metadata.
    pub member_metadata: NullableBytes,

    /// The member's current assignment.
    pub member_assignment: NullableBytes,
}

impl<R> ReadVersionedType<R> for DescribedGroupMember
where
    R: Read,
{
    fn read_versioned(reader: &mut R, _version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            member_id: String_::read(reader)?,
            client_id: String_::read(reader)?,
            client_host: String_::read(reader)?,
            member_metadata: NullableBytes::read(reader)?,
            member_assignment: NullableBytes::read(reader)?,
        })
    }
}

impl<W> WriteVersionedType<W> for DescribedGroupMember
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        _version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        self.member_id.write(writer)?;
        self.client_id.write(writer)?;
        self.client_host.write(writer)?;
        self.member_metadata.write(writer)?;
        self.member_assignment.write(writer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::messages::test_versioned_roundtrip;

    #[test]
    fn test_roundtrip() {
        test_versioned_roundtrip(
            DescribeGroupsRequest {
                groups: Array(Some(vec![String_("workers".to_owned())])),
            },
            ApiVersion(Int16(0)),
        );

        test_versioned_roundtrip(
            DescribeGroupsResponse {
                groups: vec![DescribedGroup {
                    error: None,
                    group_id: String_("workers".to_owned()),
                    state: String_("Stable".to_owned()),
                    protocol_type: String_("consumer".to_owned()),
                    protocol_data: String_("round-robin".to_owned()),
                    members: vec![DescribedGroupMember {
                        member_id: String_("member-a".to_owned()),
                        client_id: String_("skiff".to_owned()),
                        client_host: String_("/10.0.0.1".to_owned()),
                        member_metadata: NullableBytes(Some(vec![0, 0])),
                        member_assignment: NullableBytes(None),
                    }],
                }],
            },
            ApiVersion(Int16(0)),
        );
    }
}
