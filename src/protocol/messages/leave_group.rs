use std::io::{Read, Write};

use super::{
    ReadVersionedError, ReadVersionedType, RequestBody, WriteVersionedError, WriteVersionedType,
};
use crate::protocol::{
    api_key::ApiKey,
    api_version::{ApiVersion, ApiVersionRange},
    error::Error as ApiError,
    primitives::{Int16, String_},
    traits::{ReadType, WriteType},
};

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LeaveGroupRequest {
    /// The group to leave.
    pub group_id: String_,

    /// The member leaving.
    pub member_id: String_,
}

impl RequestBody for LeaveGroupRequest {
    type ResponseBody = LeaveGroupResponse;

    const API_KEY: ApiKey = ApiKey::LeaveGroup;

    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion(Int16(0)), ApiVersion(Int16(0)));
}

impl<W> WriteVersionedType<W> for LeaveGroupRequest
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
        self.member_id.write(writer)?;
        Ok(())
    }
}

impl<R> ReadVersionedType<R> for LeaveGroupRequest
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            group_id: String_::read(reader)?,
            member_id: String_::read(reader)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LeaveGroupResponse {
    /// The leave error, if any.
    pub error: Option<ApiError>,
}

impl<R> ReadVersionedType<R> for LeaveGroupResponse
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            error: ApiError::new(Int16::read(reader)?.0),
        })
    }
}

impl<W> WriteVersionedType<W> for LeaveGroupResponse
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
            LeaveGroupRequest {
                group_id: String_("workers".to_owned()),
                member_id: String_("member-a".to_owned()),
            },
            ApiVersion(Int16(0)),
        );

        test_versioned_roundtrip(LeaveGroupResponse { error: None }, ApiVersion(Int16(0)));
    }
}
