use std::io::{Read, Write};

use super::{
    ReadVersionedError, ReadVersionedType, RequestBody, WriteVersionedError, WriteVersionedType,
};
use crate::protocol::{
    api_key::ApiKey,
    api_version::{ApiVersion, ApiVersionRange},
    error::Error as ApiError,
    primitives::{Int16, Int32, String_},
    traits::{ReadType, WriteType},
};

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct HeartbeatRequest {
    /// The group the member belongs to.
    pub group_id: String_,

    /// The generation the member believes is current.
    pub generation_id: Int32,

    /// The member heartbeating.
    pub member_id: String_,
}

impl RequestBody for HeartbeatRequest {
    type ResponseBody = HeartbeatResponse;

    const API_KEY: ApiKey = ApiKey::Heartbeat;

    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion(Int16(0)), ApiVersion(Int16(0)));
}

impl<W> WriteVersionedType<W> for HeartbeatRequest
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
        Ok(())
    }
}

impl<R> ReadVersionedType<R> for HeartbeatRequest
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            group_id: String_::read(reader)?,
            generation_id: Int32::read(reader)?,
            member_id: String_::read(reader)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct HeartbeatResponse {
    /// The heartbeat error, if any.
    pub error: Option<ApiError>,
}

impl<R> ReadVersionedType<R> for HeartbeatResponse
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

impl<W> WriteVersionedType<W> for HeartbeatResponse
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
