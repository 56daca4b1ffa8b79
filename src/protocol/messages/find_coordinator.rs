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

/// Locate the broker coordinating a consumer group.
///
/// Any live broker can answer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GroupCoordinatorRequest {
    /// The group to find the coordinator of.
    pub group_id: String_,
}

impl RequestBody for GroupCoordinatorRequest {
    type ResponseBody = GroupCoordinatorResponse;

    const API_KEY: ApiKey = ApiKey::GroupCoordinator;

    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion(Int16(0)), ApiVersion(Int16(0)));
}

impl<W> WriteVersionedType<W> for GroupCoordinatorRequest
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
        Ok(())
    }
}

impl<R> ReadVersionedType<R> for GroupCoordinatorRequest
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);
        Ok(Self {
            group_id: String_::read(reader)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct GroupCoordinatorResponse {
    /// The lookup error, if any.
    pub error: Option<ApiError>,

    /// The coordinator broker ID.
    pub coordinator_id: Int32,

    /// The coordinator hostname.
    pub host: String_,

    /// The coordinator port.
    pub port: Int32,
}

impl<R> ReadVersionedType<R> for GroupCoordinatorResponse
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            error: ApiError::new(Int16::read(reader)?.0),
            coordinator_id: Int32::read(reader)?,
            host: String_::read(reader)?,
            port: Int32::read(reader)?,
        })
    }
}

impl<W> WriteVersionedType<W> for GroupCoordinatorResponse
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
        self.coordinator_id.write(writer)?;
        self.host.write(writer)?;
        self.port.write(writer)?;
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
            GroupCoordinatorRequest {
                group_id: String_("workers".to_owned()),
            },
            ApiVersion(Int16(0)),
        );

        test_versioned_roundtrip(
            GroupCoordinatorResponse {
                error: None,
                coordinator_id: Int32(2),
                host: String_("broker-2".to_owned()),
                port: Int32(9092),
            },
            ApiVersion(Int16(0)),
        );

        test_versioned_roundtrip(
            GroupCoordinatorResponse {
                error: Some(ApiError::GroupCoordinatorNotAvailable),
                coordinator_id: Int32(-1),
                host: String_(String::new()),
                port: Int32(-1),
            },
            ApiVersion(Int16(0)),
        );
    }
}
