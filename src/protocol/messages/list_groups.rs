use std::io::{Read, Write};

use super::{
    read_versioned_array, write_versioned_array, ReadVersionedError, ReadVersionedType,
    RequestBody, WriteVersionedError, WriteVersionedType,
};
use crate::protocol::{
    api_key::ApiKey,
    api_version::{ApiVersion, ApiVersionRange},
    error::Error as ApiError,
    primitives::{Int16, String_},
    traits::{ReadType, WriteType},
};

/// List the groups a broker coordinates.
///
/// The request has an empty body; listing every group in the cluster means
/// asking every broker.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct ListGroupsRequest {}

impl RequestBody for ListGroupsRequest {
    type ResponseBody = ListGroupsResponse;

    const API_KEY: ApiKey = ApiKey::ListGroups;

    const API_VERSION_RANGE: ApiVersionRange =
        ApiVersionRange::new(ApiVersion(Int16(0)), ApiVersion(Int16(0)));
}

impl<W> WriteVersionedType<W> for ListGroupsRequest
where
    W: Write,
{
    fn write_versioned(
        &self,
        _writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert_eq!(version.0 .0, 0);
        Ok(())
    }
}

impl<R> ReadVersionedType<R> for ListGroupsRequest
where
    R: Read,
{
    fn read_versioned(_reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);
        Ok(Self {})
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ListGroupsResponse {
    /// The listing error, if any.
    pub error: Option<ApiError>,

    /// The groups coordinated by the answering broker.
    pub groups: Vec<ListedGroup>,
}

impl<R> ReadVersionedType<R> for ListGroupsResponse
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            error: ApiError::new(Int16::read(reader)?.0),
            groups: read_versioned_array(reader, version)?.unwrap_or_default(),
        })
    }
}

impl<W> WriteVersionedType<W> for ListGroupsResponse
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
        write_versioned_array(writer, version, Some(&self.groups))
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ListedGroup {
    /// The group name.
    pub group_id: String_,

    /// The protocol type the group agreed on, `"consumer"` for consumers.
    pub protocol_type: String_,
}

impl<R> ReadVersionedType<R> for ListedGroup
where
    R: Read,
{
    fn read_versioned(reader: &mut R, _version: ApiVersion) -> Result<Self, ReadVersionedError> {
        Ok(Self {
            group_id: String_::read(reader)?,
            protocol_type: String_::read(reader)?,
        })
    }
}

impl<W> WriteVersionedType<W> for ListedGroup
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        _version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        self.group_id.write(writer)?;
        self.protocol_type.write(writer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::messages::test_versioned_roundtrip;

    #[test]
    fn test_roundtrip() {
        test_versioned_roundtrip(ListGroupsRequest {}, ApiVersion(Int16(0)));

        test_versioned_roundtrip(
            ListGroupsResponse {
                error: None,
                groups: vec![ListedGroup {
                    group_id: String_("workers".to_owned()),
                    protocol_type: String_("consumer".to_owned()),
                }],
            },
            ApiVersion(Int16(0)),
        );
    }
}
