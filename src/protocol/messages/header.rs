use std::io::{Read, Write};

use crate::protocol::{
    api_key::ApiKey,
    api_version::ApiVersion,
    primitives::{Int16, Int32, String_},
    traits::{ReadType, WriteType},
};

use super::{ReadVersionedError, ReadVersionedType, WriteVersionedError, WriteVersionedType};

/// Prefix of every request frame.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RequestHeader {
    /// The API key of this request.
    pub request_api_key: ApiKey,

    /// The API version of this request.
    pub request_api_version: ApiVersion,

    /// The correlation ID of this request.
    pub correlation_id: Int32,

    /// The client ID string.
    pub client_id: String_,
}

impl<W> WriteVersionedType<W> for RequestHeader
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert_eq!(version.0 .0, 0);

        Int16::from(self.request_api_key).write(writer)?;
        self.request_api_version.0.write(writer)?;
        self.correlation_id.write(writer)?;
        self.client_id.write(writer)?;
        Ok(())
    }
}

impl<R> ReadVersionedType<R> for RequestHeader
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            request_api_key: ApiKey::from(Int16::read(reader)?),
            request_api_version: ApiVersion(Int16::read(reader)?),
            correlation_id: Int32::read(reader)?,
            client_id: String_::read(reader)?,
        })
    }
}

/// Prefix of every response frame.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ResponseHeader {
    /// The correlation ID of this response.
    pub correlation_id: Int32,
}

impl<R> ReadVersionedType<R> for ResponseHeader
where
    R: Read,
{
    fn read_versioned(reader: &mut R, version: ApiVersion) -> Result<Self, ReadVersionedError> {
        assert_eq!(version.0 .0, 0);

        Ok(Self {
            correlation_id: Int32::read(reader)?,
        })
    }
}

impl<W> WriteVersionedType<W> for ResponseHeader
where
    W: Write,
{
    fn write_versioned(
        &self,
        writer: &mut W,
        version: ApiVersion,
    ) -> Result<(), WriteVersionedError> {
        assert_eq!(version.0 .0, 0);

        self.correlation_id.write(writer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::messages::test_versioned_roundtrip;

    #[test]
    fn test_request_header_roundtrip() {
        test_versioned_roundtrip(
            RequestHeader {
                request_api_key: ApiKey::Fetch,
                request_api_version: ApiVersion(Int16(0)),
                correlation_id: Int32(1234),
                client_id: String_("skiff".to_owned()),
            },
            ApiVersion(Int16(0)),
        );
    }

    #[test]
    fn test_response_header_roundtrip() {
        test_versioned_roundtrip(
            ResponseHeader {
                correlation_id: Int32(-7),
            },
            ApiVersion(Int16(0)),
        );
    }
}
