//! ApiKey to tag request types.

use super::primitives::Int16;

/// The request kinds this client speaks.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum ApiKey {
    Produce,
    Fetch,
    ListOffsets,
    Metadata,
    OffsetCommit,
    OffsetFetch,
    GroupCoordinator,
    JoinGroup,
    Heartbeat,
    LeaveGroup,
    SyncGroup,
    DescribeGroups,
    ListGroups,
    Unknown(Int16),
}

impl From<Int16> for ApiKey {
    fn from(key: Int16) -> Self {
        match key.0 {
            0 => Self::Produce,
            1 => Self::Fetch,
            2 => Self::ListOffsets,
            3 => Self::Metadata,
            8 => Self::OffsetCommit,
            9 => Self::OffsetFetch,
            10 => Self::GroupCoordinator,
            11 => Self::JoinGroup,
            12 => Self::Heartbeat,
            13 => Self::LeaveGroup,
            14 => Self::SyncGroup,
            15 => Self::DescribeGroups,
            16 => Self::ListGroups,
            _ => Self::Unknown(key),
        }
    }
}

impl From<ApiKey> for Int16 {
    fn from(key: ApiKey) -> Self {
        match key {
            ApiKey::Produce => Int16(0),
            ApiKey::Fetch => Int16(1),
            ApiKey::ListOffsets => Int16(2),
            ApiKey::Metadata => Int16(3),
            ApiKey::OffsetCommit => Int16(8),
            ApiKey::OffsetFetch => Int16(9),
            ApiKey::GroupCoordinator => Int16(10),
            ApiKey::JoinGroup => Int16(11),
            ApiKey::Heartbeat => Int16(12),
            ApiKey::LeaveGroup => Int16(13),
            ApiKey::SyncGroup => Int16(14),
            ApiKey::DescribeGroups => Int16(15),
            ApiKey::ListGroups => Int16(16),
            ApiKey::Unknown(code) => code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_roundtrip_int16(code: Int16) {
            let api_key = ApiKey::from(code);
            let code2 = Int16::from(api_key);
            assert_eq!(code, code2);
        }
    }

    #[test]
    fn test_known_codes() {
        for (code, key) in [
            (0, ApiKey::Produce),
            (1, ApiKey::Fetch),
            (2, ApiKey::ListOffsets),
            (3, ApiKey::Metadata),
            (8, ApiKey::OffsetCommit),
            (9, ApiKey::OffsetFetch),
            (10, ApiKey::GroupCoordinator),
            (11, ApiKey::JoinGroup),
            (12, ApiKey::Heartbeat),
            (13, ApiKey::LeaveGroup),
            (14, ApiKey::SyncGroup),
            (15, ApiKey::DescribeGroups),
            (16, ApiKey::ListGroups),
        ] {
            assert_eq!(ApiKey::from(Int16(code)), key);
            assert_eq!(Int16::from(key), Int16(code));
        }
    }
}
