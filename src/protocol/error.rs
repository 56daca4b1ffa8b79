//! Error codes returned by brokers inside response bodies.

use super::primitives::Int16;

/// How a broker error code should be handled by the routing layer.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorClass {
    /// Back off and retry the same broker.
    Retriable,

    /// Refresh metadata (or rediscover the coordinator), then retry.
    Refresh,

    /// Surface to the caller.
    Fatal,
}

/// A non-zero broker error code.
///
/// Code `0` ("no error") is represented as the absence of an error, see
/// [`Error::new`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Error {
    Unknown,
    OffsetOutOfRange,
    CorruptMessage,
    UnknownTopicOrPartition,
    InvalidMessageSize,
    LeaderNotAvailable,
    NotLeaderForPartition,
    RequestTimedOut,
    BrokerNotAvailable,
    ReplicaNotAvailable,
    MessageSizeTooLarge,
    StaleControllerEpoch,
    OffsetMetadataTooLarge,
    GroupLoadInProgress,
    GroupCoordinatorNotAvailable,
    NotCoordinator,
    InvalidTopic,
    RecordListTooLarge,
    NotEnoughReplicas,
    NotEnoughReplicasAfterAppend,
    InvalidRequiredAcks,
    IllegalGeneration,
    InconsistentGroupProtocol,
    InvalidGroupId,
    UnknownMemberId,
    InvalidSessionTimeout,
    RebalanceInProgress,
    InvalidCommitOffsetSize,
    TopicAuthorizationFailed,
    GroupAuthorizationFailed,
    ClusterAuthorizationFailed,
    UnknownServerError(i16),
}

impl Error {
    /// Map a wire code to an error, `None` for code 0.
    pub fn new(code: i16) -> Option<Self> {
        match code {
            0 => None,
            -1 => Some(Self::Unknown),
            1 => Some(Self::OffsetOutOfRange),
            2 => Some(Self::CorruptMessage),
            3 => Some(Self::UnknownTopicOrPartition),
            4 => Some(Self::InvalidMessageSize),
            5 => Some(Self::LeaderNotAvailable),
            6 => Some(Self::NotLeaderForPartition),
            7 => Some(Self::RequestTimedOut),
            8 => Some(Self::BrokerNotAvailable),
            9 => Some(Self::ReplicaNotAvailable),
            10 => Some(Self::MessageSizeTooLarge),
            11 => Some(Self::StaleControllerEpoch),
            12 => Some(Self::OffsetMetadataTooLarge),
            14 => Some(Self::GroupLoadInProgress),
            15 => Some(Self::GroupCoordinatorNotAvailable),
            16 => Some(Self::NotCoordinator),
            17 => Some(Self::InvalidTopic),
            18 => Some(Self::RecordListTooLarge),
            19 => Some(Self::NotEnoughReplicas),
            20 => Some(Self::NotEnoughReplicasAfterAppend),
            21 => Some(Self::InvalidRequiredAcks),
            22 => Some(Self::IllegalGeneration),
            23 => Some(Self::InconsistentGroupProtocol),
            24 => Some(Self::InvalidGroupId),
            25 => Some(Self::UnknownMemberId),
            26 => Some(Self::InvalidSessionTimeout),
            27 => Some(Self::RebalanceInProgress),
            28 => Some(Self::InvalidCommitOffsetSize),
            29 => Some(Self::TopicAuthorizationFailed),
            30 => Some(Self::GroupAuthorizationFailed),
            31 => Some(Self::ClusterAuthorizationFailed),
            other => Some(Self::UnknownServerError(other)),
        }
    }

    pub fn code(&self) -> i16 {
        match self {
            Self::Unknown => -1,
            Self::OffsetOutOfRange => 1,
            Self::CorruptMessage => 2,
            Self::UnknownTopicOrPartition => 3,
            Self::InvalidMessageSize => 4,
            Self::LeaderNotAvailable => 5,
            Self::NotLeaderForPartition => 6,
            Self::RequestTimedOut => 7,
            Self::BrokerNotAvailable => 8,
            Self::ReplicaNotAvailable => 9,
            Self::MessageSizeTooLarge => 10,
            Self::StaleControllerEpoch => 11,
            Self::OffsetMetadataTooLarge => 12,
            Self::GroupLoadInProgress => 14,
            Self::GroupCoordinatorNotAvailable => 15,
            Self::NotCoordinator => 16,
            Self::InvalidTopic => 17,
            Self::RecordListTooLarge => 18,
            Self::NotEnoughReplicas => 19,
            Self::NotEnoughReplicasAfterAppend => 20,
            Self::InvalidRequiredAcks => 21,
            Self::IllegalGeneration => 22,
            Self::InconsistentGroupProtocol => 23,
            Self::InvalidGroupId => 24,
            Self::UnknownMemberId => 25,
            Self::InvalidSessionTimeout => 26,
            Self::RebalanceInProgress => 27,
            Self::InvalidCommitOffsetSize => 28,
            Self::TopicAuthorizationFailed => 29,
            Self::GroupAuthorizationFailed => 30,
            Self::ClusterAuthorizationFailed => 31,
            Self::UnknownServerError(code) => *code,
        }
    }

    /// How the routing layer should treat this code.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::RequestTimedOut => ErrorClass::Retriable,
            Self::NotLeaderForPartition
            | Self::LeaderNotAvailable
            | Self::UnknownTopicOrPartition
            | Self::GroupCoordinatorNotAvailable
            | Self::NotCoordinator
            | Self::GroupLoadInProgress => ErrorClass::Refresh,
            _ => ErrorClass::Fatal,
        }
    }
}

impl From<Error> for Int16 {
    fn from(error: Error) -> Self {
        Self(error.code())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in -1..=40 {
            if code == 0 {
                assert!(Error::new(0).is_none());
                continue;
            }
            let error = Error::new(code).unwrap();
            assert_eq!(error.code(), code);
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(Error::RequestTimedOut.classify(), ErrorClass::Retriable);
        assert_eq!(Error::NotLeaderForPartition.classify(), ErrorClass::Refresh);
        assert_eq!(Error::LeaderNotAvailable.classify(), ErrorClass::Refresh);
        assert_eq!(
            Error::UnknownTopicOrPartition.classify(),
            ErrorClass::Refresh
        );
        assert_eq!(
            Error::GroupCoordinatorNotAvailable.classify(),
            ErrorClass::Refresh
        );
        assert_eq!(Error::NotCoordinator.classify(), ErrorClass::Refresh);
        assert_eq!(Error::GroupLoadInProgress.classify(), ErrorClass::Refresh);
        assert_eq!(Error::BrokerNotAvailable.classify(), ErrorClass::Fatal);
        assert_eq!(Error::ReplicaNotAvailable.classify(), ErrorClass::Fatal);
        assert_eq!(Error::InvalidTopic.classify(), ErrorClass::Fatal);
        assert_eq!(Error::MessageSizeTooLarge.classify(), ErrorClass::Fatal);
        assert_eq!(Error::Unknown.classify(), ErrorClass::Fatal);
    }
}
