//! Broker error codes carried inside otherwise well-formed responses.

use crate::error::KafkaError;

/// What the coordination pipeline does about an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Clear offsets, refresh metadata and restart from coordinator discovery.
    RefreshMetadata,
    /// Clear offsets and rejoin the group with the known coordinator.
    Rejoin,
    /// Reset the consumer position of one partition from the reset policy.
    OffsetOutOfRange,
    /// The broker cannot serve the requested message format.
    UnsupportedMessageFormat,
    /// Logged and otherwise ignored.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    Unknown,
    OffsetOutOfRange,
    CorruptMessage,
    UnknownTopicOrPartition,
    InvalidFetchSize,
    LeaderNotAvailable,
    NotLeaderForPartition,
    RequestTimedOut,
    BrokerNotAvailable,
    ReplicaNotAvailable,
    MessageTooLarge,
    StaleControllerEpoch,
    OffsetMetadataTooLarge,
    NetworkException,
    GroupLoadInProgress,
    GroupCoordinatorNotAvailable,
    NotCoordinatorForGroup,
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
    InvalidTimestamp,
    UnsupportedSaslMechanism,
    IllegalSaslState,
    UnsupportedVersion,
    UnsupportedForMessageFormat,
    Unrecognized(i16),
}

impl ErrorCode {
    pub fn from_i16(code: i16) -> Self {
        match code {
            0 => ErrorCode::NoError,
            -1 => ErrorCode::Unknown,
            1 => ErrorCode::OffsetOutOfRange,
            2 => ErrorCode::CorruptMessage,
            3 => ErrorCode::UnknownTopicOrPartition,
            4 => ErrorCode::InvalidFetchSize,
            5 => ErrorCode::LeaderNotAvailable,
            6 => ErrorCode::NotLeaderForPartition,
            7 => ErrorCode::RequestTimedOut,
            8 => ErrorCode::BrokerNotAvailable,
            9 => ErrorCode::ReplicaNotAvailable,
            10 => ErrorCode::MessageTooLarge,
            11 => ErrorCode::StaleControllerEpoch,
            12 => ErrorCode::OffsetMetadataTooLarge,
            13 => ErrorCode::NetworkException,
            14 => ErrorCode::GroupLoadInProgress,
            15 => ErrorCode::GroupCoordinatorNotAvailable,
            16 => ErrorCode::NotCoordinatorForGroup,
            17 => ErrorCode::InvalidTopic,
            18 => ErrorCode::RecordListTooLarge,
            19 => ErrorCode::NotEnoughReplicas,
            20 => ErrorCode::NotEnoughReplicasAfterAppend,
            21 => ErrorCode::InvalidRequiredAcks,
            22 => ErrorCode::IllegalGeneration,
            23 => ErrorCode::InconsistentGroupProtocol,
            24 => ErrorCode::InvalidGroupId,
            25 => ErrorCode::UnknownMemberId,
            26 => ErrorCode::InvalidSessionTimeout,
            27 => ErrorCode::RebalanceInProgress,
            28 => ErrorCode::InvalidCommitOffsetSize,
            29 => ErrorCode::TopicAuthorizationFailed,
            30 => ErrorCode::GroupAuthorizationFailed,
            31 => ErrorCode::ClusterAuthorizationFailed,
            32 => ErrorCode::InvalidTimestamp,
            33 => ErrorCode::UnsupportedSaslMechanism,
            34 => ErrorCode::IllegalSaslState,
            35 => ErrorCode::UnsupportedVersion,
            43 => ErrorCode::UnsupportedForMessageFormat,
            other => ErrorCode::Unrecognized(other),
        }
    }

    pub fn code(self) -> i16 {
        match self {
            ErrorCode::NoError => 0,
            ErrorCode::Unknown => -1,
            ErrorCode::OffsetOutOfRange => 1,
            ErrorCode::CorruptMessage => 2,
            ErrorCode::UnknownTopicOrPartition => 3,
            ErrorCode::InvalidFetchSize => 4,
            ErrorCode::LeaderNotAvailable => 5,
            ErrorCode::NotLeaderForPartition => 6,
            ErrorCode::RequestTimedOut => 7,
            ErrorCode::BrokerNotAvailable => 8,
            ErrorCode::ReplicaNotAvailable => 9,
            ErrorCode::MessageTooLarge => 10,
            ErrorCode::StaleControllerEpoch => 11,
            ErrorCode::OffsetMetadataTooLarge => 12,
            ErrorCode::NetworkException => 13,
            ErrorCode::GroupLoadInProgress => 14,
            ErrorCode::GroupCoordinatorNotAvailable => 15,
            ErrorCode::NotCoordinatorForGroup => 16,
            ErrorCode::InvalidTopic => 17,
            ErrorCode::RecordListTooLarge => 18,
            ErrorCode::NotEnoughReplicas => 19,
            ErrorCode::NotEnoughReplicasAfterAppend => 20,
            ErrorCode::InvalidRequiredAcks => 21,
            ErrorCode::IllegalGeneration => 22,
            ErrorCode::InconsistentGroupProtocol => 23,
            ErrorCode::InvalidGroupId => 24,
            ErrorCode::UnknownMemberId => 25,
            ErrorCode::InvalidSessionTimeout => 26,
            ErrorCode::RebalanceInProgress => 27,
            ErrorCode::InvalidCommitOffsetSize => 28,
            ErrorCode::TopicAuthorizationFailed => 29,
            ErrorCode::GroupAuthorizationFailed => 30,
            ErrorCode::ClusterAuthorizationFailed => 31,
            ErrorCode::InvalidTimestamp => 32,
            ErrorCode::UnsupportedSaslMechanism => 33,
            ErrorCode::IllegalSaslState => 34,
            ErrorCode::UnsupportedVersion => 35,
            ErrorCode::UnsupportedForMessageFormat => 43,
            ErrorCode::Unrecognized(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == ErrorCode::NoError
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::UnknownTopicOrPartition
            | ErrorCode::NotLeaderForPartition
            | ErrorCode::BrokerNotAvailable
            | ErrorCode::GroupLoadInProgress
            | ErrorCode::GroupCoordinatorNotAvailable
            | ErrorCode::NotCoordinatorForGroup
            | ErrorCode::InvalidTopic
            | ErrorCode::InconsistentGroupProtocol
            | ErrorCode::InvalidGroupId => ErrorCategory::RefreshMetadata,
            ErrorCode::IllegalGeneration
            | ErrorCode::InvalidSessionTimeout
            | ErrorCode::RebalanceInProgress
            | ErrorCode::UnknownMemberId => ErrorCategory::Rejoin,
            ErrorCode::OffsetOutOfRange => ErrorCategory::OffsetOutOfRange,
            ErrorCode::UnsupportedForMessageFormat => ErrorCategory::UnsupportedMessageFormat,
            _ => ErrorCategory::Other,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::NoError => "no error",
            ErrorCode::Unknown => "unexpected server error",
            ErrorCode::OffsetOutOfRange => "requested offset is outside the range held by the server",
            ErrorCode::CorruptMessage => "message contents do not match its CRC",
            ErrorCode::UnknownTopicOrPartition => "topic or partition does not exist on this broker",
            ErrorCode::InvalidFetchSize => "requested fetch size is invalid",
            ErrorCode::LeaderNotAvailable => "leader election in progress, no leader for this partition",
            ErrorCode::NotLeaderForPartition => "broker is not the leader for that topic-partition",
            ErrorCode::RequestTimedOut => "request exceeded the user-specified time limit",
            ErrorCode::BrokerNotAvailable => "broker is not available",
            ErrorCode::ReplicaNotAvailable => "replica is not available for the requested partition",
            ErrorCode::MessageTooLarge => "message is larger than the server accepts",
            ErrorCode::StaleControllerEpoch => "controller moved to another broker",
            ErrorCode::OffsetMetadataTooLarge => "offset metadata string is too large",
            ErrorCode::NetworkException => "server disconnected before a response was received",
            ErrorCode::GroupLoadInProgress => "coordinator is loading the group",
            ErrorCode::GroupCoordinatorNotAvailable => "group coordinator is not available",
            ErrorCode::NotCoordinatorForGroup => "broker is not the coordinator for this group",
            ErrorCode::InvalidTopic => "request targets an invalid topic",
            ErrorCode::RecordListTooLarge => "message batch exceeds the maximum segment size",
            ErrorCode::NotEnoughReplicas => "not enough in-sync replicas",
            ErrorCode::NotEnoughReplicasAfterAppend => "written with fewer in-sync replicas than required",
            ErrorCode::InvalidRequiredAcks => "invalid required acks value",
            ErrorCode::IllegalGeneration => "generation id is not the current generation",
            ErrorCode::InconsistentGroupProtocol => "group protocol is incompatible with the group members",
            ErrorCode::InvalidGroupId => "group id is empty or null",
            ErrorCode::UnknownMemberId => "coordinator does not know this member id",
            ErrorCode::InvalidSessionTimeout => "session timeout is outside the broker's allowed range",
            ErrorCode::RebalanceInProgress => "group is rebalancing, rejoin is needed",
            ErrorCode::InvalidCommitOffsetSize => "committed offset metadata is too large",
            ErrorCode::TopicAuthorizationFailed => "not authorized to access the topic",
            ErrorCode::GroupAuthorizationFailed => "not authorized to access the group",
            ErrorCode::ClusterAuthorizationFailed => "not authorized for the cluster operation",
            ErrorCode::InvalidTimestamp => "message timestamp is out of range",
            ErrorCode::UnsupportedSaslMechanism => "broker does not support the SASL mechanism",
            ErrorCode::IllegalSaslState => "request is not valid in the current SASL state",
            ErrorCode::UnsupportedVersion => "API version is not supported",
            ErrorCode::UnsupportedForMessageFormat => {
                "message format is not supported by this broker, a newer broker is required"
            }
            ErrorCode::Unrecognized(_) => "unrecognized error code",
        }
    }

    pub fn into_error(self) -> KafkaError {
        KafkaError::BrokerProtocolError {
            code: self.code(),
            message: self.description().to_string(),
        }
    }
}

impl From<i16> for ErrorCode {
    fn from(code: i16) -> Self {
        ErrorCode::from_i16(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for code in -1..=50i16 {
            assert_eq!(ErrorCode::from_i16(code).code(), code);
        }
    }

    #[test]
    fn test_categories() {
        for code in [3, 6, 8, 14, 15, 16, 17, 23, 24] {
            assert_eq!(ErrorCode::from_i16(code).category(), ErrorCategory::RefreshMetadata);
        }
        for code in [22, 25, 26, 27] {
            assert_eq!(ErrorCode::from_i16(code).category(), ErrorCategory::Rejoin);
        }
        assert_eq!(ErrorCode::from_i16(1).category(), ErrorCategory::OffsetOutOfRange);
        assert_eq!(
            ErrorCode::from_i16(43).category(),
            ErrorCategory::UnsupportedMessageFormat
        );
        for code in [-1, 5, 7, 9, 29, 99] {
            assert_eq!(ErrorCode::from_i16(code).category(), ErrorCategory::Other);
        }
    }

    #[test]
    fn test_into_error_carries_code() {
        match ErrorCode::UnknownMemberId.into_error() {
            KafkaError::BrokerProtocolError { code, .. } => assert_eq!(code, 25),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
