// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Broker-internal errors. Anything that crosses a partition response
/// boundary is converted into a [`BrokerError`] first.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid provided {0} value = {1}")]
    InvalidValue(&'static str, String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("channel send error: {0}")]
    ChannelSend(String),

    #[error("channel recv error: {0}")]
    ChannelRecv(String),

    #[error("parse error: {0}")]
    Parse(#[from] std::num::ParseIntError),

    /// A metadata-store write carried a stale coordinator epoch. The caller
    /// must resign; this is never retried in place.
    #[error("coordinator moved, observed epoch {observed_epoch}")]
    CoordinatorMoved { observed_epoch: i32 },

    /// Optimistic-concurrency failure on a partition-epoch guarded write.
    #[error("metadata version conflict: {0}")]
    VersionConflict(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Typed per-partition error kinds carried in responses. The numeric wire
/// mapping lives in [`ErrorCode`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("the server experienced an unexpected error: {0}")]
    UnknownServerError(String),

    #[error("the requested offset is not within range: {0}")]
    OffsetOutOfRange(String),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("this server does not host this topic-partition: {0}")]
    UnknownTopicOrPartition(String),

    #[error("there is no leader for this topic-partition: {0}")]
    LeaderNotAvailable(String),

    #[error("this broker is not the leader or follower for {0}")]
    NotLeaderOrFollower(String),

    #[error("request timed out: {0}")]
    RequestTimedOut(String),

    #[error("broker not available: {0}")]
    BrokerNotAvailable(String),

    #[error("replica not available: {0}")]
    ReplicaNotAvailable(String),

    #[error("record too large: {0}")]
    RecordTooLarge(String),

    #[error("stale controller epoch: {0}")]
    StaleControllerEpoch(String),

    #[error("stale broker epoch: {0}")]
    StaleBrokerEpoch(String),

    #[error("coordinator not available: {0}")]
    CoordinatorNotAvailable(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("record batch too large: {0}")]
    RecordBatchTooLarge(String),

    #[error("not enough in-sync replicas: {0}")]
    NotEnoughReplicas(String),

    #[error("appended to fewer in-sync replicas than required: {0}")]
    NotEnoughReplicasAfterAppend(String),

    #[error("invalid required acks: {0}")]
    InvalidRequiredAcks(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("invalid replica assignment: {0}")]
    InvalidReplicaAssignment(String),

    #[error("this is not the correct controller: {0}")]
    NotController(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("out of order sequence number: {0}")]
    OutOfOrderSequence(String),

    #[error("duplicate sequence number: {0}")]
    DuplicateSequence(String),

    #[error("invalid producer epoch: {0}")]
    InvalidProducerEpoch(String),

    #[error("invalid transaction state: {0}")]
    InvalidTxnState(String),

    #[error("unmapped producer id: {0}")]
    InvalidPidMapping(String),

    #[error("disk error while hosting {0}")]
    StorageError(String),

    #[error("log directory not found: {0}")]
    LogDirNotFound(String),

    #[error("topic deletion is disabled: {0}")]
    TopicDeletionDisabled(String),

    #[error("fenced leader epoch: {0}")]
    FencedLeaderEpoch(String),

    #[error("unknown leader epoch: {0}")]
    UnknownLeaderEpoch(String),

    #[error("preferred leader not available: {0}")]
    PreferredLeaderNotAvailable(String),

    #[error("no eligible leader: {0}")]
    EligibleLeadersNotAvailable(String),

    #[error("election not needed: {0}")]
    ElectionNotNeeded(String),

    #[error("invalid update version: {0}")]
    InvalidUpdateVersion(String),

    #[error("feature update failed: {0}")]
    FeatureUpdateFailed(String),

    #[error("topic id in request does not match the log: {0}")]
    InconsistentTopicId(String),

    #[error("replica is not eligible to join the ISR: {0}")]
    IneligibleReplica(String),
}

impl From<AppError> for BrokerError {
    fn from(value: AppError) -> Self {
        match value {
            AppError::Broker(e) => e,
            AppError::Io(e) => BrokerError::StorageError(e.to_string()),
            AppError::CoordinatorMoved { observed_epoch } => {
                BrokerError::NotController(format!("observed epoch {observed_epoch}"))
            }
            AppError::VersionConflict(s) => BrokerError::InvalidUpdateVersion(s),
            other => BrokerError::UnknownServerError(other.to_string()),
        }
    }
}

/// Wire error codes. Values follow the Kafka protocol numbering so that
/// responses stay intelligible to standard client tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum ErrorCode {
    UnknownServerError = -1,
    None = 0,
    OffsetOutOfRange = 1,
    CorruptRecord = 2,
    UnknownTopicOrPartition = 3,
    LeaderNotAvailable = 5,
    NotLeaderOrFollower = 6,
    RequestTimedOut = 7,
    BrokerNotAvailable = 8,
    ReplicaNotAvailable = 9,
    RecordTooLarge = 10,
    StaleControllerEpoch = 11,
    CoordinatorNotAvailable = 15,
    InvalidTopic = 17,
    RecordBatchTooLarge = 18,
    NotEnoughReplicas = 19,
    NotEnoughReplicasAfterAppend = 20,
    InvalidRequiredAcks = 21,
    InvalidTimestamp = 32,
    InvalidReplicaAssignment = 39,
    NotController = 41,
    InvalidRequest = 42,
    OutOfOrderSequence = 45,
    DuplicateSequence = 46,
    InvalidProducerEpoch = 47,
    InvalidTxnState = 48,
    InvalidPidMapping = 49,
    StorageError = 56,
    LogDirNotFound = 57,
    TopicDeletionDisabled = 73,
    FencedLeaderEpoch = 74,
    UnknownLeaderEpoch = 75,
    StaleBrokerEpoch = 77,
    PreferredLeaderNotAvailable = 80,
    EligibleLeadersNotAvailable = 81,
    ElectionNotNeeded = 84,
    InvalidUpdateVersion = 95,
    FeatureUpdateFailed = 96,
    InconsistentTopicId = 103,
    IneligibleReplica = 107,
}

impl From<&BrokerError> for ErrorCode {
    fn from(error: &BrokerError) -> Self {
        match error {
            BrokerError::UnknownServerError(_) => ErrorCode::UnknownServerError,
            BrokerError::OffsetOutOfRange(_) => ErrorCode::OffsetOutOfRange,
            BrokerError::CorruptRecord(_) => ErrorCode::CorruptRecord,
            BrokerError::UnknownTopicOrPartition(_) => ErrorCode::UnknownTopicOrPartition,
            BrokerError::LeaderNotAvailable(_) => ErrorCode::LeaderNotAvailable,
            BrokerError::NotLeaderOrFollower(_) => ErrorCode::NotLeaderOrFollower,
            BrokerError::RequestTimedOut(_) => ErrorCode::RequestTimedOut,
            BrokerError::BrokerNotAvailable(_) => ErrorCode::BrokerNotAvailable,
            BrokerError::ReplicaNotAvailable(_) => ErrorCode::ReplicaNotAvailable,
            BrokerError::RecordTooLarge(_) => ErrorCode::RecordTooLarge,
            BrokerError::StaleControllerEpoch(_) => ErrorCode::StaleControllerEpoch,
            BrokerError::StaleBrokerEpoch(_) => ErrorCode::StaleBrokerEpoch,
            BrokerError::CoordinatorNotAvailable(_) => ErrorCode::CoordinatorNotAvailable,
            BrokerError::InvalidTopic(_) => ErrorCode::InvalidTopic,
            BrokerError::RecordBatchTooLarge(_) => ErrorCode::RecordBatchTooLarge,
            BrokerError::NotEnoughReplicas(_) => ErrorCode::NotEnoughReplicas,
            BrokerError::NotEnoughReplicasAfterAppend(_) => {
                ErrorCode::NotEnoughReplicasAfterAppend
            }
            BrokerError::InvalidRequiredAcks(_) => ErrorCode::InvalidRequiredAcks,
            BrokerError::InvalidTimestamp(_) => ErrorCode::InvalidTimestamp,
            BrokerError::InvalidReplicaAssignment(_) => ErrorCode::InvalidReplicaAssignment,
            BrokerError::NotController(_) => ErrorCode::NotController,
            BrokerError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            BrokerError::OutOfOrderSequence(_) => ErrorCode::OutOfOrderSequence,
            BrokerError::DuplicateSequence(_) => ErrorCode::DuplicateSequence,
            BrokerError::InvalidProducerEpoch(_) => ErrorCode::InvalidProducerEpoch,
            BrokerError::InvalidTxnState(_) => ErrorCode::InvalidTxnState,
            BrokerError::InvalidPidMapping(_) => ErrorCode::InvalidPidMapping,
            BrokerError::StorageError(_) => ErrorCode::StorageError,
            BrokerError::LogDirNotFound(_) => ErrorCode::LogDirNotFound,
            BrokerError::TopicDeletionDisabled(_) => ErrorCode::TopicDeletionDisabled,
            BrokerError::FencedLeaderEpoch(_) => ErrorCode::FencedLeaderEpoch,
            BrokerError::UnknownLeaderEpoch(_) => ErrorCode::UnknownLeaderEpoch,
            BrokerError::PreferredLeaderNotAvailable(_) => {
                ErrorCode::PreferredLeaderNotAvailable
            }
            BrokerError::EligibleLeadersNotAvailable(_) => {
                ErrorCode::EligibleLeadersNotAvailable
            }
            BrokerError::ElectionNotNeeded(_) => ErrorCode::ElectionNotNeeded,
            BrokerError::InvalidUpdateVersion(_) => ErrorCode::InvalidUpdateVersion,
            BrokerError::FeatureUpdateFailed(_) => ErrorCode::FeatureUpdateFailed,
            BrokerError::InconsistentTopicId(_) => ErrorCode::InconsistentTopicId,
            BrokerError::IneligibleReplica(_) => ErrorCode::IneligibleReplica,
        }
    }
}

impl ErrorCode {
    pub fn code(&self) -> i16 {
        *self as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = BrokerError::FencedLeaderEpoch("stale".to_string());
        assert_eq!(ErrorCode::from(&err), ErrorCode::FencedLeaderEpoch);
        assert_eq!(ErrorCode::from(&err).code(), 74);
    }

    #[test]
    fn test_app_error_conversion() {
        let app = AppError::CoordinatorMoved { observed_epoch: 7 };
        let broker: BrokerError = app.into();
        assert_eq!(ErrorCode::from(&broker), ErrorCode::NotController);
    }

    #[test]
    fn test_storage_error_from_io() {
        let app = AppError::Io(std::io::Error::other("disk gone"));
        let broker: BrokerError = app.into();
        assert_eq!(ErrorCode::from(&broker), ErrorCode::StorageError);
    }
}
