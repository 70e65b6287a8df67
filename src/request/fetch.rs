use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;

use crate::log::EpochEndOffset;
use crate::message::{MemoryRecords, TopicPartition};
use crate::{AppResult, BrokerError};

/// Replica id used by consumer fetches.
pub const CONSUMER_REPLICA_ID: i32 = -1;
/// Loopback replica id used by the future-log fetcher moving a replica
/// between directories on the same broker.
pub const FUTURE_LOCAL_REPLICA_ID: i32 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchIsolation {
    /// Followers read up to the log end offset.
    LogEnd,
    /// Consumers read up to the high watermark.
    HighWatermark,
    /// Read-committed consumers read up to the last stable offset.
    TxnCommitted,
}

/// Client identity forwarded by the fetch path so a pluggable selector can
/// pick a close read replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMetadata {
    pub rack_id: String,
    pub client_id: String,
}

/// Request-level fetch parameters, shared by every partition in the fetch.
#[derive(Debug, Clone)]
pub struct FetchParams {
    pub replica_id: i32,
    pub max_wait_ms: i64,
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub isolation: FetchIsolation,
    pub client_metadata: Option<ClientMetadata>,
}

impl FetchParams {
    pub fn is_from_follower(&self) -> bool {
        self.replica_id >= 0
    }

    pub fn is_from_consumer(&self) -> bool {
        self.replica_id == CONSUMER_REPLICA_ID
    }

    pub fn fetch_isolation(&self) -> FetchIsolation {
        if self.is_from_follower() || self.replica_id == FUTURE_LOCAL_REPLICA_ID {
            FetchIsolation::LogEnd
        } else {
            self.isolation
        }
    }
}

/// Per-partition fetch input.
#[derive(Debug, Clone)]
pub struct FetchPartitionData {
    pub fetch_offset: i64,
    pub partition_max_bytes: i32,
    pub current_leader_epoch: Option<i32>,
    /// Epoch of the last batch the follower fetched, used by the leader to
    /// detect divergence.
    pub last_fetched_epoch: Option<i32>,
    pub log_start_offset: i64,
}

/// Per-partition fetch output.
#[derive(Debug, Clone)]
pub struct FetchPartitionResult {
    pub error: Option<BrokerError>,
    pub records: MemoryRecords,
    pub high_watermark: i64,
    pub log_start_offset: i64,
    pub log_end_offset: i64,
    pub last_stable_offset: i64,
    pub diverging_epoch: Option<EpochEndOffset>,
    pub preferred_read_replica: Option<i32>,
}

impl FetchPartitionResult {
    /// No-records result redirecting the consumer to `replica_id`.
    pub fn redirect(replica_id: i32, high_watermark: i64, log_start: i64, log_end: i64) -> Self {
        Self {
            error: None,
            records: MemoryRecords::empty(),
            high_watermark,
            log_start_offset: log_start,
            log_end_offset: log_end,
            last_stable_offset: high_watermark,
            diverging_epoch: None,
            preferred_read_replica: Some(replica_id),
        }
    }

    pub fn error(error: BrokerError) -> Self {
        Self {
            error: Some(error),
            records: MemoryRecords::empty(),
            high_watermark: -1,
            log_start_offset: -1,
            log_end_offset: -1,
            last_stable_offset: -1,
            diverging_epoch: None,
            preferred_read_replica: None,
        }
    }
}

/// Data-plane path from a follower to its leader. The transport (framing,
/// connection pooling) is external; tests wire a loopback implementation.
#[async_trait]
pub trait LeaderEndpoint: Send + Sync + Debug {
    async fn fetch(
        &self,
        leader_id: i32,
        params: FetchParams,
        fetch_data: BTreeMap<TopicPartition, FetchPartitionData>,
    ) -> AppResult<BTreeMap<TopicPartition, FetchPartitionResult>>;

    /// Epoch-based offset lookup used for follower truncation.
    async fn offset_for_leader_epoch(
        &self,
        leader_id: i32,
        partitions: BTreeMap<TopicPartition, (Option<i32>, i32)>,
    ) -> AppResult<BTreeMap<TopicPartition, Result<EpochEndOffset, BrokerError>>>;
}
