mod checkpoint;
mod memory_log;

pub use checkpoint::CheckpointFile;
pub use memory_log::{MemoryLog, MemoryLogManager};

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::message::{MemoryRecords, TopicPartition};
use crate::AppResult;

pub const DEFAULT_LOG_APPEND_TIME: i64 = -1;
/// Offset sentinel: "no offset found" on timestamp / epoch lookups.
pub const UNKNOWN_OFFSET: i64 = -1;

/// Result of a leader append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogAppendInfo {
    pub first_offset: i64,
    pub last_offset: i64,
    pub log_append_time: i64,
    pub records_count: i32,
}

/// One read from a local log, plus the log metadata the replication layer
/// publishes alongside it.
#[derive(Debug, Clone)]
pub struct LogFetchInfo {
    pub records: MemoryRecords,
    pub log_start_offset: i64,
    pub log_end_offset: i64,
}

/// `(epoch, end_offset)` answer to an epoch lookup; `end_offset` is the
/// first offset of the next-higher epoch, i.e. exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochEndOffset {
    pub leader_epoch: i32,
    pub end_offset: i64,
}

/// The storage seam. Segment files, indexes, retention and compaction live
/// behind this trait; the replication core only consumes the typed surface.
#[async_trait]
pub trait Log: Send + Sync + Debug {
    async fn append_records(
        &self,
        records: MemoryRecords,
        leader_epoch: i32,
    ) -> AppResult<LogAppendInfo>;

    /// Read from `offset`, never returning a batch that starts at or past
    /// `max_offset` (the caller's isolation bound: LEO for followers, HW or
    /// LSO for consumers). `min_one_message` permits exceeding `max_bytes`
    /// for the first batch so a large record cannot wedge a consumer.
    async fn read_records(
        &self,
        offset: i64,
        max_offset: i64,
        max_bytes: i32,
        min_one_message: bool,
    ) -> AppResult<LogFetchInfo>;

    fn log_end_offset(&self) -> i64;

    fn log_start_offset(&self) -> i64;

    /// Advance the log start offset (DeleteRecords). Returns the new start.
    async fn advance_log_start_offset(&self, offset: i64) -> AppResult<i64>;

    /// Discard everything at and after `offset` (follower truncation).
    async fn truncate_to(&self, offset: i64) -> AppResult<()>;

    /// Record that `epoch` starts at `start_offset` in the epoch chain.
    fn assign_epoch_start_offset(&self, epoch: i32, start_offset: i64);

    /// Largest epoch ≤ `epoch` in the chain and its exclusive end offset.
    fn end_offset_for_epoch(&self, epoch: i32) -> Option<EpochEndOffset>;

    /// Latest epoch recorded in the chain, if any.
    fn latest_epoch(&self) -> Option<i32>;

    /// Earliest offset whose batch max-timestamp is ≥ `timestamp`.
    fn offset_for_timestamp(&self, timestamp: i64) -> Option<i64>;

    /// Parent log directory, used to map directory failures to partitions.
    fn dir(&self) -> &str;

    async fn flush(&self) -> AppResult<()>;
}

/// Creates and removes partition logs. The broker injects one implementation
/// per process; tests use [`MemoryLogManager`].
#[async_trait]
pub trait LogManager: Send + Sync + Debug {
    async fn get_or_create_log(
        &self,
        topic_partition: &TopicPartition,
        is_new: bool,
    ) -> AppResult<Arc<dyn Log>>;

    fn get_log(&self, topic_partition: &TopicPartition) -> Option<Arc<dyn Log>>;

    /// Schedule asynchronous deletion of the partition's log files.
    async fn remove_log(&self, topic_partition: &TopicPartition) -> AppResult<()>;

    /// Create an empty future log for the partition in `dir`, the target of
    /// an intra-broker directory move.
    async fn create_future_log(
        &self,
        topic_partition: &TopicPartition,
        dir: &str,
    ) -> AppResult<Arc<dyn Log>>;

    /// The future log caught up and was promoted; retire the old current
    /// log's files.
    async fn confirm_future_log(&self, topic_partition: &TopicPartition) -> AppResult<()>;

    fn log_dirs(&self) -> Vec<String>;
}
