use crate::{BrokerError, ErrorCode};

/// Validated `acks` setting of a produce request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAcks {
    /// Wait for the full ISR (acks = -1).
    Full,
    /// Leader append only (acks = 1).
    Leader,
    /// Fire and forget (acks = 0).
    None,
}

impl RequiredAcks {
    pub fn from_i16(acks: i16) -> Option<Self> {
        match acks {
            -1 => Some(RequiredAcks::Full),
            1 => Some(RequiredAcks::Leader),
            0 => Some(RequiredAcks::None),
            _ => None,
        }
    }
}

/// Per-partition produce response slot.
#[derive(Debug, Clone)]
pub struct ProducePartitionResponse {
    pub partition: i32,
    pub error: Option<BrokerError>,
    pub base_offset: i64,
    pub log_append_time: i64,
    pub log_start_offset: i64,
}

impl ProducePartitionResponse {
    pub fn ok(partition: i32, base_offset: i64, log_append_time: i64, log_start_offset: i64) -> Self {
        Self {
            partition,
            error: None,
            base_offset,
            log_append_time,
            log_start_offset,
        }
    }

    pub fn error(partition: i32, error: BrokerError) -> Self {
        Self {
            partition,
            error: Some(error),
            base_offset: -1,
            log_append_time: -1,
            log_start_offset: -1,
        }
    }

    pub fn error_code(&self) -> i16 {
        self.error
            .as_ref()
            .map(|e| ErrorCode::from(e).code())
            .unwrap_or(0)
    }
}

/// Per-partition DeleteRecords response slot.
#[derive(Debug, Clone)]
pub struct DeleteRecordsPartitionResult {
    pub low_watermark: i64,
    pub error: Option<BrokerError>,
}

/// Per-partition OffsetForLeaderEpoch response slot.
#[derive(Debug, Clone)]
pub struct EpochEndOffsetResult {
    pub leader_epoch: i32,
    pub end_offset: i64,
    pub error: Option<BrokerError>,
}
