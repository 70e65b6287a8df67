use bytes::Bytes;

use crate::{BrokerError, BrokerResult};

/// An opaque, already-encoded batch of records. The record wire format and
/// per-record framing belong to the codec layer; the replication core only
/// needs counts, sizes and the producer-assigned timestamp.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MemoryRecords {
    payload: Bytes,
    record_count: i32,
    max_timestamp: i64,
}

impl MemoryRecords {
    pub fn new(payload: Bytes, record_count: i32, max_timestamp: i64) -> Self {
        Self {
            payload,
            record_count,
            max_timestamp,
        }
    }

    pub fn empty() -> Self {
        Self {
            payload: Bytes::new(),
            record_count: 0,
            max_timestamp: -1,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn record_count(&self) -> i32 {
        self.record_count
    }

    pub fn max_timestamp(&self) -> i64 {
        self.max_timestamp
    }

    pub fn size_in_bytes(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Batch-level sanity checks applied on the leader append path. Deep
    /// record validation (CRC, compression) happens in the storage layer.
    pub fn validate(&self, max_record_size: usize, max_batch_size: usize) -> BrokerResult<()> {
        if self.record_count < 0 || (self.record_count > 0 && self.payload.is_empty()) {
            return Err(BrokerError::CorruptRecord(format!(
                "record count {} does not match payload length {}",
                self.record_count,
                self.payload.len()
            )));
        }
        if self.record_count > 0 {
            let avg = self.payload.len() / self.record_count as usize;
            if avg > max_record_size {
                return Err(BrokerError::RecordTooLarge(format!(
                    "record of {} bytes exceeds the {} byte maximum",
                    avg, max_record_size
                )));
            }
        }
        if self.payload.len() > max_batch_size {
            return Err(BrokerError::RecordBatchTooLarge(format!(
                "batch of {} bytes exceeds the {} byte maximum",
                self.payload.len(),
                max_batch_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records_of(len: usize, count: i32) -> MemoryRecords {
        MemoryRecords::new(Bytes::from(vec![0u8; len]), count, 1000)
    }

    #[test]
    fn test_validate_ok() {
        assert!(records_of(100, 10).validate(1024, 4096).is_ok());
    }

    #[test]
    fn test_validate_record_too_large() {
        let err = records_of(4000, 1).validate(1024, 8192).unwrap_err();
        assert!(matches!(err, BrokerError::RecordTooLarge(_)));
    }

    #[test]
    fn test_validate_batch_too_large() {
        let err = records_of(4000, 100).validate(1024, 1024).unwrap_err();
        assert!(matches!(err, BrokerError::RecordBatchTooLarge(_)));
    }

    #[test]
    fn test_validate_corrupt_count() {
        let err = MemoryRecords::new(Bytes::new(), 3, -1)
            .validate(1024, 4096)
            .unwrap_err();
        assert!(matches!(err, BrokerError::CorruptRecord(_)));
    }
}
