use std::sync::Arc;

use async_trait::async_trait;
use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::message::{MemoryRecords, TopicPartition};
use crate::{AppError, AppResult};

use super::{EpochEndOffset, Log, LogAppendInfo, LogFetchInfo, LogManager};

#[derive(Debug)]
struct StoredBatch {
    base_offset: i64,
    leader_epoch: i32,
    records: MemoryRecords,
}

/// Heap-backed [`Log`] used by tests and the single-node launcher. Batches
/// are kept whole; offsets are assigned per record, as a segment log would.
#[derive(Debug)]
pub struct MemoryLog {
    topic_partition: TopicPartition,
    dir: String,
    batches: Mutex<Vec<StoredBatch>>,
    epoch_chain: Mutex<Vec<(i32, i64)>>,
    log_start_offset: AtomicCell<i64>,
    log_end_offset: AtomicCell<i64>,
    failed: AtomicCell<bool>,
}

impl MemoryLog {
    pub fn new(topic_partition: TopicPartition, dir: impl Into<String>) -> Self {
        Self {
            topic_partition,
            dir: dir.into(),
            batches: Mutex::new(Vec::new()),
            epoch_chain: Mutex::new(Vec::new()),
            log_start_offset: AtomicCell::new(0),
            log_end_offset: AtomicCell::new(0),
            failed: AtomicCell::new(false),
        }
    }

    /// Simulate the backing directory going bad; every subsequent I/O call
    /// fails until the process restarts.
    pub fn fail(&self) {
        self.failed.store(true);
    }

    fn check_failed(&self) -> AppResult<()> {
        if self.failed.load() {
            return Err(AppError::Io(std::io::Error::other(format!(
                "log dir {} is offline",
                self.dir
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl Log for MemoryLog {
    async fn append_records(
        &self,
        records: MemoryRecords,
        leader_epoch: i32,
    ) -> AppResult<LogAppendInfo> {
        self.check_failed()?;
        let mut batches = self.batches.lock();
        let first_offset = self.log_end_offset.load();
        let count = records.record_count() as i64;
        let last_offset = first_offset + count.max(1) - 1;
        let log_append_time = records.max_timestamp();

        {
            let mut chain = self.epoch_chain.lock();
            match chain.last() {
                Some((epoch, _)) if *epoch == leader_epoch => {}
                _ => chain.push((leader_epoch, first_offset)),
            }
        }

        batches.push(StoredBatch {
            base_offset: first_offset,
            leader_epoch,
            records: records.clone(),
        });
        self.log_end_offset.store(last_offset + 1);
        trace!(
            "{} appended {} records at offset {}",
            self.topic_partition,
            count,
            first_offset
        );
        Ok(LogAppendInfo {
            first_offset,
            last_offset,
            log_append_time,
            records_count: records.record_count(),
        })
    }

    async fn read_records(
        &self,
        offset: i64,
        max_offset: i64,
        max_bytes: i32,
        min_one_message: bool,
    ) -> AppResult<LogFetchInfo> {
        self.check_failed()?;
        let start = self.log_start_offset.load();
        let end = self.log_end_offset.load();
        if offset < start || offset > end {
            return Err(AppError::Broker(crate::BrokerError::OffsetOutOfRange(
                format!(
                    "offset {} out of range [{}, {}] for {}",
                    offset, start, end, self.topic_partition
                ),
            )));
        }

        let batches = self.batches.lock();
        let mut collected: Vec<&StoredBatch> = Vec::new();
        let mut bytes = 0usize;
        for batch in batches.iter() {
            let batch_end = batch.base_offset + batch.records.record_count() as i64;
            if batch_end <= offset {
                continue;
            }
            if batch.base_offset >= max_offset {
                break;
            }
            let size = batch.records.size_in_bytes();
            if bytes + size > max_bytes as usize && !(collected.is_empty() && min_one_message) {
                break;
            }
            bytes += size;
            collected.push(batch);
        }

        // Concatenated batch bytes; re-framing per-record is a codec concern.
        let mut payload = Vec::with_capacity(bytes);
        let mut count = 0;
        let mut max_ts = -1;
        for batch in &collected {
            payload.extend_from_slice(batch.records.payload());
            count += batch.records.record_count();
            max_ts = max_ts.max(batch.records.max_timestamp());
        }
        Ok(LogFetchInfo {
            records: MemoryRecords::new(payload.into(), count, max_ts),
            log_start_offset: start,
            log_end_offset: end,
        })
    }

    fn log_end_offset(&self) -> i64 {
        self.log_end_offset.load()
    }

    fn log_start_offset(&self) -> i64 {
        self.log_start_offset.load()
    }

    async fn advance_log_start_offset(&self, offset: i64) -> AppResult<i64> {
        self.check_failed()?;
        let end = self.log_end_offset.load();
        if offset < 0 || offset > end {
            return Err(AppError::Broker(crate::BrokerError::OffsetOutOfRange(
                format!("cannot advance log start to {} with end {}", offset, end),
            )));
        }
        if offset > self.log_start_offset.load() {
            self.log_start_offset.store(offset);
            self.batches
                .lock()
                .retain(|b| b.base_offset + b.records.record_count() as i64 > offset);
        }
        Ok(self.log_start_offset.load())
    }

    async fn truncate_to(&self, offset: i64) -> AppResult<()> {
        self.check_failed()?;
        let mut batches = self.batches.lock();
        batches.retain(|b| b.base_offset < offset);
        // A batch straddling the truncation point is discarded whole, as a
        // segment log would truncate on a batch boundary.
        if let Some(last) = batches.last() {
            if last.base_offset + last.records.record_count() as i64 > offset {
                batches.pop();
            }
        }
        let new_end = batches
            .last()
            .map(|b| b.base_offset + b.records.record_count() as i64)
            .unwrap_or_else(|| self.log_start_offset.load());
        self.log_end_offset.store(new_end);
        self.epoch_chain.lock().retain(|(_, start)| *start < new_end);
        Ok(())
    }

    fn assign_epoch_start_offset(&self, epoch: i32, start_offset: i64) {
        let mut chain = self.epoch_chain.lock();
        chain.retain(|(e, _)| *e < epoch);
        chain.push((epoch, start_offset));
    }

    fn end_offset_for_epoch(&self, epoch: i32) -> Option<EpochEndOffset> {
        let chain = self.epoch_chain.lock();
        let mut found: Option<(i32, usize)> = None;
        for (i, (e, _)) in chain.iter().enumerate() {
            if *e <= epoch {
                found = Some((*e, i));
            }
        }
        found.map(|(e, i)| {
            let end_offset = chain
                .get(i + 1)
                .map(|(_, start)| *start)
                .unwrap_or_else(|| self.log_end_offset.load());
            EpochEndOffset {
                leader_epoch: e,
                end_offset,
            }
        })
    }

    fn latest_epoch(&self) -> Option<i32> {
        self.epoch_chain.lock().last().map(|(e, _)| *e)
    }

    fn offset_for_timestamp(&self, timestamp: i64) -> Option<i64> {
        let batches = self.batches.lock();
        batches
            .iter()
            .find(|b| b.records.max_timestamp() >= timestamp)
            .map(|b| b.base_offset)
    }

    fn dir(&self) -> &str {
        &self.dir
    }

    async fn flush(&self) -> AppResult<()> {
        self.check_failed()
    }
}

/// [`LogManager`] over [`MemoryLog`]s. Partitions are spread round-robin
/// across the configured directory names so directory-failure handling is
/// exercisable without disks.
#[derive(Debug)]
pub struct MemoryLogManager {
    dirs: Vec<String>,
    logs: DashMap<TopicPartition, Arc<MemoryLog>>,
    future_logs: DashMap<TopicPartition, Arc<MemoryLog>>,
    next_dir: AtomicCell<usize>,
}

impl MemoryLogManager {
    pub fn new(dirs: Vec<String>) -> Self {
        assert!(!dirs.is_empty(), "at least one log dir is required");
        Self {
            dirs,
            logs: DashMap::new(),
            future_logs: DashMap::new(),
            next_dir: AtomicCell::new(0),
        }
    }

    /// Mark every log hosted in `dir` as failed, returning the affected
    /// partitions. Drives the directory-failure channel in tests.
    pub fn fail_dir(&self, dir: &str) -> Vec<TopicPartition> {
        let mut affected = Vec::new();
        for entry in self.logs.iter() {
            if entry.value().dir() == dir {
                entry.value().fail();
                affected.push(entry.key().clone());
            }
        }
        for entry in self.future_logs.iter() {
            if entry.value().dir() == dir {
                entry.value().fail();
            }
        }
        affected
    }
}

#[async_trait]
impl LogManager for MemoryLogManager {
    async fn get_or_create_log(
        &self,
        topic_partition: &TopicPartition,
        _is_new: bool,
    ) -> AppResult<Arc<dyn Log>> {
        let log = self
            .logs
            .entry(topic_partition.clone())
            .or_insert_with(|| {
                let idx = self.next_dir.fetch_add(1) % self.dirs.len();
                Arc::new(MemoryLog::new(
                    topic_partition.clone(),
                    self.dirs[idx].clone(),
                ))
            })
            .clone();
        Ok(log)
    }

    fn get_log(&self, topic_partition: &TopicPartition) -> Option<Arc<dyn Log>> {
        self.logs
            .get(topic_partition)
            .map(|e| e.value().clone() as Arc<dyn Log>)
    }

    async fn remove_log(&self, topic_partition: &TopicPartition) -> AppResult<()> {
        self.logs.remove(topic_partition);
        self.future_logs.remove(topic_partition);
        Ok(())
    }

    async fn create_future_log(
        &self,
        topic_partition: &TopicPartition,
        dir: &str,
    ) -> AppResult<Arc<dyn Log>> {
        let log = Arc::new(MemoryLog::new(topic_partition.clone(), dir));
        self.future_logs.insert(topic_partition.clone(), log.clone());
        Ok(log)
    }

    async fn confirm_future_log(&self, topic_partition: &TopicPartition) -> AppResult<()> {
        if let Some((_, promoted)) = self.future_logs.remove(topic_partition) {
            self.logs.insert(topic_partition.clone(), promoted);
        }
        Ok(())
    }

    fn log_dirs(&self) -> Vec<String> {
        self.dirs.clone()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn records(count: i32, ts: i64) -> MemoryRecords {
        MemoryRecords::new(Bytes::from(vec![1u8; count as usize * 8]), count, ts)
    }

    #[tokio::test]
    async fn test_append_assigns_offsets() {
        let log = MemoryLog::new(TopicPartition::new("t", 0), "dir-a");
        let info = log.append_records(records(10, 100), 0).await.unwrap();
        assert_eq!(info.first_offset, 0);
        assert_eq!(info.last_offset, 9);
        let info = log.append_records(records(5, 200), 0).await.unwrap();
        assert_eq!(info.first_offset, 10);
        assert_eq!(log.log_end_offset(), 15);
    }

    #[tokio::test]
    async fn test_epoch_chain_lookup() {
        let log = MemoryLog::new(TopicPartition::new("t", 0), "dir-a");
        log.append_records(records(10, 100), 0).await.unwrap();
        log.append_records(records(10, 200), 2).await.unwrap();
        let end = log.end_offset_for_epoch(0).unwrap();
        assert_eq!(end.leader_epoch, 0);
        assert_eq!(end.end_offset, 10);
        // epoch 1 was never written; the chain answers with epoch 0
        let end = log.end_offset_for_epoch(1).unwrap();
        assert_eq!(end.leader_epoch, 0);
        let end = log.end_offset_for_epoch(2).unwrap();
        assert_eq!(end.end_offset, 20);
    }

    #[tokio::test]
    async fn test_truncate_discards_suffix() {
        let log = MemoryLog::new(TopicPartition::new("t", 0), "dir-a");
        log.append_records(records(10, 100), 0).await.unwrap();
        log.append_records(records(10, 200), 1).await.unwrap();
        log.truncate_to(10).await.unwrap();
        assert_eq!(log.log_end_offset(), 10);
        assert_eq!(log.latest_epoch(), Some(0));
    }

    #[tokio::test]
    async fn test_advance_log_start() {
        let log = MemoryLog::new(TopicPartition::new("t", 0), "dir-a");
        log.append_records(records(10, 100), 0).await.unwrap();
        let low = log.advance_log_start_offset(10).await.unwrap();
        assert_eq!(low, 10);
        assert!(log.read_records(0, i64::MAX, 1024, true).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_dir_surfaces_io_error() {
        let manager = MemoryLogManager::new(vec!["dir-a".into()]);
        let tp = TopicPartition::new("t", 0);
        let log = manager.get_or_create_log(&tp, true).await.unwrap();
        assert_eq!(manager.fail_dir("dir-a"), vec![tp]);
        assert!(log.append_records(records(1, 1), 0).await.is_err());
    }
}
