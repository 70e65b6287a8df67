use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::message::TopicPartition;
use crate::request::DeleteRecordsPartitionResult;
use crate::utils::DelayedOperation;
use crate::BrokerError;

use super::ReplicaManager;

pub type DeleteRecordsResponseSender =
    oneshot::Sender<BTreeMap<TopicPartition, DeleteRecordsPartitionResult>>;

/// Per-partition progress of a DeleteRecords call: the leader truncated its
/// own log start, now the low watermark must propagate through the ISR.
#[derive(Debug)]
pub struct DeleteRecordsPartitionStatus {
    pub required_offset: i64,
    pub pending: AtomicCell<bool>,
    pub result: Mutex<DeleteRecordsPartitionResult>,
}

impl DeleteRecordsPartitionStatus {
    pub fn new(required_offset: i64, low_watermark: i64) -> Self {
        Self {
            required_offset,
            pending: AtomicCell::new(true),
            result: Mutex::new(DeleteRecordsPartitionResult {
                low_watermark,
                error: Some(BrokerError::RequestTimedOut(
                    "low watermark did not propagate in time".to_string(),
                )),
            }),
        }
    }
}

#[derive(Debug)]
pub struct DelayedDeleteRecords {
    replica_manager: Arc<ReplicaManager>,
    timeout_ms: u64,
    partition_status: BTreeMap<TopicPartition, DeleteRecordsPartitionStatus>,
    tx: Mutex<Option<DeleteRecordsResponseSender>>,
}

impl DelayedDeleteRecords {
    pub fn new(
        replica_manager: Arc<ReplicaManager>,
        timeout_ms: u64,
        partition_status: BTreeMap<TopicPartition, DeleteRecordsPartitionStatus>,
        tx: DeleteRecordsResponseSender,
    ) -> Self {
        Self {
            replica_manager,
            timeout_ms,
            partition_status,
            tx: Mutex::new(Some(tx)),
        }
    }
}

impl DelayedOperation for DelayedDeleteRecords {
    fn delay_ms(&self) -> u64 {
        self.timeout_ms
    }

    async fn try_complete(&self) -> bool {
        for (tp, status) in &self.partition_status {
            if !status.pending.load() {
                continue;
            }
            match self.replica_manager.online_partition(tp) {
                Err(e) => {
                    status.pending.store(false);
                    let mut result = status.result.lock();
                    result.error = Some(e);
                }
                Ok(partition) => {
                    let low_watermark = partition.low_watermark().await;
                    if low_watermark >= status.required_offset {
                        status.pending.store(false);
                        let mut result = status.result.lock();
                        result.low_watermark = low_watermark;
                        result.error = None;
                    }
                }
            }
        }
        self.partition_status.values().all(|s| !s.pending.load())
    }

    async fn on_complete(&self) {
        let results: BTreeMap<TopicPartition, DeleteRecordsPartitionResult> = self
            .partition_status
            .iter()
            .map(|(tp, status)| (tp.clone(), status.result.lock().clone()))
            .collect();
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(results);
        }
    }

    async fn on_expiration(&self) {
        trace!("delayed delete-records expired");
    }
}
