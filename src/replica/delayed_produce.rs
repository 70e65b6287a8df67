use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::message::TopicPartition;
use crate::request::ProducePartitionResponse;
use crate::utils::DelayedOperation;
use crate::BrokerError;

use super::ReplicaManager;

pub type ProduceResponseSender = oneshot::Sender<BTreeMap<TopicPartition, ProducePartitionResponse>>;

/// Per-partition progress of an acks=all produce. The response slot starts
/// as a timeout so an expiry needs no extra bookkeeping; satisfaction
/// rewrites it with the append result.
#[derive(Debug)]
pub struct ProducePartitionStatus {
    pub required_offset: i64,
    pub acks_pending: AtomicCell<bool>,
    pub response: Mutex<ProducePartitionResponse>,
}

impl ProducePartitionStatus {
    pub fn new(required_offset: i64, success: ProducePartitionResponse) -> Self {
        let mut response = success;
        response.error = Some(BrokerError::RequestTimedOut(format!(
            "partition {} did not replicate in time",
            response.partition
        )));
        Self {
            required_offset,
            acks_pending: AtomicCell::new(true),
            response: Mutex::new(response),
        }
    }

    fn resolve(&self, error: Option<BrokerError>) {
        self.acks_pending.store(false);
        self.response.lock().error = error;
    }
}

/// acks=all produce waiting for the HW to pass the appended offsets on
/// every partition it touched.
#[derive(Debug)]
pub struct DelayedProduce {
    replica_manager: Arc<ReplicaManager>,
    timeout_ms: u64,
    partition_status: BTreeMap<TopicPartition, ProducePartitionStatus>,
    tx: Mutex<Option<ProduceResponseSender>>,
}

impl DelayedProduce {
    pub fn new(
        replica_manager: Arc<ReplicaManager>,
        timeout_ms: u64,
        partition_status: BTreeMap<TopicPartition, ProducePartitionStatus>,
        tx: ProduceResponseSender,
    ) -> Self {
        Self {
            replica_manager,
            timeout_ms,
            partition_status,
            tx: Mutex::new(Some(tx)),
        }
    }
}

impl DelayedOperation for DelayedProduce {
    fn delay_ms(&self) -> u64 {
        self.timeout_ms
    }

    async fn try_complete(&self) -> bool {
        for (tp, status) in &self.partition_status {
            if !status.acks_pending.load() {
                continue;
            }
            match self.replica_manager.online_partition(tp) {
                Err(e) => status.resolve(Some(e)),
                Ok(partition) => {
                    let (done, error) = partition
                        .check_enough_replicas_reach_offset(status.required_offset)
                        .await;
                    if done {
                        status.resolve(error);
                    }
                }
            }
        }
        self.partition_status
            .values()
            .all(|s| !s.acks_pending.load())
    }

    async fn on_complete(&self) {
        let responses: BTreeMap<TopicPartition, ProducePartitionResponse> = self
            .partition_status
            .iter()
            .map(|(tp, status)| (tp.clone(), status.response.lock().clone()))
            .collect();
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(responses);
        }
    }

    async fn on_expiration(&self) {
        trace!(
            "delayed produce expired with {} partitions still pending",
            self.partition_status
                .values()
                .filter(|s| s.acks_pending.load())
                .count()
        );
    }
}
