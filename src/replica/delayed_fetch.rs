use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::message::TopicPartition;
use crate::request::{FetchParams, FetchPartitionData, FetchPartitionResult};
use crate::utils::DelayedOperation;

use super::ReplicaManager;

pub type FetchResponseSender = oneshot::Sender<BTreeMap<TopicPartition, FetchPartitionResult>>;

/// Fetch parked until enough bytes accumulate, an error appears, or the
/// wait budget runs out. Completion re-reads the log so the response always
/// reflects the state at completion time, not registration time.
#[derive(Debug)]
pub struct DelayedFetch {
    replica_manager: Arc<ReplicaManager>,
    params: FetchParams,
    fetch_data: BTreeMap<TopicPartition, FetchPartitionData>,
    tx: Mutex<Option<FetchResponseSender>>,
}

impl DelayedFetch {
    pub fn new(
        replica_manager: Arc<ReplicaManager>,
        params: FetchParams,
        fetch_data: BTreeMap<TopicPartition, FetchPartitionData>,
        tx: FetchResponseSender,
    ) -> Self {
        Self {
            replica_manager,
            params,
            fetch_data,
            tx: Mutex::new(Some(tx)),
        }
    }
}

impl DelayedOperation for DelayedFetch {
    fn delay_ms(&self) -> u64 {
        self.params.max_wait_ms.max(0) as u64
    }

    async fn try_complete(&self) -> bool {
        let results = self
            .replica_manager
            .read_from_local_log(&self.params, &self.fetch_data, false)
            .await;
        let mut accumulated = 0usize;
        for result in results.values() {
            if result.error.is_some() || result.diverging_epoch.is_some() {
                return true;
            }
            accumulated += result.records.size_in_bytes();
        }
        accumulated >= self.params.min_bytes as usize
    }

    async fn on_complete(&self) {
        let update_fetch_state = self.params.is_from_follower();
        let results = self
            .replica_manager
            .read_from_local_log(&self.params, &self.fetch_data, update_fetch_state)
            .await;
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(results);
        }
    }

    async fn on_expiration(&self) {
        trace!("delayed fetch from replica {} expired", self.params.replica_id);
    }
}
