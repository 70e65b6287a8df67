use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::message::TopicPartition;
use crate::metastore::MetadataStore;
use crate::utils::DelayedOperation;
use crate::BrokerError;

pub type ElectLeaderResponseSender =
    oneshot::Sender<BTreeMap<TopicPartition, Option<BrokerError>>>;

/// Admin leader election waiting for the coordinator's decision to land in
/// the metadata store.
#[derive(Debug)]
pub struct DelayedElectLeader {
    metastore: Arc<dyn MetadataStore>,
    timeout_ms: u64,
    expected_leaders: BTreeMap<TopicPartition, i32>,
    tx: Mutex<Option<ElectLeaderResponseSender>>,
}

impl DelayedElectLeader {
    pub fn new(
        metastore: Arc<dyn MetadataStore>,
        timeout_ms: u64,
        expected_leaders: BTreeMap<TopicPartition, i32>,
        tx: ElectLeaderResponseSender,
    ) -> Self {
        Self {
            metastore,
            timeout_ms,
            expected_leaders,
            tx: Mutex::new(Some(tx)),
        }
    }

    fn leader_matches(&self, tp: &TopicPartition, expected: i32) -> bool {
        self.metastore
            .leader_and_isr(tp)
            .map(|lisr| lisr.leader == expected)
            .unwrap_or(false)
    }
}

impl DelayedOperation for DelayedElectLeader {
    fn delay_ms(&self) -> u64 {
        self.timeout_ms
    }

    async fn try_complete(&self) -> bool {
        self.expected_leaders
            .iter()
            .all(|(tp, expected)| self.leader_matches(tp, *expected))
    }

    async fn on_complete(&self) {
        let results: BTreeMap<TopicPartition, Option<BrokerError>> = self
            .expected_leaders
            .iter()
            .map(|(tp, expected)| {
                let error = if self.leader_matches(tp, *expected) {
                    None
                } else {
                    Some(BrokerError::RequestTimedOut(format!(
                        "election for {} did not complete in time",
                        tp
                    )))
                };
                (tp.clone(), error)
            })
            .collect();
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(results);
        }
    }

    async fn on_expiration(&self) {
        trace!("delayed elect-leader expired");
    }
}
