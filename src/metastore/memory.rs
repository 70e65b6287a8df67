use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::message::{LeaderAndIsr, ReplicaAssignment, TopicPartition};
use crate::{AppError, AppResult};

use super::{BrokerRegistration, MetadataStore, ProducerIdBlock};

const PRODUCER_ID_BLOCK_LEN: i64 = 1000;

#[derive(Debug)]
struct Notifier {
    tx: watch::Sender<u64>,
    rx: watch::Receiver<u64>,
}

impl Notifier {
    fn new() -> Self {
        let (tx, rx) = watch::channel(0);
        Self { tx, rx }
    }

    fn fire(&self) {
        self.tx.send_modify(|v| *v += 1);
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.rx.clone()
    }
}

#[derive(Debug, Default)]
struct StoreState {
    coordinator: Option<(i32, i32)>,
    coordinator_epoch: i32,
    brokers: HashMap<i32, BrokerRegistration>,
    next_broker_epoch: i64,
    topics: HashMap<String, Uuid>,
    assignments: HashMap<String, BTreeMap<i32, ReplicaAssignment>>,
    leadership: HashMap<TopicPartition, LeaderAndIsr>,
    topics_to_delete: HashSet<String>,
    isr_change_notifications: Vec<TopicPartition>,
    pending_reassignments: BTreeMap<TopicPartition, Vec<i32>>,
    pending_preferred_elections: Vec<TopicPartition>,
    log_dir_failures: Vec<i32>,
    next_producer_id: i64,
    feature_level: i16,
}

/// In-process [`MetadataStore`]. Backs tests and the single-node launcher;
/// a production deployment plugs a consensus-backed implementation into the
/// same trait.
#[derive(Debug)]
pub struct MemoryMetaStore {
    state: Mutex<StoreState>,
    coordinator_watch: Notifier,
    broker_watch: Notifier,
    topic_watch: Notifier,
    deletion_watch: Notifier,
    isr_watch: Notifier,
    reassignment_watch: Notifier,
    preferred_election_watch: Notifier,
    log_dir_watch: Notifier,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            coordinator_watch: Notifier::new(),
            broker_watch: Notifier::new(),
            topic_watch: Notifier::new(),
            deletion_watch: Notifier::new(),
            isr_watch: Notifier::new(),
            reassignment_watch: Notifier::new(),
            preferred_election_watch: Notifier::new(),
            log_dir_watch: Notifier::new(),
        }
    }

    /// Drop the lease without the owner's cooperation, as a session expiry
    /// would. Fires the coordinator watch so candidates re-elect.
    pub fn expire_coordinator_session(&self) {
        let mut state = self.state.lock();
        state.coordinator = None;
        drop(state);
        self.coordinator_watch.fire();
    }

    fn check_coordinator_epoch(state: &StoreState, epoch: i32) -> AppResult<()> {
        if epoch != state.coordinator_epoch {
            return Err(AppError::CoordinatorMoved {
                observed_epoch: state.coordinator_epoch,
            });
        }
        Ok(())
    }
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetaStore {
    async fn try_claim_coordinator_lease(&self, broker_id: i32) -> AppResult<Option<i32>> {
        let mut state = self.state.lock();
        if state.coordinator.is_some() {
            return Ok(None);
        }
        state.coordinator_epoch += 1;
        let epoch = state.coordinator_epoch;
        state.coordinator = Some((broker_id, epoch));
        drop(state);
        info!("broker {} claimed the coordinator lease, epoch {}", broker_id, epoch);
        self.coordinator_watch.fire();
        Ok(Some(epoch))
    }

    async fn resign_coordinator(&self, broker_id: i32) -> AppResult<()> {
        let mut state = self.state.lock();
        if matches!(state.coordinator, Some((owner, _)) if owner == broker_id) {
            state.coordinator = None;
            drop(state);
            self.coordinator_watch.fire();
        }
        Ok(())
    }

    fn coordinator(&self) -> Option<(i32, i32)> {
        self.state.lock().coordinator
    }

    fn coordinator_epoch(&self) -> i32 {
        self.state.lock().coordinator_epoch
    }

    fn watch_coordinator(&self) -> watch::Receiver<u64> {
        self.coordinator_watch.subscribe()
    }

    async fn register_broker(
        &self,
        id: i32,
        host: String,
        port: u16,
        rack: Option<String>,
    ) -> AppResult<i64> {
        let mut state = self.state.lock();
        state.next_broker_epoch += 1;
        let epoch = state.next_broker_epoch;
        state.brokers.insert(
            id,
            BrokerRegistration {
                id,
                epoch,
                host,
                port,
                rack,
            },
        );
        drop(state);
        self.broker_watch.fire();
        Ok(epoch)
    }

    async fn unregister_broker(&self, broker_id: i32) -> AppResult<()> {
        self.state.lock().brokers.remove(&broker_id);
        self.broker_watch.fire();
        Ok(())
    }

    fn live_brokers(&self) -> Vec<BrokerRegistration> {
        let mut brokers: Vec<_> = self.state.lock().brokers.values().cloned().collect();
        brokers.sort_by_key(|b| b.id);
        brokers
    }

    fn broker_epoch(&self, broker_id: i32) -> Option<i64> {
        self.state.lock().brokers.get(&broker_id).map(|b| b.epoch)
    }

    fn watch_brokers(&self) -> watch::Receiver<u64> {
        self.broker_watch.subscribe()
    }

    async fn create_topic(
        &self,
        topic: &str,
        assignment: BTreeMap<i32, ReplicaAssignment>,
    ) -> AppResult<Uuid> {
        let mut state = self.state.lock();
        if state.topics.contains_key(topic) {
            return Err(AppError::InvalidValue("topic already exists", topic.to_string()));
        }
        let topic_id = Uuid::new_v4();
        state.topics.insert(topic.to_string(), topic_id);
        state.assignments.insert(topic.to_string(), assignment);
        drop(state);
        self.topic_watch.fire();
        Ok(topic_id)
    }

    fn all_topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.state.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    fn topic_id(&self, topic: &str) -> Option<Uuid> {
        self.state.lock().topics.get(topic).copied()
    }

    fn topic_assignment(&self, topic: &str) -> Option<BTreeMap<i32, ReplicaAssignment>> {
        self.state.lock().assignments.get(topic).cloned()
    }

    async fn set_topic_assignment(
        &self,
        topic: &str,
        assignment: BTreeMap<i32, ReplicaAssignment>,
        coordinator_epoch: i32,
    ) -> AppResult<()> {
        let mut state = self.state.lock();
        Self::check_coordinator_epoch(&state, coordinator_epoch)?;
        if !state.topics.contains_key(topic) {
            return Err(AppError::InvalidValue("unknown topic", topic.to_string()));
        }
        state.assignments.insert(topic.to_string(), assignment);
        Ok(())
    }

    fn watch_topics(&self) -> watch::Receiver<u64> {
        self.topic_watch.subscribe()
    }

    async fn request_topic_deletion(&self, topic: &str) -> AppResult<()> {
        let mut state = self.state.lock();
        if !state.topics.contains_key(topic) {
            return Err(AppError::InvalidValue("unknown topic", topic.to_string()));
        }
        state.topics_to_delete.insert(topic.to_string());
        drop(state);
        self.deletion_watch.fire();
        Ok(())
    }

    fn topics_marked_for_deletion(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.state.lock().topics_to_delete.iter().cloned().collect();
        topics.sort();
        topics
    }

    async fn finish_topic_deletion(&self, topic: &str, coordinator_epoch: i32) -> AppResult<()> {
        let mut state = self.state.lock();
        Self::check_coordinator_epoch(&state, coordinator_epoch)?;
        state.topics.remove(topic);
        state.assignments.remove(topic);
        state.topics_to_delete.remove(topic);
        state.leadership.retain(|tp, _| tp.topic() != topic);
        drop(state);
        self.topic_watch.fire();
        Ok(())
    }

    fn watch_topic_deletions(&self) -> watch::Receiver<u64> {
        self.deletion_watch.subscribe()
    }

    fn leader_and_isr(&self, topic_partition: &TopicPartition) -> Option<LeaderAndIsr> {
        self.state.lock().leadership.get(topic_partition).cloned()
    }

    async fn set_leader_and_isr(
        &self,
        topic_partition: &TopicPartition,
        leader_and_isr: LeaderAndIsr,
        expected_partition_epoch: i32,
        coordinator_epoch: i32,
    ) -> AppResult<LeaderAndIsr> {
        let mut state = self.state.lock();
        Self::check_coordinator_epoch(&state, coordinator_epoch)?;
        if let Some(current) = state.leadership.get(topic_partition) {
            if current.partition_epoch != expected_partition_epoch {
                return Err(AppError::VersionConflict(format!(
                    "{}: expected partition epoch {}, found {}",
                    topic_partition, expected_partition_epoch, current.partition_epoch
                )));
            }
        }
        let mut committed = leader_and_isr;
        committed.partition_epoch = expected_partition_epoch + 1;
        state
            .leadership
            .insert(topic_partition.clone(), committed.clone());
        Ok(committed)
    }

    async fn propose_isr_update(
        &self,
        topic_partition: &TopicPartition,
        leader_and_isr: LeaderAndIsr,
        expected_partition_epoch: i32,
    ) -> AppResult<LeaderAndIsr> {
        let mut state = self.state.lock();
        let Some(current) = state.leadership.get(topic_partition) else {
            return Err(AppError::InvalidValue(
                "unknown partition",
                topic_partition.to_string(),
            ));
        };
        if current.partition_epoch != expected_partition_epoch {
            return Err(AppError::VersionConflict(format!(
                "{}: expected partition epoch {}, found {}",
                topic_partition, expected_partition_epoch, current.partition_epoch
            )));
        }
        let mut committed = leader_and_isr;
        committed.partition_epoch = expected_partition_epoch + 1;
        state
            .leadership
            .insert(topic_partition.clone(), committed.clone());
        state.isr_change_notifications.push(topic_partition.clone());
        drop(state);
        self.isr_watch.fire();
        Ok(committed)
    }

    fn drain_isr_change_notifications(&self) -> Vec<TopicPartition> {
        std::mem::take(&mut self.state.lock().isr_change_notifications)
    }

    fn watch_isr_changes(&self) -> watch::Receiver<u64> {
        self.isr_watch.subscribe()
    }

    async fn request_reassignment(
        &self,
        reassignment: BTreeMap<TopicPartition, Vec<i32>>,
    ) -> AppResult<()> {
        self.state.lock().pending_reassignments.extend(reassignment);
        self.reassignment_watch.fire();
        Ok(())
    }

    fn take_pending_reassignments(&self) -> BTreeMap<TopicPartition, Vec<i32>> {
        std::mem::take(&mut self.state.lock().pending_reassignments)
    }

    fn watch_reassignment_triggers(&self) -> watch::Receiver<u64> {
        self.reassignment_watch.subscribe()
    }

    async fn request_preferred_election(
        &self,
        partitions: Vec<TopicPartition>,
    ) -> AppResult<()> {
        self.state
            .lock()
            .pending_preferred_elections
            .extend(partitions);
        self.preferred_election_watch.fire();
        Ok(())
    }

    fn take_pending_preferred_elections(&self) -> Vec<TopicPartition> {
        std::mem::take(&mut self.state.lock().pending_preferred_elections)
    }

    fn watch_preferred_election_triggers(&self) -> watch::Receiver<u64> {
        self.preferred_election_watch.subscribe()
    }

    async fn notify_log_dir_failure(&self, broker_id: i32) -> AppResult<()> {
        self.state.lock().log_dir_failures.push(broker_id);
        self.log_dir_watch.fire();
        Ok(())
    }

    fn drain_log_dir_failure_notifications(&self) -> Vec<i32> {
        std::mem::take(&mut self.state.lock().log_dir_failures)
    }

    fn watch_log_dir_failures(&self) -> watch::Receiver<u64> {
        self.log_dir_watch.subscribe()
    }

    async fn allocate_producer_id_block(
        &self,
        broker_id: i32,
        broker_epoch: i64,
    ) -> AppResult<ProducerIdBlock> {
        let mut state = self.state.lock();
        match state.brokers.get(&broker_id) {
            Some(reg) if reg.epoch == broker_epoch => {}
            _ => {
                return Err(AppError::InvalidValue(
                    "stale broker epoch",
                    format!("{broker_id}@{broker_epoch}"),
                ))
            }
        }
        let first_id = state.next_producer_id;
        state.next_producer_id += PRODUCER_ID_BLOCK_LEN;
        Ok(ProducerIdBlock {
            first_id,
            len: PRODUCER_ID_BLOCK_LEN,
        })
    }

    fn feature_level(&self) -> i16 {
        self.state.lock().feature_level
    }

    async fn set_feature_level(&self, level: i16, coordinator_epoch: i32) -> AppResult<()> {
        let mut state = self.state.lock();
        Self::check_coordinator_epoch(&state, coordinator_epoch)?;
        state.feature_level = level;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lease_is_exclusive_and_epoch_monotone() {
        let store = MemoryMetaStore::new();
        let epoch1 = store.try_claim_coordinator_lease(1).await.unwrap();
        assert_eq!(epoch1, Some(1));
        assert_eq!(store.try_claim_coordinator_lease(2).await.unwrap(), None);

        store.resign_coordinator(1).await.unwrap();
        let epoch2 = store.try_claim_coordinator_lease(2).await.unwrap();
        assert_eq!(epoch2, Some(2));
    }

    #[tokio::test]
    async fn test_stale_coordinator_epoch_is_rejected() {
        let store = MemoryMetaStore::new();
        store.try_claim_coordinator_lease(1).await.unwrap();
        let tp = TopicPartition::new("t", 0);
        store
            .set_leader_and_isr(&tp, LeaderAndIsr::initial(1, vec![1, 2]), 0, 1)
            .await
            .unwrap();

        // coordinator moves
        store.expire_coordinator_session();
        store.try_claim_coordinator_lease(2).await.unwrap();

        let err = store
            .set_leader_and_isr(&tp, LeaderAndIsr::initial(1, vec![1, 2]), 1, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CoordinatorMoved { observed_epoch: 2 }));
    }

    #[tokio::test]
    async fn test_isr_proposal_cas() {
        let store = MemoryMetaStore::new();
        store.try_claim_coordinator_lease(1).await.unwrap();
        let tp = TopicPartition::new("t", 0);
        let committed = store
            .set_leader_and_isr(&tp, LeaderAndIsr::initial(1, vec![1, 2, 3]), 0, 1)
            .await
            .unwrap();
        assert_eq!(committed.partition_epoch, 1);

        let shrunk = LeaderAndIsr::new(1, 0, vec![1, 2], committed.partition_epoch);
        let committed2 = store
            .propose_isr_update(&tp, shrunk.clone(), committed.partition_epoch)
            .await
            .unwrap();
        assert_eq!(committed2.partition_epoch, 2);
        assert_eq!(store.drain_isr_change_notifications(), vec![tp.clone()]);

        // replaying the old epoch conflicts
        let err = store
            .propose_isr_update(&tp, shrunk, committed.partition_epoch)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::VersionConflict(_)));
    }

    #[tokio::test]
    async fn test_producer_id_blocks_do_not_overlap() {
        let store = MemoryMetaStore::new();
        let epoch = store
            .register_broker(1, "localhost".into(), 9092, None)
            .await
            .unwrap();
        let a = store.allocate_producer_id_block(1, epoch).await.unwrap();
        let b = store.allocate_producer_id_block(1, epoch).await.unwrap();
        assert_eq!(a.first_id + a.len, b.first_id);
        assert!(store.allocate_producer_id_block(1, epoch - 1).await.is_err());
    }
}
