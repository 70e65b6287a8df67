mod memory;

pub use memory::MemoryMetaStore;

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use crate::message::{LeaderAndIsr, ReplicaAssignment, TopicPartition};
use crate::AppResult;

/// A broker's registration in the metadata store. The broker epoch is
/// assigned by the store and fences control RPCs issued against an older
/// incarnation of the same broker id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRegistration {
    pub id: i32,
    pub epoch: i64,
    pub host: String,
    pub port: u16,
    pub rack: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerIdBlock {
    pub first_id: i64,
    pub len: i64,
}

/// Typed face of the external consensus/metadata store.
///
/// Every coordinator-side write carries the coordinator epoch; the store
/// must reject a stale epoch with [`crate::AppError::CoordinatorMoved`].
/// Watches are version counters: a bumped value means "re-read and react".
#[async_trait]
pub trait MetadataStore: Send + Sync + Debug {
    // ---- coordinator lease ----

    /// CAS-claim the exclusive coordinator lease. On success the cluster
    /// coordinator epoch is incremented and returned; `None` means another
    /// broker holds the lease.
    async fn try_claim_coordinator_lease(&self, broker_id: i32) -> AppResult<Option<i32>>;

    async fn resign_coordinator(&self, broker_id: i32) -> AppResult<()>;

    fn coordinator(&self) -> Option<(i32, i32)>;

    fn coordinator_epoch(&self) -> i32;

    fn watch_coordinator(&self) -> watch::Receiver<u64>;

    // ---- brokers ----

    async fn register_broker(
        &self,
        id: i32,
        host: String,
        port: u16,
        rack: Option<String>,
    ) -> AppResult<i64>;

    async fn unregister_broker(&self, broker_id: i32) -> AppResult<()>;

    fn live_brokers(&self) -> Vec<BrokerRegistration>;

    fn broker_epoch(&self, broker_id: i32) -> Option<i64>;

    fn watch_brokers(&self) -> watch::Receiver<u64>;

    // ---- topics and assignments ----

    /// Create a topic with its replica assignment. Assigns and returns the
    /// stable topic UUID. Fires the topics watch.
    async fn create_topic(
        &self,
        topic: &str,
        assignment: BTreeMap<i32, ReplicaAssignment>,
    ) -> AppResult<Uuid>;

    fn all_topics(&self) -> Vec<String>;

    fn topic_id(&self, topic: &str) -> Option<Uuid>;

    fn topic_assignment(&self, topic: &str) -> Option<BTreeMap<i32, ReplicaAssignment>>;

    /// Replace a topic's assignment (reassignment commit). Coordinator-only.
    async fn set_topic_assignment(
        &self,
        topic: &str,
        assignment: BTreeMap<i32, ReplicaAssignment>,
        coordinator_epoch: i32,
    ) -> AppResult<()>;

    fn watch_topics(&self) -> watch::Receiver<u64>;

    // ---- topic deletion ----

    /// Admin marks a topic for deletion; fires the deletion watch.
    async fn request_topic_deletion(&self, topic: &str) -> AppResult<()>;

    fn topics_marked_for_deletion(&self) -> Vec<String>;

    /// Final removal of every trace of the topic. Coordinator-only.
    async fn finish_topic_deletion(&self, topic: &str, coordinator_epoch: i32) -> AppResult<()>;

    fn watch_topic_deletions(&self) -> watch::Receiver<u64>;

    // ---- partition leadership ----

    fn leader_and_isr(&self, topic_partition: &TopicPartition) -> Option<LeaderAndIsr>;

    /// Coordinator-side leader/ISR write. CAS on the partition epoch; the
    /// committed snapshot carries `expected_partition_epoch + 1`.
    async fn set_leader_and_isr(
        &self,
        topic_partition: &TopicPartition,
        leader_and_isr: LeaderAndIsr,
        expected_partition_epoch: i32,
        coordinator_epoch: i32,
    ) -> AppResult<LeaderAndIsr>;

    /// Leader-broker ISR proposal (shrink/expand). Same CAS discipline, no
    /// coordinator epoch; fires an ISR-change notification on commit.
    async fn propose_isr_update(
        &self,
        topic_partition: &TopicPartition,
        leader_and_isr: LeaderAndIsr,
        expected_partition_epoch: i32,
    ) -> AppResult<LeaderAndIsr>;

    fn drain_isr_change_notifications(&self) -> Vec<TopicPartition>;

    fn watch_isr_changes(&self) -> watch::Receiver<u64>;

    // ---- admin triggers ----

    /// Admin-requested reassignment: partition → target replica set.
    async fn request_reassignment(
        &self,
        reassignment: BTreeMap<TopicPartition, Vec<i32>>,
    ) -> AppResult<()>;

    fn take_pending_reassignments(&self) -> BTreeMap<TopicPartition, Vec<i32>>;

    fn watch_reassignment_triggers(&self) -> watch::Receiver<u64>;

    async fn request_preferred_election(
        &self,
        partitions: Vec<TopicPartition>,
    ) -> AppResult<()>;

    fn take_pending_preferred_elections(&self) -> Vec<TopicPartition>;

    fn watch_preferred_election_triggers(&self) -> watch::Receiver<u64>;

    // ---- broker-side notifications ----

    async fn notify_log_dir_failure(&self, broker_id: i32) -> AppResult<()>;

    fn drain_log_dir_failure_notifications(&self) -> Vec<i32>;

    fn watch_log_dir_failures(&self) -> watch::Receiver<u64>;

    // ---- producer ids and features ----

    async fn allocate_producer_id_block(
        &self,
        broker_id: i32,
        broker_epoch: i64,
    ) -> AppResult<ProducerIdBlock>;

    fn feature_level(&self) -> i16;

    async fn set_feature_level(&self, level: i16, coordinator_epoch: i32) -> AppResult<()>;
}
