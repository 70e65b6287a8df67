//! In-process multi-broker cluster used by the replication and coordinator
//! integration tests. Brokers share one metadata store and one loopback
//! transport; each runs a replica manager and a (mostly standby)
//! coordinator, exactly as a real deployment would.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use slatemq::controller::ClusterCoordinator;
use slatemq::log::MemoryLogManager;
use slatemq::message::{
    MemoryRecords, PartitionMsgData, ReplicaAssignment, TopicData, TopicPartition,
};
use slatemq::metastore::{MemoryMetaStore, MetadataStore};
use slatemq::replica::{DefaultReplicaSelector, ReplicaManager, ReplicaSelector};
use slatemq::request::{
    LeaderAndIsrPartitionState, LeaderAndIsrRequest, LocalTransport, ProducePartitionResponse,
};
use slatemq::service::{CoordinatorConfig, PurgatoryConfig, ReplicationConfig};

pub const LAG_MS: i64 = 200;

pub struct TestCluster {
    pub metastore: Arc<MemoryMetaStore>,
    pub transport: Arc<LocalTransport>,
    pub replica_managers: HashMap<i32, Arc<ReplicaManager>>,
    pub log_managers: HashMap<i32, Arc<MemoryLogManager>>,
    pub coordinators: HashMap<i32, Arc<ClusterCoordinator>>,
    pub notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_tx: mpsc::Sender<()>,
    _shutdown_complete_rx: mpsc::Receiver<()>,
}

fn replication_config() -> ReplicationConfig {
    ReplicationConfig {
        replica_lag_time_max_ms: LAG_MS,
        replica_fetch_min_bytes: 1,
        replica_fetch_max_bytes: 1 << 20,
        replica_fetch_wait_max_ms: 50,
        replica_fetch_backoff_ms: 10,
        num_replica_fetchers: 2,
        min_insync_replicas: 1,
        replica_high_watermark_checkpoint_interval_ms: 60_000,
        max_record_size: 1 << 20,
        max_batch_size: 4 << 20,
        halt_on_log_dir_failure: false,
        transaction_partition_verification_enable: false,
        replica_selector_name: Some("default".to_string()),
    }
}

fn coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig {
        auto_leader_rebalance_enable: false,
        leader_imbalance_per_broker_percentage: 0.1,
        leader_imbalance_check_interval_seconds: 3600,
        delete_topic_enable: true,
        unclean_leader_election_enable: false,
        event_queue_capacity: 256,
        controlled_shutdown_timeout_ms: 5_000,
        feature_versioning_enable: false,
        delegation_token_expiry_check_interval_ms: 3_600_000,
    }
}

pub fn broker_dir(broker_id: i32) -> String {
    format!("broker-{broker_id}-logs")
}

pub fn second_broker_dir(broker_id: i32) -> String {
    format!("broker-{broker_id}-logs-b")
}

impl TestCluster {
    pub async fn start(broker_ids: &[i32]) -> TestCluster {
        let metastore = Arc::new(MemoryMetaStore::new());
        let transport = LocalTransport::new();
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        let mut cluster = TestCluster {
            metastore,
            transport,
            replica_managers: HashMap::new(),
            log_managers: HashMap::new(),
            coordinators: HashMap::new(),
            notify_shutdown,
            _shutdown_complete_tx: shutdown_complete_tx,
            _shutdown_complete_rx: shutdown_complete_rx,
        };
        for id in broker_ids {
            cluster.start_broker(*id).await;
        }
        cluster.await_active_coordinator().await;
        cluster
    }

    /// Bring up one broker. The transport must know the broker before its
    /// registration fires the brokers watch, or the coordinator's first
    /// messages to it bounce.
    pub async fn start_broker(&mut self, broker_id: i32) {
        // two directories per broker so intra-broker log moves are possible
        let log_manager = Arc::new(MemoryLogManager::new(vec![
            broker_dir(broker_id),
            second_broker_dir(broker_id),
        ]));
        let replica_manager = ReplicaManager::new(
            broker_id,
            replication_config(),
            PurgatoryConfig::default(),
            log_manager.clone(),
            self.metastore.clone(),
            self.transport.endpoint(),
            Some(Arc::new(DefaultReplicaSelector) as Arc<dyn ReplicaSelector>),
            None,
            self.notify_shutdown.clone(),
            self._shutdown_complete_tx.clone(),
        )
        .await;
        replica_manager.startup().await;
        self.transport.register(broker_id, replica_manager.clone());
        let broker_epoch = self
            .metastore
            .register_broker(broker_id, "localhost".into(), 9000 + broker_id as u16, None)
            .await
            .unwrap();
        replica_manager.set_broker_epoch(broker_epoch);

        let coordinator = ClusterCoordinator::start(
            broker_id,
            coordinator_config(),
            self.metastore.clone() as Arc<dyn MetadataStore>,
            self.transport.rpc(),
            self.notify_shutdown.clone(),
            self._shutdown_complete_tx.clone(),
        )
        .await;

        self.log_managers.insert(broker_id, log_manager);
        self.replica_managers.insert(broker_id, replica_manager);
        self.coordinators.insert(broker_id, coordinator);
    }

    pub fn replica_manager(&self, broker_id: i32) -> &Arc<ReplicaManager> {
        &self.replica_managers[&broker_id]
    }

    pub async fn await_active_coordinator(&self) -> Arc<ClusterCoordinator> {
        wait_until("a coordinator claims the lease", 5_000, || async {
            self.coordinators.values().find(|c| c.is_active()).cloned()
        })
        .await
    }

    /// Create a topic and wait until every replica hosts its partitions.
    pub async fn create_topic(&self, topic: &str, assignment: BTreeMap<i32, Vec<i32>>) {
        let store_assignment: BTreeMap<i32, ReplicaAssignment> = assignment
            .iter()
            .map(|(p, replicas)| (*p, ReplicaAssignment::new(replicas.clone())))
            .collect();
        self.metastore
            .create_topic(topic, store_assignment)
            .await
            .unwrap();

        for (partition, replicas) in &assignment {
            let tp = TopicPartition::new(topic, *partition);
            for replica in replicas {
                let rm = self.replica_manager(*replica).clone();
                let tp = tp.clone();
                wait_until(
                    "replica hosts the new partition",
                    5_000,
                    move || {
                        let rm = rm.clone();
                        let tp = tp.clone();
                        async move { rm.online_partition(&tp).ok().map(|_| ()) }
                    },
                )
                .await;
            }
            // don't hand the topic to a test until the full replica set is
            // in sync; startup interleaving can begin with a partial ISR
            let metastore = self.metastore.clone();
            let expected: std::collections::HashSet<i32> = replicas.iter().copied().collect();
            wait_until("full isr", 5_000, move || {
                let metastore = metastore.clone();
                let tp = tp.clone();
                let expected = expected.clone();
                async move {
                    let lisr = metastore.leader_and_isr(&tp)?;
                    let isr: std::collections::HashSet<i32> =
                        lisr.isr.iter().copied().collect();
                    (isr == expected).then_some(())
                }
            })
            .await;
        }
    }

    pub fn leader_id(&self, tp: &TopicPartition) -> i32 {
        self.metastore.leader_and_isr(tp).expect("no leadership").leader
    }

    pub async fn produce(
        &self,
        broker_id: i32,
        topic: &str,
        partition: i32,
        record_count: i32,
        acks: i16,
    ) -> BTreeMap<TopicPartition, ProducePartitionResponse> {
        let rm = self.replica_manager(broker_id);
        let data = vec![TopicData::new(
            topic.to_string(),
            vec![PartitionMsgData::new(partition, records(record_count))],
        )];
        let rx = rm.append_records(5_000, acks, false, None, data).await;
        tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("produce timed out")
            .expect("produce response dropped")
    }

    /// Build a LeaderAndIsr request for one partition from the store's
    /// committed state, as the active coordinator would.
    pub fn leader_and_isr_request(&self, tp: &TopicPartition) -> LeaderAndIsrRequest {
        let leadership = self.metastore.leader_and_isr(tp).expect("no leadership");
        let assignment = self
            .metastore
            .topic_assignment(tp.topic())
            .and_then(|m| m.get(&tp.partition()).cloned())
            .expect("no assignment");
        let topic_id = self.metastore.topic_id(tp.topic()).expect("no topic id");
        let (coordinator_id, coordinator_epoch) =
            self.metastore.coordinator().expect("no active coordinator");
        LeaderAndIsrRequest {
            controller_id: coordinator_id,
            controller_epoch: coordinator_epoch,
            broker_epoch: -1,
            partition_states: vec![LeaderAndIsrPartitionState {
                topic_partition: tp.clone(),
                leader: leadership.leader,
                leader_epoch: leadership.leader_epoch,
                isr: leadership.isr.clone(),
                partition_epoch: leadership.partition_epoch,
                replicas: assignment.replicas.clone(),
                adding_replicas: assignment.adding_replicas.clone(),
                removing_replicas: assignment.removing_replicas.clone(),
                is_new: false,
                leader_recovery_state: leadership.leader_recovery_state,
            }],
            topic_ids: HashMap::from([(tp.topic().to_string(), topic_id)]),
        }
    }
}

pub fn records(count: i32) -> MemoryRecords {
    MemoryRecords::new(Bytes::from(vec![42u8; count as usize * 16]), count, 1_000)
}

/// Poll `check` every 20ms until it yields a value or `timeout_ms` elapses.
pub async fn wait_until<T, F, Fut>(what: &str, timeout_ms: u64, check: F) -> T
where
    F: Fn() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
