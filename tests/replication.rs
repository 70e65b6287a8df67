//! End-to-end replication scenarios over an in-process cluster: acks=all
//! produce, ISR shrink and re-expansion, delete-records low watermarks and
//! log-directory failure.

mod common;

use std::collections::{BTreeMap, HashMap};

use slatemq::message::{LeaderRecoveryState, TopicPartition};
use slatemq::metastore::MetadataStore;
use slatemq::replica::{HostedPartition, MetadataDelta};
use slatemq::request::LeaderAndIsrPartitionState;
use slatemq::request::StopReplicaPartitionState;
use slatemq::request::StopReplicaRequest;
use slatemq::BrokerError;

use common::{wait_until, TestCluster, LAG_MS};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acks_all_produce_waits_for_full_isr() {
    let cluster = TestCluster::start(&[1, 2, 3]).await;
    cluster
        .create_topic("orders", BTreeMap::from([(0, vec![1, 2, 3])]))
        .await;
    let tp = TopicPartition::new("orders", 0);
    let leader = cluster.leader_id(&tp);
    assert_eq!(leader, 1, "first assigned replica should lead");

    // two batches of 10 records each
    let responses = cluster.produce(leader, "orders", 0, 10, -1).await;
    assert!(responses[&tp].error.is_none(), "{:?}", responses[&tp].error);
    assert_eq!(responses[&tp].base_offset, 0);
    let responses = cluster.produce(leader, "orders", 0, 10, -1).await;
    assert!(responses[&tp].error.is_none());
    assert_eq!(responses[&tp].base_offset, 10);

    // the callback fired, so every ISR member holds offset 19 and the
    // leader's high watermark reached 20
    let leader_partition = cluster.replica_manager(leader).online_partition(&tp).unwrap();
    assert_eq!(leader_partition.high_watermark(), 20);
    for follower in [2, 3] {
        let partition = cluster.replica_manager(follower).online_partition(&tp).unwrap();
        assert_eq!(partition.log_end_offset(), 20);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_falls_behind_then_catches_up() {
    let cluster = TestCluster::start(&[1, 2, 3]).await;
    cluster
        .create_topic("orders", BTreeMap::from([(0, vec![1, 2, 3])]))
        .await;
    let tp = TopicPartition::new("orders", 0);
    let epoch_before = cluster.metastore.leader_and_isr(&tp).unwrap().partition_epoch;

    // pause follower 3 by stopping its replica (it keeps its registration)
    let (_, coordinator_epoch) = cluster.metastore.coordinator().unwrap();
    cluster
        .replica_manager(3)
        .stop_replica(StopReplicaRequest {
            controller_id: 0,
            controller_epoch: coordinator_epoch,
            broker_epoch: -1,
            partition_states: vec![StopReplicaPartitionState {
                topic_partition: tp.clone(),
                leader_epoch: slatemq::message::NO_EPOCH,
                delete_partition: false,
            }],
        })
        .await;

    let responses = cluster.produce(1, "orders", 0, 100, 1).await;
    assert!(responses[&tp].error.is_none());

    // after 1.5x the lag budget the leader shrinks the ISR to {1, 2}
    let metastore = cluster.metastore.clone();
    let shrunk = wait_until("isr shrinks to {1,2}", LAG_MS as u64 * 10, || {
        let metastore = metastore.clone();
        let tp = tp.clone();
        async move {
            let lisr = metastore.leader_and_isr(&tp)?;
            (lisr.isr == vec![1, 2]).then_some(lisr)
        }
    })
    .await;
    assert!(shrunk.partition_epoch > epoch_before, "shrink bumps the partition epoch");

    // resume follower 3 with the current leadership; it catches up and the
    // ISR grows back
    let request = cluster.leader_and_isr_request(&tp);
    let response = cluster.replica_manager(3).become_leader_or_follower(request).await;
    assert!(response.error.is_none());

    let expanded = wait_until("isr expands to {1,2,3}", 5_000, || {
        let metastore = metastore.clone();
        let tp = tp.clone();
        async move {
            let lisr = metastore.leader_and_isr(&tp)?;
            (lisr.isr == vec![1, 2, 3]).then_some(lisr)
        }
    })
    .await;
    assert!(expanded.partition_epoch > shrunk.partition_epoch, "expand bumps the partition epoch");

    let follower = cluster.replica_manager(3).online_partition(&tp).unwrap();
    assert_eq!(follower.log_end_offset(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_records_reports_low_watermark() {
    let cluster = TestCluster::start(&[1, 2]).await;
    cluster
        .create_topic("orders", BTreeMap::from([(0, vec![1, 2])]))
        .await;
    let tp = TopicPartition::new("orders", 0);

    let responses = cluster.produce(1, "orders", 0, 50, -1).await;
    assert!(responses[&tp].error.is_none());

    let rx = cluster
        .replica_manager(1)
        .delete_records(5_000, BTreeMap::from([(tp.clone(), 20)]))
        .await;
    let results = rx.await.unwrap();
    assert!(results[&tp].error.is_none(), "{:?}", results[&tp].error);
    assert_eq!(results[&tp].low_watermark, 20);

    // a reader below the new start offset is out of range now
    let partition = cluster.replica_manager(1).online_partition(&tp).unwrap();
    assert_eq!(partition.log_start_offset(), 20);

    // deleting past the high watermark is rejected
    let rx = cluster
        .replica_manager(1)
        .delete_records(5_000, BTreeMap::from([(tp.clone(), 1_000)]))
        .await;
    let results = rx.await.unwrap();
    assert!(matches!(
        results[&tp].error,
        Some(BrokerError::OffsetOutOfRange(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_log_dir_failure_moves_leadership() {
    let cluster = TestCluster::start(&[1, 2, 3]).await;
    cluster
        .create_topic("orders", BTreeMap::from([(0, vec![1, 2, 3])]))
        .await;
    let tp = TopicPartition::new("orders", 0);
    let responses = cluster.produce(1, "orders", 0, 10, -1).await;
    assert!(responses[&tp].error.is_none());

    // the leader's only log directory dies
    let dir = common::broker_dir(1);
    cluster.log_managers[&1].fail_dir(&dir);
    cluster
        .replica_manager(1)
        .dir_failure_sender()
        .send(dir)
        .await
        .unwrap();

    // broker 1 marks the partition offline
    let rm1 = cluster.replica_manager(1).clone();
    wait_until("partition goes offline on broker 1", 5_000, || {
        let rm1 = rm1.clone();
        let tp = tp.clone();
        async move {
            matches!(rm1.hosted_partition(&tp), Some(HostedPartition::Offline) | None)
                .then_some(())
        }
    })
    .await;

    // the coordinator elects a new leader from the surviving ISR
    let metastore = cluster.metastore.clone();
    let new_leadership = wait_until("leadership moves off broker 1", 5_000, || {
        let metastore = metastore.clone();
        let tp = tp.clone();
        async move {
            let lisr = metastore.leader_and_isr(&tp)?;
            (lisr.leader != 1 && lisr.leader != -1).then_some(lisr)
        }
    })
    .await;
    assert!(
        [2, 3].contains(&new_leadership.leader),
        "new leader must come from the ISR"
    );

    // and the new leader serves produce
    let responses = cluster
        .produce(new_leadership.leader, "orders", 0, 5, 1)
        .await;
    assert!(responses[&tp].error.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_metadata_delta_applies_with_role_primitives() {
    let cluster = TestCluster::start(&[1]).await;
    let tp = TopicPartition::new("ledger", 0);
    let (_, coordinator_epoch) = cluster.metastore.coordinator().unwrap();
    let topic_id = uuid::Uuid::new_v4();

    // deltas from a metadata log use the same primitives as control RPCs
    let delta = MetadataDelta {
        controller_epoch: coordinator_epoch,
        topic_ids: HashMap::from([("ledger".to_string(), topic_id)]),
        leaders: vec![LeaderAndIsrPartitionState {
            topic_partition: tp.clone(),
            leader: 1,
            leader_epoch: 0,
            isr: vec![1],
            partition_epoch: 0,
            replicas: vec![1],
            adding_replicas: Vec::new(),
            removing_replicas: Vec::new(),
            is_new: true,
            leader_recovery_state: LeaderRecoveryState::Recovered,
        }],
        followers: Vec::new(),
        deleted: Vec::new(),
    };
    cluster.replica_manager(1).apply_metadata_delta(delta).await;

    let partition = cluster.replica_manager(1).online_partition(&tp).unwrap();
    assert!(partition.is_leader().await);
    assert_eq!(partition.topic_id(), Some(topic_id));

    // a sole-replica leader commits on append
    let responses = cluster.produce(1, "ledger", 0, 4, -1).await;
    assert!(responses[&tp].error.is_none());
    assert_eq!(partition.high_watermark(), 4);

    // removals in a later delta run before any leadership changes
    let delta = MetadataDelta {
        controller_epoch: coordinator_epoch,
        deleted: vec![tp.clone()],
        ..MetadataDelta::default()
    };
    cluster.replica_manager(1).apply_metadata_delta(delta).await;
    assert!(cluster.replica_manager(1).hosted_partition(&tp).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replica_moves_between_log_dirs() {
    let cluster = TestCluster::start(&[1, 2]).await;
    cluster
        .create_topic("orders", BTreeMap::from([(0, vec![1, 2])]))
        .await;
    let tp = TopicPartition::new("orders", 0);
    let responses = cluster.produce(1, "orders", 0, 30, -1).await;
    assert!(responses[&tp].error.is_none());

    let partition = cluster.replica_manager(1).online_partition(&tp).unwrap();
    assert_eq!(partition.log_dir(), common::broker_dir(1));

    let target = common::second_broker_dir(1);
    cluster
        .replica_manager(1)
        .alter_replica_log_dir(&tp, &target)
        .await
        .unwrap();

    // the future log catches up through the loopback fetcher and is
    // promoted in place, data intact
    wait_until("future log is promoted", 5_000, || {
        let partition = partition.clone();
        let target = target.clone();
        async move {
            (partition.log_dir() == target && partition.log_end_offset() == 30).then_some(())
        }
    })
    .await;
    assert!(!partition.has_future_log());

    // the partition keeps serving from the new directory
    let responses = cluster.produce(1, "orders", 0, 5, -1).await;
    assert!(responses[&tp].error.is_none());
    assert_eq!(responses[&tp].base_offset, 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_replica_with_delete_then_recreate() {
    let cluster = TestCluster::start(&[1, 2]).await;
    cluster
        .create_topic("orders", BTreeMap::from([(0, vec![1, 2])]))
        .await;
    let tp = TopicPartition::new("orders", 0);
    let old_topic_id = cluster.metastore.topic_id("orders").unwrap();
    let responses = cluster.produce(1, "orders", 0, 10, 1).await;
    assert!(responses[&tp].error.is_none());

    let (_, coordinator_epoch) = cluster.metastore.coordinator().unwrap();
    let response = cluster
        .replica_manager(2)
        .stop_replica(StopReplicaRequest {
            controller_id: 0,
            controller_epoch: coordinator_epoch,
            broker_epoch: -1,
            partition_states: vec![StopReplicaPartitionState {
                topic_partition: tp.clone(),
                leader_epoch: slatemq::message::EPOCH_DURING_DELETE,
                delete_partition: true,
            }],
        })
        .await;
    assert!(response.error.is_none());
    assert!(cluster.replica_manager(2).hosted_partition(&tp).is_none());

    // a fresh LeaderAndIsr carrying a new topic id builds a brand-new
    // replica under that id
    let mut request = cluster.leader_and_isr_request(&tp);
    let new_topic_id = uuid::Uuid::new_v4();
    request.topic_ids.insert("orders".to_string(), new_topic_id);
    let response = cluster.replica_manager(2).become_leader_or_follower(request).await;
    assert!(response.partition_errors[&tp].is_none());
    let partition = cluster.replica_manager(2).online_partition(&tp).unwrap();
    assert_eq!(partition.topic_id(), Some(new_topic_id));

    // the empty replica re-replicates the leader's log from scratch
    wait_until("recreated replica catches up", 5_000, || {
        let partition = partition.clone();
        async move { (partition.log_end_offset() == 10).then_some(()) }
    })
    .await;
}
