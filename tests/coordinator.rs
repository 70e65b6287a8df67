//! Coordinator scenarios over an in-process cluster: phased reassignment,
//! coordinator fail-over with stale-epoch fencing, topic deletion blocked by
//! reassignment, AlterPartition validation and controlled shutdown.

mod common;

use std::collections::BTreeMap;

use slatemq::message::{LeaderAndIsr, TopicPartition};
use slatemq::metastore::MetadataStore;
use slatemq::request::{AlterPartitionItem, AlterPartitionRequest};
use slatemq::BrokerError;

use common::{wait_until, TestCluster};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reassignment_moves_replica_set() {
    let cluster = TestCluster::start(&[1, 2, 3, 4, 5, 6]).await;
    cluster
        .create_topic("orders", BTreeMap::from([(0, vec![1, 2, 3])]))
        .await;
    let tp = TopicPartition::new("orders", 0);
    let responses = cluster.produce(1, "orders", 0, 20, -1).await;
    assert!(responses[&tp].error.is_none());

    let coordinator = cluster.await_active_coordinator().await;
    let results = coordinator
        .reassign_partitions(BTreeMap::from([(tp.clone(), vec![4, 5, 6])]))
        .await;
    assert!(results[&tp].is_none(), "{:?}", results[&tp]);

    // phase B commits replicas = {4,5,6} once they are all in sync
    let metastore = cluster.metastore.clone();
    let final_assignment = wait_until("assignment converges to {4,5,6}", 10_000, || {
        let metastore = metastore.clone();
        let tp = tp.clone();
        async move {
            let assignment = metastore.topic_assignment(tp.topic())?;
            let assignment = assignment.get(&tp.partition())?.clone();
            (assignment.replicas == vec![4, 5, 6] && !assignment.is_being_reassigned())
                .then_some(assignment)
        }
    })
    .await;
    assert!(final_assignment.adding_replicas.is_empty());
    assert!(final_assignment.removing_replicas.is_empty());

    let leadership = cluster.metastore.leader_and_isr(&tp).unwrap();
    assert!(
        [4, 5, 6].contains(&leadership.leader),
        "leader {} must be in the target set",
        leadership.leader
    );

    // the old replicas were stopped with delete
    for old in [1, 2, 3] {
        let rm = cluster.replica_manager(old).clone();
        wait_until("old replica is dropped", 5_000, || {
            let rm = rm.clone();
            let tp = tp.clone();
            async move { rm.hosted_partition(&tp).is_none().then_some(()) }
        })
        .await;
    }
    // the new replicas carry the data
    for new in [4, 5, 6] {
        let rm = cluster.replica_manager(new).clone();
        wait_until("new replica catches up", 5_000, || {
            let rm = rm.clone();
            let tp = tp.clone();
            async move {
                let partition = rm.online_partition(&tp).ok()?;
                (partition.log_end_offset() == 20).then_some(())
            }
        })
        .await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coordinator_failover_fences_old_epoch() {
    let cluster = TestCluster::start(&[1, 2]).await;
    cluster
        .create_topic("orders", BTreeMap::from([(0, vec![1, 2])]))
        .await;
    let tp = TopicPartition::new("orders", 0);
    let (_, old_epoch) = cluster.metastore.coordinator().unwrap();

    // the active coordinator loses its session
    cluster.metastore.expire_coordinator_session();
    let (_, new_epoch) = wait_until("a new coordinator claims the lease", 5_000, || async {
        cluster.metastore.coordinator()
    })
    .await;
    assert!(new_epoch > old_epoch, "cluster epoch must increase on fail-over");

    // a control message carrying the new epoch is accepted
    let request = cluster.leader_and_isr_request(&tp);
    assert_eq!(request.controller_epoch, new_epoch);
    let response = cluster.replica_manager(2).become_leader_or_follower(request).await;
    assert!(response.error.is_none());

    // one still in flight from the deposed coordinator is rejected
    let mut stale = cluster.leader_and_isr_request(&tp);
    stale.controller_epoch = old_epoch;
    let response = cluster.replica_manager(2).become_leader_or_follower(stale).await;
    assert!(matches!(
        response.error,
        Some(BrokerError::StaleControllerEpoch(_))
    ));

    // the cluster keeps serving
    let leader = cluster.leader_id(&tp);
    let responses = cluster.produce(leader, "orders", 0, 5, -1).await;
    assert!(responses[&tp].error.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_topic_deletion_blocked_by_reassignment() {
    let mut cluster = TestCluster::start(&[1, 2, 3, 4, 5]).await;
    cluster
        .create_topic("orders", BTreeMap::from([(0, vec![1, 2, 3])]))
        .await;
    let tp = TopicPartition::new("orders", 0);
    let responses = cluster.produce(1, "orders", 0, 10, -1).await;
    assert!(responses[&tp].error.is_none());

    // broker 7 is registered but runs no replica manager yet, so a
    // reassignment targeting it cannot finish
    cluster
        .metastore
        .register_broker(7, "localhost".into(), 9007, None)
        .await
        .unwrap();
    // give the broker-change watch a moment to reach the coordinator
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let coordinator = cluster.await_active_coordinator().await;
    let results = coordinator
        .reassign_partitions(BTreeMap::from([(tp.clone(), vec![4, 5, 7])]))
        .await;
    assert!(results[&tp].is_none(), "{:?}", results[&tp]);

    // deletion queues behind the stuck reassignment
    cluster.metastore.request_topic_deletion("orders").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(
        cluster.metastore.all_topics().contains(&"orders".to_string()),
        "topic must survive while the reassignment is in flight"
    );
    assert_eq!(cluster.metastore.topics_marked_for_deletion(), vec!["orders"]);

    // broker 7 comes up for real; the reassignment completes and the
    // deletion resumes
    cluster.start_broker(7).await;

    wait_until("topic is finally removed", 10_000, || async {
        (!cluster.metastore.all_topics().contains(&"orders".to_string())
            && cluster.metastore.topics_marked_for_deletion().is_empty())
        .then_some(())
    })
    .await;
    for broker in [4, 5, 7] {
        let rm = cluster.replica_manager(broker).clone();
        wait_until("replica dropped after deletion", 5_000, || {
            let rm = rm.clone();
            let tp = tp.clone();
            async move { rm.hosted_partition(&tp).is_none().then_some(()) }
        })
        .await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_alter_partition_validation() {
    let cluster = TestCluster::start(&[1, 2]).await;
    cluster
        .create_topic("orders", BTreeMap::from([(0, vec![1, 2])]))
        .await;
    let tp = TopicPartition::new("orders", 0);
    let coordinator = cluster.await_active_coordinator().await;
    let broker_epoch = cluster.metastore.broker_epoch(1).unwrap();

    let current = cluster.metastore.leader_and_isr(&tp).unwrap();
    let propose = |leader_and_isr: LeaderAndIsr| AlterPartitionRequest {
        broker_id: 1,
        broker_epoch,
        partitions: vec![AlterPartitionItem {
            topic_partition: tp.clone(),
            leader_and_isr,
        }],
    };

    // a valid shrink commits and bumps the partition epoch
    let shrink = LeaderAndIsr {
        isr: vec![1],
        ..current.clone()
    };
    let response = coordinator.alter_partition(propose(shrink.clone())).await;
    let committed = response.partitions[&tp].as_ref().unwrap();
    assert_eq!(committed.isr, vec![1]);
    assert_eq!(committed.partition_epoch, current.partition_epoch + 1);

    // replaying the old partition epoch goes backwards
    let response = coordinator.alter_partition(propose(shrink)).await;
    assert!(matches!(
        response.partitions[&tp],
        Err(BrokerError::InvalidUpdateVersion(_))
    ));

    // a proposal ahead of the coordinator means the proposer talked to a
    // newer one
    let current = cluster.metastore.leader_and_isr(&tp).unwrap();
    let ahead = LeaderAndIsr {
        leader_epoch: current.leader_epoch + 5,
        ..current.clone()
    };
    let response = coordinator.alter_partition(propose(ahead)).await;
    assert!(matches!(
        response.partitions[&tp],
        Err(BrokerError::NotController(_))
    ));

    // an ISR containing an unknown broker is ineligible
    let bad_isr = LeaderAndIsr {
        isr: vec![1, 99],
        ..current.clone()
    };
    let response = coordinator.alter_partition(propose(bad_isr)).await;
    assert!(matches!(
        response.partitions[&tp],
        Err(BrokerError::IneligibleReplica(_))
    ));

    // a stale broker epoch is fenced outright
    let response = coordinator
        .alter_partition(AlterPartitionRequest {
            broker_id: 1,
            broker_epoch: broker_epoch - 1,
            partitions: Vec::new(),
        })
        .await;
    assert!(matches!(response.error, Some(BrokerError::StaleBrokerEpoch(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_controlled_shutdown_moves_leadership() {
    let cluster = TestCluster::start(&[1, 2, 3]).await;
    cluster
        .create_topic("orders", BTreeMap::from([(0, vec![1, 2, 3])]))
        .await;
    let tp = TopicPartition::new("orders", 0);
    // make sure the followers are in sync before draining broker 1
    let responses = cluster.produce(1, "orders", 0, 10, -1).await;
    assert!(responses[&tp].error.is_none());

    let coordinator = cluster.await_active_coordinator().await;
    let broker_epoch = cluster.metastore.broker_epoch(1).unwrap();
    let response = coordinator.controlled_shutdown(1, broker_epoch).await.unwrap();
    assert!(
        response.partitions_remaining.is_empty(),
        "leadership should have moved: {:?}",
        response.partitions_remaining
    );

    let leadership = cluster.metastore.leader_and_isr(&tp).unwrap();
    assert_ne!(leadership.leader, 1);
    assert!(!leadership.isr.contains(&1), "drained broker leaves the ISR");

    // a stale broker epoch cannot trigger a shutdown
    let err = coordinator.controlled_shutdown(1, broker_epoch - 1).await.unwrap_err();
    assert!(matches!(err, BrokerError::StaleBrokerEpoch(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_preferred_election_restores_drained_leader() {
    let cluster = TestCluster::start(&[1, 2, 3]).await;
    cluster
        .create_topic("orders", BTreeMap::from([(0, vec![1, 2, 3])]))
        .await;
    let tp = TopicPartition::new("orders", 0);
    let responses = cluster.produce(1, "orders", 0, 10, -1).await;
    assert!(responses[&tp].error.is_none());

    let coordinator = cluster.await_active_coordinator().await;

    // the preferred replica already leads, so there is nothing to elect
    let results = coordinator.elect_preferred_leaders(vec![tp.clone()]).await;
    assert!(matches!(
        &results[&tp],
        Err(BrokerError::ElectionNotNeeded(_))
    ));

    // drain broker 1, then bring it back
    let broker_epoch = cluster.metastore.broker_epoch(1).unwrap();
    coordinator.controlled_shutdown(1, broker_epoch).await.unwrap();
    assert_ne!(cluster.leader_id(&tp), 1);

    // while broker 1 is out of the ISR its preferred leadership is refused
    let results = coordinator.elect_preferred_leaders(vec![tp.clone()]).await;
    assert!(matches!(
        &results[&tp],
        Err(BrokerError::PreferredLeaderNotAvailable(_))
    ));

    // re-registering bounces the broker; it re-follows and rejoins the ISR
    cluster
        .metastore
        .register_broker(1, "localhost".into(), 9001, None)
        .await
        .unwrap();
    let metastore = cluster.metastore.clone();
    wait_until("broker 1 rejoins the isr", 5_000, || {
        let metastore = metastore.clone();
        let tp = tp.clone();
        async move {
            let lisr = metastore.leader_and_isr(&tp)?;
            lisr.isr.contains(&1).then_some(())
        }
    })
    .await;

    let results = coordinator.elect_preferred_leaders(vec![tp.clone()]).await;
    assert_eq!(*results[&tp].as_ref().unwrap(), 1);

    // the broker-side waiter sees the election land in the metadata store
    let rx = cluster
        .replica_manager(1)
        .await_elected_leaders(5_000, BTreeMap::from([(tp.clone(), 1)]))
        .await;
    let waited = rx.await.unwrap();
    assert!(waited[&tp].is_none());
}
