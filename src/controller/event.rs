use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use tokio::sync::oneshot;

use crate::message::TopicPartition;
use crate::metastore::ProducerIdBlock;
use crate::request::{AlterPartitionRequest, AlterPartitionResponse};
use crate::BrokerError;

pub type AlterPartitionCallback = oneshot::Sender<AlterPartitionResponse>;
pub type ControlledShutdownCallback =
    oneshot::Sender<Result<ControlledShutdownResponse, BrokerError>>;
pub type ElectionCallback =
    oneshot::Sender<BTreeMap<TopicPartition, Result<i32, BrokerError>>>;
pub type ReassignmentCallback =
    oneshot::Sender<BTreeMap<TopicPartition, Option<BrokerError>>>;
pub type FeatureUpdateCallback = oneshot::Sender<Result<(), BrokerError>>;
pub type ProducerIdCallback = oneshot::Sender<Result<ProducerIdBlock, BrokerError>>;

/// What is left for the shutting-down broker to drain: partitions for which
/// it is still the leader when the controlled shutdown returns.
#[derive(Debug, Clone)]
pub struct ControlledShutdownResponse {
    pub partitions_remaining: Vec<TopicPartition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionTrigger {
    Auto,
    Admin,
    MetadataStore,
}

/// Everything the coordinator reacts to, processed strictly serially by the
/// single event task.
#[derive(Debug)]
pub enum CoordinatorEvent {
    Startup,
    /// The coordinator lease changed hands (watch fired).
    CoordinatorChange,
    /// Try to claim the lease again.
    Reelect,
    /// Session to the metadata store expired: resign, then re-elect.
    Expire,
    BrokerChange,
    BrokerModification(i32),
    TopicChange,
    TopicDeletion,
    PartitionReassignment(
        BTreeMap<TopicPartition, Vec<i32>>,
        Option<ReassignmentCallback>,
    ),
    /// The store has pending admin reassignments; only the active
    /// coordinator may drain them.
    ReassignmentTrigger,
    /// The store has pending admin preferred elections.
    PreferredElectionTrigger,
    IsrChangeNotification,
    PreferredReplicaElection(
        Vec<TopicPartition>,
        ElectionTrigger,
        Option<ElectionCallback>,
    ),
    ControlledShutdown(i32, i64, ControlledShutdownCallback),
    AlterPartition(AlterPartitionRequest, AlterPartitionCallback),
    UpdateFeatures(i16, FeatureUpdateCallback),
    AllocateProducerIds(i32, i64, ProducerIdCallback),
    LogDirFailureNotification,
    AutoPreferredReplicaElection,
    Shutdown,
}

impl CoordinatorEvent {
    /// Answer the event's caller with NotController without processing it.
    /// Invoked for every queued event when the coordinator resigns.
    pub fn preempt(self) {
        let not_controller =
            || BrokerError::NotController("coordinator is resigning".to_string());
        match self {
            CoordinatorEvent::PartitionReassignment(partitions, Some(callback)) => {
                let results = partitions
                    .into_keys()
                    .map(|tp| (tp, Some(not_controller())))
                    .collect();
                let _ = callback.send(results);
            }
            CoordinatorEvent::PreferredReplicaElection(partitions, _, Some(callback)) => {
                let results = partitions
                    .into_iter()
                    .map(|tp| (tp, Err(not_controller())))
                    .collect();
                let _ = callback.send(results);
            }
            CoordinatorEvent::ControlledShutdown(_, _, callback) => {
                let _ = callback.send(Err(not_controller()));
            }
            CoordinatorEvent::AlterPartition(_, callback) => {
                let _ = callback.send(AlterPartitionResponse {
                    error: Some(not_controller()),
                    partitions: Default::default(),
                });
            }
            CoordinatorEvent::UpdateFeatures(_, callback) => {
                let _ = callback.send(Err(not_controller()));
            }
            CoordinatorEvent::AllocateProducerIds(_, _, callback) => {
                let _ = callback.send(Err(not_controller()));
            }
            _ => {}
        }
    }
}

impl Display for CoordinatorEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CoordinatorEvent::Startup => "Startup",
            CoordinatorEvent::CoordinatorChange => "CoordinatorChange",
            CoordinatorEvent::Reelect => "Reelect",
            CoordinatorEvent::Expire => "Expire",
            CoordinatorEvent::BrokerChange => "BrokerChange",
            CoordinatorEvent::BrokerModification(_) => "BrokerModification",
            CoordinatorEvent::TopicChange => "TopicChange",
            CoordinatorEvent::TopicDeletion => "TopicDeletion",
            CoordinatorEvent::PartitionReassignment(..) => "PartitionReassignment",
            CoordinatorEvent::ReassignmentTrigger => "ReassignmentTrigger",
            CoordinatorEvent::PreferredElectionTrigger => "PreferredElectionTrigger",
            CoordinatorEvent::IsrChangeNotification => "IsrChangeNotification",
            CoordinatorEvent::PreferredReplicaElection(..) => "PreferredReplicaElection",
            CoordinatorEvent::ControlledShutdown(..) => "ControlledShutdown",
            CoordinatorEvent::AlterPartition(..) => "AlterPartition",
            CoordinatorEvent::UpdateFeatures(..) => "UpdateFeatures",
            CoordinatorEvent::AllocateProducerIds(..) => "AllocateProducerIds",
            CoordinatorEvent::LogDirFailureNotification => "LogDirFailureNotification",
            CoordinatorEvent::AutoPreferredReplicaElection => "AutoPreferredReplicaElection",
            CoordinatorEvent::Shutdown => "Shutdown",
        };
        write!(f, "{}", name)
    }
}
