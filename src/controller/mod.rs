// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod batch;
mod context;
mod deletion;
mod election;
mod event;
mod partition_state_machine;
mod reassignment;
mod replica_state_machine;

pub use batch::{ControlBatcher, StopReplicaOutcome};
pub use context::{ControllerContext, PartitionReplica, PartitionState, ReplicaState};
pub use election::{ElectionError, ElectionResult};
pub use event::{
    ControlledShutdownResponse, CoordinatorEvent, ElectionTrigger,
};
pub use partition_state_machine::ElectionStrategy;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::message::{LeaderAndIsr, ReplicaAssignment, TopicPartition, NO_LEADER};
use crate::metastore::MetadataStore;
use crate::request::{
    AlterPartitionRequest, AlterPartitionResponse, ControlRpcSender,
    LeaderAndIsrPartitionState, UpdateMetadataPartitionState,
};
use crate::service::CoordinatorConfig;
use crate::{AppError, AppResult, BrokerError, Shutdown};

#[derive(Debug)]
struct CoordinatorShared {
    active: AtomicCell<bool>,
    epoch: AtomicCell<i32>,
}

/// Handle to the per-broker coordinator module. Every broker runs one; the
/// single one holding the metadata-store lease is active and drives the
/// cluster. All work funnels through a bounded event queue consumed by one
/// task.
#[derive(Debug)]
pub struct ClusterCoordinator {
    broker_id: i32,
    event_tx: mpsc::Sender<CoordinatorEvent>,
    shared: Arc<CoordinatorShared>,
    controlled_shutdown_timeout_ms: u64,
}

impl ClusterCoordinator {
    pub async fn start(
        broker_id: i32,
        config: CoordinatorConfig,
        metastore: Arc<dyn MetadataStore>,
        rpc: Arc<dyn ControlRpcSender>,
        notify_shutdown: tokio::sync::broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(config.event_queue_capacity.max(16));
        let shared = Arc::new(CoordinatorShared {
            active: AtomicCell::new(false),
            epoch: AtomicCell::new(-1),
        });

        let coordinator = Arc::new(ClusterCoordinator {
            broker_id,
            event_tx: event_tx.clone(),
            shared: shared.clone(),
            controlled_shutdown_timeout_ms: config.controlled_shutdown_timeout_ms,
        });

        let core = CoordinatorCore {
            broker_id,
            config: config.clone(),
            metastore: metastore.clone(),
            rpc,
            ctx: ControllerContext::default(),
            batcher: ControlBatcher::default(),
            active: false,
            epoch: -1,
            shared,
            _shutdown_complete_tx: shutdown_complete_tx,
        };
        let shutdown = Shutdown::new(notify_shutdown.subscribe());
        tokio::spawn(core.run(event_rx, shutdown));

        coordinator.spawn_watchers(metastore, notify_shutdown.clone());
        if config.auto_leader_rebalance_enable {
            coordinator.spawn_auto_rebalance_tick(
                config.leader_imbalance_check_interval_seconds,
                notify_shutdown,
            );
        }

        let _ = coordinator.event_tx.send(CoordinatorEvent::Startup).await;
        coordinator
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load()
    }

    pub fn coordinator_epoch(&self) -> i32 {
        self.shared.epoch.load()
    }

    pub async fn submit(&self, event: CoordinatorEvent) {
        if self.event_tx.send(event).await.is_err() {
            warn!("coordinator {} event queue is closed", self.broker_id);
        }
    }

    /// Broker-to-coordinator ISR update proposal.
    pub async fn alter_partition(&self, request: AlterPartitionRequest) -> AlterPartitionResponse {
        let (tx, rx) = oneshot::channel();
        self.submit(CoordinatorEvent::AlterPartition(request, tx)).await;
        rx.await.unwrap_or_else(|_| AlterPartitionResponse {
            error: Some(BrokerError::CoordinatorNotAvailable(
                "coordinator stopped".to_string(),
            )),
            partitions: Default::default(),
        })
    }

    /// Move leadership off `broker_id` ahead of its shutdown. Returns the
    /// partitions it still leads when the call completes; the wait is
    /// bounded by the configured controlled-shutdown timeout.
    pub async fn controlled_shutdown(
        &self,
        broker_id: i32,
        broker_epoch: i64,
    ) -> Result<ControlledShutdownResponse, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.submit(CoordinatorEvent::ControlledShutdown(broker_id, broker_epoch, tx))
            .await;
        let deadline = Duration::from_millis(self.controlled_shutdown_timeout_ms.max(1));
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::CoordinatorNotAvailable(
                "coordinator stopped".to_string(),
            )),
            Err(_) => Err(BrokerError::RequestTimedOut(format!(
                "controlled shutdown of broker {} did not finish in {}ms",
                broker_id, self.controlled_shutdown_timeout_ms
            ))),
        }
    }

    /// Admin-triggered preferred-replica election.
    pub async fn elect_preferred_leaders(
        &self,
        partitions: Vec<TopicPartition>,
    ) -> BTreeMap<TopicPartition, Result<i32, BrokerError>> {
        let (tx, rx) = oneshot::channel();
        self.submit(CoordinatorEvent::PreferredReplicaElection(
            partitions.clone(),
            ElectionTrigger::Admin,
            Some(tx),
        ))
        .await;
        rx.await.unwrap_or_else(|_| {
            partitions
                .into_iter()
                .map(|tp| {
                    (
                        tp,
                        Err(BrokerError::CoordinatorNotAvailable(
                            "coordinator stopped".to_string(),
                        )),
                    )
                })
                .collect()
        })
    }

    /// Admin-triggered reassignment; the callback fires when phase U has
    /// been recorded (completion is observed through the metadata store).
    pub async fn reassign_partitions(
        &self,
        reassignment: BTreeMap<TopicPartition, Vec<i32>>,
    ) -> BTreeMap<TopicPartition, Option<BrokerError>> {
        let (tx, rx) = oneshot::channel();
        self.submit(CoordinatorEvent::PartitionReassignment(
            reassignment.clone(),
            Some(tx),
        ))
        .await;
        rx.await.unwrap_or_else(|_| {
            reassignment
                .into_keys()
                .map(|tp| {
                    (
                        tp,
                        Some(BrokerError::CoordinatorNotAvailable(
                            "coordinator stopped".to_string(),
                        )),
                    )
                })
                .collect()
        })
    }

    /// Watch the metadata store and translate its signals into events.
    fn spawn_watchers(
        &self,
        metastore: Arc<dyn MetadataStore>,
        notify_shutdown: tokio::sync::broadcast::Sender<()>,
    ) {
        let watches: Vec<(tokio::sync::watch::Receiver<u64>, CoordinatorEventKind)> = vec![
            (metastore.watch_coordinator(), CoordinatorEventKind::Coordinator),
            (metastore.watch_brokers(), CoordinatorEventKind::Brokers),
            (metastore.watch_topics(), CoordinatorEventKind::Topics),
            (metastore.watch_topic_deletions(), CoordinatorEventKind::Deletions),
            (metastore.watch_isr_changes(), CoordinatorEventKind::IsrChanges),
            (
                metastore.watch_reassignment_triggers(),
                CoordinatorEventKind::Reassignments,
            ),
            (
                metastore.watch_preferred_election_triggers(),
                CoordinatorEventKind::PreferredElections,
            ),
            (metastore.watch_log_dir_failures(), CoordinatorEventKind::LogDirFailures),
        ];
        for (mut rx, kind) in watches {
            let event_tx = self.event_tx.clone();
            let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            if event_tx.send(kind.to_event()).await.is_err() {
                                break;
                            }
                        }
                        _ = shutdown.recv() => break,
                    }
                }
            });
        }
    }

    fn spawn_auto_rebalance_tick(
        &self,
        interval_seconds: u64,
        notify_shutdown: tokio::sync::broadcast::Sender<()>,
    ) {
        let event_tx = self.event_tx.clone();
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(interval_seconds.max(1)));
            tick.tick().await; // skip the immediate first fire
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if event_tx
                            .send(CoordinatorEvent::AutoPreferredReplicaElection)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }
}

#[derive(Debug, Clone, Copy)]
enum CoordinatorEventKind {
    Coordinator,
    Brokers,
    Topics,
    Deletions,
    IsrChanges,
    Reassignments,
    PreferredElections,
    LogDirFailures,
}

impl CoordinatorEventKind {
    fn to_event(self) -> CoordinatorEvent {
        match self {
            CoordinatorEventKind::Coordinator => CoordinatorEvent::CoordinatorChange,
            CoordinatorEventKind::Brokers => CoordinatorEvent::BrokerChange,
            CoordinatorEventKind::Topics => CoordinatorEvent::TopicChange,
            CoordinatorEventKind::Deletions => CoordinatorEvent::TopicDeletion,
            CoordinatorEventKind::IsrChanges => CoordinatorEvent::IsrChangeNotification,
            CoordinatorEventKind::Reassignments => CoordinatorEvent::ReassignmentTrigger,
            CoordinatorEventKind::PreferredElections => {
                CoordinatorEvent::PreferredElectionTrigger
            }
            CoordinatorEventKind::LogDirFailures => CoordinatorEvent::LogDirFailureNotification,
        }
    }
}

/// The single-task owner of all coordinator state.
pub(crate) struct CoordinatorCore {
    pub(crate) broker_id: i32,
    pub(crate) config: CoordinatorConfig,
    pub(crate) metastore: Arc<dyn MetadataStore>,
    pub(crate) rpc: Arc<dyn ControlRpcSender>,
    pub(crate) ctx: ControllerContext,
    pub(crate) batcher: ControlBatcher,
    pub(crate) active: bool,
    pub(crate) epoch: i32,
    shared: Arc<CoordinatorShared>,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl CoordinatorCore {
    async fn run(mut self, mut event_rx: mpsc::Receiver<CoordinatorEvent>, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    if matches!(event, CoordinatorEvent::Shutdown) {
                        self.resign().await;
                        break;
                    }
                    if let Err(e) = self.process(event).await {
                        match e {
                            AppError::CoordinatorMoved { observed_epoch } => {
                                info!(
                                    "coordinator {} observed epoch {} and resigns",
                                    self.broker_id, observed_epoch
                                );
                                self.resign().await;
                            }
                            AppError::IllegalState(msg) => {
                                // invariant violation: resign so a healthy
                                // coordinator can be elected
                                error!(
                                    "coordinator {} hit an illegal state: {}",
                                    self.broker_id, msg
                                );
                                self.resign().await;
                                let _ = self.metastore.resign_coordinator(self.broker_id).await;
                            }
                            other => {
                                warn!("coordinator {} event failed: {}", self.broker_id, other);
                            }
                        }
                    }
                    // resignation preempts everything already queued
                    if !self.active {
                        while let Ok(queued) = event_rx.try_recv() {
                            match queued {
                                CoordinatorEvent::Reelect
                                | CoordinatorEvent::CoordinatorChange
                                | CoordinatorEvent::Startup => {
                                    let _ = self.process(queued).await;
                                    if self.active {
                                        break;
                                    }
                                }
                                other => other.preempt(),
                            }
                        }
                    }
                }
                _ = shutdown.recv() => {
                    self.resign().await;
                    let _ = self.metastore.resign_coordinator(self.broker_id).await;
                    break;
                }
            }
        }
        info!("coordinator {} event loop stopped", self.broker_id);
    }

    async fn process(&mut self, event: CoordinatorEvent) -> AppResult<()> {
        match event {
            CoordinatorEvent::Startup | CoordinatorEvent::Reelect => self.elect().await,
            CoordinatorEvent::CoordinatorChange => self.on_coordinator_change().await,
            CoordinatorEvent::Expire => {
                self.resign().await;
                self.elect().await
            }
            event if !self.active => {
                event.preempt();
                Ok(())
            }
            CoordinatorEvent::BrokerChange => self.on_broker_change().await,
            CoordinatorEvent::BrokerModification(broker_id) => {
                self.on_broker_modification(broker_id).await
            }
            CoordinatorEvent::TopicChange => self.on_topic_change().await,
            CoordinatorEvent::TopicDeletion => self.on_topic_deletion_requested().await,
            CoordinatorEvent::PartitionReassignment(reassignment, callback) => {
                self.on_partition_reassignment_request(reassignment, callback)
                    .await
            }
            CoordinatorEvent::ReassignmentTrigger => {
                let pending = self.metastore.take_pending_reassignments();
                if pending.is_empty() {
                    return Ok(());
                }
                self.on_partition_reassignment_request(pending, None).await
            }
            CoordinatorEvent::PreferredElectionTrigger => {
                let pending = self.metastore.take_pending_preferred_elections();
                if pending.is_empty() {
                    return Ok(());
                }
                self.on_preferred_replica_election(
                    pending,
                    ElectionTrigger::MetadataStore,
                    None,
                )
                .await
            }
            CoordinatorEvent::IsrChangeNotification => self.on_isr_change_notification().await,
            CoordinatorEvent::PreferredReplicaElection(partitions, trigger, callback) => {
                self.on_preferred_replica_election(partitions, trigger, callback)
                    .await
            }
            CoordinatorEvent::ControlledShutdown(broker_id, broker_epoch, callback) => {
                self.on_controlled_shutdown(broker_id, broker_epoch, callback)
                    .await
            }
            CoordinatorEvent::AlterPartition(request, callback) => {
                self.on_alter_partition(request, callback).await
            }
            CoordinatorEvent::UpdateFeatures(level, callback) => {
                let result = self
                    .metastore
                    .set_feature_level(level, self.epoch)
                    .await
                    .map_err(|e| BrokerError::FeatureUpdateFailed(e.to_string()));
                let _ = callback.send(result);
                Ok(())
            }
            CoordinatorEvent::AllocateProducerIds(broker_id, broker_epoch, callback) => {
                let result = self
                    .metastore
                    .allocate_producer_id_block(broker_id, broker_epoch)
                    .await
                    .map_err(|e| BrokerError::StaleBrokerEpoch(e.to_string()));
                let _ = callback.send(result);
                Ok(())
            }
            CoordinatorEvent::LogDirFailureNotification => self.on_log_dir_failure().await,
            CoordinatorEvent::AutoPreferredReplicaElection => {
                self.check_preferred_replica_imbalance().await
            }
            CoordinatorEvent::Shutdown => Ok(()),
        }
    }

    /// Try to claim the lease; on success rebuild state from the store and
    /// push full metadata to the cluster.
    async fn elect(&mut self) -> AppResult<()> {
        if self.active {
            return Ok(());
        }
        match self.metastore.try_claim_coordinator_lease(self.broker_id).await? {
            Some(epoch) => {
                info!(
                    "broker {} is now the cluster coordinator at epoch {}",
                    self.broker_id, epoch
                );
                self.epoch = epoch;
                self.active = true;
                self.shared.epoch.store(epoch);
                self.shared.active.store(true);
                self.on_coordinator_failover().await
            }
            None => {
                self.shared.active.store(false);
                Ok(())
            }
        }
    }

    /// Rebuild the context, bring partitions online, resume interrupted
    /// reassignments and deletions, and fan out a full metadata refresh.
    async fn on_coordinator_failover(&mut self) -> AppResult<()> {
        self.ctx.clear();
        self.ctx.set_live_brokers(self.metastore.live_brokers());

        for topic in self.metastore.all_topics() {
            let Some(topic_id) = self.metastore.topic_id(&topic) else {
                continue;
            };
            self.ctx.add_topic(&topic, topic_id);
            let Some(assignment) = self.metastore.topic_assignment(&topic) else {
                continue;
            };
            for (partition, replica_assignment) in assignment {
                let tp = TopicPartition::new(topic.clone(), partition);
                if replica_assignment.is_being_reassigned() {
                    self.ctx.mark_reassigning(tp.clone());
                }
                self.ctx.set_partition_assignment(&tp, replica_assignment.clone());
                if let Some(leadership) = self.metastore.leader_and_isr(&tp) {
                    self.ctx.put_leadership(tp.clone(), leadership);
                }
                self.initialize_partition_states(&tp, &replica_assignment);
            }
        }
        for topic in self.metastore.topics_marked_for_deletion() {
            self.ctx.queue_topic_for_deletion(topic.clone());
            if self.ctx.is_topic_reassigning(&topic) {
                self.ctx.mark_topic_ineligible_for_deletion(topic);
            }
        }

        // elections for anything without a live leader, then a full push
        self.batcher.new_batch()?;
        let offline = self.ctx.partitions_in_state(PartitionState::Offline);
        let new = self.ctx.partitions_in_state(PartitionState::New);
        self.partition_state_transition(
            offline.into_iter().chain(new).collect(),
            PartitionState::Online,
            Some(ElectionStrategy::Offline {
                allow_unclean: false,
            }),
        )
        .await?;
        let all = self.ctx.all_partitions();
        self.add_update_metadata_to_batch(&all);
        self.flush_batch().await?;

        self.resume_reassignments().await?;
        self.resume_deletions().await?;
        Ok(())
    }

    /// Seed the state machines from the committed leadership: partitions
    /// with a live leader are Online, leaderless ones Offline, unled new
    /// ones New.
    fn initialize_partition_states(
        &mut self,
        tp: &TopicPartition,
        assignment: &ReplicaAssignment,
    ) {
        let state = match self.ctx.leadership(tp) {
            Some(leadership)
                if leadership.leader != NO_LEADER
                    && self.ctx.is_broker_live(leadership.leader) =>
            {
                PartitionState::Online
            }
            Some(_) => PartitionState::Offline,
            None => PartitionState::New,
        };
        self.ctx.put_partition_state(tp.clone(), state);
        for replica in &assignment.replicas {
            let state = if self.ctx.is_broker_live(*replica) {
                ReplicaState::Online
            } else {
                ReplicaState::Offline
            };
            self.ctx
                .put_replica_state(PartitionReplica::new(tp.clone(), *replica), state);
        }
    }

    async fn resign(&mut self) {
        if !self.active {
            return;
        }
        info!("broker {} resigning as cluster coordinator", self.broker_id);
        self.active = false;
        self.shared.active.store(false);
        self.ctx.clear();
        self.batcher = ControlBatcher::default();
    }

    async fn on_coordinator_change(&mut self) -> AppResult<()> {
        match self.metastore.coordinator() {
            Some((owner, epoch)) => {
                if owner != self.broker_id && self.active {
                    info!(
                        "broker {} sees coordinator {} at epoch {}, resigning",
                        self.broker_id, owner, epoch
                    );
                    self.resign().await;
                }
                Ok(())
            }
            // lease is gone: stand for election
            None => {
                if self.active {
                    self.resign().await;
                }
                self.elect().await
            }
        }
    }

    async fn on_broker_change(&mut self) -> AppResult<()> {
        let current = self.metastore.live_brokers();
        let current_ids: std::collections::HashSet<i32> =
            current.iter().map(|b| b.id).collect();
        let known = self.ctx.live_broker_ids();
        let added: Vec<i32> = current_ids.difference(&known).copied().collect();
        let removed: Vec<i32> = known.difference(&current_ids).copied().collect();
        // a bumped broker epoch means the broker bounced while we were not
        // looking: process it as a failure followed by a startup
        let bounced: Vec<i32> = current
            .iter()
            .filter(|b| {
                self.ctx
                    .broker_epoch(b.id)
                    .map(|known_epoch| known_epoch != b.epoch)
                    .unwrap_or(false)
            })
            .map(|b| b.id)
            .collect();
        self.ctx.set_live_brokers(current);
        if added.is_empty() && removed.is_empty() && bounced.is_empty() {
            return Ok(());
        }
        info!(
            "coordinator {} broker change: added {:?}, removed {:?}, bounced {:?}",
            self.broker_id, added, removed, bounced
        );

        self.batcher.new_batch()?;
        for broker in &bounced {
            self.on_broker_failure(*broker).await?;
        }
        for broker in added.iter().chain(bounced.iter()) {
            self.ctx.clear_shutting_down(*broker);
            self.on_broker_startup(*broker).await?;
        }
        for broker in &removed {
            self.on_broker_failure(*broker).await?;
        }
        let all = self.ctx.all_partitions();
        self.add_update_metadata_to_batch(&all);
        self.flush_batch().await?;
        // a returning broker may unblock a stuck deletion
        self.resume_deletions().await?;
        Ok(())
    }

    async fn on_broker_startup(&mut self, broker_id: i32) -> AppResult<()> {
        let replicas: Vec<PartitionReplica> = self
            .ctx
            .replicas_on_broker(broker_id)
            .into_iter()
            .map(|tp| PartitionReplica::new(tp, broker_id))
            .collect();
        self.replica_state_transition(replicas.clone(), ReplicaState::Online)
            .await?;
        // resend leadership so the broker rebuilds its replicas
        for replica in &replicas {
            let tp = replica.topic_partition.clone();
            if self.ctx.leadership(&tp).is_some() {
                self.add_leader_and_isr_to_batch(&tp, &[broker_id], false);
            }
        }
        let offline = self.ctx.partitions_in_state(PartitionState::Offline);
        self.partition_state_transition(
            offline,
            PartitionState::Online,
            Some(ElectionStrategy::Offline {
                allow_unclean: false,
            }),
        )
        .await?;
        Ok(())
    }

    async fn on_broker_failure(&mut self, broker_id: i32) -> AppResult<()> {
        self.ctx.clear_shutting_down(broker_id);
        let replicas: Vec<PartitionReplica> = self
            .ctx
            .replicas_on_broker(broker_id)
            .into_iter()
            .map(|tp| PartitionReplica::new(tp, broker_id))
            .collect();

        // partitions led by the failed broker go offline, then re-elect
        let led: Vec<TopicPartition> = self.ctx.partitions_led_by(broker_id);
        self.partition_state_transition(led.clone(), PartitionState::Offline, None)
            .await?;
        self.partition_state_transition(
            led,
            PartitionState::Online,
            Some(ElectionStrategy::Offline {
                allow_unclean: self.config.unclean_leader_election_enable,
            }),
        )
        .await?;
        self.replica_state_transition(replicas, ReplicaState::Offline)
            .await?;
        Ok(())
    }

    async fn on_broker_modification(&mut self, broker_id: i32) -> AppResult<()> {
        if let Some(registration) = self
            .metastore
            .live_brokers()
            .into_iter()
            .find(|b| b.id == broker_id)
        {
            self.ctx.add_live_broker(registration);
            self.batcher.new_batch()?;
            let all = self.ctx.all_partitions();
            self.add_update_metadata_to_batch(&all);
            self.flush_batch().await?;
        }
        Ok(())
    }

    /// New topics or new partitions of known topics appeared in the store.
    async fn on_topic_change(&mut self) -> AppResult<()> {
        let mut created: Vec<(TopicPartition, ReplicaAssignment)> = Vec::new();
        for topic in self.metastore.all_topics() {
            let Some(assignment) = self.metastore.topic_assignment(&topic) else {
                continue;
            };
            if !self.ctx.all_topics().contains(&topic) {
                let Some(topic_id) = self.metastore.topic_id(&topic) else {
                    continue;
                };
                self.ctx.add_topic(&topic, topic_id);
            }
            for (partition, replica_assignment) in assignment {
                let tp = TopicPartition::new(topic.clone(), partition);
                if self.ctx.partition_assignment(&tp).is_none() {
                    self.ctx.set_partition_assignment(&tp, replica_assignment.clone());
                    created.push((tp, replica_assignment));
                }
            }
        }
        if created.is_empty() {
            return Ok(());
        }
        info!(
            "coordinator {} sees {} new partitions",
            self.broker_id,
            created.len()
        );

        let mut new_partitions = Vec::new();
        for (tp, assignment) in created {
            self.ctx.put_partition_state(tp.clone(), PartitionState::New);
            for replica in &assignment.replicas {
                self.ctx.put_replica_state(
                    PartitionReplica::new(tp.clone(), *replica),
                    if self.ctx.is_broker_live(*replica) {
                        ReplicaState::New
                    } else {
                        ReplicaState::Offline
                    },
                );
            }
            new_partitions.push(tp);
        }
        self.batcher.new_batch()?;
        self.partition_state_transition(new_partitions.clone(), PartitionState::Online, None)
            .await?;
        let replicas: Vec<PartitionReplica> = new_partitions
            .iter()
            .flat_map(|tp| {
                self.ctx
                    .partition_replicas(tp)
                    .into_iter()
                    .map(|r| PartitionReplica::new(tp.clone(), r))
            })
            .collect();
        self.replica_state_transition(replicas, ReplicaState::Online)
            .await?;
        self.add_update_metadata_to_batch(&new_partitions);
        self.flush_batch().await?;
        Ok(())
    }

    /// A leader committed an ISR change through the store: refresh the cache,
    /// re-check reassignments that may have reached their target set, and
    /// spread the update.
    async fn on_isr_change_notification(&mut self) -> AppResult<()> {
        let changed = self.metastore.drain_isr_change_notifications();
        if changed.is_empty() {
            return Ok(());
        }
        for tp in &changed {
            if let Some(leadership) = self.metastore.leader_and_isr(tp) {
                self.ctx.put_leadership(tp.clone(), leadership);
            }
        }
        self.batcher.new_batch()?;
        self.add_update_metadata_to_batch(&changed);
        self.flush_batch().await?;

        for tp in changed {
            if self.ctx.is_reassigning(&tp) {
                self.maybe_complete_reassignment(&tp).await?;
            }
        }
        self.resume_deletions().await?;
        Ok(())
    }

    async fn on_log_dir_failure(&mut self) -> AppResult<()> {
        let brokers = self.metastore.drain_log_dir_failure_notifications();
        if brokers.is_empty() {
            return Ok(());
        }
        info!(
            "coordinator {} handling log dir failures on brokers {:?}",
            self.broker_id, brokers
        );
        self.batcher.new_batch()?;
        for broker_id in brokers {
            // leadership moves off the broker; its replicas stay assigned
            // and recover when the directory is restored. The broker is
            // still registered, so it must leave each ISR before the
            // election runs or it would simply win again.
            let led = self.ctx.partitions_led_by(broker_id);
            let replicas: Vec<PartitionReplica> = self
                .ctx
                .replicas_on_broker(broker_id)
                .into_iter()
                .map(|tp| PartitionReplica::new(tp, broker_id))
                .collect();
            self.replica_state_transition(replicas, ReplicaState::Offline)
                .await?;
            self.partition_state_transition(led.clone(), PartitionState::Offline, None)
                .await?;
            self.partition_state_transition(
                led,
                PartitionState::Online,
                Some(ElectionStrategy::Offline {
                    allow_unclean: false,
                }),
            )
            .await?;
        }
        let all = self.ctx.all_partitions();
        self.add_update_metadata_to_batch(&all);
        self.flush_batch().await?;
        Ok(())
    }

    async fn on_preferred_replica_election(
        &mut self,
        partitions: Vec<TopicPartition>,
        trigger: ElectionTrigger,
        callback: Option<event::ElectionCallback>,
    ) -> AppResult<()> {
        let mut results: BTreeMap<TopicPartition, Result<i32, BrokerError>> = BTreeMap::new();
        self.batcher.new_batch()?;
        let mut elected = Vec::new();
        for tp in partitions {
            if self.ctx.is_reassigning(&tp) || self.ctx.is_topic_queued_for_deletion(tp.topic())
            {
                results.insert(
                    tp,
                    Err(BrokerError::InvalidRequest(
                        "partition is being reassigned or deleted".to_string(),
                    )),
                );
                continue;
            }
            match self
                .elect_partition_leader(&tp, ElectionStrategy::Preferred)
                .await
            {
                Ok(leadership) => {
                    elected.push(tp.clone());
                    results.insert(tp, Ok(leadership.leader));
                }
                Err(e) => {
                    if trigger != ElectionTrigger::Auto {
                        warn!("preferred election failed for {}: {}", tp, e);
                    }
                    results.insert(tp, Err(e));
                }
            }
        }
        self.add_update_metadata_to_batch(&elected);
        self.flush_batch().await?;
        if let Some(callback) = callback {
            let _ = callback.send(results);
        }
        Ok(())
    }

    /// Auto-rebalance tick: per broker, trigger a preferred election when
    /// the imbalance ratio passes the configured threshold.
    async fn check_preferred_replica_imbalance(&mut self) -> AppResult<()> {
        let imbalance = self.ctx.preferred_replica_imbalance();
        let mut to_elect = Vec::new();
        for (broker, partitions) in imbalance {
            if !self.ctx.is_broker_live(broker) {
                continue;
            }
            let total = self.ctx.preferred_partition_count(broker);
            if total == 0 {
                continue;
            }
            let ratio = partitions.len() as f64 / total as f64;
            if ratio > self.config.leader_imbalance_per_broker_percentage {
                info!(
                    "broker {} imbalance ratio {:.2} exceeds threshold, rebalancing {} partitions",
                    broker,
                    ratio,
                    partitions.len()
                );
                to_elect.extend(partitions);
            }
        }
        if to_elect.is_empty() {
            return Ok(());
        }
        self.on_preferred_replica_election(to_elect, ElectionTrigger::Auto, None)
            .await
    }

    async fn on_controlled_shutdown(
        &mut self,
        broker_id: i32,
        broker_epoch: i64,
        callback: event::ControlledShutdownCallback,
    ) -> AppResult<()> {
        if let Some(current_epoch) = self.ctx.broker_epoch(broker_id) {
            if broker_epoch < current_epoch {
                let _ = callback.send(Err(BrokerError::StaleBrokerEpoch(format!(
                    "broker epoch {} < {}",
                    broker_epoch, current_epoch
                ))));
                return Ok(());
            }
        } else {
            let _ = callback.send(Err(BrokerError::BrokerNotAvailable(
                broker_id.to_string(),
            )));
            return Ok(());
        }

        info!("coordinator handling controlled shutdown of broker {}", broker_id);
        self.ctx.mark_shutting_down(broker_id);
        self.batcher.new_batch()?;

        let led = self.ctx.partitions_led_by(broker_id);
        let mut moved = Vec::new();
        for tp in led {
            if self
                .ctx
                .leadership(&tp)
                .map(|l| l.isr.len() > 1)
                .unwrap_or(false)
            {
                match self
                    .elect_partition_leader(&tp, ElectionStrategy::ControlledShutdown)
                    .await
                {
                    Ok(_) => moved.push(tp),
                    Err(e) => warn!("controlled shutdown election failed for {}: {}", tp, e),
                }
            }
        }
        // every replica on the draining broker stops, except partitions it
        // still leads (a sole-ISR leader keeps serving and is reported back
        // in the remaining ledger)
        for tp in self.ctx.replicas_on_broker(broker_id) {
            let Some(leadership) = self.ctx.leadership(&tp) else {
                continue;
            };
            if leadership.leader == broker_id {
                continue;
            }
            let epoch = leadership.leader_epoch;
            self.batcher
                .add_stop_replica(&[broker_id], tp, epoch, false);
        }
        self.add_update_metadata_to_batch(&moved);
        self.flush_batch().await?;

        let remaining = self.ctx.partitions_led_by(broker_id);
        let _ = callback.send(Ok(ControlledShutdownResponse {
            partitions_remaining: remaining,
        }));
        Ok(())
    }

    /// AlterPartition validation ladder, then commit and fan out.
    async fn on_alter_partition(
        &mut self,
        request: AlterPartitionRequest,
        callback: event::AlterPartitionCallback,
    ) -> AppResult<()> {
        let mut response = AlterPartitionResponse::default();

        let broker_epoch_ok = self
            .ctx
            .broker_epoch(request.broker_id)
            .map(|e| request.broker_epoch >= e)
            .unwrap_or(false);
        if !broker_epoch_ok {
            response.error = Some(BrokerError::StaleBrokerEpoch(format!(
                "broker {} epoch {}",
                request.broker_id, request.broker_epoch
            )));
            let _ = callback.send(response);
            return Ok(());
        }

        let mut committed_partitions = Vec::new();
        for item in request.partitions {
            let tp = item.topic_partition;
            let proposed = item.leader_and_isr;
            let Some(current) = self.ctx.leadership(&tp).cloned() else {
                response.partitions.insert(
                    tp,
                    Err(BrokerError::UnknownTopicOrPartition(String::new())),
                );
                continue;
            };

            let verdict = if proposed.leader_epoch > current.leader_epoch
                || proposed.partition_epoch > current.partition_epoch
            {
                // the proposer knows something newer than this coordinator
                Some(BrokerError::NotController(format!(
                    "{} proposal is ahead of the coordinator", tp
                )))
            } else if proposed.leader_epoch < current.leader_epoch {
                Some(BrokerError::FencedLeaderEpoch(format!(
                    "proposal epoch {} < {}",
                    proposed.leader_epoch, current.leader_epoch
                )))
            } else if proposed.partition_epoch < current.partition_epoch {
                Some(BrokerError::InvalidUpdateVersion(format!(
                    "proposal partition epoch {} < {}",
                    proposed.partition_epoch, current.partition_epoch
                )))
            } else if proposed.leader_recovery_state
                == crate::message::LeaderRecoveryState::Recovering
                && proposed.isr.len() > 1
            {
                Some(BrokerError::InvalidRequest(
                    "a recovering leader cannot expand the ISR".to_string(),
                ))
            } else if proposed
                .isr
                .iter()
                .any(|r| !self.ctx.is_broker_live(*r) || self.ctx.shutting_down_brokers().contains(r))
            {
                Some(BrokerError::IneligibleReplica(format!(
                    "proposed isr {:?} contains an ineligible replica",
                    proposed.isr
                )))
            } else {
                None
            };
            if let Some(error) = verdict {
                response.partitions.insert(tp, Err(error));
                continue;
            }

            match self
                .metastore
                .set_leader_and_isr(&tp, proposed, current.partition_epoch, self.epoch)
                .await
            {
                Ok(committed) => {
                    self.ctx.put_leadership(tp.clone(), committed.clone());
                    committed_partitions.push(tp.clone());
                    response.partitions.insert(tp, Ok(committed));
                }
                Err(AppError::CoordinatorMoved { observed_epoch }) => {
                    let _ = callback.send(AlterPartitionResponse {
                        error: Some(BrokerError::NotController(String::new())),
                        partitions: Default::default(),
                    });
                    return Err(AppError::CoordinatorMoved { observed_epoch });
                }
                Err(e) => {
                    response
                        .partitions
                        .insert(tp, Err(BrokerError::InvalidUpdateVersion(e.to_string())));
                }
            }
        }

        if !committed_partitions.is_empty() {
            self.batcher.new_batch()?;
            self.add_update_metadata_to_batch(&committed_partitions);
            self.flush_batch().await?;
        }
        let _ = callback.send(response);
        Ok(())
    }

    // ---- shared helpers ----

    pub(crate) fn leadership_or_err(&self, tp: &TopicPartition) -> AppResult<LeaderAndIsr> {
        self.ctx
            .leadership(tp)
            .cloned()
            .ok_or_else(|| AppError::IllegalState(format!("{} has no leadership info", tp)))
    }

    /// CAS-write a leadership change keyed by the context's partition epoch,
    /// then cache the committed snapshot.
    pub(crate) async fn commit_leadership(
        &mut self,
        tp: &TopicPartition,
        new: LeaderAndIsr,
    ) -> AppResult<LeaderAndIsr> {
        let expected = self
            .ctx
            .leadership(tp)
            .map(|l| l.partition_epoch)
            .unwrap_or(-1);
        let committed = self
            .metastore
            .set_leader_and_isr(tp, new, expected, self.epoch)
            .await?;
        self.ctx.put_leadership(tp.clone(), committed.clone());
        Ok(committed)
    }

    /// Queue a LeaderAndIsr for `send_to`, built from the context's current
    /// leadership and assignment.
    pub(crate) fn add_leader_and_isr_to_batch(
        &mut self,
        tp: &TopicPartition,
        send_to: &[i32],
        is_new: bool,
    ) {
        let Some(leadership) = self.ctx.leadership(tp) else {
            return;
        };
        let Some(assignment) = self.ctx.partition_assignment(tp) else {
            return;
        };
        let state = LeaderAndIsrPartitionState {
            topic_partition: tp.clone(),
            leader: leadership.leader,
            leader_epoch: leadership.leader_epoch,
            isr: leadership.isr.clone(),
            partition_epoch: leadership.partition_epoch,
            replicas: assignment.replicas.clone(),
            adding_replicas: assignment.adding_replicas.clone(),
            removing_replicas: assignment.removing_replicas.clone(),
            is_new,
            leader_recovery_state: leadership.leader_recovery_state,
        };
        self.batcher.add_leader_and_isr(send_to, state);
    }

    pub(crate) fn add_update_metadata_to_batch(&mut self, partitions: &[TopicPartition]) {
        let live: Vec<i32> = self.ctx.live_broker_ids().into_iter().collect();
        for tp in partitions {
            let Some(leadership) = self.ctx.leadership(tp) else {
                continue;
            };
            let assignment = self.ctx.partition_replicas(tp);
            let offline: Vec<i32> = assignment
                .iter()
                .filter(|r| !self.ctx.is_broker_live(**r))
                .copied()
                .collect();
            let state = UpdateMetadataPartitionState {
                topic_partition: tp.clone(),
                leader: leadership.leader,
                leader_epoch: leadership.leader_epoch,
                isr: leadership.isr.clone(),
                partition_epoch: leadership.partition_epoch,
                replicas: assignment,
                offline_replicas: offline,
            };
            self.batcher.add_update_metadata(&live, state);
        }
    }

    pub(crate) async fn flush_batch(&mut self) -> AppResult<Vec<StopReplicaOutcome>> {
        let outcomes = self
            .batcher
            .send_batch(
                self.broker_id,
                self.epoch,
                &self.ctx.live_brokers(),
                &self.ctx.topic_ids().clone(),
                &self.rpc,
            )
            .await;
        self.apply_stop_replica_outcomes(&outcomes);
        Ok(outcomes)
    }

    /// StopReplica results advance the replica-deletion machine.
    fn apply_stop_replica_outcomes(&mut self, outcomes: &[StopReplicaOutcome]) {
        for outcome in outcomes {
            if !outcome.deleted {
                continue;
            }
            let replica = PartitionReplica::new(
                outcome.topic_partition.clone(),
                outcome.broker_id,
            );
            if self.ctx.replica_state(&replica) != ReplicaState::ReplicaDeletionStarted {
                continue;
            }
            let next = if outcome.error.is_none() {
                ReplicaState::ReplicaDeletionSuccessful
            } else {
                ReplicaState::ReplicaDeletionIneligible
            };
            if next == ReplicaState::ReplicaDeletionIneligible {
                self.ctx
                    .mark_topic_ineligible_for_deletion(replica.topic_partition.topic().to_string());
            }
            self.ctx.put_replica_state(replica, next);
        }
    }

    /// Run one election for `tp` and push the result to its replicas.
    pub(crate) async fn elect_partition_leader(
        &mut self,
        tp: &TopicPartition,
        strategy: ElectionStrategy,
    ) -> Result<LeaderAndIsr, BrokerError> {
        let results = self
            .partition_state_transition(vec![tp.clone()], PartitionState::Online, Some(strategy))
            .await
            .map_err(|e| BrokerError::UnknownServerError(e.to_string()))?;
        match results.get(tp) {
            Some(Ok(leadership)) => Ok(leadership.clone()),
            Some(Err(e)) => Err(e.clone()),
            None => Err(BrokerError::UnknownTopicOrPartition(tp.to_string())),
        }
    }
}
