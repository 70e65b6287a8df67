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

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::log::{EpochEndOffset, Log, LogAppendInfo, UNKNOWN_OFFSET};
use crate::message::{LeaderAndIsr, MemoryRecords, ReplicaAssignment, TopicPartition};
use crate::metastore::MetadataStore;
use crate::request::{
    FetchIsolation, FetchParams, FetchPartitionData, FetchPartitionResult,
    LeaderAndIsrPartitionState,
};
use crate::{AppError, AppResult, BrokerError, BrokerResult};

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// Whether an operation moved the partition's high watermark. Drives which
/// purgatories the replica manager nudges afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwChange {
    Increased,
    Same,
    None,
}

/// The leader's view of one follower, fed by that follower's fetches.
#[derive(Debug, Clone)]
pub struct FollowerState {
    pub log_end_offset: i64,
    pub log_start_offset: i64,
    pub last_caught_up_time_ms: i64,
    pub last_fetch_time_ms: i64,
}

impl FollowerState {
    fn unknown() -> Self {
        Self {
            log_end_offset: UNKNOWN_OFFSET,
            log_start_offset: UNKNOWN_OFFSET,
            last_caught_up_time_ms: 0,
            last_fetch_time_ms: 0,
        }
    }
}

#[derive(Debug)]
struct PartitionState {
    role: Option<Role>,
    leader_id: Option<i32>,
    leader_epoch: i32,
    leader_epoch_start_offset: Option<i64>,
    partition_epoch: i32,
    assignment: ReplicaAssignment,
    isr: BTreeSet<i32>,
    follower_states: HashMap<i32, FollowerState>,
}

impl PartitionState {
    fn empty() -> Self {
        Self {
            role: None,
            leader_id: None,
            leader_epoch: -1,
            leader_epoch_start_offset: None,
            partition_epoch: -1,
            assignment: ReplicaAssignment::default(),
            isr: BTreeSet::new(),
            follower_states: HashMap::new(),
        }
    }
}

/// Result of a leader-side append, bundled with the HW movement so the
/// caller can schedule purgatory checks.
#[derive(Debug)]
pub struct PartitionAppendInfo {
    pub info: LogAppendInfo,
    pub log_start_offset: i64,
    pub hw_change: HwChange,
}

/// Single-partition concurrency unit. All mutations are serialized by the
/// internal state lock; the high watermark is published through an atomic
/// so the hot read path never takes the lock. A second, future log exists
/// while the replica migrates between directories on this broker; it is
/// promoted to current once it has caught up.
#[derive(Debug)]
pub struct Partition {
    topic_partition: TopicPartition,
    local_broker_id: i32,
    topic_id: AtomicCell<Option<Uuid>>,
    log: SyncRwLock<Arc<dyn Log>>,
    future_log: SyncRwLock<Option<Arc<dyn Log>>>,
    high_watermark: AtomicCell<i64>,
    state: RwLock<PartitionState>,
    metastore: Arc<dyn MetadataStore>,
    replica_lag_time_max_ms: i64,
    min_insync_replicas: usize,
}

impl Partition {
    pub fn new(
        topic_partition: TopicPartition,
        local_broker_id: i32,
        log: Arc<dyn Log>,
        metastore: Arc<dyn MetadataStore>,
        replica_lag_time_max_ms: i64,
        min_insync_replicas: usize,
    ) -> Self {
        Self {
            topic_partition,
            local_broker_id,
            topic_id: AtomicCell::new(None),
            log: SyncRwLock::new(log),
            future_log: SyncRwLock::new(None),
            high_watermark: AtomicCell::new(0),
            state: RwLock::new(PartitionState::empty()),
            metastore,
            replica_lag_time_max_ms,
            min_insync_replicas,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn topic_id(&self) -> Option<Uuid> {
        self.topic_id.load()
    }

    pub fn current_log(&self) -> Arc<dyn Log> {
        self.log.read().clone()
    }

    pub fn log_dir(&self) -> String {
        self.log.read().dir().to_string()
    }

    pub fn high_watermark(&self) -> i64 {
        self.high_watermark.load()
    }

    pub fn log_end_offset(&self) -> i64 {
        self.log.read().log_end_offset()
    }

    pub fn log_start_offset(&self) -> i64 {
        self.log.read().log_start_offset()
    }

    // ---- future log (directory migration) ----

    pub fn create_future_log(&self, future: Arc<dyn Log>) {
        *self.future_log.write() = Some(future);
    }

    pub fn has_future_log(&self) -> bool {
        self.future_log.read().is_some()
    }

    pub fn future_log_end_offset(&self) -> Option<i64> {
        self.future_log.read().as_ref().map(|l| l.log_end_offset())
    }

    /// Append records replicated from the current log into the future log.
    pub async fn append_records_to_future(&self, records: MemoryRecords) -> AppResult<()> {
        let state = self.state.read().await;
        let Some(future) = self.future_log.read().clone() else {
            return Err(AppError::IllegalState(format!(
                "{} has no future log",
                self.topic_partition
            )));
        };
        if !records.is_empty() {
            future.append_records(records, state.leader_epoch).await?;
        }
        Ok(())
    }

    /// Swap the future log in once it has caught up to the current log.
    /// Serialized against appends by the state write lock. Returns true on
    /// promotion.
    pub async fn maybe_replace_current_with_future(&self) -> bool {
        let _state = self.state.write().await;
        let caught_up = {
            let future = self.future_log.read();
            match future.as_ref() {
                Some(f) => f.log_end_offset() >= self.log.read().log_end_offset(),
                None => return false,
            }
        };
        if !caught_up {
            return false;
        }
        let Some(future) = self.future_log.write().take() else {
            return false;
        };
        info!(
            "{} promoted future log in {}",
            self.topic_partition,
            future.dir()
        );
        *self.log.write() = future;
        true
    }

    pub async fn leader_epoch(&self) -> i32 {
        self.state.read().await.leader_epoch
    }

    pub async fn partition_epoch(&self) -> i32 {
        self.state.read().await.partition_epoch
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == Some(Role::Leader)
    }

    pub async fn leader_id(&self) -> Option<i32> {
        self.state.read().await.leader_id
    }

    pub async fn isr(&self) -> Vec<i32> {
        self.state.read().await.isr.iter().copied().collect()
    }

    pub async fn assignment(&self) -> ReplicaAssignment {
        self.state.read().await.assignment.clone()
    }

    pub async fn follower_state(&self, replica_id: i32) -> Option<FollowerState> {
        self.state
            .read()
            .await
            .follower_states
            .get(&replica_id)
            .cloned()
    }

    /// Reconcile the topic id carried by a control message with the one the
    /// log was created under.
    fn check_or_set_topic_id(&self, incoming: Option<Uuid>) -> BrokerResult<()> {
        let Some(incoming) = incoming else {
            return Ok(());
        };
        match self.topic_id.load() {
            None => {
                self.topic_id.store(Some(incoming));
                Ok(())
            }
            Some(current) if current == incoming => Ok(()),
            Some(current) => Err(BrokerError::InconsistentTopicId(format!(
                "{}: log has topic id {}, request carries {}",
                self.topic_partition, current, incoming
            ))),
        }
    }

    /// Become leader for the epoch in `state`. Returns true iff the leader
    /// epoch actually advanced; replaying an equal epoch is a no-op.
    pub async fn make_leader(
        &self,
        partition_state: &LeaderAndIsrPartitionState,
        hw_checkpoints: &HashMap<TopicPartition, i64>,
        topic_id: Option<Uuid>,
    ) -> AppResult<bool> {
        self.check_or_set_topic_id(topic_id)?;
        let mut state = self.state.write().await;

        if partition_state.leader_epoch < state.leader_epoch {
            return Err(AppError::Broker(BrokerError::FencedLeaderEpoch(format!(
                "{}: request epoch {} < current {}",
                self.topic_partition, partition_state.leader_epoch, state.leader_epoch
            ))));
        }
        let epoch_advanced = partition_state.leader_epoch > state.leader_epoch;
        let was_leader = state.role == Some(Role::Leader);
        if !epoch_advanced && was_leader {
            // equal epoch replay: nothing to do beyond the topic-id fix-up
            return Ok(false);
        }

        state.assignment = ReplicaAssignment::with_reassignment(
            partition_state.replicas.clone(),
            partition_state.adding_replicas.clone(),
            partition_state.removing_replicas.clone(),
        );
        state.isr = partition_state.isr.iter().copied().collect();
        state.leader_epoch = partition_state.leader_epoch;
        state.partition_epoch = partition_state.partition_epoch;
        state.leader_id = Some(self.local_broker_id);
        state.role = Some(Role::Leader);

        let log = self.current_log();
        let leo = log.log_end_offset();
        state.leader_epoch_start_offset = Some(leo);
        log.assign_epoch_start_offset(partition_state.leader_epoch, leo);

        // Followers in the ISR are considered caught up as of the transition;
        // everyone else starts unknown and must prove itself by fetching.
        let now = now_ms();
        state.follower_states = state
            .assignment
            .replicas
            .iter()
            .filter(|id| **id != self.local_broker_id)
            .map(|id| {
                let mut fs = FollowerState::unknown();
                if state.isr.contains(id) {
                    fs.last_caught_up_time_ms = now;
                }
                (*id, fs)
            })
            .collect();

        if partition_state.is_new {
            self.high_watermark.store(0);
        } else if let Some(checkpointed) = hw_checkpoints.get(&self.topic_partition) {
            let hw = (*checkpointed).min(leo).max(self.high_watermark.load());
            self.high_watermark.store(hw);
        }
        Self::maybe_increment_hw(&state, &self.high_watermark, &*log);

        info!(
            "{} became leader at epoch {} with isr {:?}",
            self.topic_partition, state.leader_epoch, state.isr
        );
        Ok(epoch_advanced)
    }

    /// Become follower of `partition_state.leader`. Returns true iff the
    /// epoch advanced or the leader changed.
    pub async fn make_follower(
        &self,
        partition_state: &LeaderAndIsrPartitionState,
        hw_checkpoints: &HashMap<TopicPartition, i64>,
        topic_id: Option<Uuid>,
    ) -> AppResult<bool> {
        self.check_or_set_topic_id(topic_id)?;
        let mut state = self.state.write().await;

        if partition_state.leader_epoch < state.leader_epoch {
            return Err(AppError::Broker(BrokerError::FencedLeaderEpoch(format!(
                "{}: request epoch {} < current {}",
                self.topic_partition, partition_state.leader_epoch, state.leader_epoch
            ))));
        }
        let epoch_advanced = partition_state.leader_epoch > state.leader_epoch;
        let leader_changed = state.leader_id != Some(partition_state.leader);
        if !epoch_advanced && !leader_changed && state.role == Some(Role::Follower) {
            return Ok(false);
        }

        state.assignment = ReplicaAssignment::with_reassignment(
            partition_state.replicas.clone(),
            partition_state.adding_replicas.clone(),
            partition_state.removing_replicas.clone(),
        );
        state.isr.clear();
        state.follower_states.clear();
        state.leader_epoch = partition_state.leader_epoch;
        state.partition_epoch = partition_state.partition_epoch;
        state.leader_id = Some(partition_state.leader);
        state.leader_epoch_start_offset = None;
        state.role = Some(Role::Follower);

        if partition_state.is_new {
            self.high_watermark.store(0);
        } else if let Some(checkpointed) = hw_checkpoints.get(&self.topic_partition) {
            let hw = (*checkpointed)
                .min(self.log_end_offset())
                .max(self.high_watermark.load());
            self.high_watermark.store(hw);
        }

        debug!(
            "{} became follower of {} at epoch {}",
            self.topic_partition, partition_state.leader, state.leader_epoch
        );
        Ok(epoch_advanced || leader_changed)
    }

    /// Leader append. Serialized by the state lock; publishes the HW move so
    /// the caller can complete delayed operations.
    pub async fn append_records_to_leader(
        &self,
        records: MemoryRecords,
        required_acks: i16,
        max_record_size: usize,
        max_batch_size: usize,
    ) -> AppResult<PartitionAppendInfo> {
        let state = self.state.write().await;
        if state.role != Some(Role::Leader) {
            return Err(AppError::Broker(BrokerError::NotLeaderOrFollower(
                self.topic_partition.to_string(),
            )));
        }
        if required_acks == -1 && state.isr.len() < self.min_insync_replicas {
            return Err(AppError::Broker(BrokerError::NotEnoughReplicas(format!(
                "{}: isr {:?} below min required {}",
                self.topic_partition,
                state.isr,
                self.min_insync_replicas
            ))));
        }
        records.validate(max_record_size, max_batch_size)?;

        let log = self.current_log();
        let info = log.append_records(records, state.leader_epoch).await?;
        let hw_change = Self::maybe_increment_hw(&state, &self.high_watermark, &*log);
        Ok(PartitionAppendInfo {
            info,
            log_start_offset: log.log_start_offset(),
            hw_change,
        })
    }

    /// HW = min(LEO) over the ISR, leader included. Published monotonically;
    /// never rolled back.
    fn maybe_increment_hw(
        state: &PartitionState,
        high_watermark: &AtomicCell<i64>,
        log: &dyn Log,
    ) -> HwChange {
        let mut min_leo = log.log_end_offset();
        for (id, fs) in &state.follower_states {
            if state.isr.contains(id) {
                if fs.log_end_offset == UNKNOWN_OFFSET {
                    return HwChange::Same;
                }
                min_leo = min_leo.min(fs.log_end_offset);
            }
        }
        let current = high_watermark.load();
        if min_leo > current {
            high_watermark.store(min_leo);
            HwChange::Increased
        } else {
            HwChange::Same
        }
    }

    /// Serve one partition of a fetch. When the fetcher is a follower its
    /// tracked state is updated, which may expand the ISR and move the HW.
    pub async fn fetch_records(
        &self,
        params: &FetchParams,
        data: &FetchPartitionData,
        max_bytes: i32,
        min_one_message: bool,
        update_fetch_state: bool,
    ) -> AppResult<(FetchPartitionResult, HwChange)> {
        let from_follower = params.is_from_follower();
        let mut state = self.state.write().await;

        if state.role != Some(Role::Leader) && (from_follower || update_fetch_state) {
            return Err(AppError::Broker(BrokerError::NotLeaderOrFollower(
                self.topic_partition.to_string(),
            )));
        }
        if state.role.is_none() {
            return Err(AppError::Broker(BrokerError::NotLeaderOrFollower(
                self.topic_partition.to_string(),
            )));
        }
        if let Some(epoch) = data.current_leader_epoch {
            if epoch < state.leader_epoch {
                return Err(AppError::Broker(BrokerError::FencedLeaderEpoch(format!(
                    "{}: fetch epoch {} < current {}",
                    self.topic_partition, epoch, state.leader_epoch
                ))));
            }
            if epoch > state.leader_epoch {
                return Err(AppError::Broker(BrokerError::UnknownLeaderEpoch(format!(
                    "{}: fetch epoch {} > current {}",
                    self.topic_partition, epoch, state.leader_epoch
                ))));
            }
        }
        if from_follower && !state.assignment.replicas.contains(&params.replica_id) {
            return Err(AppError::Broker(BrokerError::ReplicaNotAvailable(format!(
                "{}: replica {} is not assigned",
                self.topic_partition, params.replica_id
            ))));
        }

        let log = self.current_log();
        // A follower whose epoch history diverged must truncate before it
        // can make progress; answer with the epoch end offset, no records.
        if let Some(last_fetched_epoch) = data.last_fetched_epoch {
            if let Some(end) = log.end_offset_for_epoch(last_fetched_epoch) {
                if end.leader_epoch != last_fetched_epoch || end.end_offset < data.fetch_offset {
                    let result = FetchPartitionResult {
                        error: None,
                        records: MemoryRecords::empty(),
                        high_watermark: self.high_watermark.load(),
                        log_start_offset: log.log_start_offset(),
                        log_end_offset: log.log_end_offset(),
                        last_stable_offset: self.high_watermark.load(),
                        diverging_epoch: Some(end),
                        preferred_read_replica: None,
                    };
                    return Ok((result, HwChange::None));
                }
            }
        }

        let max_offset = match params.fetch_isolation() {
            FetchIsolation::LogEnd => log.log_end_offset(),
            FetchIsolation::HighWatermark | FetchIsolation::TxnCommitted => {
                self.high_watermark.load()
            }
        };
        let fetch_info = log
            .read_records(data.fetch_offset, max_offset, max_bytes, min_one_message)
            .await?;

        let mut hw_change = HwChange::None;
        if update_fetch_state {
            let now = now_ms();
            let leader_leo = log.log_end_offset();
            let fs = state
                .follower_states
                .entry(params.replica_id)
                .or_insert_with(FollowerState::unknown);
            fs.log_end_offset = data.fetch_offset;
            fs.log_start_offset = data.log_start_offset;
            fs.last_fetch_time_ms = now;
            if data.fetch_offset >= leader_leo {
                fs.last_caught_up_time_ms = now;
            }
            self.maybe_expand_isr(&mut state, params.replica_id).await;
            hw_change = Self::maybe_increment_hw(&state, &self.high_watermark, &*log);
        }

        let hw = self.high_watermark.load();
        let result = FetchPartitionResult {
            error: None,
            records: fetch_info.records,
            high_watermark: hw,
            log_start_offset: fetch_info.log_start_offset,
            log_end_offset: fetch_info.log_end_offset,
            last_stable_offset: hw,
            diverging_epoch: None,
            preferred_read_replica: None,
        };
        Ok((result, hw_change))
    }

    /// A follower that has caught up to the HW joins the ISR. The new ISR is
    /// committed to the metadata store before it takes local effect.
    async fn maybe_expand_isr(&self, state: &mut PartitionState, replica_id: i32) {
        if state.isr.contains(&replica_id) {
            return;
        }
        if !state.assignment.replicas.contains(&replica_id) {
            return;
        }
        let caught_up = state
            .follower_states
            .get(&replica_id)
            .map(|fs| fs.log_end_offset >= self.high_watermark.load())
            .unwrap_or(false);
        if !caught_up {
            return;
        }

        let mut new_isr: Vec<i32> = state.isr.iter().copied().collect();
        new_isr.push(replica_id);
        new_isr.sort_unstable();
        match self
            .commit_isr_change(state.leader_epoch, state.partition_epoch, new_isr)
            .await
        {
            Ok(committed) => {
                info!(
                    "{} expanded isr to {:?} at partition epoch {}",
                    self.topic_partition, committed.isr, committed.partition_epoch
                );
                state.isr = committed.isr.iter().copied().collect();
                state.partition_epoch = committed.partition_epoch;
            }
            Err(e) => {
                warn!("{} isr expansion failed: {}", self.topic_partition, e);
            }
        }
    }

    /// Drop followers whose last caught-up time exceeds 1.5x the allowed
    /// lag. Runs on the replica manager's periodic tick, leaders only.
    pub async fn maybe_shrink_isr(&self) -> AppResult<HwChange> {
        let mut state = self.state.write().await;
        if state.role != Some(Role::Leader) {
            return Ok(HwChange::None);
        }
        let now = now_ms();
        let max_lag = (self.replica_lag_time_max_ms as f64 * 1.5) as i64;
        let out_of_sync: Vec<i32> = state
            .isr
            .iter()
            .copied()
            .filter(|id| *id != self.local_broker_id)
            .filter(|id| {
                state
                    .follower_states
                    .get(id)
                    .map(|fs| now - fs.last_caught_up_time_ms > max_lag)
                    .unwrap_or(true)
            })
            .collect();
        if out_of_sync.is_empty() {
            return Ok(HwChange::None);
        }

        let new_isr: Vec<i32> = state
            .isr
            .iter()
            .copied()
            .filter(|id| !out_of_sync.contains(id))
            .collect();
        // never shrink the leader out of its own ISR
        if !new_isr.contains(&self.local_broker_id) {
            return Ok(HwChange::None);
        }

        let committed = self
            .commit_isr_change(state.leader_epoch, state.partition_epoch, new_isr)
            .await?;
        info!(
            "{} shrank isr to {:?} (removed {:?}) at partition epoch {}",
            self.topic_partition, committed.isr, out_of_sync, committed.partition_epoch
        );
        state.isr = committed.isr.iter().copied().collect();
        state.partition_epoch = committed.partition_epoch;
        Ok(Self::maybe_increment_hw(
            &state,
            &self.high_watermark,
            &*self.current_log(),
        ))
    }

    /// Propose an ISR change with optimistic concurrency on the partition
    /// epoch. On conflict, re-read the committed state and retry once.
    async fn commit_isr_change(
        &self,
        leader_epoch: i32,
        partition_epoch: i32,
        new_isr: Vec<i32>,
    ) -> AppResult<LeaderAndIsr> {
        let proposal = LeaderAndIsr::new(
            self.local_broker_id,
            leader_epoch,
            new_isr.clone(),
            partition_epoch,
        );
        match self
            .metastore
            .propose_isr_update(&self.topic_partition, proposal.clone(), partition_epoch)
            .await
        {
            Ok(committed) => Ok(committed),
            Err(AppError::VersionConflict(_)) => {
                let Some(current) = self.metastore.leader_and_isr(&self.topic_partition) else {
                    return Err(AppError::IllegalState(format!(
                        "{} has no committed leadership",
                        self.topic_partition
                    )));
                };
                if current.leader_epoch != leader_epoch {
                    return Err(AppError::Broker(BrokerError::FencedLeaderEpoch(
                        self.topic_partition.to_string(),
                    )));
                }
                let mut retry = proposal;
                retry.partition_epoch = current.partition_epoch;
                self.metastore
                    .propose_isr_update(&self.topic_partition, retry, current.partition_epoch)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// DeleteRecords on the leader: advance the log start offset and report
    /// the new low watermark. `offset == -1` means "up to the HW".
    pub async fn delete_records_on_leader(&self, offset: i64) -> AppResult<i64> {
        let state = self.state.read().await;
        if state.role != Some(Role::Leader) {
            return Err(AppError::Broker(BrokerError::NotLeaderOrFollower(
                self.topic_partition.to_string(),
            )));
        }
        let hw = self.high_watermark.load();
        let target = if offset == UNKNOWN_OFFSET { hw } else { offset };
        if target > hw {
            return Err(AppError::Broker(BrokerError::OffsetOutOfRange(format!(
                "{}: cannot delete past the high watermark {} (requested {})",
                self.topic_partition, hw, target
            ))));
        }
        self.current_log().advance_log_start_offset(target).await
    }

    /// The smallest log start offset across the ISR, i.e. what DeleteRecords
    /// callers wait on.
    pub async fn low_watermark(&self) -> i64 {
        let state = self.state.read().await;
        let mut low = self.log_start_offset();
        for (id, fs) in &state.follower_states {
            if state.isr.contains(id) && fs.log_start_offset != UNKNOWN_OFFSET {
                low = low.min(fs.log_start_offset);
            }
        }
        low
    }

    /// Timestamp lookup with optional epoch fencing.
    pub async fn fetch_offset_for_timestamp(
        &self,
        timestamp: i64,
        current_leader_epoch: Option<i32>,
        only_from_leader: bool,
    ) -> AppResult<Option<i64>> {
        let state = self.state.read().await;
        if only_from_leader && state.role != Some(Role::Leader) {
            return Err(AppError::Broker(BrokerError::NotLeaderOrFollower(
                self.topic_partition.to_string(),
            )));
        }
        if let Some(epoch) = current_leader_epoch {
            if epoch < state.leader_epoch {
                return Err(AppError::Broker(BrokerError::FencedLeaderEpoch(
                    self.topic_partition.to_string(),
                )));
            }
            if epoch > state.leader_epoch {
                return Err(AppError::Broker(BrokerError::UnknownLeaderEpoch(
                    self.topic_partition.to_string(),
                )));
            }
        }
        Ok(self.current_log().offset_for_timestamp(timestamp))
    }

    /// Epoch-based end-offset lookup used by followers for truncation.
    pub async fn last_offset_for_leader_epoch(
        &self,
        current_leader_epoch: Option<i32>,
        requested_epoch: i32,
        only_from_leader: bool,
    ) -> AppResult<EpochEndOffset> {
        let state = self.state.read().await;
        if only_from_leader && state.role != Some(Role::Leader) {
            return Err(AppError::Broker(BrokerError::NotLeaderOrFollower(
                self.topic_partition.to_string(),
            )));
        }
        if let Some(epoch) = current_leader_epoch {
            if epoch < state.leader_epoch {
                return Err(AppError::Broker(BrokerError::FencedLeaderEpoch(
                    self.topic_partition.to_string(),
                )));
            }
            if epoch > state.leader_epoch {
                return Err(AppError::Broker(BrokerError::UnknownLeaderEpoch(
                    self.topic_partition.to_string(),
                )));
            }
        }
        Ok(self
            .current_log()
            .end_offset_for_epoch(requested_epoch)
            .unwrap_or(EpochEndOffset {
                leader_epoch: -1,
                end_offset: UNKNOWN_OFFSET,
            }))
    }

    /// Delayed-produce predicate: has the HW reached `required_offset`, or
    /// can the wait never succeed?
    pub async fn check_enough_replicas_reach_offset(
        &self,
        required_offset: i64,
    ) -> (bool, Option<BrokerError>) {
        let state = self.state.read().await;
        if state.role != Some(Role::Leader) {
            return (
                true,
                Some(BrokerError::NotLeaderOrFollower(
                    self.topic_partition.to_string(),
                )),
            );
        }
        if self.high_watermark.load() >= required_offset {
            if state.isr.len() < self.min_insync_replicas {
                return (
                    true,
                    Some(BrokerError::NotEnoughReplicasAfterAppend(format!(
                        "{}: isr {:?} below min required {}",
                        self.topic_partition, state.isr, self.min_insync_replicas
                    ))),
                );
            }
            return (true, None);
        }
        (false, None)
    }

    /// Follower-side append from the fetcher. Trusts the leader's epoch.
    pub async fn append_records_to_follower(
        &self,
        records: MemoryRecords,
        leader_hw: i64,
        leader_log_start_offset: i64,
    ) -> AppResult<()> {
        let state = self.state.write().await;
        if state.role != Some(Role::Follower) {
            return Err(AppError::Broker(BrokerError::NotLeaderOrFollower(
                self.topic_partition.to_string(),
            )));
        }
        let log = self.current_log();
        if !records.is_empty() {
            log.append_records(records, state.leader_epoch).await?;
        }
        if leader_log_start_offset > log.log_start_offset() {
            log.advance_log_start_offset(leader_log_start_offset.min(log.log_end_offset()))
                .await?;
        }
        // follower HW = min(leader HW, own LEO); monotone like the leader's
        let new_hw = leader_hw.min(log.log_end_offset());
        if new_hw > self.high_watermark.load() {
            self.high_watermark.store(new_hw);
        }
        Ok(())
    }

    /// Follower-side truncation after the leader reported a divergence.
    pub async fn truncate_to(&self, offset: i64) -> AppResult<()> {
        let state = self.state.write().await;
        if state.role != Some(Role::Follower) {
            return Err(AppError::Broker(BrokerError::NotLeaderOrFollower(
                self.topic_partition.to_string(),
            )));
        }
        warn!("{} truncating to offset {}", self.topic_partition, offset);
        self.current_log().truncate_to(offset).await?;
        let hw = self.high_watermark.load();
        if hw > offset {
            self.high_watermark.store(offset);
        }
        Ok(())
    }

    pub fn latest_log_epoch(&self) -> Option<i32> {
        self.log.read().latest_epoch()
    }

    /// `(id, log_start_offset, log_end_offset)` for every in-sync follower
    /// with a known position. Feeds read-replica selection.
    pub async fn isr_follower_views(&self) -> Vec<(i32, i64, i64)> {
        let state = self.state.read().await;
        state
            .follower_states
            .iter()
            .filter(|(id, fs)| {
                state.isr.contains(id) && fs.log_end_offset != UNKNOWN_OFFSET
            })
            .map(|(id, fs)| (*id, fs.log_start_offset.max(0), fs.log_end_offset))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::log::MemoryLog;
    use crate::message::LeaderRecoveryState;
    use crate::metastore::MemoryMetaStore;

    use super::*;

    fn records(count: i32) -> MemoryRecords {
        MemoryRecords::new(Bytes::from(vec![7u8; count as usize * 16]), count, 1_000)
    }

    fn leader_state(
        tp: &TopicPartition,
        leader: i32,
        epoch: i32,
        isr: Vec<i32>,
        replicas: Vec<i32>,
    ) -> LeaderAndIsrPartitionState {
        LeaderAndIsrPartitionState {
            topic_partition: tp.clone(),
            leader,
            leader_epoch: epoch,
            isr,
            partition_epoch: 1,
            replicas,
            adding_replicas: Vec::new(),
            removing_replicas: Vec::new(),
            is_new: true,
            leader_recovery_state: LeaderRecoveryState::Recovered,
        }
    }

    async fn leader_partition(store: Arc<MemoryMetaStore>) -> Partition {
        let tp = TopicPartition::new("orders", 0);
        let log = Arc::new(MemoryLog::new(tp.clone(), "dir-a"));
        store
            .try_claim_coordinator_lease(99)
            .await
            .unwrap();
        store
            .set_leader_and_isr(&tp, LeaderAndIsr::initial(1, vec![1, 2, 3]), 0, 1)
            .await
            .unwrap();
        let partition = Partition::new(tp.clone(), 1, log, store, 30_000, 1);
        let mut state = leader_state(&tp, 1, 0, vec![1, 2, 3], vec![1, 2, 3]);
        state.partition_epoch = 1;
        partition
            .make_leader(&state, &HashMap::new(), None)
            .await
            .unwrap();
        partition
    }

    #[tokio::test]
    async fn test_append_requires_leadership() {
        let store = Arc::new(MemoryMetaStore::new());
        let tp = TopicPartition::new("orders", 0);
        let log = Arc::new(MemoryLog::new(tp.clone(), "dir-a"));
        let partition = Partition::new(tp, 1, log, store, 30_000, 1);
        let err = partition
            .append_records_to_leader(records(1), 1, 1 << 20, 1 << 20)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Broker(BrokerError::NotLeaderOrFollower(_))
        ));
    }

    #[tokio::test]
    async fn test_make_leader_is_idempotent_on_equal_epoch() {
        let store = Arc::new(MemoryMetaStore::new());
        let partition = leader_partition(store).await;
        let state = leader_state(
            partition.topic_partition(),
            1,
            0,
            vec![1, 2, 3],
            vec![1, 2, 3],
        );
        assert!(!partition
            .make_leader(&state, &HashMap::new(), None)
            .await
            .unwrap());
        // stale epoch is fenced
        let mut stale = state;
        partition
            .make_leader(
                &leader_state(
                    partition.topic_partition(),
                    1,
                    3,
                    vec![1, 2, 3],
                    vec![1, 2, 3],
                ),
                &HashMap::new(),
                None,
            )
            .await
            .unwrap();
        stale.leader_epoch = 1;
        let err = partition
            .make_leader(&stale, &HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Broker(BrokerError::FencedLeaderEpoch(_))
        ));
    }

    #[tokio::test]
    async fn test_hw_advances_with_follower_fetch() {
        let store = Arc::new(MemoryMetaStore::new());
        let partition = leader_partition(store).await;
        partition
            .append_records_to_leader(records(10), 1, 1 << 20, 1 << 20)
            .await
            .unwrap();
        assert_eq!(partition.high_watermark(), 0);

        let params = FetchParams {
            replica_id: 2,
            max_wait_ms: 0,
            min_bytes: 0,
            max_bytes: 1 << 20,
            isolation: FetchIsolation::LogEnd,
            client_metadata: None,
        };
        let mut data = FetchPartitionData {
            fetch_offset: 10,
            partition_max_bytes: 1 << 20,
            current_leader_epoch: Some(0),
            last_fetched_epoch: None,
            log_start_offset: 0,
        };
        let (_, hw_change) = partition
            .fetch_records(&params, &data, 1 << 20, true, true)
            .await
            .unwrap();
        // follower 3 has not reported yet, so the HW cannot move
        assert_eq!(hw_change, HwChange::Same);

        let params3 = FetchParams {
            replica_id: 3,
            ..params.clone()
        };
        data.fetch_offset = 10;
        let (_, hw_change) = partition
            .fetch_records(&params3, &data, 1 << 20, true, true)
            .await
            .unwrap();
        assert_eq!(hw_change, HwChange::Increased);
        assert_eq!(partition.high_watermark(), 10);
    }

    #[tokio::test]
    async fn test_fenced_fetch_epoch() {
        let store = Arc::new(MemoryMetaStore::new());
        let partition = leader_partition(store).await;
        partition
            .make_leader(
                &leader_state(
                    partition.topic_partition(),
                    1,
                    2,
                    vec![1, 2, 3],
                    vec![1, 2, 3],
                ),
                &HashMap::new(),
                None,
            )
            .await
            .unwrap();
        let params = FetchParams {
            replica_id: 2,
            max_wait_ms: 0,
            min_bytes: 0,
            max_bytes: 1 << 20,
            isolation: FetchIsolation::LogEnd,
            client_metadata: None,
        };
        let data = FetchPartitionData {
            fetch_offset: 0,
            partition_max_bytes: 1 << 20,
            current_leader_epoch: Some(0),
            last_fetched_epoch: None,
            log_start_offset: 0,
        };
        let err = partition
            .fetch_records(&params, &data, 1 << 20, true, true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Broker(BrokerError::FencedLeaderEpoch(_))
        ));
    }

    #[tokio::test]
    async fn test_shrink_isr_removes_laggard() {
        let store = Arc::new(MemoryMetaStore::new());
        let tp = TopicPartition::new("orders", 0);
        let log = Arc::new(MemoryLog::new(tp.clone(), "dir-a"));
        store.try_claim_coordinator_lease(99).await.unwrap();
        store
            .set_leader_and_isr(&tp, LeaderAndIsr::initial(1, vec![1, 2, 3]), 0, 1)
            .await
            .unwrap();
        // 40ms lag budget so the laggard drops fast
        let partition = Partition::new(tp.clone(), 1, log, store.clone(), 40, 1);
        let mut state = leader_state(&tp, 1, 0, vec![1, 2, 3], vec![1, 2, 3]);
        state.partition_epoch = 1;
        partition
            .make_leader(&state, &HashMap::new(), None)
            .await
            .unwrap();

        partition
            .append_records_to_leader(records(10), 1, 1 << 20, 1 << 20)
            .await
            .unwrap();

        let params = FetchParams {
            replica_id: 2,
            max_wait_ms: 0,
            min_bytes: 0,
            max_bytes: 1 << 20,
            isolation: FetchIsolation::LogEnd,
            client_metadata: None,
        };
        let data = FetchPartitionData {
            fetch_offset: 10,
            partition_max_bytes: 1 << 20,
            current_leader_epoch: Some(0),
            last_fetched_epoch: None,
            log_start_offset: 0,
        };
        // follower 2 keeps up, follower 3 never fetches
        partition
            .fetch_records(&params, &data, 1 << 20, true, true)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        partition
            .fetch_records(&params, &data, 1 << 20, true, true)
            .await
            .unwrap();

        partition.maybe_shrink_isr().await.unwrap();
        let isr = partition.isr().await;
        assert_eq!(isr, vec![1, 2]);
        // shrink bumped the partition epoch through the store
        assert_eq!(partition.partition_epoch().await, 2);
        // with 3 gone, the HW can move to min(leader, 2)
        assert_eq!(partition.high_watermark(), 10);
    }

    #[tokio::test]
    async fn test_delete_records_bounded_by_hw() {
        let store = Arc::new(MemoryMetaStore::new());
        let partition = leader_partition(store).await;
        partition
            .append_records_to_leader(records(10), 1, 1 << 20, 1 << 20)
            .await
            .unwrap();
        // hw still 0: nothing replicated yet
        let err = partition.delete_records_on_leader(5).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Broker(BrokerError::OffsetOutOfRange(_))
        ));
    }

    #[tokio::test]
    async fn test_diverging_epoch_reported_to_follower() {
        let store = Arc::new(MemoryMetaStore::new());
        let partition = leader_partition(store).await;
        partition
            .append_records_to_leader(records(10), 1, 1 << 20, 1 << 20)
            .await
            .unwrap();
        // move to epoch 2 and append more
        partition
            .make_leader(
                &leader_state(
                    partition.topic_partition(),
                    1,
                    2,
                    vec![1, 2, 3],
                    vec![1, 2, 3],
                ),
                &HashMap::new(),
                None,
            )
            .await
            .unwrap();
        partition
            .append_records_to_leader(records(5), 1, 1 << 20, 1 << 20)
            .await
            .unwrap();

        // follower claims epoch 1 history up to offset 12: diverged
        let params = FetchParams {
            replica_id: 2,
            max_wait_ms: 0,
            min_bytes: 0,
            max_bytes: 1 << 20,
            isolation: FetchIsolation::LogEnd,
            client_metadata: None,
        };
        let data = FetchPartitionData {
            fetch_offset: 12,
            partition_max_bytes: 1 << 20,
            current_leader_epoch: Some(2),
            last_fetched_epoch: Some(1),
            log_start_offset: 0,
        };
        let (result, _) = partition
            .fetch_records(&params, &data, 1 << 20, true, true)
            .await
            .unwrap();
        let diverging = result.diverging_epoch.unwrap();
        assert_eq!(diverging.leader_epoch, 0);
        assert_eq!(diverging.end_offset, 10);
        assert!(result.records.is_empty());
    }
}
