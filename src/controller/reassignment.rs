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

use std::collections::{BTreeMap, HashSet};

use tracing::{info, warn};

use crate::message::{ReplicaAssignment, TopicPartition, NO_EPOCH};
use crate::{AppResult, BrokerError};

use super::context::{PartitionReplica, ReplicaState};
use super::event::ReassignmentCallback;
use super::partition_state_machine::ElectionStrategy;
use super::CoordinatorCore;

impl CoordinatorCore {
    /// Entry point for admin- and store-triggered reassignments. The
    /// callback answers once phase U is durably recorded; convergence is
    /// observed through the metadata store.
    pub(crate) async fn on_partition_reassignment_request(
        &mut self,
        reassignment: BTreeMap<TopicPartition, Vec<i32>>,
        callback: Option<ReassignmentCallback>,
    ) -> AppResult<()> {
        let mut results: BTreeMap<TopicPartition, Option<BrokerError>> = BTreeMap::new();
        for (tp, target) in reassignment {
            let error = match self.validate_reassignment(&tp, &target) {
                Err(e) => Some(e),
                Ok(()) => match self.trigger_reassignment(&tp, target).await {
                    Ok(()) => None,
                    Err(e) => {
                        warn!("reassignment of {} failed: {}", tp, e);
                        Some(BrokerError::from(e))
                    }
                },
            };
            results.insert(tp, error);
        }
        if let Some(callback) = callback {
            let _ = callback.send(results);
        }
        Ok(())
    }

    fn validate_reassignment(
        &self,
        tp: &TopicPartition,
        target: &[i32],
    ) -> Result<(), BrokerError> {
        if target.is_empty() {
            return Err(BrokerError::InvalidReplicaAssignment(
                "empty target replica set".to_string(),
            ));
        }
        let distinct: HashSet<i32> = target.iter().copied().collect();
        if distinct.len() != target.len() {
            return Err(BrokerError::InvalidReplicaAssignment(format!(
                "duplicate replicas in {:?}",
                target
            )));
        }
        if self.ctx.partition_assignment(tp).is_none() {
            return Err(BrokerError::UnknownTopicOrPartition(tp.to_string()));
        }
        if self.ctx.is_topic_queued_for_deletion(tp.topic()) {
            return Err(BrokerError::InvalidReplicaAssignment(format!(
                "topic {} is queued for deletion",
                tp.topic()
            )));
        }
        if let Some(dead) = target.iter().find(|r| !self.ctx.is_broker_live(**r)) {
            return Err(BrokerError::InvalidReplicaAssignment(format!(
                "target replica {} is not live",
                dead
            )));
        }
        Ok(())
    }

    /// Phase U then phase A. ORS is the current origin set (which makes
    /// superseding an in-flight reassignment a plain restart), TRS the
    /// requested target.
    async fn trigger_reassignment(
        &mut self,
        tp: &TopicPartition,
        target: Vec<i32>,
    ) -> AppResult<()> {
        let previous = self
            .ctx
            .partition_assignment(tp)
            .cloned()
            .unwrap_or_default();
        let origin = previous.origin_replicas();

        // phase U: record intent. replicas = TRS then the origin leftovers.
        let mut combined = target.clone();
        for r in &origin {
            if !combined.contains(r) {
                combined.push(*r);
            }
        }
        let adding: Vec<i32> = target.iter().filter(|r| !origin.contains(r)).copied().collect();
        let removing: Vec<i32> = origin.iter().filter(|r| !target.contains(r)).copied().collect();
        let new_assignment =
            ReplicaAssignment::with_reassignment(combined.clone(), adding.clone(), removing);
        self.persist_assignment(tp, new_assignment).await?;
        self.ctx.mark_reassigning(tp.clone());

        self.batcher.new_batch()?;

        // a superseded reassignment may leave replicas that belong to
        // neither the origin nor the new target: drop them now
        let superseded: Vec<i32> = previous
            .replicas
            .iter()
            .filter(|r| !combined.contains(r))
            .copied()
            .collect();
        for replica in superseded {
            self.batcher
                .add_stop_replica(&[replica], tp.clone(), NO_EPOCH, true);
            self.ctx
                .put_replica_state(PartitionReplica::new(tp.clone(), replica), ReplicaState::NonExistent);
        }

        for replica in &adding {
            let pr = PartitionReplica::new(tp.clone(), *replica);
            if self.ctx.replica_state(&pr) == ReplicaState::NonExistent {
                self.replica_state_transition(vec![pr.clone()], ReplicaState::New)
                    .await?;
            }
            self.replica_state_transition(vec![pr], ReplicaState::Online)
                .await?;
        }

        if self.is_reassignment_complete(tp) {
            self.complete_reassignment(tp).await?;
            self.flush_batch().await?;
            self.cleanup_removed_replicas(tp);
            return Ok(());
        }

        // phase A: fence with a fresh leader epoch and start the new
        // replicas fetching
        let current = self.leadership_or_err(tp)?;
        self.commit_leadership(tp, current.new_epoch()).await?;
        info!(
            "{} reassignment phase A: replicas {:?}, adding {:?}",
            tp,
            combined,
            adding
        );
        self.add_leader_and_isr_to_batch(tp, &combined, false);
        self.add_update_metadata_to_batch(&[tp.clone()]);
        self.flush_batch().await?;
        Ok(())
    }

    pub(crate) fn is_reassignment_complete(&self, tp: &TopicPartition) -> bool {
        let Some(assignment) = self.ctx.partition_assignment(tp) else {
            return false;
        };
        if !assignment.is_being_reassigned() {
            return true;
        }
        let Some(leadership) = self.ctx.leadership(tp) else {
            return false;
        };
        assignment
            .target_replicas()
            .iter()
            .all(|r| leadership.isr.contains(r))
    }

    /// Called on ISR growth for a reassigning partition; finishes phase B
    /// once the full target set is in sync.
    pub(crate) async fn maybe_complete_reassignment(
        &mut self,
        tp: &TopicPartition,
    ) -> AppResult<()> {
        if !self.is_reassignment_complete(tp) {
            return Ok(());
        }
        self.batcher.new_batch()?;
        self.complete_reassignment(tp).await?;
        self.flush_batch().await?;
        self.cleanup_removed_replicas(tp);
        Ok(())
    }

    /// Replicas whose deleting StopReplica succeeded and that are no longer
    /// assigned leave the state machine entirely.
    fn cleanup_removed_replicas(&mut self, tp: &TopicPartition) {
        let assigned = self.ctx.partition_replicas(tp);
        for replica in self
            .ctx
            .replicas_in_state(tp.topic(), ReplicaState::ReplicaDeletionSuccessful)
        {
            if replica.topic_partition == *tp && !assigned.contains(&replica.broker_id) {
                self.ctx.put_replica_state(replica, ReplicaState::NonExistent);
            }
        }
    }

    /// Phase B: move leadership into TRS if needed, drop and delete the
    /// removed replicas, commit the final assignment, clear the tracker.
    async fn complete_reassignment(&mut self, tp: &TopicPartition) -> AppResult<()> {
        let assignment = self
            .ctx
            .partition_assignment(tp)
            .cloned()
            .unwrap_or_default();
        if !assignment.is_being_reassigned() {
            self.ctx.clear_reassigning(tp);
            return Ok(());
        }
        let target = assignment.target_replicas();
        let removing = assignment.removing_replicas.clone();
        info!("{} reassignment phase B: committing target {:?}", tp, target);

        let leadership = self.leadership_or_err(tp)?;
        if !target.contains(&leadership.leader) || !self.ctx.is_broker_live(leadership.leader) {
            if let Err(e) = self
                .elect_partition_leader(tp, ElectionStrategy::Reassign)
                .await
            {
                warn!("{} reassignment leader move failed: {}", tp, e);
            }
        } else {
            // fence the old replica set with a fresh epoch
            let current = self.leadership_or_err(tp)?;
            self.commit_leadership(tp, current.new_epoch()).await?;
        }

        let removed: Vec<PartitionReplica> = removing
            .iter()
            .map(|r| PartitionReplica::new(tp.clone(), *r))
            .collect();
        self.replica_state_transition(removed.clone(), ReplicaState::Offline)
            .await?;
        self.replica_state_transition(removed, ReplicaState::ReplicaDeletionStarted)
            .await?;

        self.persist_assignment(tp, ReplicaAssignment::new(target.clone()))
            .await?;
        self.ctx.clear_reassigning(tp);
        if self.ctx.is_topic_queued_for_deletion(tp.topic())
            && !self.ctx.is_topic_reassigning(tp.topic())
        {
            self.ctx.clear_topic_ineligible_for_deletion(tp.topic());
        }

        // one more epoch bump so the trimmed assignment is not discarded as
        // an equal-epoch replay by replicas that saw the interim states
        let current = self.leadership_or_err(tp)?;
        self.commit_leadership(tp, current.new_epoch()).await?;
        self.add_leader_and_isr_to_batch(tp, &target, false);
        self.add_update_metadata_to_batch(&[tp.clone()]);
        Ok(())
    }

    /// A restarted coordinator picks up every reassignment recorded in the
    /// store: finish the completed ones, re-issue phase A for the rest.
    pub(crate) async fn resume_reassignments(&mut self) -> AppResult<()> {
        for tp in self.ctx.partitions_being_reassigned() {
            if self.is_reassignment_complete(&tp) {
                self.maybe_complete_reassignment(&tp).await?;
            } else {
                let Some(assignment) = self.ctx.partition_assignment(&tp).cloned() else {
                    continue;
                };
                self.batcher.new_batch()?;
                let current = self.leadership_or_err(&tp)?;
                self.commit_leadership(&tp, current.new_epoch()).await?;
                self.add_leader_and_isr_to_batch(&tp, &assignment.replicas, false);
                self.add_update_metadata_to_batch(&[tp.clone()]);
                self.flush_batch().await?;
            }
        }
        Ok(())
    }

    /// Write the partition's assignment back into the topic's full map.
    async fn persist_assignment(
        &mut self,
        tp: &TopicPartition,
        assignment: ReplicaAssignment,
    ) -> AppResult<()> {
        self.ctx.set_partition_assignment(tp, assignment);
        let topic_map = self
            .ctx
            .topic_assignment(tp.topic())
            .cloned()
            .unwrap_or_default();
        self.metastore
            .set_topic_assignment(tp.topic(), topic_map, self.epoch)
            .await
    }
}
