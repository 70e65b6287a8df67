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

use tracing::{debug, info};

use crate::message::{EPOCH_DURING_DELETE, NO_EPOCH, NO_LEADER};
use crate::{AppError, AppResult};

use super::context::{PartitionReplica, ReplicaState};
use super::CoordinatorCore;

fn valid_previous_states(target: ReplicaState) -> &'static [ReplicaState] {
    match target {
        ReplicaState::New => &[ReplicaState::NonExistent],
        ReplicaState::Online => &[
            ReplicaState::New,
            ReplicaState::Online,
            ReplicaState::Offline,
            ReplicaState::ReplicaDeletionIneligible,
        ],
        ReplicaState::Offline => &[
            ReplicaState::New,
            ReplicaState::Online,
            ReplicaState::Offline,
            ReplicaState::ReplicaDeletionIneligible,
        ],
        ReplicaState::ReplicaDeletionStarted => &[ReplicaState::Offline],
        ReplicaState::ReplicaDeletionSuccessful => &[ReplicaState::ReplicaDeletionStarted],
        ReplicaState::ReplicaDeletionIneligible => &[
            ReplicaState::Offline,
            ReplicaState::ReplicaDeletionStarted,
        ],
        ReplicaState::NonExistent => &[ReplicaState::ReplicaDeletionSuccessful],
    }
}

impl CoordinatorCore {
    /// Drive `replicas` to `target`, with the side effects each target
    /// implies: Offline removes the replica from its ISR and tells the
    /// broker to stop it; ReplicaDeletionStarted queues the deleting
    /// StopReplica. An invalid transition is an invariant violation.
    pub(crate) async fn replica_state_transition(
        &mut self,
        replicas: Vec<PartitionReplica>,
        target: ReplicaState,
    ) -> AppResult<()> {
        for replica in replicas {
            let current = self.ctx.replica_state(&replica);
            if !valid_previous_states(target).contains(&current) {
                return Err(AppError::IllegalState(format!(
                    "replica {} cannot move {:?} -> {:?}",
                    replica, current, target
                )));
            }
            match target {
                ReplicaState::Offline => {
                    self.remove_replica_from_isr(&replica).await?;
                    let epoch = self
                        .ctx
                        .leadership(&replica.topic_partition)
                        .map(|l| l.leader_epoch)
                        .unwrap_or(NO_EPOCH);
                    self.batcher.add_stop_replica(
                        &[replica.broker_id],
                        replica.topic_partition.clone(),
                        epoch,
                        false,
                    );
                    self.ctx.put_replica_state(replica, ReplicaState::Offline);
                }
                ReplicaState::ReplicaDeletionStarted => {
                    self.batcher.add_stop_replica(
                        &[replica.broker_id],
                        replica.topic_partition.clone(),
                        EPOCH_DURING_DELETE,
                        true,
                    );
                    self.ctx
                        .put_replica_state(replica, ReplicaState::ReplicaDeletionStarted);
                }
                other => {
                    debug!("replica {} -> {:?}", replica, other);
                    self.ctx.put_replica_state(replica, other);
                }
            }
        }
        Ok(())
    }

    /// Shrink the ISR around a replica that is leaving (broker failure or
    /// reassignment removal). Bumps the leader epoch; if the leaving replica
    /// led the partition, leadership is vacated.
    async fn remove_replica_from_isr(&mut self, replica: &PartitionReplica) -> AppResult<()> {
        let tp = &replica.topic_partition;
        let Some(current) = self.ctx.leadership(tp).cloned() else {
            return Ok(());
        };
        if !current.isr.contains(&replica.broker_id) && current.leader != replica.broker_id {
            return Ok(());
        }
        let new_isr: Vec<i32> = current
            .isr
            .iter()
            .filter(|r| **r != replica.broker_id)
            .copied()
            .collect();
        let new_leader = if current.leader == replica.broker_id {
            NO_LEADER
        } else {
            current.leader
        };
        // an empty ISR would lose the last committed offset; keep the
        // leaving replica in it and let a future election resolve
        let new_isr = if new_isr.is_empty() {
            current.isr.clone()
        } else {
            new_isr
        };
        let committed = self
            .commit_leadership(tp, current.with_leader(new_leader, new_isr))
            .await?;
        info!(
            "{} shrank isr to {:?} after removing replica {}",
            tp, committed.isr, replica.broker_id
        );
        let remaining: Vec<i32> = self
            .ctx
            .partition_replicas(tp)
            .into_iter()
            .filter(|r| *r != replica.broker_id)
            .collect();
        self.add_leader_and_isr_to_batch(tp, &remaining, false);
        Ok(())
    }
}
