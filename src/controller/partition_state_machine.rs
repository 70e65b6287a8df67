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

use std::collections::HashMap;

use tracing::{info, warn};

use crate::message::{LeaderAndIsr, LeaderRecoveryState, TopicPartition, INITIAL_LEADER_EPOCH};
use crate::{AppError, AppResult, BrokerError};

use super::context::PartitionState;
use super::election;
use super::CoordinatorCore;

/// How to pick a leader when a partition moves to Online.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionStrategy {
    Offline { allow_unclean: bool },
    Reassign,
    Preferred,
    ControlledShutdown,
}

fn valid_previous_states(target: PartitionState) -> &'static [PartitionState] {
    match target {
        PartitionState::New => &[PartitionState::NonExistent],
        PartitionState::Online => &[
            PartitionState::New,
            PartitionState::Online,
            PartitionState::Offline,
        ],
        PartitionState::Offline => &[
            PartitionState::New,
            PartitionState::Online,
            PartitionState::Offline,
        ],
        PartitionState::NonExistent => &[
            PartitionState::New,
            PartitionState::Online,
            PartitionState::Offline,
        ],
    }
}

impl CoordinatorCore {
    /// Drive `partitions` to `target`. A transition to Online runs the given
    /// election strategy (or initializes leadership for New partitions) and
    /// queues LeaderAndIsr messages in the currently open batch.
    ///
    /// Per-partition election failures land in the result map; an invalid
    /// state transition is an invariant violation and aborts the caller.
    pub(crate) async fn partition_state_transition(
        &mut self,
        partitions: Vec<TopicPartition>,
        target: PartitionState,
        strategy: Option<ElectionStrategy>,
    ) -> AppResult<HashMap<TopicPartition, Result<LeaderAndIsr, BrokerError>>> {
        let mut results = HashMap::new();
        for tp in partitions {
            let current = self.ctx.partition_state(&tp);
            if !valid_previous_states(target).contains(&current) {
                return Err(AppError::IllegalState(format!(
                    "partition {} cannot move {:?} -> {:?}",
                    tp, current, target
                )));
            }
            match target {
                PartitionState::New | PartitionState::Offline | PartitionState::NonExistent => {
                    self.ctx.put_partition_state(tp.clone(), target);
                    results.insert(tp, Ok(LeaderAndIsr::new(-1, -1, Vec::new(), -1)));
                }
                PartitionState::Online => {
                    let outcome = if current == PartitionState::New {
                        self.initialize_leadership(&tp).await
                    } else {
                        self.elect_leadership(&tp, strategy).await
                    };
                    match outcome {
                        Ok(leadership) => {
                            self.ctx.put_partition_state(tp.clone(), PartitionState::Online);
                            results.insert(tp, Ok(leadership));
                        }
                        Err(e) => {
                            results.insert(tp, Err(e));
                        }
                    }
                }
            }
        }
        Ok(results)
    }

    /// First leadership of a freshly created partition: the first live
    /// assigned replica leads, every live replica forms the ISR.
    async fn initialize_leadership(
        &mut self,
        tp: &TopicPartition,
    ) -> Result<LeaderAndIsr, BrokerError> {
        let replicas = self.ctx.partition_replicas(tp);
        let live = self.ctx.leadable_brokers();
        let live_replicas: Vec<i32> = replicas
            .iter()
            .filter(|r| live.contains(r))
            .copied()
            .collect();
        let Some(leader) = live_replicas.first().copied() else {
            return Err(BrokerError::LeaderNotAvailable(format!(
                "no assigned replica of {} is live",
                tp
            )));
        };
        let leadership = LeaderAndIsr::new(
            leader,
            INITIAL_LEADER_EPOCH,
            live_replicas,
            0,
        );
        let committed = self
            .commit_leadership_initial(tp, leadership)
            .await
            .map_err(|e| BrokerError::UnknownServerError(e.to_string()))?;
        info!("{} initialized with leader {}", tp, committed.leader);
        self.add_leader_and_isr_to_batch(tp, &self.ctx.partition_replicas(tp), true);
        Ok(committed)
    }

    async fn commit_leadership_initial(
        &mut self,
        tp: &TopicPartition,
        leadership: LeaderAndIsr,
    ) -> AppResult<LeaderAndIsr> {
        let committed = self
            .metastore
            .set_leader_and_isr(tp, leadership, -1, self.epoch)
            .await?;
        self.ctx.put_leadership(tp.clone(), committed.clone());
        Ok(committed)
    }

    /// Re-election of an existing partition under one of the strategies. The
    /// leader epoch is always bumped so stale leaders are fenced.
    async fn elect_leadership(
        &mut self,
        tp: &TopicPartition,
        strategy: Option<ElectionStrategy>,
    ) -> Result<LeaderAndIsr, BrokerError> {
        let Some(strategy) = strategy else {
            return Err(BrokerError::UnknownServerError(format!(
                "no election strategy for online transition of {}",
                tp
            )));
        };
        let current = self
            .leadership_or_err(tp)
            .map_err(|e| BrokerError::UnknownServerError(e.to_string()))?;
        let assignment = self
            .ctx
            .partition_assignment(tp)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownTopicOrPartition(tp.to_string()))?;
        let live = self.ctx.leadable_brokers();

        let result = match strategy {
            ElectionStrategy::Offline { allow_unclean } => {
                election::elect_for_offline(&assignment, &current, &live, allow_unclean)
            }
            ElectionStrategy::Reassign => {
                election::elect_for_reassignment(&assignment, &current, &live)
            }
            ElectionStrategy::Preferred => {
                election::elect_preferred(&assignment, &current, &live)
            }
            ElectionStrategy::ControlledShutdown => election::elect_for_controlled_shutdown(
                &assignment,
                &current,
                &live,
                self.ctx.shutting_down_brokers(),
            ),
        };
        let elected = match result {
            Ok(elected) => elected,
            Err(e) => {
                warn!("election for {} failed: {}", tp, e);
                return Err(match e {
                    election::ElectionError::EligibleLeadersNotAvailable => {
                        BrokerError::EligibleLeadersNotAvailable(tp.to_string())
                    }
                    election::ElectionError::PreferredLeaderNotAvailable(r) => {
                        BrokerError::PreferredLeaderNotAvailable(format!("{} for {}", r, tp))
                    }
                    election::ElectionError::ElectionNotNeeded => {
                        BrokerError::ElectionNotNeeded(tp.to_string())
                    }
                });
            }
        };

        let mut new_leadership = current.with_leader(elected.leader, elected.isr);
        if elected.unclean {
            new_leadership.leader_recovery_state = LeaderRecoveryState::Recovering;
            warn!(
                "unclean election moved {} to replica {}; records may be lost",
                tp, elected.leader
            );
        }
        let committed = self
            .commit_leadership(tp, new_leadership)
            .await
            .map_err(|e| BrokerError::UnknownServerError(e.to_string()))?;
        info!(
            "{} elected leader {} at epoch {}",
            tp, committed.leader, committed.leader_epoch
        );
        // a draining broker must not come back as a follower, or it would
        // catch up and re-enter the ISR it just left
        let recipients: Vec<i32> = match strategy {
            ElectionStrategy::ControlledShutdown => self
                .ctx
                .partition_replicas(tp)
                .into_iter()
                .filter(|r| !self.ctx.shutting_down_brokers().contains(r))
                .collect(),
            _ => self.ctx.partition_replicas(tp),
        };
        self.add_leader_and_isr_to_batch(tp, &recipients, false);
        Ok(committed)
    }
}
