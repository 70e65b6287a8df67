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

use serde::{Deserialize, Serialize};

/// Sentinel leader id for "no leader elected".
pub const NO_LEADER: i32 = -1;
/// Sentinel leader epoch carried by control messages that skip epoch fencing.
pub const NO_EPOCH: i32 = -1;
/// Sentinel leader epoch used while the topic is being deleted. Also skips
/// epoch fencing on StopReplica.
pub const EPOCH_DURING_DELETE: i32 = -2;
pub const INITIAL_LEADER_EPOCH: i32 = 0;
pub const INITIAL_PARTITION_EPOCH: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaderRecoveryState {
    Recovered,
    /// Set when an unclean election promoted a replica that may be missing
    /// committed records; the leader must finish recovery before the ISR can
    /// grow past itself.
    Recovering,
}

/// Leadership snapshot of one partition as committed to the metadata store.
/// The partition epoch is the CAS token for every leader/ISR update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderAndIsr {
    pub leader: i32,
    pub leader_epoch: i32,
    pub isr: Vec<i32>,
    pub partition_epoch: i32,
    pub leader_recovery_state: LeaderRecoveryState,
}

impl LeaderAndIsr {
    pub fn new(leader: i32, leader_epoch: i32, isr: Vec<i32>, partition_epoch: i32) -> Self {
        Self {
            leader,
            leader_epoch,
            isr,
            partition_epoch,
            leader_recovery_state: LeaderRecoveryState::Recovered,
        }
    }

    pub fn initial(leader: i32, isr: Vec<i32>) -> Self {
        Self::new(leader, INITIAL_LEADER_EPOCH, isr, INITIAL_PARTITION_EPOCH)
    }

    pub fn has_leader(&self) -> bool {
        self.leader != NO_LEADER
    }

    /// New snapshot with a bumped leader epoch, same leader and ISR. Used by
    /// the coordinator when fencing in-flight writers during reassignment.
    pub fn new_epoch(&self) -> Self {
        let mut next = self.clone();
        next.leader_epoch += 1;
        next
    }

    pub fn with_leader(&self, leader: i32, isr: Vec<i32>) -> Self {
        Self {
            leader,
            leader_epoch: self.leader_epoch + 1,
            isr,
            partition_epoch: self.partition_epoch,
            leader_recovery_state: LeaderRecoveryState::Recovered,
        }
    }
}

/// The replica set of a partition, including any in-flight reassignment.
///
/// `adding` and `removing` are both subsets of `replicas`; the assignment is
/// reassigning iff either is non-empty. `origin` is the pre-reassignment set
/// and `target` the post-reassignment set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaAssignment {
    pub replicas: Vec<i32>,
    pub adding_replicas: Vec<i32>,
    pub removing_replicas: Vec<i32>,
}

impl ReplicaAssignment {
    pub fn new(replicas: Vec<i32>) -> Self {
        Self {
            replicas,
            adding_replicas: Vec::new(),
            removing_replicas: Vec::new(),
        }
    }

    pub fn with_reassignment(
        replicas: Vec<i32>,
        adding_replicas: Vec<i32>,
        removing_replicas: Vec<i32>,
    ) -> Self {
        Self {
            replicas,
            adding_replicas,
            removing_replicas,
        }
    }

    pub fn is_being_reassigned(&self) -> bool {
        !self.adding_replicas.is_empty() || !self.removing_replicas.is_empty()
    }

    /// `replicas \ adding`: the replica set before the reassignment started.
    pub fn origin_replicas(&self) -> Vec<i32> {
        self.replicas
            .iter()
            .filter(|r| !self.adding_replicas.contains(r))
            .copied()
            .collect()
    }

    /// `replicas \ removing`: the replica set the reassignment converges to.
    pub fn target_replicas(&self) -> Vec<i32> {
        self.replicas
            .iter()
            .filter(|r| !self.removing_replicas.contains(r))
            .copied()
            .collect()
    }

    pub fn is_valid(&self) -> bool {
        if self.replicas.is_empty() {
            return false;
        }
        self.adding_replicas.iter().all(|r| self.replicas.contains(r))
            && self.removing_replicas.iter().all(|r| self.replicas.contains(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_and_target_sets() {
        let assignment = ReplicaAssignment::with_reassignment(
            vec![1, 2, 3, 4, 5, 6],
            vec![4, 5, 6],
            vec![1, 2, 3],
        );
        assert!(assignment.is_being_reassigned());
        assert!(assignment.is_valid());
        assert_eq!(assignment.origin_replicas(), vec![1, 2, 3]);
        assert_eq!(assignment.target_replicas(), vec![4, 5, 6]);
    }

    #[test]
    fn test_plain_assignment_is_not_reassigning() {
        let assignment = ReplicaAssignment::new(vec![1, 2, 3]);
        assert!(!assignment.is_being_reassigned());
        assert_eq!(assignment.origin_replicas(), vec![1, 2, 3]);
        assert_eq!(assignment.target_replicas(), vec![1, 2, 3]);
    }

    #[test]
    fn test_adding_outside_replicas_is_invalid() {
        let assignment =
            ReplicaAssignment::with_reassignment(vec![1, 2], vec![9], Vec::new());
        assert!(!assignment.is_valid());
    }

    #[test]
    fn test_epoch_bump() {
        let lisr = LeaderAndIsr::new(1, 4, vec![1, 2, 3], 9);
        let next = lisr.new_epoch();
        assert_eq!(next.leader_epoch, 5);
        assert_eq!(next.partition_epoch, 9);
        assert_eq!(next.leader, 1);
    }
}
