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

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{Display, Formatter};

use uuid::Uuid;

use crate::message::{LeaderAndIsr, ReplicaAssignment, TopicPartition, NO_LEADER};
use crate::metastore::BrokerRegistration;

/// Lifecycle state of a partition as tracked by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionState {
    NonExistent,
    New,
    Online,
    Offline,
}

/// Lifecycle state of one replica of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaState {
    NonExistent,
    New,
    Online,
    Offline,
    ReplicaDeletionStarted,
    ReplicaDeletionSuccessful,
    ReplicaDeletionIneligible,
}

/// One replica of a partition, identified by its hosting broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionReplica {
    pub topic_partition: TopicPartition,
    pub broker_id: i32,
}

impl PartitionReplica {
    pub fn new(topic_partition: TopicPartition, broker_id: i32) -> Self {
        Self {
            topic_partition,
            broker_id,
        }
    }
}

impl Display for PartitionReplica {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.topic_partition, self.broker_id)
    }
}

/// The coordinator's in-memory cluster view. Owned exclusively by the
/// event-processing task; there are no synchronized accessors because there
/// is no second thread. Cleared wholesale on resignation.
#[derive(Debug, Default)]
pub struct ControllerContext {
    live_brokers: HashMap<i32, BrokerRegistration>,
    shutting_down_brokers: HashSet<i32>,
    all_topics: HashSet<String>,
    topic_ids: HashMap<String, Uuid>,
    topic_names_by_id: HashMap<Uuid, String>,
    partition_assignments: HashMap<String, BTreeMap<i32, ReplicaAssignment>>,
    partition_leadership: HashMap<TopicPartition, LeaderAndIsr>,
    partitions_being_reassigned: HashSet<TopicPartition>,
    partition_states: HashMap<TopicPartition, PartitionState>,
    replica_states: HashMap<PartitionReplica, ReplicaState>,
    topics_to_be_deleted: HashSet<String>,
    topics_ineligible_for_deletion: HashSet<String>,
    topics_with_deletion_started: HashSet<String>,
}

impl ControllerContext {
    pub fn clear(&mut self) {
        *self = ControllerContext::default();
    }

    // ---- brokers ----

    pub fn set_live_brokers(&mut self, brokers: Vec<BrokerRegistration>) {
        self.live_brokers = brokers.into_iter().map(|b| (b.id, b)).collect();
    }

    pub fn add_live_broker(&mut self, broker: BrokerRegistration) {
        self.live_brokers.insert(broker.id, broker);
    }

    pub fn remove_live_broker(&mut self, broker_id: i32) {
        self.live_brokers.remove(&broker_id);
    }

    pub fn live_broker_ids(&self) -> HashSet<i32> {
        self.live_brokers.keys().copied().collect()
    }

    pub fn live_brokers(&self) -> Vec<BrokerRegistration> {
        let mut brokers: Vec<_> = self.live_brokers.values().cloned().collect();
        brokers.sort_by_key(|b| b.id);
        brokers
    }

    pub fn is_broker_live(&self, broker_id: i32) -> bool {
        self.live_brokers.contains_key(&broker_id)
    }

    pub fn broker_epoch(&self, broker_id: i32) -> Option<i64> {
        self.live_brokers.get(&broker_id).map(|b| b.epoch)
    }

    pub fn mark_shutting_down(&mut self, broker_id: i32) {
        self.shutting_down_brokers.insert(broker_id);
    }

    pub fn clear_shutting_down(&mut self, broker_id: i32) {
        self.shutting_down_brokers.remove(&broker_id);
    }

    pub fn shutting_down_brokers(&self) -> &HashSet<i32> {
        &self.shutting_down_brokers
    }

    /// Brokers eligible to lead: live and not shutting down.
    pub fn leadable_brokers(&self) -> HashSet<i32> {
        self.live_brokers
            .keys()
            .filter(|id| !self.shutting_down_brokers.contains(id))
            .copied()
            .collect()
    }

    // ---- topics ----

    pub fn add_topic(&mut self, topic: &str, topic_id: Uuid) {
        self.all_topics.insert(topic.to_string());
        self.topic_ids.insert(topic.to_string(), topic_id);
        self.topic_names_by_id.insert(topic_id, topic.to_string());
    }

    pub fn remove_topic(&mut self, topic: &str) {
        self.all_topics.remove(topic);
        if let Some(id) = self.topic_ids.remove(topic) {
            self.topic_names_by_id.remove(&id);
        }
        self.partition_assignments.remove(topic);
        self.partition_leadership.retain(|tp, _| tp.topic() != topic);
        self.partition_states.retain(|tp, _| tp.topic() != topic);
        self.replica_states
            .retain(|replica, _| replica.topic_partition.topic() != topic);
        self.partitions_being_reassigned
            .retain(|tp| tp.topic() != topic);
        self.topics_to_be_deleted.remove(topic);
        self.topics_ineligible_for_deletion.remove(topic);
        self.topics_with_deletion_started.remove(topic);
    }

    pub fn all_topics(&self) -> &HashSet<String> {
        &self.all_topics
    }

    pub fn topic_id(&self, topic: &str) -> Option<Uuid> {
        self.topic_ids.get(topic).copied()
    }

    pub fn topic_ids(&self) -> &HashMap<String, Uuid> {
        &self.topic_ids
    }

    pub fn topic_name(&self, topic_id: Uuid) -> Option<&String> {
        self.topic_names_by_id.get(&topic_id)
    }

    // ---- assignments ----

    pub fn set_partition_assignment(
        &mut self,
        topic_partition: &TopicPartition,
        assignment: ReplicaAssignment,
    ) {
        self.partition_assignments
            .entry(topic_partition.topic().to_string())
            .or_default()
            .insert(topic_partition.partition(), assignment);
    }

    pub fn partition_assignment(
        &self,
        topic_partition: &TopicPartition,
    ) -> Option<&ReplicaAssignment> {
        self.partition_assignments
            .get(topic_partition.topic())
            .and_then(|m| m.get(&topic_partition.partition()))
    }

    pub fn partition_replicas(&self, topic_partition: &TopicPartition) -> Vec<i32> {
        self.partition_assignment(topic_partition)
            .map(|a| a.replicas.clone())
            .unwrap_or_default()
    }

    pub fn partitions_for_topic(&self, topic: &str) -> Vec<TopicPartition> {
        self.partition_assignments
            .get(topic)
            .map(|m| {
                m.keys()
                    .map(|p| TopicPartition::new(topic, *p))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn topic_assignment(&self, topic: &str) -> Option<&BTreeMap<i32, ReplicaAssignment>> {
        self.partition_assignments.get(topic)
    }

    pub fn all_partitions(&self) -> Vec<TopicPartition> {
        self.partition_assignments
            .iter()
            .flat_map(|(topic, m)| {
                m.keys().map(move |p| TopicPartition::new(topic.clone(), *p))
            })
            .collect()
    }

    pub fn replicas_on_broker(&self, broker_id: i32) -> Vec<TopicPartition> {
        self.partition_assignments
            .iter()
            .flat_map(|(topic, m)| {
                m.iter()
                    .filter(|(_, a)| a.replicas.contains(&broker_id))
                    .map(move |(p, _)| TopicPartition::new(topic.clone(), *p))
            })
            .collect()
    }

    // ---- leadership ----

    pub fn put_leadership(&mut self, topic_partition: TopicPartition, leadership: LeaderAndIsr) {
        self.partition_leadership.insert(topic_partition, leadership);
    }

    pub fn leadership(&self, topic_partition: &TopicPartition) -> Option<&LeaderAndIsr> {
        self.partition_leadership.get(topic_partition)
    }

    pub fn partitions_led_by(&self, broker_id: i32) -> Vec<TopicPartition> {
        self.partition_leadership
            .iter()
            .filter(|(_, l)| l.leader == broker_id)
            .map(|(tp, _)| tp.clone())
            .collect()
    }

    // ---- reassignment ----

    pub fn mark_reassigning(&mut self, topic_partition: TopicPartition) {
        self.partitions_being_reassigned.insert(topic_partition);
    }

    pub fn clear_reassigning(&mut self, topic_partition: &TopicPartition) {
        self.partitions_being_reassigned.remove(topic_partition);
    }

    pub fn is_reassigning(&self, topic_partition: &TopicPartition) -> bool {
        self.partitions_being_reassigned.contains(topic_partition)
    }

    pub fn partitions_being_reassigned(&self) -> Vec<TopicPartition> {
        self.partitions_being_reassigned.iter().cloned().collect()
    }

    pub fn is_topic_reassigning(&self, topic: &str) -> bool {
        self.partitions_being_reassigned
            .iter()
            .any(|tp| tp.topic() == topic)
    }

    // ---- state machines ----

    pub fn partition_state(&self, topic_partition: &TopicPartition) -> PartitionState {
        self.partition_states
            .get(topic_partition)
            .copied()
            .unwrap_or(PartitionState::NonExistent)
    }

    pub fn put_partition_state(
        &mut self,
        topic_partition: TopicPartition,
        state: PartitionState,
    ) {
        if state == PartitionState::NonExistent {
            self.partition_states.remove(&topic_partition);
        } else {
            self.partition_states.insert(topic_partition, state);
        }
    }

    pub fn partitions_in_state(&self, state: PartitionState) -> Vec<TopicPartition> {
        self.partition_states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(tp, _)| tp.clone())
            .collect()
    }

    pub fn offline_partition_count(&self) -> usize {
        self.partition_states
            .values()
            .filter(|s| **s == PartitionState::Offline)
            .count()
    }

    pub fn replica_state(&self, replica: &PartitionReplica) -> ReplicaState {
        self.replica_states
            .get(replica)
            .copied()
            .unwrap_or(ReplicaState::NonExistent)
    }

    pub fn put_replica_state(&mut self, replica: PartitionReplica, state: ReplicaState) {
        if state == ReplicaState::NonExistent {
            self.replica_states.remove(&replica);
        } else {
            self.replica_states.insert(replica, state);
        }
    }

    pub fn replicas_in_state(&self, topic: &str, state: ReplicaState) -> Vec<PartitionReplica> {
        self.replica_states
            .iter()
            .filter(|(r, s)| r.topic_partition.topic() == topic && **s == state)
            .map(|(r, _)| r.clone())
            .collect()
    }

    /// A partition is fully deleted once every replica reached
    /// `ReplicaDeletionSuccessful`.
    pub fn are_all_replicas_deleted(&self, topic: &str) -> bool {
        self.partition_assignments
            .get(topic)
            .map(|m| {
                m.iter().all(|(p, a)| {
                    a.replicas.iter().all(|r| {
                        self.replica_state(&PartitionReplica::new(
                            TopicPartition::new(topic, *p),
                            *r,
                        )) == ReplicaState::ReplicaDeletionSuccessful
                    })
                })
            })
            .unwrap_or(true)
    }

    // ---- deletion bookkeeping ----

    pub fn queue_topic_for_deletion(&mut self, topic: String) {
        self.topics_to_be_deleted.insert(topic);
    }

    pub fn topics_to_be_deleted(&self) -> &HashSet<String> {
        &self.topics_to_be_deleted
    }

    pub fn is_topic_queued_for_deletion(&self, topic: &str) -> bool {
        self.topics_to_be_deleted.contains(topic)
    }

    pub fn mark_topic_ineligible_for_deletion(&mut self, topic: String) {
        self.topics_ineligible_for_deletion.insert(topic);
    }

    pub fn clear_topic_ineligible_for_deletion(&mut self, topic: &str) {
        self.topics_ineligible_for_deletion.remove(topic);
    }

    pub fn is_topic_deletion_eligible(&self, topic: &str) -> bool {
        self.topics_to_be_deleted.contains(topic)
            && !self.topics_ineligible_for_deletion.contains(topic)
    }

    pub fn mark_topic_deletion_started(&mut self, topic: String) {
        self.topics_with_deletion_started.insert(topic);
    }

    pub fn is_topic_deletion_started(&self, topic: &str) -> bool {
        self.topics_with_deletion_started.contains(topic)
    }

    // ---- balance ----

    /// Partitions whose current leader is not the preferred (first assigned)
    /// replica, grouped under the preferred broker.
    pub fn preferred_replica_imbalance(&self) -> HashMap<i32, Vec<TopicPartition>> {
        let mut imbalanced: HashMap<i32, Vec<TopicPartition>> = HashMap::new();
        for tp in self.all_partitions() {
            let Some(assignment) = self.partition_assignment(&tp) else {
                continue;
            };
            let Some(preferred) = assignment.replicas.first().copied() else {
                continue;
            };
            let Some(leadership) = self.leadership(&tp) else {
                continue;
            };
            if leadership.leader != NO_LEADER && leadership.leader != preferred {
                imbalanced.entry(preferred).or_default().push(tp);
            }
        }
        imbalanced
    }

    /// Total partition count for which `broker_id` is the preferred replica.
    pub fn preferred_partition_count(&self, broker_id: i32) -> usize {
        self.all_partitions()
            .iter()
            .filter(|tp| {
                self.partition_assignment(tp)
                    .and_then(|a| a.replicas.first().copied())
                    == Some(broker_id)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(id: i32) -> BrokerRegistration {
        BrokerRegistration {
            id,
            epoch: id as i64,
            host: "localhost".into(),
            port: 9092,
            rack: None,
        }
    }

    #[test]
    fn test_leadable_excludes_shutting_down() {
        let mut ctx = ControllerContext::default();
        ctx.set_live_brokers(vec![registration(1), registration(2)]);
        ctx.mark_shutting_down(2);
        assert_eq!(ctx.leadable_brokers(), HashSet::from([1]));
    }

    #[test]
    fn test_remove_topic_clears_every_index() {
        let mut ctx = ControllerContext::default();
        let topic_id = Uuid::new_v4();
        ctx.add_topic("t", topic_id);
        let tp = TopicPartition::new("t", 0);
        ctx.set_partition_assignment(&tp, ReplicaAssignment::new(vec![1, 2]));
        ctx.put_leadership(tp.clone(), LeaderAndIsr::initial(1, vec![1, 2]));
        ctx.put_partition_state(tp.clone(), PartitionState::Online);
        ctx.put_replica_state(PartitionReplica::new(tp.clone(), 1), ReplicaState::Online);
        ctx.mark_reassigning(tp.clone());

        ctx.remove_topic("t");
        assert!(ctx.all_topics().is_empty());
        assert!(ctx.partition_assignment(&tp).is_none());
        assert!(ctx.leadership(&tp).is_none());
        assert_eq!(ctx.partition_state(&tp), PartitionState::NonExistent);
        assert!(!ctx.is_reassigning(&tp));
        assert!(ctx.topic_name(topic_id).is_none());
    }

    #[test]
    fn test_preferred_imbalance() {
        let mut ctx = ControllerContext::default();
        let tp0 = TopicPartition::new("t", 0);
        let tp1 = TopicPartition::new("t", 1);
        ctx.set_partition_assignment(&tp0, ReplicaAssignment::new(vec![1, 2]));
        ctx.set_partition_assignment(&tp1, ReplicaAssignment::new(vec![1, 3]));
        ctx.put_leadership(tp0.clone(), LeaderAndIsr::initial(2, vec![1, 2]));
        ctx.put_leadership(tp1.clone(), LeaderAndIsr::initial(1, vec![1, 3]));

        let imbalance = ctx.preferred_replica_imbalance();
        assert_eq!(imbalance[&1], vec![tp0]);
        assert_eq!(ctx.preferred_partition_count(1), 2);
    }
}
