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

use tracing::{info, warn};

use crate::AppResult;

use super::context::{PartitionReplica, PartitionState, ReplicaState};
use super::CoordinatorCore;

impl CoordinatorCore {
    /// Topics newly marked for deletion in the store enter the queue. A
    /// topic under reassignment is ineligible until the reassignment
    /// finishes; deletion can be disabled cluster-wide.
    pub(crate) async fn on_topic_deletion_requested(&mut self) -> AppResult<()> {
        for topic in self.metastore.topics_marked_for_deletion() {
            if self.ctx.is_topic_queued_for_deletion(&topic) {
                continue;
            }
            if !self.config.delete_topic_enable {
                warn!(
                    "ignoring deletion request for {}: topic deletion is disabled",
                    topic
                );
                continue;
            }
            info!("queueing topic {} for deletion", topic);
            self.ctx.queue_topic_for_deletion(topic.clone());
            if self.ctx.is_topic_reassigning(&topic) {
                info!("topic {} deletion blocked by an in-flight reassignment", topic);
                self.ctx.mark_topic_ineligible_for_deletion(topic);
            }
        }
        self.resume_deletions().await
    }

    /// Drive every eligible queued topic through replica deletion, and
    /// finish the ones whose replicas are all gone. Called whenever a
    /// blocker may have cleared: reassignment completion, broker return,
    /// ISR movement.
    pub(crate) async fn resume_deletions(&mut self) -> AppResult<()> {
        let queued: Vec<String> = self.ctx.topics_to_be_deleted().iter().cloned().collect();
        if queued.is_empty() {
            return Ok(());
        }
        for topic in queued {
            self.maybe_clear_ineligibility(&topic);
            if !self.ctx.is_topic_deletion_eligible(&topic) {
                continue;
            }
            if self.ctx.are_all_replicas_deleted(&topic)
                && self.ctx.is_topic_deletion_started(&topic)
            {
                self.complete_topic_deletion(&topic).await?;
                continue;
            }
            self.start_replica_deletion(&topic).await?;
            if self.ctx.are_all_replicas_deleted(&topic) {
                self.complete_topic_deletion(&topic).await?;
            }
        }
        Ok(())
    }

    /// Re-check the blockers that made a topic ineligible: a finished
    /// reassignment or a returned broker re-opens deletion.
    fn maybe_clear_ineligibility(&mut self, topic: &str) {
        if self.ctx.is_topic_deletion_eligible(topic) {
            return;
        }
        if self.ctx.is_topic_reassigning(topic) {
            return;
        }
        let blocked_on_dead_broker = self
            .ctx
            .replicas_in_state(topic, ReplicaState::ReplicaDeletionIneligible)
            .iter()
            .any(|r| !self.ctx.is_broker_live(r.broker_id));
        if blocked_on_dead_broker {
            return;
        }
        self.ctx.clear_topic_ineligible_for_deletion(topic);
    }

    /// Move the topic's partitions out of service and fire the deleting
    /// StopReplica at every live replica. Replicas on dead brokers make the
    /// topic ineligible until those brokers return.
    async fn start_replica_deletion(&mut self, topic: &str) -> AppResult<()> {
        self.ctx.mark_topic_deletion_started(topic.to_string());
        let partitions = self.ctx.partitions_for_topic(topic);
        self.batcher.new_batch()?;

        let online: Vec<_> = partitions
            .iter()
            .filter(|tp| {
                matches!(
                    self.ctx.partition_state(tp),
                    PartitionState::Online | PartitionState::New
                )
            })
            .cloned()
            .collect();
        self.partition_state_transition(online, PartitionState::Offline, None)
            .await?;

        let mut retriable = Vec::new();
        let mut ineligible = Vec::new();
        for tp in &partitions {
            for replica_id in self.ctx.partition_replicas(tp) {
                let replica = PartitionReplica::new(tp.clone(), replica_id);
                match self.ctx.replica_state(&replica) {
                    ReplicaState::ReplicaDeletionStarted
                    | ReplicaState::ReplicaDeletionSuccessful => {}
                    ReplicaState::ReplicaDeletionIneligible if self.ctx.is_broker_live(replica_id) => {
                        retriable.push(replica);
                    }
                    _ if self.ctx.is_broker_live(replica_id) => retriable.push(replica),
                    _ => ineligible.push(replica),
                }
            }
        }

        // live replicas: Offline (ISR shrink + fetcher stop) then the
        // deleting StopReplica
        self.replica_state_transition(retriable.clone(), ReplicaState::Offline)
            .await?;
        self.replica_state_transition(retriable, ReplicaState::ReplicaDeletionStarted)
            .await?;
        if !ineligible.is_empty() {
            info!(
                "topic {} has {} replicas on dead brokers, deletion will stall",
                topic,
                ineligible.len()
            );
            for replica in &ineligible {
                if self.ctx.replica_state(replica) == ReplicaState::Offline {
                    continue;
                }
                self.replica_state_transition(vec![replica.clone()], ReplicaState::Offline)
                    .await?;
            }
            self.ctx
                .mark_topic_ineligible_for_deletion(topic.to_string());
        }
        self.flush_batch().await?;
        Ok(())
    }

    /// Every replica confirmed deletion: drop the topic from the context,
    /// the state machines and the metadata store.
    async fn complete_topic_deletion(&mut self, topic: &str) -> AppResult<()> {
        info!("completing deletion of topic {}", topic);
        let partitions = self.ctx.partitions_for_topic(topic);
        for tp in &partitions {
            for replica_id in self.ctx.partition_replicas(tp) {
                self.ctx.put_replica_state(
                    PartitionReplica::new(tp.clone(), replica_id),
                    ReplicaState::NonExistent,
                );
            }
        }
        self.partition_state_transition(partitions, PartitionState::NonExistent, None)
            .await?;
        self.ctx.remove_topic(topic);
        self.metastore
            .finish_topic_deletion(topic, self.epoch)
            .await?;
        Ok(())
    }
}
