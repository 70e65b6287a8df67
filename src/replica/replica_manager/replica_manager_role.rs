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

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::message::{TopicPartition, EPOCH_DURING_DELETE, NO_EPOCH, NO_LEADER};
use crate::replica::Partition;
use crate::request::{
    LeaderAndIsrPartitionState, LeaderAndIsrRequest, LeaderAndIsrResponse, StopReplicaRequest,
    StopReplicaResponse,
};
use crate::{AppError, BrokerError};

use super::{HostedPartition, ReplicaManager};

/// Leadership changes this broker computed from a metadata-log delta. The
/// same make-leader / make-follower primitives apply it; only the entry
/// point differs from the RPC path.
#[derive(Debug, Clone, Default)]
pub struct MetadataDelta {
    pub controller_epoch: i32,
    pub topic_ids: HashMap<String, Uuid>,
    pub leaders: Vec<LeaderAndIsrPartitionState>,
    pub followers: Vec<LeaderAndIsrPartitionState>,
    pub deleted: Vec<TopicPartition>,
}

impl ReplicaManager {
    /// Apply a LeaderAndIsr control message: create any missing partitions,
    /// split them into to-be-leaders and to-be-followers, transition each,
    /// and reconfigure the fetcher pool.
    pub async fn become_leader_or_follower(
        self: &Arc<Self>,
        request: LeaderAndIsrRequest,
    ) -> LeaderAndIsrResponse {
        let _guard = self.state_change_lock.lock().await;
        let mut response = LeaderAndIsrResponse::default();

        if request.controller_epoch < self.controller_epoch.load() {
            warn!(
                "broker {} ignoring LeaderAndIsr from controller {} with stale epoch {} (current {})",
                self.broker_id, request.controller_id, request.controller_epoch,
                self.controller_epoch.load()
            );
            response.error = Some(BrokerError::StaleControllerEpoch(format!(
                "epoch {} < {}",
                request.controller_epoch,
                self.controller_epoch.load()
            )));
            return response;
        }
        self.controller_epoch.store(request.controller_epoch);

        let checkpoints = self.recovered_hw_checkpoints.lock().clone();
        let mut to_leader: Vec<(LeaderAndIsrPartitionState, Arc<Partition>)> = Vec::new();
        let mut to_follower: Vec<(LeaderAndIsrPartitionState, Arc<Partition>)> = Vec::new();

        for ps in request.partition_states {
            let tp = ps.topic_partition.clone();
            match self.get_or_create_partition(&tp, ps.is_new).await {
                Ok(partition) => {
                    if ps.leader == self.broker_id {
                        to_leader.push((ps, partition));
                    } else {
                        to_follower.push((ps, partition));
                    }
                }
                Err(e) => {
                    response.partition_errors.insert(tp, Some(e));
                }
            }
        }

        // leaders first so a broker taking over leadership serves produce
        // before its old fetcher state is torn down
        let leader_partitions: HashSet<TopicPartition> = to_leader
            .iter()
            .map(|(ps, _)| ps.topic_partition.clone())
            .collect();
        self.fetcher_pool
            .remove_fetchers_for_partitions(&leader_partitions)
            .await;
        for (ps, partition) in to_leader {
            let topic_id = request.topic_ids.get(ps.topic_partition.topic()).copied();
            let result = partition.make_leader(&ps, &checkpoints, topic_id).await;
            self.finish_transition(&mut response, &ps.topic_partition, result);
        }

        let mut changed_followers: HashMap<TopicPartition, (i32, Arc<Partition>)> = HashMap::new();
        for (ps, partition) in to_follower {
            let topic_id = request.topic_ids.get(ps.topic_partition.topic()).copied();
            let result = partition.make_follower(&ps, &checkpoints, topic_id).await;
            if matches!(result, Ok(true)) && ps.leader != NO_LEADER {
                changed_followers.insert(ps.topic_partition.clone(), (ps.leader, partition));
            }
            self.finish_transition(&mut response, &ps.topic_partition, result);
        }

        if !changed_followers.is_empty() {
            let changed_set: HashSet<TopicPartition> = changed_followers.keys().cloned().collect();
            self.fetcher_pool
                .remove_fetchers_for_partitions(&changed_set)
                .await;
            self.fetcher_pool
                .add_fetchers_for_partitions(changed_followers)
                .await;
        }

        info!(
            "broker {} applied LeaderAndIsr at controller epoch {}",
            self.broker_id, request.controller_epoch
        );
        response
    }

    fn finish_transition(
        self: &Arc<Self>,
        response: &mut LeaderAndIsrResponse,
        topic_partition: &TopicPartition,
        result: Result<bool, AppError>,
    ) {
        match result {
            Ok(changed) => {
                response
                    .partition_errors
                    .insert(topic_partition.clone(), None);
                if changed {
                    // waiters fenced by the old role resolve now
                    self.complete_delayed_requests(topic_partition.to_string(), true);
                    let rm = self.clone();
                    let key = topic_partition.to_string();
                    tokio::spawn(async move {
                        rm.elect_leader_purgatory.check_and_complete(&key).await;
                    });
                }
            }
            Err(e) => {
                response
                    .partition_errors
                    .insert(topic_partition.clone(), Some(e.into()));
            }
        }
    }

    async fn get_or_create_partition(
        self: &Arc<Self>,
        topic_partition: &TopicPartition,
        is_new: bool,
    ) -> Result<Arc<Partition>, BrokerError> {
        if let Some(hosted) = self.hosted_partitions.get(topic_partition) {
            return match hosted.value() {
                HostedPartition::Online(partition) => Ok(partition.clone()),
                HostedPartition::Offline => {
                    Err(BrokerError::StorageError(topic_partition.to_string()))
                }
            };
        }
        let log = self
            .log_manager
            .get_or_create_log(topic_partition, is_new)
            .await
            .map_err(BrokerError::from)?;
        let partition = Arc::new(Partition::new(
            topic_partition.clone(),
            self.broker_id,
            log,
            self.metastore.clone(),
            self.config.replica_lag_time_max_ms,
            self.config.min_insync_replicas,
        ));
        self.hosted_partitions.insert(
            topic_partition.clone(),
            HostedPartition::Online(partition.clone()),
        );
        Ok(partition)
    }

    /// Stop hosting the given partitions: fetchers first, then the map, then
    /// (optionally) the logs. Waiters parked on them complete with
    /// unknown-partition errors.
    pub async fn stop_replica(
        self: &Arc<Self>,
        request: StopReplicaRequest,
    ) -> StopReplicaResponse {
        let _guard = self.state_change_lock.lock().await;
        let mut response = StopReplicaResponse::default();

        if request.controller_epoch < self.controller_epoch.load() {
            response.error = Some(BrokerError::StaleControllerEpoch(format!(
                "epoch {} < {}",
                request.controller_epoch,
                self.controller_epoch.load()
            )));
            return response;
        }
        self.controller_epoch.store(request.controller_epoch);

        let mut stopped: Vec<TopicPartition> = Vec::new();
        let mut deletes: Vec<TopicPartition> = Vec::new();
        for ps in &request.partition_states {
            let tp = &ps.topic_partition;
            if let Ok(partition) = self.online_partition(tp) {
                let current_epoch = partition.leader_epoch().await;
                let fenced = ps.leader_epoch != NO_EPOCH
                    && ps.leader_epoch != EPOCH_DURING_DELETE
                    && ps.leader_epoch < current_epoch;
                if fenced {
                    response.partition_errors.insert(
                        tp.clone(),
                        Some(BrokerError::FencedLeaderEpoch(format!(
                            "stop-replica epoch {} < current {}",
                            ps.leader_epoch, current_epoch
                        ))),
                    );
                    continue;
                }
            }
            stopped.push(tp.clone());
            if ps.delete_partition {
                deletes.push(tp.clone());
            }
            response.partition_errors.insert(tp.clone(), None);
        }

        let stopped_set: HashSet<TopicPartition> = stopped.iter().cloned().collect();
        self.fetcher_pool
            .remove_fetchers_for_partitions(&stopped_set)
            .await;
        self.future_fetcher_pool
            .remove_fetchers_for_partitions(&stopped_set)
            .await;
        let delete_set: HashSet<&TopicPartition> = deletes.iter().collect();
        for tp in &stopped {
            // an Offline marker is sticky until the directory is restored
            // and the broker restarts; only a delete clears it
            let keep_offline = !delete_set.contains(tp)
                && matches!(
                    self.hosted_partition(tp),
                    Some(HostedPartition::Offline)
                );
            if !keep_offline {
                self.hosted_partitions.remove(tp);
            }
        }
        // log deletion is asynchronous and batched behind the log manager
        for tp in &deletes {
            if let Err(e) = self.log_manager.remove_log(tp).await {
                warn!("failed to schedule log deletion for {}: {}", tp, e);
                response
                    .partition_errors
                    .insert(tp.clone(), Some(BrokerError::from(e)));
            }
        }

        for tp in &stopped {
            let key = tp.to_string();
            self.produce_purgatory.check_and_complete(&key).await;
            self.fetch_purgatory.check_and_complete(&key).await;
            self.delete_records_purgatory.check_and_complete(&key).await;
        }

        info!(
            "broker {} stopped {} replicas ({} deleted)",
            self.broker_id,
            stopped.len(),
            deletes.len()
        );
        response
    }

    /// Event-log variant of the control path: apply removals first, then
    /// leaders, then followers, reusing the RPC primitives.
    pub async fn apply_metadata_delta(self: &Arc<Self>, delta: MetadataDelta) {
        if !delta.deleted.is_empty() {
            let stop = StopReplicaRequest {
                controller_id: -1,
                controller_epoch: delta.controller_epoch,
                broker_epoch: self.broker_epoch.load(),
                partition_states: delta
                    .deleted
                    .iter()
                    .map(|tp| crate::request::StopReplicaPartitionState {
                        topic_partition: tp.clone(),
                        leader_epoch: NO_EPOCH,
                        delete_partition: true,
                    })
                    .collect(),
            };
            self.stop_replica(stop).await;
        }

        if delta.leaders.is_empty() && delta.followers.is_empty() {
            return;
        }
        let request = LeaderAndIsrRequest {
            controller_id: -1,
            controller_epoch: delta.controller_epoch,
            broker_epoch: self.broker_epoch.load(),
            partition_states: delta
                .leaders
                .into_iter()
                .chain(delta.followers.into_iter())
                .collect(),
            topic_ids: delta.topic_ids,
        };
        self.become_leader_or_follower(request).await;
    }
}
