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

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::message::TopicPartition;
use crate::replica::{DelayedElectLeader, DelayedFetch, HwChange, ReplicaView};
use crate::request::{
    EpochEndOffsetResult, FetchParams, FetchPartitionData, FetchPartitionResult,
};
use crate::BrokerError;

use super::ReplicaManager;

impl ReplicaManager {
    /// Serve a fetch. The receiver fires immediately when the request can be
    /// answered now (enough bytes, an error, a diverging epoch, a read
    /// replica redirect, or a non-positive wait); otherwise the fetch parks
    /// in the purgatory until data arrives or the wait expires.
    pub async fn fetch_records(
        self: &Arc<Self>,
        params: FetchParams,
        fetch_data: BTreeMap<TopicPartition, FetchPartitionData>,
    ) -> oneshot::Receiver<BTreeMap<TopicPartition, FetchPartitionResult>> {
        let (tx, rx) = oneshot::channel();

        let update_fetch_state = params.is_from_follower();
        let results = self
            .read_from_local_log(&params, &fetch_data, update_fetch_state)
            .await;

        let accumulated: usize = results.values().map(|r| r.records.size_in_bytes()).sum();
        let has_error = results.values().any(|r| r.error.is_some());
        let has_divergence = results.values().any(|r| r.diverging_epoch.is_some());
        let has_redirect = results
            .values()
            .any(|r| r.preferred_read_replica.is_some());

        if params.max_wait_ms <= 0
            || fetch_data.is_empty()
            || accumulated >= params.min_bytes as usize
            || has_error
            || has_divergence
            || has_redirect
        {
            let _ = tx.send(results);
            return rx;
        }

        let watch_keys: Vec<String> = fetch_data.keys().map(|tp| tp.to_string()).collect();
        let delayed = DelayedFetch::new(self.clone(), params, fetch_data, tx);
        self.fetch_purgatory
            .try_complete_else_watch(delayed, watch_keys)
            .await;
        rx
    }

    /// One pass over the local logs. Per-partition failures land in their
    /// response slot; this never fails as a whole.
    pub(crate) async fn read_from_local_log(
        self: &Arc<Self>,
        params: &FetchParams,
        fetch_data: &BTreeMap<TopicPartition, FetchPartitionData>,
        update_fetch_state: bool,
    ) -> BTreeMap<TopicPartition, FetchPartitionResult> {
        let mut results = BTreeMap::new();
        for (tp, data) in fetch_data {
            let partition = match self.online_partition(tp) {
                Ok(partition) => partition,
                Err(e) => {
                    results.insert(tp.clone(), FetchPartitionResult::error(e));
                    continue;
                }
            };

            if let Some(replica_id) = self
                .find_preferred_read_replica(&partition, params, data)
                .await
            {
                results.insert(
                    tp.clone(),
                    FetchPartitionResult::redirect(
                        replica_id,
                        partition.high_watermark(),
                        partition.log_start_offset(),
                        partition.log_end_offset(),
                    ),
                );
                continue;
            }

            match partition
                .fetch_records(
                    params,
                    data,
                    data.partition_max_bytes,
                    true,
                    update_fetch_state,
                )
                .await
            {
                Ok((result, hw_change)) => {
                    if update_fetch_state && hw_change != HwChange::None {
                        self.complete_delayed_requests(
                            tp.to_string(),
                            hw_change == HwChange::Increased,
                        );
                    }
                    results.insert(tp.clone(), result);
                }
                Err(e) => {
                    results.insert(tp.clone(), FetchPartitionResult::error(e.into()));
                }
            }
        }
        results
    }

    /// A consumer fetch on the leader may be redirected to a closer in-sync
    /// follower. Candidates must cover the fetch offset; follower fetches
    /// are never redirected.
    async fn find_preferred_read_replica(
        &self,
        partition: &Arc<crate::replica::Partition>,
        params: &FetchParams,
        data: &FetchPartitionData,
    ) -> Option<i32> {
        if !params.is_from_consumer() {
            return None;
        }
        let client_metadata = params.client_metadata.as_ref()?;
        let selector = self.replica_selector.as_ref()?;
        if !partition.is_leader().await {
            return None;
        }
        let candidates: Vec<ReplicaView> = partition
            .isr_follower_views()
            .await
            .into_iter()
            .filter(|(_, log_start, log_end)| {
                *log_start <= data.fetch_offset && data.fetch_offset <= *log_end
            })
            .map(|(broker_id, log_start_offset, log_end_offset)| ReplicaView {
                broker_id,
                log_start_offset,
                log_end_offset,
            })
            .collect();
        selector
            .select(partition.topic_partition(), client_metadata, &candidates)
            .filter(|id| *id != self.broker_id)
    }

    /// Epoch-based end-offset lookup for each partition, serving follower
    /// truncation.
    pub async fn last_offset_for_leader_epoch(
        &self,
        partitions: BTreeMap<TopicPartition, (Option<i32>, i32)>,
    ) -> BTreeMap<TopicPartition, EpochEndOffsetResult> {
        let mut results = BTreeMap::new();
        for (tp, (current_leader_epoch, requested_epoch)) in partitions {
            let result = match self.online_partition(&tp) {
                Err(e) => EpochEndOffsetResult {
                    leader_epoch: -1,
                    end_offset: -1,
                    error: Some(e),
                },
                Ok(partition) => match partition
                    .last_offset_for_leader_epoch(current_leader_epoch, requested_epoch, true)
                    .await
                {
                    Ok(end) => EpochEndOffsetResult {
                        leader_epoch: end.leader_epoch,
                        end_offset: end.end_offset,
                        error: None,
                    },
                    Err(e) => EpochEndOffsetResult {
                        leader_epoch: -1,
                        end_offset: -1,
                        error: Some(e.into()),
                    },
                },
            };
            results.insert(tp, result);
        }
        results
    }

    /// Timestamp lookup against a leader partition.
    pub async fn fetch_offset_for_timestamp(
        &self,
        topic_partition: &TopicPartition,
        timestamp: i64,
        current_leader_epoch: Option<i32>,
    ) -> Result<Option<i64>, BrokerError> {
        let partition = self.online_partition(topic_partition)?;
        partition
            .fetch_offset_for_timestamp(timestamp, current_leader_epoch, true)
            .await
            .map_err(BrokerError::from)
    }

    /// Park until the metadata store shows `expected` as each partition's
    /// leader, or the wait expires. Used by admin-triggered elections.
    pub async fn await_elected_leaders(
        self: &Arc<Self>,
        timeout_ms: u64,
        expected_leaders: BTreeMap<TopicPartition, i32>,
    ) -> oneshot::Receiver<BTreeMap<TopicPartition, Option<BrokerError>>> {
        let (tx, rx) = oneshot::channel();
        let watch_keys: Vec<String> = expected_leaders.keys().map(|tp| tp.to_string()).collect();
        let delayed = DelayedElectLeader::new(
            self.metastore.clone(),
            timeout_ms,
            expected_leaders,
            tx,
        );
        self.elect_leader_purgatory
            .try_complete_else_watch(delayed, watch_keys)
            .await;
        rx
    }
}
