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
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use crate::message::{TopicData, TopicPartition};
use crate::replica::delayed_delete_records::DeleteRecordsPartitionStatus;
use crate::replica::delayed_produce::ProducePartitionStatus;
use crate::replica::{DelayedDeleteRecords, DelayedProduce, HwChange};
use crate::request::{
    DeleteRecordsPartitionResult, ProducePartitionResponse, RequiredAcks,
};
use crate::BrokerError;

use super::ReplicaManager;

const INTERNAL_TOPIC_PREFIX: &str = "__";

impl ReplicaManager {
    /// Append the produce payload to the leader replicas hosted here.
    ///
    /// The receiver fires immediately for acks 0/1; for acks=all it fires
    /// once every partition's HW passes the appended records, or the wait
    /// times out.
    pub async fn append_records(
        self: &Arc<Self>,
        timeout_ms: u64,
        required_acks: i16,
        internal_topics_allowed: bool,
        transactional_id: Option<String>,
        topics_data: Vec<TopicData>,
    ) -> oneshot::Receiver<BTreeMap<TopicPartition, ProducePartitionResponse>> {
        let (tx, rx) = oneshot::channel();

        let Some(acks) = RequiredAcks::from_i16(required_acks) else {
            let responses = topics_data
                .iter()
                .flat_map(|topic| {
                    topic.partition_data.iter().map(|p| {
                        let tp = TopicPartition::new(topic.topic_name.clone(), p.partition);
                        let response = ProducePartitionResponse::error(
                            p.partition,
                            BrokerError::InvalidRequiredAcks(format!(
                                "acks {} is not one of -1, 0, 1",
                                required_acks
                            )),
                        );
                        (tp, response)
                    })
                })
                .collect();
            let _ = tx.send(responses);
            return rx;
        };

        // Transactional entries must be verified with the transaction
        // coordinator before they may touch the log.
        let verified = self
            .verify_transactional_partitions(transactional_id.as_deref(), &topics_data)
            .await;

        let mut responses: BTreeMap<TopicPartition, ProducePartitionResponse> = BTreeMap::new();
        let mut produce_status: BTreeMap<TopicPartition, ProducePartitionStatus> = BTreeMap::new();

        for topic_data in topics_data {
            let internal = topic_data.topic_name.starts_with(INTERNAL_TOPIC_PREFIX);
            for partition_data in topic_data.partition_data {
                let tp =
                    TopicPartition::new(topic_data.topic_name.clone(), partition_data.partition);
                if internal && !internal_topics_allowed {
                    responses.insert(
                        tp.clone(),
                        ProducePartitionResponse::error(
                            partition_data.partition,
                            BrokerError::InvalidTopic(format!(
                                "cannot append to internal topic {}",
                                topic_data.topic_name
                            )),
                        ),
                    );
                    continue;
                }
                if let Some(verified) = &verified {
                    if !verified.contains(&tp) {
                        responses.insert(
                            tp.clone(),
                            ProducePartitionResponse::error(
                                partition_data.partition,
                                BrokerError::InvalidTxnState(format!(
                                    "partition {} has no verified ongoing transaction",
                                    tp
                                )),
                            ),
                        );
                        continue;
                    }
                }

                let partition = match self.online_partition(&tp) {
                    Ok(partition) => partition,
                    Err(e) => {
                        responses.insert(
                            tp.clone(),
                            ProducePartitionResponse::error(partition_data.partition, e),
                        );
                        continue;
                    }
                };

                match partition
                    .append_records_to_leader(
                        partition_data.message_set,
                        required_acks,
                        self.config.max_record_size,
                        self.config.max_batch_size,
                    )
                    .await
                {
                    Ok(append) => {
                        let response = ProducePartitionResponse::ok(
                            partition_data.partition,
                            append.info.first_offset,
                            append.info.log_append_time,
                            append.log_start_offset,
                        );
                        if acks == RequiredAcks::Full {
                            produce_status.insert(
                                tp.clone(),
                                ProducePartitionStatus::new(
                                    append.info.last_offset + 1,
                                    response.clone(),
                                ),
                            );
                        }
                        responses.insert(tp.clone(), response);
                        self.complete_delayed_requests(
                            tp.to_string(),
                            append.hw_change == HwChange::Increased,
                        );
                    }
                    Err(e) => {
                        responses.insert(
                            tp.clone(),
                            ProducePartitionResponse::error(partition_data.partition, e.into()),
                        );
                    }
                }
            }
        }

        if acks == RequiredAcks::Full && !produce_status.is_empty() {
            // merge the failed slots into the delayed op's final response
            let watch_keys: Vec<String> = produce_status.keys().map(|tp| tp.to_string()).collect();
            let failed: BTreeMap<TopicPartition, ProducePartitionResponse> = responses
                .iter()
                .filter(|(tp, _)| !produce_status.contains_key(*tp))
                .map(|(tp, r)| (tp.clone(), r.clone()))
                .collect();
            let (delayed_tx, delayed_rx) = oneshot::channel();
            let delayed = DelayedProduce::new(
                self.clone(),
                timeout_ms,
                produce_status,
                delayed_tx,
            );
            self.produce_purgatory
                .try_complete_else_watch(delayed, watch_keys)
                .await;
            tokio::spawn(async move {
                if let Ok(mut delayed_responses) = delayed_rx.await {
                    delayed_responses.extend(failed);
                    let _ = tx.send(delayed_responses);
                }
            });
        } else {
            let _ = tx.send(responses);
        }
        rx
    }

    async fn verify_transactional_partitions(
        &self,
        transactional_id: Option<&str>,
        topics_data: &[TopicData],
    ) -> Option<HashSet<TopicPartition>> {
        let transactional_id = transactional_id?;
        if !self.config.transaction_partition_verification_enable {
            return None;
        }
        let verifier = self.transaction_verifier.as_ref()?;
        let partitions: Vec<TopicPartition> = topics_data
            .iter()
            .flat_map(|t| {
                t.partition_data
                    .iter()
                    .map(|p| TopicPartition::new(t.topic_name.clone(), p.partition))
            })
            .collect();
        debug!(
            "verifying {} partitions for transaction {}",
            partitions.len(),
            transactional_id
        );
        Some(verifier.verify(transactional_id, partitions).await)
    }

    /// Truncate the head of the given leader partitions and answer once the
    /// low watermark has propagated through each ISR (or the wait expires).
    pub async fn delete_records(
        self: &Arc<Self>,
        timeout_ms: u64,
        offsets: BTreeMap<TopicPartition, i64>,
    ) -> oneshot::Receiver<BTreeMap<TopicPartition, DeleteRecordsPartitionResult>> {
        let (tx, rx) = oneshot::channel();
        let mut immediate: BTreeMap<TopicPartition, DeleteRecordsPartitionResult> = BTreeMap::new();
        let mut status: BTreeMap<TopicPartition, DeleteRecordsPartitionStatus> = BTreeMap::new();

        for (tp, offset) in offsets {
            match self.online_partition(&tp) {
                Err(e) => {
                    immediate.insert(
                        tp,
                        DeleteRecordsPartitionResult {
                            low_watermark: -1,
                            error: Some(e),
                        },
                    );
                }
                Ok(partition) => match partition.delete_records_on_leader(offset).await {
                    Ok(new_start) => {
                        status.insert(
                            tp,
                            DeleteRecordsPartitionStatus::new(new_start, new_start),
                        );
                    }
                    Err(e) => {
                        immediate.insert(
                            tp,
                            DeleteRecordsPartitionResult {
                                low_watermark: -1,
                                error: Some(e.into()),
                            },
                        );
                    }
                },
            }
        }

        if status.is_empty() {
            let _ = tx.send(immediate);
            return rx;
        }

        let watch_keys: Vec<String> = status.keys().map(|tp| tp.to_string()).collect();
        let (delayed_tx, delayed_rx) = oneshot::channel();
        let delayed = DelayedDeleteRecords::new(self.clone(), timeout_ms, status, delayed_tx);
        self.delete_records_purgatory
            .try_complete_else_watch(delayed, watch_keys)
            .await;
        tokio::spawn(async move {
            if let Ok(mut delayed_results) = delayed_rx.await {
                delayed_results.extend(immediate);
                let _ = tx.send(delayed_results);
            }
        });
        rx
    }
}
