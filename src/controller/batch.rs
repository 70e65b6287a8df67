use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::message::TopicPartition;
use crate::metastore::BrokerRegistration;
use crate::request::{
    ControlRpcSender, LeaderAndIsrPartitionState, LeaderAndIsrRequest, StopReplicaPartitionState,
    StopReplicaRequest, UpdateMetadataBroker, UpdateMetadataPartitionState, UpdateMetadataRequest,
};
use crate::{AppError, AppResult, BrokerError};

/// Outcome of one StopReplica partition on one broker, fed back to the
/// deletion state machine.
#[derive(Debug)]
pub struct StopReplicaOutcome {
    pub broker_id: i32,
    pub topic_partition: TopicPartition,
    pub deleted: bool,
    pub error: Option<BrokerError>,
}

/// Groups control messages per destination broker and sends each batch
/// exactly once for the coordinator epoch it was built under. Opening a new
/// batch while the previous one is unsent is a programmer error.
#[derive(Debug, Default)]
pub struct ControlBatcher {
    leader_and_isr: HashMap<i32, Vec<LeaderAndIsrPartitionState>>,
    stop_replica: HashMap<i32, Vec<StopReplicaPartitionState>>,
    update_metadata: HashMap<i32, Vec<UpdateMetadataPartitionState>>,
    open: bool,
}

impl ControlBatcher {
    pub fn new_batch(&mut self) -> AppResult<()> {
        if self.open && !self.is_empty() {
            return Err(AppError::IllegalState(
                "previous control batch was never sent".to_string(),
            ));
        }
        self.leader_and_isr.clear();
        self.stop_replica.clear();
        self.update_metadata.clear();
        self.open = true;
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.leader_and_isr.is_empty()
            && self.stop_replica.is_empty()
            && self.update_metadata.is_empty()
    }

    pub fn add_leader_and_isr(
        &mut self,
        brokers: &[i32],
        partition_state: LeaderAndIsrPartitionState,
    ) {
        for broker in brokers {
            self.leader_and_isr
                .entry(*broker)
                .or_default()
                .push(partition_state.clone());
        }
    }

    pub fn add_stop_replica(
        &mut self,
        brokers: &[i32],
        topic_partition: TopicPartition,
        leader_epoch: i32,
        delete_partition: bool,
    ) {
        for broker in brokers {
            self.stop_replica
                .entry(*broker)
                .or_default()
                .push(StopReplicaPartitionState {
                    topic_partition: topic_partition.clone(),
                    leader_epoch,
                    delete_partition,
                });
        }
    }

    pub fn add_update_metadata(
        &mut self,
        brokers: &[i32],
        partition_state: UpdateMetadataPartitionState,
    ) {
        for broker in brokers {
            self.update_metadata
                .entry(*broker)
                .or_default()
                .push(partition_state.clone());
        }
    }

    /// Send every queued request. StopReplica outcomes are returned so the
    /// caller can advance replica-deletion state; other responses only log.
    pub async fn send_batch(
        &mut self,
        controller_id: i32,
        controller_epoch: i32,
        live_brokers: &[BrokerRegistration],
        topic_ids: &HashMap<String, Uuid>,
        rpc: &Arc<dyn ControlRpcSender>,
    ) -> Vec<StopReplicaOutcome> {
        let broker_epochs: HashMap<i32, i64> =
            live_brokers.iter().map(|b| (b.id, b.epoch)).collect();
        let update_metadata_brokers: Vec<UpdateMetadataBroker> = live_brokers
            .iter()
            .map(|b| UpdateMetadataBroker {
                id: b.id,
                host: b.host.clone(),
                port: b.port,
                rack: b.rack.clone(),
            })
            .collect();

        for (broker, partition_states) in std::mem::take(&mut self.leader_and_isr) {
            let request = LeaderAndIsrRequest {
                controller_id,
                controller_epoch,
                broker_epoch: broker_epochs.get(&broker).copied().unwrap_or(-1),
                partition_states,
                topic_ids: topic_ids.clone(),
            };
            match rpc.send_leader_and_isr(broker, request).await {
                Ok(response) => {
                    if let Some(e) = response.error {
                        warn!("LeaderAndIsr to broker {} rejected: {}", broker, e);
                    }
                }
                Err(e) => warn!("LeaderAndIsr to broker {} failed: {}", broker, e),
            }
        }

        let mut outcomes = Vec::new();
        for (broker, partition_states) in std::mem::take(&mut self.stop_replica) {
            let deletes: HashMap<TopicPartition, bool> = partition_states
                .iter()
                .map(|ps| (ps.topic_partition.clone(), ps.delete_partition))
                .collect();
            let request = StopReplicaRequest {
                controller_id,
                controller_epoch,
                broker_epoch: broker_epochs.get(&broker).copied().unwrap_or(-1),
                partition_states,
            };
            match rpc.send_stop_replica(broker, request).await {
                Ok(response) => {
                    if let Some(e) = &response.error {
                        warn!("StopReplica to broker {} rejected: {}", broker, e);
                        for (tp, deleted) in deletes {
                            outcomes.push(StopReplicaOutcome {
                                broker_id: broker,
                                topic_partition: tp,
                                deleted,
                                error: Some(e.clone()),
                            });
                        }
                        continue;
                    }
                    for (tp, error) in response.partition_errors {
                        let deleted = deletes.get(&tp).copied().unwrap_or(false);
                        outcomes.push(StopReplicaOutcome {
                            broker_id: broker,
                            topic_partition: tp,
                            deleted,
                            error,
                        });
                    }
                }
                Err(e) => {
                    warn!("StopReplica to broker {} failed: {}", broker, e);
                    for (tp, deleted) in deletes {
                        outcomes.push(StopReplicaOutcome {
                            broker_id: broker,
                            topic_partition: tp,
                            deleted,
                            error: Some(BrokerError::BrokerNotAvailable(broker.to_string())),
                        });
                    }
                }
            }
        }

        for (broker, partition_states) in std::mem::take(&mut self.update_metadata) {
            let request = UpdateMetadataRequest {
                controller_id,
                controller_epoch,
                broker_epoch: broker_epochs.get(&broker).copied().unwrap_or(-1),
                live_brokers: update_metadata_brokers.clone(),
                partition_states,
            };
            if let Err(e) = rpc.send_update_metadata(broker, request).await {
                warn!("UpdateMetadata to broker {} failed: {}", broker, e);
            }
        }

        self.open = false;
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_batch_rejected_while_unsent() {
        let mut batcher = ControlBatcher::default();
        batcher.new_batch().unwrap();
        batcher.add_stop_replica(&[1], TopicPartition::new("t", 0), 0, false);
        assert!(batcher.new_batch().is_err());
    }

    #[test]
    fn test_empty_batch_can_reopen() {
        let mut batcher = ControlBatcher::default();
        batcher.new_batch().unwrap();
        batcher.new_batch().unwrap();
    }
}
