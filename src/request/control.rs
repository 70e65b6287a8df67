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
use std::fmt::Debug;

use async_trait::async_trait;
use uuid::Uuid;

use crate::message::{LeaderAndIsr, LeaderRecoveryState, TopicPartition};
use crate::{AppResult, BrokerError};

/// Per-partition payload of a LeaderAndIsr request: the committed leadership
/// snapshot plus the full (possibly reassigning) replica set.
#[derive(Debug, Clone)]
pub struct LeaderAndIsrPartitionState {
    pub topic_partition: TopicPartition,
    pub leader: i32,
    pub leader_epoch: i32,
    pub isr: Vec<i32>,
    pub partition_epoch: i32,
    pub replicas: Vec<i32>,
    pub adding_replicas: Vec<i32>,
    pub removing_replicas: Vec<i32>,
    pub is_new: bool,
    pub leader_recovery_state: LeaderRecoveryState,
}

impl LeaderAndIsrPartitionState {
    pub fn leader_and_isr(&self) -> LeaderAndIsr {
        LeaderAndIsr {
            leader: self.leader,
            leader_epoch: self.leader_epoch,
            isr: self.isr.clone(),
            partition_epoch: self.partition_epoch,
            leader_recovery_state: self.leader_recovery_state,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeaderAndIsrRequest {
    pub controller_id: i32,
    pub controller_epoch: i32,
    pub broker_epoch: i64,
    pub partition_states: Vec<LeaderAndIsrPartitionState>,
    pub topic_ids: HashMap<String, Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct LeaderAndIsrResponse {
    pub error: Option<BrokerError>,
    pub partition_errors: HashMap<TopicPartition, Option<BrokerError>>,
}

#[derive(Debug, Clone)]
pub struct StopReplicaPartitionState {
    pub topic_partition: TopicPartition,
    /// Must be ≥ the replica's current epoch, except for the `NO_EPOCH` and
    /// `EPOCH_DURING_DELETE` sentinels which skip the comparison.
    pub leader_epoch: i32,
    pub delete_partition: bool,
}

#[derive(Debug, Clone)]
pub struct StopReplicaRequest {
    pub controller_id: i32,
    pub controller_epoch: i32,
    pub broker_epoch: i64,
    pub partition_states: Vec<StopReplicaPartitionState>,
}

#[derive(Debug, Clone, Default)]
pub struct StopReplicaResponse {
    pub error: Option<BrokerError>,
    pub partition_errors: HashMap<TopicPartition, Option<BrokerError>>,
}

#[derive(Debug, Clone)]
pub struct UpdateMetadataBroker {
    pub id: i32,
    pub host: String,
    pub port: u16,
    pub rack: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpdateMetadataPartitionState {
    pub topic_partition: TopicPartition,
    pub leader: i32,
    pub leader_epoch: i32,
    pub isr: Vec<i32>,
    pub partition_epoch: i32,
    pub replicas: Vec<i32>,
    pub offline_replicas: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct UpdateMetadataRequest {
    pub controller_id: i32,
    pub controller_epoch: i32,
    pub broker_epoch: i64,
    pub live_brokers: Vec<UpdateMetadataBroker>,
    pub partition_states: Vec<UpdateMetadataPartitionState>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateMetadataResponse {
    pub error: Option<BrokerError>,
}

/// One partition's proposed leader/ISR in an AlterPartition request.
#[derive(Debug, Clone)]
pub struct AlterPartitionItem {
    pub topic_partition: TopicPartition,
    pub leader_and_isr: LeaderAndIsr,
}

#[derive(Debug, Clone)]
pub struct AlterPartitionRequest {
    pub broker_id: i32,
    pub broker_epoch: i64,
    pub partitions: Vec<AlterPartitionItem>,
}

#[derive(Debug, Clone, Default)]
pub struct AlterPartitionResponse {
    pub error: Option<BrokerError>,
    pub partitions: HashMap<TopicPartition, Result<LeaderAndIsr, BrokerError>>,
}

/// Control-plane fan-out seam. The coordinator's batcher hands complete
/// requests to one implementation per cluster; the wire framing is external.
#[async_trait]
pub trait ControlRpcSender: Send + Sync + Debug {
    async fn send_leader_and_isr(
        &self,
        broker_id: i32,
        request: LeaderAndIsrRequest,
    ) -> AppResult<LeaderAndIsrResponse>;

    async fn send_stop_replica(
        &self,
        broker_id: i32,
        request: StopReplicaRequest,
    ) -> AppResult<StopReplicaResponse>;

    async fn send_update_metadata(
        &self,
        broker_id: i32,
        request: UpdateMetadataRequest,
    ) -> AppResult<UpdateMetadataResponse>;
}
