use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::log::EpochEndOffset;
use crate::message::TopicPartition;
use crate::replica::ReplicaManager;
use crate::{AppError, AppResult, BrokerError};

use super::{
    ControlRpcSender, FetchParams, FetchPartitionData, FetchPartitionResult, LeaderAndIsrRequest,
    LeaderAndIsrResponse, LeaderEndpoint, StopReplicaRequest, StopReplicaResponse,
    UpdateMetadataRequest, UpdateMetadataResponse,
};

/// In-process transport connecting replica managers by broker id. Backs the
/// single-node launcher and the multi-broker integration tests; a clustered
/// deployment replaces it with a networked implementation of the same two
/// traits.
#[derive(Debug, Default)]
pub struct LocalTransport {
    brokers: DashMap<i32, Arc<ReplicaManager>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            brokers: DashMap::new(),
        })
    }

    pub fn register(&self, broker_id: i32, replica_manager: Arc<ReplicaManager>) {
        self.brokers.insert(broker_id, replica_manager);
    }

    /// Simulates a broker crash: control messages and fetches to it fail
    /// until it re-registers.
    pub fn unregister(&self, broker_id: i32) {
        self.brokers.remove(&broker_id);
    }

    pub fn rpc(self: &Arc<Self>) -> Arc<dyn ControlRpcSender> {
        self.clone()
    }

    pub fn endpoint(self: &Arc<Self>) -> Arc<dyn LeaderEndpoint> {
        self.clone()
    }

    fn broker(&self, broker_id: i32) -> AppResult<Arc<ReplicaManager>> {
        self.brokers
            .get(&broker_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                AppError::Broker(BrokerError::BrokerNotAvailable(broker_id.to_string()))
            })
    }
}

#[async_trait]
impl ControlRpcSender for LocalTransport {
    async fn send_leader_and_isr(
        &self,
        broker_id: i32,
        request: LeaderAndIsrRequest,
    ) -> AppResult<LeaderAndIsrResponse> {
        Ok(self.broker(broker_id)?.become_leader_or_follower(request).await)
    }

    async fn send_stop_replica(
        &self,
        broker_id: i32,
        request: StopReplicaRequest,
    ) -> AppResult<StopReplicaResponse> {
        Ok(self.broker(broker_id)?.stop_replica(request).await)
    }

    async fn send_update_metadata(
        &self,
        broker_id: i32,
        request: UpdateMetadataRequest,
    ) -> AppResult<UpdateMetadataResponse> {
        // metadata caching belongs to the client-facing layer; receiving it
        // is enough here
        self.broker(broker_id)?;
        let _ = request;
        Ok(UpdateMetadataResponse { error: None })
    }
}

#[async_trait]
impl LeaderEndpoint for LocalTransport {
    async fn fetch(
        &self,
        leader_id: i32,
        params: FetchParams,
        fetch_data: BTreeMap<TopicPartition, FetchPartitionData>,
    ) -> AppResult<BTreeMap<TopicPartition, FetchPartitionResult>> {
        let leader = self.broker(leader_id)?;
        let rx = leader.fetch_records(params, fetch_data).await;
        rx.await
            .map_err(|e| AppError::ChannelRecv(format!("fetch response dropped: {e}")))
    }

    async fn offset_for_leader_epoch(
        &self,
        leader_id: i32,
        partitions: BTreeMap<TopicPartition, (Option<i32>, i32)>,
    ) -> AppResult<BTreeMap<TopicPartition, Result<EpochEndOffset, BrokerError>>> {
        let leader = self.broker(leader_id)?;
        let results = leader.last_offset_for_leader_epoch(partitions).await;
        Ok(results
            .into_iter()
            .map(|(tp, r)| {
                let result = match r.error {
                    Some(e) => Err(e),
                    None => Ok(EpochEndOffset {
                        leader_epoch: r.leader_epoch,
                        end_offset: r.end_offset,
                    }),
                };
                (tp, result)
            })
            .collect())
    }
}
