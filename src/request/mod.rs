mod control;
mod fetch;
mod local;
mod produce;

pub use control::{
    AlterPartitionItem, AlterPartitionRequest, AlterPartitionResponse, ControlRpcSender,
    LeaderAndIsrPartitionState, LeaderAndIsrRequest, LeaderAndIsrResponse, StopReplicaPartitionState,
    StopReplicaRequest, StopReplicaResponse, UpdateMetadataBroker, UpdateMetadataPartitionState,
    UpdateMetadataRequest, UpdateMetadataResponse,
};
pub use local::LocalTransport;
pub use fetch::{
    ClientMetadata, FetchIsolation, FetchParams, FetchPartitionData, FetchPartitionResult,
    LeaderEndpoint, CONSUMER_REPLICA_ID, FUTURE_LOCAL_REPLICA_ID,
};
pub use produce::{
    DeleteRecordsPartitionResult, EpochEndOffsetResult, ProducePartitionResponse, RequiredAcks,
};
