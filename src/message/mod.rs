mod leader_and_isr;
mod memory_records;
mod topic_partition;

pub use leader_and_isr::{
    LeaderAndIsr, LeaderRecoveryState, ReplicaAssignment, EPOCH_DURING_DELETE,
    INITIAL_LEADER_EPOCH, INITIAL_PARTITION_EPOCH, NO_EPOCH, NO_LEADER,
};
pub use memory_records::MemoryRecords;
pub use topic_partition::{PartitionMsgData, TopicData, TopicIdPartition, TopicPartition};
