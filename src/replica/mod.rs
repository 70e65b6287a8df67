pub(crate) mod delayed_delete_records;
pub(crate) mod delayed_elect_leader;
pub(crate) mod delayed_fetch;
pub(crate) mod delayed_produce;
mod fetcher;
mod partition;
mod replica_manager;
mod selector;

pub use delayed_delete_records::DelayedDeleteRecords;
pub use delayed_elect_leader::DelayedElectLeader;
pub use delayed_fetch::DelayedFetch;
pub use delayed_produce::DelayedProduce;
pub use fetcher::{FetcherId, ReplicaFetcherManager};
pub use partition::{FollowerState, HwChange, Partition, PartitionAppendInfo, Role};
pub use replica_manager::{HostedPartition, MetadataDelta, ReplicaManager};
pub use selector::{DefaultReplicaSelector, ReplicaSelector, ReplicaView};

use std::collections::HashSet;
use std::fmt::Debug;

use async_trait::async_trait;

use crate::message::TopicPartition;

/// Seam to the transaction coordinator: confirm which partitions have a
/// verified ongoing transaction before a transactional produce touches
/// their logs.
#[async_trait]
pub trait TransactionVerifier: Send + Sync + Debug {
    async fn verify(
        &self,
        transactional_id: &str,
        partitions: Vec<TopicPartition>,
    ) -> HashSet<TopicPartition>;
}
