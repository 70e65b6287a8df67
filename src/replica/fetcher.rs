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

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::log::LogManager;
use crate::message::TopicPartition;
use crate::request::{
    FetchIsolation, FetchParams, FetchPartitionData, FetchPartitionResult, LeaderEndpoint,
    FUTURE_LOCAL_REPLICA_ID,
};
use crate::utils::DelayedOperationPurgatory;
use crate::{BrokerError, Shutdown};

use super::{DelayedFetch, DelayedProduce, Partition};

/// Consecutive empty rounds before an idle worker exits. The manager
/// respawns a worker on the next add for its shard.
const IDLE_ROUNDS_BEFORE_EXIT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetcherId {
    pub leader_id: i32,
    pub shard: u32,
}

#[derive(Debug)]
enum FetcherCommand {
    Add(Vec<(TopicPartition, Arc<Partition>)>),
    Remove(Vec<TopicPartition>),
}

#[derive(Debug)]
struct FetcherHandle {
    tx: mpsc::Sender<FetcherCommand>,
}

/// Sharded pool of follower-fetch workers. Each worker owns a disjoint set
/// of partitions led by one broker and pulls them in batched rounds; a
/// second instance of this pool (with the loopback sentinel replica id)
/// moves future logs between directories.
#[derive(Debug)]
pub struct ReplicaFetcherManager {
    replica_id: i32,
    num_fetchers: u32,
    fetch_backoff_ms: u64,
    fetch_max_bytes: i32,
    fetch_min_bytes: i32,
    fetch_wait_max_ms: i64,
    endpoint: Arc<dyn LeaderEndpoint>,
    fetchers: DashMap<FetcherId, FetcherHandle>,
    produce_purgatory: Arc<DelayedOperationPurgatory<DelayedProduce>>,
    fetch_purgatory: Arc<DelayedOperationPurgatory<DelayedFetch>>,
    /// Present only on the future-log pool: promotion of a caught-up future
    /// log must be confirmed to the log manager.
    log_manager: Option<Arc<dyn LogManager>>,
    notify_shutdown: broadcast::Sender<()>,
}

impl ReplicaFetcherManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        replica_id: i32,
        num_fetchers: u32,
        fetch_backoff_ms: u64,
        fetch_min_bytes: i32,
        fetch_max_bytes: i32,
        fetch_wait_max_ms: i64,
        endpoint: Arc<dyn LeaderEndpoint>,
        produce_purgatory: Arc<DelayedOperationPurgatory<DelayedProduce>>,
        fetch_purgatory: Arc<DelayedOperationPurgatory<DelayedFetch>>,
        log_manager: Option<Arc<dyn LogManager>>,
        notify_shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            replica_id,
            num_fetchers: num_fetchers.max(1),
            fetch_backoff_ms,
            fetch_max_bytes,
            fetch_min_bytes,
            fetch_wait_max_ms,
            endpoint,
            fetchers: DashMap::new(),
            produce_purgatory,
            fetch_purgatory,
            log_manager,
            notify_shutdown,
        }
    }

    fn fetcher_id(&self, leader_id: i32, topic_partition: &TopicPartition) -> FetcherId {
        let mut hasher = DefaultHasher::new();
        topic_partition.hash(&mut hasher);
        FetcherId {
            leader_id,
            shard: (hasher.finish() % self.num_fetchers as u64) as u32,
        }
    }

    /// Route each partition to its shard worker, spawning workers as needed.
    pub async fn add_fetchers_for_partitions(
        &self,
        partitions: HashMap<TopicPartition, (i32, Arc<Partition>)>,
    ) {
        let mut by_fetcher: HashMap<FetcherId, Vec<(TopicPartition, Arc<Partition>)>> =
            HashMap::new();
        for (tp, (leader_id, partition)) in partitions {
            let id = self.fetcher_id(leader_id, &tp);
            by_fetcher.entry(id).or_default().push((tp, partition));
        }
        for (id, batch) in by_fetcher {
            self.send_or_spawn(id, FetcherCommand::Add(batch)).await;
        }
    }

    /// Followers stop fetching these partitions. Safe to call for
    /// partitions that were never added.
    pub async fn remove_fetchers_for_partitions(&self, partitions: &HashSet<TopicPartition>) {
        if partitions.is_empty() {
            return;
        }
        let batch: Vec<TopicPartition> = partitions.iter().cloned().collect();
        for entry in self.fetchers.iter() {
            let _ = entry
                .value()
                .tx
                .send(FetcherCommand::Remove(batch.clone()))
                .await;
        }
    }

    async fn send_or_spawn(&self, id: FetcherId, command: FetcherCommand) {
        let command = {
            match self.fetchers.get(&id) {
                Some(handle) => match handle.value().tx.send(command).await {
                    Ok(()) => return,
                    // worker exited while idle; respawn below
                    Err(mpsc::error::SendError(command)) => command,
                },
                None => command,
            }
        };
        self.fetchers.remove(&id);
        self.spawn_worker(id);
        if let Some(handle) = self.fetchers.get(&id) {
            let _ = handle.value().tx.send(command).await;
        }
    }

    fn spawn_worker(&self, id: FetcherId) {
        let (tx, rx) = mpsc::channel(64);
        self.fetchers.insert(id, FetcherHandle { tx });
        let worker = FetcherWorker {
            id,
            replica_id: self.replica_id,
            fetch_backoff_ms: self.fetch_backoff_ms,
            fetch_min_bytes: self.fetch_min_bytes,
            fetch_max_bytes: self.fetch_max_bytes,
            fetch_wait_max_ms: self.fetch_wait_max_ms,
            endpoint: self.endpoint.clone(),
            produce_purgatory: self.produce_purgatory.clone(),
            fetch_purgatory: self.fetch_purgatory.clone(),
            log_manager: self.log_manager.clone(),
            partitions: HashMap::new(),
        };
        let shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        tokio::spawn(worker.run(rx, shutdown));
        debug!("spawned replica fetcher {:?}", id);
    }

    pub fn fetcher_count(&self) -> usize {
        self.fetchers.len()
    }
}

struct FetcherWorker {
    id: FetcherId,
    replica_id: i32,
    fetch_backoff_ms: u64,
    fetch_min_bytes: i32,
    fetch_max_bytes: i32,
    fetch_wait_max_ms: i64,
    endpoint: Arc<dyn LeaderEndpoint>,
    produce_purgatory: Arc<DelayedOperationPurgatory<DelayedProduce>>,
    fetch_purgatory: Arc<DelayedOperationPurgatory<DelayedFetch>>,
    log_manager: Option<Arc<dyn LogManager>>,
    partitions: HashMap<TopicPartition, Arc<Partition>>,
}

impl FetcherWorker {
    fn is_future_worker(&self) -> bool {
        self.replica_id == FUTURE_LOCAL_REPLICA_ID
    }
    async fn run(mut self, mut rx: mpsc::Receiver<FetcherCommand>, mut shutdown: Shutdown) {
        let mut tick = interval(Duration::from_millis(self.fetch_backoff_ms.max(1)));
        let mut idle_rounds = 0u32;
        loop {
            tokio::select! {
                Some(command) = rx.recv() => {
                    match command {
                        FetcherCommand::Add(batch) => {
                            for (tp, partition) in batch {
                                // a future log shares the machine with its
                                // source, so its history cannot diverge
                                if !self.is_future_worker() {
                                    self.truncate_to_leader_epoch(&tp, &partition).await;
                                }
                                self.partitions.insert(tp, partition);
                            }
                            idle_rounds = 0;
                        }
                        FetcherCommand::Remove(batch) => {
                            for tp in batch {
                                self.partitions.remove(&tp);
                            }
                        }
                    }
                }
                _ = tick.tick() => {
                    if self.partitions.is_empty() {
                        idle_rounds += 1;
                        if idle_rounds >= IDLE_ROUNDS_BEFORE_EXIT {
                            debug!("fetcher {:?} idle, exiting", self.id);
                            break;
                        }
                        continue;
                    }
                    idle_rounds = 0;
                    self.fetch_round().await;
                }
                _ = shutdown.recv() => {
                    debug!("fetcher {:?} shutting down", self.id);
                    break;
                }
            }
        }
    }

    /// Align the local log with the leader's epoch history before the first
    /// fetch, so the first round cannot append diverged records.
    async fn truncate_to_leader_epoch(&self, tp: &TopicPartition, partition: &Arc<Partition>) {
        let Some(local_epoch) = partition.latest_log_epoch() else {
            return;
        };
        let current_epoch = partition.leader_epoch().await;
        let mut request = BTreeMap::new();
        request.insert(tp.clone(), (Some(current_epoch), local_epoch));
        match self
            .endpoint
            .offset_for_leader_epoch(self.id.leader_id, request)
            .await
        {
            Ok(mut answers) => {
                if let Some(Ok(end)) = answers.remove(tp) {
                    let leo = partition.log_end_offset();
                    if end.end_offset >= 0 && end.end_offset < leo {
                        if let Err(e) = partition.truncate_to(end.end_offset).await {
                            error!("{} initial truncation failed: {}", tp, e);
                        }
                    }
                }
            }
            Err(e) => warn!("{} offset-for-leader-epoch failed: {}", tp, e),
        }
    }

    async fn fetch_round(&mut self) {
        let future_mode = self.is_future_worker();
        let mut fetch_data = BTreeMap::new();
        for (tp, partition) in &self.partitions {
            let fetch_offset = if future_mode {
                match partition.future_log_end_offset() {
                    Some(offset) => offset,
                    None => continue,
                }
            } else {
                partition.log_end_offset()
            };
            fetch_data.insert(
                tp.clone(),
                FetchPartitionData {
                    fetch_offset,
                    partition_max_bytes: self.fetch_max_bytes,
                    current_leader_epoch: Some(partition.leader_epoch().await),
                    last_fetched_epoch: if future_mode {
                        None
                    } else {
                        partition.latest_log_epoch()
                    },
                    log_start_offset: partition.log_start_offset(),
                },
            );
        }
        if fetch_data.is_empty() {
            return;
        }
        let params = FetchParams {
            replica_id: self.replica_id,
            max_wait_ms: self.fetch_wait_max_ms,
            min_bytes: self.fetch_min_bytes,
            max_bytes: self.fetch_max_bytes,
            isolation: FetchIsolation::LogEnd,
            client_metadata: None,
        };

        let results = match self.endpoint.fetch(self.id.leader_id, params, fetch_data).await {
            Ok(results) => results,
            Err(e) => {
                warn!("fetcher {:?} round failed: {}", self.id, e);
                return;
            }
        };

        let mut to_drop = Vec::new();
        for (tp, result) in results {
            let Some(partition) = self.partitions.get(&tp) else {
                continue;
            };
            match self.apply_fetch_result(&tp, partition.clone(), result).await {
                Ok(()) => {}
                Err(drop_partition) => {
                    if drop_partition {
                        to_drop.push(tp);
                    }
                }
            }
        }
        for tp in to_drop {
            self.partitions.remove(&tp);
        }
    }

    /// Returns Err(true) when the partition must leave this fetcher and wait
    /// for the next control message.
    async fn apply_fetch_result(
        &self,
        tp: &TopicPartition,
        partition: Arc<Partition>,
        result: FetchPartitionResult,
    ) -> Result<(), bool> {
        if let Some(error) = result.error {
            return match error {
                BrokerError::FencedLeaderEpoch(_)
                | BrokerError::NotLeaderOrFollower(_)
                | BrokerError::UnknownTopicOrPartition(_)
                | BrokerError::InconsistentTopicId(_) => {
                    info!("{} dropped from fetcher {:?}: {}", tp, self.id, error);
                    Err(true)
                }
                other => {
                    warn!("{} fetch error, will retry: {}", tp, other);
                    Err(false)
                }
            };
        }

        if self.is_future_worker() {
            return self.apply_future_fetch_result(tp, partition, result).await;
        }

        if let Some(diverging) = result.diverging_epoch {
            let truncate_at = diverging.end_offset.min(partition.log_end_offset());
            if let Err(e) = partition.truncate_to(truncate_at).await {
                error!("{} truncation to {} failed: {}", tp, truncate_at, e);
            }
            return Ok(());
        }

        let had_records = !result.records.is_empty();
        if let Err(e) = partition
            .append_records_to_follower(
                result.records,
                result.high_watermark,
                result.log_start_offset,
            )
            .await
        {
            warn!("{} follower append failed: {}", tp, e);
            return Err(matches!(
                e,
                crate::AppError::Broker(BrokerError::NotLeaderOrFollower(_))
            ));
        }

        if had_records {
            let key = tp.to_string();
            self.produce_purgatory.check_and_complete(&key).await;
            self.fetch_purgatory.check_and_complete(&key).await;
        }
        Ok(())
    }

    /// Future-log variant: append into the future log, promote it once it
    /// has caught up, and leave the fetcher on promotion.
    async fn apply_future_fetch_result(
        &self,
        tp: &TopicPartition,
        partition: Arc<Partition>,
        result: FetchPartitionResult,
    ) -> Result<(), bool> {
        if let Err(e) = partition.append_records_to_future(result.records).await {
            warn!("{} future-log append failed: {}", tp, e);
            return Err(false);
        }
        if partition.maybe_replace_current_with_future().await {
            if let Some(log_manager) = &self.log_manager {
                if let Err(e) = log_manager.confirm_future_log(tp).await {
                    warn!("{} future-log confirmation failed: {}", tp, e);
                }
            }
            info!("{} future log move completed", tp);
            return Err(true);
        }
        Ok(())
    }
}
