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

mod replica_manager_read;
mod replica_manager_role;
mod replica_manager_write;

pub use replica_manager_role::MetadataDelta;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc::Sender;
use tokio::sync::{broadcast, Mutex};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::log::{CheckpointFile, LogManager};
use crate::message::TopicPartition;
use crate::metastore::MetadataStore;
use crate::request::LeaderEndpoint;
use crate::service::{PurgatoryConfig, ReplicationConfig};
use crate::utils::DelayedOperationPurgatory;
use crate::{BrokerError, BrokerResult, Shutdown};

use super::{
    DelayedDeleteRecords, DelayedElectLeader, DelayedFetch, DelayedProduce, Partition,
    ReplicaFetcherManager, ReplicaSelector, TransactionVerifier,
};

const HW_CHECKPOINT_FILE_NAME: &str = "replication-offset-checkpoint";

/// Local state of one partition on this broker. `Offline` is sticky until
/// the hosting directory comes back and the broker restarts.
#[derive(Debug, Clone)]
pub enum HostedPartition {
    Online(Arc<Partition>),
    Offline,
}

/// The broker-local replication façade: hosts partitions, serves the data
/// plane, applies control messages, owns the purgatories, the fetcher pool,
/// the directory-failure channel and HW checkpointing.
#[derive(Debug)]
pub struct ReplicaManager {
    pub(crate) broker_id: i32,
    pub(crate) config: ReplicationConfig,
    pub(crate) log_manager: Arc<dyn LogManager>,
    pub(crate) metastore: Arc<dyn MetadataStore>,
    pub(crate) hosted_partitions: DashMap<TopicPartition, HostedPartition>,
    pub(crate) controller_epoch: AtomicCell<i32>,
    pub(crate) broker_epoch: AtomicCell<i64>,
    /// Serializes control messages against each other.
    pub(crate) state_change_lock: Mutex<()>,
    pub(crate) fetcher_pool: ReplicaFetcherManager,
    pub(crate) future_fetcher_pool: ReplicaFetcherManager,
    pub(crate) produce_purgatory: Arc<DelayedOperationPurgatory<DelayedProduce>>,
    pub(crate) fetch_purgatory: Arc<DelayedOperationPurgatory<DelayedFetch>>,
    pub(crate) delete_records_purgatory: Arc<DelayedOperationPurgatory<DelayedDeleteRecords>>,
    pub(crate) elect_leader_purgatory: Arc<DelayedOperationPurgatory<DelayedElectLeader>>,
    pub(crate) replica_selector: Option<Arc<dyn ReplicaSelector>>,
    pub(crate) transaction_verifier: Option<Arc<dyn TransactionVerifier>>,
    dir_failure_tx: async_channel::Sender<String>,
    dir_failure_rx: async_channel::Receiver<String>,
    /// HW values recovered from the checkpoint files at startup.
    pub(crate) recovered_hw_checkpoints: SyncMutex<HashMap<TopicPartition, i64>>,
    notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_tx: Sender<()>,
}

impl ReplicaManager {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        broker_id: i32,
        config: ReplicationConfig,
        purgatory_config: PurgatoryConfig,
        log_manager: Arc<dyn LogManager>,
        metastore: Arc<dyn MetadataStore>,
        endpoint: Arc<dyn LeaderEndpoint>,
        replica_selector: Option<Arc<dyn ReplicaSelector>>,
        transaction_verifier: Option<Arc<dyn TransactionVerifier>>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: Sender<()>,
    ) -> Arc<Self> {
        let produce_purgatory = DelayedOperationPurgatory::new(
            "produce",
            purgatory_config.produce_purge_interval,
            notify_shutdown.clone(),
        )
        .await;
        let fetch_purgatory = DelayedOperationPurgatory::new(
            "fetch",
            purgatory_config.fetch_purge_interval,
            notify_shutdown.clone(),
        )
        .await;
        let delete_records_purgatory = DelayedOperationPurgatory::new(
            "delete-records",
            purgatory_config.delete_records_purge_interval,
            notify_shutdown.clone(),
        )
        .await;
        let elect_leader_purgatory = DelayedOperationPurgatory::new(
            "elect-leader",
            purgatory_config.elect_leader_purge_interval,
            notify_shutdown.clone(),
        )
        .await;

        let fetcher_pool = ReplicaFetcherManager::new(
            broker_id,
            config.num_replica_fetchers,
            config.replica_fetch_backoff_ms,
            config.replica_fetch_min_bytes,
            config.replica_fetch_max_bytes,
            config.replica_fetch_wait_max_ms,
            endpoint.clone(),
            produce_purgatory.clone(),
            fetch_purgatory.clone(),
            None,
            notify_shutdown.clone(),
        );
        // the future-log pool speaks the follower-fetch protocol against
        // this broker itself while a replica moves between directories
        let future_fetcher_pool = ReplicaFetcherManager::new(
            crate::request::FUTURE_LOCAL_REPLICA_ID,
            config.num_replica_fetchers,
            config.replica_fetch_backoff_ms,
            config.replica_fetch_min_bytes,
            config.replica_fetch_max_bytes,
            config.replica_fetch_wait_max_ms,
            endpoint,
            produce_purgatory.clone(),
            fetch_purgatory.clone(),
            Some(log_manager.clone()),
            notify_shutdown.clone(),
        );

        let (dir_failure_tx, dir_failure_rx) = async_channel::unbounded();

        Arc::new(ReplicaManager {
            broker_id,
            config,
            log_manager,
            metastore,
            hosted_partitions: DashMap::new(),
            controller_epoch: AtomicCell::new(0),
            broker_epoch: AtomicCell::new(-1),
            state_change_lock: Mutex::new(()),
            fetcher_pool,
            future_fetcher_pool,
            produce_purgatory,
            fetch_purgatory,
            delete_records_purgatory,
            elect_leader_purgatory,
            replica_selector,
            transaction_verifier,
            dir_failure_tx,
            dir_failure_rx,
            recovered_hw_checkpoints: SyncMutex::new(HashMap::new()),
            notify_shutdown,
            _shutdown_complete_tx: shutdown_complete_tx,
        })
    }

    /// Recover HW checkpoints and start the periodic workers: ISR shrink,
    /// HW checkpointing and the directory-failure handler.
    pub async fn startup(self: &Arc<Self>) {
        info!("replica manager {} starting up", self.broker_id);
        let mut recovered = HashMap::new();
        for dir in self.log_manager.log_dirs() {
            let checkpoint = CheckpointFile::new(Path::new(&dir).join(HW_CHECKPOINT_FILE_NAME));
            match checkpoint.read_checkpoints().await {
                Ok(points) => recovered.extend(points),
                Err(e) => warn!("failed to read hw checkpoint in {}: {}", dir, e),
            }
        }
        *self.recovered_hw_checkpoints.lock() = recovered;

        self.clone().spawn_isr_shrink_tick();
        self.clone().spawn_hw_checkpoint_tick();
        self.clone().spawn_dir_failure_handler();
        info!("replica manager {} startup completed", self.broker_id);
    }

    pub fn broker_id(&self) -> i32 {
        self.broker_id
    }

    pub fn set_broker_epoch(&self, epoch: i64) {
        self.broker_epoch.store(epoch);
    }

    pub fn metastore(&self) -> &Arc<dyn MetadataStore> {
        &self.metastore
    }

    /// The sender the log layer uses to report a failed directory.
    pub fn dir_failure_sender(&self) -> async_channel::Sender<String> {
        self.dir_failure_tx.clone()
    }

    /// Start moving a hosted replica to another log directory on this
    /// broker. A future log is created in `dir` and catches up through the
    /// future fetcher pool; once in sync it replaces the current log.
    pub async fn alter_replica_log_dir(
        self: &Arc<Self>,
        topic_partition: &TopicPartition,
        dir: &str,
    ) -> BrokerResult<()> {
        let partition = self.online_partition(topic_partition)?;
        if partition.log_dir() == dir {
            return Ok(());
        }
        if partition.has_future_log() {
            return Err(BrokerError::InvalidRequest(format!(
                "{} is already moving between directories",
                topic_partition
            )));
        }
        let future = self
            .log_manager
            .create_future_log(topic_partition, dir)
            .await
            .map_err(BrokerError::from)?;
        partition.create_future_log(future);
        info!("{} moving to log directory {}", topic_partition, dir);
        self.future_fetcher_pool
            .add_fetchers_for_partitions(HashMap::from([(
                topic_partition.clone(),
                (self.broker_id, partition),
            )]))
            .await;
        Ok(())
    }

    pub fn hosted_partition(&self, topic_partition: &TopicPartition) -> Option<HostedPartition> {
        self.hosted_partitions
            .get(topic_partition)
            .map(|e| e.value().clone())
    }

    /// The partition if it is hosted here and its directory is healthy.
    pub fn online_partition(
        &self,
        topic_partition: &TopicPartition,
    ) -> BrokerResult<Arc<Partition>> {
        match self.hosted_partitions.get(topic_partition) {
            Some(entry) => match entry.value() {
                HostedPartition::Online(partition) => Ok(partition.clone()),
                HostedPartition::Offline => Err(BrokerError::StorageError(
                    topic_partition.to_string(),
                )),
            },
            None => Err(BrokerError::UnknownTopicOrPartition(
                topic_partition.to_string(),
            )),
        }
    }

    pub fn online_partition_count(&self) -> usize {
        self.hosted_partitions
            .iter()
            .filter(|e| matches!(e.value(), HostedPartition::Online(_)))
            .count()
    }

    /// Spawned nudge of the purgatories watching `key`. Spawning keeps the
    /// completion chain from re-entering the caller's future.
    pub(crate) fn complete_delayed_requests(self: &Arc<Self>, key: String, hw_increased: bool) {
        let rm = self.clone();
        tokio::spawn(async move {
            if hw_increased {
                rm.produce_purgatory.check_and_complete(&key).await;
                rm.delete_records_purgatory.check_and_complete(&key).await;
            }
            rm.fetch_purgatory.check_and_complete(&key).await;
        });
    }

    fn spawn_isr_shrink_tick(self: Arc<Self>) {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        tokio::spawn(async move {
            // shrink cadence is half the lag budget so a stalled follower is
            // dropped within 1.5x the configured maximum
            let period = (self.config.replica_lag_time_max_ms as u64 / 2).max(10);
            let mut tick = interval(Duration::from_millis(period));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let partitions: Vec<Arc<Partition>> = self
                            .hosted_partitions
                            .iter()
                            .filter_map(|e| match e.value() {
                                HostedPartition::Online(p) => Some(p.clone()),
                                HostedPartition::Offline => None,
                            })
                            .collect();
                        for partition in partitions {
                            match partition.maybe_shrink_isr().await {
                                Ok(hw_change) => {
                                    if hw_change == super::HwChange::Increased {
                                        self.complete_delayed_requests(
                                            partition.topic_partition().to_string(),
                                            true,
                                        );
                                    }
                                }
                                Err(e) => {
                                    debug!(
                                        "isr shrink tick failed for {}: {}",
                                        partition.topic_partition(),
                                        e
                                    );
                                }
                            }
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    fn spawn_hw_checkpoint_tick(self: Arc<Self>) {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(
                self.config.replica_high_watermark_checkpoint_interval_ms.max(10),
            ));
            loop {
                tokio::select! {
                    _ = tick.tick() => self.checkpoint_high_watermarks().await,
                    _ = shutdown.recv() => {
                        // final checkpoint on clean shutdown
                        self.checkpoint_high_watermarks().await;
                        break;
                    }
                }
            }
        });
    }

    /// Snapshot every online partition's HW, grouped by log directory, and
    /// rewrite each directory's checkpoint file.
    pub async fn checkpoint_high_watermarks(&self) {
        let mut by_dir: HashMap<String, HashMap<TopicPartition, i64>> = HashMap::new();
        for entry in self.hosted_partitions.iter() {
            if let HostedPartition::Online(partition) = entry.value() {
                by_dir
                    .entry(partition.log_dir())
                    .or_default()
                    .insert(entry.key().clone(), partition.high_watermark());
            }
        }
        for (dir, points) in by_dir {
            if tokio::fs::metadata(&dir).await.is_err() {
                continue;
            }
            let checkpoint = CheckpointFile::new(Path::new(&dir).join(HW_CHECKPOINT_FILE_NAME));
            if let Err(e) = checkpoint.write_checkpoints(&points).await {
                warn!("hw checkpoint write failed for {}: {}", dir, e);
            }
        }
    }

    fn spawn_dir_failure_handler(self: Arc<Self>) {
        let rx = self.dir_failure_rx.clone();
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    dir = rx.recv() => {
                        match dir {
                            Ok(dir) => self.handle_log_dir_failure(&dir).await,
                            Err(_) => break,
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    /// Every partition whose log lives in `dir` goes Offline: fetchers stop,
    /// the directory's checkpoint is dropped, waiters complete with a
    /// storage error and the coordinator is notified.
    pub async fn handle_log_dir_failure(&self, dir: &str) {
        error!("log directory {} failed on broker {}", dir, self.broker_id);
        if self.config.halt_on_log_dir_failure {
            error!("halting broker {} on log directory failure", self.broker_id);
            std::process::exit(1);
        }

        let mut affected = Vec::new();
        for entry in self.hosted_partitions.iter() {
            if let HostedPartition::Online(partition) = entry.value() {
                if partition.log_dir() == dir {
                    affected.push(entry.key().clone());
                }
            }
        }
        let affected_set: HashSet<TopicPartition> = affected.iter().cloned().collect();
        self.fetcher_pool
            .remove_fetchers_for_partitions(&affected_set)
            .await;
        self.future_fetcher_pool
            .remove_fetchers_for_partitions(&affected_set)
            .await;
        for tp in &affected {
            self.hosted_partitions
                .insert(tp.clone(), HostedPartition::Offline);
        }

        let checkpoint = CheckpointFile::new(Path::new(dir).join(HW_CHECKPOINT_FILE_NAME));
        if let Err(e) = checkpoint.remove().await {
            warn!("failed to remove hw checkpoint in {}: {}", dir, e);
        }

        for tp in &affected {
            let key = tp.to_string();
            self.produce_purgatory.check_and_complete(&key).await;
            self.fetch_purgatory.check_and_complete(&key).await;
            self.delete_records_purgatory.check_and_complete(&key).await;
        }

        if let Err(e) = self.metastore.notify_log_dir_failure(self.broker_id).await {
            warn!("failed to notify metadata store of dir failure: {}", e);
        }
        info!(
            "marked {} partitions offline after failure of {}",
            affected.len(),
            dir
        );
    }
}
