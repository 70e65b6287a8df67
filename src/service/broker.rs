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

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::controller::ClusterCoordinator;
use crate::log::LogManager;
use crate::metastore::MetadataStore;
use crate::replica::{DefaultReplicaSelector, ReplicaManager, ReplicaSelector};
use crate::request::{ControlRpcSender, LeaderEndpoint};
use crate::AppResult;

use super::BrokerConfig;

/// One broker process: a replica manager, a (possibly standby) cluster
/// coordinator, and the shutdown plumbing tying their workers together.
#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    replica_manager: Arc<ReplicaManager>,
    coordinator: Arc<ClusterCoordinator>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

impl Broker {
    /// Register in the metadata store and bring up every subsystem. The
    /// storage, transport and metadata-store implementations are injected;
    /// the single-node launcher wires in-process ones.
    pub async fn startup(
        config: BrokerConfig,
        log_manager: Arc<dyn LogManager>,
        metastore: Arc<dyn MetadataStore>,
        rpc: Arc<dyn ControlRpcSender>,
        endpoint: Arc<dyn LeaderEndpoint>,
    ) -> AppResult<Broker> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        let broker_id = config.general.broker_id;
        info!("broker {} starting up", broker_id);

        let broker_epoch = metastore
            .register_broker(
                broker_id,
                config.general.host.clone(),
                config.general.port,
                config.general.rack.clone(),
            )
            .await?;

        let replica_selector: Option<Arc<dyn ReplicaSelector>> = config
            .replication
            .replica_selector_name
            .as_deref()
            .map(|_| Arc::new(DefaultReplicaSelector) as Arc<dyn ReplicaSelector>);

        let replica_manager = ReplicaManager::new(
            broker_id,
            config.replication.clone(),
            config.purgatory.clone(),
            log_manager,
            metastore.clone(),
            endpoint,
            replica_selector,
            None,
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        )
        .await;
        replica_manager.set_broker_epoch(broker_epoch);
        replica_manager.startup().await;

        let coordinator = ClusterCoordinator::start(
            broker_id,
            config.coordinator.clone(),
            metastore,
            rpc,
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        )
        .await;

        info!("broker {} startup completed", broker_id);
        Ok(Broker {
            config,
            replica_manager,
            coordinator,
            notify_shutdown,
            shutdown_complete_tx,
            shutdown_complete_rx,
        })
    }

    pub fn replica_manager(&self) -> &Arc<ReplicaManager> {
        &self.replica_manager
    }

    pub fn coordinator(&self) -> &Arc<ClusterCoordinator> {
        &self.coordinator
    }

    pub fn broker_id(&self) -> i32 {
        self.config.general.broker_id
    }

    /// Checkpoint, signal every worker, and wait for them to drain.
    pub async fn shutdown(mut self) {
        info!("broker {} shutting down", self.config.general.broker_id);
        self.replica_manager.checkpoint_high_watermarks().await;
        drop(self.notify_shutdown);
        drop(self.shutdown_complete_tx);
        let _ = self.shutdown_complete_rx.recv().await;
        info!("broker {} shutdown complete", self.config.general.broker_id);
    }
}
