extern crate config as rs_config;

use std::path::Path;

use getset::CopyGetters;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<BrokerConfig> = OnceCell::new();

pub fn global_config() -> &'static BrokerConfig {
    GLOBAL_CONFIG
        .get()
        .expect("broker config must be initialized before use")
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub broker_id: i32,
    pub host: String,
    pub port: u16,
    pub rack: Option<String>,
    /// Listener name used for inter-broker traffic.
    pub inter_broker_listener_name: String,
    /// Lowest protocol version spoken to peers, e.g. "3.5".
    pub inter_broker_protocol_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDirsConfig {
    pub log_dirs: Vec<String>,
}

impl Default for LogDirsConfig {
    fn default() -> Self {
        Self {
            log_dirs: vec!["/tmp/slatemq-logs".to_string()],
        }
    }
}

/// Replication knobs consumed by the replica manager and fetcher pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub replica_lag_time_max_ms: i64,
    pub replica_fetch_min_bytes: i32,
    pub replica_fetch_max_bytes: i32,
    pub replica_fetch_wait_max_ms: i64,
    pub replica_fetch_backoff_ms: u64,
    pub num_replica_fetchers: u32,
    pub min_insync_replicas: usize,
    pub replica_high_watermark_checkpoint_interval_ms: u64,
    pub max_record_size: usize,
    pub max_batch_size: usize,
    /// Kill the process on a log-directory failure instead of limping with
    /// offline partitions (for deployments whose peers cannot distinguish
    /// new partitions during recovery).
    pub halt_on_log_dir_failure: bool,
    pub transaction_partition_verification_enable: bool,
    /// Class-path style name of the read-replica selector; `None` disables
    /// read-replica redirection.
    pub replica_selector_name: Option<String>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replica_lag_time_max_ms: 30_000,
            replica_fetch_min_bytes: 1,
            replica_fetch_max_bytes: 1024 * 1024,
            replica_fetch_wait_max_ms: 500,
            replica_fetch_backoff_ms: 50,
            num_replica_fetchers: 1,
            min_insync_replicas: 1,
            replica_high_watermark_checkpoint_interval_ms: 5_000,
            max_record_size: 1024 * 1024,
            max_batch_size: 4 * 1024 * 1024,
            halt_on_log_dir_failure: false,
            transaction_partition_verification_enable: false,
            replica_selector_name: None,
        }
    }
}

/// Tombstone thresholds for the four purgatories.
#[derive(Debug, Clone, CopyGetters, Serialize, Deserialize)]
#[get_copy = "pub"]
pub struct PurgatoryConfig {
    pub produce_purge_interval: usize,
    pub fetch_purge_interval: usize,
    pub delete_records_purge_interval: usize,
    pub elect_leader_purge_interval: usize,
}

impl Default for PurgatoryConfig {
    fn default() -> Self {
        Self {
            produce_purge_interval: 1000,
            fetch_purge_interval: 1000,
            delete_records_purge_interval: 1000,
            elect_leader_purge_interval: 1000,
        }
    }
}

/// Coordinator-side knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub auto_leader_rebalance_enable: bool,
    /// Fraction (0..1) of non-preferred leaders on a broker above which a
    /// preferred election is triggered for it.
    pub leader_imbalance_per_broker_percentage: f64,
    pub leader_imbalance_check_interval_seconds: u64,
    pub delete_topic_enable: bool,
    pub unclean_leader_election_enable: bool,
    pub event_queue_capacity: usize,
    pub controlled_shutdown_timeout_ms: u64,
    pub feature_versioning_enable: bool,
    pub delegation_token_expiry_check_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            auto_leader_rebalance_enable: true,
            leader_imbalance_per_broker_percentage: 0.1,
            leader_imbalance_check_interval_seconds: 300,
            delete_topic_enable: true,
            unclean_leader_election_enable: false,
            event_queue_capacity: 1024,
            controlled_shutdown_timeout_ms: 30_000,
            feature_versioning_enable: false,
            delegation_token_expiry_check_interval_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub general: GeneralConfig,
    pub log: LogDirsConfig,
    pub replication: ReplicationConfig,
    pub purgatory: PurgatoryConfig,
    pub coordinator: CoordinatorConfig,
}

impl BrokerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<BrokerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue("config file path", String::new()))?;
        let config = rs_config::Config::builder()
            .add_source(rs_config::File::with_name(path_str))
            .build()?;
        let broker_config: BrokerConfig = config.try_deserialize()?;
        broker_config.validate()?;
        Ok(broker_config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.log.log_dirs.is_empty() {
            return Err(AppError::InvalidValue("log_dirs", "empty".to_string()));
        }
        if self.replication.replica_lag_time_max_ms <= 0 {
            return Err(AppError::InvalidValue(
                "replica_lag_time_max_ms",
                self.replication.replica_lag_time_max_ms.to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.coordinator.leader_imbalance_per_broker_percentage) {
            return Err(AppError::InvalidValue(
                "leader_imbalance_per_broker_percentage",
                self.coordinator
                    .leader_imbalance_per_broker_percentage
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(BrokerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bad_imbalance_ratio_rejected() {
        let mut config = BrokerConfig::default();
        config.coordinator.leader_imbalance_per_broker_percentage = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.toml");
        std::fs::write(
            &path,
            r#"
[general]
broker_id = 7
host = "localhost"
port = 9092
inter_broker_listener_name = "REPLICATION"
inter_broker_protocol_version = "3.5"

[log]
log_dirs = ["/tmp/slatemq-a", "/tmp/slatemq-b"]

[replication]
replica_lag_time_max_ms = 10000
replica_fetch_min_bytes = 1
replica_fetch_max_bytes = 1048576
replica_fetch_wait_max_ms = 500
replica_fetch_backoff_ms = 50
num_replica_fetchers = 2
min_insync_replicas = 2
replica_high_watermark_checkpoint_interval_ms = 5000
max_record_size = 1048576
max_batch_size = 4194304
halt_on_log_dir_failure = false
transaction_partition_verification_enable = true

[purgatory]
produce_purge_interval = 100
fetch_purge_interval = 100
delete_records_purge_interval = 100
elect_leader_purge_interval = 100

[coordinator]
auto_leader_rebalance_enable = true
leader_imbalance_per_broker_percentage = 0.1
leader_imbalance_check_interval_seconds = 300
delete_topic_enable = true
unclean_leader_election_enable = false
event_queue_capacity = 512
controlled_shutdown_timeout_ms = 30000
feature_versioning_enable = false
delegation_token_expiry_check_interval_ms = 3600000
"#,
        )
        .unwrap();
        let config = BrokerConfig::set_up_config(&path).unwrap();
        assert_eq!(config.general.broker_id, 7);
        assert_eq!(config.log.log_dirs.len(), 2);
        assert_eq!(config.replication.min_insync_replicas, 2);
        assert_eq!(config.coordinator.event_queue_capacity, 512);
    }
}
