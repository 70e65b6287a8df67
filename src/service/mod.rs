mod broker;
mod config;
mod shutdown;
mod tracing_config;

pub use broker::Broker;
pub use config::{
    global_config, BrokerConfig, CoordinatorConfig, GeneralConfig, LogDirsConfig,
    PurgatoryConfig, GLOBAL_CONFIG,
};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

pub use config::ReplicationConfig;
