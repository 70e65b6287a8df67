//! Core of a partitioned, replicated commit-log broker: per-broker replica
//! management (leader/follower transitions, produce/fetch with durability
//! guarantees, delayed operations, follower fetching, disk-failure
//! handling) and the single elected cluster coordinator (leader election,
//! reassignment, topic deletion, preferred-leader rebalance).
//!
//! Log segment storage, wire codecs and the consensus store are external
//! collaborators behind the `log`, `request` and `metastore` seams.

pub mod controller;
pub mod log;
pub mod message;
pub mod metastore;
pub mod replica;
pub mod request;
pub mod service;
pub mod utils;

mod errors;

pub use errors::{AppError, AppResult, BrokerError, BrokerResult, ErrorCode};
pub use service::{global_config, Broker, BrokerConfig, Shutdown, GLOBAL_CONFIG};
