//! Core types for the redis-weave RESP3 client
//!
//! This crate holds the pieces shared by every layer of the client: the
//! decoded wire [`Message`], the immutable [`Command`] with its precomputed
//! slot and flags, the [`RedisError`] taxonomy, and [`ClientConfig`].

#![warn(missing_docs)]

pub mod command;
pub mod config;
pub mod error;
pub mod message;
pub mod types;

pub use command::{
    calculate_slot, Cacheable, CacheableTtl, Command, CommandBuilder, ToArg, CLUSTER_SLOTS,
    INIT_SLOT, NO_SLOT,
};
pub use config::{ClientConfig, QueueKind, ReplicaPredicate, ReplicaSelector, RetryConfig, TopologyMode};
pub use error::{RedisError, RedisResult};
pub use message::{Message, Value};
pub use types::{NodeInfo, SlotRange};
