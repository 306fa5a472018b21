//! Auto-pipelining RESP3 client for Redis and Valkey
//!
//! `redis-weave` multiplexes concurrent commands onto a small number of
//! shared connections: every caller enqueues its command, a background
//! writer flushes whatever has accumulated in one write, and a reader task
//! matches replies back to callers in order. On top of that it offers
//! server-assisted client-side caching, cluster slot routing with
//! transparent `MOVED`/`ASK` handling, pub/sub, and dedicated connections
//! for transactions.
//!
//! # Features
//!
//! - Automatic topology detection (standalone vs cluster)
//! - Transparent handling of MOVED, ASK and TRYAGAIN in cluster mode
//! - Client-side caching (`CLIENT TRACKING`) with per-key TTL and
//!   invalidation
//! - Blocking commands on a separate bounded pool
//! - Retries of read-only commands with exponential backoff
//! - Large replies streamed into any `AsyncWrite`
//!
//! # Quick Start
//!
//! ```no_run
//! use redis_weave::{Client, ClientConfig, Command};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::connect(ClientConfig::new(["127.0.0.1:6379"])).await?;
//!
//!     client
//!         .execute(Command::builder("SET").key("mykey").arg("myvalue").build())
//!         .await?;
//!     let get = Command::builder("GET").key("mykey").build_cacheable()?;
//!     let value = client.execute_cached(&get, Duration::from_secs(60)).await?;
//!     println!("Value: {}", value.as_str()?);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

mod cache;
mod client;
mod cluster;
mod connection;
mod dedicated;
mod mux;
mod pipe;
mod pool;
pub mod protocol;
mod pubsub;
mod queue;
mod retry;
mod stream;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::Client;
pub use connection::{AsyncStream, BoxedStream, Dialer, ServerInfo, TcpDialer};
pub use dedicated::DedicatedClient;
pub use pubsub::{MessageHook, PubSubHooks, PubSubMessage, PubSubSubscription, SubscriptionHook};
pub use stream::ResultStream;

pub use redis_weave_core::{
    calculate_slot, Cacheable, CacheableTtl, ClientConfig, Command, CommandBuilder, Message,
    NodeInfo, QueueKind, RedisError, RedisResult, ReplicaPredicate, ReplicaSelector, RetryConfig,
    SlotRange, ToArg, TopologyMode, Value,
};
