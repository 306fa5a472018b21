#![allow(dead_code)]

pub use redis_weave::testing::{cluster_slots, is_cluster_slots, MockServer};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
