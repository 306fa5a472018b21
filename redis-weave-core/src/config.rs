//! Configuration types for Redis clients

use crate::command::Command;
use crate::error::{RedisError, RedisResult};
use crate::types::NodeInfo;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Decides per command whether a replica may serve it
pub type ReplicaPredicate = Arc<dyn Fn(&Command) -> bool + Send + Sync>;

/// Picks a replica index for a slot; out-of-range falls back to the primary
pub type ReplicaSelector = Arc<dyn Fn(u16, &[NodeInfo]) -> usize + Send + Sync>;

/// Topology detection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyMode {
    /// Try cluster discovery, fall back to standalone when cluster support is disabled
    Auto,
    /// Force standalone mode
    Standalone,
    /// Force cluster mode
    Cluster,
}

/// Per-connection request queue implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Fixed-size ring; producers wait for a free slot
    Ring,
    /// Bounded channel; producers can be cancelled while waiting
    Flow,
}

/// Retry policy for read-only commands
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Enable automatic retries
    pub enabled: bool,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum number of retries (None = no limit)
    pub max_attempts: Option<usize>,

    /// Also retry commands that are not read-only
    pub retry_writes: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_attempts: Some(3),
            retry_writes: false,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Set the maximum number of retries
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: Option<usize>) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the initial and maximum delays
    #[must_use]
    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }
}

/// Configuration for a Redis client
#[derive(Clone)]
pub struct ClientConfig {
    /// Seed addresses (`host:port`)
    pub init_address: Vec<String>,

    /// ACL username
    pub username: Option<String>,

    /// Optional password for authentication
    pub password: Option<String>,

    /// `CLIENT SETNAME` sent with HELLO
    pub client_name: Option<String>,

    /// Database number (standalone only)
    pub select_db: u32,

    /// Topology detection mode
    pub topology_mode: TopologyMode,

    /// Dial timeout, also bounds the handshake
    pub connect_timeout: Duration,

    /// Deadline for a single request on an idle connection and for keep-alive pings
    pub conn_write_timeout: Duration,

    /// Idle interval after which a keep-alive PING is sent
    pub keep_alive_interval: Option<Duration>,

    /// Enable TCP keepalive on the socket
    pub tcp_keepalive: Option<Duration>,

    /// Disable Nagle's algorithm opt-out (leave Nagle enabled)
    pub disable_tcp_nodelay: bool,

    /// Queue size per connection is `2^ring_scale_each_conn`
    pub ring_scale_each_conn: u32,

    /// Queue implementation
    pub queue_kind: QueueKind,

    /// Read buffer capacity per connection
    pub read_buffer_each_conn: usize,

    /// Write buffer capacity per connection
    pub write_buffer_each_conn: usize,

    /// Pipes per destination is `2^pipeline_multiplex`
    pub pipeline_multiplex: u32,

    /// Upper bound of connections used for blocking commands
    pub blocking_pool_size: usize,

    /// Recycle connections after this long
    pub conn_lifetime: Option<Duration>,

    /// Client-side cache budget per connection in bytes
    pub cache_size_each_conn: usize,

    /// Disable client-side caching and `CLIENT TRACKING`
    pub disable_cache: bool,

    /// Custom `CLIENT TRACKING ON` options, default `OPTIN`
    pub client_tracking_options: Option<Vec<String>>,

    /// Library name and version for `CLIENT SETINFO`, `None` to skip
    pub client_set_info: Option<(String, String)>,

    /// How long the writer waits to gather more concurrent commands before flushing
    pub max_flush_delay: Duration,

    /// Start background read/write loops right after the handshake
    pub always_pipelining: bool,

    /// Retry policy
    pub retry: RetryConfig,

    /// Maximum number of redirects followed for one command
    pub max_redirects: usize,

    /// Periodic cluster topology refresh
    pub shards_refresh_interval: Option<Duration>,

    /// Which commands may be served by replicas
    pub send_to_replicas: Option<ReplicaPredicate>,

    /// Which replica serves a slot
    pub replica_selector: Option<ReplicaSelector>,

    /// Prefer `tls-port` from `CLUSTER SHARDS`
    pub tls_ports: bool,

    /// Send `READONLY` after the handshake so a cluster replica serves reads
    pub replica_only: bool,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("init_address", &self.init_address)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_name", &self.client_name)
            .field("select_db", &self.select_db)
            .field("topology_mode", &self.topology_mode)
            .field("pipeline_multiplex", &self.pipeline_multiplex)
            .field("blocking_pool_size", &self.blocking_pool_size)
            .field("conn_lifetime", &self.conn_lifetime)
            .field("disable_cache", &self.disable_cache)
            .field("retry", &self.retry)
            .field("send_to_replicas", &self.send_to_replicas.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            init_address: vec!["127.0.0.1:6379".to_string()],
            username: None,
            password: None,
            client_name: None,
            select_db: 0,
            topology_mode: TopologyMode::Auto,
            connect_timeout: Duration::from_secs(5),
            conn_write_timeout: Duration::from_secs(10),
            keep_alive_interval: Some(Duration::from_secs(30)),
            tcp_keepalive: Some(Duration::from_secs(60)),
            disable_tcp_nodelay: false,
            ring_scale_each_conn: 10,
            queue_kind: QueueKind::Ring,
            read_buffer_each_conn: 512 * 1024,
            write_buffer_each_conn: 512 * 1024,
            pipeline_multiplex: 2,
            blocking_pool_size: 1000,
            conn_lifetime: None,
            cache_size_each_conn: 128 * 1024 * 1024,
            disable_cache: false,
            client_tracking_options: None,
            client_set_info: Some((
                "redis-weave".to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            )),
            max_flush_delay: Duration::ZERO,
            always_pipelining: false,
            retry: RetryConfig::default(),
            max_redirects: 16,
            shards_refresh_interval: None,
            send_to_replicas: None,
            replica_selector: None,
            tls_ports: false,
            replica_only: false,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with the given seed addresses
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            init_address: addresses.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the password for authentication
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set ACL username and password
    #[must_use]
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the client name
    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Set the database number
    #[must_use]
    pub fn with_select_db(mut self, db: u32) -> Self {
        self.select_db = db;
        self
    }

    /// Set the topology mode
    #[must_use]
    pub fn with_topology_mode(mut self, mode: TopologyMode) -> Self {
        self.topology_mode = mode;
        self
    }

    /// Set the connection timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-request deadline used on idle connections and for pings
    #[must_use]
    pub fn with_conn_write_timeout(mut self, timeout: Duration) -> Self {
        self.conn_write_timeout = timeout;
        self
    }

    /// Set the keep-alive PING interval
    #[must_use]
    pub fn with_keep_alive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set the queue size exponent
    #[must_use]
    pub fn with_ring_scale(mut self, scale: u32) -> Self {
        self.ring_scale_each_conn = scale;
        self
    }

    /// Choose the queue implementation
    #[must_use]
    pub fn with_queue_kind(mut self, kind: QueueKind) -> Self {
        self.queue_kind = kind;
        self
    }

    /// Set the pipe fan-out exponent
    #[must_use]
    pub fn with_pipeline_multiplex(mut self, multiplex: u32) -> Self {
        self.pipeline_multiplex = multiplex;
        self
    }

    /// Set the blocking pool size
    #[must_use]
    pub fn with_blocking_pool_size(mut self, size: usize) -> Self {
        self.blocking_pool_size = size;
        self
    }

    /// Set the connection lifetime
    #[must_use]
    pub fn with_conn_lifetime(mut self, lifetime: Duration) -> Self {
        self.conn_lifetime = Some(lifetime);
        self
    }

    /// Set the cache budget per connection
    #[must_use]
    pub fn with_cache_size(mut self, bytes: usize) -> Self {
        self.cache_size_each_conn = bytes;
        self
    }

    /// Disable client-side caching
    #[must_use]
    pub fn without_cache(mut self) -> Self {
        self.disable_cache = true;
        self
    }

    /// Set custom tracking options
    #[must_use]
    pub fn with_client_tracking_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client_tracking_options = Some(options.into_iter().map(Into::into).collect());
        self
    }

    /// Set the flush delay
    #[must_use]
    pub fn with_max_flush_delay(mut self, delay: Duration) -> Self {
        self.max_flush_delay = delay;
        self
    }

    /// Start pipelining loops eagerly
    #[must_use]
    pub fn with_always_pipelining(mut self, on: bool) -> Self {
        self.always_pipelining = on;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the maximum number of redirects
    #[must_use]
    pub fn with_max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Refresh cluster topology periodically
    #[must_use]
    pub fn with_shards_refresh_interval(mut self, interval: Duration) -> Self {
        self.shards_refresh_interval = Some(interval);
        self
    }

    /// Route matching commands to replicas
    #[must_use]
    pub fn with_send_to_replicas(
        mut self,
        predicate: impl Fn(&Command) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.send_to_replicas = Some(Arc::new(predicate));
        self
    }

    /// Choose replicas with a custom selector
    #[must_use]
    pub fn with_replica_selector(
        mut self,
        selector: impl Fn(u16, &[NodeInfo]) -> usize + Send + Sync + 'static,
    ) -> Self {
        self.replica_selector = Some(Arc::new(selector));
        self
    }

    /// Whether `CLIENT TRACKING` runs in opt-in mode
    pub fn tracking_opt_in(&self) -> bool {
        match &self.client_tracking_options {
            None => true,
            Some(options) => options.iter().any(|o| o.eq_ignore_ascii_case("OPTIN")),
        }
    }

    /// Reject inconsistent settings
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Config`] describing the first problem found.
    pub fn validate(&self) -> RedisResult<()> {
        if self.init_address.is_empty() {
            return Err(RedisError::Config("no init address".to_string()));
        }
        if !(1..=30).contains(&self.ring_scale_each_conn) {
            return Err(RedisError::Config(
                "ring_scale_each_conn must be within 1..=30".to_string(),
            ));
        }
        if self.pipeline_multiplex > 8 {
            return Err(RedisError::Config(
                "pipeline_multiplex must be at most 8".to_string(),
            ));
        }
        if self.blocking_pool_size == 0 {
            return Err(RedisError::Config(
                "blocking_pool_size must be positive".to_string(),
            ));
        }
        if self.replica_selector.is_some() && self.send_to_replicas.is_none() {
            return Err(RedisError::Config(
                "send_to_replicas must be set when replica_selector is set".to_string(),
            ));
        }
        if self.shards_refresh_interval == Some(Duration::ZERO) {
            return Err(RedisError::Config(
                "shards_refresh_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
