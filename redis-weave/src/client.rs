//! High-level Redis client
//!
//! This module provides the main `Client` interface. A client talks either
//! to one standalone server through a single connection group, or to a
//! cluster through the slot router; [`TopologyMode::Auto`] picks between the
//! two at connect time.

use crate::cluster::ClusterClient;
use crate::connection::{Dialer, TcpDialer};
use crate::dedicated::DedicatedClient;
use crate::mux::Mux;
use crate::pubsub::{PubSubMessage, SubscriptionHook};
use crate::queue::Replies;
use crate::retry::RetryPolicy;
use crate::stream::ResultStream;
use redis_weave_core::{
    command::{Cacheable, CacheableTtl, Command},
    config::{ClientConfig, TopologyMode},
    error::{RedisError, RedisResult},
    message::Message,
    types::NodeInfo,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Auto-pipelining Redis client
///
/// Automatically handles:
/// - Topology detection (standalone vs cluster)
/// - MOVED and ASK redirects in cluster mode
/// - Pipelining of concurrent commands over a few shared connections
/// - Client-side caching with server-assisted invalidation
/// - Retries of read-only commands with exponential backoff
///
/// Cloning is cheap and clones share connections.
#[derive(Clone)]
pub struct Client {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Standalone(Arc<Standalone>),
    Cluster(ClusterClient),
}

struct Standalone {
    mux: Mux,
    retry: RetryPolicy,
    /// A per-node view of a cluster client, which owns the connections
    shared: bool,
}

impl Client {
    /// Connect to Redis with the given configuration
    ///
    /// With [`TopologyMode::Auto`] this tries cluster discovery first and
    /// falls back to a standalone connection when the server reports that
    /// cluster support is disabled.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use redis_weave::{Client, ClientConfig};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let client = Client::connect(ClientConfig::new(["127.0.0.1:6379"])).await?;
    ///     client.close().await;
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect(config: ClientConfig) -> RedisResult<Self> {
        let dialer = TcpDialer::from_config(&config);
        Self::connect_with_dialer(config, dialer).await
    }

    /// Connect using a custom transport, e.g. TLS or a unix socket
    pub async fn connect_with_dialer(config: ClientConfig, dialer: impl Dialer) -> RedisResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let dialer: Arc<dyn Dialer> = Arc::new(dialer);

        match config.topology_mode {
            TopologyMode::Standalone => Self::connect_standalone(config, dialer).await,
            TopologyMode::Cluster => Self::connect_cluster(config, dialer).await,
            TopologyMode::Auto => match Self::connect_cluster(config.clone(), dialer.clone()).await {
                Err(err) if err.to_string().contains("cluster support disabled") => {
                    debug!("cluster support disabled, using a standalone connection");
                    Self::connect_standalone(config, dialer).await
                }
                other => other,
            },
        }
    }

    async fn connect_standalone(config: Arc<ClientConfig>, dialer: Arc<dyn Dialer>) -> RedisResult<Self> {
        let addr = config
            .init_address
            .first()
            .ok_or_else(|| RedisError::Config("no init address".to_string()))?;
        info!(addr = %addr, "Connecting to standalone Redis");

        let mux = Mux::new(addr, config.clone(), dialer, None);
        mux.dial().await?;
        Ok(Self {
            backend: Backend::Standalone(Arc::new(Standalone {
                mux,
                retry: RetryPolicy::new(config.retry.clone()),
                shared: false,
            })),
        })
    }

    async fn connect_cluster(config: Arc<ClientConfig>, dialer: Arc<dyn Dialer>) -> RedisResult<Self> {
        info!(seeds = ?config.init_address, "Connecting to Redis Cluster");
        let cluster = ClusterClient::connect(config, dialer).await?;
        Ok(Self {
            backend: Backend::Cluster(cluster),
        })
    }

    /// Whether the client routes by cluster slots
    pub fn is_cluster(&self) -> bool {
        matches!(self.backend, Backend::Cluster(_))
    }

    /// Send one command and wait for its reply
    ///
    /// Concurrent calls are pipelined onto shared connections. Server error
    /// replies come back as [`RedisError::Server`] (or the matching redirect
    /// variant once redirects are exhausted).
    pub async fn execute(&self, cmd: Command) -> RedisResult<Message> {
        let reply = match &self.backend {
            Backend::Standalone(s) => s.execute(cmd).await,
            Backend::Cluster(c) => c.execute(cmd).await,
        };
        reply?.into_result()
    }

    /// Send several commands as one batch
    ///
    /// The result has one entry per command, in order. In cluster mode the
    /// batch is split by slot owner and reassembled.
    pub async fn execute_multi(&self, cmds: Vec<Command>) -> Vec<RedisResult<Message>> {
        let replies = match &self.backend {
            Backend::Standalone(s) => s.execute_multi(cmds).await,
            Backend::Cluster(c) => c.execute_multi(cmds).await,
        };
        fold_errors(replies)
    }

    /// Serve a read from the client-side cache, fetching and tracking it on
    /// a miss
    ///
    /// `ttl` caps how long the reply is kept; the key's server-side TTL caps
    /// it further, and server invalidations evict it early.
    pub async fn execute_cached(&self, cmd: &Cacheable, ttl: Duration) -> RedisResult<Message> {
        let reply = match &self.backend {
            Backend::Standalone(s) => s.execute_cached(cmd, ttl).await,
            Backend::Cluster(c) => c.execute_cached(cmd, ttl).await,
        };
        reply?.into_result()
    }

    /// Cached reads in one round trip for whatever misses
    pub async fn execute_multi_cached(&self, cmds: &[CacheableTtl]) -> Vec<RedisResult<Message>> {
        let replies = match &self.backend {
            Backend::Standalone(s) => s.execute_multi_cached(cmds).await,
            Backend::Cluster(c) => c.execute_multi_cached(cmds).await,
        };
        fold_errors(replies)
    }

    /// Subscribe and call `on_message` for every delivery until all channels
    /// are unsubscribed
    ///
    /// `subscribe` is a `SUBSCRIBE`, `PSUBSCRIBE` or `SSUBSCRIBE` command.
    /// Returns `Ok(())` after a clean unsubscribe and the connection's error
    /// if it fails.
    pub async fn receive<F>(
        &self,
        subscribe: Command,
        on_message: F,
        on_subscription: Option<SubscriptionHook>,
    ) -> RedisResult<()>
    where
        F: FnMut(PubSubMessage) + Send,
    {
        match &self.backend {
            Backend::Standalone(s) => s.mux.receive(subscribe, on_message, on_subscription).await,
            Backend::Cluster(c) => c.receive(subscribe, on_message, on_subscription).await,
        }
    }

    /// A client bound to one connection, for `WATCH`/`MULTI`/`EXEC`
    ///
    /// The connection is borrowed on first use. Call
    /// [`DedicatedClient::release`] when done.
    pub fn dedicate(&self) -> DedicatedClient {
        match &self.backend {
            Backend::Standalone(s) => DedicatedClient::standalone(s.mux.clone()),
            Backend::Cluster(c) => DedicatedClient::cluster(c.clone()),
        }
    }

    /// Send one command and copy its reply into a writer as it arrives
    ///
    /// The command runs on a connection borrowed for the stream, outside
    /// the shared pipelines. Failures to reach a node show up as the
    /// stream's [`error`](ResultStream::error).
    pub async fn execute_stream(&self, cmd: Command) -> ResultStream {
        self.stream(vec![cmd]).await
    }

    /// [`execute_stream`](Self::execute_stream) for several commands sent
    /// together; in a cluster their keys must share one slot
    pub async fn execute_multi_stream(&self, cmds: Vec<Command>) -> ResultStream {
        self.stream(cmds).await
    }

    async fn stream(&self, cmds: Vec<Command>) -> ResultStream {
        let leased = match &self.backend {
            Backend::Standalone(s) => s.mux.stream(&cmds).await.map(|pooled| (s.mux.clone(), pooled)),
            Backend::Cluster(c) => c.stream(&cmds).await,
        };
        match leased {
            Ok((mux, pooled)) => ResultStream::open(mux, pooled, cmds.len()),
            Err(err) => ResultStream::failed(err),
        }
    }

    /// Whether this client talks to a cluster or a single server
    pub fn mode(&self) -> TopologyMode {
        match &self.backend {
            Backend::Standalone(_) => TopologyMode::Standalone,
            Backend::Cluster(_) => TopologyMode::Cluster,
        }
    }

    /// One standalone client per known node, keyed by address
    ///
    /// The clients reuse this client's connections; closing one of them
    /// does nothing.
    pub fn node_clients(&self) -> HashMap<String, Client> {
        match &self.backend {
            Backend::Standalone(s) => HashMap::from([(s.mux.addr().to_string(), self.clone())]),
            Backend::Cluster(c) => c
                .node_muxes()
                .into_iter()
                .map(|(addr, mux)| {
                    let node = Standalone {
                        mux,
                        retry: RetryPolicy::new(c.config().retry.clone()),
                        shared: true,
                    };
                    let client = Client {
                        backend: Backend::Standalone(Arc::new(node)),
                    };
                    (addr, client)
                })
                .collect(),
        }
    }

    /// Addresses of the known nodes
    pub fn nodes(&self) -> Vec<String> {
        match &self.backend {
            Backend::Standalone(s) => vec![s.mux.addr().to_string()],
            Backend::Cluster(c) => c.nodes(),
        }
    }

    /// Cluster nodes with the slot ranges they serve; empty when standalone
    pub fn shards(&self) -> Vec<NodeInfo> {
        match &self.backend {
            Backend::Standalone(_) => Vec::new(),
            Backend::Cluster(c) => c.shards(),
        }
    }

    /// Reload the cluster slot table now
    pub async fn refresh(&self) -> RedisResult<()> {
        match &self.backend {
            Backend::Standalone(_) => Ok(()),
            Backend::Cluster(c) => c.refresh().await,
        }
    }

    /// Close every connection; pending commands get [`RedisError::Closing`]
    pub async fn close(&self) {
        match &self.backend {
            Backend::Standalone(s) if s.shared => {}
            Backend::Standalone(s) => s.mux.close().await,
            Backend::Cluster(c) => c.close().await,
        }
    }
}

fn fold_errors(replies: Replies) -> Vec<RedisResult<Message>> {
    replies
        .into_iter()
        .map(|r| r.and_then(Message::into_result))
        .collect()
}

impl Standalone {
    async fn execute(&self, cmd: Command) -> RedisResult<Message> {
        let readonly = cmd.is_readonly();
        let mut attempts = 1;
        loop {
            match self.mux.execute(cmd.clone()).await {
                Err(RedisError::ConnExpired) => continue,
                Err(err) if self.retry.should_retry(attempts, readonly, &err) => {
                    self.retry.wait(attempts, &err).await;
                    attempts += 1;
                }
                other => return other,
            }
        }
    }

    async fn execute_cached(&self, cmd: &Cacheable, ttl: Duration) -> RedisResult<Message> {
        let mut attempts = 1;
        loop {
            match self.mux.execute_cached(cmd, ttl).await {
                Err(RedisError::ConnExpired) => continue,
                Err(err) if self.retry.should_retry(attempts, true, &err) => {
                    self.retry.wait(attempts, &err).await;
                    attempts += 1;
                }
                other => return other,
            }
        }
    }

    /// Read-only entries that failed in transit are resent together
    async fn execute_multi(&self, cmds: Vec<Command>) -> Replies {
        let mut replies = self.mux.execute_multi_resending(&cmds).await;
        let mut attempts = 1;
        loop {
            let failed: Vec<usize> = replies
                .iter()
                .enumerate()
                .filter(|(i, r)| match r {
                    Err(err) => self.retry.should_retry(attempts, cmds[*i].is_readonly(), err),
                    Ok(_) => false,
                })
                .map(|(i, _)| i)
                .collect();
            let Some(err) = failed.first().and_then(|&i| replies[i].clone().err()) else {
                return replies;
            };
            self.retry.wait(attempts, &err).await;
            attempts += 1;

            let again: Vec<Command> = failed.iter().map(|&i| cmds[i].clone()).collect();
            let resent = self.mux.execute_multi_resending(&again).await;
            for (i, reply) in failed.into_iter().zip(resent) {
                replies[i] = reply;
            }
        }
    }

    async fn execute_multi_cached(&self, cmds: &[CacheableTtl]) -> Replies {
        let mut replies = self.mux.execute_multi_cached(cmds).await;
        loop {
            let expired: Vec<usize> = replies
                .iter()
                .enumerate()
                .filter(|(_, r)| matches!(r, Err(RedisError::ConnExpired)))
                .map(|(i, _)| i)
                .collect();
            if expired.is_empty() {
                return replies;
            }
            let again: Vec<CacheableTtl> = expired.iter().map(|&i| cmds[i].clone()).collect();
            let resent = self.mux.execute_multi_cached(&again).await;
            for (i, reply) in expired.into_iter().zip(resent) {
                replies[i] = reply;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDialer;
    use redis_weave_core::config::RetryConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ADDR: &str = "127.0.0.1:6379";

    fn config() -> ClientConfig {
        ClientConfig::new([ADDR])
            .with_keep_alive_interval(None)
            .with_retry(RetryConfig::default().with_delays(Duration::from_millis(1), Duration::from_millis(5)))
    }

    fn cluster_disabled(_: &str, args: &[String]) -> Option<Vec<Message>> {
        (args.len() == 2 && args[0] == "CLUSTER")
            .then(|| vec![Message::error_line("ERR This instance has cluster support disabled")])
    }

    #[tokio::test]
    async fn test_auto_mode_falls_back_to_standalone() {
        let dialer = MockDialer::with_handler(cluster_disabled);
        dialer.set("foo", "bar", -1);
        let client = Client::connect_with_dialer(config(), dialer.clone()).await.unwrap();

        assert!(!client.is_cluster());
        assert_eq!(client.nodes(), vec![ADDR.to_string()]);
        assert!(client.shards().is_empty());
        let reply = client.execute(Command::builder("GET").key("foo").build()).await.unwrap();
        assert_eq!(reply.as_str().unwrap(), "bar");
        client.close().await;
    }

    #[tokio::test]
    async fn test_cluster_mode_does_not_fall_back() {
        let dialer = MockDialer::with_handler(cluster_disabled);
        let result = Client::connect_with_dialer(
            config().with_topology_mode(TopologyMode::Cluster),
            dialer.clone(),
        )
        .await;
        assert!(matches!(result, Err(RedisError::Server(_))));
    }

    #[tokio::test]
    async fn test_server_errors_become_err() {
        let dialer = MockDialer::new();
        let client = Client::connect_with_dialer(
            config().with_topology_mode(TopologyMode::Standalone),
            dialer.clone(),
        )
        .await
        .unwrap();

        let err = client.execute(Command::from_args(["NOPE"])).await.unwrap_err();
        assert!(err.is_server_error());

        let replies = client
            .execute_multi(vec![
                Command::builder("SET").key("a").arg("1").build(),
                Command::from_args(["NOPE"]),
                Command::builder("GET").key("a").build(),
            ])
            .await;
        assert_eq!(replies[0].as_ref().unwrap().as_str().unwrap(), "OK");
        assert!(replies[1].is_err());
        assert_eq!(replies[2].as_ref().unwrap().as_str().unwrap(), "1");
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let err = Client::connect_with_dialer(ClientConfig::new(Vec::<String>::new()), MockDialer::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RedisError::Config(_)));
    }

    #[tokio::test]
    async fn test_reads_are_retried_after_transport_errors() {
        let dialer = MockDialer::new();
        dialer.set("foo", "bar", -1);
        let client = Client::connect_with_dialer(
            config().with_topology_mode(TopologyMode::Standalone).with_pipeline_multiplex(0),
            dialer.clone(),
        )
        .await
        .unwrap();
        client.execute(Command::from_args(["PING"])).await.unwrap();

        dialer.kill(ADDR);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reply = client
            .execute(Command::builder("GET").key("foo").readonly().build())
            .await
            .unwrap();
        assert_eq!(reply.as_str().unwrap(), "bar");
        assert_eq!(dialer.dials(ADDR), 2);
    }

    #[tokio::test]
    async fn test_writes_are_not_retried() {
        let dialer = MockDialer::new();
        let client = Client::connect_with_dialer(
            config().with_topology_mode(TopologyMode::Standalone).with_pipeline_multiplex(0),
            dialer.clone(),
        )
        .await
        .unwrap();
        client.execute(Command::from_args(["PING"])).await.unwrap();

        dialer.kill(ADDR);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let set = Command::builder("SET").key("foo").arg("1").build();
        assert!(client.execute(set.clone()).await.is_err());
        assert!(client.execute(set).await.is_ok());
    }

    #[tokio::test]
    async fn test_dedicated_clients_share_nothing_with_pipelined_traffic() {
        let dialer = MockDialer::new();
        let client = Client::connect_with_dialer(
            config().with_topology_mode(TopologyMode::Standalone).with_pipeline_multiplex(0),
            dialer.clone(),
        )
        .await
        .unwrap();

        let dedicated = client.dedicate();
        dedicated.execute(Command::from_args(["MULTI"])).await.unwrap();
        let reply = client.execute(Command::builder("SET").key("x").arg("1").build()).await.unwrap();
        assert_eq!(reply.as_str().unwrap(), "OK");
        let reply = dedicated.execute(Command::builder("GET").key("x").build()).await.unwrap();
        assert_eq!(reply.as_str().unwrap(), "QUEUED");
        dedicated.release().await;
        assert_eq!(dialer.dials(ADDR), 2);
    }

    #[tokio::test]
    async fn test_receive_delivers_until_unsubscribed() {
        let dialer = MockDialer::new();
        let client = Client::connect_with_dialer(
            config().with_topology_mode(TopologyMode::Standalone),
            dialer.clone(),
        )
        .await
        .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let receiver = client.clone();
        let task = tokio::spawn(async move {
            receiver
                .receive(
                    Command::from_args(["SUBSCRIBE", "news"]),
                    move |msg: PubSubMessage| {
                        assert_eq!(msg.message, "hi");
                        counter.fetch_add(1, Ordering::SeqCst);
                    },
                    None,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        dialer.push(
            ADDR,
            Message::push(vec![Message::blob("message"), Message::blob("news"), Message::blob("hi")]),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        client
            .execute(Command::from_args(["UNSUBSCRIBE", "news"]))
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    async fn standalone(dialer: &MockDialer) -> Client {
        Client::connect_with_dialer(config().with_topology_mode(TopologyMode::Standalone), dialer.clone())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_stream_copies_each_reply_then_reuses_connection() {
        let dialer = MockDialer::new();
        let big = "v".repeat(100_000);
        dialer.set("big", &big, -1);
        dialer.set("small", "s", -1);
        let client = standalone(&dialer).await;
        let dials = dialer.dials(ADDR);

        let get = |key: &str| Command::builder("GET").key(key).build();
        let mut stream = client
            .execute_multi_stream(vec![get("big"), get("missing"), get("small")])
            .await;
        let mut out = Vec::new();
        assert!(stream.has_next());
        assert_eq!(stream.write_to(&mut out).await.unwrap(), 100_000);
        assert_eq!(out, big.as_bytes());

        assert!(matches!(stream.write_to(&mut out).await, Err(RedisError::Nil)));
        assert!(stream.has_next());

        out.clear();
        assert_eq!(stream.write_to(&mut out).await.unwrap(), 1);
        assert_eq!(out, b"s");
        assert!(!stream.has_next());
        assert!(matches!(stream.error(), Some(RedisError::StreamDone)));
        assert!(matches!(stream.write_to(&mut out).await, Err(RedisError::StreamDone)));

        let mut again = client.execute_stream(get("small")).await;
        again.write_to(&mut Vec::new()).await.unwrap();
        assert_eq!(dialer.dials(ADDR), dials + 1);
        client.close().await;
    }

    #[tokio::test]
    async fn test_stream_reports_server_error_and_moves_on() {
        let dialer = MockDialer::new();
        dialer.set("a", "1", -1);
        let client = standalone(&dialer).await;

        let mut stream = client
            .execute_multi_stream(vec![
                Command::from_args(["NOPE"]),
                Command::builder("PTTL").key("a").build(),
                Command::builder("GET").key("a").build(),
            ])
            .await;
        let mut out = Vec::new();
        assert!(stream.write_to(&mut out).await.unwrap_err().is_server_error());
        assert!(matches!(stream.write_to(&mut out).await, Err(RedisError::Type(_))));
        assert_eq!(stream.write_to(&mut out).await.unwrap(), 1);
        assert_eq!(out, b"1");
        client.close().await;
    }

    #[tokio::test]
    async fn test_dropped_stream_is_not_reused() {
        let dialer = MockDialer::new();
        dialer.set("a", "1", -1);
        let client = standalone(&dialer).await;
        let dials = dialer.dials(ADDR);

        let get = || Command::builder("GET").key("a").build();
        let mut stream = client.execute_multi_stream(vec![get(), get()]).await;
        stream.write_to(&mut Vec::new()).await.unwrap();
        drop(stream);

        let mut stream = client.execute_stream(get()).await;
        let mut out = Vec::new();
        stream.write_to(&mut out).await.unwrap();
        assert_eq!(out, b"1");
        assert_eq!(dialer.dials(ADDR), dials + 2);
        client.close().await;
    }

    #[tokio::test]
    async fn test_node_clients_share_cluster_connections() {
        const A: &str = "127.0.0.1:7000";
        const B: &str = "127.0.0.1:7001";
        let node = |port: i64| Message::array(vec![Message::blob("127.0.0.1"), Message::int(port)]);
        let table = Message::array(vec![
            Message::array(vec![Message::int(0), Message::int(8191), node(7000)]),
            Message::array(vec![Message::int(8192), Message::int(16383), node(7001)]),
        ]);
        let dialer = MockDialer::with_handler(move |_, args| {
            (args.len() == 2 && args[0] == "CLUSTER" && args[1] == "SLOTS").then(|| vec![table.clone()])
        });
        let client = Client::connect_with_dialer(ClientConfig::new([A]).with_keep_alive_interval(None), dialer.clone())
            .await
            .unwrap();
        assert_eq!(client.mode(), TopologyMode::Cluster);

        let nodes = client.node_clients();
        let mut addrs: Vec<&String> = nodes.keys().collect();
        addrs.sort();
        assert_eq!(addrs, vec![A, B]);

        let b = &nodes[B];
        assert_eq!(b.mode(), TopologyMode::Standalone);
        b.execute(Command::from_args(["PING"])).await.unwrap();
        assert!(dialer.commands_to(B).contains(&"PING".to_string()));
        assert!(!dialer.commands_to(A).contains(&"PING".to_string()));
        let dials = dialer.dials(B);

        b.close().await;
        let key = (0..)
            .map(|i| format!("key:{}", i))
            .find(|k| crate::calculate_slot(k.as_bytes()) >= 8192)
            .unwrap();
        client.execute(Command::builder("GET").key(key.as_str()).build()).await.unwrap();
        assert_eq!(dialer.dials(B), dials);
        client.close().await;
    }

    #[tokio::test]
    async fn test_cluster_stream_needs_one_slot() {
        let node = Message::array(vec![Message::blob("127.0.0.1"), Message::int(6379)]);
        let table = Message::array(vec![Message::array(vec![Message::int(0), Message::int(16383), node])]);
        let dialer = MockDialer::with_handler(move |_, args| {
            (args.len() == 2 && args[0] == "CLUSTER" && args[1] == "SLOTS").then(|| vec![table.clone()])
        });
        dialer.set("{u}a", "1", -1);
        let client = Client::connect_with_dialer(config(), dialer.clone()).await.unwrap();
        assert!(client.is_cluster());

        let stream = client
            .execute_multi_stream(vec![
                Command::builder("GET").key("a").build(),
                Command::builder("GET").key("b").build(),
            ])
            .await;
        assert!(!stream.has_next());
        assert!(matches!(stream.error(), Some(RedisError::CrossSlot)));

        let mut stream = client
            .execute_multi_stream(vec![
                Command::builder("GET").key("{u}a").build(),
                Command::builder("GET").key("{u}b").build(),
            ])
            .await;
        let mut out = Vec::new();
        stream.write_to(&mut out).await.unwrap();
        assert!(matches!(stream.write_to(&mut out).await, Err(RedisError::Nil)));
        assert_eq!(out, b"1");
        assert!(!stream.has_next());
        client.close().await;
    }

    #[tokio::test]
    async fn test_standalone_mode_and_node_clients() {
        let dialer = MockDialer::new();
        let client = standalone(&dialer).await;
        assert_eq!(client.mode(), TopologyMode::Standalone);
        let nodes = client.node_clients();
        assert_eq!(nodes.len(), 1);
        assert!(nodes.contains_key(ADDR));
        client.close().await;
    }
}
