//! Dialing and connection handshake
//!
//! A [`Dialer`] turns an address into a byte stream. The default
//! [`TcpDialer`] applies the socket options from [`ClientConfig`]; a custom
//! dialer can wrap the stream in TLS or connect over a unix socket.
//! [`Connection::open`] then runs the RESP3 handshake on the stream.

use crate::protocol::{CommandWriter, MessageReader};
use async_trait::async_trait;
use redis_weave_core::{
    command::Command,
    config::ClientConfig,
    error::{RedisError, RedisResult},
    message::Message,
};
use socket2::{SockRef, TcpKeepalive};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// A bidirectional byte stream usable as a Redis connection
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {}

/// Type-erased connection stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens streams to Redis nodes
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connect to `host:port`
    async fn dial(&self, addr: &str) -> RedisResult<BoxedStream>;
}

/// Plain TCP dialer
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
    keepalive: Option<Duration>,
    nodelay: bool,
}

impl TcpDialer {
    /// Build a dialer from the socket options in `config`
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            keepalive: config.tcp_keepalive,
            nodelay: !config.disable_tcp_nodelay,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> RedisResult<BoxedStream> {
        debug!("Connecting to Redis at {}", addr);

        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RedisError::Timeout)?
            .map_err(|e| RedisError::Connection(format!("Failed to connect to {}: {}", addr, e)))?;

        stream.set_nodelay(self.nodelay)?;
        if let Some(time) = self.keepalive {
            let keepalive = TcpKeepalive::new().with_time(time);
            if let Err(err) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
                warn!(addr = %addr, error = %err, "failed to set TCP keepalive");
            }
        }
        Ok(Box::new(stream))
    }
}

/// What the server told us during the handshake
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    /// The `HELLO` reply map
    pub info: HashMap<String, Message>,
    /// Major server version, 0 when unknown
    pub version: u32,
    /// Whether invalidation tracking was enabled
    pub tracking: bool,
    /// Whether tracking runs in opt-in mode
    pub opt_in: bool,
}

impl ServerInfo {
    fn from_hello(reply: &Message) -> RedisResult<Self> {
        let info = reply.as_map()?;
        let version = info
            .get("version")
            .and_then(|v| v.as_str().ok())
            .and_then(|v| v.split('.').next())
            .and_then(|major| major.parse().ok())
            .unwrap_or(0);
        Ok(Self {
            info,
            version,
            tracking: false,
            opt_in: false,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Step {
    Hello,
    Tracking,
    Select,
    ReadOnly,
    SetInfo,
}

fn handshake_commands(config: &ClientConfig) -> Vec<(Step, Command)> {
    let mut hello = Command::builder("HELLO").arg("3");
    if let Some(password) = &config.password {
        let username = config.username.as_deref().unwrap_or("default");
        hello = hello.arg("AUTH").arg(username).arg(password);
    }
    if let Some(name) = &config.client_name {
        hello = hello.arg("SETNAME").arg(name);
    }

    let mut init = vec![(Step::Hello, hello.build())];
    if !config.disable_cache {
        let options = config
            .client_tracking_options
            .clone()
            .unwrap_or_else(|| vec!["OPTIN".to_string()]);
        let tracking = Command::builder("CLIENT")
            .arg("TRACKING")
            .arg("ON")
            .args(options)
            .build();
        init.push((Step::Tracking, tracking));
    }
    if config.select_db != 0 {
        init.push((
            Step::Select,
            Command::builder("SELECT").arg(config.select_db).build(),
        ));
    }
    if config.replica_only {
        init.push((Step::ReadOnly, Command::from_args(["READONLY"])));
    }
    if let Some((name, version)) = &config.client_set_info {
        init.push((
            Step::SetInfo,
            Command::builder("CLIENT").arg("SETINFO").arg("LIB-NAME").arg(name).build(),
        ));
        init.push((
            Step::SetInfo,
            Command::builder("CLIENT").arg("SETINFO").arg("LIB-VER").arg(version).build(),
        ));
    }
    init
}

/// A handshaken connection, split into its buffered halves
pub struct Connection {
    /// Read half
    pub reader: MessageReader<ReadHalf<BoxedStream>>,
    /// Write half
    pub writer: CommandWriter<WriteHalf<BoxedStream>>,
    /// Handshake result
    pub info: ServerInfo,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("info", &self.info).finish()
    }
}

impl Connection {
    /// Dial `addr` and run the handshake, bounded by `connect_timeout`
    ///
    /// # Errors
    ///
    /// Dial failures, [`RedisError::Protocol`] when `HELLO 3` is refused,
    /// [`RedisError::NoCache`] when `CLIENT TRACKING` is refused and the
    /// server error of a failed `SELECT`.
    pub async fn open(addr: &str, config: &ClientConfig, dialer: &dyn Dialer) -> RedisResult<Self> {
        let stream = dialer.dial(addr).await?;
        let (read, write) = tokio::io::split(stream);
        let mut conn = Self {
            reader: MessageReader::new(read, config.read_buffer_each_conn),
            writer: CommandWriter::new(write, config.write_buffer_each_conn),
            info: ServerInfo::default(),
        };
        timeout(config.connect_timeout, conn.handshake(config))
            .await
            .map_err(|_| RedisError::Timeout)??;
        debug!(addr = %addr, version = conn.info.version, "handshake complete");
        Ok(conn)
    }

    async fn handshake(&mut self, config: &ClientConfig) -> RedisResult<()> {
        let init = handshake_commands(config);
        for (_, cmd) in &init {
            self.writer.write_command(cmd);
        }
        self.writer.flush().await?;

        for (step, _) in &init {
            let reply = self.reader.read_reply().await?;
            let err = reply.error();
            match (step, err) {
                (Step::Hello, Some(err)) => {
                    return Err(RedisError::Protocol(format!("HELLO 3 rejected: {}", err)))
                }
                (Step::Hello, None) => self.info = ServerInfo::from_hello(&reply)?,
                (Step::Tracking, Some(err)) => return Err(RedisError::NoCache(err.to_string())),
                (Step::Tracking, None) => {
                    self.info.tracking = true;
                    self.info.opt_in = config.tracking_opt_in();
                }
                (Step::Select | Step::ReadOnly, Some(err)) => return Err(err),
                (Step::SetInfo, Some(err)) => {
                    debug!(error = %err, "CLIENT SETINFO ignored");
                }
                _ => {}
            }
        }
        Ok(())
    }
}
