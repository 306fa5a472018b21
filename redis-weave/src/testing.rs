//! Scriptable RESP3 server for tests
//!
//! One engine serves two transports. [`MockDialer`] plugs into
//! [`ClientConfig`](crate::ClientConfig) as a [`Dialer`] and answers over
//! in-memory pipes, any number of addresses at once. [`MockServer`] listens
//! on a local TCP port for tests that go through the real dialer.
//!
//! The server answers the client handshake, keeps a string keyspace with
//! PTTLs, queues `MULTI` transactions, tracks subscriptions per connection
//! and fans `PUBLISH` out to them byte for byte. Every command after the
//! handshake is logged. A handler can script any reply before the built-in
//! table is consulted.
//!
//! Enabled for the crate's own tests and behind the `test-util` feature.

use crate::connection::{BoxedStream, Dialer};
use crate::protocol::{MessageReader, Resp3Encoder};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use redis_weave_core::{error::RedisError, error::RedisResult, message::Message};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Scripts replies by address and arguments; `None` falls through to the
/// built-in command table
pub type Handler = Arc<dyn Fn(&str, &[String]) -> Option<Vec<Message>> + Send + Sync>;

enum Frame {
    Push(Message),
    Close,
}

#[derive(Default)]
struct Keyspace {
    values: HashMap<String, String>,
    pttl: HashMap<String, i64>,
}

struct Conn {
    id: usize,
    addr: String,
    tx: mpsc::UnboundedSender<Frame>,
    channels: HashSet<Bytes>,
    patterns: HashSet<Bytes>,
}

struct State {
    version: Mutex<String>,
    handler: Mutex<Option<Handler>>,
    keyspace: Mutex<Keyspace>,
    log: Mutex<Vec<(String, Vec<String>)>>,
    handshakes: Mutex<Vec<(String, String)>>,
    conns: Mutex<Vec<Conn>>,
    refused: Mutex<HashSet<String>>,
    drop_on: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    dials: Mutex<Vec<String>>,
    next_id: AtomicUsize,
}

impl State {
    fn new(handler: Option<Handler>) -> Arc<Self> {
        Arc::new(Self {
            version: Mutex::new("7.2.4".to_string()),
            handler: Mutex::new(handler),
            keyspace: Mutex::new(Keyspace::default()),
            log: Mutex::new(Vec::new()),
            handshakes: Mutex::new(Vec::new()),
            conns: Mutex::new(Vec::new()),
            refused: Mutex::new(HashSet::new()),
            drop_on: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
            dials: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        })
    }

    /// Register a connection and start serving it
    fn attach<S>(self: &Arc<Self>, addr: &str, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.dials.lock().push(addr.to_string());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.conns.lock().push(Conn {
            id,
            addr: addr.to_string(),
            tx,
            channels: HashSet::new(),
            patterns: HashSet::new(),
        });
        tokio::spawn(serve(self.clone(), id, addr.to_string(), stream, rx));
    }

    fn send(&self, addr: Option<&str>, frame: impl Fn() -> Frame) {
        for conn in self.conns.lock().iter() {
            if addr.map_or(true, |a| a == conn.addr) {
                let _ = conn.tx.send(frame());
            }
        }
    }

    fn set(&self, key: &str, value: &str, pttl: i64) {
        let mut ks = self.keyspace.lock();
        ks.values.insert(key.to_string(), value.to_string());
        ks.pttl.insert(key.to_string(), pttl);
    }

    fn commands(&self, addr: Option<&str>) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|(a, _)| addr.map_or(true, |addr| a == addr))
            .map(|(_, args)| args.join(" "))
            .collect()
    }
}

/// In-memory [`Dialer`] backed by the mock server
#[derive(Clone)]
pub struct MockDialer {
    state: Arc<State>,
}

impl Default for MockDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDialer {
    /// A server reporting version 7.2.4 with only built-in commands
    pub fn new() -> Self {
        Self { state: State::new(None) }
    }

    /// A server that asks `handler` first, with the dialed address
    pub fn with_handler(
        handler: impl Fn(&str, &[String]) -> Option<Vec<Message>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: State::new(Some(Arc::new(handler))),
        }
    }

    /// Report `version` in the `HELLO` reply
    #[must_use]
    pub fn with_version(self, version: &str) -> Self {
        *self.state.version.lock() = version.to_string();
        self
    }

    /// Store a string key; a negative `pttl` means no expiry
    pub fn set(&self, key: &str, value: &str, pttl: i64) {
        self.state.set(key, value, pttl);
    }

    /// Commands received after the handshake, joined with spaces
    pub fn commands(&self) -> Vec<String> {
        self.state.commands(None)
    }

    /// [`commands`](Self::commands) sent to one address
    pub fn commands_to(&self, addr: &str) -> Vec<String> {
        self.state.commands(Some(addr))
    }

    /// Handshake commands sent to one address, such as `READONLY`
    pub fn handshakes(&self, addr: &str) -> Vec<String> {
        self.state
            .handshakes
            .lock()
            .iter()
            .filter(|(a, _)| a == addr)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    /// Connection attempts to `addr`, refused ones included
    pub fn dials(&self, addr: &str) -> usize {
        self.state.dials.lock().iter().filter(|a| *a == addr).count()
    }

    /// Fail every later dial to `addr`
    pub fn refuse(&self, addr: &str) {
        self.state.refused.lock().insert(addr.to_string());
    }

    /// Hang up on whichever connection receives `name`, without replying
    pub fn drop_on(&self, name: &str) {
        self.state.drop_on.lock().insert(name.to_ascii_uppercase());
    }

    /// Answer `name` only after `delay`, holding up that connection
    pub fn delay_on(&self, name: &str, delay: Duration) {
        self.state.delays.lock().insert(name.to_ascii_uppercase(), delay);
    }

    /// Send an unsolicited frame on every live connection to `addr`
    pub fn push(&self, addr: &str, msg: Message) {
        self.state.send(Some(addr), || Frame::Push(msg.clone()));
    }

    /// Drop every connection to `addr` from the server side
    pub fn kill(&self, addr: &str) {
        self.state.send(Some(addr), || Frame::Close);
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, addr: &str) -> RedisResult<BoxedStream> {
        if self.state.refused.lock().contains(addr) {
            self.state.dials.lock().push(addr.to_string());
            return Err(RedisError::Connection(format!("connection refused: {}", addr)));
        }
        let (client, server) = tokio::io::duplex(1 << 16);
        self.state.attach(addr, server);
        Ok(Box::new(client))
    }
}

/// The mock server on a local TCP port
pub struct MockServer {
    addr: String,
    state: Arc<State>,
    task: JoinHandle<()>,
}

impl MockServer {
    /// Listen on an ephemeral port
    ///
    /// # Panics
    ///
    /// When no local port can be bound.
    pub async fn start() -> Self {
        Self::start_with_version("7.2.4").await
    }

    /// [`start`](Self::start) reporting `version` in the `HELLO` reply
    ///
    /// # Panics
    ///
    /// When no local port can be bound.
    pub async fn start_with_version(version: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = State::new(None);
        *state.version.lock() = version.to_string();
        let task = tokio::spawn(accept(listener, addr.clone(), state.clone()));
        Self { addr, state, task }
    }

    /// `127.0.0.1:<port>`
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The bound port
    pub fn port(&self) -> u16 {
        self.addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or_default()
    }

    /// Script replies ahead of the built-in table
    pub fn handle(&self, handler: impl Fn(&[String]) -> Option<Vec<Message>> + Send + Sync + 'static) {
        *self.state.handler.lock() = Some(Arc::new(move |_: &str, args: &[String]| handler(args)));
    }

    /// Store a string key; a negative `pttl` means no expiry
    pub fn set(&self, key: &str, value: &str, pttl: i64) {
        self.state.set(key, value, pttl);
    }

    /// Commands received after the handshake, joined with spaces
    pub fn commands(&self) -> Vec<String> {
        self.state.commands(None)
    }

    /// How many times exactly `cmd` was received
    pub fn count(&self, cmd: &str) -> usize {
        self.commands().iter().filter(|c| *c == cmd).count()
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> usize {
        self.state.dials.lock().len()
    }

    /// Hang up on whichever connection receives `name`
    pub fn drop_on(&self, name: &str) {
        self.state.drop_on.lock().insert(name.to_ascii_uppercase());
    }

    /// Answer `name` only after `delay`, holding up that connection
    pub fn delay_on(&self, name: &str, delay: Duration) {
        self.state.delays.lock().insert(name.to_ascii_uppercase(), delay);
    }

    /// Send a frame on every open connection
    pub fn push(&self, msg: Message) {
        self.state.send(None, || Frame::Push(msg.clone()));
    }

    /// Close every open connection
    pub fn kill_all(&self) {
        self.state.send(None, || Frame::Close);
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
        self.kill_all();
    }
}

/// `CLUSTER SLOTS` reply; each range has a primary port followed by its
/// replica ports, all on 127.0.0.1
pub fn cluster_slots(ranges: &[(i64, i64, &[u16])]) -> Vec<Message> {
    let entries = ranges
        .iter()
        .map(|&(start, end, ports)| {
            let mut entry = vec![Message::int(start), Message::int(end)];
            entry.extend(ports.iter().map(|&port| {
                Message::array(vec![Message::blob("127.0.0.1"), Message::int(i64::from(port))])
            }));
            Message::array(entry)
        })
        .collect();
    vec![Message::array(entries)]
}

/// Whether `args` is `CLUSTER SLOTS`
pub fn is_cluster_slots(args: &[String]) -> bool {
    args.len() == 2 && args[0].eq_ignore_ascii_case("CLUSTER") && args[1].eq_ignore_ascii_case("SLOTS")
}

async fn accept(listener: TcpListener, addr: String, state: Arc<State>) {
    while let Ok((stream, _)) = listener.accept().await {
        state.attach(&addr, stream);
    }
}

async fn serve<S>(
    state: Arc<State>,
    id: usize,
    addr: String,
    stream: S,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = MessageReader::new(read, 4096);
    let mut multi: Option<Vec<Vec<String>>> = None;
    let mut out = BytesMut::new();

    loop {
        let replies = tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(Frame::Push(msg)) => vec![msg],
                Some(Frame::Close) | None => break,
            },
            msg = reader.read_message() => {
                let Ok(msg) = msg else { break };
                let raw: Vec<Bytes> = msg
                    .children()
                    .iter()
                    .map(|m| m.as_bytes().cloned().unwrap_or_default())
                    .collect();
                let args: Vec<String> = msg.children().iter().map(Message::to_string_lossy).collect();
                let name = args.first().map(|n| n.to_ascii_uppercase()).unwrap_or_default();
                if state.drop_on.lock().contains(&name) {
                    state.log.lock().push((addr.clone(), args));
                    break;
                }
                let delay = state.delays.lock().get(&name).copied();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                respond(&state, id, &addr, &mut multi, &args, &raw)
            }
        };
        for reply in &replies {
            Resp3Encoder::encode_message(reply, &mut out);
        }
        if write.write_all(&out).await.is_err() {
            break;
        }
        out.clear();
    }
    state.conns.lock().retain(|c| c.id != id);
}

fn ok() -> Message {
    Message::simple("OK")
}

fn respond(
    state: &State,
    id: usize,
    addr: &str,
    multi: &mut Option<Vec<Vec<String>>>,
    args: &[String],
    raw: &[Bytes],
) -> Vec<Message> {
    let name = args.first().map(|n| n.to_ascii_uppercase()).unwrap_or_default();
    let sub = args.get(1).map(|n| n.to_ascii_uppercase()).unwrap_or_default();

    match (name.as_str(), sub.as_str()) {
        ("HELLO", _) => {
            state.handshakes.lock().push((addr.to_string(), name));
            let version = state.version.lock().clone();
            return vec![Message::map(vec![
                (Message::blob("server"), Message::blob("redis")),
                (Message::blob("version"), Message::blob(version)),
                (Message::blob("proto"), Message::int(3)),
            ])];
        }
        ("CLIENT", "TRACKING") | ("CLIENT", "SETINFO") | ("SELECT", _) | ("READONLY", _) => {
            state.handshakes.lock().push((addr.to_string(), args.join(" ")));
            return vec![ok()];
        }
        _ => {}
    }

    state.log.lock().push((addr.to_string(), args.to_vec()));
    let handler = state.handler.lock().clone();
    if let Some(replies) = handler.as_ref().and_then(|h| h(addr, args)) {
        return replies;
    }

    if let Some(queued) = multi.as_mut() {
        return match name.as_str() {
            "EXEC" => {
                let queued = multi.take().unwrap_or_default();
                let replies = queued
                    .iter()
                    .map(|cmd| {
                        handler
                            .as_ref()
                            .and_then(|h| h(addr, cmd))
                            .and_then(|r| r.into_iter().next())
                            .unwrap_or_else(|| builtin(state, cmd))
                    })
                    .collect();
                vec![Message::array(replies)]
            }
            "DISCARD" => {
                *multi = None;
                vec![ok()]
            }
            "MULTI" => vec![Message::error_line("ERR MULTI calls can not be nested")],
            _ => {
                queued.push(args.to_vec());
                vec![Message::simple("QUEUED")]
            }
        };
    }

    match name.as_str() {
        "MULTI" => {
            *multi = Some(Vec::new());
            vec![ok()]
        }
        "DISCARD" => vec![Message::error_line("ERR DISCARD without MULTI")],
        "SUBSCRIBE" | "PSUBSCRIBE" | "UNSUBSCRIBE" | "PUNSUBSCRIBE" | "SUNSUBSCRIBE" => {
            subscriptions(state, id, &name, raw)
        }
        "PUBLISH" if raw.len() == 3 => vec![Message::int(publish(state, &raw[1], &raw[2]))],
        _ => vec![builtin(state, args)],
    }
}

fn subscriptions(state: &State, id: usize, name: &str, raw: &[Bytes]) -> Vec<Message> {
    let kind = name.to_ascii_lowercase();
    let mut conns = state.conns.lock();
    let Some(conn) = conns.iter_mut().find(|c| c.id == id) else {
        return Vec::new();
    };
    let set = if name.contains("PSUB") || name.contains("PUNSUB") {
        &mut conn.patterns
    } else {
        &mut conn.channels
    };
    let subscribe = !name.contains("UNSUB");
    let targets: Vec<Bytes> = match (subscribe, raw.len()) {
        (false, 1) => set.iter().cloned().collect(),
        _ => raw[1..].to_vec(),
    };
    if targets.is_empty() {
        return vec![Message::push(vec![Message::blob(kind), Message::null(), Message::int(0)])];
    }
    targets
        .into_iter()
        .map(|ch| {
            if subscribe {
                set.insert(ch.clone());
            } else {
                set.remove(&ch);
            }
            Message::push(vec![
                Message::blob(kind.clone()),
                Message::blob(ch),
                Message::int(set.len() as i64),
            ])
        })
        .collect()
}

/// Deliver to channel subscribers and to patterns of the `prefix*` form
fn publish(state: &State, channel: &Bytes, payload: &Bytes) -> i64 {
    let mut delivered = 0;
    for conn in state.conns.lock().iter() {
        if conn.channels.contains(channel) {
            delivered += 1;
            let _ = conn.tx.send(Frame::Push(Message::push(vec![
                Message::blob("message"),
                Message::blob(channel.clone()),
                Message::blob(payload.clone()),
            ])));
        }
        for pattern in &conn.patterns {
            let matched = match pattern.strip_suffix(b"*") {
                Some(prefix) => channel.starts_with(prefix),
                None => pattern == channel,
            };
            if matched {
                delivered += 1;
                let _ = conn.tx.send(Frame::Push(Message::push(vec![
                    Message::blob("pmessage"),
                    Message::blob(pattern.clone()),
                    Message::blob(channel.clone()),
                    Message::blob(payload.clone()),
                ])));
            }
        }
    }
    delivered
}

fn builtin(state: &State, args: &[String]) -> Message {
    let name = args.first().map(|n| n.to_ascii_uppercase()).unwrap_or_default();
    let mut ks = state.keyspace.lock();
    match (name.as_str(), args.len()) {
        ("PING", _) => Message::simple("PONG"),
        ("ECHO", 2) => Message::blob(args[1].clone()),
        ("ASKING", _) | ("CLIENT", _) => ok(),
        ("CLUSTER", _) => Message::error_line("ERR This instance has cluster support disabled"),
        ("GET", 2) => ks
            .values
            .get(&args[1])
            .map(|v| Message::blob(v.clone()))
            .unwrap_or_else(Message::null),
        ("SET", 3) => {
            ks.values.insert(args[1].clone(), args[2].clone());
            ks.pttl.remove(&args[1]);
            ok()
        }
        ("DEL", _) => {
            let n = args[1..].iter().filter(|k| ks.values.remove(*k).is_some()).count();
            Message::int(n as i64)
        }
        ("PTTL", 2) => match ks.values.contains_key(&args[1]) {
            true => Message::int(ks.pttl.get(&args[1]).copied().unwrap_or(-1)),
            false => Message::int(-2),
        },
        ("RPUSH", n) if n >= 3 => Message::int((n - 2) as i64),
        _ => Message::error_line(format!("ERR unknown command '{}'", args.join(" "))),
    }
}
