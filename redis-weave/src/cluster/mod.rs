//! Redis Cluster routing
//!
//! The router keeps one [`Mux`] per known node and a slot table mapping each
//! of the 16384 hash slots to the group that owns it. The table lives in an
//! [`ArcSwap`] so lookups never lock; every change builds a new table and
//! swaps it in.
//!
//! Replies drive the routing state:
//! - `MOVED` opens (or reuses) a group for the new owner, retargets the slot
//!   and resends.
//! - `ASK` resends once behind `ASKING` without touching the table.
//! - `TRYAGAIN`, `CLUSTERDOWN`, `LOADING` and transport failures schedule a
//!   topology refresh and, for reads, retry with backoff.

mod redirect;
mod topology;

use crate::connection::Dialer;
use crate::dedicated::shared_slot;
use crate::mux::{is_asking, Mux, MuxCloseHook};
use crate::pool::Pooled;
use crate::pubsub::{PubSubMessage, SubscriptionHook};
use crate::queue::Replies;
use crate::retry::RetryPolicy;
use arc_swap::ArcSwap;
use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use redirect::{classify, classify_error, error_of, Redirect};
use redis_weave_core::{
    command::{Cacheable, CacheableTtl, Command, CLUSTER_SLOTS, INIT_SLOT, NO_SLOT},
    config::ClientConfig,
    error::{split_host_port, RedisError, RedisResult},
    message::Message,
    types::NodeInfo,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use topology::{parse_shards, parse_slots, Node, Replicas, Shard, Topology};
use tracing::{debug, info, warn};

/// Grace period before a connection dropped from the topology is closed
const REMOVED_CLOSE_DELAY: Duration = Duration::from_secs(5);
const LAZY_REFRESH_DELAY: Duration = Duration::from_secs(1);
/// Nodes queried at once during a refresh
const REFRESH_FANOUT: usize = 4;

fn asking() -> Command {
    Command::from_args(["ASKING"])
}

#[derive(Default)]
struct LazyState {
    scheduled: bool,
    last: Option<Instant>,
}

struct Inner {
    config: Arc<ClientConfig>,
    replica_config: Arc<ClientConfig>,
    dialer: Arc<dyn Dialer>,
    topology: ArcSwap<Topology>,
    writer: Mutex<()>,
    refresh: tokio::sync::Mutex<RedisResult<()>>,
    rounds: AtomicU64,
    lazy: Mutex<LazyState>,
    retry: RetryPolicy,
    stopped: AtomicBool,
    stop: watch::Sender<bool>,
    me: Weak<Inner>,
}

#[derive(Clone)]
pub(crate) struct ClusterClient {
    inner: Arc<Inner>,
}

/// Commands headed for one node
struct Batch {
    mux: Mux,
    plain: Vec<usize>,
    /// Sent behind `ASKING`
    asking: Vec<usize>,
}

fn batch_for<'a>(batches: &'a mut Vec<Batch>, mux: &Mux) -> &'a mut Batch {
    let i = match batches.iter().position(|b| b.mux.same(mux)) {
        Some(i) => i,
        None => {
            batches.push(Batch {
                mux: mux.clone(),
                plain: Vec::new(),
                asking: Vec::new(),
            });
            batches.len() - 1
        }
    };
    &mut batches[i]
}

#[derive(Clone, Copy)]
enum Work<'a> {
    Plain(&'a [Command]),
    Cached(&'a [CacheableTtl]),
}

impl<'a> Work<'a> {
    fn len(&self) -> usize {
        match self {
            Work::Plain(cmds) => cmds.len(),
            Work::Cached(cmds) => cmds.len(),
        }
    }

    fn command(&self, i: usize) -> &'a Command {
        match *self {
            Work::Plain(cmds) => &cmds[i],
            Work::Cached(cmds) => cmds[i].cmd.command(),
        }
    }

    fn readonly(&self, i: usize) -> bool {
        matches!(self, Work::Cached(_)) || self.command(i).is_readonly()
    }
}

#[derive(Default)]
struct Round {
    redirected: bool,
    retry: Option<RedisError>,
}

/// The `MULTI ... EXEC` block around position `pos` of a sent batch, if its
/// `MULTI` was accepted
fn transaction_around(
    idx: &[usize],
    pos: usize,
    work: Work<'_>,
    results: &[Option<RedisResult<Message>>],
) -> Option<(usize, usize)> {
    let marker = |p: &usize| {
        let cmd = work.command(idx[*p]);
        cmd.is_multi() || cmd.is_exec()
    };
    let start = (0..=pos).rev().find(marker)?;
    let end = (pos..idx.len()).find(marker)?;
    if !work.command(idx[start]).is_multi() || !work.command(idx[end]).is_exec() {
        return None;
    }
    let accepted = matches!(
        &results[idx[start]],
        Some(Ok(msg)) if msg.as_str().map_or(false, |s| s == "OK")
    );
    accepted.then_some((start, end))
}

impl ClusterClient {
    /// Seed from the init addresses, load the slot table and start the
    /// periodic refresh if configured
    pub async fn connect(config: Arc<ClientConfig>, dialer: Arc<dyn Dialer>) -> RedisResult<Self> {
        let (stop, _) = watch::channel(false);
        let replica_config = Arc::new(ClientConfig {
            replica_only: true,
            ..(*config).clone()
        });
        let inner = Arc::new_cyclic(|me| Inner {
            retry: RetryPolicy::new(config.retry.clone()),
            config: config.clone(),
            replica_config,
            dialer,
            topology: ArcSwap::from_pointee(Topology::default()),
            writer: Mutex::new(()),
            refresh: tokio::sync::Mutex::new(Ok(())),
            rounds: AtomicU64::new(0),
            lazy: Mutex::new(LazyState::default()),
            stopped: AtomicBool::new(false),
            stop,
            me: me.clone(),
        });
        let client = Self { inner };

        client.inner.init().await?;
        if let Err(err) = client.inner.refresh().await {
            client.close().await;
            return Err(err);
        }
        if let Some(every) = config.shards_refresh_interval {
            tokio::spawn(refresh_ticker(
                Arc::downgrade(&client.inner),
                client.inner.stop.subscribe(),
                every,
            ));
        }
        Ok(client)
    }

    pub async fn execute(&self, cmd: Command) -> RedisResult<Message> {
        self.inner.route(Single::Plain(&cmd)).await
    }

    pub async fn execute_cached(&self, cmd: &Cacheable, ttl: Duration) -> RedisResult<Message> {
        self.inner.route(Single::Cached(cmd, ttl)).await
    }

    pub async fn execute_multi(&self, cmds: Vec<Command>) -> Replies {
        self.inner.route_batch(Work::Plain(&cmds)).await
    }

    pub async fn execute_multi_cached(&self, cmds: &[CacheableTtl]) -> Replies {
        self.inner.route_batch(Work::Cached(cmds)).await
    }

    pub async fn receive<F>(
        &self,
        subscribe: Command,
        mut on_message: F,
        on_subscription: Option<SubscriptionHook>,
    ) -> RedisResult<()>
    where
        F: FnMut(PubSubMessage) + Send,
    {
        let inner = &self.inner;
        let mut attempts = 1;
        loop {
            let mux = inner.pick(subscribe.slot(), inner.to_replica(&subscribe)).await?;
            let err = match mux
                .receive(subscribe.clone(), &mut on_message, on_subscription.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(RedisError::ConnExpired) => continue,
                Err(err) => err,
            };
            if inner.observe(classify_error(&err)).is_none()
                || !inner.retry.should_retry(attempts, true, &err)
            {
                return Err(err);
            }
            inner.retry.wait(attempts, &err).await;
            attempts += 1;
        }
    }

    /// Write `cmds` for streaming on the node serving all of their keys
    pub async fn stream(&self, cmds: &[Command]) -> RedisResult<(Mux, Pooled)> {
        let mux = self.inner.pick(shared_slot(cmds), false).await?;
        let pooled = mux.stream(cmds).await?;
        Ok((mux, pooled))
    }

    /// Connection groups of the nodes in the current view, seeds excluded
    pub(crate) fn node_muxes(&self) -> Vec<(String, Mux)> {
        self.inner
            .topology
            .load()
            .conns
            .iter()
            .filter(|(_, node)| !node.hidden)
            .map(|(addr, node)| (addr.clone(), node.mux.clone()))
            .collect()
    }

    pub(crate) fn config(&self) -> &Arc<ClientConfig> {
        &self.inner.config
    }

    /// Borrow a connection to the node owning `slot`
    pub async fn acquire(&self, slot: u16) -> RedisResult<(Mux, Pooled)> {
        let mux = self.inner.pick(slot, false).await?;
        let pooled = mux.acquire().await?;
        Ok((mux, pooled))
    }

    /// Fetch the slot table now
    pub async fn refresh(&self) -> RedisResult<()> {
        self.inner.refresh().await
    }

    /// Addresses of every node in the current view, seeds excluded
    pub fn nodes(&self) -> Vec<String> {
        let topology = self.inner.topology.load();
        let mut nodes: Vec<String> = topology
            .conns
            .iter()
            .filter(|(_, node)| !node.hidden)
            .map(|(addr, _)| addr.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Nodes with the slot ranges they serve
    pub fn shards(&self) -> Vec<NodeInfo> {
        self.inner.topology.load().nodes()
    }

    pub async fn close(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.stop.send_replace(true);
        let topology = self.inner.topology.load_full();
        join_all(topology.conns.values().map(|node| node.mux.close())).await;
    }
}

#[derive(Clone, Copy)]
enum Single<'a> {
    Plain(&'a Command),
    Cached(&'a Cacheable, Duration),
}

impl<'a> Single<'a> {
    fn command(&self) -> &'a Command {
        match *self {
            Single::Plain(cmd) => cmd,
            Single::Cached(cmd, _) => cmd.command(),
        }
    }
}

impl Inner {
    async fn init(&self) -> RedisResult<()> {
        let mut dials: FuturesUnordered<_> = self
            .config
            .init_address
            .iter()
            .map(|addr| {
                let mux = self.new_mux(addr, false);
                async move {
                    let result = mux.dial().await;
                    (mux, result)
                }
            })
            .collect();

        let mut first_err = None;
        while let Some((mux, result)) = dials.next().await {
            match result {
                Ok(()) => {
                    let _writer = self.writer.lock();
                    let mut next = Topology::clone(&self.topology.load());
                    next.conns
                        .insert(mux.addr().to_string(), Node { mux, hidden: false });
                    self.topology.store(Arc::new(next));
                    return Ok(());
                }
                Err(err) => {
                    debug!(addr = %mux.addr(), error = %err, "seed node unreachable");
                    first_err.get_or_insert(err);
                }
            }
        }
        Err(first_err.unwrap_or_else(|| RedisError::Config("no init address".to_string())))
    }

    fn new_mux(&self, addr: &str, replica: bool) -> Mux {
        let me = self.me.clone();
        let on_close: MuxCloseHook = Arc::new(move |addr: &str, err: &RedisError| {
            if let Some(inner) = me.upgrade() {
                debug!(addr = %addr, error = %err, "cluster connection lost");
                inner.lazy_refresh();
            }
        });
        let config = if replica && self.config.send_to_replicas.is_some() {
            &self.replica_config
        } else {
            &self.config
        };
        Mux::new(addr, config.clone(), self.dialer.clone(), Some(on_close))
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn to_replica(&self, cmd: &Command) -> bool {
        self.config
            .send_to_replicas
            .as_ref()
            .map_or(false, |allowed| allowed(cmd))
    }

    /// Schedule a refresh for any reply that needs one
    fn observe(&self, redirect: Redirect) -> Redirect {
        if self.is_stopped() {
            return Redirect::None;
        }
        if !redirect.is_none() {
            self.lazy_refresh();
        }
        redirect
    }

    async fn pick(&self, slot: u16, to_replica: bool) -> RedisResult<Mux> {
        if slot == NO_SLOT {
            return Err(RedisError::CrossSlot);
        }
        let selector = self.config.replica_selector.as_ref();
        if let Some(mux) = self.topology.load().pick(slot, to_replica, selector) {
            return Ok(mux);
        }
        self.refresh().await?;
        self.topology
            .load()
            .pick(slot, to_replica, selector)
            .ok_or(RedisError::NoSlot)
    }

    /// Single-flight refresh: callers arriving while one runs share its result
    async fn refresh(&self) -> RedisResult<()> {
        let seen = self.rounds.load(Ordering::Acquire);
        let mut last = self.refresh.lock().await;
        if self.rounds.load(Ordering::Acquire) != seen {
            return last.clone();
        }
        let result = self.fetch_topology().await;
        *last = result.clone();
        self.rounds.fetch_add(1, Ordering::AcqRel);
        self.lazy.lock().last = Some(Instant::now());
        result
    }

    /// Refresh in the background, at most once per second
    fn lazy_refresh(&self) {
        if self.is_stopped() {
            return;
        }
        let delay = {
            let mut lazy = self.lazy.lock();
            if lazy.scheduled {
                return;
            }
            lazy.scheduled = true;
            lazy.last.map_or(Duration::ZERO, |last| {
                (last + LAZY_REFRESH_DELAY).saturating_duration_since(Instant::now())
            })
        };
        let (Some(inner), Ok(handle)) = (self.me.upgrade(), Handle::try_current()) else {
            self.lazy.lock().scheduled = false;
            return;
        };
        handle.spawn(async move {
            sleep(delay).await;
            inner.lazy.lock().scheduled = false;
            if inner.is_stopped() {
                return;
            }
            if let Err(err) = inner.refresh().await {
                warn!(error = %err, "cluster topology refresh failed");
            }
        });
    }

    async fn query_slots(&self, mux: &Mux) -> RedisResult<HashMap<String, Shard>> {
        let version = mux.version().await?;
        let cmd = if version < 8 {
            Command::from_args(["CLUSTER", "SLOTS"])
        } else {
            Command::from_args(["CLUSTER", "SHARDS"])
        };
        let reply = if self.config.conn_write_timeout.is_zero() {
            mux.execute(cmd).await?
        } else {
            timeout(self.config.conn_write_timeout, mux.execute(cmd))
                .await
                .map_err(|_| RedisError::Timeout)??
        };
        let reply = reply.into_result()?;
        Ok(if version < 8 {
            parse_slots(&reply, mux.addr())
        } else {
            parse_shards(&reply, mux.addr(), self.config.tls_ports)
        })
    }

    async fn fetch_topology(&self) -> RedisResult<()> {
        let known: Vec<Mux> = self
            .topology
            .load()
            .conns
            .values()
            .map(|node| node.mux.clone())
            .collect();
        if known.is_empty() {
            return Err(RedisError::Connection("no cluster node to query".to_string()));
        }

        let mut found = None;
        let mut last_err = None;
        'batches: for batch in known.chunks(REFRESH_FANOUT) {
            for reply in join_all(batch.iter().map(|mux| self.query_slots(mux))).await {
                match reply {
                    Ok(shards) if !shards.is_empty() => {
                        found = Some(shards);
                        break 'batches;
                    }
                    Ok(_) => {}
                    Err(err) => last_err = Some(err),
                }
            }
        }
        match (found, last_err) {
            (Some(shards), _) => self.install(shards),
            (None, Some(err)) => {
                warn!(error = %err, "no node answered the slot query");
                return Err(err);
            }
            (None, None) => self.install(HashMap::new()),
        }
        Ok(())
    }

    fn install(&self, shards: HashMap<String, Shard>) {
        let _writer = self.writer.lock();
        let current = self.topology.load_full();
        let reuse = |addr: &str, replica: bool| {
            current
                .conns
                .get(addr)
                .map(|node| node.mux.clone())
                .unwrap_or_else(|| self.new_mux(addr, replica))
        };

        let mut conns = HashMap::new();
        for shard in shards.values() {
            for (i, addr) in shard.nodes.iter().enumerate() {
                let node = Node {
                    mux: reuse(addr, i > 0),
                    hidden: false,
                };
                conns.insert(addr.clone(), node);
            }
        }
        for addr in &self.config.init_address {
            if !conns.contains_key(addr) {
                let node = Node {
                    mux: reuse(addr, false),
                    hidden: true,
                };
                conns.insert(addr.clone(), node);
            }
        }

        let replicas = self.config.send_to_replicas.is_some();
        let mut wslots = vec![None; CLUSTER_SLOTS as usize];
        let mut rslots = if replicas {
            vec![None; CLUSTER_SLOTS as usize]
        } else {
            Vec::new()
        };
        for shard in shards.values() {
            let Some(primary) = shard.nodes.first().and_then(|a| conns.get(a)).map(|n| n.mux.clone()) else {
                continue;
            };
            let readable = replicas.then(|| {
                let mut read = Replicas {
                    primary: primary.clone(),
                    nodes: Vec::new(),
                    muxes: Vec::new(),
                };
                for addr in shard.nodes.iter().skip(1) {
                    let (Some((host, port)), Some(node)) = (split_host_port(addr), conns.get(addr)) else {
                        continue;
                    };
                    let mut info = NodeInfo::new(String::new(), host.to_string(), port);
                    info.slots = shard.slots.clone();
                    info.is_master = false;
                    read.nodes.push(info);
                    read.muxes.push(node.mux.clone());
                }
                Arc::new(read)
            });
            for range in &shard.slots {
                for slot in range.start..=range.end {
                    wslots[slot as usize] = Some(primary.clone());
                    if let Some(read) = &readable {
                        rslots[slot as usize] = Some(read.clone());
                    }
                }
            }
        }

        let removed: Vec<Mux> = current
            .conns
            .iter()
            .filter(|(addr, _)| !conns.contains_key(*addr))
            .map(|(_, node)| node.mux.clone())
            .collect();
        for mux in removed {
            debug!(addr = %mux.addr(), "node left the cluster view");
            mux.close_after(REMOVED_CLOSE_DELAY);
        }

        info!(shards = shards.len(), nodes = conns.len(), "cluster topology installed");
        self.topology.store(Arc::new(Topology {
            conns,
            wslots,
            rslots,
            shards: shards.into_values().collect(),
        }));
    }

    /// The group for a redirect target, opening one if needed
    ///
    /// A redirect back to the connection that produced it means the address
    /// now resolves elsewhere: a fresh group replaces it and the stale one
    /// is closed after a grace period.
    fn redirect_or_new(&self, addr: &str, prev: &Mux, slot: u16, moved: bool) -> Mux {
        let _writer = self.writer.lock();
        let current = self.topology.load_full();
        let existing = current.conns.get(addr).cloned();
        let mut next = Topology::clone(&current);

        let mux = match existing {
            Some(node) if !node.mux.same(prev) => {
                let settled = current.primary(slot).map_or(false, |m| m.same(&node.mux));
                if !moved || slot >= CLUSTER_SLOTS || settled {
                    return node.mux;
                }
                node.mux
            }
            stale => {
                let fresh = self.new_mux(addr, false);
                if let Some(stale) = stale {
                    debug!(addr = %addr, "redirected to the same node, reconnecting");
                    next.replace(&stale.mux, &fresh);
                    stale.mux.close_after(REMOVED_CLOSE_DELAY);
                }
                let hidden = current.conns.get(addr).map_or(false, |n| n.hidden);
                next.conns.insert(
                    addr.to_string(),
                    Node {
                        mux: fresh.clone(),
                        hidden,
                    },
                );
                fresh
            }
        };
        if moved {
            next.retarget(slot, mux.clone());
        }
        self.topology.store(Arc::new(next));
        mux
    }

    async fn send(&self, mux: &Mux, op: Single<'_>) -> RedisResult<Message> {
        loop {
            let result = match op {
                Single::Plain(cmd) => mux.execute(cmd.clone()).await,
                Single::Cached(cmd, ttl) => mux.execute_cached(cmd, ttl).await,
            };
            if !matches!(result, Err(RedisError::ConnExpired)) {
                return result;
            }
        }
    }

    async fn send_asking(&self, mux: &Mux, cmd: &Command) -> RedisResult<Message> {
        let mut replies = mux.execute_multi_resending(&[asking(), cmd.clone()]).await;
        replies.pop().unwrap_or(Err(RedisError::Closing))
    }

    async fn route(&self, op: Single<'_>) -> RedisResult<Message> {
        let cmd = op.command();
        let slot = cmd.slot();
        if slot == NO_SLOT {
            return Err(RedisError::CrossSlot);
        }
        let readonly = matches!(op, Single::Cached(..)) || cmd.is_readonly();
        let to_replica = self.to_replica(cmd);
        let mut attempts = 1;
        loop {
            let mut mux = self.pick(slot, to_replica).await?;
            let mut result = self.send(&mux, op).await;
            let mut redirects = 0;
            loop {
                match self.observe(classify(&result)) {
                    Redirect::None => return result,
                    Redirect::Retry => break,
                    Redirect::Moved(_) | Redirect::Ask(_) if redirects >= self.config.max_redirects => {
                        return result
                    }
                    Redirect::Moved(addr) => {
                        debug!(slot, addr = %addr, "MOVED");
                        redirects += 1;
                        mux = self.redirect_or_new(&addr, &mux, slot, true);
                        result = self.send(&mux, op).await;
                    }
                    Redirect::Ask(addr) => {
                        debug!(slot, addr = %addr, "ASK");
                        redirects += 1;
                        mux = self.redirect_or_new(&addr, &mux, slot, false);
                        result = self.send_asking(&mux, cmd).await;
                    }
                }
            }
            match error_of(&result) {
                Some(err) if self.retry.should_retry(attempts, readonly, &err) => {
                    self.retry.wait(attempts, &err).await;
                    attempts += 1;
                }
                _ => return result,
            }
        }
    }

    /// Split a batch by destination
    ///
    /// `Ok(None)` means some slot has no known owner yet. Keyless commands
    /// follow the batch's single keyed slot; mixing them with several slots
    /// is rejected. Commands whose own keys span slots are left out; the
    /// caller fails them locally.
    fn partition(&self, topology: &Topology, work: Work<'_>) -> RedisResult<Option<Vec<Batch>>> {
        let mut batches = Vec::new();
        let routable: Vec<usize> = (0..work.len())
            .filter(|&i| work.command(i).slot() != NO_SLOT)
            .collect();
        if routable.is_empty() {
            return Ok(Some(batches));
        }
        let keyless = routable.iter().any(|&i| work.command(i).slot() == INIT_SLOT);

        if !keyless && !topology.rslots.is_empty() {
            let selector = self.config.replica_selector.as_ref();
            for &i in &routable {
                let cmd = work.command(i);
                let Some(mux) = topology.pick(cmd.slot(), self.to_replica(cmd), selector) else {
                    return Ok(None);
                };
                batch_for(&mut batches, &mux).plain.push(i);
            }
            return Ok(Some(batches));
        }

        let mut anchor = None;
        for &i in &routable {
            let slot = work.command(i).slot();
            if slot == INIT_SLOT {
                continue;
            }
            match anchor {
                None => anchor = Some(slot),
                Some(first) if keyless && first != slot => return Err(RedisError::CrossSlot),
                _ => {}
            }
        }
        let Some(anchor) = anchor.or_else(|| topology.any_owned_slot()) else {
            return Ok(None);
        };
        for &i in &routable {
            let slot = match work.command(i).slot() {
                INIT_SLOT => anchor,
                s => s,
            };
            let Some(mux) = topology.primary(slot) else {
                return Ok(None);
            };
            batch_for(&mut batches, mux).plain.push(i);
        }
        Ok(Some(batches))
    }

    async fn pick_batches(&self, work: Work<'_>) -> RedisResult<Vec<Batch>> {
        if let Some(batches) = self.partition(&self.topology.load(), work)? {
            return Ok(batches);
        }
        self.refresh().await?;
        self.partition(&self.topology.load(), work)?
            .ok_or(RedisError::NoSlot)
    }

    async fn run_batch(&self, batch: &Batch, work: Work<'_>) -> (Replies, Replies) {
        let plain = match work {
            _ if batch.plain.is_empty() => Vec::new(),
            Work::Plain(cmds) => {
                let sent: Vec<Command> = batch.plain.iter().map(|&i| cmds[i].clone()).collect();
                batch.mux.execute_multi_resending(&sent).await
            }
            Work::Cached(cmds) => {
                let sent: Vec<CacheableTtl> = batch.plain.iter().map(|&i| cmds[i].clone()).collect();
                let mut replies = batch.mux.execute_multi_cached(&sent).await;
                while let Some(from) = replies.iter().position(|r| matches!(r, Err(RedisError::ConnExpired))) {
                    let again = batch.mux.execute_multi_cached(&sent[from..]).await;
                    replies.truncate(from);
                    replies.extend(again);
                }
                replies
            }
        };
        let asking = if batch.asking.is_empty() {
            Vec::new()
        } else {
            self.run_asking(&batch.mux, &batch.asking, work).await
        };
        (plain, asking)
    }

    /// Prefix each command, or each whole transaction, with `ASKING`
    async fn run_asking(&self, mux: &Mux, idx: &[usize], work: Work<'_>) -> Replies {
        let mut wire = Vec::with_capacity(idx.len() * 2);
        let mut in_tx = false;
        for &i in idx {
            let cmd = work.command(i);
            if in_tx {
                wire.push(cmd.clone());
                in_tx = !cmd.is_exec();
            } else {
                wire.push(asking());
                wire.push(cmd.clone());
                in_tx = cmd.is_multi();
            }
        }
        let replies = mux.execute_multi_resending(&wire).await;
        wire.iter()
            .zip(replies)
            .filter(|(cmd, _)| !is_asking(cmd))
            .map(|(_, reply)| reply)
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn absorb(
        &self,
        mux: &Mux,
        idx: &[usize],
        replies: Replies,
        work: Work<'_>,
        attempts: usize,
        results: &mut [Option<RedisResult<Message>>],
        next: &mut Vec<Batch>,
        round: &mut Round,
    ) {
        let mut moved_until = None;
        for (pos, reply) in replies.into_iter().enumerate() {
            let Some(&i) = idx.get(pos) else {
                break;
            };
            let redirect = self.observe(classify(&reply));
            let err = error_of(&reply);
            results[i] = Some(reply);
            if moved_until.map_or(false, |end| pos <= end) {
                continue;
            }

            let cmd = work.command(i);
            let (dest, ask) = match redirect {
                Redirect::None => continue,
                Redirect::Retry => {
                    let Some(err) = err else {
                        continue;
                    };
                    if !self.retry.should_retry(attempts, work.readonly(i), &err) {
                        continue;
                    }
                    round.retry.get_or_insert(err);
                    (mux.clone(), false)
                }
                Redirect::Moved(addr) => {
                    debug!(slot = cmd.slot(), addr = %addr, "MOVED");
                    round.redirected = true;
                    (self.redirect_or_new(&addr, mux, cmd.slot(), true), false)
                }
                Redirect::Ask(addr) => {
                    debug!(slot = cmd.slot(), addr = %addr, "ASK");
                    round.redirected = true;
                    (self.redirect_or_new(&addr, mux, cmd.slot(), false), true)
                }
            };

            let resend = match transaction_around(idx, pos, work, results) {
                Some((start, end)) => {
                    moved_until = Some(end);
                    idx[start..=end].to_vec()
                }
                None => vec![i],
            };
            let target = batch_for(next, &dest);
            if ask {
                target.asking.extend(resend);
            } else {
                target.plain.extend(resend);
            }
        }
    }

    async fn route_batch(&self, work: Work<'_>) -> Replies {
        let n = work.len();
        if n == 0 {
            return Vec::new();
        }
        let mut batches = match self.pick_batches(work).await {
            Ok(batches) => batches,
            Err(err) => return vec![Err(err); n],
        };

        let mut results: Vec<Option<RedisResult<Message>>> = (0..n)
            .map(|i| (work.command(i).slot() == NO_SLOT).then_some(Err(RedisError::CrossSlot)))
            .collect();
        let mut attempts = 1;
        let mut redirects = 0;
        loop {
            let replies = join_all(batches.iter().map(|b| self.run_batch(b, work))).await;
            let mut next = Vec::new();
            let mut round = Round::default();
            for (batch, (plain, asking)) in batches.iter().zip(replies) {
                let mux = &batch.mux;
                self.absorb(mux, &batch.plain, plain, work, attempts, &mut results, &mut next, &mut round);
                self.absorb(mux, &batch.asking, asking, work, attempts, &mut results, &mut next, &mut round);
            }
            if next.is_empty() {
                break;
            }
            if round.redirected {
                if redirects >= self.config.max_redirects {
                    break;
                }
                redirects += 1;
            } else if let Some(err) = round.retry {
                self.retry.wait(attempts, &err).await;
                attempts += 1;
            } else {
                break;
            }
            batches = next;
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(RedisError::Closing)))
            .collect()
    }
}

async fn refresh_ticker(inner: Weak<Inner>, mut stop: watch::Receiver<bool>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => return,
            _ = ticker.tick() => match inner.upgrade() {
                Some(inner) => inner.lazy_refresh(),
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDialer;
    use redis_weave_core::{command::calculate_slot, config::RetryConfig};
    use std::sync::atomic::AtomicUsize;

    const A: &str = "127.0.0.1:7000";
    const B: &str = "127.0.0.1:7001";

    fn node(port: i64) -> Message {
        Message::array(vec![Message::blob("127.0.0.1"), Message::int(port)])
    }

    fn slots(ranges: &[(i64, i64, i64)]) -> Vec<Message> {
        let entries = ranges
            .iter()
            .map(|&(start, end, port)| {
                Message::array(vec![Message::int(start), Message::int(end), node(port)])
            })
            .collect();
        vec![Message::array(entries)]
    }

    /// One shard served by a primary and its replicas
    fn replicated(ports: &[i64]) -> Vec<Message> {
        let mut entry = vec![Message::int(0), Message::int(16383)];
        entry.extend(ports.iter().map(|&p| node(p)));
        vec![Message::array(vec![Message::array(entry)])]
    }

    fn is_slots(args: &[String]) -> bool {
        args.len() == 2 && args[0] == "CLUSTER" && args[1] == "SLOTS"
    }

    fn key_in(range: std::ops::Range<u16>) -> String {
        (0..)
            .map(|i| format!("key:{}", i))
            .find(|k| range.contains(&calculate_slot(k.as_bytes())))
            .unwrap()
    }

    fn config(seeds: &[&str]) -> Arc<ClientConfig> {
        Arc::new(
            ClientConfig::new(seeds.iter().copied())
                .with_keep_alive_interval(None)
                .with_retry(RetryConfig::default().with_delays(Duration::from_millis(1), Duration::from_millis(5))),
        )
    }

    async fn connect(dialer: &MockDialer, seeds: &[&str]) -> ClusterClient {
        ClusterClient::connect(config(seeds), Arc::new(dialer.clone()))
            .await
            .unwrap()
    }

    fn count(dialer: &MockDialer, addr: &str, cmd: &str) -> usize {
        dialer.commands_to(addr).iter().filter(|c| *c == cmd).count()
    }

    #[tokio::test]
    async fn test_moved_retargets_slot() {
        let moved = Arc::new(AtomicBool::new(false));
        let flag = moved.clone();
        let key = key_in(0..16384);
        let slot = calculate_slot(key.as_bytes());
        let dialer = MockDialer::with_handler(move |addr, args| {
            if is_slots(args) {
                let port = if flag.load(Ordering::SeqCst) { 7001 } else { 7000 };
                return Some(slots(&[(0, 16383, port)]));
            }
            if addr == A && args[0] == "GET" {
                flag.store(true, Ordering::SeqCst);
                return Some(vec![Message::error_line(format!("MOVED {} {}", slot, B))]);
            }
            None
        });
        dialer.set(&key, "bar", -1);
        let cluster = connect(&dialer, &[A]).await;

        let get = || Command::builder("GET").key(key.as_str()).build();
        let reply = cluster.execute(get()).await.unwrap();
        assert_eq!(reply.as_str().unwrap(), "bar");
        let reply = cluster.execute(get()).await.unwrap();
        assert_eq!(reply.as_str().unwrap(), "bar");

        let get_line = format!("GET {}", key);
        assert_eq!(count(&dialer, A, &get_line), 1);
        assert_eq!(count(&dialer, B, &get_line), 2);
        assert!(cluster.inner.topology.load().primary(slot).unwrap().addr() == B);
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_ask_redirects_once_without_retargeting() {
        let key = key_in(0..16384);
        let slot = calculate_slot(key.as_bytes());
        let dialer = MockDialer::with_handler(move |addr, args| {
            if is_slots(args) {
                return Some(slots(&[(0, 16383, 7000)]));
            }
            match (addr, args[0].as_str()) {
                (A, "GET") => Some(vec![Message::error_line(format!("ASK {} {}", slot, B))]),
                (B, "ASKING") => Some(vec![Message::simple("OK")]),
                _ => None,
            }
        });
        dialer.set(&key, "bar", -1);
        let cluster = connect(&dialer, &[A]).await;

        let get = || Command::builder("GET").key(key.as_str()).build();
        for _ in 0..2 {
            let reply = cluster.execute(get()).await.unwrap();
            assert_eq!(reply.as_str().unwrap(), "bar");
        }
        let get_line = format!("GET {}", key);
        assert_eq!(count(&dialer, A, &get_line), 2);
        assert_eq!(dialer.commands_to(B), vec!["ASKING".to_string(), get_line.clone(), "ASKING".into(), get_line]);
        assert!(cluster.inner.topology.load().primary(slot).unwrap().addr() == A);
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_batch_is_split_by_owner_and_reassembled() {
        let dialer = MockDialer::with_handler(|_, args| {
            is_slots(args).then(|| slots(&[(0, 8191, 7000), (8192, 16383, 7001)]))
        });
        let cluster = connect(&dialer, &[A]).await;
        let low = key_in(0..8192);
        let high = key_in(8192..16384);

        let replies = cluster
            .execute_multi(vec![
                Command::builder("SET").key(low.as_str()).arg("1").build(),
                Command::builder("SET").key(high.as_str()).arg("2").build(),
                Command::builder("GET").key(low.as_str()).build(),
                Command::builder("GET").key(high.as_str()).build(),
            ])
            .await;
        let replies: Vec<String> = replies.into_iter().map(|r| r.unwrap().to_string_lossy()).collect();
        assert_eq!(replies, vec!["OK", "OK", "1", "2"]);

        assert_eq!(count(&dialer, A, &format!("SET {} 1", low)), 1);
        assert_eq!(count(&dialer, A, &format!("GET {}", low)), 1);
        assert_eq!(count(&dialer, B, &format!("SET {} 2", high)), 1);
        assert_eq!(count(&dialer, B, &format!("GET {}", high)), 1);
        assert_eq!(count(&dialer, A, &format!("GET {}", high)), 0);
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_keyless_commands_mixed_with_several_slots_are_rejected() {
        let dialer = MockDialer::with_handler(|_, args| {
            is_slots(args).then(|| slots(&[(0, 8191, 7000), (8192, 16383, 7001)]))
        });
        let cluster = connect(&dialer, &[A]).await;

        let replies = cluster
            .execute_multi(vec![
                Command::from_args(["PING"]),
                Command::builder("GET").key(key_in(0..8192).as_str()).build(),
                Command::builder("GET").key(key_in(8192..16384).as_str()).build(),
            ])
            .await;
        assert_eq!(replies.len(), 3);
        assert!(replies.iter().all(|r| matches!(r, Err(RedisError::CrossSlot))));

        // keyless commands alone go to some owner
        let replies = cluster.execute_multi(vec![Command::from_args(["PING"])]).await;
        assert_eq!(replies[0].as_ref().unwrap().as_str().unwrap(), "PONG");
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_transaction_moves_as_one_block() {
        let key = key_in(0..16384);
        let slot = calculate_slot(key.as_bytes());
        let dialer = MockDialer::with_handler(move |addr, args| {
            if is_slots(args) {
                return Some(slots(&[(0, 16383, 7000)]));
            }
            (addr == A && args[0] == "SET")
                .then(|| vec![Message::error_line(format!("MOVED {} {}", slot, B))])
        });
        let cluster = connect(&dialer, &[A]).await;

        let replies = cluster
            .execute_multi(vec![
                Command::from_args(["MULTI"]),
                Command::builder("SET").key(key.as_str()).arg("v").build(),
                Command::from_args(["EXEC"]),
            ])
            .await;
        let replies: Vec<Message> = replies.into_iter().map(Result::unwrap).collect();
        assert_eq!(replies[0].as_str().unwrap(), "OK");
        assert_eq!(replies[1].as_str().unwrap(), "QUEUED");
        assert_eq!(replies[2].as_array().unwrap()[0].as_str().unwrap(), "OK");
        assert_eq!(
            dialer.commands_to(B),
            vec!["MULTI".to_string(), format!("SET {} v", key), "EXEC".to_string()]
        );
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_reads_retry_on_try_again_but_writes_do_not() {
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = failures.clone();
        let dialer = MockDialer::with_handler(move |_, args| {
            if is_slots(args) {
                return Some(slots(&[(0, 16383, 7000)]));
            }
            let first = matches!(args[0].as_str(), "GET" | "SET") && seen.fetch_add(1, Ordering::SeqCst) % 2 == 0;
            first.then(|| vec![Message::error_line("TRYAGAIN Multiple keys request during rehashing of slot")])
        });
        dialer.set("foo", "bar", -1);
        let cluster = connect(&dialer, &[A]).await;

        let reply = cluster
            .execute(Command::builder("GET").key("foo").readonly().build())
            .await
            .unwrap();
        assert_eq!(reply.as_str().unwrap(), "bar");
        assert_eq!(failures.load(Ordering::SeqCst), 2);

        let reply = cluster
            .execute(Command::builder("SET").key("foo").arg("baz").build())
            .await
            .unwrap();
        assert!(reply.error().unwrap().is_try_again());
        assert_eq!(failures.load(Ordering::SeqCst), 3);
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_seed_addresses_stay_hidden() {
        let dialer = MockDialer::with_handler(|_, args| is_slots(args).then(|| slots(&[(0, 16383, 7001)])));
        let cluster = connect(&dialer, &[A]).await;

        assert_eq!(cluster.nodes(), vec![B.to_string()]);
        let topology = cluster.inner.topology.load();
        assert!(topology.conns[A].hidden);
        let shards = cluster.shards();
        assert_eq!(shards.len(), 1);
        assert!(shards[0].owns_slot(16383));
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_first_reachable_seed_wins() {
        let dialer = MockDialer::with_handler(|_, args| is_slots(args).then(|| slots(&[(0, 16383, 7001)])));
        dialer.refuse(A);
        let cluster = connect(&dialer, &[A, B]).await;
        assert_eq!(cluster.nodes(), vec![B.to_string()]);
        cluster.close().await;

        let dialer = MockDialer::new();
        dialer.refuse(A);
        let err = ClusterClient::connect(config(&[A]), Arc::new(dialer.clone()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RedisError::Connection(_)));
    }

    #[tokio::test]
    async fn test_valkey_8_uses_cluster_shards() {
        let dialer = MockDialer::with_handler(|_, args| {
            if args.len() == 2 && args[0] == "CLUSTER" && args[1] == "SHARDS" {
                let node = Message::map(vec![
                    (Message::blob("endpoint"), Message::blob("127.0.0.1")),
                    (Message::blob("port"), Message::int(7000)),
                    (Message::blob("role"), Message::blob("master")),
                    (Message::blob("health"), Message::blob("online")),
                ]);
                let shard = Message::map(vec![
                    (Message::blob("slots"), Message::array(vec![Message::int(0), Message::int(16383)])),
                    (Message::blob("nodes"), Message::array(vec![node])),
                ]);
                return Some(vec![Message::array(vec![shard])]);
            }
            None
        })
        .with_version("8.0.1");
        let cluster = connect(&dialer, &[A]).await;
        assert_eq!(cluster.nodes(), vec![A.to_string()]);
        assert!(dialer.commands_to(A).contains(&"CLUSTER SHARDS".to_string()));
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_cluster_support_disabled_is_reported() {
        let dialer = MockDialer::with_handler(|_, args| {
            is_slots(args).then(|| vec![Message::error_line("ERR This instance has cluster support disabled")])
        });
        let err = ClusterClient::connect(config(&[A]), Arc::new(dialer.clone()))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("cluster support disabled"));
    }

    async fn with_replicas(
        dialer: &MockDialer,
        tune: impl FnOnce(ClientConfig) -> ClientConfig,
    ) -> ClusterClient {
        let config = tune(
            ClientConfig::new([A])
                .with_keep_alive_interval(None)
                .with_send_to_replicas(Command::is_readonly),
        );
        ClusterClient::connect(Arc::new(config), Arc::new(dialer.clone()))
            .await
            .unwrap()
    }

    const R1: &str = "127.0.0.1:7002";
    const R2: &str = "127.0.0.1:7003";

    #[tokio::test]
    async fn test_reads_go_to_readonly_replica() {
        let dialer = MockDialer::with_handler(|_, args| is_slots(args).then(|| replicated(&[7000, 7002])));
        dialer.set("foo", "bar", -1);
        let cluster = with_replicas(&dialer, |c| c).await;

        let get = Command::builder("GET").key("foo").build();
        assert_eq!(cluster.execute(get).await.unwrap().as_str().unwrap(), "bar");
        let set = Command::builder("SET").key("foo").arg("baz").build();
        cluster.execute(set).await.unwrap();

        assert_eq!(count(&dialer, R1, "GET foo"), 1);
        assert_eq!(count(&dialer, A, "GET foo"), 0);
        assert_eq!(count(&dialer, A, "SET foo baz"), 1);
        assert_eq!(count(&dialer, R1, "SET foo baz"), 0);
        assert!(dialer.handshakes(R1).iter().any(|c| c == "READONLY"));
        assert!(!dialer.handshakes(A).iter().any(|c| c == "READONLY"));
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_selector_runs_on_every_read() {
        let dialer = MockDialer::with_handler(|_, args| is_slots(args).then(|| replicated(&[7000, 7002, 7003])));
        let turn = Arc::new(AtomicUsize::new(0));
        let next = turn.clone();
        let cluster = with_replicas(&dialer, move |c| {
            c.with_replica_selector(move |_, replicas| {
                assert_eq!(replicas.len(), 2);
                assert!(replicas.iter().all(|r| !r.is_master));
                next.fetch_add(1, Ordering::SeqCst) % replicas.len()
            })
        })
        .await;

        for _ in 0..4 {
            cluster.execute(Command::builder("GET").key("foo").build()).await.unwrap();
        }
        assert_eq!(turn.load(Ordering::SeqCst), 4);
        assert_eq!(count(&dialer, R1, "GET foo"), 2);
        assert_eq!(count(&dialer, R2, "GET foo"), 2);
        assert_eq!(count(&dialer, A, "GET foo"), 0);
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_unknown_replica_index_reads_from_primary() {
        let dialer = MockDialer::with_handler(|_, args| is_slots(args).then(|| replicated(&[7000, 7002])));
        let cluster = with_replicas(&dialer, |c| c.with_replica_selector(|_, _| 99)).await;

        cluster.execute(Command::builder("GET").key("foo").build()).await.unwrap();
        let replies = cluster
            .execute_multi(vec![Command::builder("GET").key("foo").build()])
            .await;
        assert!(replies[0].is_ok());
        assert_eq!(count(&dialer, A, "GET foo"), 2);
        assert_eq!(count(&dialer, R1, "GET foo"), 0);
        cluster.close().await;
    }

    #[tokio::test]
    async fn test_cross_slot_command_fails_without_being_sent() {
        let dialer = MockDialer::with_handler(|_, args| is_slots(args).then(|| slots(&[(0, 16383, 7000)])));
        dialer.set("a", "1", -1);
        let cluster = connect(&dialer, &[A]).await;
        let cross = || Command::builder("MGET").key("a").key("b").build();

        let err = cluster.execute(cross()).await.unwrap_err();
        assert!(matches!(err, RedisError::CrossSlot));

        let replies = cluster
            .execute_multi(vec![cross(), Command::builder("GET").key("a").build()])
            .await;
        assert!(matches!(replies[0], Err(RedisError::CrossSlot)));
        assert_eq!(replies[1].as_ref().unwrap().as_str().unwrap(), "1");

        let replies = cluster.execute_multi(vec![cross()]).await;
        assert!(matches!(replies[0], Err(RedisError::CrossSlot)));
        assert!(!dialer.commands().iter().any(|c| c.starts_with("MGET")));
        cluster.close().await;
    }
}
