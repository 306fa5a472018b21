//! Connection group for one destination
//!
//! A [`Mux`] spreads pipelined traffic over `2^pipeline_multiplex` pipes to
//! the same address. Pipes are dialed lazily and a broken one is dropped
//! from its slot, so the next command on that slot redials instead of
//! failing. Blocking commands never share a pipe: they borrow one from a
//! separate bounded pool for the length of the call. Streamed replies do
//! the same from a pool whose pipes never leave inline mode.

use crate::connection::Dialer;
use crate::pipe::Pipe;
use crate::pool::{PipeFactory, Pool, Pooled};
use crate::pubsub::{PubSubMessage, SubscriptionHook};
use crate::queue::Replies;
use arc_swap::ArcSwapOption;
use futures_util::FutureExt;
use rand::Rng;
use redis_weave_core::{
    command::{Cacheable, CacheableTtl, Command, INIT_SLOT},
    config::ClientConfig,
    error::{RedisError, RedisResult},
    message::Message,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Told about every pipe of the group that stops with an unexpected error
pub(crate) type MuxCloseHook = Arc<dyn Fn(&str, &RedisError) + Send + Sync>;

struct Slot {
    pipe: ArcSwapOption<Pipe>,
    dialing: tokio::sync::Mutex<()>,
}

struct MuxInner {
    addr: String,
    config: Arc<ClientConfig>,
    dialer: Arc<dyn Dialer>,
    slots: Vec<Slot>,
    blocking: Pool,
    dedicated: Pool,
    stream: Pool,
    on_close: Option<MuxCloseHook>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub(crate) struct Mux {
    inner: Arc<MuxInner>,
}

impl Mux {
    pub fn new(
        addr: &str,
        config: Arc<ClientConfig>,
        dialer: Arc<dyn Dialer>,
        on_close: Option<MuxCloseHook>,
    ) -> Self {
        let n = 1usize << config.pipeline_multiplex.min(16);
        let slots = (0..n)
            .map(|_| Slot {
                pipe: ArcSwapOption::empty(),
                dialing: tokio::sync::Mutex::new(()),
            })
            .collect();
        let factory = pipe_factory(addr, &config, &dialer);
        let inline = Arc::new(ClientConfig {
            always_pipelining: false,
            keep_alive_interval: None,
            ..(*config).clone()
        });
        Self {
            inner: Arc::new(MuxInner {
                addr: addr.to_string(),
                blocking: Pool::new(config.blocking_pool_size, factory.clone()),
                dedicated: Pool::new(config.blocking_pool_size, factory),
                stream: Pool::new(config.blocking_pool_size, pipe_factory(addr, &inline, &dialer)),
                config,
                dialer,
                slots,
                on_close,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Whether both handles point at the same group
    pub fn same(&self, other: &Mux) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Make sure the first pipe is up; used to check a destination is reachable
    pub async fn dial(&self) -> RedisResult<()> {
        self.pipe(0).await.map(|_| ())
    }

    /// Major version of the server behind this group
    pub async fn version(&self) -> RedisResult<u32> {
        Ok(self.pipe(0).await?.version())
    }

    fn pick(&self, slot: u16, no_reply: bool) -> usize {
        let n = self.inner.slots.len();
        if n == 1 || no_reply {
            0
        } else if slot < INIT_SLOT {
            slot as usize & (n - 1)
        } else {
            rand::thread_rng().gen_range(0..n)
        }
    }

    fn pick_batch(&self, cmds: &[Command]) -> usize {
        if cmds.iter().any(Command::is_no_reply) {
            return 0;
        }
        let slot = cmds
            .iter()
            .map(Command::slot)
            .find(|&s| s < INIT_SLOT)
            .unwrap_or(INIT_SLOT);
        self.pick(slot, false)
    }

    async fn pipe(&self, idx: usize) -> RedisResult<Arc<Pipe>> {
        let slot = &self.inner.slots[idx];
        if let Some(pipe) = healthy(&slot.pipe) {
            return Ok(pipe);
        }

        let _dialing = slot.dialing.lock().await;
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RedisError::Closing);
        }
        if let Some(pipe) = healthy(&slot.pipe) {
            return Ok(pipe);
        }

        let inner = &self.inner;
        let pipe = Pipe::connect(&inner.addr, &inner.config, &*inner.dialer).await?;
        pipe.set_on_close_hook(slot_hook(Arc::downgrade(inner), idx, Arc::as_ptr(&pipe) as usize));
        if let Some(old) = slot.pipe.swap(Some(pipe.clone())) {
            tokio::spawn(async move { old.close().await });
        }
        debug!(addr = %inner.addr, slot = idx, "pipe ready");
        Ok(pipe)
    }

    pub async fn execute(&self, cmd: Command) -> RedisResult<Message> {
        if cmd.is_block() {
            let pooled = self.inner.blocking.acquire().await?;
            let result = pooled.pipe().execute(cmd).await;
            self.give_back(pooled, result.is_ok());
            return result;
        }
        let pipe = self.pipe(self.pick(cmd.slot(), cmd.is_no_reply())).await?;
        pipe.execute(cmd).await
    }

    pub async fn execute_multi(&self, cmds: Vec<Command>) -> Replies {
        if cmds.is_empty() {
            return Vec::new();
        }
        let n = cmds.len();
        if cmds.iter().any(Command::is_block) {
            let pooled = match self.inner.blocking.acquire().await {
                Ok(pooled) => pooled,
                Err(err) => return vec![Err(err); n],
            };
            let replies = pooled.pipe().execute_multi(cmds).await;
            self.give_back(pooled, replies.iter().all(Result::is_ok));
            return replies;
        }
        match self.pipe(self.pick_batch(&cmds)).await {
            Ok(pipe) => pipe.execute_multi(cmds).await,
            Err(err) => vec![Err(err); n],
        }
    }

    /// [`execute_multi`](Self::execute_multi), resending everything from
    /// the first reply lost to connection expiry
    pub async fn execute_multi_resending(&self, cmds: &[Command]) -> Replies {
        let mut replies = self.execute_multi(cmds.to_vec()).await;
        while let Some(from) = first_expired(cmds, &replies) {
            let again = self.execute_multi(cmds[from..].to_vec()).await;
            replies.truncate(from);
            replies.extend(again);
        }
        replies
    }

    fn give_back(&self, pooled: Pooled, ok: bool) {
        if ok {
            self.inner.blocking.release(pooled);
        } else {
            self.inner.blocking.evict(pooled);
        }
    }

    pub async fn execute_cached(&self, cmd: &Cacheable, ttl: Duration) -> RedisResult<Message> {
        let pipe = self.pipe(self.pick(cmd.slot(), false)).await?;
        pipe.execute_cached(cmd, ttl).await
    }

    pub async fn execute_multi_cached(&self, cmds: &[CacheableTtl]) -> Replies {
        let Some(first) = cmds.first() else {
            return Vec::new();
        };
        match self.pipe(self.pick(first.cmd.slot(), false)).await {
            Ok(pipe) => pipe.execute_multi_cached(cmds).await,
            Err(err) => vec![Err(err); cmds.len()],
        }
    }

    pub async fn receive<F>(
        &self,
        subscribe: Command,
        on_message: F,
        on_subscription: Option<SubscriptionHook>,
    ) -> RedisResult<()>
    where
        F: FnMut(PubSubMessage) + Send,
    {
        let pipe = self.pipe(self.pick(subscribe.slot(), true)).await?;
        pipe.receive(subscribe, on_message, on_subscription).await
    }

    /// Borrow a pipe for exclusive use
    pub async fn acquire(&self) -> RedisResult<Pooled> {
        self.inner.dedicated.acquire().await
    }

    /// Reset a borrowed pipe and hand it back
    pub async fn release(&self, pooled: Pooled) {
        pooled.pipe().clean_subscriptions().await;
        self.inner.dedicated.release(pooled);
    }

    /// Close a borrowed pipe instead of returning it
    pub fn discard(&self, pooled: Pooled) {
        self.inner.dedicated.evict(pooled);
    }

    /// Borrow an inline pipe and write `cmds` on it for streaming
    pub async fn stream(&self, cmds: &[Command]) -> RedisResult<Pooled> {
        let pooled = self.inner.stream.acquire().await?;
        match pooled.pipe().stream_start(cmds).await {
            Ok(()) => Ok(pooled),
            Err(err) => {
                self.inner.stream.evict(pooled);
                Err(err)
            }
        }
    }

    /// Return a streaming pipe after its last reply, or close it if it failed
    pub fn end_stream(&self, pooled: Pooled) {
        pooled.pipe().stream_end();
        if pooled.pipe().error().is_some() {
            self.inner.stream.evict(pooled);
        } else {
            self.inner.stream.release(pooled);
        }
    }

    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in &self.inner.slots {
            let _dialing = slot.dialing.lock().await;
            if let Some(pipe) = slot.pipe.swap(None) {
                pipe.close().await;
            }
        }
        self.inner.blocking.close().await;
        self.inner.dedicated.close().await;
        self.inner.stream.close().await;
    }

    /// Close after `delay`, letting commands already sent finish
    pub fn close_after(&self, delay: Duration) {
        let mux = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            mux.close().await;
        });
    }

    #[cfg(test)]
    fn blocking_idle(&self) -> usize {
        self.inner.blocking.idle_len()
    }
}

pub(crate) fn is_asking(cmd: &Command) -> bool {
    cmd.name().eq_ignore_ascii_case(b"ASKING")
}

/// Where to resend from after an expiry, backing up to the `MULTI` or
/// `ASKING` that opened an interrupted transaction or redirect
fn first_expired(cmds: &[Command], replies: &Replies) -> Option<usize> {
    let mut anchor = None;
    let mut in_tx = false;
    for (i, (cmd, reply)) in cmds.iter().zip(replies).enumerate() {
        if matches!(reply, Err(RedisError::ConnExpired)) {
            return Some(anchor.unwrap_or(i));
        }
        if is_asking(cmd) {
            anchor = Some(i);
        } else if cmd.is_multi() {
            in_tx = true;
            if !(i > 0 && is_asking(&cmds[i - 1])) {
                anchor = Some(i);
            }
        } else if cmd.is_exec() {
            in_tx = false;
            anchor = None;
        } else if !in_tx {
            anchor = None;
        }
    }
    None
}

fn healthy(slot: &ArcSwapOption<Pipe>) -> Option<Arc<Pipe>> {
    slot.load_full().filter(|pipe| pipe.error().is_none())
}

fn slot_hook(mux: Weak<MuxInner>, idx: usize, pipe: usize) -> crate::pipe::CloseHook {
    Arc::new(move |err: &RedisError| {
        let Some(inner) = mux.upgrade() else {
            return;
        };
        inner.slots[idx].pipe.rcu(|current| match current {
            Some(p) if Arc::as_ptr(p) as usize == pipe => None,
            other => other.clone(),
        });
        if matches!(err, RedisError::Closing | RedisError::ConnExpired) {
            return;
        }
        if let Some(hook) = &inner.on_close {
            hook(&inner.addr, err);
        }
    })
}

fn pipe_factory(addr: &str, config: &Arc<ClientConfig>, dialer: &Arc<dyn Dialer>) -> PipeFactory {
    let addr = addr.to_string();
    let config = config.clone();
    let dialer = dialer.clone();
    Arc::new(move || {
        let (addr, config, dialer) = (addr.clone(), config.clone(), dialer.clone());
        async move { Pipe::connect(&addr, &config, &*dialer).await }.boxed()
    })
}
