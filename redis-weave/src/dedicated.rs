//! Connections borrowed for exclusive use
//!
//! `WATCH`/`MULTI`/`EXEC` and other stateful sequences need every command on
//! the same socket with nobody else's traffic in between. A
//! [`DedicatedClient`] borrows a connection on first use and keeps it until
//! [`release`](DedicatedClient::release), [`close`](DedicatedClient::close)
//! or drop.

use crate::cluster::ClusterClient;
use crate::mux::Mux;
use crate::pipe::Pipe;
use crate::pool::Pooled;
use crate::pubsub::{PubSubHooks, PubSubMessage, SubscriptionHook};
use redis_weave_core::{
    command::{Command, INIT_SLOT, NO_SLOT},
    error::{RedisError, RedisResult},
    message::Message,
};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Mutex};

enum Backend {
    Standalone(Mux),
    Cluster(ClusterClient),
}

struct Lease {
    mux: Mux,
    pooled: Pooled,
    slot: u16,
    hooked: bool,
}

impl Lease {
    async fn give_back(self) {
        if self.hooked {
            self.pooled.pipe().set_pubsub_hooks(PubSubHooks::default());
        }
        self.mux.release(self.pooled).await;
    }
}

enum State {
    Idle,
    Pinned(Lease),
    Released,
}

/// A client bound to a single connection
///
/// In cluster mode the connection belongs to the node owning the slot of
/// the first command; commands for any other slot fail with
/// [`RedisError::CrossSlot`]. After release every call fails with
/// [`RedisError::DedicatedRecycled`].
pub struct DedicatedClient {
    backend: Backend,
    state: Mutex<State>,
}

impl DedicatedClient {
    pub(crate) fn standalone(mux: Mux) -> Self {
        Self::new(Backend::Standalone(mux))
    }

    pub(crate) fn cluster(cluster: ClusterClient) -> Self {
        Self::new(Backend::Cluster(cluster))
    }

    fn new(backend: Backend) -> Self {
        Self {
            backend,
            state: Mutex::new(State::Idle),
        }
    }

    /// The pinned pipe, borrowing one for `slot` on first use
    async fn pipe_for(&self, slot: u16, hooking: bool) -> RedisResult<Arc<Pipe>> {
        let clustered = matches!(self.backend, Backend::Cluster(_));
        if clustered && slot == NO_SLOT {
            return Err(RedisError::CrossSlot);
        }

        let mut state = self.state.lock().await;
        match &mut *state {
            State::Released => return Err(RedisError::DedicatedRecycled),
            State::Pinned(lease) => {
                if clustered && slot != INIT_SLOT && slot != lease.slot {
                    return Err(RedisError::CrossSlot);
                }
                lease.hooked |= hooking;
                return Ok(lease.pooled.pipe().clone());
            }
            State::Idle => {}
        }

        let (mux, pooled) = match &self.backend {
            Backend::Standalone(mux) => (mux.clone(), mux.acquire().await?),
            Backend::Cluster(cluster) => cluster.acquire(slot).await?,
        };
        let pipe = pooled.pipe().clone();
        *state = State::Pinned(Lease {
            mux,
            pooled,
            slot,
            hooked: hooking,
        });
        Ok(pipe)
    }

    /// Send one command and wait for its reply
    pub async fn execute(&self, cmd: Command) -> RedisResult<Message> {
        let pipe = self.pipe_for(cmd.slot(), false).await?;
        pipe.execute(cmd).await?.into_result()
    }

    /// Send commands back to back on the borrowed connection
    ///
    /// Replies come back in order, one per command.
    pub async fn execute_multi(&self, cmds: Vec<Command>) -> Vec<RedisResult<Message>> {
        let n = cmds.len();
        if n == 0 {
            return Vec::new();
        }
        let pipe = match self.pipe_for(shared_slot(&cmds), false).await {
            Ok(pipe) => pipe,
            Err(err) => return vec![Err(err); n],
        };
        pipe.execute_multi(cmds)
            .await
            .into_iter()
            .map(|r| r.and_then(Message::into_result))
            .collect()
    }

    /// Subscribe on the borrowed connection and deliver messages until
    /// every channel is unsubscribed
    pub async fn receive<F>(
        &self,
        subscribe: Command,
        on_message: F,
        on_subscription: Option<SubscriptionHook>,
    ) -> RedisResult<()>
    where
        F: FnMut(PubSubMessage) + Send,
    {
        let pipe = self.pipe_for(subscribe.slot(), false).await?;
        pipe.receive(subscribe, on_message, on_subscription).await
    }

    /// Install connection-wide pub/sub hooks
    ///
    /// The receiver resolves with the connection's error once it stops.
    /// Empty hooks uninstall the current ones and return `None`.
    pub async fn set_pubsub_hooks(
        &self,
        hooks: PubSubHooks,
    ) -> RedisResult<Option<oneshot::Receiver<RedisError>>> {
        if hooks.is_empty() {
            let state = self.state.lock().await;
            return match &*state {
                State::Pinned(lease) => Ok(lease.pooled.pipe().set_pubsub_hooks(hooks)),
                State::Idle => Ok(None),
                State::Released => Err(RedisError::DedicatedRecycled),
            };
        }
        let pipe = self.pipe_for(INIT_SLOT, true).await?;
        Ok(pipe.set_pubsub_hooks(hooks))
    }

    /// Reset the connection and hand it back for reuse
    pub async fn release(&self) {
        let state = std::mem::replace(&mut *self.state.lock().await, State::Released);
        if let State::Pinned(lease) = state {
            lease.give_back().await;
        }
    }

    /// Close the borrowed connection instead of returning it
    pub async fn close(&self) {
        let state = std::mem::replace(&mut *self.state.lock().await, State::Released);
        if let State::Pinned(lease) = state {
            lease.pooled.pipe().close().await;
            lease.mux.discard(lease.pooled);
        }
    }
}

/// The one slot every keyed command agrees on; [`NO_SLOT`] if they disagree
pub(crate) fn shared_slot(cmds: &[Command]) -> u16 {
    let mut keyed = cmds.iter().map(Command::slot).filter(|&s| s != INIT_SLOT);
    match keyed.next() {
        Some(first) if keyed.all(|s| s == first) => first,
        Some(_) => NO_SLOT,
        None => INIT_SLOT,
    }
}

impl Drop for DedicatedClient {
    fn drop(&mut self) {
        let state = std::mem::replace(self.state.get_mut(), State::Released);
        if let (State::Pinned(lease), Ok(handle)) = (state, Handle::try_current()) {
            handle.spawn(lease.give_back());
        }
    }
}
