//! Bounded pool of exclusively borrowed connections
//!
//! Blocking commands and dedicated clients cannot share a pipe with other
//! callers, so they borrow one from a pool instead. A borrowed pipe has its
//! lifetime timer stopped; a pipe that fails while borrowed is closed and
//! never handed out again.

use crate::pipe::Pipe;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use redis_weave_core::error::{RedisError, RedisResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Opens a fresh pipe for the pool
pub(crate) type PipeFactory = Arc<dyn Fn() -> BoxFuture<'static, RedisResult<Arc<Pipe>>> + Send + Sync>;

pub(crate) struct Pool {
    idle: Mutex<Vec<Arc<Pipe>>>,
    permits: Arc<Semaphore>,
    dial: PipeFactory,
    closed: AtomicBool,
}

/// A pipe on loan from a [`Pool`]
///
/// Dropping it without [`Pool::release`] closes the pipe, since the
/// borrower may have left it mid-command.
pub(crate) struct Pooled {
    pipe: Arc<Pipe>,
    returned: bool,
    _permit: OwnedSemaphorePermit,
}

impl Pooled {
    fn new(pipe: Arc<Pipe>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pipe,
            returned: false,
            _permit: permit,
        }
    }

    pub fn pipe(&self) -> &Arc<Pipe> {
        &self.pipe
    }

    fn take(&mut self) -> Arc<Pipe> {
        self.returned = true;
        self.pipe.clone()
    }
}

impl Drop for Pooled {
    fn drop(&mut self) {
        if !self.returned {
            close_later(self.pipe.clone());
        }
    }
}

fn close_later(pipe: Arc<Pipe>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move { pipe.close().await });
    }
}

impl Pool {
    pub fn new(size: usize, dial: PipeFactory) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(size.max(1))),
            dial,
            closed: AtomicBool::new(false),
        }
    }

    /// Borrow an idle pipe or dial a new one, waiting while the pool is exhausted
    pub async fn acquire(&self) -> RedisResult<Pooled> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RedisError::Closing)?;

        loop {
            let candidate = self.idle.lock().pop();
            match candidate {
                Some(pipe) if pipe.error().is_none() && pipe.stop_timer() => {
                    return Ok(Pooled::new(pipe, permit));
                }
                Some(pipe) => close_later(pipe),
                None => break,
            }
        }

        let pipe = (self.dial)().await?;
        pipe.stop_timer();
        Ok(Pooled::new(pipe, permit))
    }

    /// Give a healthy pipe back; a failed one is closed instead
    pub fn release(&self, mut pooled: Pooled) {
        let pipe = pooled.take();
        if self.closed.load(Ordering::Acquire) || pipe.error().is_some() || pipe.is_blocked() {
            close_later(pipe);
            return;
        }
        pipe.reset_timer();
        self.idle.lock().push(pipe);
    }

    /// Close a pipe that failed while borrowed
    pub fn evict(&self, mut pooled: Pooled) {
        let pipe = pooled.take();
        debug!(addr = %pipe.addr(), "evicting broken connection from pool");
        close_later(pipe);
    }

    /// Close idle pipes and refuse further borrowing
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        let idle: Vec<_> = self.idle.lock().drain(..).collect();
        for pipe in idle {
            pipe.close().await;
        }
    }

    #[cfg(test)]
    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}
