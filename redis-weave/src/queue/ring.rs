use super::{Request, RequestQueue, WriteBatch};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis_weave_core::error::{RedisError, RedisResult};
use std::collections::VecDeque;
use tokio::sync::Notify;

struct RingState {
    unwritten: VecDeque<Request>,
    in_flight: VecDeque<Request>,
    /// Slots taken, including the one the reader is working on
    used: usize,
    closed: Option<RedisError>,
}

/// Fixed-capacity queue; a slot is released only after the reader resolves it
pub(crate) struct RingQueue {
    size: usize,
    state: Mutex<RingState>,
    space: Notify,
    writable: Notify,
}

impl RingQueue {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(RingState {
                unwritten: VecDeque::with_capacity(size.min(1024)),
                in_flight: VecDeque::with_capacity(size.min(1024)),
                used: 0,
                closed: None,
            }),
            space: Notify::new(),
            writable: Notify::new(),
        }
    }
}

#[async_trait]
impl RequestQueue for RingQueue {
    async fn put(&self, req: Request) -> RedisResult<()> {
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            {
                let mut state = self.state.lock();
                if let Some(err) = &state.closed {
                    return Err(err.clone());
                }
                if state.used < self.size {
                    state.used += 1;
                    state.unwritten.push_back(req);
                    drop(state);
                    self.writable.notify_one();
                    return Ok(());
                }
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    fn try_next_write(&self) -> Option<WriteBatch> {
        let mut state = self.state.lock();
        let req = state.unwritten.pop_front()?;
        let batch = WriteBatch {
            cmds: req.cmds.clone(),
        };
        state.in_flight.push_back(req);
        Some(batch)
    }

    async fn next_write(&self) -> Option<WriteBatch> {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            {
                let mut state = self.state.lock();
                if state.closed.is_some() {
                    return None;
                }
                if let Some(req) = state.unwritten.pop_front() {
                    let batch = WriteBatch {
                        cmds: req.cmds.clone(),
                    };
                    state.in_flight.push_back(req);
                    return Some(batch);
                }
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    fn next_result(&self) -> Option<Request> {
        self.state.lock().in_flight.pop_front()
    }

    fn finish_result(&self) {
        {
            let mut state = self.state.lock();
            state.used = state.used.saturating_sub(1);
        }
        self.space.notify_one();
    }

    fn close(&self, err: &RedisError) {
        let pending: Vec<Request> = {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                state.closed = Some(err.clone());
            }
            let mut pending: Vec<Request> = state.in_flight.drain(..).collect();
            pending.extend(state.unwritten.drain(..));
            state.used = 0;
            pending
        };
        for req in pending {
            req.fail(err);
        }
        self.space.notify_waiters();
        self.writable.notify_waiters();
    }
}
