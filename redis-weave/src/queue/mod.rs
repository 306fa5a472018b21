//! Per-connection request queues
//!
//! Callers put requests; the writer task takes them in order and moves them
//! to the in-flight stage; the reader task resolves in-flight requests in
//! the same order. Two implementations exist:
//!
//! - [`RingQueue`]: a fixed number of slots shared by both stages, producers
//!   wait for a free slot
//! - [`FlowQueue`]: a bounded channel in front of the writer, producers wait
//!   for channel capacity

mod flow;
mod ring;

pub(crate) use flow::FlowQueue;
pub(crate) use ring::RingQueue;

use async_trait::async_trait;
use bytes::Bytes;
use redis_weave_core::{
    command::Command,
    config::QueueKind,
    error::{RedisError, RedisResult},
    message::Message,
};
use std::sync::Arc;
use tokio::sync::oneshot;

/// One result per command of a request
pub(crate) type Replies = Vec<RedisResult<Message>>;

/// One outstanding batch and its single-use reply slot
pub(crate) struct Request {
    pub cmds: Arc<[Command]>,
    pub tx: oneshot::Sender<Replies>,
    /// `(key, signature)` per caching transaction when the batch fills the cache
    pub cached: Option<Arc<[(Bytes, Bytes)]>>,
}

impl Request {
    pub fn new(cmds: Arc<[Command]>, cached: Option<Arc<[(Bytes, Bytes)]>>) -> (Self, oneshot::Receiver<Replies>) {
        let (tx, rx) = oneshot::channel();
        (Self { cmds, tx, cached }, rx)
    }

    /// Resolve every command with the same error
    pub fn fail(self, err: &RedisError) {
        let replies = self.cmds.iter().map(|_| Err(err.clone())).collect();
        let _ = self.tx.send(replies);
    }
}

/// What the writer needs to put a request on the wire
pub(crate) struct WriteBatch {
    pub cmds: Arc<[Command]>,
}

#[async_trait]
pub(crate) trait RequestQueue: Send + Sync {
    /// Enqueue, waiting for capacity; fails once the queue is closed
    async fn put(&self, req: Request) -> RedisResult<()>;

    /// Take the next unwritten request without waiting
    fn try_next_write(&self) -> Option<WriteBatch>;

    /// Wait for the next unwritten request; `None` once closed
    async fn next_write(&self) -> Option<WriteBatch>;

    /// Take the oldest written request for the reader
    fn next_result(&self) -> Option<Request>;

    /// The reader resolved the request it took
    fn finish_result(&self);

    /// Reject further puts and fail everything still queued
    fn close(&self, err: &RedisError);
}

pub(crate) fn new_queue(kind: QueueKind, scale: u32) -> Box<dyn RequestQueue> {
    let size = 1usize << scale.clamp(1, 30);
    match kind {
        QueueKind::Ring => Box::new(RingQueue::new(size)),
        QueueKind::Flow => Box::new(FlowQueue::new(size)),
    }
}
