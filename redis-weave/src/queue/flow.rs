use super::{Request, RequestQueue, WriteBatch};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis_weave_core::error::{RedisError, RedisResult};
use std::collections::VecDeque;
use std::future::poll_fn;
use tokio::sync::mpsc;

/// Channel-backed queue; only the unwritten stage is bounded
pub(crate) struct FlowQueue {
    tx: mpsc::Sender<Request>,
    rx: Mutex<mpsc::Receiver<Request>>,
    in_flight: Mutex<VecDeque<Request>>,
    closed: Mutex<Option<RedisError>>,
}

impl FlowQueue {
    pub fn new(size: usize) -> Self {
        let (tx, rx) = mpsc::channel(size);
        Self {
            tx,
            rx: Mutex::new(rx),
            in_flight: Mutex::new(VecDeque::new()),
            closed: Mutex::new(None),
        }
    }

    fn closed_error(&self) -> RedisError {
        self.closed.lock().clone().unwrap_or(RedisError::Closing)
    }

    fn stage(&self, req: Request) -> WriteBatch {
        let batch = WriteBatch {
            cmds: req.cmds.clone(),
        };
        self.in_flight.lock().push_back(req);
        batch
    }
}

#[async_trait]
impl RequestQueue for FlowQueue {
    async fn put(&self, req: Request) -> RedisResult<()> {
        if let Some(err) = self.closed.lock().clone() {
            return Err(err);
        }
        self.tx.send(req).await.map_err(|_| self.closed_error())
    }

    fn try_next_write(&self) -> Option<WriteBatch> {
        let req = self.rx.lock().try_recv().ok()?;
        Some(self.stage(req))
    }

    async fn next_write(&self) -> Option<WriteBatch> {
        if self.closed.lock().is_some() {
            return None;
        }
        let req = poll_fn(|cx| self.rx.lock().poll_recv(cx)).await?;
        Some(self.stage(req))
    }

    fn next_result(&self) -> Option<Request> {
        self.in_flight.lock().pop_front()
    }

    fn finish_result(&self) {}

    fn close(&self, err: &RedisError) {
        {
            let mut closed = self.closed.lock();
            if closed.is_none() {
                *closed = Some(err.clone());
            }
        }
        let mut pending: Vec<Request> = self.in_flight.lock().drain(..).collect();
        {
            let mut rx = self.rx.lock();
            rx.close();
            while let Ok(req) = rx.try_recv() {
                pending.push(req);
            }
        }
        for req in pending {
            req.fail(err);
        }
    }
}
