//! Replies copied straight into a writer
//!
//! A [`ResultStream`] owns a pooled connection until its last reply has
//! been read, so large values can be moved into a file or socket without
//! holding them in memory.

use crate::mux::Mux;
use crate::pool::Pooled;
use redis_weave_core::error::{RedisError, RedisResult};
use tokio::io::AsyncWrite;

/// Replies of [`Client::execute_stream`](crate::Client::execute_stream)
/// and [`Client::execute_multi_stream`](crate::Client::execute_multi_stream),
/// read one at a time with [`write_to`](Self::write_to)
///
/// Dropping the stream before the last reply closes its connection.
pub struct ResultStream {
    lease: Option<(Mux, Pooled)>,
    left: usize,
    error: Option<RedisError>,
}

impl ResultStream {
    pub(crate) fn open(mux: Mux, pooled: Pooled, replies: usize) -> Self {
        let mut stream = Self {
            lease: Some((mux, pooled)),
            left: replies,
            error: None,
        };
        if replies == 0 {
            stream.finish();
        }
        stream
    }

    pub(crate) fn failed(err: RedisError) -> Self {
        Self {
            lease: None,
            left: 0,
            error: Some(err),
        }
    }

    /// Whether [`write_to`](Self::write_to) has another reply to deliver
    pub fn has_next(&self) -> bool {
        self.left > 0 && self.error.is_none()
    }

    /// Why the stream stopped; [`RedisError::StreamDone`] after the last reply
    pub fn error(&self) -> Option<&RedisError> {
        self.error.as_ref()
    }

    /// Copy the next reply into `out` and return how many bytes it took
    ///
    /// A server error, nil or non-string reply is returned for that reply
    /// alone and the stream moves on. Connection and writer failures end
    /// the stream.
    pub async fn write_to<W>(&mut self, out: &mut W) -> RedisResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let Some((_, pooled)) = &self.lease else {
            return Err(RedisError::StreamDone);
        };
        let result = pooled.pipe().stream_reply(out).await;
        if let Err(err) = &result {
            if pooled.pipe().error().is_some() {
                self.error = Some(err.clone());
                self.left = 1;
            }
        }
        self.left -= 1;
        if self.left == 0 {
            self.finish();
        }
        result
    }

    fn finish(&mut self) {
        if let Some((mux, pooled)) = self.lease.take() {
            mux.end_stream(pooled);
        }
        self.error.get_or_insert(RedisError::StreamDone);
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        if let Some((_, pooled)) = &self.lease {
            pooled.pipe().exit(RedisError::Connection(
                "result stream dropped before its last reply".to_string(),
            ));
        }
    }
}
