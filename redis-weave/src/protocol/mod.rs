//! Redis protocol implementation
//!
//! [`resp3`] holds the frame codec. [`MessageReader`] and [`CommandWriter`]
//! wrap the two halves of a connection with their buffers.

pub mod resp3;

pub use resp3::{FrameScanner, Resp3Decoder, Resp3Encoder};

use bytes::{Buf, BytesMut};
use redis_weave_core::{
    command::Command,
    error::{RedisError, RedisResult},
    message::Message,
};
use std::io::{self, Cursor};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Buffered reader yielding one decoded [`Message`] at a time
pub struct MessageReader<R> {
    inner: R,
    buf: BytesMut,
    scanner: FrameScanner,
}

/// Outcome of [`MessageReader::copy_reply`]
pub enum Copied {
    /// A blob string payload of this many bytes went to the writer
    Bytes(u64),
    /// Any other reply, decoded as usual
    Frame(Message),
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wrap a read half
    pub fn new(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(capacity.max(4096)),
            scanner: FrameScanner::new(),
        }
    }

    /// Read the next complete frame
    ///
    /// # Errors
    ///
    /// Socket errors, EOF and malformed frames.
    pub async fn read_message(&mut self) -> RedisResult<Message> {
        loop {
            if let Some(len) = self.scanner.scan(&self.buf)? {
                self.scanner.reset();
                let frame = self.buf.split_to(len);
                let mut cursor = Cursor::new(&frame[..]);
                return match Resp3Decoder::decode(&mut cursor)? {
                    Some(msg) if cursor.position() as usize == len => Ok(msg),
                    _ => Err(RedisError::Protocol("Frame length mismatch".to_string())),
                };
            }
            self.fill().await?;
        }
    }

    /// Copy the next reply into `out` if it is a blob string, without
    /// holding the whole payload in memory. Other replies come back decoded.
    ///
    /// # Errors
    ///
    /// Socket, writer and framing errors; the connection is unusable after any of them.
    pub async fn copy_reply<W>(&mut self, out: &mut W) -> RedisResult<Copied>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let header = loop {
            if let Some(end) = self.buf.windows(2).position(|w| w == b"\r\n") {
                break end;
            }
            self.fill().await?;
        };
        if self.buf[0] != b'$' || matches!(&self.buf[1..header], b"?" | b"-1") {
            return Ok(Copied::Frame(self.read_message().await?));
        }
        let len = match resp3::parse_int(&self.buf[1..header])? {
            n if n < 0 => return Err(RedisError::Protocol(format!("Invalid length: {}", n))),
            n => n as usize,
        };
        self.buf.advance(header + 2);

        let mut left = len;
        while left > 0 {
            if self.buf.is_empty() {
                self.fill().await?;
            }
            let n = left.min(self.buf.len());
            out.write_all(&self.buf[..n]).await?;
            self.buf.advance(n);
            left -= n;
        }
        while self.buf.len() < 2 {
            self.fill().await?;
        }
        if &self.buf[..2] != b"\r\n" {
            return Err(RedisError::Protocol("Invalid blob terminator".to_string()));
        }
        self.buf.advance(2);
        out.flush().await?;
        Ok(Copied::Bytes(len as u64))
    }

    async fn fill(&mut self) -> RedisResult<()> {
        if self.buf.capacity() - self.buf.len() < 1024 {
            self.buf.reserve(4096);
        }
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(RedisError::from(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }
        Ok(())
    }

    /// Read the next frame that is not a push
    pub async fn read_reply(&mut self) -> RedisResult<Message> {
        loop {
            let msg = self.read_message().await?;
            if !msg.is_push() {
                return Ok(msg);
            }
        }
    }
}

/// Buffered writer for outgoing commands; nothing reaches the socket until [`flush`](Self::flush)
pub struct CommandWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> CommandWriter<W> {
    /// Wrap a write half
    pub fn new(inner: W, capacity: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(capacity.max(4096)),
        }
    }

    /// Encode a command into the buffer
    pub fn write_command(&mut self, cmd: &Command) {
        Resp3Encoder::encode_command(cmd.args(), &mut self.buf);
    }

    /// Bytes waiting to be flushed
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Write everything buffered to the socket
    pub async fn flush(&mut self) -> RedisResult<()> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf).await?;
            self.buf.clear();
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write direction
    pub async fn shutdown(&mut self) -> RedisResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_handles_split_frames() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut reader = MessageReader::new(client, 16);

        tokio::spawn(async move {
            server.write_all(b"*2\r\n$3\r\nfo").await.unwrap();
            tokio::task::yield_now().await;
            server.write_all(b"o\r\n:1\r\n>2\r\n+pong\r\n+x\r\n+OK\r\n").await.unwrap();
        });

        let msg = reader.read_message().await.unwrap();
        assert_eq!(msg.as_array().unwrap()[0].as_str().unwrap(), "foo");
        assert_eq!(reader.read_reply().await.unwrap().as_str().unwrap(), "OK");
    }

    #[tokio::test]
    async fn test_reader_handles_byte_by_byte_delivery() {
        let (client, mut server) = tokio::io::duplex(8);
        let mut reader = MessageReader::new(client, 16);
        let payload = vec![b'x'; 5000];

        tokio::spawn(async move {
            let mut data = format!("${}\r\n", payload.len()).into_bytes();
            data.extend_from_slice(&payload);
            data.extend_from_slice(b"\r\n|1\r\n+ttl\r\n:3\r\n%1\r\n+k\r\n$?\r\n;2\r\nab\r\n;0\r\n");
            for byte in data {
                server.write_all(&[byte]).await.unwrap();
            }
        });

        let blob = reader.read_message().await.unwrap();
        assert_eq!(blob.as_bytes().unwrap().len(), 5000);
        let map = reader.read_message().await.unwrap();
        assert_eq!(map.attributes().unwrap()[0].1.as_i64().unwrap(), 3);
        assert_eq!(map.as_map().unwrap()["k"].as_str().unwrap(), "ab");
    }

    #[tokio::test]
    async fn test_copy_reply_streams_blob_payload() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut reader = MessageReader::new(client, 16);
        tokio::spawn(async move {
            server
                .write_all(b"$11\r\nhello\x00world\r\n:7\r\n$-1\r\n")
                .await
                .unwrap();
        });

        let mut out = Vec::new();
        assert!(matches!(reader.copy_reply(&mut out).await.unwrap(), Copied::Bytes(11)));
        assert_eq!(out, b"hello\x00world");
        match reader.copy_reply(&mut out).await.unwrap() {
            Copied::Frame(msg) => assert_eq!(msg.as_i64().unwrap(), 7),
            Copied::Bytes(_) => panic!("integer copied as bytes"),
        }
        match reader.copy_reply(&mut out).await.unwrap() {
            Copied::Frame(msg) => assert!(msg.is_null()),
            Copied::Bytes(_) => panic!("null copied as bytes"),
        }
    }

    #[tokio::test]
    async fn test_reader_eof() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut reader = MessageReader::new(client, 16);
        assert!(reader.read_message().await.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn test_writer_buffers_until_flush() {
        let (client, server) = tokio::io::duplex(256);
        let mut writer = CommandWriter::new(client, 16);
        writer.write_command(&Command::from_args(["PING"]));
        assert_eq!(writer.buffered(), 14);
        writer.flush().await.unwrap();
        assert_eq!(writer.buffered(), 0);

        let mut reader = MessageReader::new(server, 16);
        let echoed = reader.read_message().await.unwrap();
        assert_eq!(echoed.as_array().unwrap()[0].as_str().unwrap(), "PING");
    }
}
