//! RESP3 (Redis Serialization Protocol version 3) codec
//!
//! Decoding works on a [`Cursor`] over the bytes buffered so far and returns
//! `Ok(None)` when the frame is not complete yet, leaving the caller free to
//! read more from the socket and try again from the same position.
//!
//! # Supported frames
//!
//! - **Simple**: `+` string, `-` error, `:` integer, `_` null, `#` boolean,
//!   `,` double, `(` big number
//! - **Blob**: `$` string, `!` error, `=` verbatim string, including the
//!   chunked `$?` form terminated by `;0`
//! - **Aggregate**: `*` array, `%` map, `~` set, `>` push, including the
//!   streamed `?` form terminated by `.`
//! - **Attribute**: `|` pairs attached to the following reply
//! - RESP2 nulls `$-1` and `*-1`
//!
//! # Examples
//!
//! ```
//! use redis_weave::protocol::resp3::Resp3Decoder;
//! use std::io::Cursor;
//!
//! let mut cursor = Cursor::new(&b"*2\r\n$3\r\nfoo\r\n:42\r\n"[..]);
//! let msg = Resp3Decoder::decode(&mut cursor)?.expect("complete frame");
//! assert_eq!(msg.as_array()?[1].as_i64()?, 42);
//! # Ok::<(), redis_weave::RedisError>(())
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use redis_weave_core::{
    error::{RedisError, RedisResult},
    message::{Message, Value},
};
use std::io::Cursor;

const CRLF: &[u8] = b"\r\n";

macro_rules! ready {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Ok(None),
        }
    };
}

/// Encodes commands and messages into RESP3 frames
pub struct Resp3Encoder;

impl Resp3Encoder {
    /// Append `*<argc>` followed by one blob string per argument
    pub fn encode_command(args: &[Bytes], buf: &mut BytesMut) {
        buf.reserve(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
        put_header(buf, b'*', args.len());
        for arg in args {
            put_header(buf, b'$', arg.len());
            buf.put_slice(arg);
            buf.put_slice(CRLF);
        }
    }

    /// Append a full message, attributes first
    pub fn encode_message(msg: &Message, buf: &mut BytesMut) {
        if let Some(attrs) = msg.attributes() {
            put_header(buf, b'|', attrs.len());
            for (k, v) in attrs {
                Self::encode_message(k, buf);
                Self::encode_message(v, buf);
            }
        }
        match msg.value() {
            Value::Null => buf.put_slice(b"_\r\n"),
            Value::SimpleString(s) => put_line(buf, b'+', s),
            Value::SimpleError(s) => put_line(buf, b'-', s),
            Value::BigNumber(s) => put_line(buf, b'(', s),
            Value::Integer(i) => put_line(buf, b':', i.to_string().as_bytes()),
            Value::Double(f) => put_line(buf, b',', format_double(*f).as_bytes()),
            Value::Boolean(b) => put_line(buf, b'#', if *b { b"t" } else { b"f" }),
            Value::BlobString(s) => put_blob(buf, b'$', s),
            Value::BlobError(s) => put_blob(buf, b'!', s),
            Value::VerbatimString(s) => put_blob(buf, b'=', s),
            Value::Array(items) => put_aggregate(buf, b'*', items),
            Value::Set(items) => put_aggregate(buf, b'~', items),
            Value::Push(items) => put_aggregate(buf, b'>', items),
            Value::Map(pairs) => {
                put_header(buf, b'%', pairs.len());
                for (k, v) in pairs {
                    Self::encode_message(k, buf);
                    Self::encode_message(v, buf);
                }
            }
        }
    }
}

fn put_header(buf: &mut BytesMut, tag: u8, len: usize) {
    buf.put_u8(tag);
    buf.put_slice(len.to_string().as_bytes());
    buf.put_slice(CRLF);
}

fn put_line(buf: &mut BytesMut, tag: u8, line: &[u8]) {
    buf.put_u8(tag);
    buf.put_slice(line);
    buf.put_slice(CRLF);
}

fn put_blob(buf: &mut BytesMut, tag: u8, data: &[u8]) {
    put_header(buf, tag, data.len());
    buf.put_slice(data);
    buf.put_slice(CRLF);
}

fn put_aggregate(buf: &mut BytesMut, tag: u8, items: &[Message]) {
    put_header(buf, tag, items.len());
    for item in items {
        Resp3Encoder::encode_message(item, buf);
    }
}

fn format_double(f: f64) -> String {
    if f.is_infinite() {
        if f > 0.0 { "inf".into() } else { "-inf".into() }
    } else if f.is_nan() {
        "nan".into()
    } else {
        f.to_string()
    }
}

/// Aggregate length: a count, or `?` for the streamed form
enum Len {
    Fixed(usize),
    Null,
    Streamed,
}

/// Decodes RESP3 frames from a buffer
pub struct Resp3Decoder;

impl Resp3Decoder {
    /// Decode one complete message, or `None` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Malformed lengths, bad terminators and unknown type bytes are
    /// [`RedisError::Protocol`]; the connection cannot recover from them.
    pub fn decode(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Message>> {
        let mut attributes = None;
        loop {
            if !buf.has_remaining() {
                return Ok(None);
            }
            if buf.chunk()[0] != b'|' {
                break;
            }
            buf.advance(1);
            let len = match ready!(Self::read_len(buf)?) {
                Len::Fixed(n) => n,
                _ => return Err(RedisError::Protocol("Invalid attribute length".to_string())),
            };
            let mut pairs = Vec::with_capacity(len);
            for _ in 0..len {
                let k = ready!(Self::decode(buf)?);
                let v = ready!(Self::decode(buf)?);
                pairs.push((k, v));
            }
            attributes = Some(pairs);
        }

        let mut msg = ready!(Self::decode_value(buf)?);
        if let Some(attrs) = attributes {
            msg.set_attributes(attrs);
        }
        Ok(Some(msg))
    }

    fn decode_value(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Message>> {
        let type_byte = buf.get_u8();
        let value = match type_byte {
            b'+' => Value::SimpleString(Self::copy(ready!(Self::read_line(buf)?))),
            b'-' => Value::SimpleError(Self::copy(ready!(Self::read_line(buf)?))),
            b'(' => Value::BigNumber(Self::copy(ready!(Self::read_line(buf)?))),
            b':' => Value::Integer(parse_int(ready!(Self::read_line(buf)?))?),
            b',' => Value::Double(parse_double(ready!(Self::read_line(buf)?))?),
            b'#' => match ready!(Self::read_line(buf)?) {
                b"t" => Value::Boolean(true),
                b"f" => Value::Boolean(false),
                other => {
                    return Err(RedisError::Protocol(format!(
                        "Invalid boolean: {}",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            b'_' => {
                if !ready!(Self::read_line(buf)?).is_empty() {
                    return Err(RedisError::Protocol("Invalid null format".to_string()));
                }
                Value::Null
            }
            b'$' => match ready!(Self::read_blob(buf)?) {
                Some(data) => Value::BlobString(data),
                None => Value::Null,
            },
            b'!' => match ready!(Self::read_blob(buf)?) {
                Some(data) => Value::BlobError(data),
                None => Value::Null,
            },
            b'=' => match ready!(Self::read_blob(buf)?) {
                Some(data) => Value::VerbatimString(data),
                None => Value::Null,
            },
            b'*' => match ready!(Self::read_items(buf)?) {
                Some(items) => Value::Array(items),
                None => Value::Null,
            },
            b'~' => match ready!(Self::read_items(buf)?) {
                Some(items) => Value::Set(items),
                None => Value::Null,
            },
            b'>' => match ready!(Self::read_items(buf)?) {
                Some(items) => Value::Push(items),
                None => Value::Null,
            },
            b'%' => match ready!(Self::read_pairs(buf)?) {
                Some(pairs) => Value::Map(pairs),
                None => Value::Null,
            },
            _ => {
                return Err(RedisError::Protocol(format!(
                    "Unknown RESP3 type byte: {:?}",
                    type_byte as char
                )))
            }
        };
        Ok(Some(Message::new(value)))
    }

    /// Returns `Some(None)` for a RESP2 null blob
    fn read_blob(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Option<Bytes>>> {
        match ready!(Self::read_len(buf)?) {
            Len::Null => Ok(Some(None)),
            Len::Fixed(len) => {
                let data = ready!(Self::read_exact(buf, len)?);
                Ok(Some(Some(data)))
            }
            Len::Streamed => {
                let mut data = BytesMut::new();
                loop {
                    if !buf.has_remaining() {
                        return Ok(None);
                    }
                    if buf.get_u8() != b';' {
                        return Err(RedisError::Protocol(
                            "Invalid streamed string chunk".to_string(),
                        ));
                    }
                    let len = match ready!(Self::read_len(buf)?) {
                        Len::Fixed(n) => n,
                        _ => {
                            return Err(RedisError::Protocol(
                                "Invalid streamed string chunk length".to_string(),
                            ))
                        }
                    };
                    if len == 0 {
                        return Ok(Some(Some(data.freeze())));
                    }
                    data.put_slice(&ready!(Self::read_exact(buf, len)?));
                }
            }
        }
    }

    fn read_items(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Option<Vec<Message>>>> {
        match ready!(Self::read_len(buf)?) {
            Len::Null => Ok(Some(None)),
            Len::Fixed(len) => {
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(ready!(Self::decode(buf)?));
                }
                Ok(Some(Some(items)))
            }
            Len::Streamed => {
                let mut items = Vec::new();
                while !ready!(Self::end_of_stream(buf)?) {
                    items.push(ready!(Self::decode(buf)?));
                }
                Ok(Some(Some(items)))
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn read_pairs(
        buf: &mut Cursor<&[u8]>,
    ) -> RedisResult<Option<Option<Vec<(Message, Message)>>>> {
        let streamed = match ready!(Self::read_len(buf)?) {
            Len::Null => return Ok(Some(None)),
            Len::Fixed(len) => Some(len),
            Len::Streamed => None,
        };
        let mut pairs = Vec::with_capacity(streamed.unwrap_or(0).min(1024));
        match streamed {
            Some(len) => {
                for _ in 0..len {
                    let k = ready!(Self::decode(buf)?);
                    let v = ready!(Self::decode(buf)?);
                    pairs.push((k, v));
                }
            }
            None => {
                while !ready!(Self::end_of_stream(buf)?) {
                    let k = ready!(Self::decode(buf)?);
                    let v = ready!(Self::decode(buf)?);
                    pairs.push((k, v));
                }
            }
        }
        Ok(Some(Some(pairs)))
    }

    /// Consume the `.` terminator of a streamed aggregate if it is next
    fn end_of_stream(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<bool>> {
        if !buf.has_remaining() {
            return Ok(None);
        }
        if buf.chunk()[0] != b'.' {
            return Ok(Some(false));
        }
        buf.advance(1);
        if !ready!(Self::read_line(buf)?).is_empty() {
            return Err(RedisError::Protocol("Invalid stream terminator".to_string()));
        }
        Ok(Some(true))
    }

    fn read_len(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<Len>> {
        let line = ready!(Self::read_line(buf)?);
        if line == b"?" {
            return Ok(Some(Len::Streamed));
        }
        match parse_int(line)? {
            -1 => Ok(Some(Len::Null)),
            n if n < 0 => Err(RedisError::Protocol(format!("Invalid length: {}", n))),
            n => Ok(Some(Len::Fixed(n as usize))),
        }
    }

    fn read_exact(buf: &mut Cursor<&[u8]>, len: usize) -> RedisResult<Option<Bytes>> {
        if buf.remaining() < len + 2 {
            return Ok(None);
        }
        let data = Bytes::copy_from_slice(&buf.chunk()[..len]);
        buf.advance(len);
        if buf.chunk()[..2] != *CRLF {
            return Err(RedisError::Protocol("Invalid blob terminator".to_string()));
        }
        buf.advance(2);
        Ok(Some(data))
    }

    fn read_line<'a>(buf: &mut Cursor<&'a [u8]>) -> RedisResult<Option<&'a [u8]>> {
        let start = buf.position() as usize;
        let data: &'a [u8] = *buf.get_ref();
        let Some(offset) = data[start..].windows(2).position(|w| w == CRLF) else {
            return Ok(None);
        };
        let end = start + offset;
        buf.set_position((end + 2) as u64);
        Ok(Some(&data[start..end]))
    }

    fn copy(line: &[u8]) -> Bytes {
        Bytes::copy_from_slice(line)
    }
}

/// What an open aggregate still waits for
#[derive(Debug, Clone, Copy)]
enum Open {
    Values(usize),
    Attribute(usize),
    Streamed,
}

/// Finds where the next frame ends without building it
///
/// Progress is kept between calls, so feeding a large reply a few bytes at a
/// time only looks at each new byte once. Blob payloads are skipped by length.
#[derive(Debug, Default)]
pub struct FrameScanner {
    pos: usize,
    searched: usize,
    open: Vec<Open>,
    chunked: bool,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget a partial scan; call after consuming a frame
    pub fn reset(&mut self) {
        self.pos = 0;
        self.searched = 0;
        self.open.clear();
        self.chunked = false;
    }

    /// Length of the first complete frame in `buf`, or `None` if more bytes
    /// are needed. `buf` must only grow between calls until a frame is found.
    ///
    /// # Errors
    ///
    /// Unknown type bytes and malformed lengths.
    pub fn scan(&mut self, buf: &[u8]) -> RedisResult<Option<usize>> {
        loop {
            if self.chunked {
                let Some((line, next)) = self.line(buf, self.pos) else {
                    return Ok(None);
                };
                if line.first() != Some(&b';') {
                    return Err(RedisError::Protocol("Invalid streamed string chunk".to_string()));
                }
                let len = scan_len(&line[1..])?;
                if len == 0 {
                    self.pos = next;
                    self.chunked = false;
                    if self.close_value() {
                        return Ok(Some(self.pos));
                    }
                    continue;
                }
                if buf.len() < next + len + 2 {
                    return Ok(None);
                }
                self.pos = next + len + 2;
                continue;
            }

            let Some(&tag) = buf.get(self.pos) else {
                return Ok(None);
            };
            let Some((line, next)) = self.line(buf, self.pos + 1) else {
                return Ok(None);
            };
            let done = match tag {
                b'+' | b'-' | b':' | b',' | b'#' | b'_' | b'(' => {
                    self.pos = next;
                    self.close_value()
                }
                b'$' | b'!' | b'=' => {
                    if line == b"?" {
                        self.pos = next;
                        self.chunked = true;
                        continue;
                    }
                    match parse_int(line)? {
                        -1 => self.pos = next,
                        n if n < 0 => {
                            return Err(RedisError::Protocol(format!("Invalid length: {}", n)))
                        }
                        n => {
                            let end = next + n as usize + 2;
                            if buf.len() < end {
                                return Ok(None);
                            }
                            self.pos = end;
                        }
                    }
                    self.close_value()
                }
                b'*' | b'~' | b'>' | b'%' | b'|' => {
                    self.pos = next;
                    if line == b"?" && tag != b'|' {
                        self.open.push(Open::Streamed);
                        continue;
                    }
                    match parse_int(line)? {
                        -1 if tag != b'|' => self.close_value(),
                        n if n < 0 => {
                            return Err(RedisError::Protocol(format!("Invalid length: {}", n)))
                        }
                        0 if tag == b'|' => false,
                        0 => self.close_value(),
                        n => {
                            let n = n as usize;
                            self.open.push(match tag {
                                b'|' => Open::Attribute(n * 2),
                                b'%' => Open::Values(n * 2),
                                _ => Open::Values(n),
                            });
                            false
                        }
                    }
                }
                b'.' => {
                    if !line.is_empty() || !matches!(self.open.pop(), Some(Open::Streamed)) {
                        return Err(RedisError::Protocol("Invalid stream terminator".to_string()));
                    }
                    self.pos = next;
                    self.close_value()
                }
                _ => {
                    return Err(RedisError::Protocol(format!(
                        "Unknown RESP3 type byte: {:?}",
                        tag as char
                    )))
                }
            };
            if done {
                return Ok(Some(self.pos));
            }
        }
    }

    /// Count one finished value against the open aggregates; `true` once
    /// the outermost one is done
    fn close_value(&mut self) -> bool {
        loop {
            match self.open.last_mut() {
                None => return true,
                Some(Open::Streamed) => return false,
                Some(Open::Values(n)) => {
                    *n -= 1;
                    if *n != 0 {
                        return false;
                    }
                    self.open.pop();
                }
                Some(Open::Attribute(n)) => {
                    *n -= 1;
                    if *n == 0 {
                        // attributes decorate the next value and are not one themselves
                        self.open.pop();
                    }
                    return false;
                }
            }
        }
    }

    /// The line starting at `start` and the offset after its CRLF
    fn line<'a>(&mut self, buf: &'a [u8], start: usize) -> Option<(&'a [u8], usize)> {
        let from = self.searched.max(start);
        if from >= buf.len() {
            return None;
        }
        match buf[from..].windows(2).position(|w| w == CRLF) {
            Some(offset) => {
                self.searched = 0;
                let end = from + offset;
                Some((&buf[start..end], end + 2))
            }
            None => {
                // a trailing CR may still meet its LF
                self.searched = buf.len() - 1;
                None
            }
        }
    }
}

fn scan_len(line: &[u8]) -> RedisResult<usize> {
    match parse_int(line)? {
        n if n < 0 => Err(RedisError::Protocol(format!("Invalid length: {}", n))),
        n => Ok(n as usize),
    }
}

pub(crate) fn parse_int(line: &[u8]) -> RedisResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            RedisError::Protocol(format!(
                "Invalid integer: {}",
                String::from_utf8_lossy(line)
            ))
        })
}

fn parse_double(line: &[u8]) -> RedisResult<f64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| {
            RedisError::Protocol(format!(
                "Invalid double: {}",
                String::from_utf8_lossy(line)
            ))
        })
}
