//! RESP3 wire message

use crate::error::{RedisError, RedisResult};
use bytes::Bytes;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// The payload of one RESP3 reply, selected by its type byte.
///
/// Streamed aggregates and chunked blob strings are folded into their
/// plain counterparts while decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `_` or RESP2-style `$-1` / `*-1`
    Null,
    /// `+OK`
    SimpleString(Bytes),
    /// `-ERR message`
    SimpleError(Bytes),
    /// `$6\r\nfoobar`
    BlobString(Bytes),
    /// `!21\r\nSYNTAX invalid syntax`
    BlobError(Bytes),
    /// `=15\r\ntxt:Some string`, kept with its three byte format prefix
    VerbatimString(Bytes),
    /// `:1000`
    Integer(i64),
    /// `,3.14`
    Double(f64),
    /// `#t` / `#f`
    Boolean(bool),
    /// `(3492890328409238509324850943850943825024385`
    BigNumber(Bytes),
    /// `*N`
    Array(Vec<Message>),
    /// `%N`, pairs in wire order
    Map(Vec<(Message, Message)>),
    /// `~N`
    Set(Vec<Message>),
    /// `>N`, out-of-band invalidation and pub/sub frames
    Push(Vec<Message>),
}

/// One decoded reply plus its side channels.
#[derive(Debug, Clone)]
pub struct Message {
    value: Value,
    attributes: Option<Box<Vec<(Message, Message)>>>,
    expire_at: Option<Instant>,
    cache_hit: bool,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.attributes == other.attributes
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl Message {
    /// Wrap a value without attributes
    pub fn new(value: Value) -> Self {
        Self {
            value,
            attributes: None,
            expire_at: None,
            cache_hit: false,
        }
    }

    /// `+s`
    pub fn simple(s: impl Into<Bytes>) -> Self {
        Self::new(Value::SimpleString(s.into()))
    }

    /// `$len s`
    pub fn blob(s: impl Into<Bytes>) -> Self {
        Self::new(Value::BlobString(s.into()))
    }

    /// `-s`
    pub fn error_line(s: impl Into<Bytes>) -> Self {
        Self::new(Value::SimpleError(s.into()))
    }

    /// `:n`
    pub fn int(n: i64) -> Self {
        Self::new(Value::Integer(n))
    }

    /// `_`
    pub fn null() -> Self {
        Self::new(Value::Null)
    }

    /// `*N`
    pub fn array(items: Vec<Message>) -> Self {
        Self::new(Value::Array(items))
    }

    /// `>N`
    pub fn push(items: Vec<Message>) -> Self {
        Self::new(Value::Push(items))
    }

    /// `%N`
    pub fn map(pairs: Vec<(Message, Message)>) -> Self {
        Self::new(Value::Map(pairs))
    }

    /// Borrow the payload
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Take the payload
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Attribute pairs delivered ahead of this reply by a `|` frame
    pub fn attributes(&self) -> Option<&[(Message, Message)]> {
        self.attributes.as_deref().map(Vec::as_slice)
    }

    /// Attach attribute pairs
    pub fn set_attributes(&mut self, attributes: Vec<(Message, Message)>) {
        self.attributes = Some(Box::new(attributes));
    }

    /// Short name of the RESP3 type
    pub const fn kind(&self) -> &'static str {
        match self.value {
            Value::Null => "null",
            Value::SimpleString(_) => "simple-string",
            Value::SimpleError(_) => "simple-error",
            Value::BlobString(_) => "blob-string",
            Value::BlobError(_) => "blob-error",
            Value::VerbatimString(_) => "verbatim-string",
            Value::Integer(_) => "integer",
            Value::Double(_) => "double",
            Value::Boolean(_) => "boolean",
            Value::BigNumber(_) => "big-number",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
            Value::Push(_) => "push",
        }
    }

    /// Check if this is a null reply
    pub fn is_null(&self) -> bool {
        matches!(self.value, Value::Null)
    }

    /// Check if this is a push frame
    pub fn is_push(&self) -> bool {
        matches!(self.value, Value::Push(_))
    }

    /// Check if the reply carries a server error
    pub fn is_error(&self) -> bool {
        matches!(self.value, Value::SimpleError(_) | Value::BlobError(_))
    }

    /// The server error carried by this reply, redirects already classified.
    pub fn error(&self) -> Option<RedisError> {
        match &self.value {
            Value::SimpleError(b) | Value::BlobError(b) => {
                Some(RedisError::from_server(&String::from_utf8_lossy(b)))
            }
            _ => None,
        }
    }

    /// Fold a server error reply into `Err`.
    pub fn into_result(self) -> RedisResult<Message> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    fn check(&self) -> RedisResult<()> {
        if let Some(err) = self.error() {
            return Err(err);
        }
        if self.is_null() {
            return Err(RedisError::Nil);
        }
        Ok(())
    }

    /// Raw bytes of a string-like reply
    pub fn as_bytes(&self) -> RedisResult<&Bytes> {
        self.check()?;
        match &self.value {
            Value::SimpleString(b) | Value::BlobString(b) | Value::BigNumber(b) => Ok(b),
            Value::VerbatimString(b) => Ok(b),
            _ => Err(RedisError::Type(format!(
                "{} is not a string",
                self.kind()
            ))),
        }
    }

    /// UTF-8 view of a string-like reply; verbatim strings drop their format prefix
    pub fn as_str(&self) -> RedisResult<&str> {
        let bytes = self.as_bytes()?;
        let bytes = match &self.value {
            Value::VerbatimString(_) if bytes.len() >= 4 && bytes[3] == b':' => &bytes[4..],
            _ => &bytes[..],
        };
        std::str::from_utf8(bytes).map_err(|e| RedisError::Type(format!("Invalid UTF-8: {}", e)))
    }

    /// Convert to an integer, parsing string replies
    pub fn as_i64(&self) -> RedisResult<i64> {
        self.check()?;
        match &self.value {
            Value::Integer(i) => Ok(*i),
            Value::SimpleString(_) | Value::BlobString(_) | Value::BigNumber(_) => self
                .as_str()?
                .parse::<i64>()
                .map_err(|e| RedisError::Type(format!("Cannot parse integer: {}", e))),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {} to integer",
                self.kind()
            ))),
        }
    }

    /// Convert to a float, parsing string replies
    pub fn as_f64(&self) -> RedisResult<f64> {
        self.check()?;
        match &self.value {
            Value::Double(f) => Ok(*f),
            Value::Integer(i) => Ok(*i as f64),
            Value::SimpleString(_) | Value::BlobString(_) => self
                .as_str()?
                .parse::<f64>()
                .map_err(|e| RedisError::Type(format!("Cannot parse float: {}", e))),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {} to float",
                self.kind()
            ))),
        }
    }

    /// Convert to a boolean (`#t`, integer 0/1, or `+OK`)
    pub fn as_bool(&self) -> RedisResult<bool> {
        self.check()?;
        match &self.value {
            Value::Boolean(b) => Ok(*b),
            Value::Integer(i) => Ok(*i != 0),
            Value::SimpleString(s) if s.as_ref() == b"OK" => Ok(true),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {} to bool",
                self.kind()
            ))),
        }
    }

    /// Elements of an array, set or push
    pub fn as_array(&self) -> RedisResult<&[Message]> {
        self.check()?;
        match &self.value {
            Value::Array(items) | Value::Set(items) | Value::Push(items) => Ok(items),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {} to array",
                self.kind()
            ))),
        }
    }

    /// Take the elements of an array, set or push
    pub fn into_array(self) -> RedisResult<Vec<Message>> {
        self.check()?;
        match self.value {
            Value::Array(items) | Value::Set(items) | Value::Push(items) => Ok(items),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {} to array",
                self.kind()
            ))),
        }
    }

    /// Index a map reply (or a flat RESP2-style key/value array) by string key
    pub fn as_map(&self) -> RedisResult<HashMap<String, Message>> {
        self.check()?;
        match &self.value {
            Value::Map(pairs) => pairs
                .iter()
                .map(|(k, v)| Ok((k.as_str()?.to_string(), v.clone())))
                .collect(),
            Value::Array(items) if items.len() % 2 == 0 => items
                .chunks(2)
                .map(|kv| Ok((kv[0].as_str()?.to_string(), kv[1].clone())))
                .collect(),
            _ => Err(RedisError::Type(format!(
                "Cannot convert {} to map",
                self.kind()
            ))),
        }
    }

    /// Nested elements regardless of aggregate type; empty for scalars
    pub fn children(&self) -> &[Message] {
        match &self.value {
            Value::Array(items) | Value::Set(items) | Value::Push(items) => items,
            _ => &[],
        }
    }

    /// Mutable access to aggregate elements
    pub fn elements_mut(&mut self) -> Option<&mut Vec<Message>> {
        match &mut self.value {
            Value::Array(items) | Value::Set(items) | Value::Push(items) => Some(items),
            _ => None,
        }
    }

    /// Lossy string form used for logging and push-frame dispatch
    pub fn to_string_lossy(&self) -> String {
        match &self.value {
            Value::SimpleString(b)
            | Value::BlobString(b)
            | Value::SimpleError(b)
            | Value::BlobError(b)
            | Value::VerbatimString(b)
            | Value::BigNumber(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Integer(i) => i.to_string(),
            Value::Double(f) => f.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Null => String::new(),
            _ => format!("{:?}", self.value),
        }
    }

    /// Absolute expiry assigned by the client-side cache
    pub fn cache_expire_at(&self) -> Option<Instant> {
        self.expire_at
    }

    /// Set the absolute cache expiry
    pub fn set_cache_expire_at(&mut self, at: Option<Instant>) {
        self.expire_at = at;
    }

    /// Remaining client-side cache lifetime, `None` when not cached
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.expire_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether this reply was served from the client-side cache
    pub fn is_cache_hit(&self) -> bool {
        self.cache_hit
    }

    /// Mark a copy as served from the client-side cache
    pub fn mark_cache_hit(&mut self) {
        self.cache_hit = true;
    }

    /// Approximate heap footprint, used for cache budgeting
    pub fn approximate_size(&self) -> usize {
        let own = std::mem::size_of::<Message>();
        let payload = match &self.value {
            Value::SimpleString(b)
            | Value::BlobString(b)
            | Value::SimpleError(b)
            | Value::BlobError(b)
            | Value::VerbatimString(b)
            | Value::BigNumber(b) => b.len(),
            Value::Array(items) | Value::Set(items) | Value::Push(items) => {
                items.iter().map(Message::approximate_size).sum()
            }
            Value::Map(pairs) => pairs
                .iter()
                .map(|(k, v)| k.approximate_size() + v.approximate_size())
                .sum(),
            _ => 0,
        };
        own + payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_str() {
        assert_eq!(Message::simple("OK").as_str().unwrap(), "OK");
        assert_eq!(Message::blob("test").as_str().unwrap(), "test");
        assert_eq!(
            Message::new(Value::VerbatimString(Bytes::from("txt:hello"))).as_str().unwrap(),
            "hello"
        );
        assert!(Message::null().as_str().unwrap_err().is_nil());
    }

    #[test]
    fn test_as_i64() {
        assert_eq!(Message::int(42).as_i64().unwrap(), 42);
        assert_eq!(Message::blob("123").as_i64().unwrap(), 123);
        assert!(Message::null().as_i64().is_err());
        assert!(Message::array(vec![]).as_i64().is_err());
    }

    #[test]
    fn test_server_error_surfaces_on_access() {
        let msg = Message::error_line("MOVED 3999 127.0.0.1:6381");
        assert!(msg.is_error());
        assert!(msg.as_str().unwrap_err().is_moved());
        assert!(msg.into_result().unwrap_err().is_moved());
        assert!(Message::simple("OK").into_result().is_ok());
    }

    #[test]
    fn test_as_map_accepts_flat_arrays() {
        let map = Message::map(vec![(Message::simple("version"), Message::blob("7.2.4"))]);
        assert_eq!(map.as_map().unwrap()["version"].as_str().unwrap(), "7.2.4");

        let flat = Message::array(vec![Message::blob("proto"), Message::int(3)]);
        assert_eq!(flat.as_map().unwrap()["proto"].as_i64().unwrap(), 3);
    }

    #[test]
    fn test_equality_ignores_cache_metadata() {
        let mut a = Message::blob("v");
        let b = Message::blob("v");
        a.mark_cache_hit();
        a.set_cache_expire_at(Some(Instant::now()));
        assert_eq!(a, b);
    }

    #[test]
    fn test_cache_ttl() {
        let mut msg = Message::blob("v");
        assert!(msg.cache_ttl().is_none());
        msg.set_cache_expire_at(Some(Instant::now() + Duration::from_secs(5)));
        let ttl = msg.cache_ttl().unwrap();
        assert!(ttl <= Duration::from_secs(5) && ttl > Duration::from_secs(4));
    }
}
