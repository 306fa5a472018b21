//! Commands: a serialized argument vector plus routing metadata
//!
//! A [`Command`] is immutable once built. Cloning is cheap (the arguments
//! are shared), so the execution layer can resend the same command after a
//! redirect without copying.

use crate::error::{RedisError, RedisResult};
use bytes::Bytes;
use crc16::{State, XMODEM};
use std::sync::Arc;
use std::time::Duration;

/// Total number of hash slots in Redis Cluster
pub const CLUSTER_SLOTS: u16 = 16384;

/// Slot of a command that carries no key
pub const INIT_SLOT: u16 = 1 << 14;

/// Slot of a command whose keys hash to different slots
pub const NO_SLOT: u16 = 1 << 15;

const READONLY: u16 = 1;
const BLOCK: u16 = 1 << 1;
const NO_REPLY: u16 = 1 << 2;
const UNSUB: u16 = 1 << 3;

/// Calculate the hash slot for a given key
///
/// This implements the Redis Cluster key hashing algorithm:
/// - If the key contains {...}, only the part between the first { and first } is hashed
/// - Otherwise, the entire key is hashed
/// - The hash is CRC16 mod 16384
pub fn calculate_slot(key: &[u8]) -> u16 {
    let hash_key = extract_hash_tag(key);
    State::<XMODEM>::calculate(hash_key) % CLUSTER_SLOTS
}

/// Extract the hash tag from a key
///
/// `{user1000}.following` and `{user1000}.followers` hash to the same slot.
fn extract_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(end) = key[start + 1..].iter().position(|&b| b == b'}') {
            let end = start + 1 + end;
            // an empty tag hashes the whole key
            if end > start + 1 {
                return &key[start + 1..end];
            }
        }
    }
    key
}

const READONLY_COMMANDS: &[&str] = &[
    "BITCOUNT", "BITPOS", "DBSIZE", "DUMP", "ECHO", "EXISTS", "EXPIRETIME", "GEODIST",
    "GEOHASH", "GEOPOS", "GEOSEARCH", "GET", "GETBIT", "GETRANGE", "HEXISTS", "HGET",
    "HGETALL", "HKEYS", "HLEN", "HMGET", "HRANDFIELD", "HSCAN", "HSTRLEN", "HVALS", "KEYS",
    "LCS", "LINDEX", "LLEN", "LPOS", "LRANGE", "MGET", "OBJECT", "PEXPIRETIME", "PFCOUNT",
    "PING", "PTTL", "RANDOMKEY", "SCAN", "SCARD", "SDIFF", "SINTER", "SINTERCARD",
    "SISMEMBER", "SMEMBERS", "SMISMEMBER", "SRANDMEMBER", "SSCAN", "STRLEN", "SUBSTR",
    "SUNION", "TOUCH", "TTL", "TYPE", "XINFO", "XLEN", "XPENDING", "XRANGE", "XREAD",
    "XREVRANGE", "ZCARD", "ZCOUNT", "ZDIFF", "ZINTER", "ZINTERCARD", "ZLEXCOUNT", "ZMSCORE",
    "ZRANDMEMBER", "ZRANGE", "ZRANGEBYLEX", "ZRANGEBYSCORE", "ZRANK", "ZREVRANGE",
    "ZREVRANGEBYLEX", "ZREVRANGEBYSCORE", "ZREVRANK", "ZSCAN", "ZSCORE", "ZUNION",
];

const BLOCKING_COMMANDS: &[&str] = &[
    "BLMOVE", "BLMPOP", "BLPOP", "BRPOP", "BRPOPLPUSH", "BZMPOP", "BZPOPMAX", "BZPOPMIN",
    "WAIT", "WAITAOF",
];

const SUBSCRIBE_COMMANDS: &[&str] = &["SUBSCRIBE", "PSUBSCRIBE", "SSUBSCRIBE"];

const UNSUBSCRIBE_COMMANDS: &[&str] = &["UNSUBSCRIBE", "PUNSUBSCRIBE", "SUNSUBSCRIBE"];

fn flags_for(name: &str) -> u16 {
    let mut flags = 0;
    if READONLY_COMMANDS.contains(&name) {
        flags |= READONLY;
    }
    if BLOCKING_COMMANDS.contains(&name) {
        flags |= BLOCK;
    }
    if SUBSCRIBE_COMMANDS.contains(&name) {
        flags |= NO_REPLY;
    }
    if UNSUBSCRIBE_COMMANDS.contains(&name) {
        flags |= NO_REPLY | UNSUB;
    }
    flags
}

/// Conversion into one command argument.
pub trait ToArg {
    /// Encode as the bytes sent on the wire
    fn to_arg(self) -> Bytes;
}

impl ToArg for Bytes {
    fn to_arg(self) -> Bytes {
        self
    }
}

impl ToArg for &Bytes {
    fn to_arg(self) -> Bytes {
        self.clone()
    }
}

impl ToArg for &str {
    fn to_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl ToArg for &String {
    fn to_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for &[u8] {
    fn to_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

macro_rules! numeric_arg {
    ($($t:ty),*) => {
        $(impl ToArg for $t {
            fn to_arg(self) -> Bytes {
                Bytes::from(self.to_string())
            }
        })*
    };
}

numeric_arg!(i32, i64, u16, u32, u64, usize, f64);

/// A ready-to-send command
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    args: Arc<[Bytes]>,
    slot: u16,
    flags: u16,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let args: Vec<_> = self
            .args
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        f.debug_struct("Command")
            .field("args", &args)
            .field("slot", &self.slot)
            .finish()
    }
}

impl Command {
    /// Start building a command
    pub fn builder(name: impl ToArg) -> CommandBuilder {
        CommandBuilder::new(name.to_arg())
    }

    /// Build a keyless command from raw arguments, flags inferred from the name.
    pub fn from_args<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToArg,
    {
        let args: Vec<Bytes> = args.into_iter().map(ToArg::to_arg).collect();
        let flags = args
            .first()
            .map(|n| flags_for(&String::from_utf8_lossy(n).to_ascii_uppercase()))
            .unwrap_or(0);
        Self {
            args: args.into(),
            slot: INIT_SLOT,
            flags,
        }
    }

    /// Arguments including the command name
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// The command name as sent
    pub fn name(&self) -> &[u8] {
        self.args.first().map(|b| b.as_ref()).unwrap_or_default()
    }

    fn name_is(&self, name: &str) -> bool {
        self.name().eq_ignore_ascii_case(name.as_bytes())
    }

    /// Hash slot of the keys, [`INIT_SLOT`] when keyless, [`NO_SLOT`] when they disagree
    pub fn slot(&self) -> u16 {
        self.slot
    }

    /// Safe to serve from a replica and to retry
    pub fn is_readonly(&self) -> bool {
        self.flags & READONLY != 0
    }

    /// Blocks the connection server-side; never pipelined
    pub fn is_block(&self) -> bool {
        self.flags & BLOCK != 0
    }

    /// Answered by push confirmations instead of a regular reply
    pub fn is_no_reply(&self) -> bool {
        self.flags & NO_REPLY != 0
    }

    /// One of the unsubscribe commands
    pub fn is_unsub(&self) -> bool {
        self.flags & UNSUB != 0
    }

    /// A bare `MULTI`
    pub fn is_multi(&self) -> bool {
        self.args.len() == 1 && self.name_is("MULTI")
    }

    /// A bare `EXEC`
    pub fn is_exec(&self) -> bool {
        self.args.len() == 1 && self.name_is("EXEC")
    }
}

/// Incremental builder for [`Command`]
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    upper: String,
    args: Vec<Bytes>,
    slot: u16,
    flags: u16,
    first_key: Option<usize>,
}

impl CommandBuilder {
    fn new(name: Bytes) -> Self {
        let upper = String::from_utf8_lossy(&name).to_ascii_uppercase();
        let flags = flags_for(&upper);
        Self {
            upper,
            args: vec![name],
            slot: INIT_SLOT,
            flags,
            first_key: None,
        }
    }

    /// Append a plain argument
    #[must_use]
    pub fn arg(mut self, arg: impl ToArg) -> Self {
        let arg = arg.to_arg();
        if (self.upper == "XREAD" || self.upper == "XREADGROUP")
            && arg.eq_ignore_ascii_case(b"BLOCK")
        {
            self.flags |= BLOCK;
        }
        self.args.push(arg);
        self
    }

    /// Append several plain arguments
    #[must_use]
    pub fn args<I, T>(self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToArg,
    {
        args.into_iter().fold(self, |b, a| b.arg(a))
    }

    /// Append a key; keys decide the slot of the command
    #[must_use]
    pub fn key(mut self, key: impl ToArg) -> Self {
        let key = key.to_arg();
        let slot = calculate_slot(&key);
        self.slot = match self.slot {
            INIT_SLOT => slot,
            current if current == slot => slot,
            _ => NO_SLOT,
        };
        if self.first_key.is_none() {
            self.first_key = Some(self.args.len());
        }
        self.args.push(key);
        self
    }

    /// Append several keys
    #[must_use]
    pub fn keys<I, T>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToArg,
    {
        keys.into_iter().fold(self, |b, k| b.key(k))
    }

    /// Mark as read-only regardless of the command table
    #[must_use]
    pub fn readonly(mut self) -> Self {
        self.flags |= READONLY;
        self
    }

    /// Mark as blocking regardless of the command table
    #[must_use]
    pub fn blocking(mut self) -> Self {
        self.flags |= BLOCK;
        self
    }

    /// Finish the command
    pub fn build(self) -> Command {
        Command {
            args: self.args.into(),
            slot: self.slot,
            flags: self.flags,
        }
    }

    /// Finish a command that may be served from the client-side cache.
    ///
    /// # Errors
    ///
    /// The command must be read-only, carry at least one key and not block.
    pub fn build_cacheable(self) -> RedisResult<Cacheable> {
        let key_index = self.first_key.ok_or_else(|| {
            RedisError::InvalidCommand(format!("{} has no key to cache under", self.upper))
        })?;
        if self.flags & READONLY == 0 || self.flags & BLOCK != 0 {
            return Err(RedisError::InvalidCommand(format!(
                "{} is not a cacheable read",
                self.upper
            )));
        }
        let key = self.args[key_index].clone();
        let mut signature = Vec::with_capacity(self.upper.len() + 16);
        signature.extend_from_slice(self.upper.as_bytes());
        for (i, arg) in self.args.iter().enumerate().skip(1) {
            if i != key_index {
                signature.push(b' ');
                signature.extend_from_slice(arg);
            }
        }
        Ok(Cacheable {
            key,
            signature: Bytes::from(signature),
            cmd: self.build(),
        })
    }
}

/// A read that may be served from the client-side cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cacheable {
    cmd: Command,
    key: Bytes,
    signature: Bytes,
}

impl Cacheable {
    /// The underlying command
    pub fn command(&self) -> &Command {
        &self.cmd
    }

    /// Redis key the entry is tracked under
    pub fn cache_key(&self) -> &Bytes {
        &self.key
    }

    /// Command name plus non-key arguments
    pub fn signature(&self) -> &Bytes {
        &self.signature
    }

    /// Slot of the cached key
    pub fn slot(&self) -> u16 {
        self.cmd.slot()
    }
}

impl From<Cacheable> for Command {
    fn from(c: Cacheable) -> Self {
        c.cmd
    }
}

/// A cacheable command paired with its client-side TTL
#[derive(Debug, Clone)]
pub struct CacheableTtl {
    /// The cached read
    pub cmd: Cacheable,
    /// Longest time the reply may be served locally
    pub ttl: Duration,
}

impl CacheableTtl {
    /// Pair a command with a TTL
    pub fn new(cmd: Cacheable, ttl: Duration) -> Self {
        Self { cmd, ttl }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_slot() {
        assert!(calculate_slot(b"mykey") < CLUSTER_SLOTS);
        assert_eq!(
            calculate_slot(b"{user1000}.following"),
            calculate_slot(b"{user1000}.followers")
        );
        // known CRC16 value for this key
        assert_eq!(calculate_slot(b"123456789"), 12739);
    }

    #[test]
    fn test_extract_hash_tag() {
        assert_eq!(extract_hash_tag(b"key"), b"key");
        assert_eq!(extract_hash_tag(b"{user}key"), b"user");
        assert_eq!(extract_hash_tag(b"prefix{user}key"), b"user");
        assert_eq!(extract_hash_tag(b"{}"), b"{}");
        assert_eq!(extract_hash_tag(b"no{hash"), b"no{hash");
    }

    #[test]
    fn test_builder_flags_and_slot() {
        let get = Command::builder("GET").key("foo").build();
        assert!(get.is_readonly());
        assert!(!get.is_block());
        assert_eq!(get.slot(), calculate_slot(b"foo"));

        let set = Command::builder("SET").key("foo").arg("bar").build();
        assert!(!set.is_readonly());
        assert_eq!(set.args().len(), 3);

        let blpop = Command::builder("BLPOP").key("q").arg(0).build();
        assert!(blpop.is_block());

        let xread = Command::builder("XREAD").arg("BLOCK").arg(100).arg("STREAMS").key("s").arg("$").build();
        assert!(xread.is_block());
        assert!(xread.is_readonly());
    }

    #[test]
    fn test_cross_slot_keys() {
        let same = Command::builder("MGET").key("{a}1").key("{a}2").build();
        assert_eq!(same.slot(), calculate_slot(b"a"));

        let cross = Command::builder("MGET").key("a").key("b").build();
        assert_eq!(cross.slot(), NO_SLOT);
    }

    #[test]
    fn test_pubsub_flags() {
        let sub = Command::builder("SUBSCRIBE").arg("ch").build();
        assert!(sub.is_no_reply());
        assert!(!sub.is_unsub());
        let unsub = Command::from_args(["unsubscribe"]);
        assert!(unsub.is_no_reply());
        assert!(unsub.is_unsub());
        assert_eq!(unsub.slot(), INIT_SLOT);
    }

    #[test]
    fn test_multi_exec_detection() {
        assert!(Command::from_args(["MULTI"]).is_multi());
        assert!(Command::from_args(["exec"]).is_exec());
        assert!(!Command::from_args(["EXEC", "x"]).is_exec());
    }

    #[test]
    fn test_cacheable_key_and_signature() {
        let c = Command::builder("HGET").key("h").arg("f").build_cacheable().unwrap();
        assert_eq!(c.cache_key().as_ref(), b"h");
        assert_eq!(c.signature().as_ref(), b"HGET f");

        let get = Command::builder("GET").key("foo").build_cacheable().unwrap();
        assert_eq!(get.signature().as_ref(), b"GET");

        assert!(Command::builder("SET").key("k").arg("v").build_cacheable().is_err());
        assert!(Command::builder("PING").build_cacheable().is_err());
    }
}
