//! Error types for Redis operations

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type for Redis operations
pub type RedisResult<T> = Result<T, RedisError>;

/// Comprehensive error type for Redis operations
///
/// Errors are cheap to clone: a connection latches its first error once and
/// hands the same value to every request still waiting on it.
#[derive(Error, Debug, Clone)]
pub enum RedisError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// Malformed frame, unknown type byte or out-of-order reply
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server replied with an error message (`-ERR ...`, `-NOSCRIPT ...`)
    #[error("{0}")]
    Server(String),

    /// MOVED redirect in cluster mode
    #[error("MOVED {slot} {host}:{port}")]
    Moved {
        /// Slot number that was moved
        slot: u16,
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// ASK redirect in cluster mode
    #[error("ASK {slot} {host}:{port}")]
    Ask {
        /// Slot number for temporary redirect
        slot: u16,
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// The reply was a RESP null
    #[error("redis nil message")]
    Nil,

    /// Dial or handshake failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// The connection or client was closed by the caller
    #[error("connection is closing")]
    Closing,

    /// The connection reached its configured lifetime and was recycled
    #[error("connection expired")]
    ConnExpired,

    /// The `MULTI`/`EXEC` used to populate the client-side cache was aborted
    #[error("client side cache aborted")]
    CacheAborted,

    /// The server refused client-side caching (`CLIENT TRACKING`)
    #[error("client side caching is not supported: {0}")]
    NoCache(String),

    /// No node currently owns the slot
    #[error("the slot has no redis node")]
    NoSlot,

    /// Commands addressing different slots were mixed where a single node is required
    #[error("cross slot commands are not allowed here")]
    CrossSlot,

    /// Every reply of a result stream has been consumed
    #[error("result stream has no more replies")]
    StreamDone,

    /// A dedicated client was used after it was released
    #[error("dedicated client has been released")]
    DedicatedRecycled,

    /// The command cannot be executed in the requested way
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Type conversion error
    #[error("Type conversion error: {0}")]
    Type(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Pool error
    #[error("Pool error: {0}")]
    Pool(String),
}

impl From<io::Error> for RedisError {
    fn from(err: io::Error) -> Self {
        RedisError::Io(Arc::new(err))
    }
}

impl RedisError {
    /// Build an error from a server error line, recognizing redirects.
    pub fn from_server(msg: &str) -> Self {
        Self::parse_redirect(msg).unwrap_or_else(|| RedisError::Server(msg.to_string()))
    }

    /// Parse a Redis error message to check for MOVED or ASK redirects
    pub fn parse_redirect(msg: &str) -> Option<Self> {
        // "MOVED 9916 10.90.6.213:6002" / "ASK 9916 10.90.6.213:6002"
        let (moved, rest) = if let Some(rest) = msg.strip_prefix("MOVED ") {
            (true, rest)
        } else if let Some(rest) = msg.strip_prefix("ASK ") {
            (false, rest)
        } else {
            return None;
        };

        let parts: Vec<&str> = rest.split_whitespace().collect();
        if parts.len() != 2 {
            return None;
        }
        let slot = parts[0].parse::<u16>().ok()?;
        let (host, port) = parts[1].rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

        Some(if moved {
            RedisError::Moved { slot, host, port }
        } else {
            RedisError::Ask { slot, host, port }
        })
    }

    /// Check if this error is a redirect (MOVED or ASK)
    pub fn is_redirect(&self) -> bool {
        matches!(self, RedisError::Moved { .. } | RedisError::Ask { .. })
    }

    /// Check if this is a MOVED redirect
    pub fn is_moved(&self) -> bool {
        matches!(self, RedisError::Moved { .. })
    }

    /// Check if this is an ASK redirect
    pub fn is_ask(&self) -> bool {
        matches!(self, RedisError::Ask { .. })
    }

    /// Get the target address from a redirect error
    pub fn redirect_target(&self) -> Option<(String, u16)> {
        match self {
            RedisError::Moved { host, port, .. } | RedisError::Ask { host, port, .. } => {
                Some((host.clone(), *port))
            }
            _ => None,
        }
    }

    /// Get the slot number from a redirect error
    pub fn redirect_slot(&self) -> Option<u16> {
        match self {
            RedisError::Moved { slot, .. } | RedisError::Ask { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    /// Redirect target formatted as a dialable `host:port` (IPv6 hosts are bracketed)
    pub fn redirect_addr(&self) -> Option<String> {
        self.redirect_target().map(|(host, port)| join_host_port(&host, port))
    }

    /// The reply was a RESP null
    pub fn is_nil(&self) -> bool {
        matches!(self, RedisError::Nil)
    }

    /// Whether the error was sent by the server (including redirects)
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            RedisError::Server(_) | RedisError::Moved { .. } | RedisError::Ask { .. }
        )
    }

    /// Whether the error came from the transport or client rather than a server reply
    pub fn is_transport(&self) -> bool {
        !self.is_server_error() && !self.is_nil()
    }

    fn server_prefix(&self, prefix: &str) -> bool {
        matches!(self, RedisError::Server(msg) if msg.starts_with(prefix))
    }

    /// `TRYAGAIN` during resharding
    pub fn is_try_again(&self) -> bool {
        self.server_prefix("TRYAGAIN")
    }

    /// `LOADING` while the dataset is being loaded
    pub fn is_loading(&self) -> bool {
        self.server_prefix("LOADING")
    }

    /// `CLUSTERDOWN`
    pub fn is_cluster_down(&self) -> bool {
        self.server_prefix("CLUSTERDOWN")
    }

    /// `NOSCRIPT`
    pub fn is_no_script(&self) -> bool {
        self.server_prefix("NOSCRIPT")
    }

    /// `BUSYGROUP`
    pub fn is_busy_group(&self) -> bool {
        self.server_prefix("BUSYGROUP")
    }
}

/// Join a host and port, bracketing bare IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Split `host:port`, accepting `[v6]:port`.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse().ok()?;
    Some((host.trim_start_matches('[').trim_end_matches(']'), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_moved_redirect() {
        let error = RedisError::parse_redirect("MOVED 9916 10.90.6.213:6002");

        if let Some(RedisError::Moved { slot, host, port }) = error {
            assert_eq!(slot, 9916);
            assert_eq!(host, "10.90.6.213");
            assert_eq!(port, 6002);
        } else {
            panic!("Expected MOVED error");
        }
    }

    #[test]
    fn test_parse_ask_redirect() {
        let error = RedisError::parse_redirect("ASK 1234 192.168.1.1:7000");

        if let Some(RedisError::Ask { slot, host, port }) = error {
            assert_eq!(slot, 1234);
            assert_eq!(host, "192.168.1.1");
            assert_eq!(port, 7000);
        } else {
            panic!("Expected ASK error");
        }
    }

    #[test]
    fn test_parse_ipv6_redirect() {
        let error = RedisError::parse_redirect("MOVED 1 ::1:7000").unwrap();
        assert_eq!(error.redirect_target(), Some(("::1".to_string(), 7000)));
        assert_eq!(error.redirect_addr().as_deref(), Some("[::1]:7000"));
    }

    #[test]
    fn test_parse_invalid_redirect() {
        assert!(RedisError::parse_redirect("ERR invalid").is_none());
        assert!(RedisError::parse_redirect("MOVED invalid").is_none());
        assert!(RedisError::parse_redirect("MOVED 1234").is_none());
    }

    #[test]
    fn test_from_server_classification() {
        assert!(RedisError::from_server("MOVED 500 10.0.0.2:6379").is_moved());
        assert!(RedisError::from_server("ASK 500 10.0.0.2:6379").is_ask());
        assert!(RedisError::from_server("TRYAGAIN Multiple keys request").is_try_again());
        assert!(RedisError::from_server("LOADING Redis is loading").is_loading());
        assert!(RedisError::from_server("CLUSTERDOWN The cluster is down").is_cluster_down());
        assert!(RedisError::from_server("NOSCRIPT No matching script").is_no_script());
        assert!(RedisError::from_server("BUSYGROUP Consumer Group name already exists").is_busy_group());

        let err = RedisError::from_server("ERR unknown command");
        assert!(err.is_server_error());
        assert!(!err.is_transport());
        assert_eq!(err.to_string(), "ERR unknown command");
    }

    #[test]
    fn test_transport_classification() {
        assert!(RedisError::Timeout.is_transport());
        assert!(RedisError::ConnExpired.is_transport());
        assert!(!RedisError::Nil.is_transport());
        assert!(RedisError::Nil.is_nil());
    }

    #[test]
    fn test_redirect_slot() {
        let moved = RedisError::Moved {
            slot: 9916,
            host: "10.90.6.213".to_string(),
            port: 6002,
        };
        assert_eq!(moved.redirect_slot(), Some(9916));
        assert_eq!(moved.redirect_addr().as_deref(), Some("10.90.6.213:6002"));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("127.0.0.1:6379"), Some(("127.0.0.1", 6379)));
        assert_eq!(split_host_port("[::1]:6379"), Some(("::1", 6379)));
        assert_eq!(split_host_port("nohost"), None);
    }
}
