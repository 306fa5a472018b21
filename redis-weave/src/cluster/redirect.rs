//! What to do with a reply from a cluster node

use crate::retry::is_retryable;
use redis_weave_core::{
    error::{RedisError, RedisResult},
    message::Message,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Redirect {
    None,
    /// The slot lives elsewhere now
    Moved(String),
    /// Ask once at another node while the slot migrates
    Ask(String),
    /// Transient failure, worth another attempt after a delay
    Retry,
}

impl Redirect {
    pub fn is_none(&self) -> bool {
        matches!(self, Redirect::None)
    }
}

/// The error a result carries, server replies included
pub(crate) fn error_of(result: &RedisResult<Message>) -> Option<RedisError> {
    match result {
        Ok(msg) => msg.error(),
        Err(err) => Some(err.clone()),
    }
}

pub(crate) fn classify_error(err: &RedisError) -> Redirect {
    match err {
        RedisError::Moved { .. } => err.redirect_addr().map_or(Redirect::None, Redirect::Moved),
        RedisError::Ask { .. } => err.redirect_addr().map_or(Redirect::None, Redirect::Ask),
        RedisError::ConnExpired => Redirect::None,
        _ if is_retryable(err) => Redirect::Retry,
        _ => Redirect::None,
    }
}

pub(crate) fn classify(result: &RedisResult<Message>) -> Redirect {
    error_of(result).map_or(Redirect::None, |err| classify_error(&err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let moved = Ok(Message::error_line("MOVED 500 10.0.0.2:6379"));
        assert_eq!(classify(&moved), Redirect::Moved("10.0.0.2:6379".into()));

        let ask = Ok(Message::error_line("ASK 500 ::1:7000"));
        assert_eq!(classify(&ask), Redirect::Ask("[::1]:7000".into()));

        let try_again = Ok(Message::error_line("TRYAGAIN Multiple keys request during rehashing of slot"));
        assert_eq!(classify(&try_again), Redirect::Retry);
        assert_eq!(classify(&Err(RedisError::Timeout)), Redirect::Retry);

        assert!(classify(&Ok(Message::simple("OK"))).is_none());
        assert!(classify(&Ok(Message::error_line("ERR syntax error"))).is_none());
        assert!(classify(&Err(RedisError::CacheAborted)).is_none());
        assert!(classify(&Err(RedisError::Closing)).is_none());
        assert!(classify(&Err(RedisError::Nil)).is_none());
    }
}
