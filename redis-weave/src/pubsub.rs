//! Pub/Sub message types and the per-connection subscriber registry
//!
//! A connection keeps one [`Subs`] registry for each subscription kind
//! (channels, patterns and shard channels). The reader task fans published
//! messages out to local subscribers through unbounded channels, so a slow
//! consumer never stalls reply parsing for unrelated commands.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A message published to a channel
///
/// Channels and payloads are binary safe and kept exactly as the server
/// sent them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// The pattern that matched, for `PSUBSCRIBE` deliveries
    pub pattern: Option<Bytes>,
    /// The channel the message was published to
    pub channel: Bytes,
    /// The message payload
    pub message: Bytes,
}

impl PubSubMessage {
    /// The channel as UTF-8, if it is valid
    pub fn channel_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.channel).ok()
    }

    /// The payload as UTF-8, if it is valid
    pub fn message_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.message).ok()
    }
}

/// A subscribe or unsubscribe confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubSubscription {
    /// `subscribe`, `psubscribe`, `ssubscribe` or their `un` forms
    pub kind: String,
    /// The channel or pattern
    pub channel: Bytes,
    /// Number of subscriptions the connection holds afterwards
    pub count: i64,
}

/// Callback invoked for each published message
pub type MessageHook = Arc<dyn Fn(PubSubMessage) + Send + Sync>;

/// Callback invoked for each subscription change
pub type SubscriptionHook = Arc<dyn Fn(PubSubSubscription) + Send + Sync>;

/// Connection-wide pub/sub callbacks
///
/// Hooks see every message and confirmation on the connection they are
/// installed on, independently of any [`receive`](crate::Client::receive)
/// call.
#[derive(Clone, Default)]
pub struct PubSubHooks {
    /// Called with every published message
    pub on_message: Option<MessageHook>,
    /// Called with every subscribe and unsubscribe confirmation
    pub on_subscription: Option<SubscriptionHook>,
}

impl PubSubHooks {
    /// Hooks with only a message callback
    pub fn on_message(f: impl Fn(PubSubMessage) + Send + Sync + 'static) -> Self {
        Self {
            on_message: Some(Arc::new(f)),
            on_subscription: None,
        }
    }

    /// Add a subscription callback
    #[must_use]
    pub fn with_on_subscription(
        mut self,
        f: impl Fn(PubSubSubscription) + Send + Sync + 'static,
    ) -> Self {
        self.on_subscription = Some(Arc::new(f));
        self
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.on_message.is_none() && self.on_subscription.is_none()
    }
}

impl fmt::Debug for PubSubHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubHooks")
            .field("on_message", &self.on_message.is_some())
            .field("on_subscription", &self.on_subscription.is_some())
            .finish()
    }
}

struct Subscriber {
    tx: mpsc::UnboundedSender<PubSubMessage>,
    hook: Option<SubscriptionHook>,
    channels: HashSet<Bytes>,
}

#[derive(Default)]
struct SubsInner {
    channels: HashMap<Bytes, HashSet<u64>>,
    subscribers: HashMap<u64, Subscriber>,
    next_id: u64,
    closed: bool,
}

impl SubsInner {
    fn remove(&mut self, id: u64) {
        if let Some(sub) = self.subscribers.remove(&id) {
            for channel in sub.channels {
                if let Some(ids) = self.channels.get_mut(&channel) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        self.channels.remove(&channel);
                    }
                }
            }
        }
    }
}

/// Local subscribers of one subscription kind
#[derive(Default)]
pub(crate) struct Subs {
    inner: Mutex<SubsInner>,
}

/// Registration returned by [`Subs::subscribe`]; removes itself on drop
pub(crate) struct Subscription<'a> {
    subs: &'a Subs,
    id: u64,
    pub rx: mpsc::UnboundedReceiver<PubSubMessage>,
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        self.subs.inner.lock().remove(self.id);
    }
}

impl Subs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for `channels`; `None` once the registry is closed
    pub fn subscribe(
        &self,
        channels: impl IntoIterator<Item = Bytes>,
        hook: Option<SubscriptionHook>,
    ) -> Option<Subscription<'_>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        let id = inner.next_id;
        inner.next_id += 1;

        let channels: HashSet<Bytes> = channels.into_iter().collect();
        for channel in &channels {
            inner.channels.entry(channel.clone()).or_default().insert(id);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscribers.insert(id, Subscriber { tx, hook, channels });
        Some(Subscription { subs: self, id, rx })
    }

    /// Deliver a message to every subscriber of `channel` without blocking
    pub fn publish(&self, channel: &[u8], msg: &PubSubMessage) {
        let inner = self.inner.lock();
        if let Some(ids) = inner.channels.get(channel) {
            for id in ids {
                if let Some(sub) = inner.subscribers.get(id) {
                    let _ = sub.tx.send(msg.clone());
                }
            }
        }
    }

    /// Report a subscribe confirmation to the channel's subscribers
    pub fn confirm(&self, s: &PubSubSubscription) {
        for hook in self.hooks_for(&s.channel) {
            hook(s.clone());
        }
    }

    /// Drop `s.channel` from every subscriber; a subscriber left with no
    /// channels is removed, which ends its receive loop
    pub fn unsubscribe(&self, s: &PubSubSubscription) {
        let hooks = self.hooks_for(&s.channel);
        for hook in hooks {
            hook(s.clone());
        }

        let mut inner = self.inner.lock();
        let Some(ids) = inner.channels.remove(&s.channel[..]) else {
            return;
        };
        for id in ids {
            let empty = match inner.subscribers.get_mut(&id) {
                Some(sub) => {
                    sub.channels.remove(&s.channel[..]);
                    sub.channels.is_empty()
                }
                None => false,
            };
            if empty {
                inner.subscribers.remove(&id);
            }
        }
    }

    /// Drop every subscriber and refuse new ones
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.channels.clear();
        inner.subscribers.clear();
    }

    // hooks run outside the lock so they may call back into the registry
    fn hooks_for(&self, channel: &[u8]) -> Vec<SubscriptionHook> {
        let inner = self.inner.lock();
        inner
            .channels
            .get(channel)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.subscribers.get(id))
            .filter_map(|sub| sub.hook.clone())
            .collect()
    }
}
