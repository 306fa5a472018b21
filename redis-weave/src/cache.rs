//! Client-side cache store
//!
//! Entries are keyed by the Redis key and the command signature, so `GET k`
//! and `STRLEN k` are cached separately but invalidated together. A miss
//! leaves a pending entry behind; concurrent readers of the same entry wait
//! for the single fetch in flight instead of issuing their own.

use bytes::Bytes;
use parking_lot::Mutex;
use redis_weave_core::{
    error::{RedisError, RedisResult},
    message::Message,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;

type Slot = Option<RedisResult<Message>>;

/// Outcome of [`CacheStore::flight`]
pub(crate) enum Flight {
    /// A fresh cached copy
    Hit(Message),
    /// Another caller is fetching this entry
    Wait(CacheWaiter),
    /// The caller must fetch and then `update` or `cancel`
    Miss,
}

/// Handle on a fetch started by another caller
pub(crate) struct CacheWaiter {
    rx: watch::Receiver<Slot>,
}

impl CacheWaiter {
    pub async fn wait(mut self) -> RedisResult<Message> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone().unwrap_or(Err(RedisError::CacheAborted)),
            Err(_) => Err(RedisError::CacheAborted),
        }
    }
}

/// Storage behind `execute_cached`; one instance per connection
pub(crate) trait CacheStore: Send + Sync {
    /// Look up an entry, registering a pending fetch on a miss
    fn flight(&self, key: &Bytes, sig: &Bytes, ttl: Duration, now: Instant) -> Flight;

    /// Store a fetched reply and wake its waiters; returns the clamped expiry
    fn update(&self, key: &Bytes, sig: &Bytes, msg: Message) -> Option<Instant>;

    /// Abandon a pending fetch, waking waiters with `err`
    fn cancel(&self, key: &Bytes, sig: &Bytes, err: RedisError);

    /// Invalidate the given keys, or everything when `None`
    fn delete(&self, keys: Option<&[Bytes]>);

    /// Drop everything and fail pending fetches
    fn close(&self, err: RedisError);
}

const NIL: usize = usize::MAX;

enum EntryState {
    Free,
    Pending {
        tx: watch::Sender<Slot>,
        deadline: Instant,
        stale: bool,
    },
    Ready {
        msg: Message,
        expire_at: Instant,
    },
}

struct Node {
    key: Bytes,
    sig: Bytes,
    state: EntryState,
    size: usize,
    prev: usize,
    next: usize,
}

struct LruInner {
    nodes: Vec<Node>,
    free: Vec<usize>,
    index: HashMap<Bytes, HashMap<Bytes, usize>>,
    /// Most recently used ready entry
    head: usize,
    /// Least recently used ready entry
    tail: usize,
    size: usize,
    closed: Option<RedisError>,
}

impl LruInner {
    fn alloc(&mut self, key: Bytes, sig: Bytes, state: EntryState) -> usize {
        let node = Node {
            key,
            sig,
            state,
            size: 0,
            prev: NIL,
            next: NIL,
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn lookup(&self, key: &Bytes, sig: &Bytes) -> Option<usize> {
        self.index.get(key).and_then(|sigs| sigs.get(sig)).copied()
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else if self.head == idx {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else if self.tail == idx {
            self.tail = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    /// Remove a node entirely; returns its former state
    fn remove(&mut self, idx: usize) -> EntryState {
        if matches!(self.nodes[idx].state, EntryState::Ready { .. }) {
            self.unlink(idx);
            self.size -= self.nodes[idx].size;
        }
        let node = &mut self.nodes[idx];
        let state = std::mem::replace(&mut node.state, EntryState::Free);
        let key = std::mem::take(&mut node.key);
        let sig = std::mem::take(&mut node.sig);
        node.size = 0;
        if let Some(sigs) = self.index.get_mut(&key) {
            sigs.remove(&sig);
            if sigs.is_empty() {
                self.index.remove(&key);
            }
        }
        self.free.push(idx);
        state
    }

    /// Drop ready entries, mark pending ones stale
    fn invalidate(&mut self, idx: usize) {
        match &mut self.nodes[idx].state {
            EntryState::Pending { stale, .. } => *stale = true,
            EntryState::Ready { .. } => {
                self.remove(idx);
            }
            EntryState::Free => {}
        }
    }

    fn evict(&mut self, budget: usize) {
        while self.size > budget && self.tail != NIL {
            let idx = self.tail;
            self.remove(idx);
        }
    }
}

/// Least-recently-used store bounded by an approximate byte budget
pub(crate) struct LruCache {
    budget: usize,
    inner: Mutex<LruInner>,
}

impl LruCache {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            inner: Mutex::new(LruInner {
                nodes: Vec::new(),
                free: Vec::new(),
                index: HashMap::new(),
                head: NIL,
                tail: NIL,
                size: 0,
                closed: None,
            }),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.index.values().map(HashMap::len).sum()
    }
}

impl CacheStore for LruCache {
    fn flight(&self, key: &Bytes, sig: &Bytes, ttl: Duration, now: Instant) -> Flight {
        let mut inner = self.inner.lock();
        if inner.closed.is_some() {
            return Flight::Miss;
        }
        if let Some(idx) = inner.lookup(key, sig) {
            let hit = match &inner.nodes[idx].state {
                EntryState::Ready { msg, expire_at } if now < *expire_at => {
                    let mut hit = msg.clone();
                    hit.set_cache_expire_at(Some(*expire_at));
                    hit.mark_cache_hit();
                    Some(hit)
                }
                EntryState::Pending { tx, .. } => {
                    return Flight::Wait(CacheWaiter { rx: tx.subscribe() });
                }
                _ => None,
            };
            match hit {
                Some(hit) => {
                    inner.unlink(idx);
                    inner.push_front(idx);
                    return Flight::Hit(hit);
                }
                None => {
                    inner.remove(idx);
                }
            }
        }

        let (tx, _) = watch::channel(None);
        let idx = inner.alloc(
            key.clone(),
            sig.clone(),
            EntryState::Pending {
                tx,
                deadline: now + ttl,
                stale: false,
            },
        );
        inner
            .index
            .entry(key.clone())
            .or_default()
            .insert(sig.clone(), idx);
        Flight::Miss
    }

    fn update(&self, key: &Bytes, sig: &Bytes, mut msg: Message) -> Option<Instant> {
        let mut inner = self.inner.lock();
        let idx = inner.lookup(key, sig)?;
        let (deadline, stale) = match &inner.nodes[idx].state {
            EntryState::Pending {
                deadline, stale, ..
            } => (*deadline, *stale),
            _ => return None,
        };
        let expire_at = match msg.cache_expire_at() {
            Some(server) => server.min(deadline),
            None => deadline,
        };
        msg.set_cache_expire_at(Some(expire_at));

        let mut shared = msg.clone();
        shared.mark_cache_hit();
        if let EntryState::Pending { tx, .. } = &inner.nodes[idx].state {
            tx.send_replace(Some(Ok(shared)));
        }

        if stale {
            inner.remove(idx);
        } else {
            let size = key.len() + sig.len() + msg.approximate_size();
            inner.nodes[idx].state = EntryState::Ready { msg, expire_at };
            inner.nodes[idx].size = size;
            inner.size += size;
            inner.push_front(idx);
            inner.evict(self.budget);
        }
        Some(expire_at)
    }

    fn cancel(&self, key: &Bytes, sig: &Bytes, err: RedisError) {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.lookup(key, sig) else {
            return;
        };
        if matches!(inner.nodes[idx].state, EntryState::Pending { .. }) {
            if let EntryState::Pending { tx, .. } = inner.remove(idx) {
                tx.send_replace(Some(Err(err)));
            }
        }
    }

    fn delete(&self, keys: Option<&[Bytes]>) {
        let mut inner = self.inner.lock();
        let targets: Vec<usize> = match keys {
            None => inner
                .index
                .values()
                .flat_map(|sigs| sigs.values().copied())
                .collect(),
            Some(keys) => keys
                .iter()
                .filter_map(|k| inner.index.get(k))
                .flat_map(|sigs| sigs.values().copied())
                .collect(),
        };
        for idx in targets {
            inner.invalidate(idx);
        }
    }

    fn close(&self, err: RedisError) {
        let mut inner = self.inner.lock();
        inner.closed = Some(err.clone());
        for node in inner.nodes.drain(..) {
            if let EntryState::Pending { tx, .. } = node.state {
                tx.send_replace(Some(Err(err.clone())));
            }
        }
        inner.free.clear();
        inner.index.clear();
        inner.head = NIL;
        inner.tail = NIL;
        inner.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    fn fill(cache: &LruCache, k: &'static str, value: &'static str, now: Instant) -> Option<Instant> {
        assert!(matches!(
            cache.flight(&key(k), &key("GET"), Duration::from_secs(10), now),
            Flight::Miss
        ));
        cache.update(&key(k), &key("GET"), Message::blob(value))
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = LruCache::new(1 << 20);
        let now = Instant::now();
        fill(&cache, "foo", "bar", now);

        match cache.flight(&key("foo"), &key("GET"), Duration::from_secs(10), now) {
            Flight::Hit(msg) => {
                assert_eq!(msg.as_str().unwrap(), "bar");
                assert!(msg.is_cache_hit());
            }
            _ => panic!("expected a hit"),
        }
        assert!(matches!(
            cache.flight(&key("foo"), &key("STRLEN"), Duration::from_secs(10), now),
            Flight::Miss
        ));
    }

    #[test]
    fn test_expiry_boundary_is_a_miss() {
        let cache = LruCache::new(1 << 20);
        let now = Instant::now();
        let expire_at = fill(&cache, "foo", "bar", now).unwrap();
        assert_eq!(expire_at, now + Duration::from_secs(10));

        assert!(matches!(
            cache.flight(&key("foo"), &key("GET"), Duration::from_secs(10), expire_at),
            Flight::Miss
        ));
    }

    #[test]
    fn test_server_ttl_clamps_client_ttl() {
        let cache = LruCache::new(1 << 20);
        let now = Instant::now();
        assert!(matches!(
            cache.flight(&key("foo"), &key("GET"), Duration::from_secs(10), now),
            Flight::Miss
        ));
        let mut msg = Message::blob("bar");
        msg.set_cache_expire_at(Some(now + Duration::from_secs(3)));
        let expire_at = cache.update(&key("foo"), &key("GET"), msg).unwrap();
        assert_eq!(expire_at, now + Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_single_flight() {
        let cache = LruCache::new(1 << 20);
        let now = Instant::now();
        assert!(matches!(
            cache.flight(&key("bar"), &key("GET"), Duration::from_secs(10), now),
            Flight::Miss
        ));
        let waiter = match cache.flight(&key("bar"), &key("GET"), Duration::from_secs(10), now) {
            Flight::Wait(w) => w,
            _ => panic!("expected to wait on the first fetch"),
        };
        cache.update(&key("bar"), &key("GET"), Message::blob("v"));
        assert_eq!(waiter.wait().await.unwrap().as_str().unwrap(), "v");
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let cache = LruCache::new(1 << 20);
        let now = Instant::now();
        cache.flight(&key("k"), &key("GET"), Duration::from_secs(1), now);
        let Flight::Wait(waiter) = cache.flight(&key("k"), &key("GET"), Duration::from_secs(1), now) else {
            panic!("expected a pending entry");
        };
        cache.cancel(&key("k"), &key("GET"), RedisError::CacheAborted);
        assert!(matches!(waiter.wait().await, Err(RedisError::CacheAborted)));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let cache = LruCache::new(1 << 20);
        let now = Instant::now();
        fill(&cache, "a", "1", now);
        fill(&cache, "b", "2", now);

        cache.delete(Some(&[key("a")]));
        cache.delete(Some(&[key("a")]));
        cache.delete(Some(&[key("missing")]));
        assert_eq!(cache.len(), 1);

        cache.delete(None);
        cache.delete(None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_invalidated_pending_entry_is_not_stored() {
        let cache = LruCache::new(1 << 20);
        let now = Instant::now();
        cache.flight(&key("k"), &key("GET"), Duration::from_secs(10), now);
        let Flight::Wait(waiter) = cache.flight(&key("k"), &key("GET"), Duration::from_secs(10), now) else {
            panic!("expected a pending entry");
        };
        cache.delete(Some(&[key("k")]));
        assert!(cache.update(&key("k"), &key("GET"), Message::blob("old")).is_some());

        assert_eq!(waiter.wait().await.unwrap().as_str().unwrap(), "old");
        assert!(matches!(
            cache.flight(&key("k"), &key("GET"), Duration::from_secs(10), now),
            Flight::Miss
        ));
    }

    #[test]
    fn test_eviction_keeps_recent_entries() {
        let one = key("k").len() + key("GET").len() + Message::blob("v").approximate_size();
        let cache = LruCache::new(one * 2);
        let now = Instant::now();
        fill(&cache, "a", "v", now);
        fill(&cache, "b", "v", now);
        // touch "a" so "b" is the least recently used
        assert!(matches!(
            cache.flight(&key("a"), &key("GET"), Duration::from_secs(10), now),
            Flight::Hit(_)
        ));
        fill(&cache, "c", "v", now);

        assert_eq!(cache.len(), 2);
        assert!(matches!(
            cache.flight(&key("b"), &key("GET"), Duration::from_secs(10), now),
            Flight::Miss
        ));
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let cache = LruCache::new(1 << 20);
        let now = Instant::now();
        cache.flight(&key("k"), &key("GET"), Duration::from_secs(10), now);
        let Flight::Wait(waiter) = cache.flight(&key("k"), &key("GET"), Duration::from_secs(10), now) else {
            panic!("expected a pending entry");
        };
        cache.close(RedisError::CacheAborted);
        assert!(matches!(waiter.wait().await, Err(RedisError::CacheAborted)));
        assert!(matches!(
            cache.flight(&key("k"), &key("GET"), Duration::from_secs(10), now),
            Flight::Miss
        ));
    }
}
