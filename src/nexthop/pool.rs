//! Bounded pool of learned client endpoints
//!
//! Maps a correspondent's overlay address to the UDP endpoint its packets
//! last arrived from. The pool is an LRU of fixed capacity so that a flood of
//! spoofed or short-lived sources cannot grow memory without bound. Entries
//! idle for longer than the optional idle timeout are treated as absent.
//!
//! # Example
//!
//! ```
//! use std::net::Ipv4Addr;
//! use overlay_router::nexthop::ClientPool;
//!
//! let pool = ClientPool::new(2);
//! pool.learn(Ipv4Addr::new(7, 0, 0, 1), "192.0.2.1:4000".parse().unwrap());
//! assert!(pool.get(Ipv4Addr::new(7, 0, 0, 1)).is_some());
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Default number of learned clients kept per pool
pub const DEFAULT_CLIENT_POOL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct PoolEntry {
    endpoint: SocketAddr,
    last_seen: Instant,
}

/// Outcome of [`ClientPool::learn`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Learned {
    /// Address was not in the pool
    New,
    /// Address moved to a different endpoint
    Moved(SocketAddr),
    /// Same endpoint as before; recency refreshed
    Refreshed,
}

/// Bounded LRU of overlay address -> last observed endpoint
#[derive(Debug)]
pub struct ClientPool {
    inner: Mutex<LruCache<Ipv4Addr, PoolEntry>>,
    idle_timeout: Option<Duration>,
}

impl ClientPool {
    /// Create a pool holding at most `capacity` entries (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            idle_timeout: None,
        }
    }

    /// Treat entries not refreshed within `timeout` as absent
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    fn is_stale(&self, entry: &PoolEntry, now: Instant) -> bool {
        self.idle_timeout
            .is_some_and(|timeout| now.saturating_duration_since(entry.last_seen) > timeout)
    }

    /// Record that `addr` was seen behind `endpoint`.
    ///
    /// Inserting a new address into a full pool evicts the least recently
    /// used entry.
    pub fn learn(&self, addr: Ipv4Addr, endpoint: SocketAddr) -> Learned {
        let entry = PoolEntry {
            endpoint,
            last_seen: Instant::now(),
        };
        let mut inner = self.inner.lock();
        match inner.push(addr, entry) {
            Some((old_addr, old)) if old_addr == addr => {
                if old.endpoint == endpoint {
                    Learned::Refreshed
                } else {
                    Learned::Moved(old.endpoint)
                }
            }
            Some((evicted, old)) => {
                debug!(
                    evicted = %evicted,
                    endpoint = %old.endpoint,
                    "client pool full, evicted LRU entry"
                );
                Learned::New
            }
            None => Learned::New,
        }
    }

    /// Look up `addr`, marking it most recently used.
    ///
    /// A stale entry is removed and reported as absent.
    pub fn get(&self, addr: Ipv4Addr) -> Option<SocketAddr> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let entry = *inner.get(&addr)?;
        if self.is_stale(&entry, now) {
            inner.pop(&addr);
            debug!(addr = %addr, "dropped stale client entry");
            return None;
        }
        Some(entry.endpoint)
    }

    /// Look up `addr` without touching recency
    pub fn peek(&self, addr: Ipv4Addr) -> Option<SocketAddr> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .peek(&addr)
            .filter(|entry| !self.is_stale(entry, now))
            .map(|entry| entry.endpoint)
    }

    /// Forget `addr`
    pub fn remove(&self, addr: Ipv4Addr) -> Option<SocketAddr> {
        self.inner.lock().pop(&addr).map(|entry| entry.endpoint)
    }

    /// Number of entries, stale ones included until touched
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True if the pool holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Maximum number of entries
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_POOL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, 1], port))
    }

    fn vip(n: u32) -> Ipv4Addr {
        Ipv4Addr::from(0x0700_0000 + n)
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let n = 8;
        let pool = ClientPool::new(n);
        for i in 0..n as u32 {
            pool.learn(vip(i), endpoint(i as u16));
        }
        // Touch the oldest so the second-oldest becomes LRU
        assert!(pool.get(vip(0)).is_some());

        pool.learn(vip(100), endpoint(100));

        assert_eq!(pool.len(), n);
        assert!(pool.peek(vip(1)).is_none());
        assert!(pool.peek(vip(0)).is_some());
        assert!(pool.peek(vip(100)).is_some());
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(ClientPool::default().capacity(), DEFAULT_CLIENT_POOL_CAPACITY);
        assert_eq!(ClientPool::new(0).capacity(), 1);
    }

    #[test]
    fn test_learn_reports_movement() {
        let pool = ClientPool::new(4);
        assert_eq!(pool.learn(vip(1), endpoint(1)), Learned::New);
        assert_eq!(pool.learn(vip(1), endpoint(1)), Learned::Refreshed);
        assert_eq!(pool.learn(vip(1), endpoint(2)), Learned::Moved(endpoint(1)));
        assert_eq!(pool.get(vip(1)), Some(endpoint(2)));
    }

    #[test]
    fn test_peek_does_not_touch_recency() {
        let pool = ClientPool::new(2);
        pool.learn(vip(1), endpoint(1));
        pool.learn(vip(2), endpoint(2));
        assert!(pool.peek(vip(1)).is_some());

        pool.learn(vip(3), endpoint(3));
        assert!(pool.peek(vip(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entries_expire() {
        let pool = ClientPool::new(4).with_idle_timeout(Duration::from_secs(60));
        pool.learn(vip(1), endpoint(1));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(pool.get(vip(1)), Some(endpoint(1)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(pool.peek(vip(1)), None);
        assert_eq!(pool.get(vip(1)), None);
        assert!(pool.is_empty());
    }
}
