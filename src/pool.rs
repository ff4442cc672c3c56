//! Keyed cache of idle, reusable connections.
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;

use crate::reactor::Reactor;

/// Something the pool can evict.
pub trait Poolable {
    /// Half-closes the connection in both directions.
    fn shutdown(&mut self) -> io::Result<()>;

    /// Releases the connection. Dropping it is enough for most types.
    fn close(self)
    where
        Self: Sized,
    {
    }
}

/// Optional size limits of a [`SocketPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolLimits {
    /// Maximum number of idle connections across all destinations
    #[serde(default)]
    pub total_size: Option<usize>,
    /// Maximum number of idle connections per (host, port)
    #[serde(default)]
    pub destination_size: Option<usize>,
}

/// Where the request engine gets connections from and hands them back to.
#[async_trait(?Send)]
pub trait ConnectionPool<S> {
    async fn get_pooled_socket(&self, host: &str, port: u16) -> Option<S>;
    async fn put_socket_in_pool(&self, host: &str, port: u16, sock: S);
}

struct Idle<S> {
    sock: S,
    since: Instant,
    seq: u64,
}

struct PoolState<S> {
    idle: HashMap<(String, u16), VecDeque<Idle<S>>>,
    seq: u64,
}

impl<S> PoolState<S> {
    fn len(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum()
    }

    /// Removes the globally oldest entry.
    fn pop_oldest(&mut self) -> Option<S> {
        let key = self
            .idle
            .iter()
            .filter_map(|(key, queue)| queue.front().map(|idle| (idle.seq, key)))
            .min_by_key(|(seq, _)| *seq)
            .map(|(_, key)| key.clone())?;
        let queue = self.idle.get_mut(&key)?;
        let oldest = queue.pop_front().map(|idle| idle.sock);
        if queue.is_empty() {
            self.idle.remove(&key);
        }
        oldest
    }

    fn take_expired(&mut self, timeout: Duration) -> Vec<S> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for queue in self.idle.values_mut() {
            let (old, fresh): (VecDeque<_>, VecDeque<_>) = queue
                .drain(..)
                .partition(|idle| now.duration_since(idle.since) > timeout);
            *queue = fresh;
            expired.extend(old.into_iter().map(|idle| idle.sock));
        }
        self.idle.retain(|_, queue| !queue.is_empty());
        expired
    }
}

fn discard<S: Poolable>(mut sock: S) {
    if let Err(err) = sock.shutdown() {
        log::debug!("shutdown of evicted connection failed: {}", err);
    }
    sock.close();
}

/// FIFO pool of idle connections keyed by (host, port).
///
/// The oldest idle connection for a destination is handed out first.
/// Clones share the same pool.
pub struct SocketPool<S> {
    state: Rc<RefCell<PoolState<S>>>,
    limits: PoolLimits,
}

impl<S> Clone for SocketPool<S> {
    fn clone(&self) -> Self {
        SocketPool {
            state: self.state.clone(),
            limits: self.limits,
        }
    }
}

impl<S: Poolable + 'static> SocketPool<S> {
    pub fn new(limits: PoolLimits) -> Self {
        SocketPool {
            state: Rc::new(RefCell::new(PoolState {
                idle: HashMap::new(),
                seq: 0,
            })),
            limits,
        }
    }

    /// A pool that also closes connections left idle longer than
    /// `unused_timeout`, checked every `unused_timeout` on `reactor`.
    pub fn with_unused_timeout(reactor: &Reactor, limits: PoolLimits, unused_timeout: Duration) -> Self {
        let pool = Self::new(limits);
        schedule_sweep(reactor.clone(), Rc::downgrade(&pool.state), unused_timeout);
        pool
    }

    /// Takes the oldest idle connection for (host, port), if any.
    pub fn get(&self, host: &str, port: u16) -> Option<S> {
        let mut state = self.state.borrow_mut();
        let key = (host.to_owned(), port);
        let queue = state.idle.get_mut(&key)?;
        let idle = queue.pop_front();
        let drained = queue.is_empty();
        if drained {
            state.idle.remove(&key);
        }
        idle.map(|idle| idle.sock)
    }

    /// Adds an idle connection, then evicts what exceeds the destination
    /// limit (oldest of this destination first) and the total limit
    /// (globally oldest first).
    pub fn put(&self, host: &str, port: u16, sock: S) {
        let evicted = {
            let mut state = self.state.borrow_mut();
            state.seq += 1;
            let seq = state.seq;
            let queue = state.idle.entry((host.to_owned(), port)).or_default();
            queue.push_back(Idle {
                sock,
                since: Instant::now(),
                seq,
            });

            let mut evicted = Vec::new();
            if let Some(limit) = self.limits.destination_size {
                while queue.len() > limit {
                    match queue.pop_front() {
                        Some(idle) => evicted.push(idle.sock),
                        None => break,
                    }
                }
            }
            state.idle.retain(|_, queue| !queue.is_empty());
            if let Some(limit) = self.limits.total_size {
                while state.len() > limit {
                    match state.pop_oldest() {
                        Some(sock) => evicted.push(sock),
                        None => break,
                    }
                }
            }
            evicted
        };

        if !evicted.is_empty() {
            log::debug!("Evicting {} pooled connection(s)", evicted.len());
        }
        for sock in evicted {
            discard(sock);
        }
    }

    /// Number of idle connections held.
    pub fn len(&self) -> usize {
        self.state.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn schedule_sweep<S: Poolable + 'static>(reactor: Reactor, state: Weak<RefCell<PoolState<S>>>, timeout: Duration) {
    let next = reactor.clone();
    reactor.add_timer(timeout, move || {
        // Pool dropped: stop sweeping.
        let Some(pool) = state.upgrade() else {
            return Ok(());
        };
        let expired = pool.borrow_mut().take_expired(timeout);
        if !expired.is_empty() {
            log::debug!("Closing {} connection(s) idle for more than {:?}", expired.len(), timeout);
        }
        for sock in expired {
            discard(sock);
        }
        schedule_sweep(next, state, timeout);
        Ok(())
    });
}

#[async_trait(?Send)]
impl<S: Poolable + 'static> ConnectionPool<S> for SocketPool<S> {
    async fn get_pooled_socket(&self, host: &str, port: u16) -> Option<S> {
        self.get(host, port)
    }

    async fn put_socket_in_pool(&self, host: &str, port: u16, sock: S) {
        self.put(host, port, sock)
    }
}

/// A pool that never keeps anything: every connection handed back is closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptySocketPool;

#[async_trait(?Send)]
impl<S: Poolable + 'static> ConnectionPool<S> for EmptySocketPool {
    async fn get_pooled_socket(&self, _host: &str, _port: u16) -> Option<S> {
        None
    }

    async fn put_socket_in_pool(&self, _host: &str, _port: u16, sock: S) {
        discard(sock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Rc<RefCell<Vec<String>>>;

    #[derive(Debug)]
    struct MockSok {
        name: &'static str,
        log: Log,
    }

    impl Poolable for MockSok {
        fn shutdown(&mut self) -> io::Result<()> {
            self.log.borrow_mut().push(format!("shutdown {}", self.name));
            Ok(())
        }

        fn close(self) {
            self.log.borrow_mut().push(format!("close {}", self.name));
        }
    }

    fn sok(name: &'static str, log: &Log) -> MockSok {
        MockSok { name, log: log.clone() }
    }

    fn names(pool: &SocketPool<MockSok>, host: &str, port: u16) -> Vec<&'static str> {
        std::iter::from_fn(|| pool.get(host, port)).map(|s| s.name).collect()
    }

    #[test]
    fn test_get_from_empty_pool() {
        let pool: SocketPool<MockSok> = SocketPool::new(PoolLimits::default());
        assert!(pool.get("localhost", 80).is_none());
        assert!(pool.is_empty());
    }

    /// Idle connections come back oldest first, per destination.
    #[test]
    fn test_fifo_per_destination() {
        let log = Log::default();
        let pool = SocketPool::new(PoolLimits::default());
        pool.put("localhost", 80, sok("s1", &log));
        pool.put("localhost", 80, sok("s2", &log));
        pool.put("example.org", 80, sok("other", &log));
        pool.put("localhost", 80, sok("s3", &log));
        pool.put("localhost", 8080, sok("port", &log));
        assert_eq!(pool.len(), 5);

        assert_eq!(names(&pool, "localhost", 80), vec!["s1", "s2", "s3"]);
        assert_eq!(names(&pool, "localhost", 8080), vec!["port"]);
        assert_eq!(names(&pool, "example.org", 80), vec!["other"]);
        assert!(pool.is_empty());
        assert!(log.borrow().is_empty());
    }

    /// Exceeding the total limit shuts down and closes the globally oldest.
    #[test]
    fn test_total_size_limit() {
        let log = Log::default();
        let pool = SocketPool::new(PoolLimits {
            total_size: Some(2),
            destination_size: None,
        });
        pool.put("a", 1, sok("first", &log));
        pool.put("b", 1, sok("second", &log));
        pool.put("a", 1, sok("third", &log));

        assert_eq!(*log.borrow(), vec!["shutdown first", "close first"]);
        assert_eq!(pool.len(), 2);
        assert_eq!(names(&pool, "a", 1), vec!["third"]);
        assert_eq!(names(&pool, "b", 1), vec!["second"]);
    }

    #[test]
    fn test_destination_size_limit() {
        let log = Log::default();
        let pool = SocketPool::new(PoolLimits {
            total_size: None,
            destination_size: Some(2),
        });
        pool.put("a", 1, sok("a1", &log));
        pool.put("b", 1, sok("b1", &log));
        pool.put("a", 1, sok("a2", &log));
        pool.put("a", 1, sok("a3", &log));

        assert_eq!(*log.borrow(), vec!["shutdown a1", "close a1"]);
        assert_eq!(names(&pool, "a", 1), vec!["a2", "a3"]);
        assert_eq!(names(&pool, "b", 1), vec!["b1"]);
    }

    /// The destination limit applies before the total limit.
    #[test]
    fn test_both_limits() {
        let log = Log::default();
        let pool = SocketPool::new(PoolLimits {
            total_size: Some(3),
            destination_size: Some(2),
        });
        for (host, name) in [("a", "a1"), ("a", "a2"), ("b", "b1"), ("b", "b2"), ("a", "a3")] {
            pool.put(host, 1, sok(name, &log));
        }

        assert_eq!(
            *log.borrow(),
            vec!["shutdown a1", "close a1", "shutdown a2", "close a2"]
        );
        assert_eq!(names(&pool, "a", 1), vec!["a3"]);
        assert_eq!(names(&pool, "b", 1), vec!["b1", "b2"]);
    }

    #[test]
    fn test_limits_reject_unknown_keys() {
        let limits = config::Config::builder()
            .set_override("total_size", 2)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize::<PoolLimits>()
            .unwrap();
        assert_eq!(limits.total_size, Some(2));
        assert_eq!(limits.destination_size, None);

        let misspelled = config::Config::builder()
            .set_override("totalsize", 2)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize::<PoolLimits>();
        assert!(misspelled.is_err());
    }

    /// Idle entries older than the timeout are swept; checked-out ones are not.
    #[test]
    fn test_unused_timeout_sweep() {
        let reactor = Reactor::new().unwrap();
        let log = Log::default();
        let pool = SocketPool::with_unused_timeout(&reactor, PoolLimits::default(), Duration::from_millis(20));
        pool.put("a", 1, sok("taken", &log));
        pool.put("a", 1, sok("left", &log));
        pool.put("b", 1, sok("other", &log));
        let taken = pool.get("a", 1).unwrap();
        assert_eq!(taken.name, "taken");

        let started = Instant::now();
        while started.elapsed() < Duration::from_millis(70) {
            reactor.step().unwrap();
        }
        assert!(pool.is_empty());
        let log = log.borrow();
        assert!(log.contains(&"close left".to_owned()));
        assert!(log.contains(&"close other".to_owned()));
        assert!(!log.contains(&"close taken".to_owned()));
    }

    /// The sweep stops once the pool is gone.
    #[test]
    fn test_sweep_stops_with_pool() {
        let reactor = Reactor::new().unwrap();
        let pool: SocketPool<MockSok> =
            SocketPool::with_unused_timeout(&reactor, PoolLimits::default(), Duration::from_millis(1));
        drop(pool);
        while !reactor.is_idle() {
            reactor.step().unwrap();
        }
    }

    #[test]
    fn test_connection_pool_trait() {
        let log = Log::default();
        let pool = SocketPool::new(PoolLimits::default());
        futures::executor::block_on(async {
            pool.put_socket_in_pool("localhost", 80, sok("s1", &log)).await;
            let got = pool.get_pooled_socket("localhost", 80).await;
            assert_eq!(got.map(|s| s.name), Some("s1"));
        });

        let empty = EmptySocketPool;
        futures::executor::block_on(async {
            ConnectionPool::<MockSok>::put_socket_in_pool(&empty, "localhost", 80, sok("s2", &log)).await;
            let got = ConnectionPool::<MockSok>::get_pooled_socket(&empty, "localhost", 80).await;
            assert!(got.is_none());
        });
        assert_eq!(*log.borrow(), vec!["shutdown s2", "close s2"]);
    }
}
