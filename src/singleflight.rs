//! In-flight request joining.
//!
//! The first caller for a key spawns the work and registers a shared handle
//! before anything is awaited; later callers attach to that handle. The entry is
//! dropped by a guard inside the spawned task, so it goes away on success,
//! error or panic alike and the next caller starts fresh.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::debug;

type Flight<V> = Shared<BoxFuture<'static, Option<V>>>;

pub struct Singleflight<K, V> {
    calls: Arc<Mutex<HashMap<K, Flight<V>>>>,
}

impl<K, V> Clone for Singleflight<K, V> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<K, V> Default for Singleflight<K, V> {
    fn default() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Outcome of [`Singleflight::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlightResult<V> {
    /// `None` when the task panicked or the runtime shut it down.
    pub value: Option<V>,
    pub joined: bool,
}

struct EntryGuard<K: Eq + Hash, V> {
    calls: Arc<Mutex<HashMap<K, Flight<V>>>>,
    key: K,
}

impl<K: Eq + Hash, V> Drop for EntryGuard<K, V> {
    fn drop(&mut self) {
        self.calls.lock().remove(&self.key);
    }
}

impl<K, V> Singleflight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `make()` unless a call for `key` is already in flight, in which case
    /// its result is awaited instead. `make` is only invoked by the leader.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> FlightResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (flight, joined) = {
            let mut calls = self.calls.lock();
            match calls.get(&key) {
                Some(existing) => (existing.clone(), true),
                None => {
                    let work = make();
                    let guard = EntryGuard {
                        calls: Arc::clone(&self.calls),
                        key: key.clone(),
                    };
                    // The guard cannot take the lock before this one is released.
                    let handle = tokio::spawn(async move {
                        let _guard = guard;
                        work.await
                    });
                    let flight: Flight<V> = async move { handle.await.ok() }.boxed().shared();
                    calls.insert(key.clone(), flight.clone());
                    (flight, false)
                }
            }
        };
        if joined {
            debug!(?key, "joined in-flight call");
        }
        FlightResult {
            value: flight.await,
            joined,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.calls.lock().contains_key(key)
    }

    /// Forgets every pending handle. Running tasks still complete.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_share_one_execution() {
        let flights: Singleflight<String, u32> = Singleflight::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = flights.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run("k".to_string(), move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        7
                    })
                    .await
            }));
        }
        let mut joined = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result.value, Some(7));
            if result.joined {
                joined += 1;
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(joined, 7);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn entry_is_removed_after_failure_so_retry_runs() {
        let flights: Singleflight<&'static str, Result<u32, String>> = Singleflight::new();
        let first = flights.run("k", || async { Err("nope".to_string()) }).await;
        assert_eq!(first.value, Some(Err("nope".to_string())));
        assert!(!flights.is_in_flight(&"k"));
        let second = flights.run("k", || async { Ok(1) }).await;
        assert_eq!(second.value, Some(Ok(1)));
        assert!(!second.joined);
    }

    #[tokio::test]
    async fn panicking_work_yields_none_and_clears_entry() {
        let flights: Singleflight<u8, u8> = Singleflight::new();
        let result = flights
            .run(1, || async {
                if true {
                    panic!("boom");
                }
                0
            })
            .await;
        assert_eq!(result.value, None);
        assert_eq!(flights.in_flight(), 0);
    }
}
