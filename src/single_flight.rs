//! Deduplicates concurrent fetches for the same key (spec §4.3).
//!
//! Grounded on the connection-pool wait-list pattern in the teacher's
//! `database::connection` module: a shared slot that late arrivals await
//! instead of repeating the work, here specialized to a single pending
//! result per key rather than a pool permit.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{CacheError, CacheResult};

/// Runs at most one copy of `thunk` per key across concurrent callers.
pub struct SingleFlight<K, V> {
    inflight: Arc<Mutex<HashMap<K, broadcast::Sender<Result<V, String>>>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `thunk` for `key`, or joins an already-running call for the same
    /// key. Every joiner observes the same result. The leader's `thunk` runs
    /// on its own spawned task, decoupled from the caller's future, so a
    /// caller dropping its own `run_or_join` future never cancels the shared
    /// work (spec §5 "Cancellation of any individual caller does not cancel
    /// the shared work").
    pub async fn run_or_join<F>(&self, key: K, thunk: F) -> CacheResult<V>
    where
        F: Future<Output = CacheResult<V>> + Send + 'static,
    {
        let mut rx = {
            let mut guard = self.inflight.lock();
            match guard.get(&key) {
                Some(tx) => tx.subscribe(),
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    guard.insert(key.clone(), tx.clone());
                    drop(guard);
                    let inflight = Arc::clone(&self.inflight);
                    tokio::spawn(Self::lead(inflight, key, thunk, tx));
                    rx
                }
            }
        };

        match rx.recv().await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(msg)) => Err(CacheError::Store(msg)),
            Err(_) => Err(CacheError::Cancelled),
        }
    }

    async fn lead<F>(
        inflight: Arc<Mutex<HashMap<K, broadcast::Sender<Result<V, String>>>>>,
        key: K,
        thunk: F,
        tx: broadcast::Sender<Result<V, String>>,
    ) where
        F: Future<Output = CacheResult<V>> + Send + 'static,
    {
        let result = thunk.await;
        inflight.lock().remove(&key);
        let broadcastable = match &result {
            Ok(v) => Ok(v.clone()),
            Err(e) => Err(e.to_string()),
        };
        let _ = tx.send(broadcastable);
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_thunk_once_per_contention_group() {
        let sf: Arc<SingleFlight<String, i32>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let calls = Arc::clone(&calls);
            let sf = Arc::clone(&sf);
            handles.push(tokio::spawn(async move {
                sf.run_or_join("dupe".to_string(), async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(42)
                })
                .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_the_leaders_future_does_not_cancel_the_shared_work() {
        let sf: Arc<SingleFlight<String, i32>> = Arc::new(SingleFlight::new());
        let completed = Arc::new(AtomicUsize::new(0));

        let leader_completed = Arc::clone(&completed);
        let leader_sf = Arc::clone(&sf);
        let leader = tokio::spawn(async move {
            leader_sf
                .run_or_join("k".to_string(), async move {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    leader_completed.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
        });

        // give the leader a chance to register itself before a joiner subscribes
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let joiner_sf = Arc::clone(&sf);
        let joiner = tokio::spawn(async move { joiner_sf.run_or_join("k".to_string(), async { unreachable!() }).await });

        // cancel the leader's own future; the underlying thunk must keep running
        leader.abort();

        assert_eq!(joiner.await.unwrap().unwrap(), 7);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_calls_after_completion_run_again() {
        let sf: SingleFlight<String, i32> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            sf.run_or_join("k".to_string(), async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await
            .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
