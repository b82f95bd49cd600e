//! The in-memory LRU tier (spec §4.1).
//!
//! Nodes live in an arena (`Vec<Option<Node<K, V>>>`) addressed by `usize`
//! indices and linked into a doubly linked list, per the "Design Notes" (§9)
//! recommendation — this sidesteps the cyclic-ownership problems a naive
//! `Rc<RefCell<...>>` list would run into. The whole arena sits behind one
//! `parking_lot::Mutex`: every critical section here is pure, non-blocking
//! computation, so a plain mutex gives the same serialization an actor would
//! without the message-passing overhead (see DESIGN.md).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::metrics::Metrics;

struct Node<K, V> {
    key: K,
    value: V,
    cost: u64,
    expires_at: Option<Instant>,
    last_access: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner<K, V> {
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    total_cost: u64,
}

impl<K, V> Inner<K, V> {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            total_cost: 0,
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let n = self.nodes[idx].as_ref().unwrap();
            (n.prev, n.next)
        };
        match prev {
            Some(p) => self.nodes[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let n = self.nodes[idx].as_mut().unwrap();
            n.prev = None;
            n.next = old_head;
        }
        if let Some(h) = old_head {
            self.nodes[h].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn remove_node(&mut self, idx: usize) -> Node<K, V> {
        self.unlink(idx);
        let node = self.nodes[idx].take().unwrap();
        self.free.push(idx);
        node
    }

    fn alloc(&mut self, node: Node<K, V>) -> usize {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }
}

/// Configuration consumed directly by [`MemoryTier`] (a copy of the relevant
/// fields of [`crate::config::MemoryConfig`], so this module has no
/// dependency on the facade-level config type).
#[derive(Debug, Clone)]
pub struct MemoryTierConfig {
    pub count_limit: usize,
    pub cost_limit: u64,
    pub age_limit: Option<Duration>,
}

/// The bounded, TTL- and age-aware in-memory LRU tier.
pub struct MemoryTier<K, V> {
    inner: Mutex<Inner<K, V>>,
    config: parking_lot::RwLock<MemoryTierConfig>,
    metrics: Option<Arc<Metrics>>,
}

impl<K, V> MemoryTier<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(config: MemoryTierConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            config: parking_lot::RwLock::new(config),
            metrics: None,
        }
    }

    pub fn with_metrics(config: MemoryTierConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            config: parking_lot::RwLock::new(config),
            metrics: Some(metrics),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        match inner.index.get(key).copied() {
            None => false,
            Some(idx) => {
                let expired = matches!(
                    inner.nodes[idx].as_ref().unwrap().expires_at,
                    Some(t) if t <= Instant::now()
                );
                if expired {
                    inner.index.remove(key);
                    let node = inner.remove_node(idx);
                    inner.total_cost = inner.total_cost.saturating_sub(node.cost);
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Look up `key`. A hit refreshes `last_access` and moves the entry to
    /// the head of the LRU order (spec §4.1 `get`).
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let idx = *inner.index.get(key)?;
        let now = Instant::now();
        if matches!(inner.nodes[idx].as_ref().unwrap().expires_at, Some(t) if t <= now) {
            inner.index.remove(key);
            let node = inner.remove_node(idx);
            inner.total_cost = inner.total_cost.saturating_sub(node.cost);
            return None;
        }
        inner.nodes[idx].as_mut().unwrap().last_access = now;
        inner.move_to_front(idx);
        Some(inner.nodes[idx].as_ref().unwrap().value.clone())
    }

    /// Insert or replace `key` (spec §4.1 `put`), then trim.
    pub fn put(&self, key: K, value: V, cost: u64, ttl: Option<Duration>) {
        let now = Instant::now();
        let expires_at = ttl.map(|d| now + d);
        {
            let mut inner = self.inner.lock();
            if let Some(&idx) = inner.index.get(&key) {
                let old_cost = inner.nodes[idx].as_ref().unwrap().cost;
                inner.total_cost = inner.total_cost.saturating_sub(old_cost);
                {
                    let n = inner.nodes[idx].as_mut().unwrap();
                    n.value = value;
                    n.cost = cost;
                    n.expires_at = expires_at;
                    n.last_access = now;
                }
                inner.total_cost += cost;
                inner.move_to_front(idx);
            } else {
                let node = Node {
                    key: key.clone(),
                    value,
                    cost,
                    expires_at,
                    last_access: now,
                    prev: None,
                    next: None,
                };
                let idx = inner.alloc(node);
                inner.push_front(idx);
                inner.index.insert(key, idx);
                inner.total_cost += cost;
            }
        }
        self.trim_if_needed();
    }

    pub fn remove(&self, key: &K) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.index.remove(key) {
            let node = inner.remove_node(idx);
            inner.total_cost = inner.total_cost.saturating_sub(node.cost);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = Inner::new();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_cost(&self) -> u64 {
        self.inner.lock().total_cost
    }

    /// Replace the live configuration (used by tests exercising trim
    /// behavior without reconstructing the tier).
    pub fn set_config(&self, config: MemoryTierConfig) {
        *self.config.write() = config;
    }

    /// Runs the three trim passes in spec order: age, then count, then cost.
    pub fn trim_if_needed(&self) {
        let config = self.config.read().clone();
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let mut evicted = 0u64;

        if let Some(age_limit) = config.age_limit {
            loop {
                let Some(tail) = inner.tail else { break };
                let n = inner.nodes[tail].as_ref().unwrap();
                let aged_out = now.duration_since(n.last_access) >= age_limit;
                let expired = matches!(n.expires_at, Some(t) if t <= now);
                if !(aged_out || expired) {
                    break;
                }
                let key = n.key.clone();
                inner.index.remove(&key);
                let node = inner.remove_node(tail);
                inner.total_cost = inner.total_cost.saturating_sub(node.cost);
                evicted += 1;
            }
        }

        while inner.index.len() > config.count_limit {
            let Some(tail) = inner.tail else { break };
            let key = inner.nodes[tail].as_ref().unwrap().key.clone();
            inner.index.remove(&key);
            let node = inner.remove_node(tail);
            inner.total_cost = inner.total_cost.saturating_sub(node.cost);
            evicted += 1;
        }

        while inner.total_cost > config.cost_limit {
            let Some(tail) = inner.tail else { break };
            let key = inner.nodes[tail].as_ref().unwrap().key.clone();
            inner.index.remove(&key);
            let node = inner.remove_node(tail);
            inner.total_cost = inner.total_cost.saturating_sub(node.cost);
            evicted += 1;
        }

        if evicted > 0 {
            if let Some(metrics) = &self.metrics {
                metrics.record_trim(evicted, 0);
            }
        }
    }
}

impl<K, V> MemoryTier<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Spawns the background trimmer described in spec §4.1. Returns a
    /// handle that aborts the task on drop ([`TrimmerHandle`]); a running
    /// pass always completes before the task actually stops.
    pub fn spawn_background_trim(self: &Arc<Self>, interval: Duration) -> Option<TrimmerHandle> {
        if interval.is_zero() {
            return None;
        }
        let tier = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tier.trim_if_needed();
            }
        });
        Some(TrimmerHandle { handle })
    }
}

/// Owns the background trim task; aborts it on drop.
pub struct TrimmerHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TrimmerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
