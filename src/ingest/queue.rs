//! Bounded ingestion queue with explicit backpressure
//!
//! Producers push normalized signals; a single consumer pulls them in batches.
//! The queue never grows past its capacity: when full it either refuses the
//! new item or evicts the oldest one, per [`BackpressurePolicy`].

use crate::config::BackpressurePolicy;
use crate::error::{RelinkError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::warn;

/// Result of a successful push
#[derive(Debug, PartialEq)]
pub enum Enqueued<T> {
    Accepted,
    /// Accepted after evicting the oldest queued item
    Evicted(T),
}

/// Bounded FIFO drained by a pull-based consumer
pub struct IngestQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: BackpressurePolicy,
    notify: Notify,
    rejected: AtomicU64,
    evicted: AtomicU64,
}

impl<T> IngestQueue<T> {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            policy,
            notify: Notify::new(),
            rejected: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Enqueue an item, applying the backpressure policy when full
    pub async fn push(&self, item: T) -> Result<Enqueued<T>> {
        let mut items = self.items.lock().await;

        let outcome = if items.len() >= self.capacity {
            match self.policy {
                BackpressurePolicy::Reject => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(RelinkError::Backpressure {
                        capacity: self.capacity,
                    });
                }
                BackpressurePolicy::DropOldest => match items.pop_front() {
                    Some(oldest) => {
                        self.evicted.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "Ingestion queue full ({}), dropped oldest entry",
                            self.capacity
                        );
                        Enqueued::Evicted(oldest)
                    }
                    None => Enqueued::Accepted,
                },
            }
        } else {
            Enqueued::Accepted
        };

        items.push_back(item);
        drop(items);
        self.notify.notify_one();
        Ok(outcome)
    }

    /// Take everything currently queued without waiting
    pub async fn drain(&self) -> Vec<T> {
        let mut items = self.items.lock().await;
        items.drain(..).collect()
    }

    /// Take up to `max` items without waiting
    pub async fn drain_up_to(&self, max: usize) -> Vec<T> {
        let mut items = self.items.lock().await;
        let n = max.min(items.len());
        items.drain(..n).collect()
    }

    /// Wait up to `timeout` for at least one item, then drain
    ///
    /// Returns an empty batch on timeout instead of blocking forever.
    pub async fn recv_batch(&self, timeout: Duration) -> Vec<T> {
        let notified = self.notify.notified();
        {
            let mut items = self.items.lock().await;
            if !items.is_empty() {
                return items.drain(..).collect();
            }
        }

        if tokio::time::timeout(timeout, notified).await.is_err() {
            return Vec::new();
        }
        self.drain().await
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    /// Items refused because the queue was full
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Items evicted to make room
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}
