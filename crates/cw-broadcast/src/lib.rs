//! Subscriber fan-out
//!
//! A [`SubscriberSet`] holds one delivery endpoint per subscriber loop and
//! broadcasts every value to all of them.
//!
//! ## Delivery model
//!
//! Membership is guarded by a single read/write lock. `subscribe`,
//! `unsubscribe` and `close_all` take the write side; `send` takes the read
//! side and delivers to each endpoint in turn, awaiting each one, while the
//! lock is held. Every endpoint registered before `send` starts and not yet
//! removed receives the value exactly once before `send` returns.
//!
//! Each endpoint buffers a single value. A subscriber that stops draining its
//! endpoint while staying registered therefore stalls `send` for everyone,
//! including the caller of `send`, and also blocks membership changes until
//! it drains. Slow consumers are not isolated from each other.
//!
//! ## Ownership
//!
//! The set owns an endpoint while it is registered and ends the stream when it
//! removes it. After [`SubscriberSet::unsubscribe`] the receiving half yields
//! any value already buffered and then `None`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Identifies a registered endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving half of a registered endpoint.
pub struct Subscription<T> {
    id: SubscriberId,
    receiver: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next value. `None` once the endpoint has been removed from
    /// its set and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Concurrent set of delivery endpoints.
pub struct SubscriberSet<T> {
    next_id: AtomicU64,
    endpoints: RwLock<HashMap<SubscriberId, mpsc::Sender<T>>>,
}

impl<T> Default for SubscriberSet<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            endpoints: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone + Send> SubscriberSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new endpoint. The caller must keep draining it for as long
    /// as it stays registered.
    pub async fn subscribe(&self) -> Subscription<T> {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(1);

        let mut endpoints = self.endpoints.write().await;
        endpoints.insert(id, sender);
        record_size(endpoints.len());
        debug!("[{}] Subscribed ({} registered)", id, endpoints.len());

        Subscription { id, receiver }
    }

    /// Deliver `value` to every registered endpoint, one at a time.
    ///
    /// Returns the number of endpoints that accepted the value. Endpoints whose
    /// receiving half was dropped without unsubscribing are skipped.
    pub async fn send(&self, value: T) -> usize {
        let endpoints = self.endpoints.read().await;
        let mut delivered = 0;

        for (id, sender) in endpoints.iter() {
            if sender.send(value.clone()).await.is_ok() {
                delivered += 1;
            } else {
                debug!("[{}] Endpoint dropped without unsubscribing, skipped", id);
            }
        }

        debug!("Fan-out delivered to {}/{} endpoints", delivered, endpoints.len());
        delivered
    }

    /// Remove an endpoint and end its stream. Returns false if it was not
    /// registered.
    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut endpoints = self.endpoints.write().await;
        // Dropping the sender ends the stream.
        let removed = endpoints.remove(&id).is_some();
        record_size(endpoints.len());
        if removed {
            debug!("[{}] Unsubscribed ({} registered)", id, endpoints.len());
        }
        removed
    }

    /// Remove and end every endpoint. Used at process shutdown.
    pub async fn close_all(&self) -> usize {
        let mut endpoints = self.endpoints.write().await;
        let closed = endpoints.len();
        endpoints.clear();
        record_size(0);
        info!("Closed {} subscriber endpoints", closed);
        closed
    }

    pub async fn len(&self) -> usize {
        self.endpoints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn record_size(len: usize) {
    metrics::gauge!("chatwire_subscribers").set(len as f64);
}
