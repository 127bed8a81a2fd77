//! Channel plumbing for state and log streams.
//!
//! Every stream is a pair of bounded channels, one for items and one for
//! errors, plus a shared [`CancellationToken`]. Producers never block on a
//! receiver that went away: every send races against cancellation.

pub mod logtail;

use crate::error::Error;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::hash::Hash;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

pub use logtail::{follow, LogTail};

/// Capacity of the item channel of a stream.
pub const STREAM_CAPACITY: usize = 64;

/// Capacity of the error channel of a stream.
pub const ERROR_CAPACITY: usize = 4;

/// Send `item` unless `cancel` fires first.
///
/// Returns false if the stream was cancelled or the receiver is gone.
pub async fn send_or_cancel<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        res = tx.send(item) => res.is_ok(),
    }
}

/// Receiving half of a stream.
#[derive(Debug)]
pub struct Subscription<T> {
    /// Items in production order.
    pub events: mpsc::Receiver<T>,
    /// Errors; [`Error::Cancelled`] and [`Error::EndOfStream`] are not failures.
    pub errors: mpsc::Receiver<Error>,
}

/// Producing half of a stream.
#[derive(Debug, Clone)]
pub struct Publisher<T> {
    events: mpsc::Sender<T>,
    errors: mpsc::Sender<Error>,
    cancel: CancellationToken,
}

/// Create a stream bound to `cancel`.
pub fn subscription<T>(cancel: CancellationToken) -> (Publisher<T>, Subscription<T>) {
    let (events_tx, events_rx) = mpsc::channel(STREAM_CAPACITY);
    let (errors_tx, errors_rx) = mpsc::channel(ERROR_CAPACITY);
    (
        Publisher {
            events: events_tx,
            errors: errors_tx,
            cancel,
        },
        Subscription {
            events: events_rx,
            errors: errors_rx,
        },
    )
}

impl<T> Publisher<T> {
    /// Emit an item. Returns false once the stream should stop.
    pub async fn send(&self, item: T) -> bool {
        send_or_cancel(&self.events, item, &self.cancel).await
    }

    /// Emit an error. Returns false once the stream should stop.
    pub async fn fail(&self, err: Error) -> bool {
        send_or_cancel(&self.errors, err, &self.cancel).await
    }

    /// Record that the stream ended because its caller cancelled it.
    ///
    /// Never blocks; dropped if the error channel is full.
    pub fn cancelled(&self) {
        let _ = self.errors.try_send(Error::Cancelled);
    }

    /// Cancellation token shared with the caller.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the caller cancelled the stream or dropped the receiver.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.events.is_closed()
    }

    /// Resolves once the item receiver has been dropped.
    pub async fn closed(&self) {
        self.events.closed().await
    }
}

/// A set of in-flight observations keyed by identity.
///
/// Like a wait group, but callers can ask whether a given key is already
/// being observed, so a second watcher for the same machine is not spawned.
#[derive(Debug)]
pub struct WatchGroup<K> {
    active: Mutex<HashSet<K>>,
    idle: Notify,
}

impl<K: Eq + Hash + Clone> Default for WatchGroup<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> WatchGroup<K> {
    /// Create an empty group.
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashSet::new()),
            idle: Notify::new(),
        }
    }

    /// Track `key`. Returns false if it was already tracked.
    pub fn add(&self, key: K) -> bool {
        self.active.lock().insert(key)
    }

    /// Stop tracking `key`, waking waiters once the group is empty.
    pub fn done(&self, key: &K) {
        let empty = {
            let mut active = self.active.lock();
            active.remove(key);
            active.is_empty()
        };
        if empty {
            self.idle.notify_waiters();
        }
    }

    /// Whether `key` is tracked.
    pub fn contains(&self, key: &K) -> bool {
        self.active.lock().contains(key)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }

    /// Wait until no key is tracked.
    pub async fn wait(&self) {
        loop {
            let notified = self.idle.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
