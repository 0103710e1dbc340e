//! Session Synchronization Channel
//!
//! Merges the backend's native change feed (changes made by *other* views)
//! with local notifications (changes made by this view) into one signal.
//! Listeners get no payload; they re-read the store.

use crate::store::{StorageBackend, StorageChange, ViewId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

type Listener = Arc<dyn Fn() + Send + Sync>;

struct ChannelInner {
    view_id: ViewId,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
    /// Changes received from other views through the native feed
    foreign_seen: AtomicU64,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelInner {
    fn fire(&self) {
        // Snapshot so listeners may write to the store (and re-enter) freely
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        trace!(view = %self.view_id, listeners = listeners.len(), "Session sync event");
        for listener in listeners {
            listener();
        }
    }

    fn remove(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(listener_id, _)| *listener_id != id);
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(task) = self
            .forwarder
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

/// Per-view synchronization channel; clones share listeners
#[derive(Clone)]
pub struct SyncChannel {
    inner: Arc<ChannelInner>,
}

impl SyncChannel {
    /// Channel with local notifications only
    pub fn new(view_id: ViewId) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                view_id,
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                foreign_seen: AtomicU64::new(0),
                forwarder: Mutex::new(None),
            }),
        }
    }

    /// Channel that also forwards the backend's native change feed
    ///
    /// Forwarding runs on the current tokio runtime; outside a runtime the
    /// channel falls back to local notifications only.
    pub fn attach(view_id: ViewId, backend: &dyn StorageBackend) -> Self {
        let channel = Self::new(view_id);

        match backend.changes() {
            Some(changes) => channel.forward_native(changes),
            None => debug!(
                view = %view_id,
                backend = backend.name(),
                "Backend has no change feed; cross-view changes are seen on next read"
            ),
        }

        channel
    }

    fn forward_native(&self, mut changes: broadcast::Receiver<StorageChange>) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    view = %self.inner.view_id,
                    "No async runtime; cross-view session notifications disabled"
                );
                return;
            }
        };

        let weak: Weak<ChannelInner> = Arc::downgrade(&self.inner);
        let view_id = self.inner.view_id;

        let task = handle.spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        // The native feed never self-notifies
                        if change.origin == view_id {
                            continue;
                        }
                        let Some(inner) = weak.upgrade() else { break };
                        inner.foreign_seen.fetch_add(1, Ordering::SeqCst);
                        inner.fire();
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(view = %view_id, skipped, "Session change feed lagged");
                        let Some(inner) = weak.upgrade() else { break };
                        inner.foreign_seen.fetch_add(1, Ordering::SeqCst);
                        inner.fire();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        *self
            .inner
            .forwarder
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    pub fn view_id(&self) -> ViewId {
        self.inner.view_id
    }

    /// Register a listener; it stays registered until the subscription ends
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));

        Subscription {
            id,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Count of changes other views have made since this channel opened
    pub fn foreign_changes(&self) -> u64 {
        self.inner.foreign_seen.load(Ordering::SeqCst)
    }

    /// Signal a change made by this view
    pub fn notify_local(&self) {
        self.inner.fire();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Handle returned by [`SyncChannel::subscribe`]; dropping it unsubscribes
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    channel: Weak<ChannelInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn wait_for(count: &AtomicUsize, expected: usize) {
        for _ in 0..100 {
            if count.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_local_notify_reaches_all_subscribers() {
        let channel = SyncChannel::new(ViewId::new());
        let (first, on_first) = counter();
        let (second, on_second) = counter();
        let _a = channel.subscribe(on_first);
        let _b = channel.subscribe(on_second);

        channel.notify_local();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let channel = SyncChannel::new(ViewId::new());
        let (count, on_event) = counter();
        let subscription = channel.subscribe(on_event);

        channel.notify_local();
        subscription.unsubscribe();
        channel.notify_local();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_native_feed_skips_own_changes() {
        let backend = MemoryBackend::new();
        let this_view = ViewId::new();
        let other_view = ViewId::new();
        let channel = SyncChannel::attach(this_view, &backend);
        let (count, on_event) = counter();
        let _subscription = channel.subscribe(on_event);

        backend
            .set_many(this_view, &[("user", "{}".to_string())])
            .unwrap();
        backend
            .set_many(other_view, &[("user", "{}".to_string())])
            .unwrap();

        wait_for(&count, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attach_outside_runtime_degrades_to_local() {
        let backend = MemoryBackend::new();
        let channel = SyncChannel::attach(ViewId::new(), &backend);
        let (count, on_event) = counter();
        let _subscription = channel.subscribe(on_event);

        channel.notify_local();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
