//! Broadcast + history event fan-out.

use std::{
    collections::VecDeque,
    sync::{Arc, PoisonError, RwLock},
};

use futures::{StreamExt, stream::BoxStream};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

/// Synchronous event observer.
///
/// Called on whichever context pushes into the hub. Hubs owned by the
/// broker are only pushed from the controlling context.
pub trait Observer<T>: Send + Sync {
    fn notify(&self, event: &T);
}

impl<T, F> Observer<T> for F
where
    F: Fn(&T) + Send + Sync,
{
    fn notify(&self, event: &T) {
        self(event);
    }
}

/// Handle for removing a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Inner<T> {
    history: VecDeque<T>,
    observers: Vec<(SubscriptionId, Arc<dyn Observer<T>>)>,
    next_subscription: u64,
}

/// Event hub with observers, broadcast and bounded history.
///
/// Events reach observers and live receivers in push order. Late
/// subscribers can replay history and then switch to live updates.
pub struct EventHub<T> {
    inner: RwLock<Inner<T>>,
    sender: broadcast::Sender<T>,
    history_limit: usize,
}

impl<T> EventHub<T>
where
    T: Clone + Send + 'static,
{
    /// Create a hub with the given broadcast capacity and history length.
    #[must_use]
    pub fn new(capacity: usize, history_limit: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(history_limit.min(32)),
                observers: Vec::new(),
                next_subscription: 0,
            }),
            sender,
            history_limit,
        }
    }

    /// Publish an event to observers, live receivers and history.
    pub fn push(&self, event: T) {
        let observers: Vec<Arc<dyn Observer<T>>> = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            if self.history_limit > 0 {
                while inner.history.len() >= self.history_limit {
                    inner.history.pop_front();
                }
                inner.history.push_back(event.clone());
            }
            let _ = self.sender.send(event.clone()); // live listeners
            inner.observers.iter().map(|(_, o)| Arc::clone(o)).collect()
        };

        // Observers run outside the lock so they may (un)subscribe.
        for observer in observers {
            observer.notify(&event);
        }
    }

    /// Register a synchronous observer.
    pub fn subscribe(&self, observer: impl Observer<T> + 'static) -> SubscriptionId {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let id = SubscriptionId(inner.next_subscription);
        inner.next_subscription += 1;
        inner.observers.push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = inner.observers.len();
        inner.observers.retain(|(existing, _)| *existing != id);
        inner.observers.len() != before
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .observers
            .len()
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn get_history(&self) -> Vec<T> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Stream that yields history first, then live updates.
    ///
    /// Lagging receivers skip the missed events.
    #[must_use]
    pub fn history_plus_stream(&self) -> BoxStream<'static, T> {
        let (history, rx) = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let history: Vec<T> = inner.history.iter().cloned().collect();
            (history, self.sender.subscribe())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                    None
                }
            }
        });

        Box::pin(hist.chain(live))
    }
}
