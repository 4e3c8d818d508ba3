use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

/// What changed in the flag cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// A full snapshot replaced the cache contents.
    Replaced { count: usize },
    Updated { key: String, version: u64 },
    Deleted { key: String, version: u64 },
    /// The cache was emptied on stop.
    Cleared,
}

/// Event delivered to subscribers after a mutation commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind) -> Self {
        Self {
            kind,
            at: Utc::now(),
        }
    }

    /// The flag key this event is about, for single-key changes.
    pub fn key(&self) -> Option<&str> {
        match &self.kind {
            ChangeKind::Updated { key, .. } | ChangeKind::Deleted { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Token returned by [`ChangeNotifier::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Fan-out of cache change events to registered handlers.
///
/// Handlers run on the task that committed the change, after the registry
/// lock is released, so a handler may subscribe or unsubscribe. Subscribers
/// only see events committed after they subscribed.
#[derive(Default)]
pub struct ChangeNotifier {
    handlers: Mutex<BTreeMap<SubscriptionId, Handler>>,
    next_id: AtomicU64,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        handler: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(handler));
        id
    }

    /// Returns `false` if the id was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn unsubscribe_all(&self) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn notify(&self, event: ChangeEvent) {
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for handler in handlers {
            handler(&event);
        }
    }
}
