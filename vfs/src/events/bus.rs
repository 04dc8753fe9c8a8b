use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use super::FileEvent;

/// Receives every applied batch of events, once before and once after the
/// batch is applied to the tree.
pub trait BulkFileListener: Send + Sync {
    fn before(&self, events: &[FileEvent]) {
        let _ = events;
    }

    fn after(&self, events: &[FileEvent]);
}

/// Fans event batches out to the subscribed listeners, in subscription order.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn BulkFileListener>>>,
}

impl EventBus {
    pub fn subscribe(&self, listener: Arc<dyn BulkFileListener>) {
        self.listeners.write().push(listener);
    }

    pub fn unsubscribe(&self, listener: &Arc<dyn BulkFileListener>) {
        self.listeners
            .write()
            .retain(|l| !std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(listener)));
    }

    // listeners are snapshotted so they may subscribe further listeners
    fn snapshot(&self) -> Vec<Arc<dyn BulkFileListener>> {
        self.listeners.read().clone()
    }

    pub fn publish_before(&self, events: &[FileEvent]) {
        trace!(events = events.len(), "before");
        for listener in self.snapshot() {
            listener.before(events);
        }
    }

    pub fn publish_after(&self, events: &[FileEvent]) {
        trace!(events = events.len(), "after");
        for listener in self.snapshot() {
            listener.after(events);
        }
    }
}
