//! Listeners - 呼び出し側のコールバック登録
//!
//! callback はロックの外で呼ぶので、callback の中から coordinator を
//! 触っても（再登録・解除しても）デッドロックしません。

use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::{ActionId, BackendEvent, DropReason, WriteAck};
use crate::ports::Disposer;

type AppliedFn = Arc<dyn Fn(&BackendEvent) + Send + Sync>;
type DroppedFn = Arc<dyn Fn(ActionId, &DropReason) + Send + Sync>;
type DeliveredFn = Arc<dyn Fn(ActionId, WriteAck) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    applied: Vec<(u64, AppliedFn)>,
    dropped: Vec<(u64, DroppedFn)>,
    delivered: Vec<(u64, DeliveredFn)>,
}

impl Registry {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove(&mut self, id: u64) {
        self.applied.retain(|(i, _)| *i != id);
        self.dropped.retain(|(i, _)| *i != id);
        self.delivered.retain(|(i, _)| *i != id);
    }
}

/// Keeps a listener registered; dropping it unregisters.
#[must_use = "the listener is removed when the handle is dropped"]
#[derive(Debug)]
pub struct ListenerHandle {
    disposer: Disposer,
}

impl ListenerHandle {
    pub fn dispose(self) {
        self.disposer.dispose();
    }
}

#[derive(Clone, Default)]
pub(crate) struct Listeners {
    registry: Arc<Mutex<Registry>>,
}

impl Listeners {
    fn handle(&self, id: u64) -> ListenerHandle {
        let registry = Arc::downgrade(&self.registry);
        ListenerHandle {
            disposer: Disposer::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.lock().remove(id);
                }
            }),
        }
    }

    pub(crate) fn on_applied(
        &self,
        f: impl Fn(&BackendEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.allocate();
            registry.applied.push((id, Arc::new(f)));
            id
        };
        self.handle(id)
    }

    pub(crate) fn on_dropped(
        &self,
        f: impl Fn(ActionId, &DropReason) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.allocate();
            registry.dropped.push((id, Arc::new(f)));
            id
        };
        self.handle(id)
    }

    pub(crate) fn on_delivered(
        &self,
        f: impl Fn(ActionId, WriteAck) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.allocate();
            registry.delivered.push((id, Arc::new(f)));
            id
        };
        self.handle(id)
    }

    pub(crate) fn applied(&self, event: &BackendEvent) {
        let listeners: Vec<AppliedFn> = self
            .registry
            .lock()
            .applied
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for f in listeners {
            f(event);
        }
    }

    pub(crate) fn dropped(&self, action_id: ActionId, reason: &DropReason) {
        let listeners: Vec<DroppedFn> = self
            .registry
            .lock()
            .dropped
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for f in listeners {
            f(action_id, reason);
        }
    }

    pub(crate) fn delivered(&self, action_id: ActionId, ack: WriteAck) {
        let listeners: Vec<DeliveredFn> = self
            .registry
            .lock()
            .delivered
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for f in listeners {
            f(action_id, ack);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ulid::Ulid;

    #[test]
    fn disposed_listener_is_not_called() {
        let listeners = Listeners::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        let handle = listeners.on_dropped(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let id = ActionId::from_ulid(Ulid::new());
        listeners.dropped(id, &DropReason::MaxRetriesExceeded);
        handle.dispose();
        listeners.dropped(id, &DropReason::MaxRetriesExceeded);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_register_from_inside_a_callback() {
        let listeners = Listeners::default();
        let inner = listeners.clone();
        let nested = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::clone(&nested);

        let _handle = listeners.on_delivered(move |_, _| {
            slot.lock().push(inner.on_delivered(|_, _| {}));
        });

        listeners.delivered(ActionId::from_ulid(Ulid::new()), WriteAck { server_timestamp: 1 });
        assert_eq!(nested.lock().len(), 1);
    }
}
