//! Dedup - 有界の ID ウィンドウ
//!
//! 送信済み action と受信済み event の ID を、それぞれ直近 `capacity` 件だけ
//! 覚えておきます。溢れたら最も古く *挿入された* ID から忘れます（FIFO、
//! 参照では順序が変わらない）。忘れた ID は再び「未知」として扱われます。

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

use crate::domain::{ActionId, BackendEvent, EventId};

/// Bounded set of recently seen ids with strict insertion-order eviction.
#[derive(Debug, Clone)]
pub struct IdWindow<K> {
    capacity: usize,
    members: HashSet<K>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone> IdWindow<K> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            members: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Record `id`. Returns `false` if it was already present, in which case
    /// its position is left untouched.
    pub fn insert(&mut self, id: K) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.members.remove(&oldest);
        }
        self.members.insert(id.clone());
        self.order.push_back(id);
        true
    }

    pub fn contains(&self, id: &K) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.order.clear();
    }
}

/// How an inbound backend event relates to what this client has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// A change not seen before.
    Fresh,
    /// The backend echo of one of our own writes.
    Echo(ActionId),
    /// An event already applied (at-least-once redelivery).
    Duplicate,
}

/// Sent-action and received-event windows of one client.
#[derive(Debug, Clone)]
pub struct DedupWindows {
    sent: IdWindow<ActionId>,
    received: IdWindow<EventId>,
}

impl DedupWindows {
    pub fn new(capacity: usize) -> Self {
        Self {
            sent: IdWindow::new(capacity),
            received: IdWindow::new(capacity),
        }
    }

    pub fn mark_sent(&mut self, id: ActionId) -> bool {
        self.sent.insert(id)
    }

    pub fn has_sent(&self, id: ActionId) -> bool {
        self.sent.contains(&id)
    }

    pub fn mark_received(&mut self, id: EventId) -> bool {
        self.received.insert(id)
    }

    pub fn has_received(&self, id: EventId) -> bool {
        self.received.contains(&id)
    }

    /// Classify `event` without recording it.
    ///
    /// Redelivery wins over echo: an echo applied once is a duplicate the
    /// second time around.
    pub fn filter_received(&self, event: &BackendEvent) -> Inbound {
        if self.has_received(event.event_id) {
            return Inbound::Duplicate;
        }
        match event.action_id {
            Some(action_id) if self.has_sent(action_id) => Inbound::Echo(action_id),
            _ => Inbound::Fresh,
        }
    }

    pub fn sent_len(&self) -> usize {
        self.sent.len()
    }

    pub fn received_len(&self) -> usize {
        self.received.len()
    }

    /// Forget received event ids; sent ids stay so echoes still confirm.
    pub fn clear_received(&mut self) {
        self.received.clear();
    }
}
