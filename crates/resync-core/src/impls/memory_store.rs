//! InMemoryDocumentStore - 開発・テスト用の backend
//!
//! # 実装詳細
//! - path ごとに書き込み履歴と subscriber を保持
//! - write ごとに server timestamp を単調増加で払い出す
//! - 書き込みは書いた本人を含む全 subscriber に echo される
//! - `fail_next` / `set_failing` で障害を注入できる

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::domain::{
    BackendEvent, Category, DeliveryError, WriteAck, WriteRequest,
};
use crate::ports::{Disposer, DocumentStore, IdGenerator, Subscription, SystemClock, UlidGenerator};

/// One accepted write.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredWrite {
    pub request: WriteRequest,
    pub server_timestamp: u64,
}

#[derive(Default)]
struct StoreState {
    server_clock: u64,
    next_subscriber: u64,
    documents: HashMap<String, Vec<StoredWrite>>,
    subscribers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<BackendEvent>)>>,
    scripted_failures: VecDeque<DeliveryError>,
    failing: Option<DeliveryError>,
    attempts: usize,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreState {
    fn next_timestamp(&mut self) -> u64 {
        self.server_clock += 1;
        self.server_clock
    }

    fn fan_out(&mut self, path: &str, event: &BackendEvent) {
        if let Some(subs) = self.subscribers.get_mut(path) {
            // closed receivers are pruned on the way
            subs.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        }
    }
}

/// In-process document store with failure injection.
#[derive(Clone)]
pub struct InMemoryDocumentStore {
    state: Arc<Mutex<StoreState>>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    /// Mint event ids from `ids` instead of wall-clock ULIDs.
    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    /// Fail the next write with `error` (queued; one per call).
    pub fn fail_next(&self, error: DeliveryError) {
        self.state.lock().scripted_failures.push_back(error);
    }

    /// Fail every write with `error` until reset with `None`.
    pub fn set_failing(&self, error: Option<DeliveryError>) {
        self.state.lock().failing = error;
    }

    /// Publish a change made by another client.
    pub fn publish_remote(
        &self,
        path: &str,
        category: Category,
        payload: serde_json::Value,
    ) -> BackendEvent {
        let mut state = self.state.lock();
        let server_timestamp = state.next_timestamp();
        let event = BackendEvent {
            event_id: self.ids.generate_event_id(),
            action_id: None,
            path: path.to_string(),
            category,
            payload,
            server_timestamp,
        };
        state.fan_out(path, &event);
        event
    }

    /// Re-send an already published event (at-least-once delivery).
    pub fn redeliver(&self, event: &BackendEvent) {
        self.state.lock().fan_out(&event.path, event);
    }

    /// Accepted writes under `path`, oldest first.
    pub fn writes(&self, path: &str) -> Vec<StoredWrite> {
        self.state
            .lock()
            .documents
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of accepted writes across all paths.
    pub fn write_count(&self) -> usize {
        self.state.lock().documents.values().map(Vec::len).sum()
    }

    /// Number of write calls, failed ones included.
    pub fn attempt_count(&self) -> usize {
        self.state.lock().attempts
    }

    pub fn subscriber_count(&self, path: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .get(path)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn write(&self, path: &str, request: &WriteRequest) -> Result<WriteAck, DeliveryError> {
        let mut state = self.state.lock();
        state.attempts += 1;

        if let Some(error) = state.scripted_failures.pop_front() {
            return Err(error);
        }
        if let Some(error) = state.failing.clone() {
            return Err(error);
        }

        let server_timestamp = state.next_timestamp();
        state
            .documents
            .entry(path.to_string())
            .or_default()
            .push(StoredWrite {
                request: request.clone(),
                server_timestamp,
            });

        let event = BackendEvent {
            event_id: self.ids.generate_event_id(),
            action_id: Some(request.action_id),
            path: path.to_string(),
            category: request.category.clone(),
            payload: request.payload.clone(),
            server_timestamp,
        };
        state.fan_out(path, &event);

        Ok(WriteAck { server_timestamp })
    }

    fn subscribe(&self, path: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state.lock();
            state.next_subscriber += 1;
            let id = state.next_subscriber;
            state
                .subscribers
                .entry(path.to_string())
                .or_default()
                .push((id, tx));
            id
        };

        let state = Arc::clone(&self.state);
        let path = path.to_string();
        let disposer = Disposer::new(move || {
            let mut state = state.lock();
            if let Some(subs) = state.subscribers.get_mut(&path) {
                subs.retain(|(sub_id, _)| *sub_id != id);
            }
        });
        Subscription::new(rx, disposer)
    }
}
