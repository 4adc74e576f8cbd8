//! DocumentStore port - リアルタイム backend の抽象化
//!
//! backend の内部実装には立ち入らず、write / subscribe と
//! server-assigned timestamp だけを前提にします。

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{BackendEvent, DeliveryError, WriteAck, WriteRequest};

/// Remote real-time document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Write one action. The ack carries the server-assigned timestamp.
    async fn write(&self, path: &str, request: &WriteRequest) -> Result<WriteAck, DeliveryError>;

    /// Subscribe to change events under `path`.
    fn subscribe(&self, path: &str) -> Subscription;
}

/// Unsubscribes when disposed or dropped, whichever comes first.
pub struct Disposer {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl Disposer {
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    pub fn dispose(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposer")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}

/// A live subscription: the event stream plus its disposer.
#[derive(Debug)]
pub struct Subscription {
    pub events: mpsc::UnboundedReceiver<BackendEvent>,
    pub disposer: Disposer,
}

impl Subscription {
    pub fn new(events: mpsc::UnboundedReceiver<BackendEvent>, disposer: Disposer) -> Self {
        Self { events, disposer }
    }

    pub async fn recv(&mut self) -> Option<BackendEvent> {
        self.events.recv().await
    }

    pub fn unsubscribe(self) {
        self.disposer.dispose();
    }
}
