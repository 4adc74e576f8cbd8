//! Connectivity port - online / offline の通知
//!
//! platform 側の signal を `watch` channel に載せて配ります。
//! 初期状態は `state()` で同期的に読めます。

use std::sync::Arc;

use tokio::sync::watch;

use crate::domain::ConnectionState;

/// Sender side owned by the embedding application. Clones publish to the
/// same channel.
#[derive(Debug, Clone)]
pub struct ConnectivitySignal {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectivitySignal {
    pub fn new(initial: ConnectionState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Publish a transition. Repeating the current state is a no-op.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    pub fn set_online(&self) {
        self.set(ConnectionState::Online);
    }

    pub fn set_offline(&self) {
        self.set(ConnectionState::Offline);
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivitySignal {
    fn default() -> Self {
        Self::new(ConnectionState::Offline)
    }
}
