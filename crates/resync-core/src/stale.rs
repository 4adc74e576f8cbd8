//! StaleRequestGuard - 世代カウンタ + キャンセルトークン
//!
//! 論理的なリクエストの流れ（表示中の room、検索クエリなど）ごとに 1 つ持ちます。
//! `begin()` のたびに世代が進み、前の世代のトークンは即座に cancel されます。
//! 非同期処理は開始時の `Generation` を覚えておき、結果を適用する直前に
//! `is_current` で再確認します。

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Monotonic epoch number of one request stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Generation(u64);

impl Generation {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

/// Handle for the work started by one `begin()`.
#[derive(Debug, Clone)]
pub struct Epoch {
    pub generation: Generation,
    pub token: CancellationToken,
}

impl Epoch {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drive `fut` until it finishes or the epoch is superseded.
    ///
    /// Returns `None` when cancelled; the future is dropped at that point.
    pub async fn run<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            out = fut => (!self.token.is_cancelled()).then_some(out),
        }
    }

    /// Wait `delay`, then report whether this epoch is still live.
    ///
    /// Returns early with `false` when superseded during the wait.
    pub async fn debounce(&self, delay: Duration) -> bool {
        self.run(tokio::time::sleep(delay)).await.is_some()
    }
}

#[derive(Debug, Default)]
pub struct StaleRequestGuard {
    counter: u64,
    active: Option<CancellationToken>,
}

impl StaleRequestGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new epoch, cancelling the previous one.
    pub fn begin(&mut self) -> Epoch {
        if let Some(previous) = self.active.take() {
            previous.cancel();
        }
        self.counter += 1;
        let token = CancellationToken::new();
        self.active = Some(token.clone());
        debug!(generation = self.counter, "stale guard: new epoch");
        Epoch {
            generation: Generation(self.counter),
            token,
        }
    }

    /// True only for the generation of the latest, uncancelled `begin()`.
    pub fn is_current(&self, generation: Generation) -> bool {
        self.active.is_some() && generation.0 == self.counter
    }

    /// Cancel the active epoch without starting a new one.
    pub fn cancel_current(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel();
            debug!(generation = self.counter, "stale guard: cancelled");
        }
    }

    /// Latest issued generation (cancelled or not).
    pub fn current(&self) -> Generation {
        Generation(self.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_supersedes_previous_epoch() {
        let mut guard = StaleRequestGuard::new();
        let first = guard.begin();
        assert!(guard.is_current(first.generation));

        let second = guard.begin();
        assert!(first.is_cancelled());
        assert!(!guard.is_current(first.generation));
        assert!(guard.is_current(second.generation));
        assert!(second.generation > first.generation);
    }

    #[test]
    fn cancel_current_leaves_nothing_current() {
        let mut guard = StaleRequestGuard::new();
        let epoch = guard.begin();
        guard.cancel_current();

        assert!(epoch.is_cancelled());
        assert!(!guard.is_current(epoch.generation));
        assert_eq!(guard.current(), epoch.generation);
    }

    #[tokio::test(start_paused = true)]
    async fn late_result_of_superseded_request_is_discarded() {
        let mut guard = StaleRequestGuard::new();
        let first = guard.begin();

        let slow = {
            let first = first.clone();
            tokio::spawn(async move {
                first
                    .run(async {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        "first"
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = guard.begin();

        assert_eq!(slow.await.unwrap(), None);
        assert!(!guard.is_current(first.generation));
        assert_eq!(second.run(async { "second" }).await, Some("second"));
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_only_fires_for_last_keystroke() {
        let mut guard = StaleRequestGuard::new();
        let a = guard.begin();
        let wait_a = {
            let a = a.clone();
            tokio::spawn(async move { a.debounce(Duration::from_millis(300)).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let b = guard.begin();

        assert!(!wait_a.await.unwrap());
        assert!(b.debounce(Duration::from_millis(300)).await);
        assert!(guard.is_current(b.generation));
    }
}
