use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Interval;

/// The upstream's global commit callable (§4.F). Invoked only while the
/// buffer lock is held and only after a flush's bulk writes have succeeded.
pub type CommitFn = Arc<dyn Fn() + Send + Sync>;

/// Decides when to call the upstream commit checkpoint: unconditionally
/// after every flush, or throttled by a non-blocking poll of a commit
/// ticker (§4.F).
pub struct CheckpointCoordinator {
    commit: CommitFn,
    ticker: Option<Mutex<Interval>>,
}

impl CheckpointCoordinator {
    pub fn unconditional(commit: CommitFn) -> Self {
        Self {
            commit,
            ticker: None,
        }
    }

    pub fn throttled(commit: CommitFn, ticker: Interval) -> Self {
        Self {
            commit,
            ticker: Some(Mutex::new(ticker)),
        }
    }

    /// Called after every flush (including an empty one), under the buffer
    /// lock. Invokes the commit callable per the throttling policy.
    pub async fn maybe_commit(&self) {
        match &self.ticker {
            None => (self.commit)(),
            Some(ticker) => {
                let mut ticker = ticker.lock().await;
                if ticker.period().is_zero() {
                    return;
                }
                // Non-blocking poll: only commit if the ticker has already
                // fired since the last commit.
                if futures::FutureExt::now_or_never(ticker.tick()).is_some() {
                    (self.commit)();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn unconditional_commits_every_call() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let coordinator = CheckpointCoordinator::unconditional(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        for _ in 0..3 {
            coordinator.maybe_commit().await;
        }

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn throttled_commits_at_most_once_per_tick() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.reset();

        let coordinator = CheckpointCoordinator::throttled(
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            ticker,
        );

        for _ in 0..10 {
            coordinator.maybe_commit().await;
        }

        assert!(count.load(Ordering::SeqCst) <= 1);
    }
}
