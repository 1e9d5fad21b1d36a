//! Reconciler interface and the worker loop that drives it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::queue::{QueueKey, WorkQueue};

/// What to do with a key after a successful reconcile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Nothing scheduled; wait for the next change notification.
    pub const fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Reconcile the key again after `after`.
    pub const fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    /// Keep the earlier of two requeue requests.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        match (self.requeue_after, other.requeue_after) {
            (Some(a), Some(b)) => Self::requeue(a.min(b)),
            (Some(a), None) | (None, Some(a)) => Self::requeue(a),
            (None, None) => Self::await_change(),
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Error returned by a reconciler, classified for the queue.
pub trait ReconcileFailure: std::error::Error + Send + Sync + 'static {
    /// Whether the key should be retried with backoff.
    fn is_retryable(&self) -> bool;

    /// Explicit delay that overrides the queue's backoff.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// One controller: recomputes the desired state for a single key.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Key: QueueKey;
    type Error: ReconcileFailure;

    /// Name used in logs.
    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &Self::Key) -> Result<Action, Self::Error>;
}

async fn process<R: Reconciler>(reconciler: &R, queue: &WorkQueue<R::Key>, key: R::Key) {
    match reconciler.reconcile(&key).await {
        Ok(action) => {
            queue.forget(&key);
            if let Some(after) = action.requeue_after() {
                queue.add_after(key.clone(), after);
            }
        }
        Err(e) if e.is_retryable() => {
            let delay = match e.retry_after() {
                Some(after) => {
                    queue.add_after(key.clone(), after);
                    after
                }
                None => queue.add_rate_limited(key.clone()),
            };
            warn!(
                controller = reconciler.name(),
                key = %key,
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Reconcile failed, retrying"
            );
        }
        Err(e) => {
            queue.forget(&key);
            error!(
                controller = reconciler.name(),
                key = %key,
                error = %e,
                "Reconcile failed permanently"
            );
        }
    }
    queue.done(&key);
}

/// Run `workers` concurrent workers over `queue` until `shutdown` flips.
///
/// On shutdown the queue stops accepting keys and workers drain what is
/// already queued. Whatever is still running after `grace` is aborted; the
/// next leader picks those keys up from a full resync.
pub async fn run_workers<R: Reconciler>(
    reconciler: Arc<R>,
    queue: WorkQueue<R::Key>,
    workers: usize,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    let name = reconciler.name();
    let mut tasks = JoinSet::new();

    for worker in 0..workers.max(1) {
        let reconciler = Arc::clone(&reconciler);
        let queue = queue.clone();
        tasks.spawn(async move {
            while let Some(key) = queue.get().await {
                debug!(controller = reconciler.name(), worker, key = %key, "Reconciling");
                process(reconciler.as_ref(), &queue, key).await;
            }
        });
    }

    info!(controller = name, workers, "Controller started");

    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    queue.shut_down();
    let pending = queue.len();
    info!(controller = name, pending, "Controller draining");

    let drained = tokio::time::timeout(grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            controller = name,
            abandoned = queue.len(),
            "Drain deadline elapsed, abandoning in-flight work"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    info!(controller = name, "Controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackoffPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, thiserror::Error)]
    #[error("flaky")]
    struct Flaky;

    impl ReconcileFailure for Flaky {
        fn is_retryable(&self) -> bool {
            true
        }
    }

    struct CountingReconciler {
        calls: AtomicU32,
        fail_first: u32,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Reconciler for CountingReconciler {
        type Key = String;
        type Error = Flaky;

        fn name(&self) -> &'static str {
            "counting"
        }

        async fn reconcile(&self, key: &String) -> Result<Action, Flaky> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(key.clone());
            if n < self.fail_first {
                return Err(Flaky);
            }
            Ok(Action::await_change())
        }
    }

    #[tokio::test]
    async fn test_retryable_errors_are_requeued() {
        let reconciler = Arc::new(CountingReconciler {
            calls: AtomicU32::new(0),
            fail_first: 2,
            seen: Mutex::new(Vec::new()),
        });
        let queue = WorkQueue::new(
            "counting",
            BackoffPolicy::fixed(Duration::from_millis(1), Duration::from_millis(5)),
        );
        let (tx, rx) = watch::channel(false);

        queue.add("k".to_string());
        let handle = tokio::spawn(run_workers(
            Arc::clone(&reconciler),
            queue.clone(),
            2,
            rx,
            Duration::from_secs(1),
        ));

        for _ in 0..100 {
            if reconciler.calls.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.failures(&"k".to_string()), 0);
    }

    #[test]
    fn test_action_min_prefers_sooner() {
        let a = Action::requeue(Duration::from_secs(5));
        let b = Action::requeue(Duration::from_secs(2));
        assert_eq!(a.min(b).requeue_after(), Some(Duration::from_secs(2)));
        assert_eq!(
            Action::await_change().min(a).requeue_after(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(Action::await_change().min(Action::await_change()), Action::await_change());
    }
}
