//! Sequential task queue.
//!
//! A single background worker drains appended work items strictly in FIFO
//! order, one at a time. An item that fails, panics or is cancelled is logged
//! and skipped; it never stops the queue or affects other items.
//!
//! The queue is unbounded: a slow worker lets the backlog grow without
//! pushing back on producers. `QueueConfig::backlog_warning` makes that
//! visible in the logs.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::QueueConfig;
use crate::error::{OperationError, QueueError};
use crate::operation::Outcome;

type WorkItem = Box<dyn FnOnce() -> BoxFuture<'static, Outcome> + Send>;

pub struct TaskQueue {
    config: QueueConfig,
    tx: Mutex<Option<mpsc::UnboundedSender<WorkItem>>>,
    queued: Arc<AtomicUsize>,
    drained: watch::Receiver<bool>,
}

impl TaskQueue {
    /// Create a queue with default configuration and start its worker on the
    /// current tokio runtime.
    pub fn new() -> Result<Self, QueueError> {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Result<Self, QueueError> {
        let handle = Handle::try_current()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (drained_tx, drained_rx) = watch::channel(false);
        let queued = Arc::new(AtomicUsize::new(0));

        handle.spawn(run_worker(
            config.name.clone(),
            rx,
            Arc::clone(&queued),
            drained_tx,
        ));

        Ok(Self {
            config,
            tx: Mutex::new(Some(tx)),
            queued,
            drained: drained_rx,
        })
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<WorkItem>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Enqueue `work`. It is invoked by the worker after every previously
    /// appended item has finished. Never blocks.
    ///
    /// Fire and forget: the outcome is only logged. Use
    /// [`submit`](Self::submit) to receive it.
    pub fn append<F, Fut>(&self, work: F) -> Result<(), QueueError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let item: WorkItem = Box::new(move || work().boxed());

        // Sending under the lock keeps order consistent with a concurrent close.
        let backlog = {
            let guard = self.sender();
            let Some(tx) = guard.as_ref() else {
                return Err(self.closed());
            };
            let backlog = self.queued.fetch_add(1, Ordering::AcqRel) + 1;
            if tx.send(item).is_err() {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                return Err(self.closed());
            }
            backlog
        };

        let threshold = self.config.backlog_warning;
        if threshold > 0 && backlog % threshold == 0 {
            tracing::warn!(queue = %self.config.name, backlog, "Task queue backlog growing");
        }
        Ok(())
    }

    /// Enqueue `work` and receive its result.
    ///
    /// The worker still logs failures. A panic is delivered as
    /// `OperationError::Panicked`.
    pub fn submit<F, Fut, T>(
        &self,
        work: F,
    ) -> Result<oneshot::Receiver<Result<T, OperationError>>, QueueError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.append(move || async move {
            let result = match AssertUnwindSafe(async move { work().await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => Err(OperationError::from_panic(payload)),
            };
            let outcome = match &result {
                Ok(_) => Ok(()),
                Err(e) => Err(e.clone()),
            };
            let _ = tx.send(result);
            outcome
        })?;
        Ok(rx)
    }

    /// Best-effort count of items not yet started. Diagnostics only.
    pub fn currently_queued_tasks(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }

    /// Stop accepting items. Already queued items still run.
    pub fn close(&self) {
        if self.sender().take().is_some() {
            tracing::debug!(
                queue = %self.config.name,
                backlog = self.currently_queued_tasks(),
                "Task queue closed"
            );
        }
    }

    /// Close the queue and wait until every queued item has run and the
    /// worker has exited.
    pub async fn shutdown(&self) {
        self.close();
        let mut drained = self.drained.clone();
        // Err: the runtime dropped the worker, nothing left to wait for.
        let _ = drained.wait_for(|done| *done).await;
    }

    fn closed(&self) -> QueueError {
        QueueError::Closed {
            name: self.config.name.clone(),
        }
    }
}

async fn run_worker(
    name: String,
    mut rx: mpsc::UnboundedReceiver<WorkItem>,
    queued: Arc<AtomicUsize>,
    drained: watch::Sender<bool>,
) {
    tracing::debug!(queue = %name, "Task queue worker started");

    while let Some(work) = rx.recv().await {
        queued.fetch_sub(1, Ordering::AcqRel);

        let outcome = match catch_unwind(AssertUnwindSafe(work)) {
            Ok(future) => match AssertUnwindSafe(future).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => Err(OperationError::from_panic(payload)),
            },
            Err(payload) => Err(OperationError::from_panic(payload)),
        };

        match outcome {
            Ok(()) => {}
            Err(OperationError::Cancelled) => {
                tracing::debug!(queue = %name, "Queued task was cancelled");
            }
            Err(e) => {
                tracing::error!(queue = %name, error = %e, "Queued task failed");
            }
        }
    }

    tracing::debug!(queue = %name, "Task queue drained, worker exiting");
    drained.send_replace(true);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Notify;
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;
    use crate::logging::{LogCollector, drain_collected_logs};

    type Journal = Arc<Mutex<Vec<String>>>;

    fn record(journal: &Journal, entry: impl Into<String>) {
        journal.lock().unwrap().push(entry.into());
    }

    fn step(
        journal: &Journal,
        label: &'static str,
        fail: bool,
    ) -> impl FnOnce() -> BoxFuture<'static, Outcome> + Send + 'static {
        let journal = Arc::clone(journal);
        move || {
            async move {
                record(&journal, format!("{label} start"));
                tokio::time::sleep(Duration::from_millis(5)).await;
                record(&journal, format!("{label} end"));
                if fail {
                    Err(anyhow::anyhow!("{label} failed").into())
                } else {
                    Ok(())
                }
            }
            .boxed()
        }
    }

    #[test]
    fn requires_runtime() {
        assert!(matches!(TaskQueue::new(), Err(QueueError::NoRuntime(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn runs_in_order_one_at_a_time_despite_failure() {
        let queue = TaskQueue::new().unwrap();
        let journal: Journal = Arc::default();

        queue.append(step(&journal, "A", true)).unwrap();
        queue.append(step(&journal, "B", false)).unwrap();
        queue.append(step(&journal, "C", false)).unwrap();
        queue.shutdown().await;

        assert_eq!(
            *journal.lock().unwrap(),
            vec!["A start", "A end", "B start", "B end", "C start", "C end"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn preserves_submission_order_across_threads() {
        let queue = Arc::new(TaskQueue::new().unwrap());
        let journal: Journal = Arc::default();

        for label in ["A", "B", "C"] {
            let queue = Arc::clone(&queue);
            let work = step(&journal, label, label == "A");
            std::thread::spawn(move || queue.append(work).unwrap())
                .join()
                .unwrap();
        }
        queue.shutdown().await;

        assert_eq!(
            *journal.lock().unwrap(),
            vec!["A start", "A end", "B start", "B end", "C start", "C end"]
        );
    }

    #[tokio::test]
    async fn shutdown_drains_backlog() {
        let queue = TaskQueue::new().unwrap();
        let journal: Journal = Arc::default();

        queue.append(step(&journal, "A", false)).unwrap();
        queue.append(step(&journal, "B", false)).unwrap();
        assert!(journal.lock().unwrap().is_empty());

        queue.shutdown().await;

        assert_eq!(journal.lock().unwrap().len(), 4);
        assert_eq!(queue.currently_queued_tasks(), 0);
    }

    #[tokio::test]
    async fn append_after_shutdown_is_rejected() {
        let queue = TaskQueue::with_config(QueueConfig::named("saves")).unwrap();
        queue.shutdown().await;

        assert!(queue.is_closed());
        let err = queue.append(|| async { Ok(()) }).unwrap_err();
        assert!(matches!(err, QueueError::Closed { ref name } if name == "saves"));
    }

    #[tokio::test]
    async fn counts_items_not_yet_started() {
        let queue = TaskQueue::new().unwrap();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let started_signal = Arc::clone(&started);
        let gate = Arc::clone(&release);
        queue
            .append(move || async move {
                started_signal.notify_one();
                gate.notified().await;
                Ok(())
            })
            .unwrap();
        started.notified().await;

        queue.append(|| async { Ok(()) }).unwrap();
        queue.append(|| async { Ok(()) }).unwrap();
        assert_eq!(queue.currently_queued_tasks(), 2);

        release.notify_one();
        queue.shutdown().await;
        assert_eq!(queue.currently_queued_tasks(), 0);
    }

    #[tokio::test]
    async fn failures_are_logged_and_isolated() {
        let (collector, mut rx) = LogCollector::channel();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(collector));

        let queue = TaskQueue::with_config(QueueConfig::named("saves")).unwrap();
        let finished = Arc::new(AtomicUsize::new(0));

        queue
            .append(|| async { Err(anyhow::anyhow!("disk full").into()) })
            .unwrap();
        queue.append(|| async { Err(OperationError::Cancelled) }).unwrap();
        queue
            .append(|| -> BoxFuture<'static, Outcome> { panic!("thunk exploded") })
            .unwrap();
        let counter = Arc::clone(&finished);
        queue
            .append(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        queue.shutdown().await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);

        let logs = drain_collected_logs(&mut rx);
        assert!(logs.contains("Queued task failed queue=saves error=operation failed: disk full"));
        assert!(logs.contains("Queued task was cancelled queue=saves"));
        assert!(logs.contains("error=operation panicked: thunk exploded"));
        assert!(logs.contains("Task queue drained, worker exiting"));
    }

    #[tokio::test]
    async fn warns_when_backlog_reaches_threshold() {
        let (collector, mut rx) = LogCollector::channel();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(collector));

        let config = QueueConfig {
            name: "thumbnails".to_string(),
            backlog_warning: 2,
        };
        let queue = TaskQueue::with_config(config).unwrap();
        for _ in 0..3 {
            queue.append(|| async { Ok(()) }).unwrap();
        }
        queue.shutdown().await;

        let logs = drain_collected_logs(&mut rx);
        assert_eq!(logs.matches("Task queue backlog growing").count(), 1);
        assert!(logs.contains("queue=thumbnails backlog=2"));
    }

    #[tokio::test]
    async fn submit_delivers_results() {
        let queue = TaskQueue::new().unwrap();

        let answer = queue.submit(|| async { Ok(42) }).unwrap();
        let failure = queue
            .submit(|| async { Err::<u32, _>(OperationError::failed(anyhow::anyhow!("nope"))) })
            .unwrap();
        let panicked = queue
            .submit(|| async {
                if true {
                    panic!("worker item panicked");
                }
                Ok(0_u8)
            })
            .unwrap();

        assert_eq!(answer.await.unwrap().unwrap(), 42);
        assert!(matches!(failure.await.unwrap(), Err(OperationError::Failed(_))));
        assert!(matches!(
            panicked.await.unwrap(),
            Err(OperationError::Panicked { .. })
        ));

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_shutdowns_both_wait() {
        let queue = Arc::new(TaskQueue::new().unwrap());
        let done = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&done);
        queue
            .append(move || async move {
                tokio::task::yield_now().await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let first = Arc::clone(&queue);
        let second = Arc::clone(&queue);
        tokio::join!(first.shutdown(), second.shutdown());

        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
