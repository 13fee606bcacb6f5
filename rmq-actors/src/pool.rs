//! Fixed-size pool of OS threads running consumer callbacks.
//!
//! Every worker thread drives its own current-thread tokio runtime and pulls tasks from a
//! shared queue, so at most `size` tasks run at once and the rest wait in FIFO order.
//! Shutdown happens in two phases: `close` stops intake, then `shutdown` drains what is
//! left and cancels whatever is still running when the grace period expires.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{PoolError, TaskError};
use crate::metrics_consts::{TASKS_COMPLETED, TASKS_SUBMITTED, TASK_DURATION, WORKERS_BUSY};
use crate::metrics_sink::MetricsSink;
use crate::util::lock;

// Bound on how long cancelled workers get to unwind before we stop waiting for them.
// Cancellation is observed at the task's next poll, so this only matters for tasks that
// block their thread.
const FORCED_EXIT_TIMEOUT: Duration = Duration::from_secs(1);

type TaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;
type Job = Box<dyn FnOnce() -> TaskFuture + Send>;

struct QueuedTask {
    job: Job,
    done: oneshot::Sender<Result<(), TaskError>>,
}

/// Resolves with the outcome of a submitted task. Every accepted task resolves exactly once.
#[must_use]
pub struct TaskHandle {
    rx: oneshot::Receiver<Result<(), TaskError>>,
}

impl TaskHandle {
    pub async fn wait(self) -> Result<(), TaskError> {
        self.rx.await.unwrap_or(Err(TaskError::Dropped))
    }
}

struct PoolShared {
    name: String,
    size: usize,
    labels: Vec<(String, String)>,
    intake: Mutex<Option<mpsc::UnboundedSender<QueuedTask>>>,
    queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedTask>>,
    cancel: CancellationToken,
    live: watch::Sender<usize>,
    busy: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
    metrics: Arc<dyn MetricsSink>,
}

impl PoolShared {
    fn submit(&self, job: Job) -> Result<TaskHandle, TaskError> {
        let intake = lock(&self.intake);
        let Some(sender) = intake.as_ref() else {
            self.record_submission("rejected");
            return Err(TaskError::Rejected);
        };

        let (done, rx) = oneshot::channel();
        self.queued.fetch_add(1, Ordering::SeqCst);
        if sender.send(QueuedTask { job, done }).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.record_submission("rejected");
            return Err(TaskError::Rejected);
        }
        self.record_submission("accepted");
        Ok(TaskHandle { rx })
    }

    fn record_submission(&self, outcome: &str) {
        let mut labels = self.labels.clone();
        labels.push(("outcome".to_string(), outcome.to_string()));
        self.metrics.increment(TASKS_SUBMITTED, &labels);
    }

    fn close_intake(&self) -> bool {
        lock(&self.intake).take().is_some()
    }

    fn is_accepting(&self) -> bool {
        lock(&self.intake).is_some()
    }

    async fn next_task(&self) -> Option<QueuedTask> {
        let mut queue = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            queue = self.queue.lock() => queue,
        };
        let task = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            task = queue.recv() => task,
        };
        if task.is_some() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
        task
    }

    async fn run(&self, task: QueuedTask) {
        let QueuedTask { job, done } = task;

        let busy = self.busy.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.gauge(WORKERS_BUSY, &self.labels, busy as f64);
        let started = Instant::now();

        let work = AssertUnwindSafe(async move { job().await }).catch_unwind();
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TaskError::Cancelled),
            outcome = work => outcome.unwrap_or(Err(TaskError::Panicked)),
        };

        let busy = self.busy.fetch_sub(1, Ordering::SeqCst) - 1;
        self.metrics.gauge(WORKERS_BUSY, &self.labels, busy as f64);

        let outcome = match &result {
            Ok(()) => "success",
            Err(TaskError::Cancelled) => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                "cancelled"
            }
            Err(TaskError::Panicked) => {
                warn!(pool = %self.name, "worker task panicked");
                "panicked"
            }
            Err(_) => "failed",
        };
        let mut labels = self.labels.clone();
        labels.push(("outcome".to_string(), outcome.to_string()));
        self.metrics.increment(TASKS_COMPLETED, &labels);
        self.metrics
            .record_duration(TASK_DURATION, &labels, started.elapsed());
        self.completed.fetch_add(1, Ordering::SeqCst);

        // The submitter may have dropped its handle, nothing to do then.
        drop(done.send(result));
    }

    async fn cancel_remaining(&self) {
        let mut queue = self.queue.lock().await;
        while let Ok(task) = queue.try_recv() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            drop(task.done.send(Err(TaskError::Cancelled)));
        }
    }

    fn live_workers(&self) -> usize {
        *self.live.borrow()
    }

    async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut live = self.live.subscribe();
        let exited = matches!(
            tokio::time::timeout(timeout, live.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        exited
    }
}

async fn worker_loop(shared: &PoolShared) {
    while let Some(task) = shared.next_task().await {
        shared.run(task).await;
    }
    if shared.cancel.is_cancelled() {
        shared.cancel_remaining().await;
    }
}

fn run_worker(shared: Arc<PoolShared>, index: usize) {
    match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime.block_on(worker_loop(&shared)),
        Err(e) => error!(pool = %shared.name, worker = index, "failed to build worker runtime: {}", e),
    }
    shared.live.send_modify(|n| *n = n.saturating_sub(1));
    debug!(pool = %shared.name, worker = index, "worker exited");
}

/// Cloneable submission handle given to consumers. It cannot shut the pool down.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<PoolShared>,
}

impl WorkerHandle {
    /// Queue a task. Returns `TaskError::Rejected` once the pool stopped accepting work.
    pub fn submit<F, Fut>(&self, task: F) -> Result<TaskHandle, TaskError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let job: Job = Box::new(move || -> TaskFuture { Box::pin(task()) });
        self.shared.submit(job)
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.is_accepting()
    }

    pub fn probe(&self) -> PoolProbe {
        PoolProbe {
            shared: self.shared.clone(),
        }
    }
}

/// Read-only counters, used by tests and by hosts that want to expose pool saturation.
#[derive(Clone)]
pub struct PoolProbe {
    shared: Arc<PoolShared>,
}

impl PoolProbe {
    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live_workers()
    }

    pub fn busy_workers(&self) -> usize {
        self.shared.busy.load(Ordering::SeqCst)
    }

    pub fn queued_tasks(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    pub fn completed_tasks(&self) -> usize {
        self.shared.completed.load(Ordering::SeqCst)
    }

    pub fn cancelled_tasks(&self) -> usize {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.is_accepting()
    }
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize, metrics: Arc<dyn MetricsSink>) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::EmptyPool);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (live, _) = watch::channel(0);
        let shared = Arc::new(PoolShared {
            name: name.to_owned(),
            size,
            labels: vec![("pool".to_string(), name.to_owned())],
            intake: Mutex::new(Some(tx)),
            queue: tokio::sync::Mutex::new(rx),
            cancel: CancellationToken::new(),
            live,
            busy: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            metrics,
        });

        let mut threads = Vec::with_capacity(size);
        for index in 0..size {
            let worker = shared.clone();
            shared.live.send_modify(|n| *n += 1);
            let spawned = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || run_worker(worker, index));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    shared.live.send_modify(|n| *n -= 1);
                    shared.close_intake();
                    shared.cancel.cancel();
                    error!(pool = name, worker = index, "failed to spawn worker thread: {}", e);
                    return Err(PoolError::Spawn(e));
                }
            }
        }

        info!(pool = name, size, "worker pool started");
        Ok(Self {
            shared,
            threads: Mutex::new(threads),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn probe(&self) -> PoolProbe {
        PoolProbe {
            shared: self.shared.clone(),
        }
    }

    pub fn submit<F, Fut>(&self, task: F) -> Result<TaskHandle, TaskError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.handle().submit(task)
    }

    /// Stop accepting new tasks. Queued and running tasks keep going.
    /// Returns false if intake was already closed.
    pub fn close(&self) -> bool {
        let closed = self.shared.close_intake();
        if closed {
            debug!(pool = %self.shared.name, "worker pool intake closed");
        }
        closed
    }

    /// Close intake, wait up to `grace` for every accepted task to finish, then cancel
    /// whatever is left and join the worker threads.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), PoolError> {
        self.close();

        let mut result = Ok(());
        if !self.shared.wait_for_exit(grace).await {
            warn!(
                pool = %self.shared.name,
                busy = self.shared.busy.load(Ordering::SeqCst),
                queued = self.shared.queued.load(Ordering::SeqCst),
                "grace period expired, cancelling remaining tasks"
            );
            self.shared.cancel.cancel();

            if !self.shared.wait_for_exit(FORCED_EXIT_TIMEOUT).await {
                let remaining = self.shared.live_workers();
                error!(pool = %self.shared.name, remaining, "worker threads did not exit");
                return Err(PoolError::WorkersStuck { remaining });
            }
            result = Err(PoolError::GraceExpired {
                cancelled: self.shared.cancelled.load(Ordering::SeqCst),
            });
        }

        let threads = std::mem::take(&mut *lock(&self.threads));
        let panicked = match tokio::task::spawn_blocking(move || {
            threads
                .into_iter()
                .map(thread::JoinHandle::join)
                .filter(Result::is_err)
                .count()
        })
        .await
        {
            Ok(panicked) => panicked,
            Err(e) => {
                error!(pool = %self.shared.name, "failed to join worker threads: {}", e);
                0
            }
        };
        if panicked > 0 && result.is_ok() {
            result = Err(PoolError::WorkerPanicked(panicked));
        }

        info!(
            pool = %self.shared.name,
            completed = self.shared.completed.load(Ordering::SeqCst),
            cancelled = self.shared.cancelled.load(Ordering::SeqCst),
            "worker pool stopped"
        );
        result
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Threads are detached here, they exit as soon as they observe the token.
        self.shared.close_intake();
        self.shared.cancel.cancel();
    }
}

/// Builds the pool the manager hands work to. `metrics` is the manager's own sink.
pub trait WorkerPoolFactory: Send + Sync {
    fn new_fixed_pool(
        &self,
        name: &str,
        size: usize,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<WorkerPool, PoolError>;
}

/// Plain fixed-size pools reporting to whatever sink the manager was built with.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultWorkerPoolFactory;

impl WorkerPoolFactory for DefaultWorkerPoolFactory {
    fn new_fixed_pool(
        &self,
        name: &str,
        size: usize,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<WorkerPool, PoolError> {
        WorkerPool::new(name, size, metrics)
    }
}

/// Factory whose pools report task throughput and saturation to a dedicated sink instead
/// of the manager's, e.g. to keep worker metrics under a separate service label.
#[derive(Clone)]
pub struct InstrumentedWorkerPoolFactory {
    metrics: Arc<dyn MetricsSink>,
}

impl InstrumentedWorkerPoolFactory {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self { metrics }
    }
}

impl WorkerPoolFactory for InstrumentedWorkerPoolFactory {
    fn new_fixed_pool(
        &self,
        name: &str,
        size: usize,
        _metrics: Arc<dyn MetricsSink>,
    ) -> Result<WorkerPool, PoolError> {
        WorkerPool::new(name, size, self.metrics.clone())
    }
}
