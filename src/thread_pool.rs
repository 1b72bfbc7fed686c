//! Worker thread pools layered on the object pools
//!
//! Each pooled object is a [`Worker`]: a long-lived OS thread parked on a
//! private single-slot mailbox. Submitting a task is exactly "acquire a
//! worker, hand it the task"; the worker returns itself to the pool when the
//! task completes.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use once_cell::sync::OnceCell;

use crate::autoscale::{AutoScaleObjectPool, AutoScaleShared};
use crate::config::{AutoScaleConfig, AutoScaleThreadPoolConfig, PoolConfig, ThreadPoolConfig};
use crate::entry::Entry;
use crate::errors::{PoolError, PoolResult};
use crate::pool::{ObjectPool, PoolInner};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A task travels with the worker's own pool entry so the worker can release
/// itself once the task completes.
struct WorkerMessage {
    task: Task,
    entry: Entry<Worker>,
}

struct Worker {
    mailbox: Sender<WorkerMessage>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn<B: WorkerPoolBackend>(
        backend: Arc<OnceCell<B>>,
        intake: Option<Receiver<Task>>,
    ) -> Worker {
        let (mailbox, tasks) = bounded(1);
        let handle = thread::Builder::new()
            .name("scalepool-worker".into())
            .spawn(move || worker_loop(tasks, backend, intake))
            .expect("failed to spawn worker thread");
        Worker { mailbox, handle }
    }

    /// Close hook: disconnecting the mailbox ends the worker's receive loop.
    /// The join is skipped when the worker is running its own hook, which
    /// happens when it releases itself into an already-closed pool.
    fn shutdown(worker: Worker) {
        let Worker { mailbox, handle } = worker;
        drop(mailbox);
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

fn worker_loop<B: WorkerPoolBackend>(
    tasks: Receiver<WorkerMessage>,
    backend: Arc<OnceCell<B>>,
    intake: Option<Receiver<Task>>,
) {
    while let Ok(message) = tasks.recv() {
        let WorkerMessage { task, entry } = message;
        run_task(task);
        // Pull parked tasks before going idle again.
        if let Some(queue) = &intake {
            while let Ok(task) = queue.try_recv() {
                run_task(task);
            }
        }
        match backend.get() {
            Some(pool) => pool.release_worker(entry),
            None => break,
        }
    }
}

fn run_task(task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        tracing::error!("pooled task panicked");
    }
}

fn hand_off(entry: Entry<Worker>, task: Task) {
    let mailbox = entry.object().mailbox.clone();
    if mailbox.send(WorkerMessage { task, entry }).is_err() {
        tracing::error!("worker mailbox disconnected; task dropped");
    }
}

/// Pairs parked tasks with idle workers.
///
/// A worker checks the intake queue one last time before it releases itself,
/// so a task enqueued inside that window would otherwise sit in the queue
/// with every worker idle. Running this after each enqueue and after each
/// worker release closes the window from both sides: whichever of the two
/// happens last sees both the parked task and the released worker.
fn drain_parked(pool: &AutoScaleObjectPool<Worker>, intake: &Receiver<Task>) {
    while !intake.is_empty() {
        let Ok(Some(entry)) = pool.try_acquire() else {
            // No worker to pair with; the next release re-runs this.
            break;
        };
        match intake.try_recv() {
            Ok(task) => hand_off(entry, task),
            Err(_) => {
                // A busy worker's own drain loop got there first.
                if let Err(err) = pool.release(entry) {
                    tracing::error!(error = %err, "worker release failed");
                }
                break;
            }
        }
    }
}

/// Late-bound handle from a worker back to the pool that owns it, weak so
/// dropping the pool without closing it still lets every worker exit.
trait WorkerPoolBackend: Send + Sync + 'static {
    fn release_worker(&self, entry: Entry<Worker>);
}

struct BoundedBackend {
    inner: Weak<PoolInner<Worker>>,
}

impl WorkerPoolBackend for BoundedBackend {
    fn release_worker(&self, entry: Entry<Worker>) {
        let Some(inner) = self.inner.upgrade() else { return };
        let pool = ObjectPool { inner };
        if let Err(err) = pool.release(entry) {
            tracing::error!(error = %err, "worker release failed");
        }
    }
}

struct AutoScaleBackend {
    inner: Weak<PoolInner<Worker>>,
    shared: Weak<AutoScaleShared<Worker>>,
    intake: Receiver<Task>,
}

impl WorkerPoolBackend for AutoScaleBackend {
    fn release_worker(&self, entry: Entry<Worker>) {
        let (Some(inner), Some(shared)) = (self.inner.upgrade(), self.shared.upgrade()) else {
            return;
        };
        let pool = AutoScaleObjectPool {
            pool: ObjectPool { inner },
            shared,
        };
        if let Err(err) = pool.release(entry) {
            tracing::error!(error = %err, "worker release failed");
            return;
        }
        // A task parked after this worker's last queue check must not wait
        // for a future submit; pair it with a worker now that one is free.
        drain_parked(&pool, &self.intake);
    }
}

/// A bounded worker thread pool.
///
/// # Examples
///
/// ```
/// use scalepool::{ThreadPool, ThreadPoolConfig};
///
/// let pool = ThreadPool::new(ThreadPoolConfig::new().with_max_size(2)).unwrap();
/// let (tx, rx) = crossbeam::channel::bounded(1);
/// pool.submit(move || tx.send(21 * 2).unwrap()).unwrap();
/// assert_eq!(rx.recv().unwrap(), 42);
/// pool.close();
/// ```
pub struct ThreadPool {
    pool: ObjectPool<Worker>,
}

impl ThreadPool {
    /// Creates the pool and spawns `min_size` workers eagerly.
    pub fn new(config: ThreadPoolConfig) -> PoolResult<Self> {
        config.validate()?;
        let backend: Arc<OnceCell<BoundedBackend>> = Arc::new(OnceCell::new());
        let worker_backend = Arc::clone(&backend);
        let pool_config =
            PoolConfig::new(move || Ok(Worker::spawn(Arc::clone(&worker_backend), None)))
                .with_min_size(config.min_size)
                .with_max_size(config.max_size)
                .with_on_close(Worker::shutdown);
        let pool = ObjectPool::new(pool_config)?;
        let _ = backend.set(BoundedBackend {
            inner: Arc::downgrade(&pool.inner),
        });
        Ok(ThreadPool { pool })
    }

    /// Runs the task on a pooled worker, blocking while every worker is busy.
    pub fn submit<F>(&self, task: F) -> PoolResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let entry = self.pool.acquire()?;
        hand_off(entry, Box::new(task));
        Ok(())
    }

    /// Non-blocking variant; `Ok(false)` when every worker is busy.
    pub fn try_submit<F>(&self, task: F) -> PoolResult<bool>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.pool.try_acquire()? {
            Some(entry) => {
                hand_off(entry, Box::new(task));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of resident workers.
    pub fn size(&self) -> usize {
        self.pool.size()
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Closes the underlying pool; idle workers are disconnected and joined,
    /// busy workers exit after their current task.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// An auto-scaling worker thread pool with a bounded task intake queue.
///
/// While every worker is busy, tasks park in the queue up to
/// `queue_capacity`; [`submit`](AutoScaleThreadPool::submit) blocks when the
/// queue is full and [`try_submit`](AutoScaleThreadPool::try_submit) fails
/// fast. Released workers drain the queue before returning to the pool.
pub struct AutoScaleThreadPool {
    pool: AutoScaleObjectPool<Worker>,
    intake_tx: Sender<Task>,
    intake_rx: Receiver<Task>,
}

impl AutoScaleThreadPool {
    pub fn new(config: AutoScaleThreadPoolConfig) -> PoolResult<Self> {
        config.validate()?;
        let (intake_tx, intake_rx) = bounded::<Task>(config.queue_capacity);
        let backend: Arc<OnceCell<AutoScaleBackend>> = Arc::new(OnceCell::new());
        let worker_backend = Arc::clone(&backend);
        let worker_intake = intake_rx.clone();
        let pool_config = PoolConfig::new(move || {
            Ok(Worker::spawn(
                Arc::clone(&worker_backend),
                Some(worker_intake.clone()),
            ))
        })
        .with_min_size(config.min_size)
        .with_max_size(config.max_size)
        .with_on_close(Worker::shutdown);
        let auto_config = AutoScaleConfig::new(pool_config)
            .with_check_interval(config.check_interval)
            .with_object_ttl(config.worker_ttl)
            .with_max_idle_time(config.max_idle_time)
            .with_scale_factor(config.scale_factor);
        let pool = AutoScaleObjectPool::new(auto_config)?;
        let _ = backend.set(AutoScaleBackend {
            inner: Arc::downgrade(&pool.pool.inner),
            shared: Arc::downgrade(&pool.shared),
            intake: intake_rx.clone(),
        });
        Ok(AutoScaleThreadPool {
            pool,
            intake_tx,
            intake_rx,
        })
    }

    /// Hands the task to an idle worker, or parks it in the intake queue;
    /// blocks while the queue is full.
    pub fn submit<F>(&self, task: F) -> PoolResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.pool.try_acquire()? {
            Some(entry) => {
                hand_off(entry, Box::new(task));
                Ok(())
            }
            None => {
                self.intake_tx
                    .send(Box::new(task))
                    .map_err(|_| PoolError::PoolClosed)?;
                drain_parked(&self.pool, &self.intake_rx);
                Ok(())
            }
        }
    }

    /// Non-blocking variant; `Ok(false)` when the workers and the queue are
    /// both full.
    pub fn try_submit<F>(&self, task: F) -> PoolResult<bool>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.pool.try_acquire()? {
            Some(entry) => {
                hand_off(entry, Box::new(task));
                Ok(true)
            }
            None => match self.intake_tx.try_send(Box::new(task)) {
                Ok(()) => {
                    drain_parked(&self.pool, &self.intake_rx);
                    Ok(true)
                }
                Err(TrySendError::Full(_)) => Ok(false),
                Err(TrySendError::Disconnected(_)) => Err(PoolError::PoolClosed),
            },
        }
    }

    /// Number of resident workers.
    pub fn size(&self) -> usize {
        self.pool.size()
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub fn close(&self) {
        let pending = self.intake_tx.len();
        if pending > 0 {
            tracing::warn!(pending, "closing thread pool with queued tasks");
        }
        self.pool.close();
    }
}
