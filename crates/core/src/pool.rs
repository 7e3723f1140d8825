//! Bounded worker pool for fetch and cache lifecycle tasks.
//!
//! Submission follows the core/backlog/burst order:
//!
//! 1. fewer than `core_size` workers: start a core worker with the task
//! 2. otherwise queue the task in the bounded backlog
//! 3. backlog full: start a burst worker if below `max_size`
//! 4. otherwise apply the [`OverflowPolicy`]
//!
//! Burst workers retire after `keep_alive` without work. Core workers live
//! until [`WorkerPool::shutdown`].
//!
//! Control tasks ([`WorkerPool::spawn_control`]) bypass both the worker limit
//! and the backlog, so they can run while every worker waits on them.

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// What to do with a task when the backlog is full and no worker may start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail the submission with [`PoolError::Saturated`].
    #[default]
    Reject,
    /// Block the submitting thread until the backlog has room.
    ///
    /// Blocks an OS thread; do not use from a current-thread runtime.
    CallerBlocks,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub core_size: usize,
    pub max_size: usize,
    pub keep_alive: Duration,
    pub backlog: usize,
    pub overflow: OverflowPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { core_size: 5, max_size: 15, keep_alive: Duration::from_secs(10), backlog: 30, overflow: OverflowPolicy::Reject }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfig("max_size must be at least 1".into()));
        }
        if self.core_size > self.max_size {
            return Err(PoolError::InvalidConfig(format!(
                "core_size ({}) exceeds max_size ({})",
                self.core_size, self.max_size
            )));
        }
        if self.backlog == 0 {
            return Err(PoolError::InvalidConfig("backlog must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("POOL_SATURATED: {workers} workers busy and {queued} tasks queued")]
    Saturated { workers: usize, queued: usize },

    #[error("POOL_CLOSED")]
    Closed,

    #[error("POOL_CONFIG: {0}")]
    InvalidConfig(String),

    #[error("POOL_NO_RUNTIME: {0}")]
    NoRuntime(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    /// Running control tasks.
    pub control: usize,
    pub queued: usize,
    pub completed: u64,
    pub panicked: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerKind {
    Core,
    Burst,
}

struct Shared {
    config: PoolConfig,
    handle: Handle,
    tx: async_channel::Sender<Job>,
    rx: async_channel::Receiver<Job>,
    /// Live worker count.
    workers: watch::Sender<usize>,
    control: watch::Sender<usize>,
    closed: AtomicBool,
    completed: AtomicU64,
    panicked: AtomicU64,
}

/// Cloneable handle to a pool of tokio tasks.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("config", &self.shared.config).field("stats", &self.stats()).finish()
    }
}

impl WorkerPool {
    /// Build a pool spawning onto the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NoRuntime` outside a runtime and
    /// `PoolError::InvalidConfig` for inconsistent sizes.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        let handle = Handle::try_current().map_err(|e| PoolError::NoRuntime(e.to_string()))?;
        Self::with_handle(config, handle)
    }

    pub fn with_handle(config: PoolConfig, handle: Handle) -> Result<Self, PoolError> {
        config.validate()?;
        let (tx, rx) = async_channel::bounded(config.backlog);
        let (workers, _) = watch::channel(0);
        let (control, _) = watch::channel(0);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                handle,
                tx,
                rx,
                workers,
                control,
                closed: AtomicBool::new(false),
                completed: AtomicU64::new(0),
                panicked: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Submit a task.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Saturated` when the task is rejected by the
    /// overflow policy and `PoolError::Closed` after shutdown.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let job: Job = Box::pin(task);

        if shared.try_reserve(shared.config.core_size) {
            shared.spawn_worker(Some(job), WorkerKind::Core);
            return Ok(());
        }

        let job = match shared.tx.try_send(job) {
            Ok(()) => {
                // a pool without core workers may have none left to drain the backlog
                let no_workers = *shared.workers.borrow() == 0;
                if no_workers && shared.try_reserve(shared.config.max_size) {
                    shared.spawn_worker(None, WorkerKind::Burst);
                }
                return Ok(());
            }
            Err(async_channel::TrySendError::Closed(_)) => return Err(PoolError::Closed),
            Err(async_channel::TrySendError::Full(job)) => job,
        };

        if shared.try_reserve(shared.config.max_size) {
            tracing::debug!(workers = *shared.workers.borrow(), "Backlog full, starting burst worker");
            shared.spawn_worker(Some(job), WorkerKind::Burst);
            return Ok(());
        }

        match shared.config.overflow {
            OverflowPolicy::Reject => {
                let err = PoolError::Saturated { workers: *shared.workers.borrow(), queued: shared.tx.len() };
                tracing::warn!(error = %err, "Rejected task");
                Err(err)
            }
            OverflowPolicy::CallerBlocks => {
                tracing::debug!("Backlog full, blocking submitter");
                shared.tx.send_blocking(job).map_err(|_| PoolError::Closed)
            }
        }
    }

    /// Run a control task right away on the pool's runtime.
    ///
    /// Control tasks take no worker slot and never queue behind the backlog.
    /// Panics are caught like those of regular tasks.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Closed` after shutdown.
    pub fn spawn_control<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        shared.control.send_modify(|n| *n += 1);

        let job: Job = Box::pin(task);
        let task_shared = Arc::clone(shared);
        shared.handle.spawn(async move {
            let _slot = ControlSlot(Arc::clone(&task_shared));
            task_shared.run(job).await;
        });
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: *self.shared.workers.borrow(),
            control: *self.shared.control.borrow(),
            queued: self.shared.tx.len(),
            completed: self.shared.completed.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop accepting tasks and wait for the workers to drain the backlog
    /// and for running control tasks to finish.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.tx.close();
        let mut workers = self.shared.workers.subscribe();
        let _ = workers.wait_for(|n| *n == 0).await;
        let mut control = self.shared.control.subscribe();
        let _ = control.wait_for(|n| *n == 0).await;
        tracing::debug!(completed = self.shared.completed.load(Ordering::Relaxed), "Worker pool shut down");
    }
}

impl Shared {
    fn try_reserve(&self, limit: usize) -> bool {
        self.workers.send_if_modified(|n| {
            if *n < limit {
                *n += 1;
                true
            } else {
                false
            }
        })
    }

    fn spawn_worker(self: &Arc<Self>, first: Option<Job>, kind: WorkerKind) {
        let shared = Arc::clone(self);
        self.handle.spawn(async move {
            let _slot = WorkerSlot(Arc::clone(&shared));
            if let Some(job) = first {
                shared.run(job).await;
            }
            while let Some(job) = shared.next_job(kind).await {
                shared.run(job).await;
            }
        });
    }

    async fn next_job(&self, kind: WorkerKind) -> Option<Job> {
        match kind {
            WorkerKind::Core => self.rx.recv().await.ok(),
            WorkerKind::Burst => match tokio::time::timeout(self.config.keep_alive, self.rx.recv()).await {
                Ok(job) => job.ok(),
                Err(_) => {
                    tracing::trace!("Burst worker idle, retiring");
                    None
                }
            },
        }
    }

    async fn run(&self, job: Job) {
        match AssertUnwindSafe(job).catch_unwind().await {
            Ok(()) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(panic) => {
                self.panicked.fetch_add(1, Ordering::Relaxed);
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".into());
                tracing::error!(panic = %message, "Pool task panicked");
            }
        }
    }
}

/// Releases the worker's slot however the worker exits.
struct WorkerSlot(Arc<Shared>);

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.0.workers.send_modify(|n| *n = n.saturating_sub(1));
    }
}

struct ControlSlot(Arc<Shared>);

impl Drop for ControlSlot {
    fn drop(&mut self) {
        self.0.control.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn small(overflow: OverflowPolicy) -> PoolConfig {
        PoolConfig { core_size: 1, max_size: 2, keep_alive: Duration::from_millis(50), backlog: 1, overflow }
    }

    fn gate() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    fn blocked(rx: &watch::Receiver<bool>) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = rx.clone();
        async move {
            let _ = rx.wait_for(|open| *open).await;
        }
    }

    #[test]
    fn test_invalid_config() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let bad = PoolConfig { core_size: 4, max_size: 2, ..PoolConfig::default() };
        assert!(matches!(WorkerPool::with_handle(bad, rt.handle().clone()), Err(PoolError::InvalidConfig(_))));
        let no_backlog = PoolConfig { backlog: 0, ..PoolConfig::default() };
        assert!(matches!(WorkerPool::with_handle(no_backlog, rt.handle().clone()), Err(PoolError::InvalidConfig(_))));
    }

    #[test]
    fn test_new_outside_runtime() {
        assert!(matches!(WorkerPool::new(PoolConfig::default()), Err(PoolError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_runs_tasks() {
        let pool = WorkerPool::new(PoolConfig::default()).unwrap();
        let (tx, rx) = oneshot::channel();
        pool.submit(async move {
            let _ = tx.send(42);
        })
        .unwrap();
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_overflow_rejects_when_saturated() {
        let pool = WorkerPool::new(small(OverflowPolicy::Reject)).unwrap();
        let (open, rx) = gate();

        pool.submit(blocked(&rx)).unwrap(); // core worker
        pool.submit(blocked(&rx)).unwrap(); // backlog
        pool.submit(blocked(&rx)).unwrap(); // burst worker
        let err = pool.submit(blocked(&rx)).unwrap_err();
        assert!(matches!(err, PoolError::Saturated { workers: 2, queued: 1 }));

        open.send_replace(true);
        pool.shutdown().await;
        assert_eq!(pool.stats().completed, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overflow_caller_blocks_until_space() {
        let pool = WorkerPool::new(small(OverflowPolicy::CallerBlocks)).unwrap();
        let (open, rx) = gate();

        for _ in 0..3 {
            pool.submit(blocked(&rx)).unwrap();
        }

        let submitter = {
            let pool = pool.clone();
            tokio::task::spawn_blocking(move || pool.submit(async {}))
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!submitter.is_finished());

        open.send_replace(true);
        submitter.await.unwrap().unwrap();
        pool.shutdown().await;
        assert_eq!(pool.stats().completed, 4);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new(PoolConfig { core_size: 1, max_size: 1, ..PoolConfig::default() }).unwrap();
        pool.submit(async {
            if true {
                panic!("boom");
            }
        })
        .unwrap();

        let (tx, rx) = oneshot::channel();
        pool.submit(async move {
            let _ = tx.send(());
        })
        .unwrap();
        rx.await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.workers, 1);
    }

    #[tokio::test]
    async fn test_burst_worker_retires_after_keep_alive() {
        let pool = WorkerPool::new(small(OverflowPolicy::Reject)).unwrap();
        let (open, rx) = gate();
        for _ in 0..3 {
            pool.submit(blocked(&rx)).unwrap();
        }
        assert_eq!(pool.stats().workers, 2);

        open.send_replace(true);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.stats().workers, 1);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let pool = WorkerPool::new(PoolConfig::default()).unwrap();
        pool.shutdown().await;
        assert!(pool.is_closed());
        assert!(matches!(pool.submit(async {}), Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn test_control_task_runs_while_saturated() {
        let pool = WorkerPool::new(small(OverflowPolicy::Reject)).unwrap();
        let (open, rx) = gate();
        for _ in 0..3 {
            pool.submit(blocked(&rx)).unwrap();
        }
        assert!(pool.submit(async {}).is_err());

        let (tx, done) = oneshot::channel();
        pool.spawn_control(async move {
            let _ = tx.send(());
        })
        .unwrap();
        tokio::time::timeout(Duration::from_secs(5), done).await.unwrap().unwrap();

        open.send_replace(true);
        pool.shutdown().await;
        let stats = pool.stats();
        assert_eq!(stats.control, 0);
        assert_eq!(stats.completed, 4);
        assert!(matches!(pool.spawn_control(async {}), Err(PoolError::Closed)));
    }
}
