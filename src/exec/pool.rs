//! Bounded worker pool built from serial lanes.
//!
//! A [`WorkerPool`] owns `N` lanes. Each lane is a dedicated task draining
//! its own unbounded FIFO queue, so the pool gives bounded concurrency,
//! per-lane ordering, and a stable lane identity that affinity pinning can
//! target. Lanes are the async counterpart of pool threads.
//!
//! Every lane name embeds the [`LANE_MARKER`], and the lane identity is
//! published through a task-local so external code can answer "am I on a
//! framework lane?" via [`on_framework_lane`] or read the identity with
//! [`current_lane`].
//!
//! Cancellation is cooperative: [`WorkerPool::await_all`] cancels
//! outstanding jobs when its deadline passes, and a running job is dropped
//! at its next await point.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// Marker embedded in every lane name so external code can recognise
/// framework lanes.
pub const LANE_MARKER: &str = "drover";

/// 1-based identifier of a pool lane. `0` means "any lane" in submission
/// APIs and never identifies a real lane.
pub type LaneId = usize;

/// Identity of the lane the current task runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneInfo {
    /// 1-based lane id inside its pool.
    pub id: LaneId,

    /// Lane name, containing [`LANE_MARKER`].
    pub name: String,
}

tokio::task_local! {
    static CURRENT_LANE: LaneInfo;
}

/// Returns the identity of the lane the calling task runs on, if any.
pub fn current_lane() -> Option<LaneInfo> {
    CURRENT_LANE.try_with(|lane| lane.clone()).ok()
}

/// Returns `true` when the calling task runs on a pool lane.
pub fn on_framework_lane() -> bool {
    current_lane().is_some()
}

/// Handed to a job when a lane picks it up.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The lane executing the job.
    pub lane: LaneId,

    /// Cooperative cancellation signal for this job.
    pub cancel: CancellationToken,
}

/// A unit of work accepted by the pool.
pub type PoolJob = Box<dyn FnOnce(JobContext) -> BoxFuture<'static, ()> + Send + 'static>;

struct Submission {
    job: PoolJob,
    cancel: CancellationToken,
    done: oneshot::Sender<()>,
}

/// Awaitable handle for one submitted job.
#[derive(Debug)]
pub struct TaskHandle {
    done: oneshot::Receiver<()>,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// Signals cooperative cancellation to the job. A queued job is
    /// discarded; a running job stops at its next await point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A clone of the job's cancellation token, usable after the handle
    /// has been consumed by a join.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits until the job finishes, is discarded, or is cancelled.
    pub async fn join(self) {
        let _ = self.done.await;
    }
}

#[derive(Debug)]
struct PoolShared {
    name: String,
    size: usize,
    senders: Mutex<Option<Vec<mpsc::UnboundedSender<Submission>>>>,
    drivers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    next_lane: AtomicUsize,
    cancel_all: CancellationToken,
}

/// Bounded executor with awaitable submission and cooperative shutdown.
///
/// Cloning a `WorkerPool` clones a handle to the same lanes; the reuse
/// policy in [`PoolPolicy`] relies on this to share one pool across
/// fan-outs.
///
/// # Example
///
/// ```no_run
/// use drover::exec::pool::WorkerPool;
///
/// # async fn example() -> drover::CoreResult<()> {
/// let pool = WorkerPool::new(4, "drover-demo")?;
/// let handle = pool.submit(Box::new(|ctx| {
///     Box::pin(async move {
///         println!("running on lane {}", ctx.lane);
///     })
/// }))?;
/// handle.join().await;
/// pool.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct WorkerPool {
    inner: Arc<PoolShared>,
}

impl WorkerPool {
    /// Creates a pool with `size` lanes.
    ///
    /// The pool name is prefixed with [`LANE_MARKER`] when it does not
    /// already contain it, so lane identities are always recognisable.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `size` is below 1.
    pub fn new(size: usize, name: impl Into<String>) -> CoreResult<Self> {
        if size < 1 {
            return Err(CoreError::Config(format!(
                "worker pool requires at least one lane, got {size}"
            )));
        }

        let mut name = name.into();
        if !name.contains(LANE_MARKER) {
            name = format!("{LANE_MARKER}-{name}");
        }

        let cancel_all = CancellationToken::new();
        let mut senders = Vec::with_capacity(size);
        let mut drivers = Vec::with_capacity(size);
        for lane in 1..=size {
            let (tx, rx) = mpsc::unbounded_channel();
            let info = LaneInfo {
                id: lane,
                name: format!("{name}-{lane}"),
            };
            drivers.push(tokio::spawn(lane_loop(info, rx)));
            senders.push(tx);
        }

        Ok(Self {
            inner: Arc::new(PoolShared {
                name,
                size,
                senders: Mutex::new(Some(senders)),
                drivers: tokio::sync::Mutex::new(drivers),
                next_lane: AtomicUsize::new(0),
                cancel_all,
            }),
        })
    }

    /// The pool name, always containing [`LANE_MARKER`].
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of lanes.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Enqueues a job on any lane, round-robin.
    ///
    /// # Errors
    ///
    /// Returns a lifecycle error when the pool has been shut down.
    pub fn submit(&self, job: PoolJob) -> CoreResult<TaskHandle> {
        self.submit_pinned(0, job)
    }

    /// Enqueues a job on a specific lane. Lane `0` means any lane.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a lane id above the pool size and
    /// a lifecycle error when the pool has been shut down.
    pub fn submit_pinned(&self, lane: LaneId, job: PoolJob) -> CoreResult<TaskHandle> {
        let index = match lane {
            0 => self.inner.next_lane.fetch_add(1, Ordering::Relaxed) % self.inner.size,
            pinned if pinned <= self.inner.size => pinned - 1,
            pinned => {
                return Err(CoreError::Config(format!(
                    "lane {pinned} does not exist in pool '{}' of size {}",
                    self.inner.name, self.inner.size
                )));
            }
        };

        let cancel = self.inner.cancel_all.child_token();
        let (done_tx, done_rx) = oneshot::channel();

        let guard = self
            .inner
            .senders
            .lock()
            .map_err(|_| CoreError::Lifecycle("pool state poisoned".to_string()))?;
        let senders = guard.as_ref().ok_or_else(|| {
            CoreError::Lifecycle(format!("submit after shutdown of pool '{}'", self.inner.name))
        })?;
        senders[index]
            .send(Submission {
                job,
                cancel: cancel.clone(),
                done: done_tx,
            })
            .map_err(|_| {
                CoreError::Lifecycle(format!("lane {} of '{}' stopped", index + 1, self.inner.name))
            })?;

        Ok(TaskHandle {
            done: done_rx,
            cancel,
        })
    }

    /// Waits until every handle completes, or until `timeout` elapses.
    ///
    /// On timeout every outstanding job is cancelled cooperatively:
    /// queued jobs are discarded, running jobs stop at their next await
    /// point, and partial results recorded so far stay observable.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Timeout`] when the deadline passed first.
    pub async fn await_all(handles: Vec<TaskHandle>, timeout: Option<Duration>) -> CoreResult<()> {
        let cancels: Vec<CancellationToken> =
            handles.iter().map(|h| h.cancel.clone()).collect();
        let join = futures::future::join_all(handles.into_iter().map(TaskHandle::join));

        match timeout {
            None => {
                join.await;
                Ok(())
            }
            Some(limit) => match tokio::time::timeout(limit, join).await {
                Ok(_) => Ok(()),
                Err(_) => {
                    debug!("await_all deadline of {limit:?} passed, cancelling outstanding jobs");
                    for cancel in cancels {
                        cancel.cancel();
                    }
                    Err(CoreError::Timeout(limit))
                }
            },
        }
    }

    /// Stops accepting work, drains queued jobs, and waits for the lanes
    /// to exit. Idempotent.
    pub async fn shutdown(&self) {
        let senders = self.inner.senders.lock().ok().and_then(|mut s| s.take());
        if senders.is_none() {
            return;
        }
        drop(senders);

        let mut drivers = self.inner.drivers.lock().await;
        for driver in drivers.drain(..) {
            let _ = driver.await;
        }
        debug!("pool '{}' shut down", self.inner.name);
    }

    /// Signals cancellation to every queued and running job, then shuts
    /// the pool down.
    pub async fn shutdown_now(&self) {
        self.inner.cancel_all.cancel();
        self.shutdown().await;
    }
}

async fn lane_loop(info: LaneInfo, mut rx: mpsc::UnboundedReceiver<Submission>) {
    while let Some(submission) = rx.recv().await {
        if !submission.cancel.is_cancelled() {
            let ctx = JobContext {
                lane: info.id,
                cancel: submission.cancel.clone(),
            };
            let job = (submission.job)(ctx);
            let lane = info.id;
            let cancel = submission.cancel.clone();
            // Panics are contained so the lane survives and the handle
            // still resolves.
            let outcome = AssertUnwindSafe(CURRENT_LANE.scope(info.clone(), async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("job on lane {lane} cancelled mid-flight");
                    }
                    _ = job => {}
                }
            }))
            .catch_unwind()
            .await;
            if outcome.is_err() {
                warn!("job on lane {lane} panicked");
            }
        }
        let _ = submission.done.send(());
    }
}

/// Creates worker pools. The counterpart of an injectable executor
/// factory: runners ask this instead of constructing pools directly.
pub trait PoolFactory: Send + Sync {
    /// Creates a pool with `size` lanes named after `name`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid sizes.
    fn create(&self, size: usize, name: &str) -> CoreResult<WorkerPool>;
}

/// The stock pool factory.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPoolFactory;

impl PoolFactory for DefaultPoolFactory {
    fn create(&self, size: usize, name: &str) -> CoreResult<WorkerPool> {
        WorkerPool::new(size, name)
    }
}

/// A leased pool plus the obligation that comes with it: fresh pools are
/// shut down by the holder, shared pools are left running.
pub struct PoolLease {
    pool: WorkerPool,
    owned: bool,
}

impl PoolLease {
    /// The leased pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Releases the lease, shutting the pool down when it was fresh.
    pub async fn release(self) {
        if self.owned {
            self.pool.shutdown().await;
        }
    }
}

/// Pool reuse policy for data-provider fan-outs.
///
/// When sharing is off, every [`PoolPolicy::lease`] creates a fresh pool
/// that the lease shuts down on release. When sharing is on, the first
/// lease creates the shared pool (or reuses an adopted one) and later
/// leases return it; [`PoolPolicy::close`] shuts down a pool the policy
/// created itself, never an adopted one.
pub struct PoolPolicy {
    factory: Arc<dyn PoolFactory>,
    share: bool,
    // (pool, created by this policy)
    shared: Mutex<Option<(WorkerPool, bool)>>,
}

impl PoolPolicy {
    /// Creates a policy. `share` turns on pool reuse across fan-outs.
    pub fn new(factory: Arc<dyn PoolFactory>, share: bool) -> Self {
        Self {
            factory,
            share,
            shared: Mutex::new(None),
        }
    }

    /// Installs an externally owned pool as the shared pool.
    pub fn adopt(&self, pool: WorkerPool) {
        if let Ok(mut shared) = self.shared.lock() {
            *shared = Some((pool, false));
        }
    }

    /// Leases a pool for one fan-out.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a fresh pool cannot be built.
    pub fn lease(&self, size: usize, name: &str) -> CoreResult<PoolLease> {
        if self.share {
            let mut shared = self
                .shared
                .lock()
                .map_err(|_| CoreError::Lifecycle("pool policy state poisoned".to_string()))?;
            if let Some((pool, _)) = shared.as_ref() {
                return Ok(PoolLease {
                    pool: pool.clone(),
                    owned: false,
                });
            }
            let pool = self.factory.create(size, name)?;
            *shared = Some((pool.clone(), true));
            return Ok(PoolLease { pool, owned: false });
        }

        let pool = self.factory.create(size, name)?;
        Ok(PoolLease { pool, owned: true })
    }

    /// Shuts down the shared pool if this policy created it.
    pub async fn close(&self) {
        let created = self
            .shared
            .lock()
            .ok()
            .and_then(|mut shared| shared.take())
            .and_then(|(pool, created)| created.then_some(pool));
        if let Some(pool) = created {
            pool.shutdown().await;
        }
    }
}
