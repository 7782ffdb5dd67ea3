//! Drains a dependency graph over a worker pool.
//!
//! The orchestrator repeatedly selects free nodes, asks its
//! [`WorkerFactory`] to wrap them in [`Worker`]s, and submits each worker
//! to the pool. When a worker completes, its nodes are finished (or
//! returned to ready after a voluntary yield), newly free successors are
//! computed, and the cycle repeats until every node is finished or the
//! deadline passes.
//!
//! All graph mutation happens inside [`GraphOrchestrator::run`]'s single
//! event loop, so no lock is held across a suspension point: workers only
//! communicate back through a completion channel.
//!
//! # Thread affinity
//!
//! With affinity on, the orchestrator remembers which lane finished each
//! node. When a successor becomes free it records a [`PhoneyWorker`] for
//! it: a data-only placeholder carrying the predecessor's lane. Phoney
//! workers are never submitted; the worker factory reads them through
//! [`AffinityHints`] and pins the real worker to that lane.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{CoreError, CoreResult};
use crate::exec::graph::{DynamicGraph, NodeId, NodeStatus};
use crate::exec::pool::{JobContext, LaneId, PoolJob, WorkerPool};

/// A schedulable unit covering one or more graph nodes.
///
/// Workers are created in batches by a [`WorkerFactory`] and run once on a
/// pool lane. A worker that stops before finishing all of its nodes
/// reports `completed() == false`; under affinity enforcement its nodes
/// return to ready and are rescheduled.
#[async_trait]
pub trait Worker: Send + 'static {
    /// The nodes this worker covers.
    fn nodes(&self) -> &[NodeId];

    /// Lane this worker must run on, if affinity pinned it.
    fn pinned_lane(&self) -> Option<LaneId> {
        None
    }

    /// Runs the covered nodes. `ctx` carries the lane identity and the
    /// cooperative cancellation signal.
    async fn run(&mut self, ctx: &JobContext);

    /// `false` when the worker voluntarily yielded before finishing all
    /// of its nodes.
    fn completed(&self) -> bool {
        true
    }
}

/// Data-only placeholder binding a node to the lane its predecessor ran
/// on. Never submitted; only consulted by worker factories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhoneyWorker {
    /// The lane the real worker must be pinned to.
    pub lane: LaneId,
}

/// Affinity hints for the current scheduling round, keyed by node.
#[derive(Debug, Default)]
pub struct AffinityHints {
    hints: HashMap<NodeId, PhoneyWorker>,
}

impl AffinityHints {
    /// The lane `node` should be pinned to, if a hint was recorded.
    pub fn lane_for(&self, node: NodeId) -> Option<LaneId> {
        self.hints.get(&node).map(|phoney| phoney.lane)
    }

    fn record(&mut self, node: NodeId, phoney: PhoneyWorker) {
        self.hints.entry(node).or_insert(phoney);
    }

    fn contains(&self, node: NodeId) -> bool {
        self.hints.contains_key(&node)
    }
}

/// Orders free sibling nodes before each scheduling round.
pub type NodeComparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Builds workers for a batch of free nodes.
///
/// The factory decides how nodes map onto workers (one each, or grouped
/// by class or instance) and reads [`AffinityHints`] to pin workers.
pub trait WorkerFactory<T>: Send + Sync {
    /// Wraps `free` nodes into workers. Every free node must be covered
    /// by exactly one returned worker.
    fn create_workers(
        &self,
        graph: &DynamicGraph<T>,
        free: &[NodeId],
        hints: &AffinityHints,
    ) -> Vec<Box<dyn Worker>>;
}

struct Completion {
    nodes: Vec<NodeId>,
    lane: LaneId,
    completed: bool,
    panicked: bool,
}

/// Schedules ready nodes onto the pool until the graph drains.
pub struct GraphOrchestrator<T, F> {
    graph: DynamicGraph<T>,
    factory: F,
    pool: WorkerPool,
    comparator: Option<NodeComparator<T>>,
    enforce_affinity: bool,
    timeout: Option<Duration>,
}

impl<T, F> GraphOrchestrator<T, F>
where
    T: Send + Sync + 'static,
    F: WorkerFactory<T>,
{
    /// Creates an orchestrator over `graph`, dispatching through `pool`.
    pub fn new(graph: DynamicGraph<T>, factory: F, pool: WorkerPool) -> Self {
        Self {
            graph,
            factory,
            pool,
            comparator: None,
            enforce_affinity: false,
            timeout: None,
        }
    }

    /// Sets the priority comparator applied to free nodes before each
    /// scheduling round.
    pub fn with_comparator(mut self, comparator: NodeComparator<T>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    /// Pins successors to the lane their predecessor ran on.
    pub fn with_affinity(mut self, enforce: bool) -> Self {
        self.enforce_affinity = enforce;
        self
    }

    /// Bounds the whole drain. `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The graph in its current state.
    pub fn graph(&self) -> &DynamicGraph<T> {
        &self.graph
    }

    /// Drains the graph.
    ///
    /// Returns once every node is finished, shutting the pool down. On
    /// timeout the pool is cancelled cooperatively and the graph is left
    /// in its partial state: nodes still running stay `running`, and
    /// results recorded so far remain observable by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Timeout`] when the deadline passed, or a
    /// lifecycle error when the graph can no longer make progress.
    pub async fn run(&mut self) -> CoreResult<()> {
        let deadline = self
            .timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let (completions_tx, mut completions_rx) = mpsc::unbounded_channel::<Completion>();

        let mut lane_of_node: HashMap<NodeId, LaneId> = HashMap::new();
        let mut hints = AffinityHints::default();
        let mut in_flight = 0usize;

        loop {
            // Schedule every currently free node.
            let mut free = self.graph.free_nodes();
            if let Some(comparator) = &self.comparator {
                free.sort_by(|a, b| comparator(self.graph.payload(*a), self.graph.payload(*b)));
            }
            if !free.is_empty() {
                debug!("scheduling {} free node(s)", free.len());
                let workers = self.factory.create_workers(&self.graph, &free, &hints);
                for worker in workers {
                    for &node in worker.nodes() {
                        self.graph.set_status(node, NodeStatus::Running)?;
                    }
                    let pin = worker.pinned_lane().unwrap_or(0);
                    let job = completion_job(worker, completions_tx.clone());
                    self.pool.submit_pinned(pin, job)?;
                    in_flight += 1;
                }
            }

            if self.graph.node_count() == self.graph.node_count_with_status(NodeStatus::Finished) {
                self.pool.shutdown().await;
                return Ok(());
            }
            if in_flight == 0 {
                return Err(CoreError::Lifecycle(format!(
                    "graph stalled with {} unfinished node(s) and no work in flight",
                    self.graph.node_count() - self.graph.node_count_with_status(NodeStatus::Finished)
                )));
            }

            // Wait for one worker to complete, bounded by the deadline.
            let completion = match deadline {
                Some(at) => match tokio::time::timeout_at(at, completions_rx.recv()).await {
                    Ok(Some(completion)) => completion,
                    Ok(None) => {
                        self.pool.shutdown_now().await;
                        return Err(CoreError::Interrupted(
                            "awaiting worker completions".to_string(),
                        ));
                    }
                    Err(_) => {
                        let timeout = self.timeout.unwrap_or_default();
                        debug!("graph deadline of {timeout:?} passed, cancelling running work");
                        self.pool.shutdown_now().await;
                        return Err(CoreError::Timeout(timeout));
                    }
                },
                None => match completions_rx.recv().await {
                    Some(completion) => completion,
                    None => {
                        // Every sender is gone while work is still marked
                        // running; the pool was torn down under us.
                        self.pool.shutdown_now().await;
                        return Err(CoreError::Interrupted(
                            "awaiting worker completions".to_string(),
                        ));
                    }
                },
            };
            in_flight -= 1;

            if completion.panicked {
                error!(
                    "worker covering nodes {:?} panicked; its nodes are treated as finished",
                    completion.nodes
                );
            }

            let finished = completion.completed || completion.panicked || !self.enforce_affinity;
            for &node in &completion.nodes {
                if finished {
                    self.graph.set_status(node, NodeStatus::Finished)?;
                    lane_of_node.insert(node, completion.lane);
                } else {
                    self.graph.yield_node(node)?;
                }
            }

            if self.enforce_affinity {
                // Record a phoney worker for every newly free successor
                // whose predecessor has a known lane.
                for node in self.graph.free_nodes() {
                    if hints.contains(node) {
                        continue;
                    }
                    let upstream_lane = self
                        .graph
                        .dependencies_of(node)
                        .iter()
                        .find_map(|dep| lane_of_node.get(dep).copied());
                    if let Some(lane) = upstream_lane {
                        hints.record(node, PhoneyWorker { lane });
                    }
                }
            }
        }
    }
}

/// Wraps a worker into a pool job that reports back on the completion
/// channel. A panicking worker is contained here so its lane survives.
fn completion_job(
    mut worker: Box<dyn Worker>,
    completions: mpsc::UnboundedSender<Completion>,
) -> PoolJob {
    let nodes = worker.nodes().to_vec();
    Box::new(move |ctx: JobContext| {
        Box::pin(async move {
            let outcome = AssertUnwindSafe(worker.run(&ctx)).catch_unwind().await;
            let _ = completions.send(Completion {
                nodes,
                lane: ctx.lane,
                completed: worker.completed(),
                panicked: outcome.is_err(),
            });
        })
    })
}
