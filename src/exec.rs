//! The execution engine: pool, graph, and orchestrator.
//!
//! This module contains the scheduling machinery underneath the runners.
//! It knows nothing about suites or methods; it moves opaque work through
//! a dependency graph over a bounded pool.
//!
//! # Architecture
//!
//! ```text
//!        GraphOrchestrator
//!              │
//!   free_nodes()│            ┌────────────────┐
//!              ▼             │   WorkerPool    │
//!        DynamicGraph        │ lane 1  lane 2 …│
//!              │             └───▲─────────▲───┘
//!   WorkerFactory::create_workers│         │
//!              └── Worker ── submit_pinned ┘
//!                                │
//!                        completion channel
//!                                │
//!              set_status(Finished) / yield
//! ```
//!
//! The orchestrator owns all mutable state and runs a single event loop:
//! it schedules every free node, waits for one completion, applies it, and
//! repeats until the graph drains or the deadline passes.
//!
//! # Key Components
//!
//! - [`WorkerPool`]: bounded executor made of serial lanes
//! - [`DynamicGraph`]: mutable DAG with status tracking
//! - [`GraphOrchestrator`]: drains the graph over the pool
//! - [`PhoneyWorker`]: data-only lane hint used for thread affinity

pub mod graph;
pub mod orchestrator;
pub mod pool;

pub use graph::{DynamicGraph, NodeId, NodeStatus};
pub use orchestrator::{
    AffinityHints, GraphOrchestrator, NodeComparator, PhoneyWorker, Worker, WorkerFactory,
};
pub use pool::{
    DefaultPoolFactory, JobContext, LaneId, PoolFactory, PoolJob, PoolLease, PoolPolicy,
    TaskHandle, WorkerPool, current_lane, on_framework_lane,
};
