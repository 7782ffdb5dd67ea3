//! # drover
//!
//! A two-level test scheduler: the execution core of a test-orchestration
//! framework. drover consumes a fully materialised suite description and
//! drives it through a before/after lifecycle, a dependency graph of test
//! methods over a bounded worker pool, and a data-driven invocation
//! fan-out per method, emitting structured results to observers.
//!
//! ## Overview
//!
//! drover coordinates three nested parallelism axes:
//!
//! - **Suite level**: test declarations run sequentially or over a pool
//! - **Test level**: each declaration's methods form a dependency graph
//!   drained by an orchestrator, optionally pinning successors to their
//!   predecessor's lane
//! - **Method level**: each method expands into one invocation per
//!   parameter row, sequentially with retry and cascade-skip or as an
//!   independent parallel fan-out
//!
//! ## Architecture
//!
//! ### Runners ([`runner`])
//!
//! The lifecycle layers: [`SuiteRunner`] drives before/after-suite hooks
//! and dispatches one [`TestRunner`] per declaration; each test runner
//! builds a method graph and collects results into eight buckets; the
//! [`MethodRunner`] expands single methods into invocation streams.
//!
//! ### Execution engine ([`exec`])
//!
//! The scheduling machinery: a lane-based [`WorkerPool`] with awaitable
//! submission and cooperative cancellation, a status-tracked
//! [`DynamicGraph`], and the [`GraphOrchestrator`] draining it.
//!
//! ### Consumed interfaces ([`invoke`])
//!
//! User code is always reached through externally implemented traits:
//! [`invoke::TestInvoker`], [`invoke::ConfigInvoker`],
//! [`invoke::ParameterResolver`], [`invoke::DataProvider`],
//! [`invoke::RetryAnalyzer`], and the [`invoke::ObjectFactory`] chain.
//!
//! ### Observers ([`listener`])
//!
//! Eight listener categories with idempotent per-type registration.
//! Suite `on_finish` notifications run in exact reverse of `on_start`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use drover::config::{SuiteDescription, TestDescription, ParallelMode};
//! use drover::method::TestMethod;
//! use drover::runner::SuiteRunner;
//! # use drover::invoke::TestInvoker;
//! # fn my_invoker() -> Arc<dyn TestInvoker> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let suite = SuiteDescription::new("nightly")
//!         .with_parallel(ParallelMode::Tests)
//!         .with_thread_count(4);
//!
//!     let methods = vec![
//!         Arc::new(TestMethod::new("checkout.CartTest", "adds_item")),
//!         Arc::new(TestMethod::new("checkout.CartTest", "clears").depends_on_method("adds_item")),
//!     ];
//!
//!     let mut runner = SuiteRunner::builder(suite)
//!         .invoker(my_invoker())
//!         .test(TestDescription::new("checkout"), methods)
//!         .build()?;
//!
//!     runner.run().await?;
//!     for (name, outcome) in runner.results().iter() {
//!         println!("{name}: {} passed", outcome.tests.passed.len());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Error policy
//!
//! User-code errors become results, framework errors become logs, and
//! configuration errors become caller-visible failures; see [`error`].
//!
//! [`SuiteRunner`]: runner::SuiteRunner
//! [`TestRunner`]: runner::TestRunner
//! [`MethodRunner`]: runner::MethodRunner
//! [`WorkerPool`]: exec::WorkerPool
//! [`DynamicGraph`]: exec::DynamicGraph
//! [`GraphOrchestrator`]: exec::GraphOrchestrator

pub mod attributes;
pub mod config;
pub mod error;
pub mod exec;
pub mod invoke;
pub mod listener;
pub mod method;
pub mod result;
pub mod runner;

// Re-export commonly used types for convenience.
// These are the types most users will need when embedding drover.

pub use config::{ParallelMode, RuntimeOptions, SuiteDescription, TestDescription, load_config,
    load_config_str};
pub use error::{CoreError, CoreResult};
pub use exec::{DynamicGraph, GraphOrchestrator, WorkerPool};
pub use method::{MethodId, MethodKind, TestMethod};
pub use result::{SuiteResults, TestResult, TestRunOutcome, TestStatus};
pub use runner::{MethodRunner, SuiteRunner, TestRunner};
