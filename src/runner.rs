//! The three runner layers: suite, test, and method.
//!
//! This module contains the lifecycle logic above the execution engine.
//! Control flows one way down and results one way up:
//!
//! ```text
//!   SuiteRunner          before/after-suite hooks, test dispatch
//!       │ one per test declaration
//!       ▼
//!   TestRunner           before/after-test hooks, method graph, buckets
//!       │ one per graph node, via the orchestrator
//!       ▼
//!   MethodRunner         row fan-out, retry, cascade-skip
//!       │ one call per parameter row
//!       ▼
//!   TestInvoker          external; runs the user's code
//! ```
//!
//! # Key Components
//!
//! - [`SuiteRunner`]: drives a whole suite through its lifecycle
//! - [`TestRunner`]: converts one test declaration into a method graph
//! - [`MethodRunner`]: expands one method into its invocation stream
//! - [`RunContext`]: suite-wide wiring shared by every layer

pub mod method;
pub mod suite;
pub mod test;

use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::attributes::Attributes;
use crate::config::schema::{ParameterMap, RuntimeOptions, SuiteDescription};
use crate::exec::pool::PoolFactory;
use crate::invoke::{ConfigInvoker, ObjectFactoryChain, ParameterResolver, TestInvoker};
use crate::listener::ListenerRegistry;
use crate::method::TestMethod;
use crate::result::InvokedMethod;

pub use method::MethodRunner;
pub use suite::{SuiteRunner, SuiteRunnerBuilder};
pub use test::{DefaultTestRunnerFactory, ProxyTestRunnerFactory, TestRunner, TestRunnerFactory};

/// Suite-wide wiring shared by every runner layer: the immutable suite
/// description, behaviour flags, external collaborators, listeners, and
/// the cross-cutting state accumulated during the run.
pub struct RunContext {
    /// The suite being run, immutable for the whole run.
    pub suite: SuiteDescription,

    /// Behaviour flags threaded from the entry point.
    pub options: RuntimeOptions,

    /// Runs test methods.
    pub invoker: Arc<dyn TestInvoker>,

    /// Runs configuration methods.
    pub config_invoker: Arc<dyn ConfigInvoker>,

    /// Turns parameter rows into positional arguments.
    pub resolver: Arc<dyn ParameterResolver>,

    /// All registered observers.
    pub listeners: Arc<ListenerRegistry>,

    /// Creates worker pools.
    pub pool_factory: Arc<dyn PoolFactory>,

    /// Builds test class instances.
    pub object_factory: ObjectFactoryChain,

    /// Scratch state shared with listeners and user code.
    pub attributes: Arc<Attributes>,

    /// Identifier of this run, stamped on logs.
    pub run_id: Uuid,

    invoked: Mutex<Vec<InvokedMethod>>,
}

impl RunContext {
    /// Appends one entry to the invoked-method log.
    pub(crate) fn record_invocation(&self, method: &Arc<TestMethod>) {
        if let Ok(mut invoked) = self.invoked.lock() {
            invoked.push(InvokedMethod::now(method.id.clone(), method.kind));
        }
    }

    /// Snapshot of the invoked-method log, in invocation order.
    pub fn invoked_methods(&self) -> Vec<InvokedMethod> {
        self.invoked
            .lock()
            .map(|invoked| invoked.clone())
            .unwrap_or_default()
    }

    /// Wires a context from its collaborators. [`SuiteRunner`] builds one
    /// per run; embedders driving [`TestRunner`] or [`MethodRunner`]
    /// directly construct their own.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        suite: SuiteDescription,
        options: RuntimeOptions,
        invoker: Arc<dyn TestInvoker>,
        config_invoker: Arc<dyn ConfigInvoker>,
        resolver: Arc<dyn ParameterResolver>,
        listeners: Arc<ListenerRegistry>,
        pool_factory: Arc<dyn PoolFactory>,
        object_factory: ObjectFactoryChain,
    ) -> Self {
        Self {
            suite,
            options,
            invoker,
            config_invoker,
            resolver,
            listeners,
            pool_factory,
            object_factory,
            attributes: Arc::new(Attributes::new()),
            run_id: Uuid::new_v4(),
            invoked: Mutex::new(Vec::new()),
        }
    }
}

/// Merges test-level parameters over suite-level ones.
pub(crate) fn merged_parameters(suite: &ParameterMap, test: &ParameterMap) -> ParameterMap {
    let mut merged = suite.clone();
    merged.extend(test.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}
