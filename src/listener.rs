//! Listener traits and their registry.
//!
//! Observers are notified laterally at each stage of a run: suite start
//! and finish, each test result, each invocation, configuration outcomes,
//! data-provider fan-outs, class boundaries, plus two sinks that consume
//! whole artefacts (reports and graph renderings).
//!
//! Registration is idempotent per concrete type: registering two instances
//! of the same listener type keeps only the first, while insertion order
//! is preserved across types. A listener that panics is logged and
//! skipped; the remaining listeners still fire.

use std::any::TypeId;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::config::schema::SuiteDescription;
use crate::method::{MethodId, TestMethod};
use crate::result::{SuiteResults, TestResult};

/// The registerable listener categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Suite start/finish observers.
    Suite,
    /// Per-result test observers.
    Test,
    /// Class boundary observers.
    Class,
    /// Per-invocation observers.
    InvokedMethod,
    /// Configuration method observers.
    Configuration,
    /// Data-provider fan-out observers.
    DataProvider,
    /// Final report consumers.
    Reporter,
    /// Execution graph consumers.
    Visualiser,
}

/// Observes the suite lifecycle.
pub trait SuiteListener: Send + Sync + 'static {
    /// Called once before the suite's guarded run begins.
    fn on_start(&self, suite: &SuiteDescription);

    /// Called once after the guarded run ends, in reverse registration
    /// order relative to `on_start`.
    fn on_finish(&self, suite: &SuiteDescription);
}

/// Observes individual test results as they are recorded.
pub trait TestListener: Send + Sync + 'static {
    /// An invocation of `method` is about to run.
    fn on_test_start(&self, _method: &MethodId) {}

    /// A test invocation passed.
    fn on_test_success(&self, _result: &TestResult) {}

    /// A test invocation failed.
    fn on_test_failure(&self, _result: &TestResult) {}

    /// A test invocation was skipped.
    fn on_test_skipped(&self, _result: &TestResult) {}

    /// A test invocation failed within its method's success percentage.
    fn on_test_failed_within_percentage(&self, _result: &TestResult) {}
}

/// Observes class boundaries inside a test declaration.
pub trait ClassListener: Send + Sync + 'static {
    /// The first method of `class` is about to run.
    fn on_before_class(&self, _class: &str) {}

    /// The last method of `class` has finished.
    fn on_after_class(&self, _class: &str) {}
}

/// Observes every method invocation, test and configuration alike.
pub trait InvokedMethodListener: Send + Sync + 'static {
    /// Called immediately before an invocation is handed to the invoker.
    fn before_invocation(&self, _method: &Arc<TestMethod>, _row_index: Option<usize>) {}

    /// Called immediately after the invoker reported a result.
    fn after_invocation(&self, _method: &Arc<TestMethod>, _result: &TestResult) {}
}

/// Observes configuration method outcomes.
pub trait ConfigurationListener: Send + Sync + 'static {
    /// A configuration method passed.
    fn on_configuration_success(&self, _result: &TestResult) {}

    /// A configuration method failed.
    fn on_configuration_failure(&self, _result: &TestResult) {}

    /// A configuration method was skipped.
    fn on_configuration_skip(&self, _result: &TestResult) {}
}

/// Observes data-provider fan-outs.
pub trait DataProviderListener: Send + Sync + 'static {
    /// `method` is about to be expanded into `rows` invocations.
    fn before_fan_out(&self, _method: &Arc<TestMethod>, _rows: usize) {}

    /// The fan-out of `method` has completed.
    fn after_fan_out(&self, _method: &Arc<TestMethod>) {}
}

/// Consumes the final results of a suite. Rendering is external; the core
/// only hands over the aggregate.
pub trait ReporterListener: Send + Sync + 'static {
    /// Called once after `on_finish`, with the complete result map.
    fn generate_report(&self, suite: &SuiteDescription, results: &SuiteResults);
}

/// Consumes a GraphViz rendering of each test's execution graph.
pub trait ExecutionVisualiser: Send + Sync + 'static {
    /// Receives the DOT text of one test's method graph.
    fn consume_dot(&self, dot: &str);
}

/// Stable ordering hook for suite listeners; `on_start` fires in this
/// order and `on_finish` in its exact reverse.
pub type SuiteListenerComparator =
    Arc<dyn Fn(&Arc<dyn SuiteListener>, &Arc<dyn SuiteListener>) -> Ordering + Send + Sync>;

/// One listener category: insertion-ordered entries with per-type
/// deduplication.
struct Slot<T: ?Sized> {
    entries: Vec<Arc<T>>,
    seen: HashSet<TypeId>,
}

impl<T: ?Sized> Default for Slot<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            seen: HashSet::new(),
        }
    }
}

impl<T: ?Sized> Slot<T> {
    /// Registers `listener` under `key`. Returns `false` when the type
    /// was already registered.
    fn register(&mut self, key: TypeId, listener: Arc<T>) -> bool {
        if self.seen.insert(key) {
            self.entries.push(listener);
            true
        } else {
            false
        }
    }

    fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries.clone()
    }
}

/// Registry of all listener categories for one suite run.
///
/// Reads take a snapshot, so listeners registered while a notification is
/// in flight are picked up from the next notification on.
#[derive(Default)]
pub struct ListenerRegistry {
    suite: RwLock<Slot<dyn SuiteListener>>,
    test: RwLock<Slot<dyn TestListener>>,
    class: RwLock<Slot<dyn ClassListener>>,
    invoked: RwLock<Slot<dyn InvokedMethodListener>>,
    configuration: RwLock<Slot<dyn ConfigurationListener>>,
    data_provider: RwLock<Slot<dyn DataProviderListener>>,
    reporter: RwLock<Slot<dyn ReporterListener>>,
    visualiser: RwLock<Slot<dyn ExecutionVisualiser>>,
}

macro_rules! registry_slot {
    ($register:ident, $snapshot:ident, $field:ident, $trait:ident) => {
        /// Registers a listener. Returns `false` when another instance of
        /// the same concrete type was registered earlier.
        pub fn $register<L: $trait>(&self, listener: Arc<L>) -> bool {
            self.$field
                .write()
                .map(|mut slot| slot.register(TypeId::of::<L>(), listener))
                .unwrap_or(false)
        }

        /// Snapshot of the registered listeners in registration order.
        pub fn $snapshot(&self) -> Vec<Arc<dyn $trait>> {
            self.$field
                .read()
                .map(|slot| slot.snapshot())
                .unwrap_or_default()
        }
    };
}

impl ListenerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    registry_slot!(register_suite, suite_listeners, suite, SuiteListener);
    registry_slot!(register_test, test_listeners, test, TestListener);
    registry_slot!(register_class, class_listeners, class, ClassListener);
    registry_slot!(
        register_invoked_method,
        invoked_method_listeners,
        invoked,
        InvokedMethodListener
    );
    registry_slot!(
        register_configuration,
        configuration_listeners,
        configuration,
        ConfigurationListener
    );
    registry_slot!(
        register_data_provider,
        data_provider_listeners,
        data_provider,
        DataProviderListener
    );
    registry_slot!(register_reporter, reporter_listeners, reporter, ReporterListener);
    registry_slot!(
        register_visualiser,
        visualiser_listeners,
        visualiser,
        ExecutionVisualiser
    );
}

/// Invokes `f` on each listener, isolating panics so one misbehaving
/// listener cannot silence the others.
pub(crate) fn notify_each<T: ?Sized, F>(kind: &str, listeners: &[Arc<T>], mut f: F)
where
    F: FnMut(&T),
{
    for listener in listeners {
        let call = AssertUnwindSafe(|| f(listener.as_ref()));
        if std::panic::catch_unwind(call).is_err() {
            warn!("{kind} listener panicked; continuing with the rest");
        }
    }
}
