//! Test method metadata.
//!
//! A [`TestMethod`] is the unit the scheduler works with: one user-defined
//! function plus everything the core needs to place it (kind, groups,
//! dependencies, priority) and to expand it (invocation count, data
//! provider, retry analyzer). How methods are discovered is external; the
//! core receives them fully materialised.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::invoke::{DataProvider, RetryAnalyzer};

/// Identity of a test method: declaring class, name, and signature.
///
/// Two methods are the same iff all three components are equal. The
/// signature defaults to `()` for methods without parameters of their own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodId {
    /// Fully qualified name of the declaring class.
    pub class: String,

    /// Method name inside the class.
    pub name: String,

    /// Parameter signature, used to disambiguate overloads.
    pub signature: String,
}

impl MethodId {
    /// Creates a method identity with the default `()` signature.
    pub fn new(class: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            signature: "()".to_string(),
        }
    }

    /// Sets the parameter signature.
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    /// Returns the `class::name` form used in logs and dependency
    /// declarations.
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.class, self.name)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.class, self.name)
    }
}

/// Where a method sits in the before/after lifecycle.
///
/// `test` methods are scheduled through the dependency graph; every other
/// kind is a configuration method run by the lifecycle layer that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MethodKind {
    /// Runs once before any test of the suite.
    BeforeSuite,
    /// Runs once after every test of the suite.
    AfterSuite,
    /// Runs before the test declaration's graph, on the calling task.
    BeforeTest,
    /// Runs after the test declaration's graph, on the calling task.
    AfterTest,
    /// Runs before the first method of a class.
    BeforeClass,
    /// Runs after the last method of a class.
    AfterClass,
    /// Runs before each test method invocation batch.
    BeforeMethod,
    /// Runs after each test method invocation batch.
    AfterMethod,
    /// A user test method.
    Test,
}

impl MethodKind {
    /// Returns `true` for every kind other than [`MethodKind::Test`].
    pub fn is_configuration(&self) -> bool {
        !matches!(self, MethodKind::Test)
    }
}

/// One user-defined test function with its scheduling metadata.
///
/// Built with the `with_*` setters and then shared behind an `Arc`; the
/// scheduler never mutates a method after construction.
///
/// # Example
///
/// ```
/// use drover::method::{MethodKind, TestMethod};
///
/// let method = TestMethod::new("checkout.CartTest", "adds_item")
///     .with_group("smoke")
///     .with_priority(-10)
///     .with_invocation_count(3);
///
/// assert_eq!(method.kind, MethodKind::Test);
/// assert_eq!(method.invocation_count, 3);
/// ```
#[derive(Serialize, Deserialize)]
pub struct TestMethod {
    /// Identity of the method.
    pub id: MethodId,

    /// Lifecycle kind.
    pub kind: MethodKind,

    /// Groups this method belongs to.
    pub groups: Vec<String>,

    /// Groups this method must wait for.
    pub depends_on_groups: Vec<String>,

    /// Methods this method must wait for, as `name` or `class::name`.
    pub depends_on_methods: Vec<String>,

    /// How many times the method is invoked per parameter row. At least 1.
    pub invocation_count: usize,

    /// Worker count for running the invocation stream concurrently. A
    /// value above 1 switches the method to parallel fan-out.
    pub thread_pool_size: usize,

    /// Scheduling priority; lower values run first among free siblings.
    pub priority: i32,

    /// Minimum percentage of passing invocations for the method to be
    /// reported as failed-within-percentage instead of failed.
    pub success_percentage: Option<u8>,

    /// Method-level request for cascade-skip after its first failure.
    pub skip_failed_invocations: bool,

    /// Per-invocation deadline in milliseconds. `0` means none.
    pub time_out_ms: u64,

    /// Instance key for `instances` parallel mode. Methods sharing a key
    /// are batched onto the same worker.
    pub instance: Option<String>,

    /// Run data-provider rows concurrently instead of in row order.
    pub parallel_data: bool,

    /// Decides whether a failed invocation is re-run.
    #[serde(skip)]
    pub retry_analyzer: Option<Arc<dyn RetryAnalyzer>>,

    /// Produces the parameter rows for this method.
    #[serde(skip)]
    pub data_provider: Option<Arc<dyn DataProvider>>,
}

impl TestMethod {
    /// Creates a test-kind method with default scheduling metadata.
    pub fn new(class: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: MethodId::new(class, name),
            kind: MethodKind::Test,
            groups: Vec::new(),
            depends_on_groups: Vec::new(),
            depends_on_methods: Vec::new(),
            invocation_count: 1,
            thread_pool_size: 1,
            priority: 0,
            success_percentage: None,
            skip_failed_invocations: false,
            time_out_ms: 0,
            instance: None,
            parallel_data: false,
            retry_analyzer: None,
            data_provider: None,
        }
    }

    /// Sets the lifecycle kind.
    pub fn with_kind(mut self, kind: MethodKind) -> Self {
        self.kind = kind;
        self
    }

    /// Adds a group membership.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    /// Adds a group dependency.
    pub fn depends_on_group(mut self, group: impl Into<String>) -> Self {
        self.depends_on_groups.push(group.into());
        self
    }

    /// Adds a method dependency, as `name` or `class::name`.
    pub fn depends_on_method(mut self, method: impl Into<String>) -> Self {
        self.depends_on_methods.push(method.into());
        self
    }

    /// Sets the invocation count. Values below 1 are clamped to 1.
    pub fn with_invocation_count(mut self, count: usize) -> Self {
        self.invocation_count = count.max(1);
        self
    }

    /// Sets the fan-out worker count. Values below 1 are clamped to 1.
    pub fn with_thread_pool_size(mut self, size: usize) -> Self {
        self.thread_pool_size = size.max(1);
        self
    }

    /// Sets the scheduling priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the failed-within-percentage threshold.
    pub fn with_success_percentage(mut self, percentage: u8) -> Self {
        self.success_percentage = Some(percentage.min(100));
        self
    }

    /// Requests cascade-skip for this method after its first failure.
    pub fn with_skip_failed_invocations(mut self) -> Self {
        self.skip_failed_invocations = true;
        self
    }

    /// Sets the per-invocation deadline in milliseconds.
    pub fn with_time_out_ms(mut self, ms: u64) -> Self {
        self.time_out_ms = ms;
        self
    }

    /// Sets the instance key used by `instances` parallel mode.
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Runs data-provider rows concurrently.
    pub fn with_parallel_data(mut self) -> Self {
        self.parallel_data = true;
        self
    }

    /// Attaches a retry analyzer.
    pub fn with_retry_analyzer(mut self, analyzer: Arc<dyn RetryAnalyzer>) -> Self {
        self.retry_analyzer = Some(analyzer);
        self
    }

    /// Attaches a data provider.
    pub fn with_data_provider(mut self, provider: Arc<dyn DataProvider>) -> Self {
        self.data_provider = Some(provider);
        self
    }

    /// Returns `true` when this method's invocation stream should run
    /// concurrently.
    pub fn runs_rows_in_parallel(&self) -> bool {
        self.parallel_data || self.thread_pool_size > 1
    }

    /// Returns the batching key for `instances` parallel mode.
    pub fn instance_key(&self) -> &str {
        self.instance.as_deref().unwrap_or(&self.id.class)
    }
}

impl fmt::Debug for TestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestMethod")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("groups", &self.groups)
            .field("depends_on_groups", &self.depends_on_groups)
            .field("depends_on_methods", &self.depends_on_methods)
            .field("invocation_count", &self.invocation_count)
            .field("thread_pool_size", &self.thread_pool_size)
            .field("priority", &self.priority)
            .field("retry_analyzer", &self.retry_analyzer.is_some())
            .field("data_provider", &self.data_provider.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_count_is_clamped() {
        let method = TestMethod::new("C", "m").with_invocation_count(0);
        assert_eq!(method.invocation_count, 1);
    }

    #[test]
    fn qualified_name_joins_class_and_name() {
        let id = MethodId::new("pkg.Cls", "does_thing");
        assert_eq!(id.qualified_name(), "pkg.Cls::does_thing");
    }

    #[test]
    fn instance_key_falls_back_to_class() {
        let plain = TestMethod::new("C", "m");
        assert_eq!(plain.instance_key(), "C");
        let keyed = TestMethod::new("C", "m").with_instance("C#2");
        assert_eq!(keyed.instance_key(), "C#2");
    }

    #[test]
    fn configuration_kinds() {
        assert!(MethodKind::BeforeSuite.is_configuration());
        assert!(MethodKind::AfterMethod.is_configuration());
        assert!(!MethodKind::Test.is_configuration());
    }
}
