//! Interfaces the core consumes.
//!
//! The execution core never calls user test code directly. Everything that
//! touches user functions, fixtures, or instances goes through the traits
//! in this module, implemented by the hosting framework: the
//! [`TestInvoker`] runs test methods, the [`ConfigInvoker`] runs
//! before/after methods, the [`ParameterResolver`] turns raw rows into
//! positional arguments, and the [`ObjectFactory`] chain builds test class
//! instances.
//!
//! The contract mirrors the error policy of the whole crate: an invoker
//! must capture user exceptions into a failed [`TestResult`] and never
//! return an error to the scheduler.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::config::schema::ParameterMap;
use crate::error::CoreResult;
use crate::method::TestMethod;
use crate::result::TestResult;

/// One tuple of arguments produced by a data provider.
pub type ParameterRow = Vec<Value>;

/// An instantiated test class, opaque to the core.
pub type TestObject = Arc<dyn Any + Send + Sync>;

/// Running tally of failures for one method's invocation stream.
///
/// The sequential method runner threads this through its invocations; the
/// invoker's retry hook updates it, and a success that clears the slate
/// should call [`FailureContext::clear`].
#[derive(Debug, Clone, Default)]
pub struct FailureContext {
    failed_rows: Vec<usize>,
}

impl FailureContext {
    /// Records one failed invocation.
    pub fn record_failure(&mut self, row_index: Option<usize>) {
        self.failed_rows.push(row_index.unwrap_or(0));
    }

    /// Number of failures recorded so far.
    pub fn failure_count(&self) -> usize {
        self.failed_rows.len()
    }

    /// Row indices that failed, in failure order.
    pub fn failed_rows(&self) -> &[usize] {
        &self.failed_rows
    }

    /// Forgets all recorded failures.
    pub fn clear(&mut self) {
        self.failed_rows.clear();
    }
}

/// Everything an invoker needs to run one invocation of one method.
pub struct InvocationArgs<'a> {
    /// The method being invoked.
    pub method: &'a Arc<TestMethod>,

    /// Positional arguments after parameter injection.
    pub arguments: &'a [Value],

    /// Index of the parameter row these arguments came from.
    pub row_index: Option<usize>,

    /// Named parameters visible to the invocation (suite merged with test).
    pub parameters: &'a ParameterMap,

    /// Instance of the declaring class, if one was built.
    pub instance: Option<&'a TestObject>,
}

/// Runs test methods and reports their results.
///
/// # Thread Safety
///
/// Invokers must be `Send + Sync`; the scheduler calls them concurrently
/// from many pool lanes.
#[async_trait]
pub trait TestInvoker: Send + Sync {
    /// Runs one invocation and reports its result.
    ///
    /// User exceptions must be captured into a [`TestResult`] with failure
    /// status; this method has no error path back to the scheduler.
    async fn invoke_test_method(
        &self,
        args: &InvocationArgs<'_>,
        ctx: &FailureContext,
    ) -> TestResult;

    /// Retry hook, called after a failed invocation was recorded.
    ///
    /// Implementations consult the method's retry analyzer, re-invoke as
    /// often as it allows, append every retry result to `results`, and
    /// update `ctx` (clearing it when a retry succeeds).
    async fn retry_failed(
        &self,
        args: &InvocationArgs<'_>,
        results: &mut Vec<TestResult>,
        failure_count: usize,
        ctx: &mut FailureContext,
    );

    /// Synthesises a skipped result without running the method.
    fn register_skipped_result(
        &self,
        method: &Arc<TestMethod>,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> TestResult;

    /// Notifies skip observers about a synthesised skipped invocation.
    fn invoke_listeners_for_skipped(&self, result: &TestResult, method: &Arc<TestMethod>);
}

/// Runs batches of configuration methods.
#[async_trait]
pub trait ConfigInvoker: Send + Sync {
    /// Runs the given configuration methods in order with the given
    /// parameters, reporting one result per method.
    ///
    /// Exceptions in configuration code are captured into failure results,
    /// never returned.
    async fn invoke_configurations(
        &self,
        methods: &[Arc<TestMethod>],
        parameters: &ParameterMap,
    ) -> Vec<TestResult>;
}

/// Configuration invoker that runs nothing and reports nothing.
///
/// The default for suites whose lifecycle methods live entirely outside
/// the core.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConfigInvoker;

#[async_trait]
impl ConfigInvoker for NoopConfigInvoker {
    async fn invoke_configurations(
        &self,
        _methods: &[Arc<TestMethod>],
        _parameters: &ParameterMap,
    ) -> Vec<TestResult> {
        Vec::new()
    }
}

/// Resolves a raw parameter row into the positional arguments of one
/// invocation.
pub trait ParameterResolver: Send + Sync {
    /// Produces the argument vector for `method` from `row`. A `None` row
    /// means the method takes no data-driven arguments.
    fn inject_parameters(
        &self,
        row: Option<&ParameterRow>,
        method: &Arc<TestMethod>,
        parameters: &ParameterMap,
    ) -> Vec<Value>;
}

/// Resolver that passes the row through verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct PositionalResolver;

impl ParameterResolver for PositionalResolver {
    fn inject_parameters(
        &self,
        row: Option<&ParameterRow>,
        _method: &Arc<TestMethod>,
        _parameters: &ParameterMap,
    ) -> Vec<Value> {
        row.cloned().unwrap_or_default()
    }
}

/// Produces the parameter rows for a data-driven method.
pub trait DataProvider: Send + Sync {
    /// The rows to invoke the method with, in order. A `None` row is a
    /// skip marker: it is passed over without producing a result.
    fn provide(&self, method: &Arc<TestMethod>) -> Vec<Option<ParameterRow>>;
}

/// Data provider backed by a fixed list of rows.
#[derive(Debug, Clone, Default)]
pub struct FixedRows {
    rows: Vec<Option<ParameterRow>>,
}

impl FixedRows {
    /// Creates a provider over the given rows.
    pub fn new(rows: Vec<Option<ParameterRow>>) -> Self {
        Self { rows }
    }

    /// Creates a provider where every row is present (no skip markers).
    pub fn of(rows: Vec<ParameterRow>) -> Self {
        Self {
            rows: rows.into_iter().map(Some).collect(),
        }
    }
}

impl DataProvider for FixedRows {
    fn provide(&self, _method: &Arc<TestMethod>) -> Vec<Option<ParameterRow>> {
        self.rows.clone()
    }
}

/// Decides whether a failed invocation should be re-run.
pub trait RetryAnalyzer: Send + Sync {
    /// Returns `true` when the failed `result` should be invoked again.
    fn retry(&self, result: &TestResult) -> bool;
}

/// Builds instances of test classes.
pub trait ObjectFactory: Send + Sync {
    /// Instantiates `class` with the given parameters.
    ///
    /// # Errors
    ///
    /// Returns an error when the class cannot be built; the caller may
    /// fall back to another factory.
    fn new_instance(&self, class: &str, parameters: &ParameterMap) -> anyhow::Result<TestObject>;
}

/// Factory of last resort: a marker instance carrying only the class name.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultObjectFactory;

impl ObjectFactory for DefaultObjectFactory {
    fn new_instance(&self, class: &str, _parameters: &ParameterMap) -> anyhow::Result<TestObject> {
        Ok(Arc::new(class.to_string()))
    }
}

/// Fallback chain of object factories.
///
/// Instantiation tries the suite-supplied factory first, then the
/// configured default, then the built-in marker factory. Each fallback is
/// taken only when the previous factory returned an error.
pub struct ObjectFactoryChain {
    suite_factory: Option<Arc<dyn ObjectFactory>>,
    configured_factory: Option<Arc<dyn ObjectFactory>>,
    builtin: DefaultObjectFactory,
}

impl ObjectFactoryChain {
    /// Creates a chain with neither a suite nor a configured factory.
    pub fn new() -> Self {
        Self {
            suite_factory: None,
            configured_factory: None,
            builtin: DefaultObjectFactory,
        }
    }

    /// Sets the suite-supplied factory, tried first.
    pub fn with_suite_factory(mut self, factory: Arc<dyn ObjectFactory>) -> Self {
        self.suite_factory = Some(factory);
        self
    }

    /// Sets the configured default factory, tried second.
    pub fn with_configured_factory(mut self, factory: Arc<dyn ObjectFactory>) -> Self {
        self.configured_factory = Some(factory);
        self
    }

    /// Instantiates `class`, walking the chain until a factory succeeds.
    ///
    /// # Errors
    ///
    /// Returns the built-in factory's error if every factory failed, which
    /// the built-in never does in practice.
    pub fn try_instantiate(
        &self,
        class: &str,
        parameters: &ParameterMap,
    ) -> CoreResult<TestObject> {
        if let Some(factory) = &self.suite_factory {
            match factory.new_instance(class, parameters) {
                Ok(instance) => return Ok(instance),
                Err(e) => debug!("suite object factory failed for {class}: {e}"),
            }
        }
        if let Some(factory) = &self.configured_factory {
            match factory.new_instance(class, parameters) {
                Ok(instance) => return Ok(instance),
                Err(e) => debug!("configured object factory failed for {class}: {e}"),
            }
        }
        self.builtin
            .new_instance(class, parameters)
            .map_err(Into::into)
    }
}

impl Default for ObjectFactoryChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FailingFactory;

    impl ObjectFactory for FailingFactory {
        fn new_instance(
            &self,
            class: &str,
            _parameters: &ParameterMap,
        ) -> anyhow::Result<TestObject> {
            anyhow::bail!("cannot build {class}")
        }
    }

    struct TaggedFactory(&'static str);

    impl ObjectFactory for TaggedFactory {
        fn new_instance(
            &self,
            _class: &str,
            _parameters: &ParameterMap,
        ) -> anyhow::Result<TestObject> {
            Ok(Arc::new(self.0))
        }
    }

    #[test]
    fn chain_prefers_suite_factory() {
        let chain = ObjectFactoryChain::new()
            .with_suite_factory(Arc::new(TaggedFactory("suite")))
            .with_configured_factory(Arc::new(TaggedFactory("configured")));
        let instance = chain.try_instantiate("C", &ParameterMap::new()).unwrap();
        assert_eq!(
            instance.downcast_ref::<&'static str>().copied(),
            Some("suite")
        );
    }

    #[test]
    fn chain_falls_back_on_error() {
        let chain = ObjectFactoryChain::new()
            .with_suite_factory(Arc::new(FailingFactory))
            .with_configured_factory(Arc::new(TaggedFactory("configured")));
        let instance = chain.try_instantiate("C", &ParameterMap::new()).unwrap();
        assert_eq!(
            instance.downcast_ref::<&'static str>().copied(),
            Some("configured")
        );
    }

    #[test]
    fn chain_bottoms_out_at_builtin() {
        let chain = ObjectFactoryChain::new().with_suite_factory(Arc::new(FailingFactory));
        let instance = chain
            .try_instantiate("pkg.Cls", &ParameterMap::new())
            .unwrap();
        assert_eq!(
            instance.downcast_ref::<String>().map(String::as_str),
            Some("pkg.Cls")
        );
    }

    #[test]
    fn failure_context_tracks_rows() {
        let mut ctx = FailureContext::default();
        assert_eq!(ctx.failure_count(), 0);
        ctx.record_failure(Some(2));
        ctx.record_failure(Some(4));
        assert_eq!(ctx.failure_count(), 2);
        assert_eq!(ctx.failed_rows(), &[2, 4]);
        ctx.clear();
        assert_eq!(ctx.failure_count(), 0);
    }

    #[test]
    fn positional_resolver_passes_rows_through() {
        let method = Arc::new(TestMethod::new("C", "m"));
        let resolver = PositionalResolver;
        let row = vec![json!(1), json!("a")];
        let args = resolver.inject_parameters(Some(&row), &method, &ParameterMap::new());
        assert_eq!(args, row);
        assert!(
            resolver
                .inject_parameters(None, &method, &ParameterMap::new())
                .is_empty()
        );
    }
}
