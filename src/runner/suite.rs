//! Drives a whole suite through its lifecycle.
//!
//! `run()` notifies suite listeners in comparator order, executes the
//! guarded suite body, then notifies the same listeners in exact reverse
//! order. The body never escapes the guard: failures and panics inside it
//! are logged, so `on_finish` and the reporters always fire.
//!
//! The body itself collects the distinct before-suite and after-suite
//! configuration methods across all contained test runners, invokes the
//! before hooks with the suite parameters, dispatches the runners either
//! sequentially in declared order or over a fresh pool bounded by the
//! suite deadline, and invokes the after hooks with the merged parameter
//! map of the suite and every test. Results are recorded under a
//! dedicated lock as runners finish, in any order, and exposed afterwards
//! keyed by test name in declared order.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::attributes::Attributes;
use crate::config::schema::{
    ParallelMode, ParameterMap, RuntimeOptions, SuiteDescription, TestDescription,
};
use crate::error::{CoreError, CoreResult};
use crate::exec::pool::{DefaultPoolFactory, PoolFactory, PoolJob, WorkerPool};
use crate::invoke::{
    ConfigInvoker, NoopConfigInvoker, ObjectFactoryChain, ParameterResolver, PositionalResolver,
    TestInvoker,
};
use crate::listener::{ListenerRegistry, SuiteListener, SuiteListenerComparator, notify_each};
use crate::method::{MethodId, MethodKind, TestMethod};
use crate::result::{InvokedMethod, ResultBuckets, SuiteResults, TestRunOutcome};
use crate::runner::test::{DefaultTestRunnerFactory, TestRunnerFactory};
use crate::runner::{RunContext, TestRunner};

/// Builder for a [`SuiteRunner`].
///
/// A test invoker is mandatory; every other collaborator has a stock
/// default. Tests are bound with [`SuiteRunnerBuilder::test`] in declared
/// order.
pub struct SuiteRunnerBuilder {
    desc: SuiteDescription,
    options: RuntimeOptions,
    invoker: Option<Arc<dyn TestInvoker>>,
    config_invoker: Arc<dyn ConfigInvoker>,
    resolver: Arc<dyn ParameterResolver>,
    listeners: Arc<ListenerRegistry>,
    pool_factory: Arc<dyn PoolFactory>,
    object_factory: ObjectFactoryChain,
    runner_factory: Arc<dyn TestRunnerFactory>,
    listener_comparator: Option<SuiteListenerComparator>,
    tests: Vec<(TestDescription, Vec<Arc<TestMethod>>)>,
}

impl SuiteRunnerBuilder {
    fn new(desc: SuiteDescription) -> Self {
        Self {
            desc,
            options: RuntimeOptions::default(),
            invoker: None,
            config_invoker: Arc::new(NoopConfigInvoker),
            resolver: Arc::new(PositionalResolver),
            listeners: Arc::new(ListenerRegistry::new()),
            pool_factory: Arc::new(DefaultPoolFactory),
            object_factory: ObjectFactoryChain::default(),
            runner_factory: Arc::new(DefaultTestRunnerFactory),
            listener_comparator: None,
            tests: Vec::new(),
        }
    }

    /// Sets the behaviour flags.
    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the test invoker. Mandatory.
    pub fn invoker(mut self, invoker: Arc<dyn TestInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Sets the configuration invoker.
    pub fn config_invoker(mut self, invoker: Arc<dyn ConfigInvoker>) -> Self {
        self.config_invoker = invoker;
        self
    }

    /// Sets the parameter resolver.
    pub fn resolver(mut self, resolver: Arc<dyn ParameterResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Sets the listener registry, typically pre-populated.
    pub fn listeners(mut self, listeners: Arc<ListenerRegistry>) -> Self {
        self.listeners = listeners;
        self
    }

    /// Sets the pool factory.
    pub fn pool_factory(mut self, factory: Arc<dyn PoolFactory>) -> Self {
        self.pool_factory = factory;
        self
    }

    /// Sets the object factory chain.
    pub fn object_factory(mut self, factory: ObjectFactoryChain) -> Self {
        self.object_factory = factory;
        self
    }

    /// Sets the test runner factory.
    pub fn runner_factory(mut self, factory: Arc<dyn TestRunnerFactory>) -> Self {
        self.runner_factory = factory;
        self
    }

    /// Sets the ordering of suite listener notifications.
    pub fn listener_comparator(mut self, comparator: SuiteListenerComparator) -> Self {
        self.listener_comparator = Some(comparator);
        self
    }

    /// Binds one test declaration and its materialised methods. Declared
    /// order is the order of these calls.
    pub fn test(mut self, desc: TestDescription, methods: Vec<Arc<TestMethod>>) -> Self {
        self.tests.push((desc, methods));
        self
    }

    /// Builds the runner.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the invoker is missing or the
    /// resulting suite description fails validation.
    pub fn build(self) -> CoreResult<SuiteRunner> {
        let invoker = self.invoker.ok_or_else(|| {
            CoreError::Config(format!("suite '{}' requires a test invoker", self.desc.name))
        })?;

        let mut desc = self.desc;
        desc.tests = self
            .tests
            .iter()
            .enumerate()
            .map(|(index, (test, _))| {
                let mut test = test.clone();
                test.index = index;
                test
            })
            .collect();
        desc.validate()?;

        // Dependency mistakes (cycles, dangling targets) fail construction,
        // not the run.
        for (_, methods) in &self.tests {
            let tests: Vec<Arc<TestMethod>> = methods
                .iter()
                .filter(|method| method.kind == MethodKind::Test)
                .cloned()
                .collect();
            crate::runner::test::build_graph(&tests)?;
        }

        let ctx = Arc::new(RunContext::new(
            desc,
            self.options,
            invoker,
            self.config_invoker,
            self.resolver,
            self.listeners,
            self.pool_factory,
            self.object_factory,
        ));

        let mut runners = Vec::new();
        let mut runner_names = Vec::new();
        let mut methods_by_runner = Vec::new();
        for (index, (test, methods)) in self.tests.into_iter().enumerate() {
            let mut test = test;
            test.index = index;
            runner_names.push(test.name.clone());
            methods_by_runner.push(methods.clone());
            let runner = self.runner_factory.create(ctx.clone(), test, methods);
            runners.push(Arc::new(tokio::sync::Mutex::new(runner)));
        }

        // Distinct suite-level configuration methods across all runners,
        // first registration wins.
        let before_suite = distinct_methods(&methods_by_runner, MethodKind::BeforeSuite);
        let after_suite = distinct_methods(&methods_by_runner, MethodKind::AfterSuite);

        Ok(SuiteRunner {
            ctx,
            runners,
            runner_names,
            methods_by_runner,
            before_suite,
            after_suite,
            listener_comparator: self.listener_comparator,
            results: SuiteResults::default(),
            suite_configuration_results: ResultBuckets::default(),
            finished: false,
        })
    }
}

/// Collects the methods of `kind` across all runners, de-duplicated by
/// identity with insertion order preserved.
fn distinct_methods(
    methods_by_runner: &[Vec<Arc<TestMethod>>],
    kind: MethodKind,
) -> Vec<Arc<TestMethod>> {
    let mut seen: HashSet<MethodId> = HashSet::new();
    let mut distinct = Vec::new();
    for methods in methods_by_runner {
        for method in methods {
            if method.kind == kind && seen.insert(method.id.clone()) {
                distinct.push(method.clone());
            }
        }
    }
    distinct
}

/// Runs a suite: lifecycle hooks around dispatch of its test runners.
pub struct SuiteRunner {
    ctx: Arc<RunContext>,
    runners: Vec<Arc<tokio::sync::Mutex<TestRunner>>>,
    runner_names: Vec<String>,
    methods_by_runner: Vec<Vec<Arc<TestMethod>>>,
    before_suite: Vec<Arc<TestMethod>>,
    after_suite: Vec<Arc<TestMethod>>,
    listener_comparator: Option<SuiteListenerComparator>,
    results: SuiteResults,
    suite_configuration_results: ResultBuckets,
    finished: bool,
}

impl std::fmt::Debug for SuiteRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuiteRunner")
            .field("name", &self.ctx.suite.name)
            .field("run_id", &self.ctx.run_id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl SuiteRunner {
    /// Starts building a runner for `desc`.
    pub fn builder(desc: SuiteDescription) -> SuiteRunnerBuilder {
        SuiteRunnerBuilder::new(desc)
    }

    /// The suite name.
    pub fn name(&self) -> &str {
        &self.ctx.suite.name
    }

    /// Identifier of this run.
    pub fn run_id(&self) -> Uuid {
        self.ctx.run_id
    }

    /// The suite-wide attribute bag.
    pub fn attributes(&self) -> &Arc<Attributes> {
        &self.ctx.attributes
    }

    /// The listener registry; registrations stay possible between runs of
    /// different suites sharing it.
    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.ctx.listeners
    }

    /// Results keyed by test name in declared order. Complete once
    /// [`SuiteRunner::run`] returned; one entry per bound test.
    pub fn results(&self) -> &SuiteResults {
        &self.results
    }

    /// Results of before-suite and after-suite configuration methods.
    pub fn suite_configuration_results(&self) -> &ResultBuckets {
        &self.suite_configuration_results
    }

    /// Every test-kind method across all bound tests, declared order.
    pub fn all_methods(&self) -> Vec<Arc<TestMethod>> {
        self.methods_by_runner
            .iter()
            .flatten()
            .filter(|method| method.kind == MethodKind::Test)
            .cloned()
            .collect()
    }

    /// The invoked-method log accumulated during the run.
    pub fn all_invoked_methods(&self) -> Vec<InvokedMethod> {
        self.ctx.invoked_methods()
    }

    /// Runs the suite once.
    ///
    /// Failures inside the suite body are logged, never returned: the
    /// lifecycle always completes, `on_finish` mirrors `on_start`, and
    /// reporters receive whatever results were produced.
    ///
    /// # Errors
    ///
    /// Returns a lifecycle error when called a second time.
    pub async fn run(&mut self) -> CoreResult<()> {
        if self.finished {
            return Err(CoreError::Lifecycle(format!(
                "suite '{}' has already run",
                self.ctx.suite.name
            )));
        }
        info!(suite = %self.ctx.suite.name, run_id = %self.ctx.run_id, "starting suite");

        let listeners = self.sorted_suite_listeners();
        let suite = self.ctx.suite.clone();
        notify_each("suite", &listeners, |l| l.on_start(&suite));

        match AssertUnwindSafe(self.private_run()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(suite = %suite.name, "suite body failed: {e}"),
            Err(_) => error!(suite = %suite.name, "suite body panicked"),
        }

        let reversed: Vec<_> = listeners.into_iter().rev().collect();
        notify_each("suite", &reversed, |l| l.on_finish(&suite));

        notify_each("reporter", &self.ctx.listeners.reporter_listeners(), |l| {
            l.generate_report(&suite, &self.results)
        });

        self.finished = true;
        Ok(())
    }

    /// Suite listeners in notification order: registration order, then
    /// the external comparator when one is set.
    fn sorted_suite_listeners(&self) -> Vec<Arc<dyn SuiteListener>> {
        let mut listeners = self.ctx.listeners.suite_listeners();
        if let Some(comparator) = &self.listener_comparator {
            listeners.sort_by(|a, b| comparator(a, b));
        }
        listeners
    }

    async fn private_run(&mut self) -> CoreResult<()> {
        if self.runners.is_empty() {
            debug!(
                suite = %self.ctx.suite.name,
                "suite has no tests; suite-level configuration is bypassed"
            );
            return Ok(());
        }

        if !self.before_suite.is_empty() {
            let methods = self.before_suite.clone();
            let parameters = self.ctx.suite.parameters.clone();
            self.invoke_suite_configurations(&methods, &parameters).await;
        }

        let entries = self.dispatch_runners().await?;

        if !self.after_suite.is_empty() {
            let methods = self.after_suite.clone();
            let parameters = self.merged_suite_parameters();
            self.invoke_suite_configurations(&methods, &parameters).await;
        }

        self.finalise_results(entries);
        Ok(())
    }

    /// Runs the test runners, sequentially or over a fresh pool, and
    /// returns the entries recorded before the deadline.
    async fn dispatch_runners(&mut self) -> CoreResult<Vec<(usize, TestRunOutcome)>> {
        let suite = &self.ctx.suite;
        let parallel = suite.parallel == ParallelMode::Tests
            || (self.ctx.options.strict_parallelism && suite.parallel.is_parallel());

        let entries: Arc<Mutex<Vec<(usize, TestRunOutcome)>>> = Arc::new(Mutex::new(Vec::new()));

        if parallel {
            let pool = self
                .ctx
                .pool_factory
                .create(suite.thread_count, &format!("suite-{}", suite.name))?;
            let mut handles = Vec::new();
            for (index, runner) in self.runners.iter().enumerate() {
                let runner = runner.clone();
                let entries = entries.clone();
                let name = self.runner_names[index].clone();
                let job: PoolJob = Box::new(move |_ctx| {
                    Box::pin(async move {
                        let mut guard = runner.lock().await;
                        if let Err(e) = guard.run().await {
                            warn!(test = %name, "test ended early: {e}");
                        }
                        if let Ok(mut entries) = entries.lock() {
                            entries.push((index, guard.outcome().clone()));
                        }
                    })
                });
                match pool.submit(job) {
                    Ok(handle) => handles.push(handle),
                    Err(e) => error!(test = %self.runner_names[index], "not dispatched: {e}"),
                }
            }

            if let Err(e) = WorkerPool::await_all(handles, suite.timeout()).await {
                warn!(suite = %suite.name, "suite deadline passed: {e}");
            }
            // Waits for cancelled jobs to unwind so partial outcomes are
            // readable below.
            pool.shutdown().await;
        } else {
            for (index, runner) in self.runners.iter().enumerate() {
                let mut guard = runner.lock().await;
                if let Err(e) = guard.run().await {
                    warn!(test = %self.runner_names[index], "test ended early: {e}");
                }
                if let Ok(mut entries) = entries.lock() {
                    entries.push((index, guard.outcome().clone()));
                }
            }
        }

        Ok(entries
            .lock()
            .map(|mut entries| std::mem::take(&mut *entries))
            .unwrap_or_default())
    }

    /// Builds the final result map in declared order. Runners that missed
    /// the deadline contribute whatever partial outcome they recorded.
    fn finalise_results(&mut self, mut entries: Vec<(usize, TestRunOutcome)>) {
        for index in 0..self.runners.len() {
            let outcome = match entries.iter().position(|(i, _)| *i == index) {
                Some(position) => entries.swap_remove(position).1,
                None => self.runners[index]
                    .try_lock()
                    .map(|runner| runner.outcome().clone())
                    .unwrap_or_default(),
            };
            self.results
                .insert(self.runner_names[index].clone(), outcome);
        }
    }

    async fn invoke_suite_configurations(
        &mut self,
        methods: &[Arc<TestMethod>],
        parameters: &ParameterMap,
    ) {
        for method in methods {
            self.ctx.record_invocation(method);
        }
        let results = self
            .ctx
            .config_invoker
            .invoke_configurations(methods, parameters)
            .await;
        let listeners = self.ctx.listeners.configuration_listeners();
        for result in results {
            match result.status {
                crate::result::TestStatus::Failure => {
                    notify_each("configuration", &listeners, |l| {
                        l.on_configuration_failure(&result)
                    });
                }
                crate::result::TestStatus::Skipped => {
                    notify_each("configuration", &listeners, |l| {
                        l.on_configuration_skip(&result)
                    });
                }
                _ => {
                    notify_each("configuration", &listeners, |l| {
                        l.on_configuration_success(&result)
                    });
                }
            }
            self.suite_configuration_results.record(result);
        }
    }

    /// The suite parameters merged with every test's parameters, in
    /// declared order with later tests overriding earlier ones.
    fn merged_suite_parameters(&self) -> ParameterMap {
        let mut merged = self.ctx.suite.parameters.clone();
        for test in &self.ctx.suite.tests {
            merged.extend(
                test.parameters
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        merged
    }
}
