//! Runs one test declaration through a graph of its methods.
//!
//! The runner builds a [`DynamicGraph`] of the declaration's test methods
//! (edges from method and group dependencies), chooses the parallelism
//! axis, and hands the graph to a [`GraphOrchestrator`] whose worker
//! factory wraps each node in a [`MethodRunner`] call.
//!
//! Before-test configuration runs on the calling task before the graph
//! starts; after-test configuration runs on the calling task afterwards
//! and is guaranteed even when the graph fails or times out. Before/after
//! class and method configuration wraps execution inside the graph.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::schema::{ParallelMode, ParameterMap, TestDescription};
use crate::error::CoreResult;
use crate::exec::graph::{DynamicGraph, NodeId};
use crate::exec::orchestrator::{
    AffinityHints, GraphOrchestrator, NodeComparator, Worker, WorkerFactory,
};
use crate::exec::pool::{JobContext, LaneId, PoolPolicy};
use crate::invoke::TestObject;
use crate::listener::notify_each;
use crate::method::{MethodKind, TestMethod};
use crate::result::{TestResult, TestRunOutcome, TestStatus};
use crate::runner::{MethodRunner, RunContext, merged_parameters};

/// Converts one test declaration into a method graph and drives it.
pub struct TestRunner {
    ctx: Arc<RunContext>,
    desc: TestDescription,
    methods: Vec<Arc<TestMethod>>,
    parameters: Arc<ParameterMap>,
    outcome: TestRunOutcome,
}

impl TestRunner {
    /// Creates a runner over the given declaration and its materialised
    /// methods.
    pub fn new(ctx: Arc<RunContext>, desc: TestDescription, methods: Vec<Arc<TestMethod>>) -> Self {
        let parameters = Arc::new(merged_parameters(&ctx.suite.parameters, &desc.parameters));
        Self {
            ctx,
            desc,
            methods,
            parameters,
            outcome: TestRunOutcome::default(),
        }
    }

    /// The declaration's name.
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    /// The declaration this runner was built from.
    pub fn description(&self) -> &TestDescription {
        &self.desc
    }

    /// Results collected so far, complete once [`TestRunner::run`]
    /// returned.
    pub fn outcome(&self) -> &TestRunOutcome {
        &self.outcome
    }

    /// The test-kind methods of this declaration, in declared order.
    pub fn test_methods(&self) -> Vec<Arc<TestMethod>> {
        self.methods_of_kind(MethodKind::Test)
    }

    /// Methods of one lifecycle kind, in declared order.
    pub fn methods_of_kind(&self, kind: MethodKind) -> Vec<Arc<TestMethod>> {
        self.methods
            .iter()
            .filter(|method| method.kind == kind)
            .cloned()
            .collect()
    }

    /// Parallelism axis for this declaration. A suite-level `tests` mode
    /// means methods inside each test stay sequential.
    fn parallel_mode(&self) -> ParallelMode {
        self.desc.parallel.unwrap_or(match self.ctx.suite.parallel {
            ParallelMode::Tests => ParallelMode::None,
            other => other,
        })
    }

    fn thread_count(&self) -> usize {
        self.desc.thread_count.unwrap_or(self.ctx.suite.thread_count)
    }

    fn skip_failed_invocations(&self) -> bool {
        self.desc
            .skip_failed_invocation_counts
            .unwrap_or(self.ctx.suite.skip_failed_invocation_counts)
    }

    /// The deadline bounding this declaration's graph. In parallel-tests
    /// mode the suite deadline bounds the suite pool instead.
    fn timeout(&self) -> Option<Duration> {
        match self.desc.time_out_ms {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None if self.ctx.suite.parallel == ParallelMode::Tests => None,
            None => self.ctx.suite.timeout(),
        }
    }

    /// Runs the declaration: before-test hooks, the method graph, then
    /// after-test hooks. After-test configuration runs even when the
    /// graph ended early.
    ///
    /// # Errors
    ///
    /// Returns the graph error (timeout or stall); configuration and user
    /// failures are results, not errors.
    pub async fn run(&mut self) -> CoreResult<()> {
        debug!(test = %self.desc.name, "running test declaration");
        self.run_configurations(MethodKind::BeforeTest).await;
        let graph_result = self.run_graph().await;
        self.run_configurations(MethodKind::AfterTest).await;
        graph_result
    }

    /// Invokes every configuration method of `kind` and records the
    /// results into the configuration buckets.
    async fn run_configurations(&mut self, kind: MethodKind) {
        let methods = self.methods_of_kind(kind);
        if methods.is_empty() {
            return;
        }
        for method in &methods {
            self.ctx.record_invocation(method);
        }
        let results = self
            .ctx
            .config_invoker
            .invoke_configurations(&methods, &self.parameters)
            .await;
        for result in results {
            notify_configuration(&self.ctx, &result);
            self.outcome.configurations.record(result);
        }
    }

    async fn run_graph(&mut self) -> CoreResult<()> {
        let tests = self.test_methods();
        if tests.is_empty() {
            debug!(test = %self.desc.name, "declaration selects no test methods");
            return Ok(());
        }

        let classes = distinct_classes(&tests);
        let mut instances = HashMap::new();
        for class in &classes {
            let instance = self
                .ctx
                .object_factory
                .try_instantiate(class, &self.parameters)?;
            instances.insert(class.clone(), instance);
        }

        for class in &classes {
            notify_each("class", &self.ctx.listeners.class_listeners(), |l| {
                l.on_before_class(class)
            });
        }
        self.run_configurations(MethodKind::BeforeClass).await;

        let graph = build_graph(&tests)?;
        let dot = graph.to_dot(|method| method.id.to_string());
        notify_each(
            "visualiser",
            &self.ctx.listeners.visualiser_listeners(),
            |l| l.consume_dot(&dot),
        );

        let mode = self.parallel_mode();
        let lanes = if mode.is_parallel() {
            self.thread_count()
        } else {
            1
        };
        let pool = self
            .ctx
            .pool_factory
            .create(lanes, &format!("test-{}", self.desc.name))?;

        let share = self.ctx.suite.share_thread_pool_for_data_providers
            || self.ctx.suite.use_global_thread_pool;
        let pools = Arc::new(PoolPolicy::new(self.ctx.pool_factory.clone(), share));
        if self.ctx.suite.use_global_thread_pool {
            pools.adopt(pool.clone());
        }

        let sink: ResultSink = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::new(WorkerShared {
            ctx: self.ctx.clone(),
            parameters: self.parameters.clone(),
            instances: Arc::new(instances),
            pools: pools.clone(),
            sink: sink.clone(),
            skip_failed_invocations: self.skip_failed_invocations(),
            before_method: self.methods_of_kind(MethodKind::BeforeMethod),
            after_method: self.methods_of_kind(MethodKind::AfterMethod),
        });
        let comparator: NodeComparator<Arc<TestMethod>> =
            Arc::new(|a, b| a.priority.cmp(&b.priority));

        let mut orchestrator = GraphOrchestrator::new(
            graph,
            MethodWorkerFactory {
                shared: shared.clone(),
                mode,
            },
            pool,
        )
        .with_comparator(comparator)
        .with_affinity(self.ctx.options.enforce_thread_affinity)
        .with_timeout(self.timeout());

        let graph_result = orchestrator.run().await;
        if let Err(e) = &graph_result {
            warn!(test = %self.desc.name, "graph execution ended early: {e}");
        }
        pools.close().await;

        let collected = sink
            .lock()
            .map(|mut results| std::mem::take(&mut *results))
            .unwrap_or_default();
        self.record_collected(collected);

        self.run_configurations(MethodKind::AfterClass).await;
        for class in &classes {
            notify_each("class", &self.ctx.listeners.class_listeners(), |l| {
                l.on_after_class(class)
            });
        }

        graph_result
    }

    /// Routes collected results into buckets, applying the
    /// failed-within-percentage promotion first.
    fn record_collected(&mut self, collected: Vec<(bool, TestResult)>) {
        let thresholds: HashMap<_, _> = self
            .methods
            .iter()
            .filter_map(|method| {
                method
                    .success_percentage
                    .map(|percentage| (method.id.clone(), percentage))
            })
            .collect();
        let (configurations, tests): (Vec<_>, Vec<_>) =
            collected.into_iter().partition(|(config, _)| *config);
        let tests =
            apply_success_percentage(tests.into_iter().map(|(_, r)| r).collect(), &thresholds);

        for result in tests {
            let listeners = self.ctx.listeners.test_listeners();
            match result.status {
                TestStatus::Success => {
                    notify_each("test", &listeners, |l| l.on_test_success(&result))
                }
                TestStatus::Failure => {
                    notify_each("test", &listeners, |l| l.on_test_failure(&result))
                }
                TestStatus::Skipped => {
                    notify_each("test", &listeners, |l| l.on_test_skipped(&result))
                }
                TestStatus::SuccessWithinPercentage => notify_each("test", &listeners, |l| {
                    l.on_test_failed_within_percentage(&result)
                }),
            }
            self.outcome.tests.record(result);
        }
        for (_, result) in configurations {
            notify_configuration(&self.ctx, &result);
            self.outcome.configurations.record(result);
        }
    }
}

/// Notifies configuration listeners according to the result status.
fn notify_configuration(ctx: &RunContext, result: &TestResult) {
    let listeners = ctx.listeners.configuration_listeners();
    match result.status {
        TestStatus::Failure => {
            notify_each("configuration", &listeners, |l| {
                l.on_configuration_failure(result)
            });
        }
        TestStatus::Skipped => {
            notify_each("configuration", &listeners, |l| {
                l.on_configuration_skip(result)
            });
        }
        _ => {
            notify_each("configuration", &listeners, |l| {
                l.on_configuration_success(result)
            });
        }
    }
}

/// Declaring classes of the given methods, first-seen order.
fn distinct_classes(methods: &[Arc<TestMethod>]) -> Vec<String> {
    let mut classes = Vec::new();
    for method in methods {
        if !classes.contains(&method.id.class) {
            classes.push(method.id.class.clone());
        }
    }
    classes
}

/// Builds the dependency graph of the given test methods.
///
/// Method dependencies accept a bare name or a `class::name` form; group
/// dependencies edge to every member of the group. A dependency that
/// matches nothing is a configuration error, as is any cycle. The suite
/// builder runs this once per declaration so both mistakes fail
/// construction instead of the run.
pub(crate) fn build_graph(tests: &[Arc<TestMethod>]) -> CoreResult<DynamicGraph<Arc<TestMethod>>> {
    let mut graph = DynamicGraph::new();
    let ids: Vec<NodeId> = tests.iter().map(|m| graph.add_node(m.clone())).collect();

    let mut by_name: HashMap<String, Vec<NodeId>> = HashMap::new();
    let mut by_group: HashMap<&str, Vec<NodeId>> = HashMap::new();
    for (node, method) in ids.iter().zip(tests) {
        by_name
            .entry(method.id.name.clone())
            .or_default()
            .push(*node);
        by_name
            .entry(method.id.qualified_name())
            .or_default()
            .push(*node);
        for group in &method.groups {
            by_group.entry(group).or_default().push(*node);
        }
    }

    for (node, method) in ids.iter().zip(tests) {
        for dependency in &method.depends_on_methods {
            let targets = by_name.get(dependency).ok_or_else(|| {
                crate::error::CoreError::Config(format!(
                    "{} depends on unknown method '{dependency}'",
                    method.id
                ))
            })?;
            for &target in targets {
                if target != *node {
                    graph.add_edge(*node, target)?;
                }
            }
        }
        for group in &method.depends_on_groups {
            let targets = by_group.get(group.as_str()).ok_or_else(|| {
                crate::error::CoreError::Config(format!(
                    "{} depends on unknown group '{group}'",
                    method.id
                ))
            })?;
            for &target in targets {
                if target != *node {
                    graph.add_edge(*node, target)?;
                }
            }
        }
    }

    Ok(graph)
}

/// Promotes failures of methods that met their declared success
/// percentage to the failed-within-percentage status.
///
/// `thresholds` maps each percentage-carrying method to its declared
/// minimum pass rate; methods without an entry keep their failures.
fn apply_success_percentage(
    results: Vec<TestResult>,
    thresholds: &HashMap<crate::method::MethodId, u8>,
) -> Vec<TestResult> {
    let mut attempted: HashMap<&crate::method::MethodId, (usize, usize)> = HashMap::new();
    for result in &results {
        if result.status != TestStatus::Skipped {
            let entry = attempted.entry(&result.method).or_default();
            entry.0 += 1;
            if result.status == TestStatus::Success {
                entry.1 += 1;
            }
        }
    }
    let within: std::collections::HashSet<&crate::method::MethodId> = thresholds
        .iter()
        .filter_map(|(method, percentage)| {
            let (total, passed) = attempted.get(method)?;
            (*total > 0 && passed * 100 >= usize::from(*percentage) * total).then_some(method)
        })
        .collect();

    results
        .into_iter()
        .map(|mut result| {
            if result.status == TestStatus::Failure && within.contains(&result.method) {
                result.status = TestStatus::SuccessWithinPercentage;
            }
            result
        })
        .collect()
}

type ResultSink = Arc<Mutex<Vec<(bool, TestResult)>>>;

/// State shared by every worker of one graph run.
struct WorkerShared {
    ctx: Arc<RunContext>,
    parameters: Arc<ParameterMap>,
    instances: Arc<HashMap<String, TestObject>>,
    pools: Arc<PoolPolicy>,
    sink: ResultSink,
    skip_failed_invocations: bool,
    before_method: Vec<Arc<TestMethod>>,
    after_method: Vec<Arc<TestMethod>>,
}

impl WorkerShared {
    async fn run_method(&self, method: &Arc<TestMethod>, job_ctx: &JobContext) {
        self.run_wrapping_configs(&self.before_method).await;

        let mut runner = MethodRunner::new(
            method.clone(),
            self.ctx.clone(),
            self.parameters.clone(),
        )
        .with_skip_failed_invocations(self.skip_failed_invocations);
        if let Some(instance) = self.instances.get(&method.id.class) {
            runner = runner.with_instance(instance.clone());
        }
        let results = runner.run(&self.pools, &job_ctx.cancel).await;
        if let Ok(mut sink) = self.sink.lock() {
            sink.extend(results.into_iter().map(|result| (false, result)));
        }

        self.run_wrapping_configs(&self.after_method).await;
    }

    async fn run_wrapping_configs(&self, methods: &[Arc<TestMethod>]) {
        if methods.is_empty() {
            return;
        }
        for method in methods {
            self.ctx.record_invocation(method);
        }
        let results = self
            .ctx
            .config_invoker
            .invoke_configurations(methods, &self.parameters)
            .await;
        if let Ok(mut sink) = self.sink.lock() {
            for result in results {
                notify_configuration(&self.ctx, &result);
                sink.push((true, result));
            }
        }
    }
}

/// Worker covering one batch of graph nodes; runs each node's method
/// through a [`MethodRunner`].
struct MethodWorker {
    nodes: Vec<NodeId>,
    methods: Vec<Arc<TestMethod>>,
    pinned: Option<LaneId>,
    shared: Arc<WorkerShared>,
}

#[async_trait]
impl Worker for MethodWorker {
    fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    fn pinned_lane(&self) -> Option<LaneId> {
        self.pinned
    }

    async fn run(&mut self, ctx: &JobContext) {
        for method in &self.methods {
            if ctx.cancel.is_cancelled() {
                debug!("batch cancelled before {}", method.id);
                break;
            }
            self.shared.run_method(method, ctx).await;
        }
    }
}

/// Maps free nodes onto workers according to the parallelism axis: one
/// worker per node, or one per class/instance batch.
struct MethodWorkerFactory {
    shared: Arc<WorkerShared>,
    mode: ParallelMode,
}

impl WorkerFactory<Arc<TestMethod>> for MethodWorkerFactory {
    fn create_workers(
        &self,
        graph: &DynamicGraph<Arc<TestMethod>>,
        free: &[NodeId],
        hints: &AffinityHints,
    ) -> Vec<Box<dyn Worker>> {
        let batches: Vec<Vec<NodeId>> = match self.mode {
            ParallelMode::Classes => {
                batch_by(free, |node| graph.payload(node).id.class.clone())
            }
            ParallelMode::Instances => {
                batch_by(free, |node| graph.payload(node).instance_key().to_string())
            }
            _ => free.iter().map(|&node| vec![node]).collect(),
        };

        batches
            .into_iter()
            .map(|nodes| {
                let methods = nodes.iter().map(|&node| graph.payload(node).clone()).collect();
                let pinned = nodes.first().and_then(|&node| hints.lane_for(node));
                Box::new(MethodWorker {
                    nodes,
                    methods,
                    pinned,
                    shared: self.shared.clone(),
                }) as Box<dyn Worker>
            })
            .collect()
    }
}

/// Groups nodes by key, preserving first-seen order of both keys and
/// members.
fn batch_by(free: &[NodeId], key: impl Fn(NodeId) -> String) -> Vec<Vec<NodeId>> {
    let mut batches: Vec<(String, Vec<NodeId>)> = Vec::new();
    for &node in free {
        let node_key = key(node);
        match batches.iter_mut().find(|(k, _)| *k == node_key) {
            Some((_, members)) => members.push(node),
            None => batches.push((node_key, vec![node])),
        }
    }
    batches.into_iter().map(|(_, members)| members).collect()
}

/// Creates test runners for a suite. Two stock implementations exist:
/// [`DefaultTestRunnerFactory`] builds plain runners,
/// [`ProxyTestRunnerFactory`] wraps another factory with an observer
/// callback.
pub trait TestRunnerFactory: Send + Sync {
    /// Builds the runner for one declaration.
    fn create(
        &self,
        ctx: Arc<RunContext>,
        desc: TestDescription,
        methods: Vec<Arc<TestMethod>>,
    ) -> TestRunner;
}

/// The stock runner factory.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTestRunnerFactory;

impl TestRunnerFactory for DefaultTestRunnerFactory {
    fn create(
        &self,
        ctx: Arc<RunContext>,
        desc: TestDescription,
        methods: Vec<Arc<TestMethod>>,
    ) -> TestRunner {
        TestRunner::new(ctx, desc, methods)
    }
}

/// Wraps another factory, invoking an observer for every created runner.
pub struct ProxyTestRunnerFactory {
    inner: Arc<dyn TestRunnerFactory>,
    observer: Arc<dyn Fn(&TestDescription) + Send + Sync>,
}

impl ProxyTestRunnerFactory {
    /// Creates a proxy over `inner` calling `observer` before each
    /// delegation.
    pub fn new(
        inner: Arc<dyn TestRunnerFactory>,
        observer: Arc<dyn Fn(&TestDescription) + Send + Sync>,
    ) -> Self {
        Self { inner, observer }
    }
}

impl TestRunnerFactory for ProxyTestRunnerFactory {
    fn create(
        &self,
        ctx: Arc<RunContext>,
        desc: TestDescription,
        methods: Vec<Arc<TestMethod>>,
    ) -> TestRunner {
        (self.observer)(&desc);
        self.inner.create(ctx, desc, methods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::MethodId;
    use crate::result::TestResult;

    fn method(name: &str) -> Arc<TestMethod> {
        Arc::new(TestMethod::new("C", name))
    }

    #[test]
    fn graph_edges_follow_method_dependencies() {
        let a = method("a");
        let b = Arc::new(TestMethod::new("C", "b").depends_on_method("a"));
        let graph = build_graph(&[a, b]).unwrap();
        assert_eq!(graph.free_nodes(), vec![0]);
        assert_eq!(graph.dependencies_of(1), &[0]);
    }

    #[test]
    fn graph_edges_follow_group_dependencies() {
        let a = Arc::new(TestMethod::new("C", "a").with_group("init"));
        let b = Arc::new(TestMethod::new("C", "b").with_group("init"));
        let c = Arc::new(TestMethod::new("C", "c").depends_on_group("init"));
        let graph = build_graph(&[a, b, c]).unwrap();
        assert_eq!(graph.free_nodes(), vec![0, 1]);
        assert_eq!(graph.dependencies_of(2), &[0, 1]);
    }

    #[test]
    fn unknown_dependency_is_a_config_error() {
        let a = Arc::new(TestMethod::new("C", "a").depends_on_method("ghost"));
        assert!(build_graph(&[a]).unwrap_err().is_config());
    }

    #[test]
    fn dependency_cycle_is_a_config_error() {
        let a = Arc::new(TestMethod::new("C", "a").depends_on_method("b"));
        let b = Arc::new(TestMethod::new("C", "b").depends_on_method("a"));
        assert!(build_graph(&[a, b]).unwrap_err().is_config());
    }

    #[test]
    fn group_membership_never_creates_a_self_edge() {
        let a = Arc::new(
            TestMethod::new("C", "a")
                .with_group("g")
                .depends_on_group("g"),
        );
        let b = Arc::new(TestMethod::new("C", "b").with_group("g"));
        let graph = build_graph(&[a, b]).unwrap();
        assert_eq!(graph.dependencies_of(0), &[1]);
    }

    #[test]
    fn batching_groups_by_key_in_first_seen_order() {
        let batches = batch_by(&[3, 1, 4, 2], |node| {
            if node % 2 == 0 { "even" } else { "odd" }.to_string()
        });
        assert_eq!(batches, vec![vec![3, 1], vec![4, 2]]);
    }

    #[test]
    fn success_percentage_promotes_failures() {
        let id = MethodId::new("C", "flaky");
        let thresholds = HashMap::from([(id.clone(), 50u8)]);
        let mk = |status| TestResult::new(id.clone(), status);
        let results = apply_success_percentage(
            vec![
                mk(TestStatus::Success),
                mk(TestStatus::Failure),
                mk(TestStatus::Success),
                mk(TestStatus::Success),
            ],
            &thresholds,
        );
        assert!(results.iter().all(|r| r.status != TestStatus::Failure));
        assert_eq!(
            results
                .iter()
                .filter(|r| r.status == TestStatus::SuccessWithinPercentage)
                .count(),
            1
        );
    }

    #[test]
    fn success_percentage_keeps_failures_below_threshold() {
        let id = MethodId::new("C", "broken");
        let thresholds = HashMap::from([(id.clone(), 90u8)]);
        let mk = |status| TestResult::new(id.clone(), status);
        let results = apply_success_percentage(
            vec![mk(TestStatus::Failure), mk(TestStatus::Success)],
            &thresholds,
        );
        assert_eq!(
            results
                .iter()
                .filter(|r| r.status == TestStatus::Failure)
                .count(),
            1
        );
    }

    #[test]
    fn methods_without_a_threshold_keep_their_failures() {
        let id = MethodId::new("C", "plain");
        let results = apply_success_percentage(
            vec![TestResult::new(id.clone(), TestStatus::Failure)],
            &HashMap::new(),
        );
        assert_eq!(results[0].status, TestStatus::Failure);
    }
}
