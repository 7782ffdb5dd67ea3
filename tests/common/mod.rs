//! Shared fixtures for the integration tests: a scriptable invoker, a
//! recording configuration invoker, and small listener/analyzer stubs.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use drover::config::schema::ParameterMap;
use drover::invoke::{ConfigInvoker, FailureContext, InvocationArgs, RetryAnalyzer, TestInvoker};
use drover::method::{MethodKind, TestMethod};
use drover::result::{TestResult, TestStatus};

/// Initialises test logging once; later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Test invoker driven by a per-method script of statuses.
///
/// Each invocation of a method pops the next scripted status; methods
/// without a script (or with an exhausted one) pass. Invocations are
/// recorded in dispatch order.
pub struct ScriptedInvoker {
    outcomes: Mutex<HashMap<String, VecDeque<TestStatus>>>,
    delay: Option<Duration>,
    invocations: Mutex<Vec<(String, Option<usize>)>>,
    skip_notifications: AtomicUsize,
}

impl Default for ScriptedInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            delay: None,
            invocations: Mutex::new(Vec::new()),
            skip_notifications: AtomicUsize::new(0),
        }
    }

    /// Every invocation sleeps this long before reporting.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Scripts the statuses of the next invocations of `method`.
    pub fn script(&self, method: &str, statuses: &[TestStatus]) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(method.to_string(), statuses.iter().copied().collect());
    }

    /// Method names in the order they were invoked.
    pub fn invocation_order(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Number of skipped-invocation notifications received.
    pub fn skip_notification_count(&self) -> usize {
        self.skip_notifications.load(Ordering::SeqCst)
    }

    fn next_status(&self, method: &str) -> TestStatus {
        self.outcomes
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
            .unwrap_or(TestStatus::Success)
    }

    async fn run_once(&self, args: &InvocationArgs<'_>) -> TestResult {
        let started = Utc::now();
        self.invocations
            .lock()
            .unwrap()
            .push((args.method.id.name.clone(), args.row_index));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let status = self.next_status(&args.method.id.name);
        let mut result =
            TestResult::new(args.method.id.clone(), status).with_window(started, Utc::now());
        if let Some(index) = args.row_index {
            result = result.with_row_index(index);
        }
        if status == TestStatus::Failure {
            result = result.with_error("scripted failure");
        }
        result
    }
}

#[async_trait]
impl TestInvoker for ScriptedInvoker {
    async fn invoke_test_method(
        &self,
        args: &InvocationArgs<'_>,
        _ctx: &FailureContext,
    ) -> TestResult {
        self.run_once(args).await
    }

    async fn retry_failed(
        &self,
        args: &InvocationArgs<'_>,
        results: &mut Vec<TestResult>,
        _failure_count: usize,
        ctx: &mut FailureContext,
    ) {
        let Some(analyzer) = args.method.retry_analyzer.clone() else {
            return;
        };
        loop {
            let Some(last) = results.last() else { return };
            if last.status != TestStatus::Failure || !analyzer.retry(last) {
                return;
            }
            let retry = self.run_once(args).await;
            let passed = retry.status == TestStatus::Success;
            results.push(retry);
            if passed {
                ctx.clear();
                return;
            }
            ctx.record_failure(args.row_index);
        }
    }

    fn register_skipped_result(
        &self,
        method: &Arc<TestMethod>,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> TestResult {
        let mut result =
            TestResult::new(method.id.clone(), TestStatus::Skipped).with_window(at, at);
        if let Some(error) = error {
            result = result.with_error(error);
        }
        result
    }

    fn invoke_listeners_for_skipped(&self, _result: &TestResult, _method: &Arc<TestMethod>) {
        self.skip_notifications.fetch_add(1, Ordering::SeqCst);
    }
}

/// Configuration invoker that records every call and reports success.
#[derive(Default)]
pub struct RecordingConfigInvoker {
    calls: Mutex<Vec<(MethodKind, String, ParameterMap)>>,
}

impl RecordingConfigInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(kind, method name)` pairs in invocation order.
    pub fn calls(&self) -> Vec<(MethodKind, String)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(kind, name, _)| (*kind, name.clone()))
            .collect()
    }

    /// Parameter maps seen by methods of `kind`.
    pub fn parameters_seen(&self, kind: MethodKind) -> Vec<ParameterMap> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, ..)| *k == kind)
            .map(|(.., params)| params.clone())
            .collect()
    }
}

#[async_trait]
impl ConfigInvoker for RecordingConfigInvoker {
    async fn invoke_configurations(
        &self,
        methods: &[Arc<TestMethod>],
        parameters: &ParameterMap,
    ) -> Vec<TestResult> {
        let mut results = Vec::new();
        for method in methods {
            self.calls.lock().unwrap().push((
                method.kind,
                method.id.name.clone(),
                parameters.clone(),
            ));
            results.push(TestResult::new(method.id.clone(), TestStatus::Success));
        }
        results
    }
}

/// Retry analyzer allowing a fixed number of retries per run.
pub struct RetryUpTo {
    budget: AtomicUsize,
}

impl RetryUpTo {
    pub fn new(retries: usize) -> Self {
        Self {
            budget: AtomicUsize::new(retries),
        }
    }
}

impl RetryAnalyzer for RetryUpTo {
    fn retry(&self, _result: &TestResult) -> bool {
        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
    }
}
