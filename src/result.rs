//! Test results and their aggregation.
//!
//! Every invocation the core dispatches produces exactly one [`TestResult`]
//! that lands in exactly one bucket of a [`ResultBuckets`]. Buckets exist
//! in two parallel sets per test declaration, one for test methods and one
//! for configuration methods, collected into a [`TestRunOutcome`]. The
//! suite aggregates outcomes into [`SuiteResults`], keyed by test name and
//! ordered the way the suite declared its tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::method::{MethodId, MethodKind};

/// The outcome status of one invocation.
///
/// | Status | Meaning | Affects CI? |
/// |--------|---------|-------------|
/// | Success | the invocation passed | No |
/// | Failure | the invocation failed or errored | Yes |
/// | Skipped | the invocation was never run | No |
/// | SuccessWithinPercentage | failed, but the method's pass rate met its declared threshold | No |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    /// The invocation passed.
    Success,
    /// The invocation failed, either an assertion or an error in user code.
    Failure,
    /// The invocation was not executed, by marker or by cascade-skip.
    Skipped,
    /// The invocation failed but its method stayed within the declared
    /// success percentage.
    SuccessWithinPercentage,
}

impl TestStatus {
    /// Returns `true` for statuses that do not fail a run.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TestStatus::Success | TestStatus::SuccessWithinPercentage
        )
    }
}

/// The result of a single invocation of a test or configuration method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    /// The method that was (or would have been) invoked.
    pub method: MethodId,

    /// Outcome of the invocation.
    pub status: TestStatus,

    /// When the invocation started.
    pub started_at: DateTime<Utc>,

    /// When the invocation ended. Equal to `started_at` for synthesised
    /// skips.
    pub ended_at: DateTime<Utc>,

    /// Error reported by user code, if any.
    pub error_message: Option<String>,

    /// Index of the parameter row this invocation consumed, if the method
    /// is data-driven.
    pub row_index: Option<usize>,

    /// Pool lane the invocation ran on. `None` for work executed off the
    /// pool, such as before/after-test configuration.
    pub lane: Option<usize>,
}

impl TestResult {
    /// Creates a result stamped with the current time for both endpoints.
    pub fn new(method: MethodId, status: TestStatus) -> Self {
        let now = Utc::now();
        Self {
            method,
            status,
            started_at: now,
            ended_at: now,
            error_message: None,
            row_index: None,
            lane: None,
        }
    }

    /// Sets the error message.
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Sets the parameter row index.
    pub fn with_row_index(mut self, index: usize) -> Self {
        self.row_index = Some(index);
        self
    }

    /// Sets both timestamps.
    pub fn with_window(mut self, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self.ended_at = ended_at;
        self
    }

    /// Sets the lane the invocation ran on.
    pub fn with_lane(mut self, lane: usize) -> Self {
        self.lane = Some(lane);
        self
    }

    /// Wall-clock time between the two timestamps.
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }
}

/// The four result categories of one method population.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultBuckets {
    /// Invocations that passed.
    pub passed: Vec<TestResult>,

    /// Invocations that failed.
    pub failed: Vec<TestResult>,

    /// Invocations that failed while their method met its declared
    /// success percentage.
    pub failed_within_percentage: Vec<TestResult>,

    /// Invocations that were skipped.
    pub skipped: Vec<TestResult>,
}

impl ResultBuckets {
    /// Routes a result into the bucket matching its status.
    pub fn record(&mut self, result: TestResult) {
        match result.status {
            TestStatus::Success => self.passed.push(result),
            TestStatus::Failure => self.failed.push(result),
            TestStatus::SuccessWithinPercentage => self.failed_within_percentage.push(result),
            TestStatus::Skipped => self.skipped.push(result),
        }
    }

    /// Total number of recorded results across all four buckets.
    pub fn len(&self) -> usize {
        self.passed.len()
            + self.failed.len()
            + self.failed_within_percentage.len()
            + self.skipped.len()
    }

    /// Returns `true` when no result has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates every recorded result, bucket by bucket.
    pub fn iter(&self) -> impl Iterator<Item = &TestResult> {
        self.passed
            .iter()
            .chain(self.failed.iter())
            .chain(self.failed_within_percentage.iter())
            .chain(self.skipped.iter())
    }
}

/// Aggregated results of one test declaration: test-method buckets plus
/// configuration-method buckets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestRunOutcome {
    /// Results of test methods.
    pub tests: ResultBuckets,

    /// Results of configuration methods.
    pub configurations: ResultBuckets,
}

impl TestRunOutcome {
    /// Records a result into the test or configuration buckets.
    pub fn record(&mut self, configuration: bool, result: TestResult) {
        if configuration {
            self.configurations.record(result);
        } else {
            self.tests.record(result);
        }
    }

    /// Returns `true` when no test or configuration method failed.
    pub fn success(&self) -> bool {
        self.tests.failed.is_empty() && self.configurations.failed.is_empty()
    }
}

/// Results of a whole suite, keyed by test name in declared order.
///
/// The map is append-only while the suite runs and immutable afterwards;
/// callers receive a shared reference once `run()` returns.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SuiteResults {
    entries: Vec<(String, TestRunOutcome)>,
}

impl SuiteResults {
    /// Appends an entry. Later entries never displace earlier ones.
    pub(crate) fn insert(&mut self, name: impl Into<String>, outcome: TestRunOutcome) {
        self.entries.push((name.into(), outcome));
    }

    /// Looks up the outcome of one test by name.
    pub fn get(&self, name: &str) -> Option<&TestRunOutcome> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, o)| o)
    }

    /// Test names in declared order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Iterates entries in declared order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TestRunOutcome)> {
        self.entries.iter().map(|(n, o)| (n.as_str(), o))
    }

    /// Number of tests with an entry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when the suite produced no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` when every entry succeeded.
    pub fn success(&self) -> bool {
        self.entries.iter().all(|(_, o)| o.success())
    }
}

/// One entry of the invoked-method log: what ran, what kind it was, when.
#[derive(Debug, Clone, Serialize)]
pub struct InvokedMethod {
    /// Identity of the invoked method.
    pub method: MethodId,

    /// Lifecycle kind at the time of invocation.
    pub kind: MethodKind,

    /// When the invocation was dispatched.
    pub at: DateTime<Utc>,
}

impl InvokedMethod {
    /// Creates a log entry stamped with the current time.
    pub fn now(method: MethodId, kind: MethodKind) -> Self {
        Self {
            method,
            kind,
            at: Utc::now(),
        }
    }

    /// Returns `true` for configuration-method entries.
    pub fn is_configuration(&self) -> bool {
        self.kind.is_configuration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: TestStatus) -> TestResult {
        TestResult::new(MethodId::new("C", "m"), status)
    }

    #[test]
    fn record_routes_by_status() {
        let mut buckets = ResultBuckets::default();
        buckets.record(result(TestStatus::Success));
        buckets.record(result(TestStatus::Failure));
        buckets.record(result(TestStatus::Skipped));
        buckets.record(result(TestStatus::SuccessWithinPercentage));

        assert_eq!(buckets.passed.len(), 1);
        assert_eq!(buckets.failed.len(), 1);
        assert_eq!(buckets.skipped.len(), 1);
        assert_eq!(buckets.failed_within_percentage.len(), 1);
        assert_eq!(buckets.len(), 4);
    }

    #[test]
    fn suite_results_preserve_insertion_order() {
        let mut results = SuiteResults::default();
        results.insert("beta", TestRunOutcome::default());
        results.insert("alpha", TestRunOutcome::default());

        let names: Vec<_> = results.names().collect();
        assert_eq!(names, vec!["beta", "alpha"]);
        assert!(results.get("alpha").is_some());
        assert!(results.get("gamma").is_none());
    }

    #[test]
    fn outcome_success_requires_no_failures() {
        let mut outcome = TestRunOutcome::default();
        outcome.record(false, result(TestStatus::Success));
        assert!(outcome.success());
        outcome.record(true, result(TestStatus::Failure));
        assert!(!outcome.success());
    }
}
