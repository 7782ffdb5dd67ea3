//! Configuration schema for suite and test descriptions.
//!
//! These types are the in-memory input to the execution core. How they are
//! produced is someone else's job: an XML parser, a builder in user code,
//! or the TOML loader in [`crate::config`]. The core treats a
//! [`SuiteDescription`] as immutable for the whole run.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Named string parameters attached to a suite or a test.
pub type ParameterMap = HashMap<String, String>;

/// The parallelism axis chosen for a suite or a test.
///
/// | Mode | Unit dispatched concurrently |
/// |------|------------------------------|
/// | `none` | nothing; everything runs sequentially |
/// | `tests` | whole test declarations |
/// | `methods` | individual test methods |
/// | `classes` | all methods of one class as a batch |
/// | `instances` | all methods of one instance as a batch |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelMode {
    /// Sequential execution in declared order.
    #[default]
    None,
    /// Test declarations run concurrently; inside each test, methods are sequential.
    Tests,
    /// Test methods run concurrently.
    Methods,
    /// Methods grouped by declaring class; one batch per class.
    Classes,
    /// Methods grouped by instance key; one batch per instance.
    Instances,
}

impl ParallelMode {
    /// Parses the textual form used in suite files.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for any string that is not one of
    /// `none`, `tests`, `methods`, `classes`, `instances`.
    pub fn parse(value: &str) -> CoreResult<Self> {
        match value {
            "none" => Ok(ParallelMode::None),
            "tests" => Ok(ParallelMode::Tests),
            "methods" => Ok(ParallelMode::Methods),
            "classes" => Ok(ParallelMode::Classes),
            "instances" => Ok(ParallelMode::Instances),
            other => Err(CoreError::Config(format!(
                "unknown parallel mode '{other}'"
            ))),
        }
    }

    /// Returns `true` for any mode other than [`ParallelMode::None`].
    pub fn is_parallel(&self) -> bool {
        !matches!(self, ParallelMode::None)
    }
}

/// One `<test>`-level declaration inside a suite.
///
/// Selects the classes and methods to run and may override a handful of
/// suite-level settings. The `index` field preserves declared order so
/// results can be reported in the order the suite was written, even when
/// tests finish out of order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestDescription {
    /// Unique name of this test inside its suite.
    pub name: String,

    /// Position in the suite's declared order.
    #[serde(default)]
    pub index: usize,

    /// Classes selected by this test. Empty means "whatever the bound
    /// methods declare".
    #[serde(default)]
    pub classes: Vec<String>,

    /// Method names selected by this test. Empty means all methods of the
    /// selected classes.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Parallelism override for this test. `None` falls back to the suite
    /// mode (where `tests` at the suite level means sequential methods
    /// inside each test).
    #[serde(default)]
    pub parallel: Option<ParallelMode>,

    /// Worker count override for this test's method pool.
    #[serde(default)]
    pub thread_count: Option<usize>,

    /// Parameters visible to this test, merged over the suite parameters.
    #[serde(default)]
    pub parameters: ParameterMap,

    /// Override of the suite's cascade-skip flag.
    #[serde(default)]
    pub skip_failed_invocation_counts: Option<bool>,

    /// Override of the suite's deadline, in milliseconds. `0` means no
    /// deadline.
    #[serde(default)]
    pub time_out_ms: Option<u64>,
}

impl TestDescription {
    /// Creates a test description with the given name and default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: 0,
            classes: Vec::new(),
            methods: Vec::new(),
            parallel: None,
            thread_count: None,
            parameters: ParameterMap::new(),
            skip_failed_invocation_counts: None,
            time_out_ms: None,
        }
    }

    /// Sets the parallelism override.
    pub fn with_parallel(mut self, mode: ParallelMode) -> Self {
        self.parallel = Some(mode);
        self
    }

    /// Sets the worker count override.
    pub fn with_thread_count(mut self, count: usize) -> Self {
        self.thread_count = Some(count);
        self
    }

    /// Adds a parameter visible to this test.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Sets the cascade-skip override.
    pub fn with_skip_failed_invocation_counts(mut self, skip: bool) -> Self {
        self.skip_failed_invocation_counts = Some(skip);
        self
    }

    /// Sets the deadline override in milliseconds.
    pub fn with_time_out_ms(mut self, ms: u64) -> Self {
        self.time_out_ms = Some(ms);
        self
    }
}

/// A named collection of test descriptions with shared configuration.
///
/// This is the root input of a run. It is immutable while the run is in
/// progress; per-test overrides live on [`TestDescription`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteDescription {
    /// Suite name, used as the key in logs and reports.
    pub name: String,

    /// Contained tests in declared order.
    #[serde(default)]
    pub tests: Vec<TestDescription>,

    /// Parallelism axis for the whole suite.
    #[serde(default)]
    pub parallel: ParallelMode,

    /// Worker count for parallel modes.
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,

    /// Worker count for data-provider fan-out.
    #[serde(default = "default_data_provider_thread_count")]
    pub data_provider_thread_count: usize,

    /// Reuse one fan-out pool across all methods of the suite instead of a
    /// fresh pool per fan-out.
    #[serde(default)]
    pub share_thread_pool_for_data_providers: bool,

    /// Reuse each test's method pool for its data-provider fan-outs.
    #[serde(default)]
    pub use_global_thread_pool: bool,

    /// After the first failure of a multi-invocation method, synthesise
    /// skipped results for the rest of its invocation budget.
    #[serde(default)]
    pub skip_failed_invocation_counts: bool,

    /// Deadline in milliseconds; bounds each test, or the whole suite in
    /// parallel-tests mode. `0` means no deadline.
    #[serde(default)]
    pub time_out_ms: u64,

    /// Parameters visible to every test in the suite.
    #[serde(default)]
    pub parameters: ParameterMap,
}

fn default_thread_count() -> usize {
    5
}

fn default_data_provider_thread_count() -> usize {
    10
}

impl SuiteDescription {
    /// Creates a suite description with the given name and default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tests: Vec::new(),
            parallel: ParallelMode::default(),
            thread_count: default_thread_count(),
            data_provider_thread_count: default_data_provider_thread_count(),
            share_thread_pool_for_data_providers: false,
            use_global_thread_pool: false,
            skip_failed_invocation_counts: false,
            time_out_ms: 0,
            parameters: ParameterMap::new(),
        }
    }

    /// Sets the parallelism axis.
    pub fn with_parallel(mut self, mode: ParallelMode) -> Self {
        self.parallel = mode;
        self
    }

    /// Sets the worker count for parallel modes.
    pub fn with_thread_count(mut self, count: usize) -> Self {
        self.thread_count = count;
        self
    }

    /// Sets the data-provider fan-out worker count.
    pub fn with_data_provider_thread_count(mut self, count: usize) -> Self {
        self.data_provider_thread_count = count;
        self
    }

    /// Enables cascade-skip after the first failure of a method.
    pub fn with_skip_failed_invocation_counts(mut self, skip: bool) -> Self {
        self.skip_failed_invocation_counts = skip;
        self
    }

    /// Sets the deadline in milliseconds. `0` disables it.
    pub fn with_time_out_ms(mut self, ms: u64) -> Self {
        self.time_out_ms = ms;
        self
    }

    /// Adds a suite-level parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Returns the suite deadline, if one is configured.
    pub fn timeout(&self) -> Option<Duration> {
        (self.time_out_ms > 0).then(|| Duration::from_millis(self.time_out_ms))
    }

    /// Checks the description for configuration mistakes.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a worker count is zero or two
    /// tests share a name.
    pub fn validate(&self) -> CoreResult<()> {
        if self.thread_count < 1 {
            return Err(CoreError::Config(format!(
                "suite '{}' declares thread_count {}, minimum is 1",
                self.name, self.thread_count
            )));
        }
        if self.data_provider_thread_count < 1 {
            return Err(CoreError::Config(format!(
                "suite '{}' declares data_provider_thread_count {}, minimum is 1",
                self.name, self.data_provider_thread_count
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for test in &self.tests {
            if let Some(count) = test.thread_count
                && count < 1
            {
                return Err(CoreError::Config(format!(
                    "test '{}' declares thread_count 0, minimum is 1",
                    test.name
                )));
            }
            if !seen.insert(test.name.as_str()) {
                return Err(CoreError::Config(format!(
                    "duplicate test name '{}' in suite '{}'",
                    test.name, self.name
                )));
            }
        }
        Ok(())
    }
}

/// Immutable behaviour flags threaded from the entry point down to the
/// scheduler, instead of process-global state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Treat any suite parallel mode other than `none` as a request for
    /// suite-level parallelism.
    #[serde(default)]
    pub strict_parallelism: bool,

    /// Pin each graph node to the pool lane its predecessor ran on.
    #[serde(default)]
    pub enforce_thread_affinity: bool,
}

impl RuntimeOptions {
    /// Enables strict parallelism.
    pub fn with_strict_parallelism(mut self, on: bool) -> Self {
        self.strict_parallelism = on;
        self
    }

    /// Enables thread-affinity pinning.
    pub fn with_enforce_thread_affinity(mut self, on: bool) -> Self {
        self.enforce_thread_affinity = on;
        self
    }
}
