//! Expands one method into its invocation stream and runs it.
//!
//! The invocation stream is every parameter row of the method's data
//! provider, repeated `invocation_count` times. A `None` row is a skip
//! marker: it is passed over silently and contributes no result.
//!
//! Sequential mode preserves row order, applies the invoker's retry hook
//! after each failure, and cascade-skips the rest of the budget once a
//! failure occurred and the skip flag is set. Parallel mode dispatches
//! each row independently over a leased pool and flattens results in
//! submission order; rows neither retry-share state nor cascade-skip.
//!
//! This layer never fails: invoker exceptions are already results, pool
//! errors are logged, and the caller always receives whatever results
//! were produced.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::schema::ParameterMap;
use crate::exec::pool::{JobContext, PoolJob, PoolPolicy, WorkerPool, current_lane};
use crate::invoke::{FailureContext, InvocationArgs, ParameterRow, TestObject};
use crate::listener::notify_each;
use crate::method::TestMethod;
use crate::result::{TestResult, TestStatus};
use crate::runner::RunContext;

/// Runs the invocation stream of one test method.
#[derive(Clone)]
pub struct MethodRunner {
    method: Arc<TestMethod>,
    ctx: Arc<RunContext>,
    parameters: Arc<ParameterMap>,
    instance: Option<TestObject>,
    skip_failed_invocations: bool,
}

impl MethodRunner {
    /// Creates a runner for `method` with the merged parameter map of its
    /// enclosing test.
    pub fn new(
        method: Arc<TestMethod>,
        ctx: Arc<RunContext>,
        parameters: Arc<ParameterMap>,
    ) -> Self {
        Self {
            method,
            ctx,
            parameters,
            instance: None,
            skip_failed_invocations: false,
        }
    }

    /// Sets the instance of the declaring class.
    pub fn with_instance(mut self, instance: TestObject) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Sets the test-level cascade-skip flag. The method-level request is
    /// honoured either way.
    pub fn with_skip_failed_invocations(mut self, skip: bool) -> Self {
        self.skip_failed_invocations = skip;
        self
    }

    /// The expanded invocation stream: every data-provider row, repeated
    /// `invocation_count` times. Methods without a provider get one empty
    /// row per invocation.
    fn invocation_stream(&self) -> Vec<Option<ParameterRow>> {
        let rows = match &self.method.data_provider {
            Some(provider) => provider.provide(&self.method),
            None => vec![Some(ParameterRow::new())],
        };
        let mut stream = Vec::with_capacity(rows.len() * self.method.invocation_count);
        for _ in 0..self.method.invocation_count {
            stream.extend(rows.iter().cloned());
        }
        stream
    }

    /// Runs the whole stream, sequentially or in parallel depending on
    /// the method's declaration, and returns the results in stream order.
    pub async fn run(&self, pools: &PoolPolicy, cancel: &CancellationToken) -> Vec<TestResult> {
        let stream = self.invocation_stream();
        notify_each(
            "data-provider",
            &self.ctx.listeners.data_provider_listeners(),
            |l| l.before_fan_out(&self.method, stream.len()),
        );

        let results = if self.method.runs_rows_in_parallel() {
            self.run_in_parallel(stream, pools, cancel).await
        } else {
            self.run_in_sequence(stream, cancel).await
        };

        notify_each(
            "data-provider",
            &self.ctx.listeners.data_provider_listeners(),
            |l| l.after_fan_out(&self.method),
        );
        results
    }

    /// Runs the stream in order on the calling lane.
    ///
    /// After a failure, the remainder of the budget is synthesised as
    /// skipped results when the test or the method asked for cascade-skip.
    pub async fn run_in_sequence(
        &self,
        stream: Vec<Option<ParameterRow>>,
        cancel: &CancellationToken,
    ) -> Vec<TestResult> {
        let cascade = self.skip_failed_invocations || self.method.skip_failed_invocations;
        let mut results = Vec::new();
        let mut failure_ctx = FailureContext::default();

        for index in 0..stream.len() {
            if cancel.is_cancelled() {
                debug!(
                    "cancellation observed before row {index} of {}; stopping",
                    self.method.id
                );
                break;
            }
            let Some(row) = stream[index].as_ref() else {
                continue;
            };

            self.invoke_row(row, index, &mut results, &mut failure_ctx)
                .await;

            if cascade && failure_ctx.failure_count() > 0 {
                self.skip_remaining(&stream, index + 1, &mut results);
                break;
            }
        }
        results
    }

    /// Synthesises skipped results for every remaining non-marker row.
    fn skip_remaining(
        &self,
        stream: &[Option<ParameterRow>],
        from: usize,
        results: &mut Vec<TestResult>,
    ) {
        for index in from..stream.len() {
            if stream[index].is_none() {
                continue;
            }
            let mut skipped =
                self.ctx
                    .invoker
                    .register_skipped_result(&self.method, Utc::now(), None);
            skipped.row_index = Some(index);
            self.ctx
                .invoker
                .invoke_listeners_for_skipped(&skipped, &self.method);
            results.push(skipped);
        }
    }

    /// Runs one row: injection, notifications, invocation, retry.
    async fn invoke_row(
        &self,
        row: &ParameterRow,
        index: usize,
        results: &mut Vec<TestResult>,
        failure_ctx: &mut FailureContext,
    ) {
        let arguments =
            self.ctx
                .resolver
                .inject_parameters(Some(row), &self.method, &self.parameters);
        let args = InvocationArgs {
            method: &self.method,
            arguments: &arguments,
            row_index: Some(index),
            parameters: &self.parameters,
            instance: self.instance.as_ref(),
        };

        self.ctx.record_invocation(&self.method);
        notify_each("test", &self.ctx.listeners.test_listeners(), |l| {
            l.on_test_start(&self.method.id)
        });
        notify_each(
            "invoked-method",
            &self.ctx.listeners.invoked_method_listeners(),
            |l| l.before_invocation(&self.method, Some(index)),
        );

        let mut result = self.invoke_bounded(&args, failure_ctx).await;
        if result.lane.is_none() {
            result.lane = current_lane().map(|lane| lane.id);
        }
        if result.row_index.is_none() {
            result.row_index = Some(index);
        }

        notify_each(
            "invoked-method",
            &self.ctx.listeners.invoked_method_listeners(),
            |l| l.after_invocation(&self.method, &result),
        );

        if result.status == TestStatus::Failure {
            failure_ctx.record_failure(Some(index));
            results.push(result);
            let failure_count = failure_ctx.failure_count();
            self.ctx
                .invoker
                .retry_failed(&args, results, failure_count, failure_ctx)
                .await;
        } else {
            results.push(result);
        }
    }

    /// Invokes the method, bounded by its own deadline when it has one.
    async fn invoke_bounded(
        &self,
        args: &InvocationArgs<'_>,
        failure_ctx: &FailureContext,
    ) -> TestResult {
        let invocation = self.ctx.invoker.invoke_test_method(args, failure_ctx);
        match self.method.time_out_ms {
            0 => invocation.await,
            ms => {
                let limit = Duration::from_millis(ms);
                match tokio::time::timeout(limit, invocation).await {
                    Ok(result) => result,
                    Err(_) => TestResult::new(self.method.id.clone(), TestStatus::Failure)
                        .with_error(format!("invocation exceeded its deadline of {limit:?}")),
                }
            }
        }
    }

    /// Runs every row as an independent job over a leased pool, then
    /// flattens the results in submission order.
    pub async fn run_in_parallel(
        &self,
        stream: Vec<Option<ParameterRow>>,
        pools: &PoolPolicy,
        cancel: &CancellationToken,
    ) -> Vec<TestResult> {
        let lanes = if self.method.thread_pool_size > 1 {
            self.method.thread_pool_size
        } else {
            self.ctx.suite.data_provider_thread_count
        };
        let lease = match pools.lease(lanes, "data-provider") {
            Ok(lease) => lease,
            Err(e) => {
                error!(
                    "no pool available for {} fan-out ({e}); falling back to sequential",
                    self.method.id
                );
                return self.run_in_sequence(stream, cancel).await;
            }
        };

        let slots: Arc<Mutex<Vec<Option<Vec<TestResult>>>>> =
            Arc::new(Mutex::new(vec![None; stream.len()]));
        let mut handles = Vec::new();
        for (index, row) in stream.into_iter().enumerate() {
            let Some(row) = row else { continue };
            let runner = self.clone();
            let slots = slots.clone();
            let job: PoolJob = Box::new(move |_job_ctx: JobContext| {
                Box::pin(async move {
                    let mut local = Vec::new();
                    // Each row carries its own failure context; rows are
                    // independent and never cascade into each other.
                    let mut failure_ctx = FailureContext::default();
                    runner
                        .invoke_row(&row, index, &mut local, &mut failure_ctx)
                        .await;
                    if let Ok(mut slots) = slots.lock() {
                        slots[index] = Some(local);
                    }
                })
            });
            match lease.pool().submit(job) {
                Ok(handle) => handles.push(handle),
                Err(e) => error!("row {index} of {} not submitted: {e}", self.method.id),
            }
        }

        let tokens: Vec<_> = handles
            .iter()
            .map(|handle| handle.cancellation_token())
            .collect();
        let join = WorkerPool::await_all(handles, None);
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("fan-out of {} cancelled; collecting partial rows", self.method.id);
                for token in tokens {
                    token.cancel();
                }
            }
            _ = join => {}
        }

        lease.release().await;

        let mut results = Vec::new();
        if let Ok(mut slots) = slots.lock() {
            for slot in slots.iter_mut() {
                if let Some(row_results) = slot.take() {
                    results.extend(row_results);
                }
            }
        }
        results
    }
}
