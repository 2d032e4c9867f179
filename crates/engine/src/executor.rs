//! Step executor — runs one workflow run to a terminal state.
//!
//! `StepExecutor` is the per-run orchestrator:
//! 1. Validates the step DAG and every condition expression up front.
//! 2. Dispatches steps whose dependencies have reached a terminal status,
//!    in parallel up to `max_parallel_steps`, via a `JoinSet`.
//! 3. Routes `api_call` steps through the circuit breaker with exponential
//!    back-off retries.
//! 4. Marks everything transitively downstream of a false condition or a
//!    failed step as `skipped`.
//! 5. Enforces per-step and whole-run timeouts.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use integrations::{EndpointRef, IntegrationClient, NotificationDispatcher};

use crate::breaker::{error_is_retryable, response_is_retryable, BreakerRegistry, CircuitBreaker};
use crate::condition::{self, Expr};
use crate::dag::validate_dag;
use crate::models::{
    RetryPolicy, RunContext, RunCounters, RunOutcome, RunStatus, Step, StepKind, StepResult,
    StepStatus, Workflow,
};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Custom function registry
// ---------------------------------------------------------------------------

/// A registered pure transformation over the run context.
pub type CustomFn = dyn Fn(&RunContext) -> anyhow::Result<Value> + Send + Sync;

/// Maps `custom_function` step names to implementations.
pub type FunctionRegistry = HashMap<String, Arc<CustomFn>>;

// ---------------------------------------------------------------------------
// Internal step completion
// ---------------------------------------------------------------------------

enum StepOutcome {
    Success(Value),
    /// The condition evaluated to false; transitive dependents are skipped.
    ConditionFalse,
    Failed(String),
}

struct RunState {
    ctx: RunContext,
    steps: HashMap<String, Arc<Step>>,
    exprs: HashMap<String, Arc<Expr>>,
    pending_deps: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
    join_set: JoinSet<(String, StepOutcome, u32)>,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes single workflow runs. Stateless between runs; all shared state
/// (circuit breakers) lives in the injected registry.
pub struct StepExecutor {
    client: Arc<dyn IntegrationClient>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    functions: Arc<FunctionRegistry>,
    breakers: Arc<BreakerRegistry>,
}

impl StepExecutor {
    pub fn new(
        client: Arc<dyn IntegrationClient>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        functions: Arc<FunctionRegistry>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self { client, dispatcher, functions, breakers }
    }

    /// Run the workflow to a terminal state.
    ///
    /// # Errors
    /// Returns `EngineError` only for definition problems caught before any
    /// step executes (cycle, unknown dependency, bad expression, unregistered
    /// function). Step failures are contained in the returned outcome.
    #[instrument(skip(self, workflow, trigger_payload), fields(workflow_id = %workflow.id, workflow = %workflow.name))]
    pub async fn run(
        &self,
        workflow: &Workflow,
        trigger_payload: Value,
    ) -> Result<RunOutcome, EngineError> {
        let order = validate_dag(workflow)?;
        info!(steps = order.len(), "DAG validated, starting run");

        let step_ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();

        // Parse conditions and resolve references before anything executes;
        // unresolvable definitions never reach a running step.
        let mut exprs: HashMap<String, Arc<Expr>> = HashMap::new();
        for step in &workflow.steps {
            match &step.kind {
                StepKind::Condition { expression } => {
                    let expr = condition::parse(expression)?;
                    expr.validate_roots(&step_ids)?;
                    exprs.insert(step.id.clone(), Arc::new(expr));
                }
                StepKind::ApiCall { parameters, .. } => {
                    condition::validate_refs(parameters, &step_ids)?;
                }
                StepKind::Notification { message, .. } => {
                    condition::validate_str_refs(message, &step_ids)?;
                }
                StepKind::CustomFunction { function } => {
                    if !self.functions.contains_key(function) {
                        return Err(EngineError::Validation(format!(
                            "step '{}': no function registered under '{function}'",
                            step.id
                        )));
                    }
                }
            }
        }

        let started_at = Utc::now();
        let mut ctx = RunContext::new(workflow.id, trigger_payload);
        for step in &workflow.steps {
            ctx.results.insert(step.id.clone(), StepResult::pending());
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut pending_deps: HashMap<String, usize> = HashMap::new();
        for step in &workflow.steps {
            pending_deps.insert(step.id.clone(), step.depends_on.len());
            for dep in &step.depends_on {
                dependents.entry(dep.clone()).or_default().push(step.id.clone());
            }
        }

        let mut state = RunState {
            ctx,
            steps: workflow
                .steps
                .iter()
                .map(|s| (s.id.clone(), Arc::new(s.clone())))
                .collect(),
            exprs,
            pending_deps,
            dependents,
            join_set: JoinSet::new(),
            semaphore: Arc::new(Semaphore::new(workflow.max_parallel_steps.max(1))),
            retry: workflow.error_handling.retry.clone(),
        };

        let timed_out = match workflow.run_timeout {
            Some(budget) => tokio::time::timeout(budget, self.drive(&mut state))
                .await
                .is_err(),
            None => {
                self.drive(&mut state).await;
                false
            }
        };

        if timed_out {
            warn!(budget = ?workflow.run_timeout, "run timed out, cancelling in-flight steps");
            state.join_set.abort_all();
            let timeout_err = EngineError::Timeout(workflow.run_timeout.unwrap_or_default());
            let running: Vec<String> = state
                .ctx
                .results
                .iter()
                .filter(|(_, r)| r.status == StepStatus::Running)
                .map(|(id, _)| id.clone())
                .collect();
            for id in running {
                let result = state.ctx.results.get_mut(&id).unwrap();
                result.status = StepStatus::Failed;
                result.error = Some(timeout_err.to_string());
                result.finished_at = Some(Utc::now());
            }
        }

        // Anything not driven to a terminal status (timeout, aborted task)
        // resolves to skipped so every step has exactly one terminal result.
        for result in state.ctx.results.values_mut() {
            if !result.status.is_terminal() {
                *result = StepResult::skipped();
            }
        }

        let mut counters = RunCounters::default();
        for result in state.ctx.results.values() {
            counters.attempts += result.attempts;
            match result.status {
                StepStatus::Success => counters.succeeded += 1,
                StepStatus::Failed => counters.failed += 1,
                StepStatus::Skipped => counters.skipped += 1,
                _ => {}
            }
        }

        // A timed-out run is failed even if the cancellation caught no step
        // in flight and everything resolved to skipped.
        let status = if counters.failed == 0 && !timed_out {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };

        info!(
            %status,
            succeeded = counters.succeeded,
            failed = counters.failed,
            skipped = counters.skipped,
            "run finished"
        );

        Ok(RunOutcome {
            run_id: state.ctx.run_id,
            workflow_id: workflow.id,
            status,
            counters,
            context: state.ctx,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Spawn-and-join loop: dispatch every ready step, then absorb the next
    /// completion, until nothing is running and nothing can start.
    async fn drive(&self, state: &mut RunState) {
        loop {
            self.spawn_ready(state);

            match state.join_set.join_next().await {
                None => break,
                Some(Ok((step_id, outcome, attempts))) => {
                    self.absorb(state, &step_id, outcome, attempts);
                }
                Some(Err(join_err)) => {
                    // An aborted or panicked step task; its result is
                    // finalised by the caller.
                    error!("step task ended abnormally: {join_err}");
                }
            }
        }
    }

    fn spawn_ready(&self, state: &mut RunState) {
        let ready: Vec<String> = state
            .pending_deps
            .iter()
            .filter(|(id, &deps)| {
                deps == 0 && state.ctx.results[id.as_str()].status == StepStatus::Pending
            })
            .map(|(id, _)| id.clone())
            .collect();

        for step_id in ready {
            let step = state.steps[&step_id].clone();
            let result = state.ctx.results.get_mut(&step_id).unwrap();
            result.status = StepStatus::Running;
            result.started_at = Some(Utc::now());

            // Dependencies are terminal, so the snapshot carries everything
            // this step may reference.
            let ctx = state.ctx.clone();
            let expr = state.exprs.get(&step_id).cloned();
            let retry = state.retry.clone();
            let semaphore = state.semaphore.clone();
            let client = self.client.clone();
            let dispatcher = self.dispatcher.clone();
            let functions = self.functions.clone();
            let breakers = self.breakers.clone();

            state.join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let attempts = Arc::new(AtomicU32::new(0));

                let fut = execute_step(
                    &step, &ctx, expr, &retry, client, dispatcher, functions, breakers,
                    attempts.clone(),
                );
                let outcome = match step.timeout {
                    Some(budget) => match tokio::time::timeout(budget, fut).await {
                        Ok(outcome) => outcome,
                        Err(_) => StepOutcome::Failed(EngineError::Timeout(budget).to_string()),
                    },
                    None => fut.await,
                };

                (step.id.clone(), outcome, attempts.load(Ordering::SeqCst))
            });
        }
    }

    fn absorb(&self, state: &mut RunState, step_id: &str, outcome: StepOutcome, attempts: u32) {
        let finished_at = Some(Utc::now());
        match outcome {
            StepOutcome::Success(output) => {
                let result = state.ctx.results.get_mut(step_id).unwrap();
                result.status = StepStatus::Success;
                result.output = output;
                result.attempts = attempts.max(1);
                result.finished_at = finished_at;

                if let Some(children) = state.dependents.get(step_id) {
                    for child in children.clone() {
                        if let Some(deps) = state.pending_deps.get_mut(&child) {
                            *deps = deps.saturating_sub(1);
                        }
                    }
                }
            }
            StepOutcome::ConditionFalse => {
                info!(step = step_id, "condition false, skipping dependents");
                let result = state.ctx.results.get_mut(step_id).unwrap();
                result.status = StepStatus::Success;
                result.output = Value::Bool(false);
                result.attempts = 1;
                result.finished_at = finished_at;

                skip_transitive(state, step_id);
            }
            StepOutcome::Failed(detail) => {
                warn!(step = step_id, error = %detail, "step failed");
                let result = state.ctx.results.get_mut(step_id).unwrap();
                result.status = StepStatus::Failed;
                result.error = Some(detail);
                result.attempts = attempts.max(1);
                result.finished_at = finished_at;

                skip_transitive(state, step_id);
            }
        }
    }
}

/// Mark every step transitively depending on `from` as skipped.
fn skip_transitive(state: &mut RunState, from: &str) {
    let mut queue: VecDeque<String> = state
        .dependents
        .get(from)
        .map(|c| c.iter().cloned().collect())
        .unwrap_or_default();

    while let Some(id) = queue.pop_front() {
        let result = state.ctx.results.get_mut(&id).unwrap();
        if result.status.is_terminal() {
            continue;
        }
        *result = StepResult::skipped();
        if let Some(children) = state.dependents.get(&id) {
            queue.extend(children.iter().cloned());
        }
    }
}

// ---------------------------------------------------------------------------
// Per-kind execution
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn execute_step(
    step: &Step,
    ctx: &RunContext,
    expr: Option<Arc<Expr>>,
    retry: &RetryPolicy,
    client: Arc<dyn IntegrationClient>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    functions: Arc<FunctionRegistry>,
    breakers: Arc<BreakerRegistry>,
    attempts: Arc<AtomicU32>,
) -> StepOutcome {
    match &step.kind {
        StepKind::ApiCall { endpoint, parameters } => {
            let parameters = match condition::interpolate(parameters, ctx) {
                Ok(p) => p,
                Err(e) => return StepOutcome::Failed(e.to_string()),
            };
            let breaker = breakers.breaker(&endpoint.integration);
            call_with_retry(&step.id, client, breaker, endpoint, &parameters, retry, &attempts)
                .await
        }

        StepKind::Condition { .. } => {
            let expr = expr.expect("condition expression parsed at run start");
            attempts.store(1, Ordering::SeqCst);
            match expr.evaluate(ctx) {
                Ok(true) => StepOutcome::Success(Value::Bool(true)),
                Ok(false) => StepOutcome::ConditionFalse,
                Err(e) => StepOutcome::Failed(e.to_string()),
            }
        }

        StepKind::Notification { severity, message, channels } => {
            attempts.store(1, Ordering::SeqCst);
            let message = match condition::interpolate(&Value::String(message.clone()), ctx) {
                Ok(Value::String(m)) => m,
                _ => message.clone(),
            };
            // Fire-and-forget: a failed send is logged, never retried, never
            // fatal to the run.
            match dispatcher.send(*severity, &message, channels).await {
                Ok(()) => StepOutcome::Success(json!({ "delivered": true })),
                Err(e) => {
                    warn!(
                        step = %step.id,
                        "{}",
                        EngineError::NotificationFailure(e.to_string())
                    );
                    StepOutcome::Success(json!({ "delivered": false }))
                }
            }
        }

        StepKind::CustomFunction { function } => {
            attempts.store(1, Ordering::SeqCst);
            let f = functions
                .get(function)
                .expect("function presence checked at run start")
                .clone();
            // A panicking transformation is contained as a step failure.
            let call = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(ctx)));
            match call {
                Ok(Ok(output)) => StepOutcome::Success(output),
                Ok(Err(e)) => StepOutcome::Failed(e.to_string()),
                Err(_) => StepOutcome::Failed(format!("function '{function}' panicked")),
            }
        }
    }
}

/// Attempt an integration call through the circuit breaker, retrying with
/// exponential back-off up to the policy's attempt budget.
///
/// A `CircuitOpen` rejection consumes an attempt without touching the client
/// or the failure counter. A non-retryable failure short-circuits the loop.
async fn call_with_retry(
    step_id: &str,
    client: Arc<dyn IntegrationClient>,
    breaker: Arc<CircuitBreaker>,
    endpoint: &EndpointRef,
    parameters: &Value,
    retry: &RetryPolicy,
    attempts: &AtomicU32,
) -> StepOutcome {
    let budget = retry.max_retries.max(1);
    let mut last_error = String::from("no attempt made");

    for attempt in 1..=budget {
        if attempt > 1 {
            tokio::time::sleep(retry.delay(attempt - 1)).await;
        }
        attempts.store(attempt, Ordering::SeqCst);

        match breaker.try_acquire() {
            Err(rejected) => {
                // No network attempt is made while the circuit is open.
                warn!(step = step_id, attempt, "{rejected}");
                last_error = rejected.to_string();
                continue;
            }
            Ok(()) => {}
        }

        match client
            .execute(endpoint, parameters, breaker.config().call_timeout)
            .await
        {
            Ok(response) if response.success => {
                breaker.on_success();
                return StepOutcome::Success(json!({
                    "success": true,
                    "status_code": response.status_code,
                    "data": response.data,
                    "latency_ms": response.latency.as_millis() as u64,
                }));
            }
            Ok(response) => {
                last_error = format!(
                    "integration '{}' answered status {}",
                    endpoint.integration, response.status_code
                );
                if !response_is_retryable(&response) {
                    // The integration answered; only retryable failures count
                    // toward the breaker threshold.
                    breaker.on_success();
                    return StepOutcome::Failed(last_error);
                }
                breaker.on_failure();
                warn!(step = step_id, attempt, error = %last_error, "retryable failure");
            }
            Err(call_err) => {
                last_error = call_err.to_string();
                if !error_is_retryable(&call_err) {
                    breaker.on_success();
                    return StepOutcome::Failed(last_error);
                }
                breaker.on_failure();
                warn!(step = step_id, attempt, error = %last_error, "retryable failure");
            }
        }
    }

    StepOutcome::Failed(
        EngineError::RetryExhausted {
            step: step_id.to_string(),
            attempts: attempts.load(Ordering::SeqCst),
            last_error,
        }
        .to_string(),
    )
}
