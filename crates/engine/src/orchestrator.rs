//! The orchestrating context — the one owner of all shared engine state.
//!
//! Registries (circuit breakers, custom functions), the trigger scheduler,
//! and the step executor are constructed here and injected into each other;
//! nothing is ambient or global. The orchestrator consumes the scheduler's
//! run queue, enforces per-workflow mutual exclusion, and applies the
//! `ErrorHandlingPolicy` once a run reaches terminal failure.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use integrations::{IntegrationClient, NotificationDispatcher, Severity};

use crate::breaker::BreakerRegistry;
use crate::condition;
use crate::dag::validate_dag;
use crate::executor::{FunctionRegistry, StepExecutor};
use crate::models::{
    CircuitBreakerConfig, ErrorStrategy, RunOutcome, RunStatus, StepKind, Workflow,
};
use crate::scheduler::{RunRequest, TriggerScheduler};
use crate::store::DefinitionStore;
use crate::EngineError;

pub struct Orchestrator {
    store: Arc<dyn DefinitionStore>,
    scheduler: Arc<TriggerScheduler>,
    executor: StepExecutor,
    breakers: Arc<BreakerRegistry>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    run_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RunRequest>>,
    /// Workflow ids with a run in flight; only consulted for `exclusive`
    /// workflows.
    in_flight: Mutex<HashSet<Uuid>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DefinitionStore>,
        client: Arc<dyn IntegrationClient>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        functions: FunctionRegistry,
    ) -> Arc<Self> {
        let (scheduler, run_rx) = TriggerScheduler::new();
        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default()));
        let executor = StepExecutor::new(
            client,
            dispatcher.clone(),
            Arc::new(functions),
            breakers.clone(),
        );

        Arc::new(Self {
            store,
            scheduler,
            executor,
            breakers,
            dispatcher,
            run_rx: tokio::sync::Mutex::new(run_rx),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// The process-wide trigger scheduler (event publication, ticking).
    pub fn scheduler(&self) -> &Arc<TriggerScheduler> {
        &self.scheduler
    }

    /// Shared circuit-breaker registry (also consumed by the health monitor).
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Validate a workflow definition and arm its trigger.
    ///
    /// A malformed definition (bad cron, cyclic graph, unresolvable
    /// condition path) is rejected here and never reaches the executor.
    pub fn register(&self, workflow: &Workflow) -> Result<(), EngineError> {
        validate_dag(workflow)?;

        let step_ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();
        for step in &workflow.steps {
            match &step.kind {
                StepKind::Condition { expression } => {
                    condition::parse(expression)?.validate_roots(&step_ids)?;
                }
                StepKind::ApiCall { parameters, .. } => {
                    condition::validate_refs(parameters, &step_ids)?;
                }
                StepKind::Notification { message, .. } => {
                    condition::validate_str_refs(message, &step_ids)?;
                }
                StepKind::CustomFunction { .. } => {}
            }
        }

        for integration in workflow.integrations() {
            self.breakers
                .configure(integration, workflow.error_handling.circuit_breaker.clone());
        }

        self.scheduler.register(workflow)?;
        info!(workflow_id = %workflow.id, workflow = %workflow.name, "workflow registered");
        Ok(())
    }

    /// Register every workflow the definition store knows.
    pub fn register_all(&self) -> Result<(), EngineError> {
        for workflow in self.store.workflows() {
            self.register(&workflow)?;
        }
        Ok(())
    }

    /// Consume run requests until the scheduler side shuts down.
    pub async fn run(self: Arc<Self>) {
        let mut run_rx = self.run_rx.lock().await;
        while let Some(request) = run_rx.recv().await {
            let Some(workflow) = self.store.workflow(request.workflow_id) else {
                warn!(workflow_id = %request.workflow_id, "run request for unknown workflow");
                continue;
            };

            if workflow.exclusive {
                let mut in_flight = self.in_flight.lock().unwrap();
                if !in_flight.insert(workflow.id) {
                    debug!(workflow_id = %workflow.id, "exclusive workflow already running, fire dropped");
                    continue;
                }
            }

            let this = self.clone();
            tokio::spawn(async move {
                let result = this.execute(&workflow, request.payload).await;
                if let Err(e) = result {
                    warn!(workflow_id = %workflow.id, "run could not start: {e}");
                    this.scheduler.workflow_finished(workflow.id, RunStatus::Failed);
                }
                if workflow.exclusive {
                    this.in_flight.lock().unwrap().remove(&workflow.id);
                }
            });
        }
    }

    /// Execute one run and resolve its error-handling policy.
    ///
    /// The returned outcome is the run's final terminal state, after any
    /// run-level re-runs and the at-most-once fallback dispatch.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        payload: Value,
    ) -> Result<RunOutcome, EngineError> {
        let policy = &workflow.error_handling;
        let mut outcome = self.executor.run(workflow, payload.clone()).await?;

        if outcome.status == RunStatus::Failed && policy.strategy == ErrorStrategy::Retry {
            for rerun in 1..=policy.retry_count {
                info!(
                    workflow_id = %workflow.id,
                    rerun,
                    of = policy.retry_count,
                    "run failed, re-running"
                );
                outcome = self.executor.run(workflow, payload.clone()).await?;
                if outcome.status == RunStatus::Success {
                    break;
                }
            }
        }

        if outcome.status == RunStatus::Failed {
            if matches!(policy.strategy, ErrorStrategy::Retry | ErrorStrategy::Fallback) {
                if let Some(fallback_id) = policy.fallback_workflow {
                    self.dispatch_fallback(workflow, fallback_id).await;
                }
            }

            if !policy.notify_channels.is_empty() {
                let message = format!(
                    "workflow '{}' run {} failed ({} step(s) failed, {} skipped)",
                    workflow.name,
                    outcome.run_id,
                    outcome.counters.failed,
                    outcome.counters.skipped,
                );
                if let Err(e) = self
                    .dispatcher
                    .send(Severity::Critical, &message, &policy.notify_channels)
                    .await
                {
                    warn!(
                        workflow_id = %workflow.id,
                        "{}",
                        EngineError::NotificationFailure(e.to_string())
                    );
                }
            }
        }

        self.scheduler.workflow_finished(workflow.id, outcome.status);
        Ok(outcome)
    }

    /// Dispatch the fallback workflow at most once. Its own failures never
    /// cascade into another fallback, so policy recursion is impossible.
    async fn dispatch_fallback(&self, failing: &Workflow, fallback_id: Uuid) {
        let Some(fallback) = self.store.workflow(fallback_id) else {
            warn!(
                workflow_id = %failing.id,
                %fallback_id,
                "fallback workflow not found in store"
            );
            return;
        };

        info!(workflow_id = %failing.id, fallback = %fallback.name, "dispatching fallback workflow");
        let payload = serde_json::json!({ "failed_workflow": failing.id });
        match self.executor.run(&fallback, payload).await {
            Ok(outcome) => {
                self.scheduler.workflow_finished(fallback.id, outcome.status);
            }
            Err(e) => {
                warn!(fallback = %fallback.id, "fallback run could not start: {e}");
            }
        }
    }
}
