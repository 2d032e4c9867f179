//! Core domain models for the orchestration engine.
//!
//! These types are the source of truth for what a workflow looks like in
//! memory. The definition store serialises them as JSON; a definition is
//! immutable once a run has started.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use integrations::{EndpointRef, Severity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// Metric names the Health Monitor publishes per integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Rolling success rate over the sample window, 0.0..=1.0.
    SuccessRate,
    /// Rolling 95th-percentile latency in milliseconds.
    LatencyP95,
}

/// Comparator for threshold triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Equals,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
}

impl Comparator {
    /// Apply the comparator to `observed <op> threshold`.
    pub fn compare(&self, observed: f64, threshold: f64) -> bool {
        match self {
            Self::Equals => observed == threshold,
            Self::GreaterThan => observed > threshold,
            Self::LessThan => observed < threshold,
            Self::GreaterOrEqual => observed >= threshold,
            Self::LessOrEqual => observed <= threshold,
        }
    }
}

/// How a workflow run is started. Exactly one kind per trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fires on a cron schedule. The expression is parsed once at
    /// registration; missed ticks are not backfilled.
    TimeBased { cron: String },
    /// Fires when a named event is published.
    EventDriven { event: String },
    /// Fires when a monitored metric crosses the comparator boundary.
    /// Edge-triggered: re-arms only after the metric returns below threshold.
    ThresholdBased {
        integration: String,
        metric: Metric,
        comparator: Comparator,
        value: f64,
    },
    /// Fires when an upstream workflow run reaches terminal `success`.
    Dependency { upstream: Uuid },
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Kind-specific configuration of a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Call an external integration through the retry/circuit-breaker path.
    ApiCall {
        endpoint: EndpointRef,
        #[serde(default)]
        parameters: Value,
    },
    /// Evaluate a boolean expression against the run context. A false result
    /// marks every transitive dependent `skipped`.
    Condition { expression: String },
    /// Fire-and-forget notification; never retried, never fatal to the run.
    Notification {
        severity: Severity,
        message: String,
        channels: Vec<String>,
    },
    /// Invoke a registered pure transformation of the run context.
    CustomFunction { function: String },
}

/// A single unit of work within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier within this workflow (referenced by `depends_on`).
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Step ids that must reach a terminal status before this step starts.
    /// Steps with no dependency on each other may run in parallel.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Budget for the whole step, retries included.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl Step {
    /// The integration target this step calls, if any.
    pub fn integration(&self) -> Option<&str> {
        match &self.kind {
            StepKind::ApiCall { endpoint, .. } => Some(&endpoint.integration),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Error handling policy
// ---------------------------------------------------------------------------

/// Per-integration circuit-breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// Budget handed to the integration client for a single call.
    #[serde(rename = "timeout")]
    pub call_timeout: Duration,
    /// Time an open breaker waits before allowing a half-open probe.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            call_timeout: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Step-attempt retry tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempt budget for one step (first try included).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `n` (1-based): `min(max_backoff, factor^n * base)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt as i32);
        let raw_ms = self.base_delay.as_millis() as f64 * factor;
        let capped = raw_ms.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// What to do once a run fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Accept the failure; dispatch no re-run and no fallback.
    FailFast,
    /// Re-run the workflow up to `retry_count` times, then fall back if a
    /// fallback workflow is configured.
    Retry,
    /// Skip re-runs and dispatch the fallback workflow directly.
    Fallback,
}

/// Resolution policy applied after a run reaches terminal `failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlingPolicy {
    pub strategy: ErrorStrategy,
    /// Whole-run re-runs when the strategy is `retry`.
    #[serde(default)]
    pub retry_count: u32,
    /// Dispatched at most once per failing run; its own failures never
    /// cascade into another fallback.
    #[serde(default)]
    pub fallback_workflow: Option<Uuid>,
    /// Channels notified on final failure; empty means no notification.
    #[serde(default)]
    pub notify_channels: Vec<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ErrorHandlingPolicy {
    fn default() -> Self {
        Self {
            strategy: ErrorStrategy::FailFast,
            retry_count: 0,
            fallback_workflow: None,
            notify_channels: Vec::new(),
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

fn default_max_parallel() -> usize {
    4
}

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub trigger: Trigger,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub error_handling: ErrorHandlingPolicy,
    /// Upper bound on steps of one run executing concurrently.
    #[serde(default = "default_max_parallel")]
    pub max_parallel_steps: usize,
    /// Budget for the whole run; elapsed time cancels in-flight steps.
    #[serde(default)]
    pub run_timeout: Option<Duration>,
    /// When true, at most one run of this workflow is in flight; extra
    /// trigger fires are dropped.
    #[serde(default)]
    pub exclusive: bool,
}

impl Workflow {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, trigger: Trigger, steps: Vec<Step>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            trigger,
            steps,
            error_handling: ErrorHandlingPolicy::default(),
            max_parallel_steps: default_max_parallel(),
            run_timeout: None,
            exclusive: false,
        }
    }

    /// All integration targets referenced by `api_call` steps.
    pub fn integrations(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = self.steps.iter().filter_map(|s| s.integration()).collect();
        targets.sort_unstable();
        targets.dedup();
        targets
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Latest result of a step. A step may be attempted several times across
/// retries; only the latest result plus the attempt counter is retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    pub output: Value,
    pub error: Option<String>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            output: Value::Null,
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            finished_at: Some(Utc::now()),
            ..Self::pending()
        }
    }
}

/// Per-run variable context, owned exclusively by the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    /// Payload injected by the firing trigger (event payload, metric sample).
    pub trigger_payload: Value,
    /// Latest result per step id.
    pub results: HashMap<String, StepResult>,
}

impl RunContext {
    pub fn new(workflow_id: Uuid, trigger_payload: Value) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow_id,
            trigger_payload,
            results: HashMap::new(),
        }
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Raw counters exposed to an external metrics sink.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    /// Total step attempts, retries included.
    pub attempts: u32,
}

/// The result of one completed workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub status: RunStatus,
    pub context: RunContext,
    pub counters: RunCounters,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Health monitoring
// ---------------------------------------------------------------------------

/// One health-check observation of an integration endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSample {
    pub at: DateTime<Utc>,
    pub success: bool,
    pub latency: Duration,
}

/// A metric observation published by the Health Monitor into the Trigger
/// Scheduler's threshold path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub integration: String,
    pub metric: Metric,
    pub value: f64,
}
