//! `engine` crate — workflow orchestration and resilience engine.
//!
//! Triggers decide when a run starts (schedules, events, metric thresholds,
//! upstream completion); the step executor walks each run's dependency DAG
//! with bounded parallelism, routing integration calls through per-target
//! circuit breakers with exponential back-off; the health monitor feeds
//! rolling endpoint statistics back into threshold triggers and breakers.

pub mod models;
pub mod error;
pub mod dag;
pub mod condition;
pub mod breaker;
pub mod executor;
pub mod scheduler;
pub mod monitor;
pub mod store;
pub mod orchestrator;

pub use error::EngineError;
pub use models::{
    Comparator, ErrorHandlingPolicy, ErrorStrategy, Metric, RetryPolicy, RunContext, RunOutcome,
    RunStatus, Step, StepKind, StepResult, StepStatus, Trigger, Workflow,
};
pub use breaker::{BreakerRegistry, BreakerState, CircuitBreaker};
pub use dag::validate_dag;
pub use executor::{FunctionRegistry, StepExecutor};
pub use monitor::{HealthMonitor, MonitorConfig};
pub use orchestrator::Orchestrator;
pub use scheduler::{RunRequest, TriggerScheduler};
pub use store::{DefinitionStore, InMemoryStore};
