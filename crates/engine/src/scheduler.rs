//! Trigger scheduler — decides *when* a workflow run starts.
//!
//! One scheduler instance exists per process. Firing never executes a run
//! in place: it enqueues a [`RunRequest`] on an mpsc channel consumed by the
//! orchestrator, so scheduling latency stays decoupled from run duration.
//!
//! Cron expressions are parsed once at registration (`cron::Schedule`, the
//! 6-field `sec min hour dom month dow` format); the tick loop only compares
//! precomputed next-fire times.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{Comparator, Metric, MetricSample, RunStatus, Trigger, Workflow};
use crate::EngineError;

/// A request to start one workflow run, with the trigger-supplied payload.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub workflow_id: Uuid,
    pub payload: Value,
}

struct CronEntry {
    workflow_id: Uuid,
    schedule: Schedule,
    /// Armed on the first tick after registration; missed ticks are never
    /// backfilled — at most one fire per tick boundary.
    next_fire: Option<DateTime<Utc>>,
}

struct ThresholdEntry {
    workflow_id: Uuid,
    integration: String,
    metric: Metric,
    comparator: Comparator,
    value: f64,
    /// Edge-trigger latch: re-arms only once the metric leaves the breach.
    in_breach: bool,
}

#[derive(Default)]
struct SchedulerState {
    schedules: Vec<CronEntry>,
    subscriptions: HashMap<String, Vec<Uuid>>,
    thresholds: Vec<ThresholdEntry>,
    /// upstream workflow id -> workflows triggered by its success.
    downstream: HashMap<Uuid, Vec<Uuid>>,
}

/// Process-wide trigger registry and firing logic.
pub struct TriggerScheduler {
    run_tx: mpsc::UnboundedSender<RunRequest>,
    state: Mutex<SchedulerState>,
}

impl TriggerScheduler {
    /// Create the scheduler and the receiving end of its run queue.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RunRequest>) {
        let (run_tx, run_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self { run_tx, state: Mutex::new(SchedulerState::default()) }),
            run_rx,
        )
    }

    /// Register a workflow's trigger. A cron expression that doesn't parse is
    /// rejected here, before any run is attempted. Re-registering a workflow
    /// replaces its previous trigger.
    pub fn register(&self, workflow: &Workflow) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        remove_workflow(&mut state, workflow.id);

        match &workflow.trigger {
            Trigger::TimeBased { cron } => {
                let schedule = Schedule::from_str(cron).map_err(|e| {
                    EngineError::Validation(format!("invalid cron expression '{cron}': {e}"))
                })?;
                state.schedules.push(CronEntry {
                    workflow_id: workflow.id,
                    schedule,
                    next_fire: None,
                });
            }
            Trigger::EventDriven { event } => {
                state
                    .subscriptions
                    .entry(event.clone())
                    .or_default()
                    .push(workflow.id);
            }
            Trigger::ThresholdBased { integration, metric, comparator, value } => {
                if !value.is_finite() {
                    return Err(EngineError::Validation(format!(
                        "threshold value {value} is not a finite number"
                    )));
                }
                state.thresholds.push(ThresholdEntry {
                    workflow_id: workflow.id,
                    integration: integration.clone(),
                    metric: *metric,
                    comparator: *comparator,
                    value: *value,
                    in_breach: false,
                });
            }
            Trigger::Dependency { upstream } => {
                state
                    .downstream
                    .entry(*upstream)
                    .or_default()
                    .push(workflow.id);
            }
        }

        info!(workflow_id = %workflow.id, trigger = ?workflow.trigger, "trigger registered");
        Ok(())
    }

    /// Fire every schedule whose next-fire time has elapsed, computing the
    /// next occurrence from `now` immediately after firing.
    pub fn tick(&self, now: DateTime<Utc>) {
        let mut due: Vec<(Uuid, DateTime<Utc>)> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for entry in &mut state.schedules {
                match entry.next_fire {
                    None => {
                        // First tick after registration arms the schedule.
                        entry.next_fire = entry.schedule.after(&now).next();
                    }
                    Some(at) if at <= now => {
                        due.push((entry.workflow_id, at));
                        entry.next_fire = entry.schedule.after(&now).next();
                    }
                    Some(_) => {}
                }
            }
        }

        for (workflow_id, fired_at) in due {
            debug!(%workflow_id, %fired_at, "schedule fired");
            self.enqueue(workflow_id, json!({ "fired_at": fired_at.to_rfc3339() }));
        }
    }

    /// Dedicated ticking process.
    pub async fn run_ticker(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.tick(Utc::now());
        }
    }

    /// Publish a named event. Every subscribed trigger starts an independent
    /// run with the payload injected into its context; delivery is
    /// at-least-once and duplicates yield isolated runs.
    pub fn publish(&self, event: &str, payload: Value) {
        let subscribers: Vec<Uuid> = {
            let state = self.state.lock().unwrap();
            state.subscriptions.get(event).cloned().unwrap_or_default()
        };

        debug!(event, subscribers = subscribers.len(), "event published");
        for workflow_id in subscribers {
            self.enqueue(
                workflow_id,
                json!({ "event": event, "data": payload.clone() }),
            );
        }
    }

    /// Evaluate one metric sample against all threshold triggers.
    ///
    /// Edge-triggered: a trigger fires when its metric crosses the comparator
    /// boundary and cannot re-fire until a sample lands back outside the
    /// breach.
    pub fn observe_metric(&self, sample: &MetricSample) {
        let mut fired: Vec<Uuid> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for entry in &mut state.thresholds {
                if entry.integration != sample.integration || entry.metric != sample.metric {
                    continue;
                }
                let breached = entry.comparator.compare(sample.value, entry.value);
                if breached && !entry.in_breach {
                    fired.push(entry.workflow_id);
                }
                entry.in_breach = breached;
            }
        }

        for workflow_id in fired {
            info!(
                %workflow_id,
                integration = %sample.integration,
                metric = ?sample.metric,
                value = sample.value,
                "threshold breached"
            );
            self.enqueue(
                workflow_id,
                json!({
                    "integration": sample.integration,
                    "metric": sample.metric,
                    "value": sample.value,
                }),
            );
        }
    }

    /// Feed a run's terminal status back into dependency triggers. Only
    /// `success` fires downstream workflows.
    pub fn workflow_finished(&self, workflow_id: Uuid, status: RunStatus) {
        if status != RunStatus::Success {
            return;
        }
        let downstream: Vec<Uuid> = {
            let state = self.state.lock().unwrap();
            state.downstream.get(&workflow_id).cloned().unwrap_or_default()
        };
        for dependent in downstream {
            debug!(upstream = %workflow_id, %dependent, "dependency trigger fired");
            self.enqueue(
                dependent,
                json!({ "upstream": workflow_id, "status": "success" }),
            );
        }
    }

    fn enqueue(&self, workflow_id: Uuid, payload: Value) {
        // Send only fails when the orchestrator is gone, during shutdown.
        let _ = self.run_tx.send(RunRequest { workflow_id, payload });
    }
}

fn remove_workflow(state: &mut SchedulerState, workflow_id: Uuid) {
    state.schedules.retain(|e| e.workflow_id != workflow_id);
    for subs in state.subscriptions.values_mut() {
        subs.retain(|id| *id != workflow_id);
    }
    state.thresholds.retain(|e| e.workflow_id != workflow_id);
    for deps in state.downstream.values_mut() {
        deps.retain(|id| *id != workflow_id);
    }
}
