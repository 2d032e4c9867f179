//! Health monitor — out-of-band endpoint polling, independent of workflow
//! runs.
//!
//! Each watched integration gets a rolling window of [`MonitorSample`]s.
//! Every recorded sample republishes the integration's rolling success rate
//! and p95 latency into the trigger scheduler's threshold path, raises an
//! anomaly event when the sample's latency deviates too far from the rolling
//! mean (z-score), and forces the integration's circuit breaker open after a
//! configurable streak of consecutive failures.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use integrations::{EndpointRef, IntegrationClient};

use crate::breaker::BreakerRegistry;
use crate::models::{Metric, MetricSample, MonitorSample};
use crate::scheduler::TriggerScheduler;

/// Health-monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Delay between polling rounds.
    pub poll_interval: Duration,
    /// Budget for a single health probe.
    pub probe_timeout: Duration,
    /// Bounded sample count per integration; oldest evicted on insert.
    pub window_size: usize,
    /// Samples required before anomaly detection activates.
    pub min_samples: usize,
    /// Standard deviations from the rolling mean that flag an anomaly.
    pub stddev_threshold: f64,
    /// Consecutive probe failures that force the circuit breaker open.
    pub failure_streak: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            window_size: 120,
            min_samples: 10,
            stddev_threshold: 3.0,
            failure_streak: 5,
        }
    }
}

/// Read-only view of one integration's rolling statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationStats {
    pub sample_count: usize,
    pub success_rate: f64,
    pub latency_mean_ms: f64,
    pub latency_p95_ms: f64,
}

struct Window {
    samples: VecDeque<MonitorSample>,
    consecutive_failures: u32,
}

impl Window {
    fn new() -> Self {
        Self { samples: VecDeque::new(), consecutive_failures: 0 }
    }

    fn latencies_ms(&self) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| s.latency.as_secs_f64() * 1_000.0)
            .collect()
    }

    fn stats(&self) -> IntegrationStats {
        let count = self.samples.len();
        let successes = self.samples.iter().filter(|s| s.success).count();
        let latencies = self.latencies_ms();
        IntegrationStats {
            sample_count: count,
            success_rate: if count == 0 { 1.0 } else { successes as f64 / count as f64 },
            latency_mean_ms: mean(&latencies),
            latency_p95_ms: percentile(&latencies, 0.95),
        }
    }
}

/// Continuous health poller for registered integrations.
pub struct HealthMonitor {
    client: Arc<dyn IntegrationClient>,
    scheduler: Arc<TriggerScheduler>,
    breakers: Arc<BreakerRegistry>,
    config: MonitorConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl HealthMonitor {
    pub fn new(
        client: Arc<dyn IntegrationClient>,
        scheduler: Arc<TriggerScheduler>,
        breakers: Arc<BreakerRegistry>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            client,
            scheduler,
            breakers,
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching an integration's health endpoint.
    pub fn watch(&self, integration: &str) {
        self.windows
            .lock()
            .unwrap()
            .entry(integration.to_string())
            .or_insert_with(Window::new);
    }

    /// Probe every watched integration once.
    pub async fn poll_once(&self) {
        let targets: Vec<String> = self.windows.lock().unwrap().keys().cloned().collect();

        for integration in targets {
            let endpoint = EndpointRef::health(&integration);
            let started = tokio::time::Instant::now();
            let outcome = self
                .client
                .execute(&endpoint, &json!({}), self.config.probe_timeout)
                .await;

            let sample = match outcome {
                Ok(response) => MonitorSample {
                    at: Utc::now(),
                    success: response.success,
                    latency: response.latency,
                },
                Err(e) => {
                    debug!(%integration, "health probe failed: {e}");
                    MonitorSample {
                        at: Utc::now(),
                        success: false,
                        latency: started.elapsed(),
                    }
                }
            };
            self.record_sample(&integration, sample);
        }
    }

    /// Dedicated polling process.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.poll_once().await;
        }
    }

    /// Fold one observation into the rolling window and emit the resulting
    /// signals (threshold metrics, anomaly events, forced breaker opens).
    pub fn record_sample(&self, integration: &str, sample: MonitorSample) {
        let sample_latency_ms = sample.latency.as_secs_f64() * 1_000.0;
        let (stats, anomaly_z, streak) = {
            let mut windows = self.windows.lock().unwrap();
            let window = windows
                .entry(integration.to_string())
                .or_insert_with(Window::new);

            if window.samples.len() == self.config.window_size {
                window.samples.pop_front();
            }
            if sample.success {
                window.consecutive_failures = 0;
            } else {
                window.consecutive_failures += 1;
            }
            window.samples.push_back(sample);

            let stats = window.stats();
            let anomaly_z = if window.samples.len() >= self.config.min_samples {
                let latencies = window.latencies_ms();
                let mu = mean(&latencies);
                let sigma = stddev(&latencies, mu);
                if sigma > 0.0 {
                    let z = (sample_latency_ms - mu).abs() / sigma;
                    (z > self.config.stddev_threshold).then_some(z)
                } else {
                    None
                }
            } else {
                None
            };

            (stats, anomaly_z, window.consecutive_failures)
        };

        self.scheduler.observe_metric(&MetricSample {
            integration: integration.to_string(),
            metric: Metric::SuccessRate,
            value: stats.success_rate,
        });
        self.scheduler.observe_metric(&MetricSample {
            integration: integration.to_string(),
            metric: Metric::LatencyP95,
            value: stats.latency_p95_ms,
        });

        if let Some(z) = anomaly_z {
            warn!(%integration, zscore = z, latency_ms = sample_latency_ms, "latency anomaly");
            self.scheduler.publish(
                "health.anomaly",
                json!({
                    "integration": integration,
                    "latency_ms": sample_latency_ms,
                    "zscore": z,
                }),
            );
        }

        if streak >= self.config.failure_streak {
            warn!(%integration, streak, "persistent probe failure, forcing circuit open");
            self.breakers.force_open(integration);
        }
    }

    /// Current rolling statistics per watched integration, for an external
    /// reporting surface.
    pub fn snapshot(&self) -> HashMap<String, IntegrationStats> {
        self.windows
            .lock()
            .unwrap()
            .iter()
            .map(|(k, w)| (k.clone(), w.stats()))
            .collect()
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn stddev(values: &[f64], mu: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((sorted.len() - 1) as f64 * p).ceil() as usize;
    sorted[idx]
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::models::{CircuitBreakerConfig, Comparator, Trigger, Workflow};
    use integrations::mock::MockIntegration;

    fn sample(success: bool, latency_ms: u64) -> MonitorSample {
        MonitorSample {
            at: Utc::now(),
            success,
            latency: Duration::from_millis(latency_ms),
        }
    }

    fn monitor_with(
        config: MonitorConfig,
    ) -> (Arc<HealthMonitor>, Arc<TriggerScheduler>, Arc<BreakerRegistry>) {
        let (scheduler, rx) = TriggerScheduler::new();
        // The run queue is irrelevant for these tests.
        std::mem::forget(rx);
        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default()));
        let monitor = Arc::new(HealthMonitor::new(
            MockIntegration::always_ok(),
            scheduler.clone(),
            breakers.clone(),
            config,
        ));
        (monitor, scheduler, breakers)
    }

    #[test]
    fn window_is_bounded_and_evicts_oldest() {
        let (monitor, _, _) = monitor_with(MonitorConfig {
            window_size: 3,
            ..MonitorConfig::default()
        });

        monitor.record_sample("crm", sample(false, 10));
        for _ in 0..3 {
            monitor.record_sample("crm", sample(true, 10));
        }

        let stats = monitor.snapshot().remove("crm").unwrap();
        assert_eq!(stats.sample_count, 3);
        // The initial failure was evicted.
        assert_eq!(stats.success_rate, 1.0);
    }

    #[test]
    fn rolling_stats_reflect_successes_and_latency() {
        let (monitor, _, _) = monitor_with(MonitorConfig::default());

        monitor.record_sample("crm", sample(true, 100));
        monitor.record_sample("crm", sample(true, 200));
        monitor.record_sample("crm", sample(false, 300));
        monitor.record_sample("crm", sample(true, 400));

        let stats = monitor.snapshot().remove("crm").unwrap();
        assert_eq!(stats.sample_count, 4);
        assert!((stats.success_rate - 0.75).abs() < 1e-9);
        assert!((stats.latency_mean_ms - 250.0).abs() < 1e-9);
        assert_eq!(stats.latency_p95_ms, 400.0);
    }

    #[test]
    fn samples_feed_the_threshold_trigger_path() {
        let (scheduler, mut rx) = TriggerScheduler::new();
        let wf = Workflow::new(
            "degraded",
            Trigger::ThresholdBased {
                integration: "crm".into(),
                metric: Metric::SuccessRate,
                comparator: Comparator::LessThan,
                value: 0.5,
            },
            vec![],
        );
        scheduler.register(&wf).unwrap();

        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default()));
        let monitor = HealthMonitor::new(
            MockIntegration::always_ok(),
            scheduler.clone(),
            breakers,
            MonitorConfig::default(),
        );

        monitor.record_sample("crm", sample(true, 10));
        assert!(rx.try_recv().is_err());

        // Success rate falls to 1/3 < 0.5: the threshold trigger fires.
        monitor.record_sample("crm", sample(false, 10));
        monitor.record_sample("crm", sample(false, 10));
        let request = rx.try_recv().expect("threshold fired");
        assert_eq!(request.workflow_id, wf.id);
    }

    #[test]
    fn anomaly_requires_minimum_sample_count() {
        let (scheduler, mut rx) = TriggerScheduler::new();
        let listener = Workflow::new(
            "on-anomaly",
            Trigger::EventDriven { event: "health.anomaly".into() },
            vec![],
        );
        scheduler.register(&listener).unwrap();

        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default()));
        let monitor = HealthMonitor::new(
            MockIntegration::always_ok(),
            scheduler.clone(),
            breakers,
            MonitorConfig {
                min_samples: 10,
                stddev_threshold: 3.0,
                ..MonitorConfig::default()
            },
        );

        // Cold start: far too few samples, an outlier raises nothing.
        for _ in 0..4 {
            monitor.record_sample("crm", sample(true, 100));
        }
        monitor.record_sample("crm", sample(true, 5_000));
        assert!(rx.try_recv().is_err());

        // Warm window with steady latency, then the same outlier flags.
        for _ in 0..20 {
            monitor.record_sample("crm", sample(true, 100));
        }
        // Steady values have zero deviation; add slight jitter.
        monitor.record_sample("crm", sample(true, 101));
        monitor.record_sample("crm", sample(true, 99));
        monitor.record_sample("crm", sample(true, 5_000));

        let request = rx.try_recv().expect("anomaly event published");
        assert_eq!(request.workflow_id, listener.id);
        assert_eq!(request.payload["event"], "health.anomaly");
        assert_eq!(request.payload["data"]["integration"], "crm");
    }

    #[test]
    fn persistent_failure_forces_the_circuit_open() {
        let (monitor, _, breakers) = monitor_with(MonitorConfig {
            failure_streak: 3,
            ..MonitorConfig::default()
        });

        monitor.record_sample("crm", sample(false, 10));
        monitor.record_sample("crm", sample(false, 10));
        assert_eq!(breakers.breaker("crm").state(), BreakerState::Closed);

        monitor.record_sample("crm", sample(false, 10));
        assert_eq!(breakers.breaker("crm").state(), BreakerState::Open);

        // A success resets the streak.
        monitor.record_sample("billing", sample(false, 10));
        monitor.record_sample("billing", sample(true, 10));
        monitor.record_sample("billing", sample(false, 10));
        monitor.record_sample("billing", sample(false, 10));
        assert_eq!(breakers.breaker("billing").state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn poll_once_records_one_sample_per_watched_integration() {
        let (scheduler, rx) = TriggerScheduler::new();
        std::mem::forget(rx);
        let breakers = Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default()));
        let client = MockIntegration::always_ok();
        let monitor = HealthMonitor::new(
            client.clone(),
            scheduler,
            breakers,
            MonitorConfig::default(),
        );

        monitor.watch("crm");
        monitor.watch("billing");
        monitor.poll_once().await;

        assert_eq!(client.call_count(), 2);
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot["crm"].sample_count, 1);
        assert_eq!(snapshot["billing"].sample_count, 1);
    }
}
