//! Scripted test doubles for [`IntegrationClient`] and
//! [`NotificationDispatcher`].
//!
//! Useful in unit and scenario tests where a real client is either
//! unavailable or irrelevant. Behaviour is scripted per call; every call is
//! recorded so tests can assert exactly what the engine attempted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    EndpointRef, IntegrationClient, IntegrationError, IntegrationErrorKind, IntegrationResponse,
    NotificationDispatcher, Severity,
};

/// What a single scripted call will do.
#[derive(Debug, Clone)]
pub enum CallScript {
    /// Succeed with the given payload.
    Ok(Value),
    /// Complete with an unsuccessful response carrying this status code.
    FailStatus(u16),
    /// Fail with an [`IntegrationError`] of the given kind.
    FailError(IntegrationErrorKind, String),
}

/// One recorded invocation of the mock client.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub endpoint: EndpointRef,
    pub parameters: Value,
    pub timeout: Duration,
}

struct MockState {
    script: VecDeque<CallScript>,
    calls: Vec<RecordedCall>,
}

/// A mock integration client that replays a per-call script.
///
/// Once the script is exhausted every further call succeeds with the
/// `fallback` payload. An optional artificial latency is applied to every
/// call, which lets tests observe genuinely concurrent step execution.
pub struct MockIntegration {
    state: Mutex<MockState>,
    fallback: Value,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockIntegration {
    /// A client that always succeeds with `{}`.
    pub fn always_ok() -> Arc<Self> {
        Self::with_script(Vec::new())
    }

    /// A client that replays `script` call-by-call, then succeeds.
    pub fn with_script(script: Vec<CallScript>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                script: script.into(),
                calls: Vec::new(),
            }),
            fallback: json!({}),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// A client that sleeps `latency` inside every call before succeeding.
    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                script: VecDeque::new(),
                calls: Vec::new(),
            }),
            fallback: json!({}),
            latency,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Number of times `execute` has been invoked.
    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    /// All recorded invocations, in call order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Highest number of calls that were ever in flight simultaneously.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntegrationClient for MockIntegration {
    async fn execute(
        &self,
        endpoint: &EndpointRef,
        parameters: &Value,
        timeout: Duration,
    ) -> Result<IntegrationResponse, IntegrationError> {
        let script = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(RecordedCall {
                endpoint: endpoint.clone(),
                parameters: parameters.clone(),
                timeout,
            });
            state.script.pop_front()
        };

        let entered = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(entered, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match script {
            None => Ok(IntegrationResponse::ok(self.fallback.clone(), self.latency)),
            Some(CallScript::Ok(data)) => Ok(IntegrationResponse::ok(data, self.latency)),
            Some(CallScript::FailStatus(code)) => Ok(IntegrationResponse::failed(
                code,
                json!({ "error": format!("status {code}") }),
                self.latency,
            )),
            Some(CallScript::FailError(kind, detail)) => {
                Err(IntegrationError::new(kind, detail))
            }
        }
    }
}

/// One recorded notification.
#[derive(Debug, Clone)]
pub struct RecordedNotification {
    pub severity: Severity,
    pub message: String,
    pub channels: Vec<String>,
}

/// A mock dispatcher that records every notification it receives.
pub struct MockDispatcher {
    sent: Mutex<Vec<RecordedNotification>>,
    fail: bool,
}

impl MockDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { sent: Mutex::new(Vec::new()), fail: false })
    }

    /// A dispatcher whose every send fails — for exercising the
    /// "notification failure is never fatal" path.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self { sent: Mutex::new(Vec::new()), fail: true })
    }

    pub fn sent(&self) -> Vec<RecordedNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl NotificationDispatcher for MockDispatcher {
    async fn send(
        &self,
        severity: Severity,
        message: &str,
        channels: &[String],
    ) -> Result<(), IntegrationError> {
        self.sent.lock().unwrap().push(RecordedNotification {
            severity,
            message: message.to_string(),
            channels: channels.to_vec(),
        });

        if self.fail {
            Err(IntegrationError::transport("notification channel unavailable"))
        } else {
            Ok(())
        }
    }
}
