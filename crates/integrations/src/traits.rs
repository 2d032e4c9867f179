//! The collaborator traits — the contract every external client must fulfil.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::IntegrationError;

/// Opaque reference to a callable endpoint of a registered integration.
///
/// The engine treats this as an address; only the client knows how to turn it
/// into an actual request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRef {
    /// Integration target name — also the circuit-breaker key.
    pub integration: String,
    /// Endpoint identifier within the integration (path, operation id, …).
    pub endpoint: String,
}

impl EndpointRef {
    pub fn new(integration: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            integration: integration.into(),
            endpoint: endpoint.into(),
        }
    }

    /// The health-check endpoint of an integration target.
    pub fn health(integration: impl Into<String>) -> Self {
        Self::new(integration, "__health__")
    }
}

/// Outcome of a completed (possibly unsuccessful) integration call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationResponse {
    pub success: bool,
    pub data: Value,
    pub status_code: u16,
    /// Wall-clock duration of the call as measured by the client.
    pub latency: Duration,
}

impl IntegrationResponse {
    pub fn ok(data: Value, latency: Duration) -> Self {
        Self { success: true, data, status_code: 200, latency }
    }

    pub fn failed(status_code: u16, data: Value, latency: Duration) -> Self {
        Self { success: false, data, status_code, latency }
    }
}

/// Executes a single request against an external service.
///
/// Implementations own everything protocol-specific: request construction,
/// authentication, data-format conversion. The engine only inspects
/// success/failure and the status code.
#[async_trait]
pub trait IntegrationClient: Send + Sync {
    /// Execute one call. A `Duration` budget is supplied; the client must
    /// give up (returning a timeout error) once it elapses.
    async fn execute(
        &self,
        endpoint: &EndpointRef,
        parameters: &Value,
        timeout: Duration,
    ) -> Result<IntegrationResponse, IntegrationError>;
}

/// Notification severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Fire-and-forget notification sink.
///
/// A failed send is logged by the engine and never retried.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(
        &self,
        severity: Severity,
        message: &str,
        channels: &[String],
    ) -> Result<(), IntegrationError>;
}
