//! `integrations` crate — the traits through which the engine talks to the
//! outside world, plus scripted test doubles.
//!
//! The engine never constructs an HTTP request, parses an API document, or
//! formats a notification body. It only calls [`IntegrationClient`] and
//! [`NotificationDispatcher`] and inspects success/failure and status codes.

pub mod error;
pub mod traits;
pub mod mock;

pub use error::{IntegrationError, IntegrationErrorKind};
pub use traits::{
    EndpointRef, IntegrationClient, IntegrationResponse, NotificationDispatcher, Severity,
};
