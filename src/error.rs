//! Engine-wide error types and their wire mapping.
//!
//! Every failure that crosses the gateway boundary is reported as an
//! [`ErrorResponse`] with a stable `kind` string; [`EngineError`] is the
//! internal form those responses are derived from.

use thiserror::Error;

use crate::endpoint::EndpointError;
use crate::registry::subscription_registry::RegistryError;
use crate::sparql::responses::ErrorResponse;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Barrier phase in which a timeout occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPhase {
    Pre,
    Post,
}

impl std::fmt::Display for BarrierPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BarrierPhase::Pre => write!(f, "pre_update_processing"),
            BarrierPhase::Post => write!(f, "post_update_processing"),
        }
    }
}

/// Main error type for the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The update pre-processor rejected or failed to rewrite the request.
    #[error("pre-update processing failed: {0}")]
    PreUpdateProcessing(String),

    /// A barrier deadline expired with processing units still running.
    #[error("{phase} timeout: {pending} processing units still running")]
    BarrierTimeout { phase: BarrierPhase, pending: usize },

    /// The endpoint or the credential validator rejected the principal.
    #[error("authorization rejected: {0}")]
    Auth(String),

    /// Endpoint transport, protocol or result-parsing failure.
    #[error("endpoint error: {0}")]
    Endpoint(String),

    /// Unsubscribe referenced a subscriber this process does not know.
    #[error("subscriber not found: {0}")]
    SidNotFound(String),

    /// Malformed gateway input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Explicit cancellation. Distinct from a deadline expiry and not
    /// reachable from the public surface.
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Maps the error onto the wire-level response. The `kind` strings are
    /// stable across releases.
    pub fn to_response(&self) -> ErrorResponse {
        match self {
            EngineError::PreUpdateProcessing(msg) => {
                ErrorResponse::new(500, "pre_update_processing_failed", msg)
            }
            EngineError::BarrierTimeout { .. } => {
                ErrorResponse::new(500, "timeout", &self.to_string())
            }
            EngineError::Auth(msg) => ErrorResponse::new(401, "auth_error", msg),
            EngineError::Endpoint(msg) => ErrorResponse::new(500, "endpoint_error", msg),
            EngineError::SidNotFound(sid) => ErrorResponse::new(
                500,
                "sid_not_found",
                &format!("unregistering a not existing subscriber: {}", sid),
            ),
            EngineError::BadRequest(msg) => ErrorResponse::new(400, "bad_request", msg),
            EngineError::Cancelled => ErrorResponse::new(500, "cancelled", "cancelled"),
        }
    }
}

impl From<EndpointError> for EngineError {
    fn from(err: EndpointError) -> Self {
        match err {
            EndpointError::Auth(msg) => EngineError::Auth(msg),
            other => EngineError::Endpoint(other.to_string()),
        }
    }
}

impl From<RegistryError> for EngineError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::SubscriberNotFound(sid) => EngineError::SidNotFound(sid),
            RegistryError::DuplicateFingerprint(msg) => EngineError::BadRequest(msg),
        }
    }
}
