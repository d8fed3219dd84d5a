//! Responses crossing the gateway boundary.

use serde::Serialize;

use crate::sparql::bindings::Bindings;

/// Successful answer to a subscribe request.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeResponse {
    /// The subscriber identifier, unique across the process.
    pub sid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// The subscription's current result set.
    #[serde(rename = "firstResults")]
    pub first_results: Bindings,
}

/// Successful answer to an unsubscribe request.
#[derive(Debug, Clone, Serialize)]
pub struct UnsubscribeResponse {
    pub sid: String,
}

/// The endpoint's own reply to an update, relayed to the caller whether the
/// mutation succeeded or not.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointResponse {
    pub status: u16,
    pub body: String,
}

impl EndpointResponse {
    pub fn new(status: u16, body: &str) -> Self {
        EndpointResponse { status, body: body.to_string() }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Broker-level failure. The `kind` strings are stable across releases.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub kind: String,
    pub body: String,
}

impl ErrorResponse {
    pub fn new(code: u16, kind: &str, body: &str) -> Self {
        ErrorResponse { code, kind: kind.to_string(), body: body.to_string() }
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.code, self.kind, self.body)
    }
}
