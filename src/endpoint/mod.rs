//! Access to the backing RDF store.
//!
//! The processing core only sees the [`SparqlEndpoint`] trait. Two
//! implementations are provided: [`sparql_protocol::Sparql11Protocol`] for a
//! remote SPARQL 1.1 protocol endpoint and [`embedded::EmbeddedEndpoint`] for
//! an in-process store. Both are blocking; processing units run on their own
//! OS threads and gateways hop through a blocking task when calling in.

pub mod embedded;
pub mod sparql_protocol;

use crate::sparql::bindings::Bindings;
use crate::sparql::responses::EndpointResponse;

/// Error type for endpoint operations.
#[derive(Debug)]
pub enum EndpointError {
    /// Transport-level failure (connect, timeout, I/O).
    Http(String),
    /// The endpoint rejected the principal (401/403).
    Auth(String),
    /// Any other non-success protocol status.
    Status { code: u16, body: String },
    /// The endpoint answered but the result set could not be parsed.
    Results(String),
}

impl std::fmt::Display for EndpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointError::Http(msg) => write!(f, "HTTP error: {}", msg),
            EndpointError::Auth(msg) => write!(f, "authorization error: {}", msg),
            EndpointError::Status { code, body } => {
                write!(f, "endpoint returned {}: {}", code, body)
            }
            EndpointError::Results(msg) => write!(f, "cannot parse results: {}", msg),
        }
    }
}

impl std::error::Error for EndpointError {}

/// The backing RDF store, as seen by the processing core.
///
/// `query` evaluates a SELECT query and returns its result set. `update`
/// applies a SPARQL update and returns the store's own reply; a non-2xx reply
/// is captured in the [`EndpointResponse`], not raised as an error, so the
/// caller can relay it and still run its post-update work.
pub trait SparqlEndpoint: Send + Sync {
    fn query(
        &self,
        sparql: &str,
        default_graph_uri: &[String],
        named_graph_uri: &[String],
        principal: Option<&str>,
    ) -> Result<Bindings, EndpointError>;

    fn update(
        &self,
        sparql: &str,
        using_graph_uri: &[String],
        using_named_graph_uri: &[String],
        principal: Option<&str>,
    ) -> Result<EndpointResponse, EndpointError>;
}
