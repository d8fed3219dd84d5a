//! HTTP and WebSocket gateway.
//!
//! Terminates the wire protocol and calls into the processing core:
//! - SPARQL 1.1 queries and updates over HTTP
//! - live subscriptions over WebSockets
//! - the metrics and admin surface

pub mod server;

pub use server::{create_server, start_server, AppState};
