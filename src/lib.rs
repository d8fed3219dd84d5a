//! # Iris
//!
//! Iris is a SPARQL Event Processing broker. It accepts SPARQL 1.1 updates and
//! queries over HTTP and maintains long-lived SPARQL 1.1 subscriptions over
//! WebSockets, notifying every subscriber of the incremental change (added and
//! removed bindings) to its query results whenever an update is applied to the
//! backing RDF endpoint.
//!
//! The name "Iris" comes from the Greek goddess who carried messages between
//! the gods and the mortal world. The broker plays the same role: it sits
//! between an RDF endpoint and its observers and carries only what changed.
//!
//! ## Architecture
//!
//! - [`subscriptions`] — the processing core: one Subscription Processing Unit
//!   (SPU) per distinct subscription predicate, coordinated by a manager that
//!   runs a pre-update / endpoint-mutate / post-update barrier for every
//!   admitted update.
//! - [`registry`] — the canonical table of live subscriptions, mapping
//!   predicates to SPUs and subscribers to their delivery sinks.
//! - [`endpoint`] — the SPARQL 1.1 protocol client for a remote RDF store, and
//!   an embedded in-process store for self-contained deployments.
//! - [`sparql`] — the data model: RDF terms, bindings, result sets, requests,
//!   responses and notifications.
//! - [`http`] — the HTTP/WebSocket gateway.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use iris::config::ProcessingConfig;
//! use iris::endpoint::embedded::EmbeddedEndpoint;
//! use iris::subscriptions::manager::SpuManager;
//! use iris::subscriptions::metrics::SpuManagerMetrics;
//!
//! let endpoint = Arc::new(EmbeddedEndpoint::new().unwrap());
//! let metrics = Arc::new(SpuManagerMetrics::new(&ProcessingConfig::default()));
//! let manager = SpuManager::new(endpoint, metrics);
//! ```

pub mod config;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod registry;
pub mod sparql;
pub mod subscriptions;

pub use error::{EngineError, Result};
