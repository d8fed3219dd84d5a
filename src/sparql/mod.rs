//! SPARQL data model: RDF terms, bindings, requests, responses and
//! notifications exchanged between the gateway, the processing core and the
//! endpoint.

pub mod bindings;
pub mod notifications;
pub mod requests;
pub mod responses;

pub use bindings::{Binding, Bindings, RdfTerm};
pub use notifications::{EventSink, Notification, NotificationPayload, SinkClosed, TerminationReason};
pub use requests::{Fingerprint, SubscribeRequest, UpdateRequest};
pub use responses::{EndpointResponse, ErrorResponse, SubscribeResponse, UnsubscribeResponse};
