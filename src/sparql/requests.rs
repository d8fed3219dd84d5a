//! Subscribe and update requests as they reach the processing core.

use std::sync::Arc;

use crate::sparql::notifications::EventSink;

/// Canonical identity of a subscribe request.
///
/// Two requests with equal fingerprints share one processing unit. Query text
/// and the two graph URI sets participate; alias and principal do not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    fn canonical_graphs(graphs: &[String]) -> String {
        let mut sorted: Vec<&str> = graphs.iter().map(|g| g.as_str()).collect();
        sorted.sort_unstable();
        sorted.dedup();
        sorted.join(",")
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A subscription predicate together with the capabilities needed to serve it:
/// the gateway connection it arrived on and the sink notifications go to.
#[derive(Clone)]
pub struct SubscribeRequest {
    /// SPARQL 1.1 SELECT query text.
    pub sparql: String,
    /// Default graph URIs for query evaluation.
    pub default_graph_uri: Vec<String>,
    /// Named graph URIs for query evaluation.
    pub named_graph_uri: Vec<String>,
    /// Optional human-readable alias, echoed back in responses.
    pub alias: Option<String>,
    /// Gateway-scoped connection identifier.
    pub gid: String,
    /// Opaque token of the authenticated principal.
    pub principal: Option<String>,
    /// Delivery capability for this subscriber's notifications.
    pub sink: Arc<dyn EventSink>,
}

impl SubscribeRequest {
    /// The canonical form that makes two requests de-duplicable.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(format!(
            "{}\n{}\n{}",
            self.sparql.trim(),
            Fingerprint::canonical_graphs(&self.default_graph_uri),
            Fingerprint::canonical_graphs(&self.named_graph_uri),
        ))
    }
}

impl std::fmt::Debug for SubscribeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeRequest")
            .field("sparql", &self.sparql)
            .field("default_graph_uri", &self.default_graph_uri)
            .field("named_graph_uri", &self.named_graph_uri)
            .field("alias", &self.alias)
            .field("gid", &self.gid)
            .finish()
    }
}

/// A SPARQL 1.1 update as admitted by the manager. Opaque beyond these
/// attributes.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    /// SPARQL 1.1 update text.
    pub sparql: String,
    /// `using-graph-uri` values from the protocol request.
    pub using_graph_uri: Vec<String>,
    /// `using-named-graph-uri` values from the protocol request.
    pub using_named_graph_uri: Vec<String>,
    /// Opaque token of the authenticated principal.
    pub principal: Option<String>,
}

impl UpdateRequest {
    pub fn new(sparql: &str) -> Self {
        UpdateRequest {
            sparql: sparql.to_string(),
            using_graph_uri: Vec::new(),
            using_named_graph_uri: Vec::new(),
            principal: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparql::notifications::{Notification, SinkClosed};

    struct NullSink;

    impl EventSink for NullSink {
        fn notify(&self, _notification: &Notification) -> Result<(), SinkClosed> {
            Ok(())
        }
    }

    fn request(sparql: &str, default_graphs: &[&str], alias: Option<&str>) -> SubscribeRequest {
        SubscribeRequest {
            sparql: sparql.to_string(),
            default_graph_uri: default_graphs.iter().map(|g| g.to_string()).collect(),
            named_graph_uri: Vec::new(),
            alias: alias.map(|a| a.to_string()),
            gid: "gid-1".to_string(),
            principal: None,
            sink: Arc::new(NullSink),
        }
    }

    #[test]
    fn test_alias_and_principal_excluded() {
        let a = request("SELECT ?x WHERE { ?x ?p ?o }", &[], Some("one"));
        let mut b = request("SELECT ?x WHERE { ?x ?p ?o }", &[], Some("two"));
        b.principal = Some("token".to_string());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_graph_sets_canonicalized() {
        let a = request("SELECT * WHERE { ?s ?p ?o }", &["urn:g1", "urn:g2"], None);
        let b = request("SELECT * WHERE { ?s ?p ?o }", &["urn:g2", "urn:g1", "urn:g1"], None);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_distinct_graphs_distinct_fingerprints() {
        let a = request("SELECT * WHERE { ?s ?p ?o }", &["urn:g1"], None);
        let b = request("SELECT * WHERE { ?s ?p ?o }", &["urn:g2"], None);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
