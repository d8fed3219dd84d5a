//! In-process RDF store behind the endpoint interface.
//!
//! Backs self-contained deployments and the test suite. Protocol graph
//! parameters are not applied here; queries address graphs through their own
//! dataset clauses.

use oxigraph::model::Term;
use oxigraph::sparql::{QueryResults, SparqlEvaluator};
use oxigraph::store::Store;
use tracing::debug;

use crate::endpoint::{EndpointError, SparqlEndpoint};
use crate::sparql::bindings::{Binding, Bindings, RdfTerm};
use crate::sparql::responses::EndpointResponse;

const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";

/// An in-process oxigraph store exposed as a [`SparqlEndpoint`].
pub struct EmbeddedEndpoint {
    store: Store,
}

impl EmbeddedEndpoint {
    pub fn new() -> Result<Self, EndpointError> {
        let store = Store::new()
            .map_err(|e| EndpointError::Status { code: 500, body: e.to_string() })?;
        Ok(EmbeddedEndpoint { store })
    }

    fn convert_term(term: &Term) -> RdfTerm {
        match term {
            Term::NamedNode(node) => RdfTerm::Iri(node.as_str().to_string()),
            Term::BlankNode(node) => RdfTerm::Bnode(node.as_str().to_string()),
            Term::Literal(literal) => {
                let language = literal.language().map(|l| l.to_string());
                // Simple literals carry no datatype on the wire.
                let datatype = if language.is_some() || literal.datatype().as_str() == XSD_STRING {
                    None
                } else {
                    Some(literal.datatype().as_str().to_string())
                };
                RdfTerm::Literal { value: literal.value().to_string(), datatype, language }
            }
            other => RdfTerm::Literal {
                value: other.to_string(),
                datatype: None,
                language: None,
            },
        }
    }
}

impl SparqlEndpoint for EmbeddedEndpoint {
    fn query(
        &self,
        sparql: &str,
        _default_graph_uri: &[String],
        _named_graph_uri: &[String],
        _principal: Option<&str>,
    ) -> Result<Bindings, EndpointError> {
        let evaluator = SparqlEvaluator::new();
        let parsed = evaluator
            .parse_query(sparql)
            .map_err(|e| EndpointError::Status { code: 400, body: e.to_string() })?;
        let results = parsed
            .on_store(&self.store)
            .execute()
            .map_err(|e| EndpointError::Status { code: 500, body: e.to_string() })?;

        match results {
            QueryResults::Solutions(solutions) => {
                let vars: Vec<String> =
                    solutions.variables().iter().map(|v| v.as_str().to_string()).collect();
                let mut bindings = Bindings::new(vars);
                for solution in solutions {
                    let solution = solution
                        .map_err(|e| EndpointError::Status { code: 500, body: e.to_string() })?;
                    let mut row = Binding::new();
                    for (var, term) in solution.iter() {
                        row = row.bind(var.as_str(), Self::convert_term(term));
                    }
                    bindings.insert(row);
                }
                Ok(bindings)
            }
            _ => Err(EndpointError::Results(
                "subscription predicates must be SELECT queries".to_string(),
            )),
        }
    }

    fn update(
        &self,
        sparql: &str,
        _using_graph_uri: &[String],
        _using_named_graph_uri: &[String],
        _principal: Option<&str>,
    ) -> Result<EndpointResponse, EndpointError> {
        let evaluator = SparqlEvaluator::new();
        let parsed = match evaluator.parse_update(sparql) {
            Ok(parsed) => parsed,
            Err(e) => return Ok(EndpointResponse::new(400, &e.to_string())),
        };

        match parsed.on_store(&self.store).execute() {
            Ok(()) => {
                debug!("embedded store updated");
                Ok(EndpointResponse::new(204, ""))
            }
            Err(e) => Ok(EndpointResponse::new(500, &e.to_string())),
        }
    }
}
