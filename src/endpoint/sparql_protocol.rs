//! SPARQL 1.1 protocol client for a remote RDF store.
//!
//! Queries and updates are POSTed either form-encoded (Fuseki style) or as
//! raw `application/sparql-query` / `application/sparql-update` bodies with
//! graph URIs in the query string, depending on the configured flavor.

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use tracing::{debug, warn};

use crate::config::{EndpointConfig, EndpointFlavor};
use crate::endpoint::{EndpointError, SparqlEndpoint};
use crate::sparql::bindings::Bindings;
use crate::sparql::responses::EndpointResponse;

const RESULTS_JSON: &str = "application/sparql-results+json";

/// Blocking SPARQL 1.1 protocol client.
pub struct Sparql11Protocol {
    client: Client,
    url: String,
    flavor: EndpointFlavor,
    auth_token: Option<String>,
    retry_budget: u32,
}

impl Sparql11Protocol {
    pub fn new(config: &EndpointConfig) -> Result<Self, EndpointError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EndpointError::Http(e.to_string()))?;

        Ok(Sparql11Protocol {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            flavor: config.flavor,
            auth_token: config.auth_token.clone(),
            retry_budget: config.retry_budget,
        })
    }

    fn query_endpoint(&self) -> String {
        match self.flavor {
            EndpointFlavor::Fuseki => format!("{}/sparql", self.url),
            EndpointFlavor::Oxigraph => format!("{}/query", self.url),
        }
    }

    fn update_endpoint(&self) -> String {
        format!("{}/update", self.url)
    }

    /// Repeated graph-URI parameters in protocol order.
    fn graph_params(
        default_key: &str,
        default_graphs: &[String],
        named_key: &str,
        named_graphs: &[String],
    ) -> Vec<(String, String)> {
        let mut params = Vec::with_capacity(default_graphs.len() + named_graphs.len());
        for g in default_graphs {
            params.push((default_key.to_string(), g.clone()));
        }
        for g in named_graphs {
            params.push((named_key.to_string(), g.clone()));
        }
        params
    }

    fn url_with_params(base: &str, params: &[(String, String)]) -> String {
        if params.is_empty() {
            return base.to_string();
        }
        let encoded: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();
        format!("{}?{}", base, encoded.join("&"))
    }

    /// The per-request principal takes precedence over the configured token.
    fn add_auth_header(&self, request: RequestBuilder, principal: Option<&str>) -> RequestBuilder {
        match principal.or(self.auth_token.as_deref()) {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    fn send_update(
        &self,
        sparql: &str,
        using_graph_uri: &[String],
        using_named_graph_uri: &[String],
        principal: Option<&str>,
    ) -> Result<reqwest::blocking::Response, EndpointError> {
        let params = Self::graph_params(
            "using-graph-uri",
            using_graph_uri,
            "using-named-graph-uri",
            using_named_graph_uri,
        );

        let request = match self.flavor {
            EndpointFlavor::Fuseki => {
                let mut form = vec![("update".to_string(), sparql.to_string())];
                form.extend(params);
                self.client.post(self.update_endpoint()).form(&form)
            }
            EndpointFlavor::Oxigraph => self
                .client
                .post(Self::url_with_params(&self.update_endpoint(), &params))
                .header("Content-Type", "application/sparql-update")
                .body(sparql.to_string()),
        };

        self.add_auth_header(request, principal)
            .send()
            .map_err(|e| EndpointError::Http(e.to_string()))
    }
}

impl SparqlEndpoint for Sparql11Protocol {
    fn query(
        &self,
        sparql: &str,
        default_graph_uri: &[String],
        named_graph_uri: &[String],
        principal: Option<&str>,
    ) -> Result<Bindings, EndpointError> {
        let params = Self::graph_params(
            "default-graph-uri",
            default_graph_uri,
            "named-graph-uri",
            named_graph_uri,
        );

        let request = match self.flavor {
            EndpointFlavor::Fuseki => {
                let mut form = vec![("query".to_string(), sparql.to_string())];
                form.extend(params);
                self.client.post(self.query_endpoint()).form(&form)
            }
            EndpointFlavor::Oxigraph => self
                .client
                .post(Self::url_with_params(&self.query_endpoint(), &params))
                .header("Content-Type", "application/sparql-query")
                .body(sparql.to_string()),
        };

        let response = self
            .add_auth_header(request, principal)
            .header("Accept", RESULTS_JSON)
            .send()
            .map_err(|e| EndpointError::Http(e.to_string()))?;

        let status = response.status();
        let body = response.text().map_err(|e| EndpointError::Http(e.to_string()))?;

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(EndpointError::Auth(body));
        }
        if !status.is_success() {
            return Err(EndpointError::Status { code: status.as_u16(), body });
        }

        serde_json::from_str(&body).map_err(|e| EndpointError::Results(e.to_string()))
    }

    fn update(
        &self,
        sparql: &str,
        using_graph_uri: &[String],
        using_named_graph_uri: &[String],
        principal: Option<&str>,
    ) -> Result<EndpointResponse, EndpointError> {
        let mut last_error = None;

        for attempt in 0..=self.retry_budget {
            if attempt > 0 {
                warn!(attempt, "re-issuing update to endpoint");
            }
            match self.send_update(sparql, using_graph_uri, using_named_graph_uri, principal) {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body =
                        response.text().map_err(|e| EndpointError::Http(e.to_string()))?;
                    if status == 401 || status == 403 {
                        return Err(EndpointError::Auth(body));
                    }
                    debug!(status, "endpoint update reply");
                    return Ok(EndpointResponse::new(status, &body));
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| EndpointError::Http("no attempt made".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol(flavor: EndpointFlavor) -> Sparql11Protocol {
        let config = EndpointConfig {
            url: "http://localhost:3030/ds/".to_string(),
            flavor,
            ..EndpointConfig::default()
        };
        Sparql11Protocol::new(&config).unwrap()
    }

    #[test]
    fn test_fuseki_endpoints() {
        let p = protocol(EndpointFlavor::Fuseki);
        assert_eq!(p.query_endpoint(), "http://localhost:3030/ds/sparql");
        assert_eq!(p.update_endpoint(), "http://localhost:3030/ds/update");
    }

    #[test]
    fn test_oxigraph_endpoints() {
        let p = protocol(EndpointFlavor::Oxigraph);
        assert_eq!(p.query_endpoint(), "http://localhost:3030/ds/query");
        assert_eq!(p.update_endpoint(), "http://localhost:3030/ds/update");
    }

    #[test]
    fn test_graph_params_order_and_encoding() {
        let params = Sparql11Protocol::graph_params(
            "default-graph-uri",
            &["urn:g1".to_string()],
            "named-graph-uri",
            &["http://example.org/g?x=1".to_string()],
        );
        let url = Sparql11Protocol::url_with_params("http://localhost:7878/query", &params);
        assert_eq!(
            url,
            "http://localhost:7878/query?default-graph-uri=urn%3Ag1\
             &named-graph-uri=http%3A%2F%2Fexample.org%2Fg%3Fx%3D1"
        );
    }

    #[test]
    fn test_no_params_leaves_url_untouched() {
        let url = Sparql11Protocol::url_with_params("http://localhost:7878/query", &[]);
        assert_eq!(url, "http://localhost:7878/query");
    }
}
