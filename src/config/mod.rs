//! Engine configuration.
//!
//! Deserialized from a JSON file; every field has a default so a missing file
//! or an empty object yields a runnable embedded-endpoint engine.

use std::path::Path;

use serde::Deserialize;

use crate::error::{EngineError, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl EngineConfig {
    /// Loads configuration from a JSON file.
    pub fn load(path: &Path) -> Result<EngineConfig> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::BadRequest(format!("cannot read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| EngineError::BadRequest(format!("invalid config: {}", e)))
    }
}

/// Where the backing RDF store lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointMode {
    /// A remote SPARQL 1.1 protocol endpoint.
    Remote,
    /// An in-process store.
    Embedded,
}

/// Request shaping for the remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointFlavor {
    /// Form-encoded query/update parameters (Fuseki style).
    Fuseki,
    /// Raw `application/sparql-query` / `application/sparql-update` bodies.
    Oxigraph,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_endpoint_mode")]
    pub mode: EndpointMode,
    #[serde(default = "default_endpoint_url")]
    pub url: String,
    #[serde(default = "default_endpoint_flavor")]
    pub flavor: EndpointFlavor,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// How many times a failed update is re-issued before giving up.
    #[serde(default)]
    pub retry_budget: u32,
}

fn default_endpoint_mode() -> EndpointMode {
    EndpointMode::Embedded
}

fn default_endpoint_url() -> String {
    "http://localhost:7878".to_string()
}

fn default_endpoint_flavor() -> EndpointFlavor {
    EndpointFlavor::Oxigraph
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            mode: default_endpoint_mode(),
            url: default_endpoint_url(),
            flavor: default_endpoint_flavor(),
            auth_token: None,
            timeout_secs: default_timeout_secs(),
            retry_budget: 0,
        }
    }
}

/// How the manager selects the processing units affected by an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Every live unit participates in every barrier.
    All,
    /// Graph-URI intersection lookup. Conservative: a unit is skipped only
    /// when both sides declare graphs, the sets are disjoint, and the update
    /// text names no graphs of its own.
    Lut,
}

/// Unit used when reporting barrier and filtering timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitScale {
    Ms,
    Us,
    Ns,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Per-unit barrier timeout in milliseconds. The pre-update barrier scales
    /// this by the pool size.
    #[serde(default = "default_spu_processing_timeout_ms")]
    pub spu_processing_timeout_ms: u64,
    #[serde(default = "default_filter_mode")]
    pub filter_mode: FilterMode,
    #[serde(default = "default_unit_scale")]
    pub unit_scale: UnitScale,
}

fn default_spu_processing_timeout_ms() -> u64 {
    5000
}

fn default_filter_mode() -> FilterMode {
    FilterMode::All
}

fn default_unit_scale() -> UnitScale {
    UnitScale::Ms
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        ProcessingConfig {
            spu_processing_timeout_ms: default_spu_processing_timeout_ms(),
            filter_mode: default_filter_mode(),
            unit_scale: default_unit_scale(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig { host: default_host(), port: default_port() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_yields_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.endpoint.mode, EndpointMode::Embedded);
        assert_eq!(config.processing.spu_processing_timeout_ms, 5000);
        assert_eq!(config.processing.filter_mode, FilterMode::All);
        assert_eq!(config.processing.unit_scale, UnitScale::Ms);
        assert_eq!(config.gateway.port, 8000);
        assert_eq!(config.endpoint.retry_budget, 0);
    }

    #[test]
    fn test_partial_override() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "endpoint": { "mode": "remote", "url": "http://rdf:3030/ds", "flavor": "fuseki" },
                "processing": { "spu_processing_timeout_ms": 250, "filter_mode": "lut" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.endpoint.mode, EndpointMode::Remote);
        assert_eq!(config.endpoint.flavor, EndpointFlavor::Fuseki);
        assert_eq!(config.endpoint.url, "http://rdf:3030/ds");
        assert_eq!(config.processing.spu_processing_timeout_ms, 250);
        assert_eq!(config.processing.filter_mode, FilterMode::Lut);
        assert_eq!(config.gateway.host, "127.0.0.1");
    }
}
