//! HTTP API server.
//!
//! Provides the SPARQL 1.1 endpoints (`POST /sparql`, `POST /update`), the
//! WebSocket subscription endpoint (`GET /subscribe`) and the metrics/admin
//! surface. Query and update bodies arrive either raw
//! (`application/sparql-query` / `application/sparql-update`) or as JSON
//! objects carrying the text plus graph URI lists. Bearer tokens pass through
//! to the core as the opaque principal.
//!
//! Subscription frames over the socket:
//!
//! ```json
//! {"subscribe": {"sparql": "SELECT ...", "alias": "room1"}}
//! {"unsubscribe": "iris:sub:..."}
//! ```
//!
//! Server frames are `{"subscribed": ...}`, `{"unsubscribed": ...}`,
//! `{"notification": ...}` and `{"error": ...}`.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::UnitScale;
use crate::endpoint::SparqlEndpoint;
use crate::error::EngineError;
use crate::sparql::notifications::{EventSink, Notification, SinkClosed};
use crate::sparql::requests::{SubscribeRequest, UpdateRequest};
use crate::sparql::responses::ErrorResponse;
use crate::subscriptions::manager::SpuManager;
use crate::subscriptions::metrics::SpuManagerMetrics;

/// Shared application state.
pub struct AppState {
    pub manager: Arc<SpuManager>,
    pub endpoint: Arc<dyn SparqlEndpoint>,
    pub metrics: Arc<SpuManagerMetrics>,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// JSON body variant for `POST /sparql`.
#[derive(Debug, Deserialize)]
struct QueryBody {
    query: String,
    #[serde(default, rename = "default-graph-uri")]
    default_graph_uri: Vec<String>,
    #[serde(default, rename = "named-graph-uri")]
    named_graph_uri: Vec<String>,
}

/// JSON body variant for `POST /update`.
#[derive(Debug, Deserialize)]
struct UpdateBody {
    update: String,
    #[serde(default, rename = "using-graph-uri")]
    using_graph_uri: Vec<String>,
    #[serde(default, rename = "using-named-graph-uri")]
    using_named_graph_uri: Vec<String>,
}

/// One client frame on the subscription socket.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WsRequest {
    Subscribe(SubscribeBody),
    Unsubscribe(String),
}

#[derive(Debug, Deserialize)]
struct SubscribeBody {
    sparql: String,
    #[serde(default, rename = "default-graph-uri")]
    default_graph_uri: Vec<String>,
    #[serde(default, rename = "named-graph-uri")]
    named_graph_uri: Vec<String>,
    #[serde(default)]
    alias: Option<String>,
}

/// Tunables accepted by `POST /admin/processing`.
#[derive(Debug, Deserialize)]
struct ProcessingTunables {
    #[serde(default)]
    spu_processing_timeout_ms: Option<u64>,
    #[serde(default)]
    unit_scale: Option<UnitScale>,
}

/// Delivery capability handed to the core for one socket: notifications are
/// queued to the writer task and flushed on the connection's own time.
struct ChannelSink {
    frames: mpsc::UnboundedSender<serde_json::Value>,
}

impl EventSink for ChannelSink {
    fn notify(&self, notification: &Notification) -> Result<(), SinkClosed> {
        self.frames.send(notification.to_frame()).map_err(|_| SinkClosed)
    }
}

/// Create the HTTP server with all routes.
pub fn create_server(
    manager: Arc<SpuManager>,
    endpoint: Arc<dyn SparqlEndpoint>,
    metrics: Arc<SpuManagerMetrics>,
) -> Router {
    let state = Arc::new(AppState { manager, endpoint, metrics });

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/sparql", post(sparql_query))
        .route("/update", post(sparql_update))
        .route("/subscribe", get(subscribe_ws))
        .route("/metrics", get(metrics_snapshot))
        .route("/admin/processing", post(admin_processing))
        .route("/health", get(health_check))
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "up" }))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

fn content_type<'a>(headers: &'a HeaderMap) -> &'a str {
    headers.get("Content-Type").and_then(|v| v.to_str().ok()).unwrap_or("")
}

/// POST /sparql - evaluate a query against the endpoint.
async fn sparql_query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let principal = bearer_token(&headers);

    let (query, default_graphs, named_graphs) = if content_type(&headers).starts_with("application/json") {
        match serde_json::from_str::<QueryBody>(&body) {
            Ok(parsed) => (parsed.query, parsed.default_graph_uri, parsed.named_graph_uri),
            Err(e) => {
                return ErrorResponse::new(400, "bad_request", &e.to_string()).into_response()
            }
        }
    } else {
        (body, Vec::new(), Vec::new())
    };

    let endpoint = Arc::clone(&state.endpoint);
    let result = tokio::task::spawn_blocking(move || {
        endpoint.query(&query, &default_graphs, &named_graphs, principal.as_deref())
    })
    .await;

    match result {
        Ok(Ok(bindings)) => Json(bindings).into_response(),
        Ok(Err(e)) => EngineError::from(e).to_response().into_response(),
        Err(e) => ErrorResponse::new(500, "endpoint_error", &e.to_string()).into_response(),
    }
}

/// POST /update - admit an update through the manager.
async fn sparql_update(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let principal = bearer_token(&headers);

    let request = if content_type(&headers).starts_with("application/json") {
        match serde_json::from_str::<UpdateBody>(&body) {
            Ok(parsed) => UpdateRequest {
                sparql: parsed.update,
                using_graph_uri: parsed.using_graph_uri,
                using_named_graph_uri: parsed.using_named_graph_uri,
                principal,
            },
            Err(e) => {
                return ErrorResponse::new(400, "bad_request", &e.to_string()).into_response()
            }
        }
    } else {
        UpdateRequest {
            sparql: body,
            using_graph_uri: Vec::new(),
            using_named_graph_uri: Vec::new(),
            principal,
        }
    };

    let manager = Arc::clone(&state.manager);
    let result = tokio::task::spawn_blocking(move || manager.update(request)).await;

    match result {
        Ok(Ok(reply)) => {
            // Relay the endpoint's own status and body.
            let status =
                StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, reply.body).into_response()
        }
        Ok(Err(err)) => err.into_response(),
        Err(e) => ErrorResponse::new(500, "endpoint_error", &e.to_string()).into_response(),
    }
}

/// GET /metrics - point-in-time view of the processing core.
async fn metrics_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// POST /admin/processing - runtime tunables. Changes take effect on the next
/// barrier.
async fn admin_processing(
    State(state): State<Arc<AppState>>,
    Json(tunables): Json<ProcessingTunables>,
) -> impl IntoResponse {
    if let Some(timeout_ms) = tunables.spu_processing_timeout_ms {
        state.metrics.set_spu_processing_timeout_ms(timeout_ms);
        info!(timeout_ms, "processing timeout updated");
    }
    if let Some(scale) = tunables.unit_scale {
        state.metrics.set_unit_scale(scale);
    }
    Json(state.metrics.snapshot())
}

/// WS /subscribe - long-lived subscription connection.
async fn subscribe_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let principal = bearer_token(&headers);
    ws.on_upgrade(move |socket| handle_websocket(socket, state, principal))
}

async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, principal: Option<String>) {
    let gid = format!("iris:gate:{}", Uuid::new_v4());
    info!(%gid, "subscription connection opened");

    let (mut socket_sender, mut socket_receiver) = socket.split();
    let (frames, mut frame_queue) = mpsc::unbounded_channel::<serde_json::Value>();

    // Writer task: flushes notification and response frames to the wire.
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_queue.recv().await {
            if socket_sender.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
    });

    let sink: Arc<dyn EventSink> = Arc::new(ChannelSink { frames: frames.clone() });

    while let Some(Ok(message)) = socket_receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame = match serde_json::from_str::<WsRequest>(&text) {
            Ok(WsRequest::Subscribe(body)) => {
                let request = SubscribeRequest {
                    sparql: body.sparql,
                    default_graph_uri: body.default_graph_uri,
                    named_graph_uri: body.named_graph_uri,
                    alias: body.alias,
                    gid: gid.clone(),
                    principal: principal.clone(),
                    sink: Arc::clone(&sink),
                };
                let manager = Arc::clone(&state.manager);
                match tokio::task::spawn_blocking(move || manager.subscribe(request)).await {
                    Ok(Ok(response)) => serde_json::json!({ "subscribed": response }),
                    Ok(Err(err)) => serde_json::json!({ "error": err }),
                    Err(e) => serde_json::json!({
                        "error": ErrorResponse::new(500, "endpoint_error", &e.to_string())
                    }),
                }
            }
            Ok(WsRequest::Unsubscribe(sid)) => {
                let manager = Arc::clone(&state.manager);
                let gid_for_call = gid.clone();
                match tokio::task::spawn_blocking(move || {
                    manager.unsubscribe(&sid, &gid_for_call)
                })
                .await
                {
                    Ok(Ok(response)) => serde_json::json!({ "unsubscribed": response }),
                    Ok(Err(err)) => serde_json::json!({ "error": err }),
                    Err(e) => serde_json::json!({
                        "error": ErrorResponse::new(500, "endpoint_error", &e.to_string())
                    }),
                }
            }
            Err(e) => {
                warn!(%gid, "malformed subscription frame");
                serde_json::json!({ "error": ErrorResponse::new(400, "bad_request", &e.to_string()) })
            }
        };

        if frames.send(frame).is_err() {
            break;
        }
    }

    // Connection gone: every subscription of this gate dies with it.
    debug!(%gid, "subscription connection closed");
    let manager = Arc::clone(&state.manager);
    let gid_for_sweep = gid.clone();
    let _ = tokio::task::spawn_blocking(move || {
        for sid in manager.sids_of_gid(&gid_for_sweep) {
            manager.kill_subscription(&sid, &gid_for_sweep);
        }
    })
    .await;

    writer.abort();
    info!(%gid, "subscription connection cleaned up");
}

/// Start the HTTP server on the specified address. Runs until a shutdown
/// signal arrives, then sweeps the subscription population so every live
/// subscriber hears `Terminated` before the process goes down.
pub async fn start_server(
    addr: &str,
    manager: Arc<SpuManager>,
    endpoint: Arc<dyn SparqlEndpoint>,
    metrics: Arc<SpuManagerMetrics>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_server(Arc::clone(&manager), endpoint, metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    tokio::task::spawn_blocking(move || manager.shutdown()).await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for the shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
