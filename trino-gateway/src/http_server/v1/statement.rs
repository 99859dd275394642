use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use http::{HeaderMap, Method, StatusCode, Uri};
use serde_json::json;
use snafu::{ResultExt, Snafu};
use tracing::{instrument, warn};
use trino_gateway_core::{
    RoutingGroupName, TrinoBackendName, TrinoQueryId,
    query_attributes::QueryAttributes,
    sanitization::Sanitize,
    trino_api::{self, StatementResponseCapture},
};
use trino_gateway_state::{QueryHistoryRecord, QueryHistorySink};
use url::Url;

use crate::{
    backend_manager::Backend,
    http_server::{AppState, proxy},
    routing::RoutingGroupSelectorTrait,
    routing_manager,
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("No routable backend available for routing group {group:?}"))]
    NoBackendAvailable { group: RoutingGroupName },

    #[snafu(display("Query {query_id:?} not found"))]
    QueryNotFound { query_id: TrinoQueryId },

    #[snafu(display("Failed to join the requested path {requested_path:?} to the backend endpoint {backend_endpoint}"))]
    JoinRequestPathToBackendEndpoint {
        source: url::ParseError,
        requested_path: String,
        backend_endpoint: Url,
    },

    #[snafu(display("Failed to contact backend {backend:?}"))]
    ContactBackend {
        source: proxy::Error,
        backend: TrinoBackendName,
    },
}

impl From<routing_manager::Error> for Error {
    fn from(error: routing_manager::Error) -> Self {
        match error {
            routing_manager::Error::NoBackendAvailable { group } => {
                Error::NoBackendAvailable { group }
            }
            routing_manager::Error::UnknownQuery { query_id } => Error::QueryNotFound { query_id },
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        warn!(error = ?self, "Error while processing request");

        match self {
            Error::NoBackendAvailable { group } => (
                StatusCode::SERVICE_UNAVAILABLE,
                [("Retry-After", "1")],
                json!({"error": "no backend available", "routingGroup": group}).to_string(),
            )
                .into_response(),
            Error::QueryNotFound { .. } => (
                StatusCode::NOT_FOUND,
                json!({"error": "Query not found"}).to_string(),
            )
                .into_response(),
            Error::ContactBackend { ref source, ref backend } => {
                if source.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT.into_response()
                } else {
                    (
                        StatusCode::BAD_GATEWAY,
                        json!({"error": "backend unavailable", "backend": backend}).to_string(),
                    )
                        .into_response()
                }
            }
            Error::JoinRequestPathToBackendEndpoint { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{self:?}")).into_response()
            }
        }
    }
}

/// Accepts a new query: extract the request attributes, let the selector choose a routing
/// group, pick a backend and hand the statement over. The query id Trino assigns in the
/// response pins all follow-up requests to the same backend.
#[instrument(
    name = "POST /v1/statement",
    skip(state, headers, query),
    fields(headers = ?headers.sanitize()),
)]
pub async fn post_statement(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    query: String,
) -> Result<Response, Error> {
    state
        .metrics
        .http_requests
        .with_label_values(&["post_statement"])
        .inc();

    let attributes = QueryAttributes::from_statement_request(&headers, &query);
    let routing_group = state.selector.select(&attributes);
    let backend = state.routing_manager.pick(routing_group.as_deref())?;

    let target = backend.proxy_url.join("v1/statement").context(
        JoinRequestPathToBackendEndpointSnafu {
            requested_path: "v1/statement",
            backend_endpoint: backend.proxy_url.clone(),
        },
    )?;
    let outbound_headers = proxy::forwarded_request_headers(
        &headers,
        Some(client_addr.ip()),
        state.forwarded_proto(),
        backend.external_url.host_str(),
    );

    let response = state
        .proxy
        .forward_buffered(Method::POST, target, outbound_headers, Bytes::from(query))
        .await
        .context(ContactBackendSnafu {
            backend: &backend.name,
        })?;

    if response.status.is_success() {
        observe_new_statement_response(&state, &backend, &attributes, &response.body);
    }

    Ok(relay_rewritten(&state, &backend, response))
}

/// Captures the query id from a successful new-statement response: bind the query to the
/// backend and persist it to the query history. Failures here are never surfaced, the
/// client already has its response.
fn observe_new_statement_response(
    state: &Arc<AppState>,
    backend: &Backend,
    attributes: &QueryAttributes,
    body: &Bytes,
) {
    let Some(capture) = StatementResponseCapture::from_body(body) else {
        warn!(backend = backend.name, "Backend accepted the statement but sent an unparseable response body");
        return;
    };
    let Some(query_id) = &capture.id else {
        warn!(backend = backend.name, "Backend accepted the statement but sent no query id");
        return;
    };
    if !trino_api::is_query_id(query_id) {
        warn!(
            backend = backend.name,
            query_id, "Backend sent a query id that does not look like one, not binding it"
        );
        return;
    }

    state.routing_manager.bind(query_id, &backend.name);
    if capture.is_terminal() {
        // Instantly failed queries (e.g. syntax errors) never get polled for long
        state.routing_manager.observe_terminal(query_id);
    }

    let history = Arc::clone(&state.history);
    let record = QueryHistoryRecord {
        query_id: query_id.clone(),
        user: attributes.user.clone(),
        source: attributes.source.clone(),
        query: attributes.raw_sql.clone().unwrap_or_default(),
        backend: backend.name.clone(),
        submitted_at: Utc::now(),
    };
    tokio::spawn(async move {
        if let Err(err) = history.record(record).await {
            warn!(?err, "Failed to persist query to the history");
        }
    });
}

#[instrument(
    name = "GET /v1/statement/queued/{queryId}/{slug}/{token}",
    skip(state, headers, uri),
    fields(headers = ?headers.sanitize()),
)]
pub async fn get_queued_statement(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    Path((query_id, _slug, _token)): Path<(TrinoQueryId, String, u64)>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, Error> {
    state
        .metrics
        .http_requests
        .with_label_values(&["get_queued_statement"])
        .inc();

    follow_up(&state, client_addr, query_id, headers, uri, Method::GET).await
}

#[instrument(
    name = "GET /v1/statement/executing/{queryId}/{slug}/{token}",
    skip(state, headers, uri),
    fields(headers = ?headers.sanitize()),
)]
pub async fn get_executing_statement(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    Path((query_id, _slug, _token)): Path<(TrinoQueryId, String, u64)>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, Error> {
    state
        .metrics
        .http_requests
        .with_label_values(&["get_executing_statement"])
        .inc();

    follow_up(&state, client_addr, query_id, headers, uri, Method::GET).await
}

#[instrument(
    name = "DELETE /v1/statement/queued/{queryId}/{slug}/{token}",
    skip(state, headers, uri),
    fields(headers = ?headers.sanitize()),
)]
pub async fn delete_queued_statement(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    Path((query_id, _slug, _token)): Path<(TrinoQueryId, String, u64)>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, Error> {
    state
        .metrics
        .http_requests
        .with_label_values(&["delete_queued_statement"])
        .inc();

    follow_up(&state, client_addr, query_id, headers, uri, Method::DELETE).await
}

#[instrument(
    name = "DELETE /v1/statement/executing/{queryId}/{slug}/{token}",
    skip(state, headers, uri),
    fields(headers = ?headers.sanitize()),
)]
pub async fn delete_executing_statement(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    Path((query_id, _slug, _token)): Path<(TrinoQueryId, String, u64)>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, Error> {
    state
        .metrics
        .http_requests
        .with_label_values(&["delete_executing_statement"])
        .inc();

    follow_up(&state, client_addr, query_id, headers, uri, Method::DELETE).await
}

#[instrument(
    name = "DELETE /v1/statement/executing/partialCancel/{queryId}/{stage}/{slug}/{token}",
    skip(state, headers, uri),
    fields(headers = ?headers.sanitize()),
)]
pub async fn partial_cancel_statement(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    Path((query_id, _stage, _slug, _token)): Path<(TrinoQueryId, u64, String, u64)>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, Error> {
    state
        .metrics
        .http_requests
        .with_label_values(&["partial_cancel_statement"])
        .inc();

    follow_up(&state, client_addr, query_id, headers, uri, Method::DELETE).await
}

/// A follow-up request for a known query: resolve the binding and forward to the pinned
/// backend, regardless of its current health, so the client observes the real Trino error
/// if the coordinator is gone.
#[instrument(skip(state, headers, uri))]
async fn follow_up(
    state: &Arc<AppState>,
    client_addr: SocketAddr,
    query_id: TrinoQueryId,
    headers: HeaderMap,
    uri: Uri,
    method: Method,
) -> Result<Response, Error> {
    let backend = state.routing_manager.resolve(&query_id)?;

    let requested_path = uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str())
        .unwrap_or_else(|| uri.path());
    let target = backend.proxy_url.join(requested_path).context(
        JoinRequestPathToBackendEndpointSnafu {
            requested_path,
            backend_endpoint: backend.proxy_url.clone(),
        },
    )?;
    let outbound_headers = proxy::forwarded_request_headers(
        &headers,
        Some(client_addr.ip()),
        state.forwarded_proto(),
        backend.external_url.host_str(),
    );

    let response = state
        .proxy
        .forward_buffered(method, target, outbound_headers, Bytes::new())
        .await
        .context(ContactBackendSnafu {
            backend: &backend.name,
        })?;

    if response.status.is_success() {
        if let Some(capture) = StatementResponseCapture::from_body(&response.body) {
            if capture.is_terminal() {
                state.routing_manager.observe_terminal(&query_id);
            }
        }
    }

    Ok(relay_rewritten(state, &backend, response))
}

/// Relays a buffered backend response to the client, with all coordinator links pointing
/// back at the gateway. Non-UTF-8 bodies (there should be none on these endpoints) pass
/// through unchanged.
fn relay_rewritten(
    state: &Arc<AppState>,
    backend: &Backend,
    response: proxy::BufferedResponse,
) -> Response {
    let body = match std::str::from_utf8(&response.body) {
        Ok(body) => Bytes::from(trino_api::rewrite_proxied_uris(
            body,
            &backend.external_url,
            state.gateway_url(),
        )),
        // Bytes clones are cheap reference bumps
        Err(_) => response.body.clone(),
    };

    (response.status, response.headers, body).into_response()
}
