use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde_json::json;
use snafu::{ResultExt, Snafu};
use tracing::{instrument, warn};
use trino_gateway_core::{RoutingGroupName, TrinoBackendName, TrinoQueryId, trino_api};
use url::Url;

use crate::{
    http_server::{AppState, proxy},
    routing_manager,
};

/// UI requests carry small bodies (login forms, API filters), everything bigger is bogus.
const MAX_UI_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("No routable backend available for routing group {group:?}"))]
    NoBackendAvailable { group: RoutingGroupName },

    #[snafu(display("Query {query_id:?} not found"))]
    QueryNotFound { query_id: TrinoQueryId },

    #[snafu(display("Failed to read the request body"))]
    ReadRequestBody { source: axum::Error },

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
        warn!(error = ?self, "Error while proxying UI request");

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
            Error::ReadRequestBody { .. } | Error::JoinRequestPathToBackendEndpoint { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{self:?}")).into_response()
            }
        }
    }
}

/// Transparent pass-through for the Trino web UI and the info endpoints.
///
/// `/ui/api/query/{queryId}` style requests resolve the query binding like any other
/// follow-up, everything else goes to the configured UI backend. Response bodies stream
/// straight through, no rewriting happens here.
#[instrument(name = "ANY /ui/*", skip(state, request))]
pub async fn proxy_ui_request(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Result<Response, Error> {
    state.metrics.http_requests.with_label_values(&["ui"]).inc();

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_UI_REQUEST_BODY_BYTES)
        .await
        .context(ReadRequestBodySnafu)?;

    let backend = match trino_api::query_id_from_path(parts.uri.path()) {
        Some(query_id) => state.routing_manager.resolve(&query_id)?,
        None => state.routing_manager.ui_backend()?,
    };

    let requested_path = parts
        .uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str())
        .unwrap_or_else(|| parts.uri.path());
    let target = backend.proxy_url.join(requested_path).context(
        JoinRequestPathToBackendEndpointSnafu {
            requested_path,
            backend_endpoint: backend.proxy_url.clone(),
        },
    )?;
    let outbound_headers = proxy::forwarded_request_headers(
        &parts.headers,
        Some(client_addr.ip()),
        state.forwarded_proto(),
        backend.external_url.host_str(),
    );

    let response = state
        .proxy
        .forward_streaming(parts.method, target, outbound_headers, body)
        .await
        .context(ContactBackendSnafu {
            backend: &backend.name,
        })?;

    let status = response.status();
    let headers = proxy::relayed_response_headers(response.headers());
    Ok((status, headers, Body::from_stream(response.bytes_stream())).into_response())
}
