use std::{net::IpAddr, time::Duration};

use axum::body::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use reqwest::Client;
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};
use trino_gateway_core::{sanitization::Sanitize, trino_headers::TRINO_ROUTING_GROUP_HEADER};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the backend may stay silent before we give up on the exchange. This is an idle
/// timeout, not a total one: result pages may stream for as long as the query runs.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to create HTTP client"))]
    CreateHttpClient { source: reqwest::Error },

    #[snafu(display("Failed to connect to the backend"))]
    ConnectToBackend { source: reqwest::Error },

    #[snafu(display("The backend did not answer in time"))]
    BackendTimeout { source: reqwest::Error },

    #[snafu(display("Failed to forward the request to the backend"))]
    ForwardRequest { source: reqwest::Error },

    #[snafu(display("Failed to read the backend response"))]
    ReadBackendResponse { source: reqwest::Error },
}

impl Error {
    /// Whether this failure surfaces as 504 (timeout) rather than 502 (connectivity).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::BackendTimeout { .. })
    }
}

fn classify_send_error(source: reqwest::Error) -> Error {
    if source.is_timeout() {
        Error::BackendTimeout { source }
    } else if source.is_connect() {
        Error::ConnectToBackend { source }
    } else {
        Error::ForwardRequest { source }
    }
}

/// A fully buffered backend response, used for the statement endpoints whose bodies get
/// inspected and rewritten.
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct ProxyClient {
    client: Client,
}

impl ProxyClient {
    pub fn new(ignore_certs: bool) -> Result<Self, Error> {
        let client = Client::builder()
            .danger_accept_invalid_certs(ignore_certs)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .context(CreateHttpClientSnafu)?;

        Ok(Self { client })
    }

    #[instrument(
        skip(self, headers, body),
        fields(headers = ?headers.sanitize()),
    )]
    pub async fn forward_buffered(
        &self,
        method: Method,
        target: Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<BufferedResponse, Error> {
        let response = self
            .client
            .request(method, target)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        let headers = relayed_response_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|source| match source.is_timeout() {
                true => Error::BackendTimeout { source },
                false => Error::ReadBackendResponse { source },
            })?;
        debug!(%status, body_bytes = body.len(), "Received backend response");

        Ok(BufferedResponse {
            status,
            headers,
            body,
        })
    }

    /// Forwards without buffering the response, for UI assets and other pass-through
    /// traffic. The caller streams the returned response body to the client.
    #[instrument(
        skip(self, headers, body),
        fields(headers = ?headers.sanitize()),
    )]
    pub async fn forward_streaming(
        &self,
        method: Method,
        target: Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, Error> {
        self.client
            .request(method, target)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(classify_send_error)
    }
}

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &http::HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Builds the header map forwarded to the backend: everything from the inbound request
/// except hop-by-hop headers, `Host` (set to the backend's external host), the gateway's
/// routing-group header and `Accept-Encoding` (the outbound client negotiates its own
/// compression, the gateway's compression layer re-encodes for the client). The standard
/// `X-Forwarded-*` headers are appended, never overwritten.
pub fn forwarded_request_headers(
    inbound: &HeaderMap,
    client_ip: Option<IpAddr>,
    gateway_proto: &'static str,
    backend_external_host: Option<&str>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in inbound {
        if is_hop_by_hop(name)
            || name == &header::HOST
            || name == &header::CONTENT_LENGTH
            || name == &header::ACCEPT_ENCODING
            || name.as_str() == TRINO_ROUTING_GROUP_HEADER
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(client_ip) = client_ip {
        if let Ok(value) = HeaderValue::try_from(client_ip.to_string()) {
            headers.append("x-forwarded-for", value);
        }
    }
    headers.append("x-forwarded-proto", HeaderValue::from_static(gateway_proto));
    if let Some(host) = inbound.get(header::HOST) {
        headers.append("x-forwarded-host", host.clone());
    }

    if let Some(host) = backend_external_host {
        if let Ok(value) = HeaderValue::try_from(host) {
            headers.insert(header::HOST, value);
        }
    }

    headers
}

/// Strips everything from a backend response that must not reach the client unchanged:
/// hop-by-hop headers and `Content-Length` (the body length can change through rewriting,
/// the server recomputes it).
pub fn relayed_response_headers(backend_headers: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in backend_headers {
        if is_hop_by_hop(name) || name == &header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    headers
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn inbound() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gateway:8080"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert("x-trino-user", HeaderValue::from_static("will"));
        headers.insert("x-trino-routing-group", HeaderValue::from_static("etl"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.7"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers
    }

    #[test]
    fn test_forwarded_request_headers() {
        let headers = forwarded_request_headers(
            &inbound(),
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2))),
            "http",
            Some("trino-1.example.com"),
        );

        // Trino headers pass through, the gateway's own routing header does not
        assert_eq!(headers.get("x-trino-user").unwrap(), "will");
        assert!(headers.get("x-trino-routing-group").is_none());

        // Host is rewritten to the backend, hop-by-hop and length headers are dropped
        assert_eq!(headers.get(header::HOST).unwrap(), "trino-1.example.com");
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert!(headers.get(header::ACCEPT_ENCODING).is_none());
        assert!(headers.get(header::CONNECTION).is_none());

        // Forwarding headers are appended to existing ones, not overwritten
        let forwarded_for: Vec<_> = headers
            .get_all("x-forwarded-for")
            .iter()
            .map(|value| value.to_str().unwrap())
            .collect();
        assert_eq!(forwarded_for, ["10.0.0.7", "192.168.1.2"]);
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "gateway:8080");
    }

    #[test]
    fn test_relayed_response_headers() {
        let mut backend_headers = HeaderMap::new();
        backend_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        backend_headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("123"));
        backend_headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        backend_headers.insert("x-trino-set-catalog", HeaderValue::from_static("hive"));

        let headers = relayed_response_headers(&backend_headers);
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(headers.get("x-trino-set-catalog").unwrap(), "hive");
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
    }
}
