use std::time::Duration;

use reqwest::header;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tracing::instrument;
use trino_gateway_core::config::BackendCredentialsConfig;
use url::Url;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to construct http client"))]
    ConstructHttpClient { source: reqwest::Error },

    #[snafu(display("Failed to join API path onto trino endpoint {trino_endpoint}"))]
    JoinApiPathToTrinoEndpoint {
        source: url::ParseError,
        trino_endpoint: Url,
    },

    #[snafu(display("Failed to contact Trino at {endpoint}"))]
    ContactTrino { source: reqwest::Error, endpoint: Url },

    #[snafu(display("Trino at {endpoint} answered with status {status}"))]
    TrinoErrorStatus {
        endpoint: Url,
        status: reqwest::StatusCode,
    },

    #[snafu(display("Failed to parse Trino response"))]
    ParseTrinoResponse { source: reqwest::Error },

    #[snafu(display("Failed to log into Trino cluster using endpoint {login_endpoint}"))]
    LogIntoTrinoCluster {
        source: reqwest::Error,
        login_endpoint: Url,
    },
}

/// The subset of `/v1/info` the health probe cares about.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrinoInfo {
    #[serde(default)]
    pub starting: bool,
}

/// The subset of the Trino web UI `/ui/api/stats` response used to rank backends.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStats {
    #[serde(default)]
    pub running_queries: u64,

    #[serde(default)]
    pub blocked_queries: u64,

    #[serde(default)]
    pub queued_queries: u64,
}

/// Probes `/v1/info`. A coordinator that answers but reports `starting: true` is not ready
/// to accept queries yet.
#[instrument(skip(client))]
pub async fn get_info(
    client: &reqwest::Client,
    endpoint: &Url,
    timeout: Duration,
) -> Result<TrinoInfo, Error> {
    let info_endpoint = endpoint
        .join("v1/info")
        .context(JoinApiPathToTrinoEndpointSnafu {
            trino_endpoint: endpoint.clone(),
        })?;

    let response = client
        .get(info_endpoint.clone())
        .timeout(timeout)
        .send()
        .await
        .context(ContactTrinoSnafu {
            endpoint: info_endpoint.clone(),
        })?;

    if !response.status().is_success() {
        return TrinoErrorStatusSnafu {
            endpoint: info_endpoint,
            status: response.status(),
        }
        .fail();
    }

    response.json().await.context(ParseTrinoResponseSnafu)
}

/// Fetches the cluster stats from the Trino web UI. Requires UI credentials.
#[instrument]
pub async fn get_cluster_stats(
    endpoint: &Url,
    ignore_certs: bool,
    credentials: &BackendCredentialsConfig,
    timeout: Duration,
) -> Result<ClusterStats, Error> {
    // We create a new client here every time just to be sure we don't accidentally leak the
    // cookie store to a different connection.
    let client = reqwest::Client::builder()
        .cookie_store(true)
        .danger_accept_invalid_certs(ignore_certs)
        .timeout(timeout)
        .build()
        .context(ConstructHttpClientSnafu)?;

    let login_endpoint = endpoint
        .join("ui/login")
        .context(JoinApiPathToTrinoEndpointSnafu {
            trino_endpoint: endpoint.clone(),
        })?;
    client
        .post(login_endpoint.clone())
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(format!(
            "username={}&password={}&redirectPath=",
            &credentials.username, &credentials.password,
        ))
        .send()
        .await
        .context(LogIntoTrinoClusterSnafu { login_endpoint })?;

    let stats_endpoint = endpoint
        .join("ui/api/stats")
        .context(JoinApiPathToTrinoEndpointSnafu {
            trino_endpoint: endpoint.clone(),
        })?;
    let response = client
        .get(stats_endpoint.clone())
        .send()
        .await
        .context(ContactTrinoSnafu {
            endpoint: stats_endpoint,
        })?;

    response.json().await.context(ParseTrinoResponseSnafu)
}
