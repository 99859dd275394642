use std::{
    net::{Ipv6Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use axum::{
    Router,
    routing::{any, get, post},
};
use axum_server::{Handle, tls_rustls::RustlsConfig};
use futures::FutureExt;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::time::sleep;
use tower_http::{
    compression::CompressionLayer, decompression::RequestDecompressionLayer, trace::TraceLayer,
};
use tracing::{debug, info};
use trino_gateway_core::config::Config;
use trino_gateway_state::HistorySinkImplementation;
use url::Url;

use crate::{
    metrics::Metrics,
    routing::SelectorImplementation,
    routing_manager::RoutingManager,
};

mod metrics;
pub mod proxy;
mod ui;
mod v1;

pub use proxy::ProxyClient;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display(
        "Failed to configure HTTP server PEM cert at {cert_pem_file:?} and PEM key at {key_pem_file:?}"
    ))]
    ConfigureServerTrustAndKeystore {
        source: std::io::Error,
        cert_pem_file: PathBuf,
        key_pem_file: PathBuf,
    },

    #[snafu(display("Failed to start HTTP server"))]
    StartHttpServer { source: std::io::Error },

    #[snafu(display(
        "In case ssl is used the `requestRouter.certPemFile` and `requestRouter.keyPemFile` options must be set"
    ))]
    CertsMissing,
}

pub struct AppState {
    pub config: Config,
    pub selector: SelectorImplementation,
    pub routing_manager: Arc<RoutingManager>,
    pub proxy: ProxyClient,
    pub history: Arc<HistorySinkImplementation>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// The address clients reach the gateway under; proxied links are rewritten to it.
    pub fn gateway_url(&self) -> &Url {
        &self.config.request_router.external_url
    }

    pub fn forwarded_proto(&self) -> &'static str {
        if self.config.request_router.ssl {
            "https"
        } else {
            "http"
        }
    }
}

pub async fn start_http_server(app_state: AppState) -> Result<(), Error> {
    let router_config = app_state.config.request_router.clone();
    let app_state = Arc::new(app_state);

    let handle = Handle::new();
    tokio::spawn(graceful_shutdown(handle.clone()));

    // Start Prometheus metrics exporter on its own port, it must not be reachable through
    // the client-facing proxy surface.
    let app = Router::new()
        .route("/metrics", get(metrics::get))
        .with_state(Arc::clone(&app_state));
    let listen_addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, router_config.metrics_port));
    info!(%listen_addr, "Starting metrics exporter");

    let handle_clone = handle.clone();
    tokio::spawn(async move {
        axum_server::bind(listen_addr)
            .handle(handle_clone)
            .serve(app.into_make_service())
            .await
    });

    let app = Router::new()
        .route("/v1/statement", post(v1::statement::post_statement))
        .route(
            "/v1/statement/queued/{query_id}/{slug}/{token}",
            get(v1::statement::get_queued_statement)
                .delete(v1::statement::delete_queued_statement),
        )
        .route(
            "/v1/statement/executing/{query_id}/{slug}/{token}",
            get(v1::statement::get_executing_statement)
                .delete(v1::statement::delete_executing_statement),
        )
        .route(
            "/v1/statement/executing/partialCancel/{query_id}/{stage}/{slug}/{token}",
            axum::routing::delete(v1::statement::partial_cancel_statement),
        )
        .route("/v1/info", any(ui::proxy_ui_request))
        .route("/v1/node", any(ui::proxy_ui_request))
        .route("/ui", any(ui::proxy_ui_request))
        .route("/ui/{*path}", any(ui::proxy_ui_request))
        // Everything else (cluster stats polling, favicon, ...) also goes to the UI backend
        .fallback(ui::proxy_ui_request)
        .layer(TraceLayer::new_for_http())
        // Transparently decompress request bodies based on the Content-Encoding header
        .layer(RequestDecompressionLayer::new())
        // Compress response bodies if the associated request had an Accept-Encoding header.
        // Trino clients can ask for compressed data, so we should support compressing the
        // response.
        .layer(CompressionLayer::new())
        .with_state(app_state);

    if router_config.ssl {
        let listen_addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, router_config.port));
        info!(%listen_addr, "Starting https server");

        if rustls::crypto::ring::default_provider().install_default().is_err() {
            debug!("A rustls crypto provider was already installed");
        }

        let cert_pem_file = router_config.cert_pem_file.context(CertsMissingSnafu)?;
        let key_pem_file = router_config.key_pem_file.context(CertsMissingSnafu)?;
        let tls_config = RustlsConfig::from_pem_file(&cert_pem_file, &key_pem_file)
            .await
            .context(ConfigureServerTrustAndKeystoreSnafu {
                cert_pem_file,
                key_pem_file,
            })?;

        axum_server::bind_rustls(listen_addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context(StartHttpServerSnafu)?;
    } else {
        let listen_addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, router_config.port));
        info!(%listen_addr, "Starting http server");

        axum_server::bind(listen_addr)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context(StartHttpServerSnafu)?;
    }

    info!("Shut down");

    Ok(())
}

async fn graceful_shutdown(handle: Handle) {
    wait_for_shutdown_signal().await;

    info!("Shutting down gracefully");

    // Signal the server to shutdown using Handle.
    handle.graceful_shutdown(Some(Duration::from_secs(5)));
    loop {
        info!(
            connections = handle.connection_count(),
            "Waiting for all connections to close"
        );
        sleep(Duration::from_secs(1)).await;
    }
}

async fn wait_for_shutdown_signal() {
    futures::future::select(
        tokio::signal::ctrl_c().map(|_| ()).boxed(),
        #[cfg(unix)]
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .unwrap()
            .recv()
            .map(|_| ())
            .boxed(),
        // Assume that ctrl_c is enough on non-Unix platforms (such as Windows)
        #[cfg(not(unix))]
        futures::future::pending::<()>(),
    )
    .await;
}
