use std::{sync::Arc, time::Duration};

use clap::Parser;
use main_error::MainError;
use snafu::{ResultExt, Snafu};
use trino_gateway_core::config::{self, Config};
use trino_gateway_state::{BindingRegistry, HistorySinkImplementation, InMemoryHistory, history};

use crate::{
    args::Args,
    backend_manager::BackendManager,
    http_server::{AppState, ProxyClient, start_http_server},
    maintenance::{binding_sweeper::BindingSweeper, health_checker, health_checker::HealthChecker},
    metrics::Metrics,
    routing_manager::RoutingManager,
};

mod args;
mod backend_manager;
mod http_server;
mod maintenance;
mod metrics;
mod routing;
mod routing_manager;
mod tracing;
mod trino_client;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to set up tracing"))]
    SetUpTracing { source: tracing::Error },

    #[snafu(display("Failed to read configuration"))]
    ReadConfig { source: config::Error },

    #[snafu(display("Failed to set up metrics"))]
    SetUpMetrics { source: metrics::Error },

    #[snafu(display("Failed to create query history"))]
    CreateQueryHistory { source: history::Error },

    #[snafu(display("Failed to create routing group selector"))]
    CreateSelector { source: routing::Error },

    #[snafu(display("Failed to create proxy HTTP client"))]
    CreateProxyClient { source: http_server::proxy::Error },

    #[snafu(display("Failed to create health checker"))]
    CreateHealthChecker { source: health_checker::Error },

    #[snafu(display("Failed to start HTTP server"))]
    StartHttpServer { source: http_server::Error },
}

#[tokio::main]
async fn main() -> Result<(), MainError> {
    let args = Args::parse();

    tracing::init().context(SetUpTracingSnafu)?;

    let config = Config::read_from_file(&args.config_file)
        .await
        .context(ReadConfigSnafu)?;

    let metrics = Arc::new(Metrics::new().context(SetUpMetricsSnafu)?);

    let bindings = Arc::new(BindingRegistry::new(Duration::from_secs(
        config.routing.binding_ttl_seconds,
    )));
    let history: Arc<HistorySinkImplementation> = Arc::new(
        InMemoryHistory::new(config.routing.history_retention)
            .context(CreateQueryHistorySnafu)?
            .into(),
    );

    let backends = Arc::new(BackendManager::new(&config));
    let selector = routing::selector_from_config(&config).context(CreateSelectorSnafu)?;
    let routing_manager = Arc::new(RoutingManager::new(
        Arc::clone(&backends),
        Arc::clone(&bindings),
        &config,
    ));
    let proxy = ProxyClient::new(config.backends_ignore_cert).context(CreateProxyClientSnafu)?;

    HealthChecker::new(Arc::clone(&backends), Arc::clone(&metrics), &config)
        .context(CreateHealthCheckerSnafu)?
        .start_loop();
    BindingSweeper::new(Arc::clone(&bindings), Arc::clone(&metrics), &config).start_loop();

    start_http_server(AppState {
        config,
        selector,
        routing_manager,
        proxy,
        history,
        metrics,
    })
    .await
    .context(StartHttpServerSnafu)?;

    Ok(())
}
