use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures::future::join_all;
use snafu::{ResultExt, Snafu};
use tokio::time;
use tracing::{Instrument, debug, info_span, instrument};
use trino_gateway_core::config::Config;

use crate::{
    backend_manager::{Backend, BackendManager, HealthSnapshot},
    metrics::Metrics,
    trino_client,
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to create HTTP client"))]
    CreateHttpClient { source: reqwest::Error },
}

/// Periodically probes every backend's `/v1/info` endpoint and, where UI credentials are
/// configured, its queue depth. Probes run concurrently, one slow or dead backend never
/// delays the others.
pub struct HealthChecker {
    backends: Arc<BackendManager>,
    metrics: Arc<Metrics>,
    probe_interval: Duration,
    probe_timeout: Duration,
    ignore_certs: bool,
    http_client: reqwest::Client,
}

impl HealthChecker {
    #[instrument(skip(backends, metrics, config))]
    pub fn new(
        backends: Arc<BackendManager>,
        metrics: Arc<Metrics>,
        config: &Config,
    ) -> Result<Self, Error> {
        let http_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.backends_ignore_cert)
            .build()
            .context(CreateHttpClientSnafu)?;

        Ok(Self {
            backends,
            metrics,
            probe_interval: Duration::from_secs(config.monitor.probe_interval_seconds),
            probe_timeout: Duration::from_millis(config.monitor.probe_timeout_ms),
            ignore_certs: config.backends_ignore_cert,
            http_client,
        })
    }

    pub fn start_loop(self) {
        tokio::spawn(async move {
            let mut interval = time::interval(self.probe_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                // First tick does not sleep, so let's put it at the start of the loop.
                interval.tick().await;

                self.probe_all()
                    .instrument(info_span!("Probing backend health"))
                    .await;
            }
        });
    }

    async fn probe_all(&self) {
        let backends = self.backends.all();
        join_all(backends.iter().map(|backend| self.probe(backend))).await;
    }

    #[instrument(skip(self, backend), fields(backend = backend.name))]
    async fn probe(&self, backend: &Arc<Backend>) {
        let reachable =
            match trino_client::get_info(&self.http_client, &backend.proxy_url, self.probe_timeout)
                .await
            {
                Ok(info) => {
                    if info.starting {
                        debug!("Backend is still starting, not routing to it yet");
                    }
                    !info.starting
                }
                Err(err) => {
                    debug!(?err, "Backend health probe failed");
                    false
                }
            };

        // The queue depth is optional extra signal: it only orders backends within a group,
        // so keeping the previous value on a failed fetch is fine.
        let mut queued_queries = backend.health().queued_queries;
        if reachable {
            if let Some(credentials) = &backend.credentials {
                match trino_client::get_cluster_stats(
                    &backend.proxy_url,
                    self.ignore_certs,
                    credentials,
                    self.probe_timeout,
                )
                .await
                {
                    // Everything that still occupies the cluster counts towards the ranking
                    Ok(stats) => {
                        queued_queries =
                            stats.running_queries + stats.blocked_queries + stats.queued_queries;
                    }
                    Err(err) => debug!(?err, "Failed to fetch cluster stats"),
                }
            }
        }

        backend.update_health(HealthSnapshot {
            reachable,
            queued_queries,
            last_probed: Some(SystemTime::now()),
        });

        self.metrics
            .backend_reachable
            .with_label_values(&[backend.name.as_str()])
            .set(reachable.into());
        self.metrics
            .backend_queued_queries
            .with_label_values(&[backend.name.as_str()])
            .set(queued_queries as i64);
    }
}
