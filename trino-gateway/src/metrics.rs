use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use snafu::{ResultExt, Snafu};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to create metric {metric:?}"))]
    CreateMetric {
        source: prometheus::Error,
        metric: String,
    },

    #[snafu(display("Failed to register metric {metric:?}"))]
    RegisterMetric {
        source: prometheus::Error,
        metric: String,
    },
}

pub struct Metrics {
    pub registry: Registry,

    /// Total number of HTTP requests made, by gateway resource.
    pub http_requests: IntCounterVec,

    /// Number of query bindings currently held, updated by the sweeper.
    pub active_bindings: IntGauge,

    /// 1 when the last probe of the backend succeeded, 0 otherwise.
    pub backend_reachable: IntGaugeVec,

    /// Queue depth the backend reported on the last probe.
    pub backend_queued_queries: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, Error> {
        let registry = Registry::new();

        let http_requests = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests made."),
            &["resource"],
        )
        .context(CreateMetricSnafu {
            metric: "http_requests_total",
        })?;

        let active_bindings = IntGauge::new(
            "active_query_bindings",
            "Number of query to backend bindings currently held.",
        )
        .context(CreateMetricSnafu {
            metric: "active_query_bindings",
        })?;

        let backend_reachable = IntGaugeVec::new(
            Opts::new(
                "backend_reachable",
                "Whether the last health probe of the backend succeeded.",
            ),
            &["backend"],
        )
        .context(CreateMetricSnafu {
            metric: "backend_reachable",
        })?;

        let backend_queued_queries = IntGaugeVec::new(
            Opts::new(
                "backend_queued_queries",
                "Queue depth the backend reported on the last probe.",
            ),
            &["backend"],
        )
        .context(CreateMetricSnafu {
            metric: "backend_queued_queries",
        })?;

        for (metric, collector) in [
            ("http_requests_total", Box::new(http_requests.clone()) as Box<dyn prometheus::core::Collector>),
            ("active_query_bindings", Box::new(active_bindings.clone())),
            ("backend_reachable", Box::new(backend_reachable.clone())),
            ("backend_queued_queries", Box::new(backend_queued_queries.clone())),
        ] {
            registry
                .register(collector)
                .context(RegisterMetricSnafu { metric })?;
        }

        Ok(Self {
            registry,
            http_requests,
            active_bindings,
            backend_reachable,
            backend_queued_queries,
        })
    }
}
