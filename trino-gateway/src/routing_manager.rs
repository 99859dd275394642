use std::{sync::Arc, time::Duration};

use snafu::{OptionExt, Snafu};
use tokio::time::sleep;
use tracing::{debug, info, instrument};
use trino_gateway_core::{
    DEFAULT_ROUTING_GROUP, NO_MATCH_ROUTING_GROUP, RoutingGroupName, TrinoBackendName,
    TrinoQueryId, config::Config,
};
use trino_gateway_state::{BindOutcome, BindingRegistry};

use crate::backend_manager::{Backend, BackendManager};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("No routable backend available for routing group {group:?}"))]
    NoBackendAvailable { group: RoutingGroupName },

    #[snafu(display("Query {query_id:?} not found"))]
    UnknownQuery { query_id: TrinoQueryId },
}

/// Chooses a backend for new queries and keeps follow-up requests pinned to the backend
/// that accepted the query.
pub struct RoutingManager {
    backends: Arc<BackendManager>,
    bindings: Arc<BindingRegistry>,
    ui_backend: Option<TrinoBackendName>,
    terminal_grace: Duration,
}

impl RoutingManager {
    pub fn new(
        backends: Arc<BackendManager>,
        bindings: Arc<BindingRegistry>,
        config: &Config,
    ) -> Self {
        Self {
            backends,
            bindings,
            ui_backend: config.request_router.ui_backend.clone(),
            terminal_grace: Duration::from_secs(config.routing.terminal_grace_seconds),
        }
    }

    /// Picks the backend for a new query. An unknown or empty group falls back to the
    /// default group; only when that is empty as well the routing fails.
    #[instrument(skip(self))]
    pub fn pick(&self, group: Option<&str>) -> Result<Arc<Backend>, Error> {
        let requested = group.filter(|g| !g.is_empty() && *g != NO_MATCH_ROUTING_GROUP);

        if let Some(group) = requested {
            if let Some(backend) = self.backends.list_by_group(group).into_iter().next() {
                return Ok(backend);
            }
            debug!(
                group,
                "Routing group has no routable backend, falling back to the default group"
            );
        }

        self.backends
            .list_by_group(DEFAULT_ROUTING_GROUP)
            .into_iter()
            .next()
            .context(NoBackendAvailableSnafu {
                group: requested.unwrap_or(DEFAULT_ROUTING_GROUP),
            })
    }

    /// Resolves the backend a query is pinned to. The backend is returned regardless of its
    /// current health, so the client observes the real Trino error if the coordinator died.
    #[instrument(skip(self))]
    pub fn resolve(&self, query_id: &str) -> Result<Arc<Backend>, Error> {
        let backend_name = self
            .bindings
            .resolve(query_id)
            .context(UnknownQuerySnafu { query_id })?;

        // The backend can have been removed by an admin since the query was bound. There is
        // nothing left to forward to, so this counts as an unknown query.
        self.backends
            .find(&backend_name)
            .context(UnknownQuerySnafu { query_id })
    }

    /// Records that `query_id` runs on `backend`. Idempotent; a conflicting bind keeps the
    /// existing binding (the registry logs it).
    pub fn bind(&self, query_id: &str, backend: &str) {
        if self.bindings.bind(query_id, backend) == BindOutcome::Created {
            debug!(query_id, backend, "Bound query to backend");
        }
    }

    /// A terminal response was observed for the query. The binding stays alive for a grace
    /// period so the client can fetch the final result page, then it is dropped.
    #[instrument(skip(self))]
    pub fn observe_terminal(&self, query_id: &str) {
        if !self.bindings.schedule_eviction(query_id, self.terminal_grace) {
            return;
        }

        let bindings = Arc::clone(&self.bindings);
        let grace = self.terminal_grace;
        let query_id = query_id.to_string();
        tokio::spawn(async move {
            sleep(grace).await;
            if bindings.evict(&query_id) {
                info!(query_id, "Evicted binding of completed query");
            }
        });
    }

    /// The backend that serves UI and info requests not tied to a known query.
    pub fn ui_backend(&self) -> Result<Arc<Backend>, Error> {
        if let Some(name) = &self.ui_backend {
            if let Some(backend) = self.backends.find(name) {
                return Ok(backend);
            }
        }

        self.pick(None)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use trino_gateway_core::config::Config;

    use crate::backend_manager::HealthSnapshot;

    use super::*;

    const QUERY_ID: &str = "20240101_000000_00001_abcde";

    fn routing_manager() -> (Arc<RoutingManager>, Arc<BackendManager>) {
        let config: Config = serde_yaml::from_str(indoc! {r#"
            requestRouter:
              externalUrl: http://trino-gateway:8080
            backends:
              - name: adhoc-1
                externalUrl: http://adhoc-1:8080
              - name: etl-1
                externalUrl: http://etl-1:8080
                routingGroup: etl
        "#})
        .expect("Failed to parse test config");

        let backends = Arc::new(BackendManager::new(&config));
        let bindings = Arc::new(BindingRegistry::new(Duration::from_secs(3600)));
        (
            Arc::new(RoutingManager::new(
                Arc::clone(&backends),
                bindings,
                &config,
            )),
            backends,
        )
    }

    #[test]
    fn test_pick_prefers_the_requested_group() {
        let (routing_manager, _) = routing_manager();

        assert_eq!(routing_manager.pick(Some("etl")).unwrap().name, "etl-1");
        assert_eq!(routing_manager.pick(None).unwrap().name, "adhoc-1");
    }

    #[test]
    fn test_pick_falls_back_to_the_default_group() {
        let (routing_manager, _) = routing_manager();

        assert_eq!(
            routing_manager.pick(Some("does-not-exist")).unwrap().name,
            "adhoc-1"
        );
        assert_eq!(routing_manager.pick(Some("no-match")).unwrap().name, "adhoc-1");
        assert_eq!(routing_manager.pick(Some("")).unwrap().name, "adhoc-1");
    }

    #[test]
    fn test_pick_fails_without_any_routable_backend() {
        let (routing_manager, backends) = routing_manager();

        for backend in backends.all() {
            backend.set_active(false);
        }

        assert!(matches!(
            routing_manager.pick(Some("etl")),
            Err(Error::NoBackendAvailable { group }) if group == "etl"
        ));
        assert!(matches!(
            routing_manager.pick(None),
            Err(Error::NoBackendAvailable { group }) if group == DEFAULT_ROUTING_GROUP
        ));
    }

    #[test]
    fn test_resolve_returns_the_bound_backend_even_when_unhealthy() {
        let (routing_manager, backends) = routing_manager();

        routing_manager.bind(QUERY_ID, "etl-1");
        backends.find("etl-1").unwrap().update_health(HealthSnapshot {
            reachable: false,
            queued_queries: 0,
            last_probed: None,
        });

        assert_eq!(routing_manager.resolve(QUERY_ID).unwrap().name, "etl-1");
    }

    #[test]
    fn test_resolve_of_unknown_query_fails() {
        let (routing_manager, _) = routing_manager();

        assert!(matches!(
            routing_manager.resolve(QUERY_ID),
            Err(Error::UnknownQuery { .. })
        ));
    }

    #[test]
    fn test_resolve_of_removed_backend_fails() {
        let (routing_manager, backends) = routing_manager();

        routing_manager.bind(QUERY_ID, "etl-1");
        backends.remove("etl-1");

        assert!(matches!(
            routing_manager.resolve(QUERY_ID),
            Err(Error::UnknownQuery { .. })
        ));
    }

    #[test]
    fn test_conflicting_bind_keeps_the_first_backend() {
        let (routing_manager, _) = routing_manager();

        routing_manager.bind(QUERY_ID, "adhoc-1");
        routing_manager.bind(QUERY_ID, "etl-1");

        assert_eq!(routing_manager.resolve(QUERY_ID).unwrap().name, "adhoc-1");
    }
}
