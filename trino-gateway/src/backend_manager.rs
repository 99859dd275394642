use std::{
    fmt::Debug,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::SystemTime,
};

use tracing::{info, instrument};
use trino_gateway_core::{
    RoutingGroupName, TrinoBackendName,
    config::{BackendConfig, BackendCredentialsConfig, Config},
};
use url::Url;

/// One configured Trino coordinator with its transient health state.
///
/// The static fields never change after construction, admin updates replace the whole
/// [`Backend`] entry. The `active` flag and the health snapshot are the only mutable parts
/// and can be flipped without touching the backend list.
pub struct Backend {
    pub name: TrinoBackendName,
    pub external_url: Url,
    pub proxy_url: Url,
    pub routing_group: RoutingGroupName,
    pub credentials: Option<BackendCredentialsConfig>,

    active: AtomicBool,
    health: RwLock<HealthSnapshot>,
}

#[derive(Clone, Debug)]
pub struct HealthSnapshot {
    pub reachable: bool,
    pub queued_queries: u64,
    pub last_probed: Option<SystemTime>,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        // Optimistic until the first probe ran, so a freshly started gateway can route
        // right away. The prober corrects this within one interval.
        Self {
            reachable: true,
            queued_queries: 0,
            last_probed: None,
        }
    }
}

impl Backend {
    fn from_config(config: &BackendConfig) -> Self {
        Self {
            name: config.name.clone(),
            external_url: config.external_url.clone(),
            proxy_url: config.proxy_url().clone(),
            routing_group: config.routing_group.clone(),
            credentials: config.credentials.clone(),
            active: AtomicBool::new(config.active),
            health: RwLock::new(HealthSnapshot::default()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.read().expect("Health snapshot poisoned").clone()
    }

    pub fn update_health(&self, snapshot: HealthSnapshot) {
        *self.health.write().expect("Health snapshot poisoned") = snapshot;
    }

    /// A backend receives new queries only when an admin considers it active and the last
    /// probe could reach it.
    pub fn is_routable(&self) -> bool {
        self.is_active() && self.health().reachable
    }
}

impl Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("external_url", &self.external_url)
            .field("proxy_url", &self.proxy_url)
            .field("routing_group", &self.routing_group)
            .field("active", &self.is_active())
            .field("health", &self.health())
            .finish()
    }
}

/// The authoritative in-memory backend pool.
///
/// The list itself is copy-on-write: routing decisions grab the current `Arc` once and
/// iterate without holding any lock, admin mutations swap in a new list.
pub struct BackendManager {
    backends: RwLock<Arc<Vec<Arc<Backend>>>>,
}

impl BackendManager {
    #[instrument(skip(config))]
    pub fn new(config: &Config) -> Self {
        let backends: Vec<_> = config
            .backends
            .iter()
            .map(|backend_config| Arc::new(Backend::from_config(backend_config)))
            .collect();
        info!(backends = backends.len(), "Loaded backend pool");

        Self {
            backends: RwLock::new(Arc::new(backends)),
        }
    }

    fn snapshot(&self) -> Arc<Vec<Arc<Backend>>> {
        Arc::clone(&self.backends.read().expect("Backend list poisoned"))
    }

    /// Every configured backend, for admin surfaces and the health prober.
    pub fn all(&self) -> Vec<Arc<Backend>> {
        self.snapshot().iter().cloned().collect()
    }

    pub fn find(&self, name: &str) -> Option<Arc<Backend>> {
        self.snapshot().iter().find(|b| b.name == name).cloned()
    }

    /// The routable backends of a group, ordered by ascending queue depth with the name as
    /// tie breaker so the order is stable between probes.
    pub fn list_by_group(&self, group: &str) -> Vec<Arc<Backend>> {
        let mut backends: Vec<_> = self
            .snapshot()
            .iter()
            .filter(|backend| backend.routing_group == group && backend.is_routable())
            .cloned()
            .collect();
        backends.sort_by_key(|backend| (backend.health().queued_queries, backend.name.clone()));

        backends
    }

    /// Adds a new backend or replaces the entry with the same name. The next routing
    /// decision sees the change, no restart needed.
    #[instrument(skip(self))]
    pub fn upsert(&self, backend_config: &BackendConfig) {
        let backend = Arc::new(Backend::from_config(backend_config));

        let mut backends = self.backends.write().expect("Backend list poisoned");
        let mut updated: Vec<_> = backends
            .iter()
            .filter(|b| b.name != backend.name)
            .cloned()
            .collect();
        updated.push(backend);
        *backends = Arc::new(updated);
    }

    #[instrument(skip(self))]
    pub fn remove(&self, name: &str) -> bool {
        let mut backends = self.backends.write().expect("Backend list poisoned");
        let updated: Vec<_> = backends.iter().filter(|b| b.name != name).cloned().collect();
        let removed = updated.len() != backends.len();
        *backends = Arc::new(updated);

        removed
    }

    pub fn set_active(&self, name: &str, active: bool) -> bool {
        match self.find(name) {
            Some(backend) => {
                backend.set_active(active);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn manager() -> BackendManager {
        let config: Config = serde_yaml::from_str(indoc! {r#"
            requestRouter:
              externalUrl: http://trino-gateway:8080
            backends:
              - name: adhoc-1
                externalUrl: http://adhoc-1:8080
              - name: adhoc-2
                externalUrl: http://adhoc-2:8080
              - name: etl-1
                externalUrl: http://etl-1:8080
                routingGroup: etl
              - name: parked
                externalUrl: http://parked:8080
                active: false
        "#})
        .expect("Failed to parse test config");

        BackendManager::new(&config)
    }

    #[test]
    fn test_group_membership() {
        let manager = manager();

        let adhoc: Vec<_> = manager
            .list_by_group("adhoc")
            .iter()
            .map(|b| b.name.clone())
            .collect();
        assert_eq!(adhoc, ["adhoc-1", "adhoc-2"]);

        let etl: Vec<_> = manager
            .list_by_group("etl")
            .iter()
            .map(|b| b.name.clone())
            .collect();
        assert_eq!(etl, ["etl-1"]);

        assert!(manager.list_by_group("does-not-exist").is_empty());
    }

    #[test]
    fn test_inactive_backends_are_not_routable() {
        let manager = manager();

        assert!(!manager.find("parked").unwrap().is_routable());
        assert!(manager.list_by_group("adhoc").iter().all(|b| b.name != "parked"));

        manager.set_active("parked", true);
        let adhoc: Vec<_> = manager
            .list_by_group("adhoc")
            .iter()
            .map(|b| b.name.clone())
            .collect();
        assert_eq!(adhoc, ["adhoc-1", "adhoc-2", "parked"]);
    }

    #[test]
    fn test_unreachable_backends_are_excluded() {
        let manager = manager();

        manager.find("adhoc-1").unwrap().update_health(HealthSnapshot {
            reachable: false,
            queued_queries: 0,
            last_probed: Some(SystemTime::now()),
        });

        let adhoc: Vec<_> = manager
            .list_by_group("adhoc")
            .iter()
            .map(|b| b.name.clone())
            .collect();
        assert_eq!(adhoc, ["adhoc-2"]);
    }

    #[test]
    fn test_ordering_by_queue_depth() {
        let manager = manager();

        manager.find("adhoc-1").unwrap().update_health(HealthSnapshot {
            reachable: true,
            queued_queries: 10,
            last_probed: Some(SystemTime::now()),
        });
        manager.find("adhoc-2").unwrap().update_health(HealthSnapshot {
            reachable: true,
            queued_queries: 2,
            last_probed: Some(SystemTime::now()),
        });

        let adhoc: Vec<_> = manager
            .list_by_group("adhoc")
            .iter()
            .map(|b| b.name.clone())
            .collect();
        assert_eq!(adhoc, ["adhoc-2", "adhoc-1"]);
    }

    #[test]
    fn test_upsert_and_remove() {
        let manager = manager();

        let new_backend: BackendConfig = serde_yaml::from_str(indoc! {r#"
            name: adhoc-3
            externalUrl: http://adhoc-3:8080
        "#})
        .unwrap();
        manager.upsert(&new_backend);
        assert!(manager.find("adhoc-3").is_some());
        assert_eq!(manager.list_by_group("adhoc").len(), 3);

        assert!(manager.remove("adhoc-3"));
        assert!(!manager.remove("adhoc-3"));
        assert!(manager.find("adhoc-3").is_none());
    }
}
