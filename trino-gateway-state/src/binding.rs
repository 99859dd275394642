use std::{
    collections::{HashMap, hash_map::RandomState},
    hash::BuildHasher,
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::{instrument, warn};
use trino_gateway_core::{TrinoBackendName, TrinoQueryId};

/// The query-id → backend map that pins every follow-up request of a query to the backend
/// that accepted it.
///
/// Sharded so that the hot `bind`/`resolve` path only ever contends on a single shard, and
/// the sweeper never holds more than one shard lock at a time. No lock is held across await
/// points, all operations are synchronous and short.
pub struct BindingRegistry {
    shards: Vec<Mutex<HashMap<TrinoQueryId, Binding>>>,
    hasher: RandomState,
    ttl: Duration,
}

#[derive(Debug)]
struct Binding {
    backend: TrinoBackendName,
    last_accessed: Instant,
    /// Set once a terminal response was observed. The binding survives until this deadline
    /// so clients can still fetch the final result page.
    evict_after: Option<Instant>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BindOutcome {
    Created,
    /// The same mapping already existed, e.g. because the client retried.
    AlreadyBound,
    /// A different backend was already bound. The existing binding wins.
    Conflict { existing: TrinoBackendName },
}

impl BindingRegistry {
    pub fn new(ttl: Duration) -> Self {
        // Power of two keeps the modulo cheap; 4x the core count keeps contention low even
        // with many concurrent exchanges.
        let shard_count = (num_cpus::get() * 4).next_power_of_two();

        Self {
            shards: (0..shard_count)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            hasher: RandomState::new(),
            ttl,
        }
    }

    fn shard(&self, query_id: &str) -> &Mutex<HashMap<TrinoQueryId, Binding>> {
        let index = self.hasher.hash_one(query_id) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Insert-if-absent. A conflicting bind (same query id, different backend) keeps the
    /// existing binding, that situation implies a bug elsewhere and is logged.
    #[instrument(skip(self))]
    pub fn bind(&self, query_id: &str, backend: &str) -> BindOutcome {
        let mut shard = self.shard(query_id).lock().expect("Binding shard poisoned");

        match shard.get(query_id) {
            Some(existing) if existing.backend == backend => BindOutcome::AlreadyBound,
            Some(existing) => {
                warn!(
                    query_id,
                    backend,
                    existing_backend = existing.backend,
                    "Refusing to re-bind query to a different backend, keeping the existing binding"
                );
                BindOutcome::Conflict {
                    existing: existing.backend.clone(),
                }
            }
            None => {
                shard.insert(
                    query_id.to_string(),
                    Binding {
                        backend: backend.to_string(),
                        last_accessed: Instant::now(),
                        evict_after: None,
                    },
                );
                BindOutcome::Created
            }
        }
    }

    /// Looks up the backend for a query id and refreshes the idle timer.
    #[instrument(skip(self))]
    pub fn resolve(&self, query_id: &str) -> Option<TrinoBackendName> {
        let mut shard = self.shard(query_id).lock().expect("Binding shard poisoned");

        shard.get_mut(query_id).map(|binding| {
            binding.last_accessed = Instant::now();
            binding.backend.clone()
        })
    }

    #[instrument(skip(self))]
    pub fn evict(&self, query_id: &str) -> bool {
        let mut shard = self.shard(query_id).lock().expect("Binding shard poisoned");
        shard.remove(query_id).is_some()
    }

    /// Marks a binding for eviction once the grace period passed. Used when a terminal
    /// response was observed: the query will not be polled much longer.
    #[instrument(skip(self))]
    pub fn schedule_eviction(&self, query_id: &str, grace: Duration) -> bool {
        let mut shard = self.shard(query_id).lock().expect("Binding shard poisoned");

        match shard.get_mut(query_id) {
            Some(binding) => {
                binding.evict_after = Some(Instant::now() + grace);
                true
            }
            None => false,
        }
    }

    /// Removes all bindings that are idle beyond the TTL or whose terminal grace deadline
    /// passed. Returns the number of removed bindings. Locks one shard at a time.
    pub fn sweep(&self) -> u64 {
        let now = Instant::now();
        let mut removed = 0;

        for shard in &self.shards {
            let mut shard = shard.lock().expect("Binding shard poisoned");
            shard.retain(|_, binding| {
                let expired = binding.evict_after.is_some_and(|deadline| deadline <= now)
                    || now.duration_since(binding.last_accessed) >= self.ttl;
                if expired {
                    removed += 1;
                }
                !expired
            });
        }

        removed
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().expect("Binding shard poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUERY_ID: &str = "20240101_000000_00001_abcde";

    fn registry() -> BindingRegistry {
        BindingRegistry::new(Duration::from_secs(3600))
    }

    #[test]
    fn test_bind_and_resolve() {
        let registry = registry();

        assert_eq!(registry.bind(QUERY_ID, "trino-1"), BindOutcome::Created);
        assert_eq!(registry.resolve(QUERY_ID).as_deref(), Some("trino-1"));
        assert_eq!(registry.resolve("20240101_000000_00002_zzzzz"), None);
    }

    #[test]
    fn test_rebinding_to_a_different_backend_keeps_the_existing_binding() {
        let registry = registry();

        registry.bind(QUERY_ID, "trino-1");
        assert_eq!(registry.bind(QUERY_ID, "trino-1"), BindOutcome::AlreadyBound);
        assert_eq!(
            registry.bind(QUERY_ID, "trino-2"),
            BindOutcome::Conflict {
                existing: "trino-1".to_string()
            }
        );
        assert_eq!(registry.resolve(QUERY_ID).as_deref(), Some("trino-1"));
    }

    #[test]
    fn test_sweep_removes_idle_bindings() {
        let registry = BindingRegistry::new(Duration::ZERO);

        registry.bind(QUERY_ID, "trino-1");
        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.resolve(QUERY_ID), None);
    }

    #[test]
    fn test_sweep_keeps_fresh_bindings() {
        let registry = registry();

        registry.bind(QUERY_ID, "trino-1");
        assert_eq!(registry.sweep(), 0);
        assert_eq!(registry.resolve(QUERY_ID).as_deref(), Some("trino-1"));
    }

    #[test]
    fn test_scheduled_eviction_takes_effect_after_the_grace_period() {
        let registry = registry();

        registry.bind(QUERY_ID, "trino-1");
        assert!(registry.schedule_eviction(QUERY_ID, Duration::ZERO));

        // Grace of zero: the deadline has already passed
        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.resolve(QUERY_ID), None);
    }

    #[test]
    fn test_scheduled_eviction_in_the_future_keeps_the_binding() {
        let registry = registry();

        registry.bind(QUERY_ID, "trino-1");
        registry.schedule_eviction(QUERY_ID, Duration::from_secs(3600));

        assert_eq!(registry.sweep(), 0);
        assert_eq!(registry.resolve(QUERY_ID).as_deref(), Some("trino-1"));
    }

    #[test]
    fn test_len_counts_across_shards() {
        let registry = registry();

        for i in 0..100 {
            registry.bind(&format!("20240101_000000_{i:05}_abcde"), "trino-1");
        }

        assert_eq!(registry.len(), 100);
    }

    #[test]
    fn test_eviction_of_unknown_query_is_a_no_op() {
        let registry = registry();

        assert!(!registry.evict(QUERY_ID));
        assert!(!registry.schedule_eviction(QUERY_ID, Duration::ZERO));
    }
}
