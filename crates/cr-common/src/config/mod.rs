use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::scoring::StrategyKind;

/// Tenant-scoped ranking settings. Handed to the orchestrator as an
/// immutable snapshot per request; never mutated mid-request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub tenant_id: String,
    pub strategy: StrategyKind,
    /// Minimum normalized similarity admitted by the semantic-only
    /// fallback. The full hybrid path does not threshold.
    pub relaxed_semantic_threshold: f32,
    /// k-NN pool size, intentionally larger than one page so strategy
    /// scoring can re-rank.
    pub pool_size: usize,
}

impl ScoringConfig {
    pub fn default_for(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            strategy: StrategyKind::default(),
            relaxed_semantic_threshold: 0.3,
            pool_size: 100,
        }
    }

    /// Resolve a stored strategy name, falling back to the documented
    /// default with a logged warning when the name is unknown.
    pub fn resolve_strategy(tenant_id: &str, name: &str) -> StrategyKind {
        match StrategyKind::parse(name) {
            Some(kind) => kind,
            None => {
                warn!(
                    tenant_id,
                    strategy = name,
                    fallback = StrategyKind::default().as_str(),
                    "unknown scoring strategy in tenant config; using default"
                );
                StrategyKind::default()
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config store failure: {0}")]
    Store(String),
}

/// Read side of the tenant config store. Administrative writes happen
/// elsewhere; ranking only ever reads snapshots.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self, tenant_id: &str) -> Result<Option<ScoringConfig>, ConfigError>;
}

struct CacheEntry {
    config: Arc<ScoringConfig>,
    fetched_at: Instant,
}

/// Read-mostly TTL cache over a `ConfigSource`. Readers never block on
/// a refresh: the lock is held only for map access, loads run outside
/// it, and a racing double-load just overwrites with an equal snapshot.
pub struct ConfigCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ConfigCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn fresh(&self, tenant_id: &str) -> Option<Arc<ScoringConfig>> {
        let entries = self.entries.read().expect("config cache lock poisoned");
        entries
            .get(tenant_id)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| Arc::clone(&entry.config))
    }

    fn stale(&self, tenant_id: &str) -> Option<Arc<ScoringConfig>> {
        let entries = self.entries.read().expect("config cache lock poisoned");
        entries.get(tenant_id).map(|entry| Arc::clone(&entry.config))
    }

    fn store(&self, tenant_id: &str, config: Arc<ScoringConfig>) {
        let mut entries = self.entries.write().expect("config cache lock poisoned");
        entries.insert(
            tenant_id.to_string(),
            CacheEntry {
                config,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Fetch the tenant snapshot, refreshing through `source` when the
    /// cached copy is older than the TTL. Absent rows resolve to the
    /// default config; store failures serve the stale copy when one
    /// exists, else the default, and log a warning either way.
    pub async fn get_or_load(
        &self,
        tenant_id: &str,
        source: &dyn ConfigSource,
    ) -> Arc<ScoringConfig> {
        if let Some(config) = self.fresh(tenant_id) {
            return config;
        }

        match source.load(tenant_id).await {
            Ok(Some(config)) => {
                let config = Arc::new(config);
                self.store(tenant_id, Arc::clone(&config));
                config
            }
            Ok(None) => {
                let config = Arc::new(ScoringConfig::default_for(tenant_id));
                self.store(tenant_id, Arc::clone(&config));
                config
            }
            Err(err) => {
                warn!(tenant_id, error = %err, "tenant config load failed; serving cached or default");
                self.stale(tenant_id)
                    .unwrap_or_else(|| Arc::new(ScoringConfig::default_for(tenant_id)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        loads: AtomicUsize,
        result: Option<ScoringConfig>,
        fail: bool,
    }

    impl CountingSource {
        fn some(config: ScoringConfig) -> Self {
            Self {
                loads: AtomicUsize::new(0),
                result: Some(config),
                fail: false,
            }
        }

        fn empty() -> Self {
            Self {
                loads: AtomicUsize::new(0),
                result: None,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                loads: AtomicUsize::new(0),
                result: None,
                fail: true,
            }
        }
    }

    #[async_trait]
    impl ConfigSource for CountingSource {
        async fn load(&self, _tenant_id: &str) -> Result<Option<ScoringConfig>, ConfigError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ConfigError::Store("connection refused".into()));
            }
            Ok(self.result.clone())
        }
    }

    fn tenant_config(strategy: StrategyKind) -> ScoringConfig {
        ScoringConfig {
            tenant_id: "acme".into(),
            strategy,
            relaxed_semantic_threshold: 0.25,
            pool_size: 50,
        }
    }

    #[tokio::test]
    async fn caches_within_ttl() {
        let cache = ConfigCache::new(Duration::from_secs(60));
        let source = CountingSource::some(tenant_config(StrategyKind::AllOrNothing));

        let first = cache.get_or_load("acme", &source).await;
        let second = cache.get_or_load("acme", &source).await;

        assert_eq!(first.strategy, StrategyKind::AllOrNothing);
        assert_eq!(second.pool_size, 50);
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_reload() {
        let cache = ConfigCache::new(Duration::from_millis(0));
        let source = CountingSource::some(tenant_config(StrategyKind::Tiered));

        cache.get_or_load("acme", &source).await;
        cache.get_or_load("acme", &source).await;

        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_row_resolves_to_default() {
        let cache = ConfigCache::new(Duration::from_secs(60));
        let source = CountingSource::empty();

        let config = cache.get_or_load("nobody", &source).await;

        assert_eq!(config.strategy, StrategyKind::Tiered);
        assert_eq!(config.pool_size, 100);
        assert_eq!(config.tenant_id, "nobody");
    }

    #[tokio::test]
    async fn store_failure_serves_default_without_erroring() {
        let cache = ConfigCache::new(Duration::from_secs(60));
        let source = CountingSource::failing();

        let config = cache.get_or_load("acme", &source).await;
        assert_eq!(config.strategy, StrategyKind::default());
    }

    #[test]
    fn unknown_strategy_name_resolves_to_default() {
        assert_eq!(
            ScoringConfig::resolve_strategy("acme", "galaxy_brain"),
            StrategyKind::Tiered
        );
        assert_eq!(
            ScoringConfig::resolve_strategy("acme", "all_or_nothing"),
            StrategyKind::AllOrNothing
        );
    }
}
