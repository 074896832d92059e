//! Engine registry and authentication cache.
//!
//! The registry holds one immutable [`Engine`] per back-end, registered at
//! process start via [`RegistryBuilder`]. It also owns the process-wide
//! auth cache: `is_authenticated` probes can be slow (they shell out to
//! the engine CLI), so results are cached under a TTL and invalidated on
//! auth-mutating actions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{EngineError, Result};

use super::Engine;

/// Immutable set of registered engines plus the auth cache.
pub struct EngineRegistry {
    by_id: HashMap<String, Arc<dyn Engine>>,
    ordered: Vec<Arc<dyn Engine>>,
    auth_cache: Mutex<HashMap<String, AuthCacheEntry>>,
    auth_cache_ttl: Duration,
    skip_auth: bool,
}

#[derive(Debug, Clone, Copy)]
struct AuthCacheEntry {
    is_authenticated: bool,
    timestamp: Instant,
}

impl EngineRegistry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// The engine with `id`.
    pub fn get(&self, id: &str) -> Result<Arc<dyn Engine>> {
        self.by_id
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()).into())
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Every engine, ordered by [`Engine::order`].
    #[must_use]
    pub fn all(&self) -> &[Arc<dyn Engine>] {
        &self.ordered
    }

    /// Registered ids, in display order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.ordered.iter().map(|e| e.id().to_string()).collect()
    }

    /// Whether `id` currently has working credentials, through the cache.
    ///
    /// A cache entry within TTL answers directly; otherwise the engine is
    /// probed and the fresh answer cached. With skip-auth configured every
    /// engine reads as authenticated.
    pub async fn is_authenticated(&self, id: &str) -> Result<bool> {
        if self.skip_auth {
            return Ok(true);
        }
        let engine = self.get(id)?;

        if let Some(entry) = self.cached_entry(id) {
            if entry.timestamp.elapsed() < self.auth_cache_ttl {
                return Ok(entry.is_authenticated);
            }
        }

        let fresh = engine.is_authenticated().await?;
        debug!(engine = id, authenticated = fresh, "auth probe");
        self.store_entry(id, fresh);
        Ok(fresh)
    }

    /// Interactively authenticates `id`, then invalidates its cache entry.
    pub async fn ensure_auth(&self, id: &str) -> Result<()> {
        let engine = self.get(id)?;
        engine.ensure_auth().await?;
        self.invalidate_auth(id);
        Ok(())
    }

    /// Clears credentials for `id`, then invalidates its cache entry.
    pub async fn clear_auth(&self, id: &str) -> Result<()> {
        let engine = self.get(id)?;
        engine.clear_auth().await?;
        self.invalidate_auth(id);
        Ok(())
    }

    /// Drops the cache entry for `id`.
    pub fn invalidate_auth(&self, id: &str) {
        let mut cache = self
            .auth_cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.remove(id);
    }

    /// Drops every cache entry.
    pub fn clear_auth_cache(&self) {
        let mut cache = self
            .auth_cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.clear();
    }

    fn cached_entry(&self, id: &str) -> Option<AuthCacheEntry> {
        let cache = self
            .auth_cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.get(id).copied()
    }

    fn store_entry(&self, id: &str, is_authenticated: bool) {
        let mut cache = self
            .auth_cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.insert(
            id.to_string(),
            AuthCacheEntry {
                is_authenticated,
                timestamp: Instant::now(),
            },
        );
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.ids())
            .field("skip_auth", &self.skip_auth)
            .finish()
    }
}

/// Builder for [`EngineRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
    engines: Vec<Arc<dyn Engine>>,
    auth_cache_ttl: Option<Duration>,
    skip_auth: bool,
}

impl RegistryBuilder {
    /// Adds an engine. Later registrations with a duplicate id are ignored.
    #[must_use]
    pub fn register(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engines.push(engine);
        self
    }

    /// Sets the auth-cache TTL (default five minutes).
    #[must_use]
    pub const fn auth_cache_ttl(mut self, ttl: Duration) -> Self {
        self.auth_cache_ttl = Some(ttl);
        self
    }

    /// Short-circuits every auth check to "authenticated" (testing).
    #[must_use]
    pub const fn skip_auth(mut self, skip: bool) -> Self {
        self.skip_auth = skip;
        self
    }

    /// Finalises the registry.
    #[must_use]
    pub fn build(self) -> EngineRegistry {
        let mut by_id: HashMap<String, Arc<dyn Engine>> = HashMap::new();
        let mut ordered = Vec::new();
        for engine in self.engines {
            if by_id.contains_key(engine.id()) {
                continue;
            }
            by_id.insert(engine.id().to_string(), Arc::clone(&engine));
            ordered.push(engine);
        }
        ordered.sort_by_key(|e| e.order());

        EngineRegistry {
            by_id,
            ordered,
            auth_cache: Mutex::new(HashMap::new()),
            auth_cache_ttl: self.auth_cache_ttl.unwrap_or(Duration::from_secs(300)),
            skip_auth: self.skip_auth,
        }
    }
}

impl std::fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("engines", &self.engines.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;

    fn registry_with(engines: Vec<Arc<dyn Engine>>) -> EngineRegistry {
        let mut builder = EngineRegistry::builder();
        for e in engines {
            builder = builder.register(e);
        }
        builder.build()
    }

    #[test]
    fn engines_are_ordered_by_priority() {
        let registry = registry_with(vec![
            Arc::new(MockEngine::responding("late", "x").with_order(20)),
            Arc::new(MockEngine::responding("early", "x").with_order(1)),
            Arc::new(MockEngine::responding("mid", "x").with_order(10)),
        ]);
        assert_eq!(registry.ids(), vec!["early", "mid", "late"]);
    }

    #[test]
    fn duplicate_ids_keep_first_registration() {
        let registry = registry_with(vec![
            Arc::new(MockEngine::responding("m", "first")),
            Arc::new(MockEngine::responding("m", "second")),
        ]);
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn unknown_engine_is_an_error() {
        let registry = registry_with(vec![]);
        let err = match registry.get("ghost") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.code(), "engine.not_found");
    }

    #[tokio::test]
    async fn auth_probe_is_cached_within_ttl() {
        let mock = Arc::new(MockEngine::responding("m", "ok"));
        let registry = registry_with(vec![Arc::clone(&mock) as Arc<dyn Engine>]);

        assert!(registry.is_authenticated("m").await.unwrap());
        assert!(registry.is_authenticated("m").await.unwrap());
        assert_eq!(mock.auth_probes(), 1);
    }

    #[tokio::test]
    async fn zero_ttl_probes_every_time() {
        let mock = Arc::new(MockEngine::responding("m", "ok"));
        let registry = EngineRegistry::builder()
            .register(Arc::clone(&mock) as Arc<dyn Engine>)
            .auth_cache_ttl(Duration::ZERO)
            .build();

        assert!(registry.is_authenticated("m").await.unwrap());
        assert!(registry.is_authenticated("m").await.unwrap());
        assert_eq!(mock.auth_probes(), 2);
    }

    #[tokio::test]
    async fn invalidation_forces_a_fresh_probe() {
        let mock = Arc::new(MockEngine::responding("m", "ok"));
        let registry = registry_with(vec![Arc::clone(&mock) as Arc<dyn Engine>]);

        let _ = registry.is_authenticated("m").await.unwrap();
        registry.invalidate_auth("m");
        let _ = registry.is_authenticated("m").await.unwrap();
        assert_eq!(mock.auth_probes(), 2);
    }

    #[tokio::test]
    async fn skip_auth_never_probes() {
        let mock = Arc::new(MockEngine::responding("m", "ok").with_authenticated(false));
        let registry = EngineRegistry::builder()
            .register(Arc::clone(&mock) as Arc<dyn Engine>)
            .skip_auth(true)
            .build();

        assert!(registry.is_authenticated("m").await.unwrap());
        assert_eq!(mock.auth_probes(), 0);
    }
}
