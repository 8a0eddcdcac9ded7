//! Backend Health Registry
//!
//! Orders public backends by recent success and keeps overloaded origins out
//! of rotation for a while.
//!
//! ## State
//!
//! - **Preference lists** (one per [`ResourceKind`]): origins, most recent
//!   winner first, capped length, persisted in the `health` namespace.
//! - **Cooldowns**: origin -> expiry, process-lifetime only. An origin in
//!   cooldown is removed from ranking entirely.
//!
//! ```text
//! configured set (settings override | config defaults)
//!        ↓ sort by preference position, unranked appended in configured order
//!        ↓ drop origins in cooldown
//! ranked candidates
//! ```

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{origin_of, Backend, GatewaySettings, ResourceKind};
use crate::config::{GatewayConfig, HealthConfig};
use crate::store::{KvStore, KvStoreExt};

const HEALTH_NAMESPACE: &str = "health";

/// Diagnostic view of the registry
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub content_preference: Vec<String>,
    pub name_preference: Vec<String>,
    pub cooling_down: Vec<String>,
}

/// Ranks public backends per resource kind
pub struct HealthRegistry {
    store: Arc<dyn KvStore>,
    gateways: GatewayConfig,
    config: HealthConfig,
    /// origin -> cooldown expiry
    cooldowns: DashMap<String, Instant>,
}

impl HealthRegistry {
    pub fn new(store: Arc<dyn KvStore>, gateways: GatewayConfig, config: HealthConfig) -> Self {
        Self {
            store,
            gateways,
            config,
            cooldowns: DashMap::new(),
        }
    }

    /// Candidate public backends for `kind`, best first, cooled-down origins excluded
    pub fn ranked_backends(&self, kind: ResourceKind) -> Vec<Backend> {
        let mut backends = self.configured_backends(kind);
        let preference = self.preference(kind);

        // Stable: unranked backends keep their configured order at the end
        backends.sort_by_key(|b| {
            preference
                .iter()
                .position(|origin| origin == &b.origin)
                .unwrap_or(usize::MAX)
        });

        backends.retain(|b| !self.is_cooling_down(&b.origin));
        backends
    }

    /// Configured set: user settings override, else built-in defaults
    fn configured_backends(&self, kind: ResourceKind) -> Vec<Backend> {
        let settings = match GatewaySettings::load(self.store.as_ref()) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Failed to read gateway settings, using defaults");
                GatewaySettings::default()
            }
        };

        let defaults = match kind {
            ResourceKind::Content => &self.gateways.content,
            ResourceKind::Name => &self.gateways.name,
        };
        let templates = settings.templates(kind).unwrap_or(defaults.as_slice());

        let mut backends: Vec<Backend> = Vec::with_capacity(templates.len());
        for template in templates {
            match Backend::public(template) {
                Some(backend) if !backends.iter().any(|b| b.url_template == *template) => {
                    backends.push(backend)
                }
                Some(_) => {}
                None => debug!(template = %template, "Skipping malformed gateway template"),
            }
        }
        backends
    }

    /// Move `origin` to the front of the preference list
    pub fn promote(&self, origin: &str, kind: ResourceKind) {
        let mut list = self.preference(kind);
        if list.first().map(String::as_str) == Some(origin) {
            return;
        }
        list.retain(|o| o != origin);
        list.insert(0, origin.to_string());
        list.truncate(self.config.max_preferred);
        debug!(origin = %origin, kind = %kind, "Promoted backend");
        self.save_preference(kind, &list);
    }

    /// Move `origin` to the back of the preference list
    pub fn demote(&self, origin: &str, kind: ResourceKind) {
        let mut list = self.preference(kind);
        if list.last().map(String::as_str) == Some(origin) {
            return;
        }
        list.retain(|o| o != origin);
        list.push(origin.to_string());
        list.truncate(self.config.max_preferred);
        debug!(origin = %origin, kind = %kind, "Demoted backend");
        self.save_preference(kind, &list);
    }

    /// Put the origin of `url` into cooldown and demote it.
    ///
    /// A running cooldown is never extended. Malformed URLs are ignored.
    pub fn report_failure(&self, url: &str) {
        let Some(origin) = origin_of(url) else {
            debug!(url = %url, "Ignoring failure report for malformed URL");
            return;
        };
        if self.is_cooling_down(&origin) {
            return;
        }

        let expires = Instant::now() + self.config.cooldown();
        self.cooldowns.insert(origin.clone(), expires);
        info!(
            origin = %origin,
            cooldown_ms = self.config.cooldown_ms,
            "Backend cooling down"
        );

        for kind in [ResourceKind::Content, ResourceKind::Name] {
            if self.preference(kind).iter().any(|o| o == &origin) {
                self.demote(&origin, kind);
            }
        }
    }

    /// Whether `origin` is currently excluded
    pub fn is_cooling_down(&self, origin: &str) -> bool {
        let expired = match self.cooldowns.get(origin) {
            Some(expires) => Instant::now() >= *expires,
            None => return false,
        };
        if expired {
            self.cooldowns.remove(origin);
        }
        !expired
    }

    /// Forget the persisted preference list for `kind`
    pub fn reset(&self, kind: ResourceKind) {
        if let Err(e) = self.store.delete(HEALTH_NAMESPACE, kind.as_str()) {
            warn!(kind = %kind, error = %e, "Failed to reset preference list");
        }
        info!(kind = %kind, "Preference list reset");
    }

    /// Current persisted preference list
    pub fn preference(&self, kind: ResourceKind) -> Vec<String> {
        match self.store.get_json(HEALTH_NAMESPACE, kind.as_str()) {
            Ok(list) => list.unwrap_or_default(),
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to read preference list");
                Vec::new()
            }
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let now = Instant::now();
        let mut cooling_down: Vec<String> = self
            .cooldowns
            .iter()
            .filter(|e| *e.value() > now)
            .map(|e| e.key().clone())
            .collect();
        cooling_down.sort();

        HealthSnapshot {
            content_preference: self.preference(ResourceKind::Content),
            name_preference: self.preference(ResourceKind::Name),
            cooling_down,
        }
    }

    fn save_preference(&self, kind: ResourceKind, list: &[String]) {
        if let Err(e) = self.store.set_json(HEALTH_NAMESPACE, kind.as_str(), &list) {
            warn!(kind = %kind, error = %e, "Failed to persist preference list");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CUSTOM_GATEWAYS_KEY, SETTINGS_NAMESPACE};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn gateways() -> GatewayConfig {
        GatewayConfig {
            content: vec![
                "https://a.example/ipfs/".into(),
                "https://b.example/ipfs/".into(),
                "https://c.example/ipfs/".into(),
            ],
            name: vec!["https://a.example/ipns/".into()],
        }
    }

    fn registry(store: Arc<dyn KvStore>) -> HealthRegistry {
        HealthRegistry::new(store, gateways(), HealthConfig::default())
    }

    fn origins(backends: &[Backend]) -> Vec<&str> {
        backends.iter().map(|b| b.origin.as_str()).collect()
    }

    #[tokio::test]
    async fn test_unranked_keep_configured_order() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let ranked = registry.ranked_backends(ResourceKind::Content);
        assert_eq!(
            origins(&ranked),
            vec!["https://a.example", "https://b.example", "https://c.example"]
        );
    }

    #[tokio::test]
    async fn test_promote_and_demote() {
        let registry = registry(Arc::new(MemoryStore::new()));
        registry.promote("https://c.example", ResourceKind::Content);
        registry.promote("https://b.example", ResourceKind::Content);
        assert_eq!(
            origins(&registry.ranked_backends(ResourceKind::Content)),
            vec!["https://b.example", "https://c.example", "https://a.example"]
        );

        registry.demote("https://b.example", ResourceKind::Content);
        assert_eq!(
            registry.preference(ResourceKind::Content),
            vec!["https://c.example".to_string(), "https://b.example".to_string()]
        );
        // Name list is independent
        assert!(registry.preference(ResourceKind::Name).is_empty());
    }

    #[tokio::test]
    async fn test_preference_list_is_capped() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let registry = HealthRegistry::new(
            store,
            gateways(),
            HealthConfig {
                max_preferred: 2,
                ..Default::default()
            },
        );
        registry.promote("https://a.example", ResourceKind::Content);
        registry.promote("https://b.example", ResourceKind::Content);
        registry.promote("https://c.example", ResourceKind::Content);
        assert_eq!(
            registry.preference(ResourceKind::Content),
            vec!["https://c.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_excludes_then_expires() {
        let registry = registry(Arc::new(MemoryStore::new()));
        registry.promote("https://b.example", ResourceKind::Content);
        registry.report_failure("https://b.example/ipfs/bafyabc");

        let ranked = registry.ranked_backends(ResourceKind::Content);
        assert_eq!(origins(&ranked), vec!["https://a.example", "https://c.example"]);
        assert_eq!(registry.snapshot().cooling_down, vec!["https://b.example"]);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!registry.is_cooling_down("https://b.example"));
        assert_eq!(registry.ranked_backends(ResourceKind::Content).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_failure_does_not_extend_cooldown() {
        let registry = registry(Arc::new(MemoryStore::new()));
        registry.report_failure("https://a.example/ipfs/x");
        tokio::time::advance(Duration::from_secs(40)).await;
        registry.report_failure("https://a.example/ipfs/y");
        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(!registry.is_cooling_down("https://a.example"));
    }

    #[tokio::test]
    async fn test_malformed_url_ignored() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        registry.report_failure("not a url at all");
        assert!(registry.snapshot().cooling_down.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_preference_survives_restart() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        registry(store.clone()).promote("https://c.example", ResourceKind::Content);

        let reloaded = registry(store);
        assert_eq!(
            reloaded.ranked_backends(ResourceKind::Content)[0].origin,
            "https://c.example"
        );

        reloaded.reset(ResourceKind::Content);
        assert!(reloaded.preference(ResourceKind::Content).is_empty());
    }

    #[tokio::test]
    async fn test_settings_override_defaults() {
        let store = Arc::new(MemoryStore::new());
        store
            .set_json(
                SETTINGS_NAMESPACE,
                CUSTOM_GATEWAYS_KEY,
                &vec!["https://custom.example/ipfs/"],
            )
            .unwrap();
        let registry = registry(store);
        assert_eq!(
            origins(&registry.ranked_backends(ResourceKind::Content)),
            vec!["https://custom.example"]
        );
    }
}
