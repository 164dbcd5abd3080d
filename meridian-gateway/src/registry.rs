//! Provider Registry (C1).
//!
//! Holds the process-wide provider cache as a versioned, lock-free snapshot
//! (`ArcSwap<RegistrySnapshot>`): single writer, many lock-free readers.
//! The single writer is `reload`, invoked on an admin-originated invalidation
//! signal; everything else only ever reads the current `Arc`.

use crate::domain::{ProviderConfig, Visibility};
use crate::store::Store;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

struct RegistrySnapshot {
    providers: HashMap<String, ProviderConfig>,
}

pub struct ProviderRegistry {
    store: Arc<dyn Store>,
    snapshot: ArcSwap<RegistrySnapshot>,
}

/// Identity for visibility checks. A superuser bypasses restricted/private
/// filtering entirely.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: String,
    pub is_superuser: bool,
}

impl ProviderRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            snapshot: ArcSwap::from_pointee(RegistrySnapshot {
                providers: HashMap::new(),
            }),
        }
    }

    /// Reloads the in-memory cache from the store. The only writer; call on
    /// an admin invalidation event. Providers with no active key are dropped
    /// from the cache entirely rather than surfaced with an error later.
    pub async fn reload(&self) -> Result<(), crate::store::StoreError> {
        let all = self.store.list_providers().await?;
        let before = all.len();
        let mut providers = HashMap::new();
        for mut p in all {
            if !p.enabled {
                continue;
            }
            if !matches!(p.transport, crate::domain::Transport::Sdk) {
                p.sdk_vendor = None;
            }
            if p.has_active_key() {
                providers.insert(p.id.clone(), p);
            }
        }
        let dropped = before - providers.len();
        tracing::info!(
            loaded = providers.len(),
            dropped,
            "provider registry reloaded"
        );
        self.snapshot.store(Arc::new(RegistrySnapshot { providers }));
        Ok(())
    }

    pub fn get_provider(&self, id: &str) -> Option<ProviderConfig> {
        self.snapshot.load().providers.get(id).cloned()
    }

    /// Visibility rule: every public provider with no owner, every
    /// provider the user owns, and every restricted provider with an
    /// explicit allow-row for them. Superusers see everything.
    pub fn list_visible_providers(&self, user: &UserContext) -> Vec<ProviderConfig> {
        let snapshot = self.snapshot.load();
        snapshot
            .providers
            .values()
            .filter(|p| {
                if user.is_superuser {
                    return true;
                }
                match p.visibility {
                    Visibility::Public => p.owner.is_none() || p.owner.as_deref() == Some(&user.user_id),
                    Visibility::Restricted => {
                        p.owner.as_deref() == Some(&user.user_id)
                            || p.shared_users.iter().any(|u| u == &user.user_id)
                    }
                    Visibility::Private => p.owner.as_deref() == Some(&user.user_id),
                }
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{KeyStatus, ProviderApiKey, Transport};
    use crate::store::InMemoryStore;

    fn sample_provider(id: &str, visibility: Visibility, owner: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            name: id.to_string(),
            base_url: "https://api.example.com".to_string(),
            transport: Transport::Http,
            sdk_vendor: None,
            models_path: "/models".to_string(),
            messages_path: "/v1/messages".to_string(),
            chat_completions_path: "/v1/chat/completions".to_string(),
            responses_path: "/v1/responses".to_string(),
            supported_styles: vec![crate::domain::ApiStyle::Openai],
            retryable_status_codes: vec![],
            custom_headers: Default::default(),
            region: None,
            cost_per_1k_input: 0.0,
            cost_per_1k_output: 0.0,
            max_qps: None,
            keys: vec![ProviderApiKey {
                id: "k1".to_string(),
                key_ciphertext: "enc".to_string(),
                weight: 1.0,
                max_qps: None,
                label: "primary".to_string(),
                status: KeyStatus::Active,
            }],
            static_models: None,
            visibility,
            owner: owner.map(str::to_string),
            shared_users: vec![],
            enabled: true,
            billing_factor: 1.0,
        }
    }

    #[tokio::test]
    async fn drops_providers_with_no_active_keys() {
        let store = InMemoryStore::new();
        let mut dead = sample_provider("dead", Visibility::Public, None);
        dead.keys.clear();
        store.seed_provider(dead);
        store.seed_provider(sample_provider("alive", Visibility::Public, None));

        let registry = ProviderRegistry::new(store);
        registry.reload().await.unwrap();

        let user = UserContext { user_id: "u1".to_string(), is_superuser: false };
        let visible = registry.list_visible_providers(&user);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "alive");
    }

    #[tokio::test]
    async fn restricted_provider_needs_allow_row() {
        let store = InMemoryStore::new();
        let mut restricted = sample_provider("restricted", Visibility::Restricted, None);
        restricted.shared_users.push("u1".to_string());
        store.seed_provider(restricted);

        let registry = ProviderRegistry::new(store);
        registry.reload().await.unwrap();

        let allowed = UserContext { user_id: "u1".to_string(), is_superuser: false };
        let other = UserContext { user_id: "u2".to_string(), is_superuser: false };
        assert_eq!(registry.list_visible_providers(&allowed).len(), 1);
        assert_eq!(registry.list_visible_providers(&other).len(), 0);
    }
}
