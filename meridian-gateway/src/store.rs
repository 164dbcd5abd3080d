//! System-of-record abstraction. The RDBMS is an external collaborator; this
//! module is the trait boundary the core talks to, with a `dashmap`-backed
//! in-memory implementation standing in for it instead of hard-wiring a
//! client everywhere. A real deployment swaps this for a `sqlx`/Postgres
//! implementation of the same trait without touching C1-C11.

use crate::domain::*;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_providers(&self) -> Result<Vec<ProviderConfig>, StoreError>;
    async fn get_provider(&self, id: &str) -> Result<Option<ProviderConfig>, StoreError>;
    async fn upsert_provider(&self, provider: ProviderConfig) -> Result<(), StoreError>;

    async fn list_provider_models(&self, provider_id: &str) -> Result<Vec<ProviderModel>, StoreError>;
    async fn find_provider_models_by_model_id(
        &self,
        model_id: &str,
    ) -> Result<Vec<ProviderModel>, StoreError>;

    async fn get_caller_key(&self, key_hash: &str) -> Result<Option<CallerApiKey>, StoreError>;

    async fn get_health_snapshot(&self, provider_id: &str) -> Result<Option<HealthStatus>, StoreError>;
    async fn put_health_snapshot(&self, status: HealthStatus) -> Result<(), StoreError>;

    async fn get_model_billing_config(
        &self,
        model_name: &str,
    ) -> Result<Option<ModelBillingConfig>, StoreError>;

    async fn get_credit_account(&self, user_id: &str) -> Result<Option<CreditAccount>, StoreError>;
    /// Insert-or-noop on `idempotency_key`, per invariant 8. Returns `true`
    /// if a new row was inserted (and the balance mutated), `false` if the
    /// key was already present (a no-op replay).
    async fn settle_credit(
        &self,
        txn: CreditTransaction,
    ) -> Result<bool, StoreError>;

    /// Append-only upsert of a routing metrics window: counters are added,
    /// not replaced (invariant 9).
    async fn upsert_routing_metrics(&self, window: RoutingMetricsWindow) -> Result<(), StoreError>;
    async fn get_routing_metrics(
        &self,
        logical_model: &str,
        provider_id: &str,
    ) -> Result<Vec<RoutingMetricsWindow>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryStore {
    providers: DashMap<String, ProviderConfig>,
    provider_models: DashMap<String, Vec<ProviderModel>>,
    caller_keys: DashMap<String, CallerApiKey>,
    health: DashMap<String, HealthStatus>,
    billing_configs: DashMap<String, ModelBillingConfig>,
    credit_accounts: DashMap<String, CreditAccount>,
    credit_ledger: DashMap<String, CreditTransaction>,
    routing_metrics: DashMap<(String, String), Vec<RoutingMetricsWindow>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed_provider(&self, provider: ProviderConfig) {
        self.providers.insert(provider.id.clone(), provider);
    }

    pub fn seed_provider_model(&self, model: ProviderModel) {
        self.provider_models
            .entry(model.provider_id.clone())
            .or_default()
            .push(model);
    }

    pub fn seed_caller_key(&self, key: CallerApiKey) {
        self.caller_keys.insert(key.key_hash.clone(), key);
    }

    pub fn seed_credit_account(&self, account: CreditAccount) {
        self.credit_accounts.insert(account.user_id.clone(), account);
    }

    pub fn seed_billing_config(&self, cfg: ModelBillingConfig) {
        self.billing_configs.insert(cfg.model_name.clone(), cfg);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn list_providers(&self) -> Result<Vec<ProviderConfig>, StoreError> {
        Ok(self.providers.iter().map(|e| e.value().clone()).collect())
    }

    async fn get_provider(&self, id: &str) -> Result<Option<ProviderConfig>, StoreError> {
        Ok(self.providers.get(id).map(|e| e.value().clone()))
    }

    async fn upsert_provider(&self, provider: ProviderConfig) -> Result<(), StoreError> {
        self.providers.insert(provider.id.clone(), provider);
        Ok(())
    }

    async fn list_provider_models(&self, provider_id: &str) -> Result<Vec<ProviderModel>, StoreError> {
        Ok(self.provider_models.get(provider_id).map(|e| e.value().clone()).unwrap_or_default())
    }

    async fn find_provider_models_by_model_id(
        &self,
        model_id: &str,
    ) -> Result<Vec<ProviderModel>, StoreError> {
        let mut out = Vec::new();
        for entry in self.provider_models.iter() {
            for m in entry.value() {
                if m.model_id == model_id || m.alias.as_deref() == Some(model_id) {
                    out.push(m.clone());
                }
            }
        }
        Ok(out)
    }

    async fn get_caller_key(&self, key_hash: &str) -> Result<Option<CallerApiKey>, StoreError> {
        Ok(self.caller_keys.get(key_hash).map(|e| e.value().clone()))
    }

    async fn get_health_snapshot(&self, provider_id: &str) -> Result<Option<HealthStatus>, StoreError> {
        Ok(self.health.get(provider_id).map(|e| e.value().clone()))
    }

    async fn put_health_snapshot(&self, status: HealthStatus) -> Result<(), StoreError> {
        self.health.insert(status.provider_id.clone(), status);
        Ok(())
    }

    async fn get_model_billing_config(
        &self,
        model_name: &str,
    ) -> Result<Option<ModelBillingConfig>, StoreError> {
        Ok(self.billing_configs.get(model_name).map(|e| e.value().clone()))
    }

    async fn get_credit_account(&self, user_id: &str) -> Result<Option<CreditAccount>, StoreError> {
        Ok(self.credit_accounts.get(user_id).map(|e| e.value().clone()))
    }

    async fn settle_credit(&self, txn: CreditTransaction) -> Result<bool, StoreError> {
        if self.credit_ledger.contains_key(&txn.idempotency_key) {
            return Ok(false);
        }
        // Single-writer-per-key semantics: `entry` is the dashmap analogue
        // of a uniqueness-constraint insert-or-noop.
        let inserted = match self.credit_ledger.entry(txn.idempotency_key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(txn.clone());
                true
            }
        };
        if inserted {
            let mut account = self
                .credit_accounts
                .entry(txn.user_id.clone())
                .or_insert_with(|| CreditAccount {
                    user_id: txn.user_id.clone(),
                    balance_cents: 0,
                    daily_limit_cents: None,
                    status: CreditAccountStatus::Active,
                });
            account.balance_cents -= txn.amount_cents;
        }
        Ok(inserted)
    }

    async fn upsert_routing_metrics(&self, window: RoutingMetricsWindow) -> Result<(), StoreError> {
        let key = (window.logical_model.clone(), window.provider_id.clone());
        let mut entry = self.routing_metrics.entry(key).or_default();
        if let Some(existing) = entry
            .iter_mut()
            .find(|w| w.window_start == window.window_start && w.transport == window.transport && w.is_stream == window.is_stream)
        {
            existing.counters.success += window.counters.success;
            existing.counters.error += window.counters.error;
            existing.counters.status_4xx += window.counters.status_4xx;
            existing.counters.status_5xx += window.counters.status_5xx;
            existing.counters.status_429 += window.counters.status_429;
            existing.counters.timeout += window.counters.timeout;
            existing.input_tokens += window.input_tokens;
            existing.output_tokens += window.output_tokens;
            existing.latency_p50_ms = window.latency_p50_ms;
            existing.latency_p95_ms = window.latency_p95_ms;
            existing.latency_p99_ms = window.latency_p99_ms;
            existing.status = window.status;
        } else {
            entry.push(window);
        }
        Ok(())
    }

    async fn get_routing_metrics(
        &self,
        logical_model: &str,
        provider_id: &str,
    ) -> Result<Vec<RoutingMetricsWindow>, StoreError> {
        Ok(self
            .routing_metrics
            .get(&(logical_model.to_string(), provider_id.to_string()))
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }
}
