//! Health Monitor (C4). Periodically probes each provider's
//! `models_path` and publishes the result to KV (with TTL) and the DB,
//! driven off the provider registry's current snapshot.

use crate::domain::{HealthState, HealthStatus};
use crate::kv::{keys, KvStore, KvStoreExt};
use crate::registry::ProviderRegistry;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;

pub struct HealthMonitorConfig {
    pub health_interval: Duration,
    pub health_ttl: Duration,
    pub probe_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            health_ttl: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

pub struct HealthMonitor {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn Store>,
    kv: Arc<dyn KvStore>,
    http: reqwest::Client,
    config: HealthMonitorConfig,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn Store>,
        kv: Arc<dyn KvStore>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            registry,
            store,
            kv,
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Reads the current status for a provider, KV first then DB, falling
    /// back to `Unknown` (passthrough) if neither exists.
    pub async fn read_status(&self, provider_id: &str) -> HealthState {
        if let Ok(Some(status)) = self.kv.get::<HealthStatus>(&keys::provider_health(provider_id)).await {
            return status.status;
        }
        if let Ok(Some(status)) = self.store.get_health_snapshot(provider_id).await {
            return status.status;
        }
        HealthState::Unknown
    }

    /// One probe pass over every registered provider. Intended to be driven
    /// by a `tokio::time::interval` loop in `main.rs` at `health_interval`.
    pub async fn probe_all(&self) {
        let providers: Vec<_> = {
            let user = crate::registry::UserContext {
                user_id: String::new(),
                is_superuser: true,
            };
            self.registry.list_visible_providers(&user)
        };
        for provider in providers {
            let status = self.probe_one(&provider.id, &format!("{}{}", provider.base_url, provider.models_path)).await;
            let _ = self
                .kv
                .set(&keys::provider_health(&provider.id), &status, Some(self.config.health_ttl))
                .await;
            let _ = self.store.put_health_snapshot(status).await;
        }
    }

    async fn probe_one(&self, provider_id: &str, url: &str) -> HealthStatus {
        let start = std::time::Instant::now();
        let now = chrono::Utc::now();
        match self
            .http
            .get(url)
            .timeout(self.config.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => {
                let elapsed = start.elapsed().as_millis() as u64;
                let status_code = resp.status().as_u16();
                if resp.status().is_success() {
                    HealthStatus {
                        provider_id: provider_id.to_string(),
                        status: HealthState::Healthy,
                        ts: now,
                        response_ms: Some(elapsed),
                        error: None,
                        last_success_ts: Some(now),
                    }
                } else if (400..500).contains(&status_code) {
                    HealthStatus {
                        provider_id: provider_id.to_string(),
                        status: HealthState::Degraded,
                        ts: now,
                        response_ms: Some(elapsed),
                        error: Some(format!("HTTP {status_code}")),
                        last_success_ts: None,
                    }
                } else {
                    HealthStatus {
                        provider_id: provider_id.to_string(),
                        status: HealthState::Down,
                        ts: now,
                        response_ms: Some(elapsed),
                        error: Some(format!("HTTP {status_code}")),
                        last_success_ts: None,
                    }
                }
            }
            Err(e) => HealthStatus {
                provider_id: provider_id.to_string(),
                status: HealthState::Down,
                ts: now,
                response_ms: None,
                error: Some(e.to_string()),
                last_success_ts: None,
            },
        }
    }
}
