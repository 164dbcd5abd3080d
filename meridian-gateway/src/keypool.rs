//! Key Pool & Cooldown (C3).
//!
//! Weighted key selection with a sliding-second QPS window and failure
//! cooldowns, backed by the KV surface (`keypool:<provider>:<keyhash>:*`).
//! Per-key state lives in KV rather than an in-process struct so cooldowns
//! and QPS windows stay consistent across multiple gateway processes.

use crate::domain::ProviderConfig;
use crate::kv::{keys, KvStore};
use rand::distributions::{Distribution, WeightedIndex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct KeyPoolConfig {
    pub failure_threshold: u32,
    pub cooldown_window: Duration,
    pub failure_cooldown: Duration,
}

impl Default for KeyPoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_window: Duration::from_secs(60),
            failure_cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeySelection {
    pub provider_id: String,
    pub key_id: String,
    pub key_hash: String,
    pub plaintext: String,
}

/// Why `KeyPool::acquire` could not hand back a key. `try_one`/`execute`
/// (`proxy.rs`) distinguish the two: `NoActiveKeys` is a structural
/// condition (the provider simply has nothing configured) and keeps the
/// existing all-candidates-down (503) behavior, while `RateLimited` is
/// transient — a key/provider cooldown or a QPS skip — and surfaces as
/// `GatewayError::AllProvidersRateLimited` (429, with `Retry-After`) when
/// every attempted candidate failed for that reason.
#[derive(Debug, Clone, Copy)]
pub enum KeyPoolError {
    NoActiveKeys,
    RateLimited { retry_after_secs: u64 },
}

pub struct KeyPool {
    kv: Arc<dyn KvStore>,
    config: KeyPoolConfig,
}

fn key_hash(provider_id: &str, key_id: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    (provider_id, key_id).hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

impl KeyPool {
    pub fn new(kv: Arc<dyn KvStore>, config: KeyPoolConfig) -> Self {
        Self { kv, config }
    }

    /// `KeyPoolError` bubbles up to the scheduler/proxy loop, which moves
    /// to the next candidate (invariant 3), surfacing `RateLimited` as a
    /// 429 instead of folding every miss into a 503 once failover is
    /// exhausted.
    pub async fn acquire(&self, provider: &ProviderConfig) -> Result<KeySelection, KeyPoolError> {
        if let Some(retry_after_secs) = self.provider_cooldown_remaining(provider).await {
            return Err(KeyPoolError::RateLimited { retry_after_secs });
        }
        if let Some(max_qps) = provider.max_qps {
            let provider_count = self
                .kv
                .incr(&keys::provider_qps(&provider.id), Duration::from_secs(1))
                .await
                .unwrap_or(1);
            if provider_count as u32 > max_qps {
                return Err(KeyPoolError::RateLimited { retry_after_secs: 1 });
            }
        }

        let active_keys: Vec<_> = provider.active_keys().collect();
        if active_keys.is_empty() {
            return Err(KeyPoolError::NoActiveKeys);
        }

        let mut eligible = Vec::new();
        let mut min_retry_after: Option<u64> = None;
        for k in active_keys {
            let hash = key_hash(&provider.id, &k.id);
            if let Some(retry_after_secs) = self.key_cooldown_remaining(&provider.id, &hash).await {
                min_retry_after = Some(min_retry_after.map_or(retry_after_secs, |m| m.min(retry_after_secs)));
                continue;
            }
            if let Some(max_qps) = k.max_qps {
                let count = self
                    .kv
                    .incr(&keys::keypool_qps(&provider.id, &hash), Duration::from_secs(1))
                    .await
                    .unwrap_or(1);
                if count as u32 > max_qps {
                    min_retry_after = Some(min_retry_after.map_or(1, |m| m.min(1)));
                    continue;
                }
            }
            eligible.push((k, hash));
        }

        if eligible.is_empty() {
            return Err(KeyPoolError::RateLimited { retry_after_secs: min_retry_after.unwrap_or(1) });
        }

        // Weighted random, tie-broken by label order via stable input order.
        let weights: Vec<f64> = eligible.iter().map(|(k, _)| k.weight).collect();
        let idx = if let Ok(dist) = WeightedIndex::new(&weights) {
            dist.sample(&mut rand::thread_rng())
        } else {
            0
        };
        let (key, hash) = &eligible[idx];

        Ok(KeySelection {
            provider_id: provider.id.clone(),
            key_id: key.id.clone(),
            key_hash: hash.clone(),
            plaintext: decrypt(&key.key_ciphertext),
        })
    }

    /// `Some(remaining_secs)` while the key's cooldown is still active, else
    /// `None`. `remaining_secs` backs the surfaced `Retry-After`.
    async fn key_cooldown_remaining(&self, provider_id: &str, key_hash: &str) -> Option<u64> {
        let raw = self.kv.get_raw(&keys::keypool_cooldown(provider_id, key_hash)).await.ok().flatten()?;
        let until: i64 = raw.parse().ok()?;
        let remaining = until - chrono::Utc::now().timestamp();
        (remaining > 0).then_some(remaining as u64)
    }

    async fn provider_cooldown_remaining(&self, provider: &ProviderConfig) -> Option<u64> {
        let raw = self.kv.get_raw(&keys::provider_cooldown(&provider.id)).await.ok().flatten()?;
        let until: i64 = raw.parse().ok()?;
        let remaining = until - chrono::Utc::now().timestamp();
        (remaining > 0).then_some(remaining as u64)
    }

    pub async fn record_success(&self, selection: &KeySelection) {
        let _ = self
            .kv
            .delete(&format!("keypool:{}:{}:failures", selection.provider_id, selection.key_hash))
            .await;
        let _ = self
            .kv
            .delete(&keys::keypool_cooldown(&selection.provider_id, &selection.key_hash))
            .await;
        let _ = self.kv.delete(&keys::provider_cooldown(&selection.provider_id)).await;
    }

    /// Retryable failures increment a rolling counter; crossing
    /// `failure_threshold` within `cooldown_window` cools down both the
    /// key and, as a fast-path, the whole provider so later requests skip
    /// it without attempting a key. Non-retryable (non-429) 4xx failures
    /// never cool down.
    pub async fn record_failure(&self, selection: &KeySelection, retryable: bool, _status_code: Option<u16>) {
        if !retryable {
            return;
        }
        let counter_key = format!("keypool:{}:{}:failures", selection.provider_id, selection.key_hash);
        let count = self.kv.incr(&counter_key, self.config.cooldown_window).await.unwrap_or(1);
        if count as u32 >= self.config.failure_threshold {
            let until = chrono::Utc::now().timestamp() + self.config.failure_cooldown.as_secs() as i64;
            let _ = self
                .kv
                .set_raw(
                    &keys::keypool_cooldown(&selection.provider_id, &selection.key_hash),
                    until.to_string(),
                    Some(self.config.failure_cooldown),
                )
                .await;
            let _ = self
                .kv
                .set_raw(
                    &keys::provider_cooldown(&selection.provider_id),
                    until.to_string(),
                    Some(self.config.failure_cooldown),
                )
                .await;
            let _ = self.kv.delete(&counter_key).await;
        }
    }
}

/// Keys are stored ciphertext; decryption against an external secret store
/// is out of scope here, stubbed to a transparent identity transform.
fn decrypt(ciphertext: &str) -> String {
    ciphertext.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{KeyStatus, ProviderApiKey, Transport, Visibility};
    use crate::kv::InMemoryKv;

    fn provider_with_keys(keys: Vec<ProviderApiKey>) -> ProviderConfig {
        ProviderConfig {
            id: "p1".to_string(),
            name: "p1".to_string(),
            base_url: "https://x".to_string(),
            transport: Transport::Http,
            sdk_vendor: None,
            models_path: "/models".to_string(),
            messages_path: "/v1/messages".to_string(),
            chat_completions_path: "/v1/chat/completions".to_string(),
            responses_path: "/v1/responses".to_string(),
            supported_styles: vec![],
            retryable_status_codes: vec![],
            custom_headers: Default::default(),
            region: None,
            cost_per_1k_input: 0.0,
            cost_per_1k_output: 0.0,
            max_qps: None,
            keys,
            static_models: None,
            visibility: Visibility::Public,
            owner: None,
            shared_users: vec![],
            enabled: true,
            billing_factor: 1.0,
        }
    }

    #[tokio::test]
    async fn cooldown_after_threshold_hides_key() {
        let kv = InMemoryKv::new();
        let pool = KeyPool::new(
            kv,
            KeyPoolConfig { failure_threshold: 2, ..Default::default() },
        );
        let provider = provider_with_keys(vec![ProviderApiKey {
            id: "k1".to_string(),
            key_ciphertext: "secret".to_string(),
            weight: 1.0,
            max_qps: None,
            label: "a".to_string(),
            status: KeyStatus::Active,
        }]);

        let sel = pool.acquire(&provider).await.unwrap();
        pool.record_failure(&sel, true, Some(500)).await;
        let sel2 = pool.acquire(&provider).await.unwrap();
        pool.record_failure(&sel2, true, Some(500)).await;

        match pool.acquire(&provider).await {
            Err(KeyPoolError::RateLimited { retry_after_secs }) => assert!(retry_after_secs > 0),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_clears_counters() {
        let kv = InMemoryKv::new();
        let pool = KeyPool::new(kv, KeyPoolConfig::default());
        let provider = provider_with_keys(vec![ProviderApiKey {
            id: "k1".to_string(),
            key_ciphertext: "secret".to_string(),
            weight: 1.0,
            max_qps: None,
            label: "a".to_string(),
            status: KeyStatus::Active,
        }]);
        let sel = pool.acquire(&provider).await.unwrap();
        pool.record_success(&sel).await;
        assert!(pool.acquire(&provider).await.is_ok());
    }
}
