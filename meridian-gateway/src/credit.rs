//! Credit Meter (C10). Idempotent pre-charge and final settlement over the
//! credit ledger: token-count × per-1k rate, scaled by per-model billing
//! multipliers, settled exactly once per request idempotency key.

use crate::domain::{CreditAccountStatus, CreditTransaction, ModelBillingConfig};
use crate::error::GatewayError;
use crate::store::Store;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct CreditConfig {
    pub enforce: bool,
    pub base_per_1k_tokens_cents: i64,
    pub pre_charge_enabled: bool,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            enforce: true,
            base_per_1k_tokens_cents: 10,
            pre_charge_enabled: false,
        }
    }
}

pub struct CreditMeter {
    store: Arc<dyn Store>,
    config: CreditConfig,
}

impl CreditMeter {
    pub fn new(store: Arc<dyn Store>, config: CreditConfig) -> Self {
        Self { store, config }
    }

    /// Blocks when enforcement is on and the balance is at or below zero.
    pub async fn ensure_usable(&self, user_id: &str) -> Result<(), GatewayError> {
        if !self.config.enforce {
            return Ok(());
        }
        let account = self
            .store
            .get_credit_account(user_id)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        match account {
            Some(a) if a.status == CreditAccountStatus::Suspended => Err(GatewayError::CreditInsufficient),
            Some(a) if a.balance_cents <= 0 => Err(GatewayError::CreditInsufficient),
            Some(_) => Ok(()),
            None => Ok(()), // unseen users default to usable; provisioning is an out-of-scope admin concern.
        }
    }

    /// `ceil(base_per_1k * model_multiplier * provider_billing_factor * total_tokens / 1000)`,
    /// minimum 1 — unless `total_tokens` is zero or the effective rate is
    /// zero, in which case the floor is skipped and the settlement is a
    /// zero-cost no-op ledger entry (scenario 1: "one ledger row with
    /// `amount ≤ 0`"). Idempotent on `idempotency_key` — a replay is a
    /// no-op and returns `false` (invariant 8).
    pub async fn settle(
        &self,
        idempotency_key: &str,
        user_id: &str,
        logical_model: &str,
        provider_id: &str,
        provider_billing_factor: f64,
        total_tokens: u64,
    ) -> Result<bool, GatewayError> {
        if !self.config.enforce {
            return Ok(false);
        }
        let billing_config = self
            .store
            .get_model_billing_config(logical_model)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        let multiplier = ModelBillingConfig::effective_multiplier(billing_config.as_ref());

        let effective_rate = self.config.base_per_1k_tokens_cents as f64 * multiplier * provider_billing_factor;
        let amount_cents = if total_tokens == 0 || effective_rate == 0.0 {
            0
        } else {
            let raw = effective_rate * (total_tokens as f64 / 1000.0);
            (raw.ceil() as i64).max(1)
        };

        let txn = CreditTransaction {
            idempotency_key: idempotency_key.to_string(),
            user_id: user_id.to_string(),
            amount_cents,
            logical_model: logical_model.to_string(),
            provider_id: provider_id.to_string(),
            created_at: chrono::Utc::now(),
        };

        self.store
            .settle_credit(txn)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    /// Approximates tokens from `max_tokens` when upstream usage is absent,
    /// for post-charge streaming settlement.
    pub fn approximate_tokens(max_tokens: Option<u32>, prompt_chars: usize) -> u64 {
        let input_estimate = (prompt_chars / 4).max(1) as u64;
        let output_estimate = max_tokens.unwrap_or(256) as u64;
        input_estimate + output_estimate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CreditAccount, CreditAccountStatus};
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn replaying_idempotency_key_is_noop() {
        let store = InMemoryStore::new();
        store.seed_credit_account(CreditAccount {
            user_id: "u1".to_string(),
            balance_cents: 1000,
            daily_limit_cents: None,
            status: CreditAccountStatus::Active,
        });
        let meter = CreditMeter::new(store.clone(), CreditConfig::default());

        let first = meter.settle("req-1", "u1", "gpt-4", "p1", 1.0, 2000).await.unwrap();
        let second = meter.settle("req-1", "u1", "gpt-4", "p1", 1.0, 2000).await.unwrap();
        assert!(first);
        assert!(!second);

        let account = store.get_credit_account("u1").await.unwrap().unwrap();
        assert_eq!(account.balance_cents, 1000 - 20);
    }

    #[tokio::test]
    async fn zero_tokens_settles_as_zero_cost_not_the_floor() {
        let store = InMemoryStore::new();
        store.seed_credit_account(CreditAccount {
            user_id: "u1".to_string(),
            balance_cents: 1000,
            daily_limit_cents: None,
            status: CreditAccountStatus::Active,
        });
        let meter = CreditMeter::new(store.clone(), CreditConfig::default());

        let settled = meter.settle("req-zero", "u1", "gpt-4", "p1", 1.0, 0).await.unwrap();
        assert!(settled);

        let account = store.get_credit_account("u1").await.unwrap().unwrap();
        assert_eq!(account.balance_cents, 1000, "zero tokens must not apply the 1-cent floor");
    }

    #[tokio::test]
    async fn zero_balance_blocks_when_enforced() {
        let store = InMemoryStore::new();
        store.seed_credit_account(CreditAccount {
            user_id: "u1".to_string(),
            balance_cents: 0,
            daily_limit_cents: None,
            status: CreditAccountStatus::Active,
        });
        let meter = CreditMeter::new(store, CreditConfig::default());
        assert!(meter.ensure_usable("u1").await.is_err());
    }
}
