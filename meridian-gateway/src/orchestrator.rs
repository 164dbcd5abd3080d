//! Request Orchestrator (C11). Binds C1-C10 into the single
//! per-request pipeline: authenticate, resolve, schedule, proxy, settle.

use crate::adapters::unary::detect_style;
use crate::credit::CreditMeter;
use crate::domain::{ApiStyle, Candidate};
use crate::error::GatewayError;
use crate::health::HealthMonitor;
use crate::keypool::KeyPool;
use crate::metrics::MetricsRegistry;
use crate::proxy::{ProxyEngine, ProxyOutcome};
use crate::registry::{ProviderRegistry, UserContext};
use crate::resolver::LogicalModelResolver;
use crate::scheduler::{self, SchedulerStrategy};
use crate::session::SessionStore;
use crate::store::Store;
use serde_json::Value;
use std::sync::Arc;

pub struct Orchestrator {
    pub registry: Arc<ProviderRegistry>,
    pub resolver: Arc<LogicalModelResolver>,
    pub health: Arc<HealthMonitor>,
    pub metrics: Arc<MetricsRegistry>,
    pub sessions: Arc<SessionStore>,
    pub credit: Arc<CreditMeter>,
    pub proxy: Arc<ProxyEngine>,
    pub store: Arc<dyn Store>,
    pub strategy: SchedulerStrategy,
}

pub struct AuthenticatedCaller {
    pub user_id: String,
    pub caller_key_id: String,
    pub allowed_provider_ids: Option<Vec<String>>,
}

impl Orchestrator {
    /// Authenticates a caller-supplied `Authorization: Bearer <caller_key>`.
    /// Keys are stored hashed; the bearer token is hashed before the lookup
    /// so plaintext caller credentials never touch the store.
    pub async fn authenticate(&self, bearer_token: &str) -> Result<AuthenticatedCaller, GatewayError> {
        let key_hash = hash_token(bearer_token);
        let key = self
            .store
            .get_caller_key(&key_hash)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .ok_or(GatewayError::Unauthenticated)?;

        if !key.active || key.is_expired(chrono::Utc::now()) {
            return Err(GatewayError::Unauthenticated);
        }

        Ok(AuthenticatedCaller {
            user_id: key.user_id,
            caller_key_id: key.id,
            allowed_provider_ids: key.allowed_provider_ids,
        })
    }

    /// Runs the full pipeline for one unary-or-stream request body against
    /// `lookup_id`: resolve, filter, schedule, proxy, settle.
    pub async fn handle(
        &self,
        caller: &AuthenticatedCaller,
        lookup_id: &str,
        body: &Value,
        endpoint_style: ApiStyle,
        conversation_id: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<ProxyOutcome, GatewayError> {
        let caller_style = detect_style(body);
        let effective_style = if caller_style == ApiStyle::Openai { endpoint_style } else { caller_style };

        self.credit.ensure_usable(&caller.user_id).await?;

        let user_ctx = UserContext { user_id: caller.user_id.clone(), is_superuser: false };
        let visible_ids: Vec<String> = self.registry.list_visible_providers(&user_ctx).into_iter().map(|p| p.id).collect();
        let allowed_provider_ids: Vec<String> = match &caller.allowed_provider_ids {
            Some(allowlist) => visible_ids.into_iter().filter(|id| allowlist.contains(id)).collect(),
            None => visible_ids,
        };
        if allowed_provider_ids.is_empty() {
            return Err(GatewayError::ProviderRestricted(lookup_id.to_string()));
        }

        let logical = self.resolver.resolve(lookup_id, effective_style, &allowed_provider_ids).await?;

        let eligible = logical.eligible_upstreams(&allowed_provider_ids);
        if eligible.is_empty() {
            return Err(GatewayError::NoEligibleCandidates(lookup_id.to_string()));
        }

        let mut candidates = Vec::with_capacity(eligible.len());
        for physical in eligible {
            let Some(provider) = self.registry.get_provider(&physical.provider_id) else { continue };
            let health_state = self.health.read_status(&provider.id).await;
            let dynamic_weight = self.metrics.get_dynamic_weight(&logical.id, &provider.id).await;
            let window = self.metrics.get_window(&logical.id, &provider.id).await;
            candidates.push(Candidate {
                provider,
                physical: physical.clone(),
                health: health_state,
                dynamic_weight,
                metrics: window,
            });
        }
        if candidates.is_empty() {
            return Err(GatewayError::NoEligibleCandidates(lookup_id.to_string()));
        }

        let sticky_session = match conversation_id {
            Some(id) => self.sessions.get(id).await,
            None => None,
        };

        let scheduled = scheduler::choose(candidates, &self.strategy, sticky_session.as_ref())
            .ok_or_else(|| GatewayError::NoEligibleCandidates(lookup_id.to_string()))?;

        // Caller-supplied `Idempotency-Key` wins, so a client retrying the
        // same logical request settles exactly once. Absent that, fall back
        // to a hash of caller + model + body so an accidental gateway-side
        // retry of an otherwise identical call still dedupes. Computed once,
        // up front: the unary path settles after `proxy.execute` returns,
        // but the streaming path settles from inside the byte stream itself
        // (§4.10(b), token totals are only known once the stream ends), so
        // both need the same key before `execute` is called.
        let idempotency_key = idempotency_key
            .map(str::to_string)
            .unwrap_or_else(|| derive_idempotency_key(&caller.caller_key_id, &logical.id, body));

        let (outcome, provider_id, model_id, billing_factor) = self
            .proxy
            .execute(
                scheduled.ordered,
                &logical.id,
                body,
                effective_style,
                Some(caller.user_id.clone()),
                Some(caller.caller_key_id.clone()),
                idempotency_key.clone(),
            )
            .await?;

        // §3 lifecycle: "created on first call, touched per request". A
        // continuing conversation that landed on the same upstream it was
        // already bound to just gets its `last_accessed`/`message_count`
        // bumped; anything else (a brand new conversation, or a non-sticky
        // reselection that moved to a different provider/model) rebinds.
        if let Some(conversation_id) = conversation_id {
            let continues_same_upstream = sticky_session
                .as_ref()
                .is_some_and(|s| s.provider_id == provider_id && s.model_id == model_id);
            if continues_same_upstream {
                self.sessions.touch(conversation_id).await;
            } else {
                self.sessions.bind(conversation_id, &logical.id, &provider_id, &model_id).await;
            }
        }

        if let ProxyOutcome::Unary { input_tokens, output_tokens, .. } = &outcome {
            let _ = self
                .credit
                .settle(
                    &idempotency_key,
                    &caller.user_id,
                    &logical.id,
                    &provider_id,
                    billing_factor,
                    input_tokens + output_tokens,
                )
                .await;
        }

        Ok(outcome)
    }
}

fn hash_token(token: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn derive_idempotency_key(caller_key_id: &str, logical_model: &str, body: &Value) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(caller_key_id.as_bytes());
    hasher.update(b":");
    hasher.update(logical_model.as_bytes());
    hasher.update(b":");
    hasher.update(body.to_string().as_bytes());
    format!("derived:{:x}", hasher.finalize())
}
