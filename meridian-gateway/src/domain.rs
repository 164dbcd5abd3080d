//! Core data model shared by every routing component (C1-C11).
//!
//! These are value types: the scheduler, proxy engine, and adapters only ever
//! see owned copies filtered down to the current request, never live handles
//! into the registry or the store. That keeps the provider/model/logical-model
//! cycle from leaking into borrow-checked code — everything here is `Clone`
//! and `Send`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wire dialect of a request or response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStyle {
    Openai,
    Claude,
    Responses,
}

impl ApiStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiStyle::Openai => "openai",
            ApiStyle::Claude => "claude",
            ApiStyle::Responses => "responses",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Completion,
    Embedding,
    Vision,
    Audio,
    FunctionCalling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Http,
    Sdk,
    ClaudeCli,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Restricted,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Disabled,
}

/// One credential in a provider's key pool. Never logged; `key_ciphertext`
/// is decrypted lazily by `registry::decrypt` only at acquisition time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderApiKey {
    pub id: String,
    pub key_ciphertext: String,
    pub weight: f64,
    pub max_qps: Option<u32>,
    pub label: String,
    pub status: KeyStatus,
}

impl ProviderApiKey {
    pub fn is_active(&self) -> bool {
        matches!(self.status, KeyStatus::Active) && self.weight > 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub transport: Transport,
    pub sdk_vendor: Option<String>,
    pub models_path: String,
    pub messages_path: String,
    pub chat_completions_path: String,
    pub responses_path: String,
    pub supported_styles: Vec<ApiStyle>,
    pub retryable_status_codes: Vec<u16>,
    pub custom_headers: HashMap<String, String>,
    pub region: Option<String>,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
    pub max_qps: Option<u32>,
    pub keys: Vec<ProviderApiKey>,
    pub static_models: Option<Vec<String>>,
    pub visibility: Visibility,
    pub owner: Option<String>,
    pub shared_users: Vec<String>,
    pub enabled: bool,
    pub billing_factor: f64,
}

impl ProviderConfig {
    pub fn active_keys(&self) -> impl Iterator<Item = &ProviderApiKey> {
        self.keys.iter().filter(|k| k.is_active())
    }

    pub fn has_active_key(&self) -> bool {
        self.active_keys().next().is_some()
    }

    /// A provider-declared set wins when present; otherwise a hard-coded
    /// fallback (429, 5xx, network errors) applies (DESIGN.md Open Question 1).
    pub fn retryable(&self, status: u16) -> bool {
        if !self.retryable_status_codes.is_empty() {
            self.retryable_status_codes.contains(&status)
        } else {
            status == 429 || (500..=599).contains(&status)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderModel {
    pub provider_id: String,
    pub model_id: String,
    pub family: Option<String>,
    pub display_name: Option<String>,
    pub context_length: Option<u32>,
    pub capabilities: Vec<Capability>,
    pub pricing: Option<ModelPricing>,
    pub alias: Option<String>,
    pub disabled: bool,
    pub meta_hash: String,
    pub endpoint: String,
    pub api_style: ApiStyle,
    pub base_weight: f64,
    pub max_qps: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// A concrete `(provider, model)` a `LogicalModel` can route to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalModel {
    pub provider_id: String,
    pub model_id: String,
    pub endpoint: String,
    pub api_style: ApiStyle,
    pub base_weight: f64,
    pub region: Option<String>,
    pub max_qps: Option<u32>,
    pub meta_hash: String,
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalModel {
    pub id: String,
    pub display_name: String,
    pub capabilities: Vec<Capability>,
    pub upstreams: Vec<PhysicalModel>,
    pub enabled: bool,
}

impl LogicalModel {
    /// Only upstreams whose provider is allowed and whose own/pair-level
    /// disabled flag is clear (invariant 4).
    pub fn eligible_upstreams(&self, allowed_provider_ids: &[String]) -> Vec<&PhysicalModel> {
        self.upstreams
            .iter()
            .filter(|p| !p.disabled && allowed_provider_ids.iter().any(|id| id == &p.provider_id))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerApiKey {
    pub id: String,
    pub key_hash: String,
    pub user_id: String,
    pub active: bool,
    pub allowed_provider_ids: Option<Vec<String>>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl CallerApiKey {
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.expires_at.map(|e| e <= now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub conversation_id: String,
    pub logical_model: String,
    pub provider_id: String,
    pub model_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_accessed: chrono::DateTime<chrono::Utc>,
    pub message_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStatus {
    Healthy,
    Degraded,
    Down,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingCounters {
    pub success: u64,
    pub error: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub status_429: u64,
    pub timeout: u64,
}

impl RoutingCounters {
    pub fn total(&self) -> u64 {
        self.success + self.error
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.error as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingMetricsWindow {
    pub logical_model: String,
    pub provider_id: String,
    pub transport: Transport,
    pub is_stream: bool,
    pub user_id: Option<String>,
    pub caller_key_id: Option<String>,
    pub window_start: chrono::DateTime<chrono::Utc>,
    pub window_seconds: u32,
    pub counters: RoutingCounters,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub status: RoutingStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditAccountStatus {
    Active,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditAccount {
    pub user_id: String,
    pub balance_cents: i64,
    pub daily_limit_cents: Option<i64>,
    pub status: CreditAccountStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub idempotency_key: String,
    pub user_id: String,
    pub amount_cents: i64,
    pub logical_model: String,
    pub provider_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBillingConfig {
    pub model_name: String,
    pub multiplier: f64,
    pub is_active: bool,
}

impl ModelBillingConfig {
    pub fn effective_multiplier(cfg: Option<&ModelBillingConfig>) -> f64 {
        match cfg {
            Some(c) if c.is_active => c.multiplier,
            _ => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Down,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub provider_id: String,
    pub status: HealthState,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub response_ms: Option<u64>,
    pub error: Option<String>,
    pub last_success_ts: Option<chrono::DateTime<chrono::Utc>>,
}

/// A `(provider, physical_model)` pair that survived ACL/capability
/// filtering, carrying whatever C4/C5 know about it so C6 can score it
/// without reaching back into the registry or store.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: ProviderConfig,
    pub physical: PhysicalModel,
    pub health: HealthState,
    pub dynamic_weight: Option<f64>,
    pub metrics: Option<RoutingMetricsWindow>,
}

impl Candidate {
    pub fn key(&self) -> (String, String) {
        (self.provider.id.clone(), self.physical.model_id.clone())
    }
}
