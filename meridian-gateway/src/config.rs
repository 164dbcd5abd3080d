//! # Configuration Management Module
//!
//! Loading, validation, and environment-variable overrides for the gateway's
//! settings, plus the static bootstrap data (providers, logical models,
//! caller keys, credit accounts) that seeds the in-memory store on startup.
//!
//! ## Configuration Structure
//!
//! - **Server**: HTTP server settings (host, port, timeouts, CORS)
//! - **Gateway**: routing pipeline tuning (scheduler weights, key pool
//!   cooldowns, health probe interval, metrics sampling, credit policy)
//! - **KV**: backend for ephemeral routing/session/cooldown state
//!   (in-memory or Redis)
//! - **Logging**: log levels, formats, and output destinations
//! - **Bootstrap**: the provider/model/caller-key/credit-account seed data
//!   loaded into the store at startup
//!
//! ## Environment Variables
//!
//! - `GATEWAY_HOST` / `GATEWAY_PORT` / `GATEWAY_TIMEOUT`: server overrides
//! - `GATEWAY_KV_BACKEND` / `GATEWAY_REDIS_URL`: KV backend overrides
//! - `GATEWAY_LOG_LEVEL`: logging override
//! - `<PROVIDER_ID>_API_KEY`: injects a single active key for a bootstrap
//!   provider that has no keys of its own, so secrets never need to live in
//!   the TOML file

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration settings
    pub server: ServerConfig,
    /// Routing/scheduling/credit pipeline tuning
    pub gateway: GatewayConfig,
    /// Backend for ephemeral KV state (cooldowns, sessions, routing weights)
    pub kv: KvConfig,
    /// Logging configuration (level, format, output)
    pub logging: LoggingConfig,
    /// Seed data loaded into the store at startup
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

/// HTTP server configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(with = "meridian_sdk::common::duration_serde")]
    pub timeout: Duration,
    pub max_body_size: usize,
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub max_age: Option<Duration>,
}

/// Tuning knobs for C3-C6/C10/C11: key pool cooldowns, health probing,
/// scheduler weights, metrics sampling, credit enforcement, session TTL,
/// and the proxy engine's own timeout/retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Per-attempt upstream request timeout
    #[serde(with = "meridian_sdk::common::duration_serde")]
    pub upstream_timeout: Duration,
    /// Failover attempt budget; `0` falls back to the candidate count
    pub max_retries: usize,
    /// Sticky-session TTL and binding
    #[serde(with = "meridian_sdk::common::duration_serde")]
    pub session_ttl: Duration,
    pub scheduler: SchedulerSettings,
    pub keypool: KeyPoolSettings,
    pub health: HealthSettings,
    pub metrics: MetricsSettings,
    pub credit: CreditSettings,
}

/// Scheduler scoring weights. Mirrors `scheduler::SchedulerStrategy`
/// field-for-field; kept TOML-serializable here and converted at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub alpha_latency: f64,
    pub beta_error: f64,
    pub gamma_cost: f64,
    pub delta_status_penalty: f64,
    pub min_score: f64,
    pub enable_stickiness: bool,
}

impl From<SchedulerSettings> for crate::scheduler::SchedulerStrategy {
    fn from(s: SchedulerSettings) -> Self {
        Self {
            alpha_latency: s.alpha_latency,
            beta_error: s.beta_error,
            gamma_cost: s.gamma_cost,
            delta_status_penalty: s.delta_status_penalty,
            min_score: s.min_score,
            enable_stickiness: s.enable_stickiness,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        crate::scheduler::SchedulerStrategy::default().into()
    }
}

impl From<crate::scheduler::SchedulerStrategy> for SchedulerSettings {
    fn from(s: crate::scheduler::SchedulerStrategy) -> Self {
        Self {
            alpha_latency: s.alpha_latency,
            beta_error: s.beta_error,
            gamma_cost: s.gamma_cost,
            delta_status_penalty: s.delta_status_penalty,
            min_score: s.min_score,
            enable_stickiness: s.enable_stickiness,
        }
    }
}

/// Key pool failure/cooldown thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPoolSettings {
    pub failure_threshold: u32,
    #[serde(with = "meridian_sdk::common::duration_serde")]
    pub cooldown_window: Duration,
    #[serde(with = "meridian_sdk::common::duration_serde")]
    pub failure_cooldown: Duration,
}

impl From<KeyPoolSettings> for crate::keypool::KeyPoolConfig {
    fn from(s: KeyPoolSettings) -> Self {
        Self {
            failure_threshold: s.failure_threshold,
            cooldown_window: s.cooldown_window,
            failure_cooldown: s.failure_cooldown,
        }
    }
}

impl Default for KeyPoolSettings {
    fn default() -> Self {
        let d = crate::keypool::KeyPoolConfig::default();
        Self {
            failure_threshold: d.failure_threshold,
            cooldown_window: d.cooldown_window,
            failure_cooldown: d.failure_cooldown,
        }
    }
}

/// Health probe cadence and TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(with = "meridian_sdk::common::duration_serde")]
    pub health_interval: Duration,
    #[serde(with = "meridian_sdk::common::duration_serde")]
    pub health_ttl: Duration,
    #[serde(with = "meridian_sdk::common::duration_serde")]
    pub probe_timeout: Duration,
}

impl From<HealthSettings> for crate::health::HealthMonitorConfig {
    fn from(s: HealthSettings) -> Self {
        Self {
            health_interval: s.health_interval,
            health_ttl: s.health_ttl,
            probe_timeout: s.probe_timeout,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        let d = crate::health::HealthMonitorConfig::default();
        Self {
            health_interval: d.health_interval,
            health_ttl: d.health_ttl,
            probe_timeout: d.probe_timeout,
        }
    }
}

/// Metrics sampling rate and dynamic-weight feedback-loop parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricsSettings {
    pub success_sample_rate: f64,
    pub learning_rate: f64,
    pub min_factor: f64,
    pub max_factor: f64,
}

impl MetricsSettings {
    pub fn dynamic_weight_params(&self) -> crate::metrics::DynamicWeightParams {
        crate::metrics::DynamicWeightParams {
            learning_rate: self.learning_rate,
            min_factor: self.min_factor,
            max_factor: self.max_factor,
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        let d = crate::metrics::DynamicWeightParams::default();
        Self {
            success_sample_rate: 1.0,
            learning_rate: d.learning_rate,
            min_factor: d.min_factor,
            max_factor: d.max_factor,
        }
    }
}

/// Credit enforcement policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreditSettings {
    pub enforce: bool,
    pub base_per_1k_tokens_cents: i64,
    pub pre_charge_enabled: bool,
}

impl From<CreditSettings> for crate::credit::CreditConfig {
    fn from(s: CreditSettings) -> Self {
        Self {
            enforce: s.enforce,
            base_per_1k_tokens_cents: s.base_per_1k_tokens_cents,
            pre_charge_enabled: s.pre_charge_enabled,
        }
    }
}

impl Default for CreditSettings {
    fn default() -> Self {
        let d = crate::credit::CreditConfig::default();
        Self {
            enforce: d.enforce,
            base_per_1k_tokens_cents: d.base_per_1k_tokens_cents,
            pre_charge_enabled: d.pre_charge_enabled,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(60),
            max_retries: 0,
            session_ttl: Duration::from_secs(3600),
            scheduler: SchedulerSettings::default(),
            keypool: KeyPoolSettings::default(),
            health: HealthSettings::default(),
            metrics: MetricsSettings::default(),
            credit: CreditSettings::default(),
        }
    }
}

/// Backend for ephemeral KV state (`kv.rs`). In-memory is single-process
/// only; Redis is required once the gateway runs behind more than one
/// replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    pub backend: KvBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvBackend {
    Memory,
    Redis { url: String },
}

impl Default for KvConfig {
    fn default() -> Self {
        Self { backend: KvBackend::Memory }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            output: LogOutput::Stdout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogOutput {
    Stdout,
    File { path: String },
}

/// Seed data loaded into the `Store` at startup. A real deployment backs
/// the store with a database and manages this data through the admin API;
/// the TOML bootstrap exists for single-file/dev deployments
/// (`config.toml` next to the binary).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub providers: Vec<crate::domain::ProviderConfig>,
    #[serde(default)]
    pub provider_models: Vec<crate::domain::ProviderModel>,
    #[serde(default)]
    pub logical_models: Vec<crate::domain::LogicalModel>,
    #[serde(default)]
    pub caller_keys: Vec<crate::domain::CallerApiKey>,
    #[serde(default)]
    pub credit_accounts: Vec<crate::domain::CreditAccount>,
    #[serde(default)]
    pub billing_configs: Vec<crate::domain::ModelBillingConfig>,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = env::var("GATEWAY_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }

        if let Ok(port_str) = env::var("GATEWAY_PORT") {
            let port: u16 = port_str
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid GATEWAY_PORT: {}", port_str))?;
            if port > 0 {
                self.server.port = port;
            }
        }

        if let Ok(timeout) = env::var("GATEWAY_TIMEOUT") {
            self.server.timeout = parse_duration(&timeout)?;
        }

        // Inject per-provider API keys without putting secrets in the TOML.
        // A bootstrap provider with no keys of its own picks up a single
        // active key named "env" from `<PROVIDER_ID>_API_KEY`.
        for provider in &mut self.bootstrap.providers {
            let env_key = format!(
                "{}_API_KEY",
                provider.id.to_uppercase().replace('-', "_")
            );
            if let Ok(api_key) = env::var(&env_key) {
                if !api_key.is_empty() {
                    provider.keys.push(crate::domain::ProviderApiKey {
                        id: "env".to_string(),
                        key_ciphertext: api_key,
                        weight: 1.0,
                        max_qps: None,
                        label: "env".to_string(),
                        status: crate::domain::KeyStatus::Active,
                    });
                    tracing::debug!("Loaded API key for provider: {}", provider.id);
                }
            } else if !provider.has_active_key() && !provider.id.to_lowercase().contains("ollama") {
                tracing::warn!(
                    "No active key for provider: {} (set {} environment variable)",
                    provider.id,
                    env_key
                );
            }
        }

        if let Ok(backend) = env::var("GATEWAY_KV_BACKEND") {
            match backend.as_str() {
                "memory" => self.kv.backend = KvBackend::Memory,
                "redis" => {
                    let url = env::var("GATEWAY_REDIS_URL")
                        .unwrap_or_else(|_| "redis://localhost:6379".to_string());
                    if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                        return Err(anyhow::anyhow!("Invalid Redis URL format: {}", url));
                    }
                    self.kv.backend = KvBackend::Redis { url };
                }
                _ => {
                    return Err(anyhow::anyhow!(
                        "Invalid KV backend: {}. Use 'memory' or 'redis'",
                        backend
                    ));
                }
            }
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            let valid_levels = ["trace", "debug", "info", "warn", "error"];
            if valid_levels.contains(&level.as_str()) {
                self.logging.level = level;
            } else {
                return Err(anyhow::anyhow!(
                    "Invalid log level: {}. Use: {:?}",
                    level,
                    valid_levels
                ));
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_server()?;
        self.validate_gateway()?;
        self.validate_kv()?;
        self.validate_logging()?;
        self.validate_bootstrap()?;
        Ok(())
    }

    fn validate_server(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!(
                "Server port must be between 1 and 65535, got {}",
                self.server.port
            ));
        }
        if self.server.max_body_size == 0 {
            return Err(anyhow::anyhow!("Max body size cannot be 0"));
        }
        if self.server.max_body_size > 100 * 1024 * 1024 {
            return Err(anyhow::anyhow!(
                "Max body size cannot exceed 100MB, got {} bytes",
                self.server.max_body_size
            ));
        }
        if self.server.timeout.as_secs() == 0 {
            return Err(anyhow::anyhow!("Server timeout cannot be 0"));
        }
        if self.server.host.is_empty() {
            return Err(anyhow::anyhow!("Server host cannot be empty"));
        }
        if self.server.cors.enabled {
            if self.server.cors.allowed_origins.is_empty() {
                return Err(anyhow::anyhow!(
                    "CORS enabled but no allowed origins specified"
                ));
            }
            if self.server.cors.allowed_methods.is_empty() {
                return Err(anyhow::anyhow!(
                    "CORS enabled but no allowed methods specified"
                ));
            }
        }
        Ok(())
    }

    fn validate_gateway(&self) -> anyhow::Result<()> {
        if self.gateway.upstream_timeout.as_secs() == 0 {
            return Err(anyhow::anyhow!("gateway.upstream_timeout cannot be 0"));
        }
        if self.gateway.health.health_interval.as_secs() == 0 {
            return Err(anyhow::anyhow!("gateway.health.health_interval cannot be 0"));
        }
        if !(0.0..=1.0).contains(&self.gateway.metrics.success_sample_rate) {
            return Err(anyhow::anyhow!(
                "gateway.metrics.success_sample_rate must be between 0.0 and 1.0"
            ));
        }
        if self.gateway.credit.base_per_1k_tokens_cents < 0 {
            return Err(anyhow::anyhow!(
                "gateway.credit.base_per_1k_tokens_cents cannot be negative"
            ));
        }
        Ok(())
    }

    fn validate_kv(&self) -> anyhow::Result<()> {
        if let KvBackend::Redis { url } = &self.kv.backend {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(anyhow::anyhow!(
                    "Redis URL must start with redis:// or rediss://"
                ));
            }
        }
        Ok(())
    }

    fn validate_logging(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }
        if let LogOutput::File { path } = &self.logging.output {
            if path.is_empty() {
                return Err(anyhow::anyhow!("Log file path cannot be empty"));
            }
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    return Err(anyhow::anyhow!(
                        "Log file parent directory does not exist: {}",
                        parent.display()
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_bootstrap(&self) -> anyhow::Result<()> {
        if self.bootstrap.providers.is_empty() {
            return Err(anyhow::anyhow!(
                "At least one provider must be configured under [[bootstrap.providers]]"
            ));
        }
        for provider in &self.bootstrap.providers {
            if provider.id.is_empty() {
                return Err(anyhow::anyhow!("Bootstrap provider id cannot be empty"));
            }
            if provider.enabled
                && !provider.has_active_key()
                && !provider.id.to_lowercase().contains("ollama")
            {
                return Err(anyhow::anyhow!(
                    "Provider {} is enabled but has no active key",
                    provider.id
                ));
            }
        }
        if self.bootstrap.logical_models.is_empty() {
            return Err(anyhow::anyhow!(
                "At least one logical model must be configured under [[bootstrap.logical_models]]"
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
                timeout: Duration::from_secs(30),
                max_body_size: 10 * 1024 * 1024,
                cors: CorsConfig {
                    enabled: true,
                    allowed_origins: vec!["*".to_string()],
                    allowed_methods: vec!["GET".to_string(), "POST".to_string()],
                    allowed_headers: vec!["*".to_string()],
                    max_age: Some(Duration::from_secs(3600)),
                },
            },
            gateway: GatewayConfig::default(),
            kv: KvConfig::default(),
            logging: LoggingConfig::default(),
            bootstrap: BootstrapConfig::default(),
        }
    }
}

pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    meridian_sdk::common::duration_serde::parse_duration(s)
}
