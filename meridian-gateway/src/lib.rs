//! # Meridian Gateway Library
//!
//! A multi-tenant LLM API gateway: request-time routing and proxying across
//! provider keys and physical models for a caller-facing logical model,
//! speaking OpenAI, Claude, and OpenAI Responses wire dialects over both
//! unary and streaming (SSE) transports.
//!
//! ## Architecture
//!
//! The pipeline is composed of eleven cooperating components, each its own
//! module:
//!
//! - **`domain`**: shared value types (providers, keys, models, sessions,
//!   credit ledger, health, candidates)
//! - **`registry`** (C1): provider registry, lock-free versioned snapshot
//! - **`resolver`** (C2): logical-model resolution, static + synthesized
//! - **`keypool`** (C3): weighted key selection, QPS and failure cooldowns
//! - **`health`** (C4): periodic provider probing, KV + DB publication
//! - **`metrics`** (C5): minute-bucket aggregation, dynamic weight feedback
//! - **`scheduler`** (C6): candidate scoring, stickiness, weighted selection
//! - **`adapters`** (C7): OpenAI/Claude/Responses unary + SSE translation
//! - **`proxy`** (C8): execution loop, HTTP/SDK dispatch, failover
//! - **`session`** (C9): conversation stickiness store
//! - **`credit`** (C10): idempotent usage metering
//! - **`orchestrator`** (C11): per-request composition of the above
//!
//! Around that core: `store`/`kv` are the trait boundaries to the system of
//! record and the ephemeral KV, `error` is the shared error taxonomy,
//! `config` loads and validates settings plus bootstrap seed data, and
//! `server`/`handlers` wire everything into an Axum application.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meridian_gateway::{config::Config, server::create_server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml")?;
//!     config.validate()?;
//!     let app = create_server(config).await?;
//!     let listener = tokio::net::TcpListener::bind(("127.0.0.1", 3000)).await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## License
//!
//! This project is licensed under either of
//!
//! * Apache License, Version 2.0, ([LICENSE-APACHE](LICENSE-APACHE) or https://www.apache.org/licenses/LICENSE-2.0)
//! * MIT license ([LICENSE-MIT](LICENSE-MIT) or https://opensource.org/licenses/MIT)
//!
//! at your option.

pub mod adapters;
pub mod config;
pub mod credit;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod health;
pub mod keypool;
pub mod kv;
pub mod metrics;
pub mod orchestrator;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod store;

pub use server::create_server;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::domain::{ApiStyle, CallerApiKey, KeyStatus, LogicalModel, PhysicalModel, ProviderApiKey, ProviderConfig, Transport, Visibility};
    use axum::http::StatusCode;
    use axum_test::TestServer;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.bootstrap.providers.push(ProviderConfig {
            id: "mock".to_string(),
            name: "Mock".to_string(),
            base_url: "https://example.invalid".to_string(),
            transport: Transport::Http,
            sdk_vendor: None,
            models_path: "/v1/models".to_string(),
            messages_path: "/v1/messages".to_string(),
            chat_completions_path: "/v1/chat/completions".to_string(),
            responses_path: "/v1/responses".to_string(),
            supported_styles: vec![ApiStyle::Openai],
            retryable_status_codes: vec![],
            custom_headers: Default::default(),
            region: None,
            cost_per_1k_input: 0.0,
            cost_per_1k_output: 0.0,
            max_qps: None,
            keys: vec![ProviderApiKey {
                id: "key-1".to_string(),
                key_ciphertext: "sk-test".to_string(),
                weight: 1.0,
                max_qps: None,
                label: "primary".to_string(),
                status: KeyStatus::Active,
            }],
            static_models: None,
            visibility: Visibility::Public,
            owner: None,
            shared_users: vec![],
            enabled: true,
            billing_factor: 1.0,
        });
        config.bootstrap.logical_models.push(LogicalModel {
            id: "test-model".to_string(),
            display_name: "Test Model".to_string(),
            capabilities: vec![],
            upstreams: vec![PhysicalModel {
                provider_id: "mock".to_string(),
                model_id: "mock-1".to_string(),
                endpoint: "chat_completions".to_string(),
                api_style: ApiStyle::Openai,
                base_weight: 1.0,
                region: None,
                max_qps: None,
                meta_hash: "h1".to_string(),
                disabled: false,
            }],
            enabled: true,
        });
        config.bootstrap.caller_keys.push(CallerApiKey {
            id: "caller-1".to_string(),
            key_hash: {
                use sha2::{Digest, Sha256};
                let mut hasher = Sha256::new();
                hasher.update(b"test-token");
                format!("{:x}", hasher.finalize())
            },
            user_id: "user-1".to_string(),
            active: true,
            allowed_provider_ids: None,
            expires_at: None,
        });
        config
    }

    #[tokio::test]
    async fn test_health_check() {
        let config = test_config();
        let app = create_server(config).await.unwrap();
        let server = TestServer::new(app).unwrap();
        let response = server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body = response.json::<serde_json::Value>();
        assert_eq!(body["status"], "healthy");
        assert!(body["timestamp"].is_string());
        assert!(body["version"].is_string());
    }

    #[tokio::test]
    async fn test_models_requires_auth() {
        let config = test_config();
        let app = create_server(config).await.unwrap();
        let server = TestServer::new(app).unwrap();
        let response = server.get("/v1/models").await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_models_lists_enabled_catalog() {
        let config = test_config();
        let app = create_server(config).await.unwrap();
        let server = TestServer::new(app).unwrap();
        let response = server
            .get("/v1/models")
            .add_header(axum::http::header::AUTHORIZATION, "Bearer test-token".parse().unwrap())
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_config_validation() {
        let mut config = test_config();
        assert!(config.validate().is_ok());

        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_duration_parsing() {
        use std::time::Duration;

        let duration = crate::config::parse_duration("30s").unwrap();
        assert_eq!(duration, Duration::from_secs(30));

        let duration = crate::config::parse_duration("1m").unwrap();
        assert_eq!(duration, Duration::from_secs(60));

        let duration = crate::config::parse_duration("2h").unwrap();
        assert_eq!(duration, Duration::from_secs(7200));

        let duration = crate::config::parse_duration("500ms").unwrap();
        assert_eq!(duration, Duration::from_millis(500));

        assert!(crate::config::parse_duration("").is_err());
        assert!(crate::config::parse_duration("30x").is_err());
        assert!(crate::config::parse_duration("abc").is_err());
    }

    #[tokio::test]
    async fn test_environment_overrides() {
        let mut config = test_config();

        std::env::set_var("GATEWAY_HOST", "0.0.0.0");
        std::env::set_var("GATEWAY_PORT", "8080");
        std::env::set_var("GATEWAY_TIMEOUT", "60s");
        std::env::set_var("GATEWAY_LOG_LEVEL", "debug");

        config.apply_env_overrides().unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.timeout.as_secs(), 60);
        assert_eq!(config.logging.level, "debug");

        std::env::remove_var("GATEWAY_HOST");
        std::env::remove_var("GATEWAY_PORT");
        std::env::remove_var("GATEWAY_TIMEOUT");
        std::env::remove_var("GATEWAY_LOG_LEVEL");
    }
}
