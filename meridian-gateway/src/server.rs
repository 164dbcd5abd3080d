//! # HTTP Server Module
//!
//! Server initialization, router construction, and application state for the
//! request-time routing/proxying pipeline (C1-C11).
//!
//! ## Architecture
//!
//! `create_server` wires the full dependency graph in one place: it builds
//! the `Store`/`KvStore` backends from `config.kv`, seeds the store from
//! `config.bootstrap`, constructs each pipeline component (registry,
//! resolver, key pool, health monitor, metrics registry, session store,
//! credit meter, proxy engine) and assembles them into an `Orchestrator`,
//! then spawns the health-probe and metrics-flush background loops before
//! returning the router.
//!
//! ## API Endpoints
//!
//! - `POST /v1/chat/completions` - OpenAI-compatible chat completions
//! - `POST /v1/messages` - Anthropic Messages API
//! - `POST /v1/responses` - OpenAI Responses API
//! - `GET /v1/models` - Union of visible providers' model catalogs
//! - `GET /health` - Liveness check

use crate::config::{Config, KvBackend};
use crate::credit::CreditMeter;
use crate::handlers;
use crate::health::HealthMonitor;
use crate::keypool::KeyPool;
use crate::kv::{keys, InMemoryKv, KvStore, KvStoreExt, RedisKv};
use crate::metrics::{self, MetricsRegistry};
use crate::orchestrator::Orchestrator;
use crate::proxy::ProxyEngine;
use crate::registry::ProviderRegistry;
use crate::resolver::LogicalModelResolver;
use crate::session::SessionStore;
use crate::store::{InMemoryStore, Store};
use axum::http::{header::HeaderValue, Method};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Builds the `KvStore` backend configured by `config.kv.backend`: an
/// in-memory map for single-process/dev deployments, Redis otherwise.
fn build_kv(config: &Config) -> anyhow::Result<Arc<dyn KvStore>> {
    match &config.kv.backend {
        KvBackend::Memory => Ok(InMemoryKv::new()),
        KvBackend::Redis { url } => {
            let kv = RedisKv::new(url)?;
            Ok(Arc::new(kv))
        }
    }
}

/// Publishes `config.bootstrap.logical_models` into KV under their static
/// `logical_model:<id>` keys ( step 1, "static lookup"), with no TTL —
/// unlike the resolver's own 30s synthesis cache, statically configured
/// logical models never expire on their own.
async fn seed_logical_models(kv: &Arc<dyn KvStore>, config: &Config) -> anyhow::Result<()> {
    for model in &config.bootstrap.logical_models {
        kv.set(&keys::logical_model(&model.id), model, None).await?;
    }
    Ok(())
}

/// Seeds a fresh `InMemoryStore` from `config.bootstrap`. A real deployment
/// points `Store` at an already-populated RDBMS instead of calling this.
fn seed_store(config: &Config) -> Arc<InMemoryStore> {
    let store = InMemoryStore::new();
    for provider in config.bootstrap.providers.clone() {
        store.seed_provider(provider);
    }
    for model in config.bootstrap.provider_models.clone() {
        store.seed_provider_model(model);
    }
    for key in config.bootstrap.caller_keys.clone() {
        store.seed_caller_key(key);
    }
    for account in config.bootstrap.credit_accounts.clone() {
        store.seed_credit_account(account);
    }
    for billing in config.bootstrap.billing_configs.clone() {
        store.seed_billing_config(billing);
    }
    store
}

fn cors_layer(cors_config: &crate::config::CorsConfig) -> CorsLayer {
    if !cors_config.enabled {
        return CorsLayer::new();
    }

    let mut cors = CorsLayer::new();

    if cors_config.allowed_origins.iter().any(|o| o == "*") {
        cors = cors.allow_origin(Any);
    } else {
        let origins: Vec<HeaderValue> = cors_config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors = cors.allow_origin(origins);
    }

    if cors_config.allowed_methods.iter().any(|m| m == "*") {
        cors = cors.allow_methods(Any);
    } else {
        let methods: Vec<Method> = cors_config
            .allowed_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        cors = cors.allow_methods(methods);
    }

    cors = cors.allow_headers(Any);

    if let Some(max_age) = cors_config.max_age {
        cors = cors.max_age(max_age);
    }

    cors
}

/// Create and configure the HTTP server: builds the full C1-C11 pipeline
/// from `config`, spawns its background loops, and returns the router.
pub async fn create_server(config: Config) -> anyhow::Result<Router> {
    if config.server.cors.enabled && config.server.cors.allowed_origins.iter().any(|o| o == "*") {
        tracing::warn!(
            "CORS is enabled with wildcard origins. This is unsafe for production. Configure explicit allowed_origins."
        );
    }

    let kv = build_kv(&config)?;
    let store: Arc<dyn Store> = seed_store(&config);
    seed_logical_models(&kv, &config).await?;

    let registry = Arc::new(ProviderRegistry::new(store.clone()));
    registry.reload().await?;

    let resolver = Arc::new(LogicalModelResolver::new(store.clone(), kv.clone()));

    let health_config: crate::health::HealthMonitorConfig = config.gateway.health.clone().into();
    let health = Arc::new(HealthMonitor::new(
        registry.clone(),
        store.clone(),
        kv.clone(),
        health_config,
    ));

    let dyn_weight_params = config.gateway.metrics.dynamic_weight_params();
    let metrics_registry = Arc::new(MetricsRegistry::new(
        store.clone(),
        kv.clone(),
        config.gateway.metrics.success_sample_rate,
        dyn_weight_params,
    ));

    let sessions = Arc::new(SessionStore::new(kv.clone(), config.gateway.session_ttl));

    let credit_config: crate::credit::CreditConfig = config.gateway.credit.into();
    let credit = Arc::new(CreditMeter::new(store.clone(), credit_config));

    let keypool_config: crate::keypool::KeyPoolConfig = config.gateway.keypool.clone().into();
    let keypool = Arc::new(KeyPool::new(kv.clone(), keypool_config));

    let proxy = Arc::new(ProxyEngine::new(
        keypool,
        metrics_registry.clone(),
        credit.clone(),
        config.gateway.upstream_timeout,
        config.gateway.max_retries,
    ));

    let strategy: crate::scheduler::SchedulerStrategy = config.gateway.scheduler.into();

    let orchestrator = Arc::new(Orchestrator {
        registry: registry.clone(),
        resolver,
        health: health.clone(),
        metrics: metrics_registry.clone(),
        sessions,
        credit,
        proxy,
        store,
        strategy,
    });

    // Background loops: periodic health probing and metrics-bucket flush,
    // each spawned as its own ticker-driven task.
    let probe_health = health.clone();
    let health_interval = config.gateway.health.health_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(health_interval);
        loop {
            ticker.tick().await;
            probe_health.probe_all().await;
        }
    });
    metrics::spawn_flush_loop(metrics_registry, std::time::Duration::from_secs(60));

    let state = AppState { orchestrator };

    let app = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/messages", post(handlers::messages))
        .route("/v1/responses", post(handlers::responses))
        .route("/v1/models", get(handlers::list_models))
        .route("/health", get(handlers::health_check))
        .layer(
            ServiceBuilder::new()
                .layer(cors_layer(&config.server.cors))
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(config.server.timeout)),
        )
        .with_state(state);

    Ok(app)
}
