use criterion::{black_box, criterion_group, criterion_main, Criterion};
use meridian_gateway::domain::{
    ApiStyle, Candidate, HealthState, PhysicalModel, ProviderConfig, RoutingCounters,
    RoutingMetricsWindow, RoutingStatus, Transport, Visibility,
};
use meridian_gateway::scheduler::{choose, SchedulerStrategy};

fn candidate(provider_id: &str, base_weight: f64, health: HealthState, errors: u64) -> Candidate {
    Candidate {
        provider: ProviderConfig {
            id: provider_id.to_string(),
            name: provider_id.to_string(),
            base_url: "https://x".to_string(),
            transport: Transport::Http,
            sdk_vendor: None,
            models_path: "/models".to_string(),
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
            keys: vec![],
            static_models: None,
            visibility: Visibility::Public,
            owner: None,
            shared_users: vec![],
            enabled: true,
            billing_factor: 1.0,
        },
        physical: PhysicalModel {
            provider_id: provider_id.to_string(),
            model_id: "m1".to_string(),
            endpoint: "/v1/chat/completions".to_string(),
            api_style: ApiStyle::Openai,
            base_weight,
            region: None,
            max_qps: None,
            meta_hash: "h".to_string(),
            disabled: false,
        },
        health,
        dynamic_weight: None,
        metrics: Some(RoutingMetricsWindow {
            logical_model: "gpt-4".to_string(),
            provider_id: provider_id.to_string(),
            transport: Transport::Http,
            is_stream: false,
            user_id: None,
            caller_key_id: None,
            window_start: chrono::Utc::now(),
            window_seconds: 60,
            counters: RoutingCounters {
                success: 100,
                error: errors,
                status_4xx: 0,
                status_5xx: errors,
                status_429: 0,
                timeout: 0,
            },
            latency_p50_ms: 120.0,
            latency_p95_ms: 420.0,
            latency_p99_ms: 900.0,
            input_tokens: 5_000,
            output_tokens: 2_000,
            status: RoutingStatus::Healthy,
        }),
    }
}

fn candidate_pool(n: usize) -> Vec<Candidate> {
    (0..n)
        .map(|i| {
            let health = match i % 4 {
                0 => HealthState::Healthy,
                1 => HealthState::Degraded,
                2 => HealthState::Unknown,
                _ => HealthState::Healthy,
            };
            candidate(&format!("provider-{i}"), 1.0 + (i as f64 % 5.0), health, (i % 10) as u64)
        })
        .collect()
}

fn bench_choose_small_pool(c: &mut Criterion) {
    let strategy = SchedulerStrategy::default();
    c.bench_function("scheduler_choose_4_candidates", |b| {
        b.iter(|| {
            let candidates = candidate_pool(4);
            black_box(choose(candidates, &strategy, None))
        });
    });
}

fn bench_choose_large_pool(c: &mut Criterion) {
    let strategy = SchedulerStrategy::default();
    c.bench_function("scheduler_choose_64_candidates", |b| {
        b.iter(|| {
            let candidates = candidate_pool(64);
            black_box(choose(candidates, &strategy, None))
        });
    });
}

criterion_group!(benches, bench_choose_small_pool, bench_choose_large_pool);
criterion_main!(benches);
