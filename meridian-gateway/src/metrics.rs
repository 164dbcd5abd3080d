//! Metrics & Dynamic Weights (C5).
//!
//! Samples are buffered in memory per minute bucket keyed by the full
//! dimension tuple (a `dashmap` of counters), then flushed to the `Store` on
//! a timer. The flusher also derives per-dimension `status` and nudges the
//! dynamic-weight KV entry. Latency percentiles come from a reservoir
//! sample taken at flush time rather than a running average.

use crate::domain::{RoutingCounters, RoutingMetricsWindow, RoutingStatus, Transport};
use crate::kv::{keys, KvStore, KvStoreExt};
use crate::store::Store;
use chrono::Timelike;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RESERVOIR_SIZE: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Success,
    Error4xx,
    Error5xx,
    Error429,
    Timeout,
    Canceled,
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub provider_id: String,
    pub logical_model: String,
    pub transport: Transport,
    pub is_stream: bool,
    pub user_id: Option<String>,
    pub caller_key_id: Option<String>,
    pub latency_ms: f64,
    pub outcome: Outcome,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// The provider's fixed, statically-configured weight — the clamp
    /// bounds in `update_dynamic_weight` always anchor to this, never to a
    /// previously-drifted dynamic value.
    pub base_weight: f64,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
struct DimKey {
    logical: u64,
    provider: u64,
    transport_stream: u8,
}

fn hash_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

#[derive(Default)]
struct AtomicCounters {
    success: AtomicU64,
    error: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    status_429: AtomicU64,
    timeout: AtomicU64,
}

impl AtomicCounters {
    fn snapshot(&self) -> RoutingCounters {
        RoutingCounters {
            success: self.success.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
            status_4xx: self.status_4xx.load(Ordering::Relaxed),
            status_5xx: self.status_5xx.load(Ordering::Relaxed),
            status_429: self.status_429.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
        }
    }
}

struct Bucket {
    logical_model: String,
    provider_id: String,
    transport: Transport,
    is_stream: bool,
    window_start: chrono::DateTime<chrono::Utc>,
    counters: AtomicCounters,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    reservoir: Mutex<Vec<f64>>,
    seen: AtomicU64,
    /// Static provider weight as observed on the bucket's first sample.
    /// Never updated afterwards — it's config, not a metric.
    base_weight: f64,
}

impl Bucket {
    fn new(
        logical_model: String,
        provider_id: String,
        transport: Transport,
        is_stream: bool,
        window_start: chrono::DateTime<chrono::Utc>,
        base_weight: f64,
    ) -> Self {
        Self {
            logical_model,
            provider_id,
            transport,
            is_stream,
            window_start,
            counters: AtomicCounters::default(),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            reservoir: Mutex::new(Vec::with_capacity(RESERVOIR_SIZE)),
            seen: AtomicU64::new(0),
            base_weight,
        }
    }
}

#[derive(Clone, Copy)]
pub struct DynamicWeightParams {
    pub learning_rate: f64,
    pub min_factor: f64,
    pub max_factor: f64,
}

impl Default for DynamicWeightParams {
    fn default() -> Self {
        Self { learning_rate: 0.5, min_factor: 5.0, max_factor: 3.0 }
    }
}

/// Per-minute, per-dimension aggregator plus the dynamic-weight feedback
/// loop. A single instance is shared across the process; counters are only
/// ever incremented (invariant 9), never decremented.
pub struct MetricsRegistry {
    buckets: DashMap<(DimKey, i64), Arc<Bucket>>,
    store: Arc<dyn Store>,
    kv: Arc<dyn KvStore>,
    success_sample_rate: f64,
    dyn_weight_params: DynamicWeightParams,
}

impl MetricsRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        kv: Arc<dyn KvStore>,
        success_sample_rate: f64,
        dyn_weight_params: DynamicWeightParams,
    ) -> Self {
        Self {
            buckets: DashMap::new(),
            store,
            kv,
            success_sample_rate,
            dyn_weight_params,
        }
    }

    /// Successes are subject to `success_sample_rate`; failures are always
    /// recorded in full.
    pub fn record_sample(&self, sample: Sample) {
        if matches!(sample.outcome, Outcome::Success)
            && self.success_sample_rate < 1.0
            && rand::thread_rng().gen::<f64>() > self.success_sample_rate
        {
            return;
        }

        let now = chrono::Utc::now();
        let window_start = now
            .date_naive()
            .and_hms_opt(now.hour(), now.minute(), 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(now);

        let dim = DimKey {
            logical: hash_str(&sample.logical_model),
            provider: hash_str(&sample.provider_id),
            transport_stream: ((sample.transport as u8) << 1) | (sample.is_stream as u8),
        };
        let bucket_key = (dim, window_start.timestamp());

        let bucket = self
            .buckets
            .entry(bucket_key)
            .or_insert_with(|| {
                Arc::new(Bucket::new(
                    sample.logical_model.clone(),
                    sample.provider_id.clone(),
                    sample.transport,
                    sample.is_stream,
                    window_start,
                    sample.base_weight,
                ))
            })
            .clone();

        match sample.outcome {
            Outcome::Success => {
                bucket.counters.success.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Error4xx => {
                bucket.counters.error.fetch_add(1, Ordering::Relaxed);
                bucket.counters.status_4xx.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Error5xx => {
                bucket.counters.error.fetch_add(1, Ordering::Relaxed);
                bucket.counters.status_5xx.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Error429 => {
                bucket.counters.error.fetch_add(1, Ordering::Relaxed);
                bucket.counters.status_429.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Timeout => {
                bucket.counters.error.fetch_add(1, Ordering::Relaxed);
                bucket.counters.timeout.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Canceled => {}
        }

        bucket.input_tokens.fetch_add(sample.input_tokens, Ordering::Relaxed);
        bucket.output_tokens.fetch_add(sample.output_tokens, Ordering::Relaxed);

        // Reservoir sampling (Algorithm R): first RESERVOIR_SIZE samples are
        // kept outright, later ones replace a uniformly random slot.
        let seen = bucket.seen.fetch_add(1, Ordering::Relaxed) + 1;
        let mut reservoir = bucket.reservoir.lock().unwrap();
        if reservoir.len() < RESERVOIR_SIZE {
            reservoir.push(sample.latency_ms);
        } else {
            let idx = rand::thread_rng().gen_range(0..seen as usize);
            if idx < RESERVOIR_SIZE {
                reservoir[idx] = sample.latency_ms;
            }
        }
    }

    /// Flush every in-memory bucket to the store, deriving `status` and
    /// nudging the dynamic weight. Call on a `flush_interval_seconds` timer.
    /// A single task should own this call — writes must be serialized per
    /// `(dimension, window_start)`.
    pub async fn flush(&self) {
        let snapshot: Vec<_> = self.buckets.iter().map(|e| (*e.key(), e.value().clone())).collect();
        for ((_, window_start), bucket) in snapshot {
            let mut reservoir = bucket.reservoir.lock().unwrap().clone();
            reservoir.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let pct = |p: f64| -> f64 {
                if reservoir.is_empty() {
                    0.0
                } else {
                    let idx = ((reservoir.len() as f64 - 1.0) * p).round() as usize;
                    reservoir[idx.min(reservoir.len() - 1)]
                }
            };
            let p50 = pct(0.50);
            let p95 = pct(0.95);
            let p99 = pct(0.99);

            let counters = bucket.counters.snapshot();
            let error_rate = counters.error_rate();
            let status = if error_rate > 0.5 {
                RoutingStatus::Down
            } else if error_rate > 0.1 || p95 > 2000.0 {
                RoutingStatus::Degraded
            } else {
                RoutingStatus::Healthy
            };

            let window = RoutingMetricsWindow {
                logical_model: bucket.logical_model.clone(),
                provider_id: bucket.provider_id.clone(),
                transport: bucket.transport,
                is_stream: bucket.is_stream,
                user_id: None,
                caller_key_id: None,
                window_start: chrono::DateTime::from_timestamp(window_start, 0).unwrap_or(bucket.window_start),
                window_seconds: 60,
                counters,
                latency_p50_ms: p50,
                latency_p95_ms: p95,
                latency_p99_ms: p99,
                input_tokens: bucket.input_tokens.load(Ordering::Relaxed),
                output_tokens: bucket.output_tokens.load(Ordering::Relaxed),
                status,
            };

            if let Err(e) = self.store.upsert_routing_metrics(window.clone()).await {
                tracing::warn!(error = %e, "failed to flush routing metrics window");
                continue;
            }

            self.update_dynamic_weight(&window, error_rate, p95, bucket.base_weight).await;
        }
    }

    /// `w' <- clamp(w + delta*learning_rate, base/min_factor, base*max_factor)`,
    /// where `base` is always the provider's fixed, statically-configured
    /// weight — never the previous tick's `w`. Seeded from `base_weight` on
    /// first observation, never deleted, always replaced. Anchoring the
    /// clamp to a drifting `w` instead of the static `base` would let the
    /// bounds themselves walk toward zero over repeated unfavorable ticks.
    async fn update_dynamic_weight(&self, window: &RoutingMetricsWindow, error_rate: f64, p95: f64, base_weight: f64) {
        let entry_key = format!("{}:{}", keys::routing_weights(&window.logical_model), window.provider_id);
        let current: f64 = self
            .kv
            .get_raw(&entry_key)
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(base_weight);

        let norm_lat = (p95 / 4000.0).clamp(0.0, 1.0);
        let delta = -error_rate - norm_lat * 0.5;

        let min = base_weight / self.dyn_weight_params.min_factor;
        let max = base_weight * self.dyn_weight_params.max_factor;
        let updated = (current + delta * self.dyn_weight_params.learning_rate).clamp(min, max);

        let _ = self.kv.set_raw(&entry_key, updated.to_string(), None).await;
    }

    pub async fn get_dynamic_weight(&self, logical_model: &str, provider_id: &str) -> Option<f64> {
        let key = format!("{}:{}", keys::routing_weights(logical_model), provider_id);
        self.kv.get_raw(&key).await.ok().flatten().and_then(|v| v.parse().ok())
    }

    pub async fn get_window(&self, logical_model: &str, provider_id: &str) -> Option<RoutingMetricsWindow> {
        self.store
            .get_routing_metrics(logical_model, provider_id)
            .await
            .ok()
            .and_then(|mut v| v.pop())
    }
}

pub fn spawn_flush_loop(metrics: Arc<MetricsRegistry>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            metrics.flush().await;
        }
    })
}
