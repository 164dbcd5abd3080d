//! Upstream Proxy Engine (C8). Drives the ordered candidate
//! list the scheduler hands back, acquiring a key, dispatching over HTTP or
//! an SDK vendor adapter, and failing over on retryable errors across both
//! transports.

use crate::adapters::sse::SseTranslator;
use crate::adapters::unary::{translate_request, translate_unary_response};
use crate::credit::CreditMeter;
use crate::domain::{ApiStyle, Candidate, Transport};
use crate::error::GatewayError;
use crate::keypool::KeyPool;
use crate::metrics::{MetricsRegistry, Outcome, Sample};
use axum::body::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct ProxyEngine {
    http: reqwest::Client,
    keypool: Arc<KeyPool>,
    metrics: Arc<MetricsRegistry>,
    credit: Arc<CreditMeter>,
    upstream_timeout: Duration,
    max_retries: usize,
}

pub enum ProxyOutcome {
    Unary { body: Value, input_tokens: u64, output_tokens: u64 },
    Stream(Pin<Box<dyn Stream<Item = Bytes> + Send>>),
}

type UpstreamChunk = Result<Bytes, ()>;

struct RequestCtx<'a> {
    body: &'a Value,
    caller_style: ApiStyle,
    is_stream: bool,
    user_id: Option<String>,
    caller_key_id: Option<String>,
    idempotency_key: String,
    max_tokens: Option<u32>,
    prompt_chars: usize,
}

impl ProxyEngine {
    pub fn new(
        keypool: Arc<KeyPool>,
        metrics: Arc<MetricsRegistry>,
        credit: Arc<CreditMeter>,
        upstream_timeout: Duration,
        max_retries: usize,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            keypool,
            metrics,
            credit,
            upstream_timeout,
            max_retries,
        }
    }

    /// Iterates `ordered` until one candidate serves the request or the
    /// retry budget (`max_retries`, defaulting to the candidate count) is
    /// exhausted.
    pub async fn execute(
        &self,
        ordered: Vec<Candidate>,
        logical_model: &str,
        body: &Value,
        caller_style: ApiStyle,
        user_id: Option<String>,
        caller_key_id: Option<String>,
        idempotency_key: String,
    ) -> Result<(ProxyOutcome, String, String, f64), GatewayError> {
        let is_stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
        let max_tokens = extract_max_tokens(body);
        let prompt_chars = estimate_prompt_chars(body);
        let ctx = RequestCtx {
            body,
            caller_style,
            is_stream,
            user_id,
            caller_key_id,
            idempotency_key,
            max_tokens,
            prompt_chars,
        };
        let cap = if self.max_retries == 0 { ordered.len() } else { self.max_retries.min(ordered.len()) };

        let mut attempted_any = false;
        let mut all_rate_limited = true;
        let mut min_retry_after: Option<u64> = None;

        for candidate in ordered.into_iter().take(cap) {
            attempted_any = true;
            match self.try_one(&candidate, logical_model, &ctx).await {
                Ok(outcome) => {
                    return Ok((
                        outcome,
                        candidate.provider.id.clone(),
                        candidate.physical.model_id.clone(),
                        candidate.provider.billing_factor,
                    ));
                }
                Err(AttemptError::RateLimited { retry_after_secs }) => {
                    min_retry_after = Some(min_retry_after.map_or(retry_after_secs, |m| m.min(retry_after_secs)));
                }
                Err(AttemptError::Retryable) => {
                    all_rate_limited = false;
                }
                Err(AttemptError::Terminal(e)) => return Err(e),
            }
        }

        // SPEC_FULL.md's boundary behavior: if every attempted candidate was
        // only unavailable due to key/provider cooldown or QPS pressure
        // (never a structural or upstream failure), surface 429 with a
        // `Retry-After` floor of the soonest cooldown to clear, rather than
        // the blanket 503 used when candidates are genuinely down.
        if attempted_any && all_rate_limited {
            if let Some(retry_after_secs) = min_retry_after {
                return Err(GatewayError::AllProvidersRateLimited { retry_after_secs });
            }
        }

        Err(GatewayError::AllProvidersDown)
    }

    async fn try_one(
        &self,
        candidate: &Candidate,
        logical_model: &str,
        ctx: &RequestCtx<'_>,
    ) -> Result<ProxyOutcome, AttemptError> {
        let selection = match self.keypool.acquire(&candidate.provider).await {
            Ok(selection) => selection,
            Err(crate::keypool::KeyPoolError::NoActiveKeys) => return Err(AttemptError::Retryable),
            Err(crate::keypool::KeyPoolError::RateLimited { retry_after_secs }) => {
                return Err(AttemptError::RateLimited { retry_after_secs })
            }
        };

        let adapted_body = translate_request(ctx.body, ctx.caller_style, candidate.physical.api_style);
        let start = Instant::now();

        let result = if matches!(candidate.provider.transport, Transport::Sdk | Transport::ClaudeCli) {
            self.dispatch_sdk(candidate, &selection.plaintext, &adapted_body, ctx.is_stream).await
        } else {
            self.dispatch_http(candidate, &selection.plaintext, &adapted_body, ctx.is_stream).await
        };

        match result {
            Ok(Dispatch::Unary { body: resp_body, status }) => {
                self.keypool.record_success(&selection).await;
                let translated = translate_unary_response(&resp_body, candidate.physical.api_style, ctx.caller_style);
                let (input_tokens, output_tokens) = extract_usage(&resp_body, candidate.physical.api_style);
                self.metrics.record_sample(Sample {
                    provider_id: candidate.provider.id.clone(),
                    logical_model: logical_model.to_string(),
                    transport: candidate.provider.transport,
                    is_stream: false,
                    user_id: ctx.user_id.clone(),
                    caller_key_id: ctx.caller_key_id.clone(),
                    latency_ms: start.elapsed().as_millis() as f64,
                    outcome: Outcome::Success,
                    input_tokens,
                    output_tokens,
                    base_weight: candidate.physical.base_weight,
                });
                let _ = status;
                Ok(ProxyOutcome::Unary { body: translated, input_tokens, output_tokens })
            }
            Ok(Dispatch::Stream(upstream)) => {
                self.keypool.record_success(&selection).await;
                let translator = SseTranslator::new(candidate.physical.api_style, ctx.caller_style, candidate.physical.model_id.clone());
                let settlement = StreamSettlement {
                    metrics: self.metrics.clone(),
                    credit: self.credit.clone(),
                    logical_model: logical_model.to_string(),
                    provider_id: candidate.provider.id.clone(),
                    billing_factor: candidate.provider.billing_factor,
                    transport: candidate.provider.transport,
                    user_id: ctx.user_id.clone(),
                    caller_key_id: ctx.caller_key_id.clone(),
                    idempotency_key: ctx.idempotency_key.clone(),
                    max_tokens: ctx.max_tokens,
                    prompt_chars: ctx.prompt_chars,
                    base_weight: candidate.physical.base_weight,
                };
                let stream = translate_stream(upstream, translator, settlement);
                Ok(ProxyOutcome::Stream(Box::pin(stream)))
            }
            Err(DispatchError::Network) => {
                self.keypool.record_failure(&selection, true, None).await;
                self.metrics.record_sample(failure_sample(candidate, logical_model, ctx, Outcome::Timeout, start));
                Err(AttemptError::Retryable)
            }
            Err(DispatchError::Status(status, body)) => {
                let retryable = candidate.provider.retryable(status);
                self.keypool.record_failure(&selection, retryable, Some(status)).await;
                let outcome = classify(status);
                self.metrics.record_sample(failure_sample(candidate, logical_model, ctx, outcome, start));
                if retryable {
                    Err(AttemptError::Retryable)
                } else {
                    let translated = translate_unary_response(&body, candidate.physical.api_style, ctx.caller_style);
                    Err(AttemptError::Terminal(GatewayError::UpstreamTerminal {
                        status,
                        body: translated.to_string(),
                    }))
                }
            }
        }
    }

    async fn dispatch_http(
        &self,
        candidate: &Candidate,
        api_key: &str,
        body: &Value,
        is_stream: bool,
    ) -> Result<Dispatch, DispatchError> {
        let path = match candidate.physical.api_style {
            ApiStyle::Openai => &candidate.provider.chat_completions_path,
            ApiStyle::Claude => &candidate.provider.messages_path,
            ApiStyle::Responses => &candidate.provider.responses_path,
        };
        let url = format!("{}{}", candidate.provider.base_url, path);

        let mut req = self
            .http
            .post(&url)
            .timeout(self.upstream_timeout)
            .bearer_auth(api_key)
            .header(
                "Accept",
                if is_stream { "text/event-stream" } else { "application/json" },
            )
            .json(body);
        for (k, v) in &candidate.provider.custom_headers {
            req = req.header(k, v);
        }

        let resp = req.send().await.map_err(|_| DispatchError::Network)?;
        let status = resp.status().as_u16();

        if is_stream && status < 400 {
            let byte_stream = resp.bytes_stream().map(|r| r.map_err(|_| ()));
            return Ok(Dispatch::Stream(Box::pin(byte_stream)));
        }

        let bytes = resp.bytes().await.map_err(|_| DispatchError::Network)?;
        let parsed: Value = serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        if status >= 400 {
            return Err(DispatchError::Status(status, parsed));
        }
        Ok(Dispatch::Unary { body: parsed, status })
    }

    /// SDK transport: dispatches to a vendor adapter. The vendor
    /// adapter speaks its own `ChatRequest`/`ChatResponse` shape; we bridge
    /// through the OpenAI-style canonical JSON both sides already agree on.
    /// `claude_cli` providers have no registered vendor name of their own —
    /// they speak the Anthropic wire format through a local CLI shim — so
    /// they dispatch through the `anthropic` adapter unless the provider
    /// config overrides `sdk_vendor` explicitly.
    async fn dispatch_sdk(&self, candidate: &Candidate, api_key: &str, body: &Value, is_stream: bool) -> Result<Dispatch, DispatchError> {
        let default_vendor = if matches!(candidate.provider.transport, Transport::ClaudeCli) {
            "anthropic"
        } else {
            "openai"
        };
        let vendor = candidate.provider.sdk_vendor.as_deref().unwrap_or(default_vendor);
        let config = meridian_sdk::providers::ProviderConfig::new(vendor, api_key)
            .with_base_url(candidate.provider.base_url.clone())
            .with_timeout(self.upstream_timeout);
        let provider = meridian_sdk::providers::create_provider(config).map_err(|_| DispatchError::Network)?;
        let request: meridian_sdk::models::ChatRequest =
            serde_json::from_value(body.clone()).map_err(|_| DispatchError::Network)?;

        if is_stream {
            let mut stream = provider.stream_chat_completion(request).await.map_err(|_| DispatchError::Network)?;
            let byte_stream = async_stream::stream! {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(c) => {
                            if let Ok(json) = serde_json::to_string(&c) {
                                yield Ok(Bytes::from(format!("data: {json}\n\n")));
                            }
                        }
                        Err(_) => {
                            yield Err(());
                            break;
                        }
                    }
                }
            };
            return Ok(Dispatch::Stream(Box::pin(byte_stream)));
        }

        let response = provider.chat_completion(request).await.map_err(|_| DispatchError::Network)?;
        let value = serde_json::to_value(response).map_err(|_| DispatchError::Network)?;
        Ok(Dispatch::Unary { body: value, status: 200 })
    }
}

enum Dispatch {
    Unary { body: Value, status: u16 },
    Stream(Pin<Box<dyn Stream<Item = UpstreamChunk> + Send>>),
}

enum DispatchError {
    Network,
    Status(u16, Value),
}

enum AttemptError {
    Retryable,
    RateLimited { retry_after_secs: u64 },
    Terminal(GatewayError),
}

fn classify(status: u16) -> Outcome {
    match status {
        429 => Outcome::Error429,
        400..=499 => Outcome::Error4xx,
        _ => Outcome::Error5xx,
    }
}

fn failure_sample(candidate: &Candidate, logical_model: &str, ctx: &RequestCtx<'_>, outcome: Outcome, start: Instant) -> Sample {
    Sample {
        provider_id: candidate.provider.id.clone(),
        logical_model: logical_model.to_string(),
        transport: candidate.provider.transport,
        is_stream: ctx.is_stream,
        user_id: ctx.user_id.clone(),
        caller_key_id: ctx.caller_key_id.clone(),
        latency_ms: start.elapsed().as_millis() as f64,
        outcome,
        input_tokens: 0,
        output_tokens: 0,
        base_weight: candidate.physical.base_weight,
    }
}

fn extract_usage(body: &Value, style: ApiStyle) -> (u64, u64) {
    match style {
        ApiStyle::Openai => (
            body.get("usage").and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
            body.get("usage").and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
        ),
        ApiStyle::Claude | ApiStyle::Responses => (
            body.get("usage").and_then(|u| u.get("input_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
            body.get("usage").and_then(|u| u.get("output_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
        ),
    }
}

/// Everything `C5.record_sample`/`C10.settle` need once a stream finishes,
/// captured at dispatch time since the upstream candidate and request
/// context are no longer reachable once the byte stream is handed to axum.
struct StreamSettlement {
    metrics: Arc<MetricsRegistry>,
    credit: Arc<CreditMeter>,
    logical_model: String,
    provider_id: String,
    billing_factor: f64,
    transport: Transport,
    user_id: Option<String>,
    caller_key_id: Option<String>,
    idempotency_key: String,
    max_tokens: Option<u32>,
    prompt_chars: usize,
    base_weight: f64,
}

/// Guarantees end-of-stream accounting runs exactly once, however the
/// stream ends. `complete` is called from inside the generator on a clean
/// finish/abort; `Drop` covers the remaining case — the caller disconnects
/// and axum drops the stream mid-iteration — by recording a `Canceled`
/// sample with no credit settlement (no ledger row is written since
/// precharge is not enabled here, matching §4.10(b)/§5 cancellation policy).
struct StreamSettlementGuard {
    settlement: Option<StreamSettlement>,
    start: Instant,
}

impl StreamSettlementGuard {
    fn new(settlement: StreamSettlement) -> Self {
        Self { settlement: Some(settlement), start: Instant::now() }
    }

    async fn complete(&mut self, outcome: Outcome) {
        let Some(s) = self.settlement.take() else { return };
        let latency_ms = self.start.elapsed().as_millis() as f64;
        let total_tokens = if matches!(outcome, Outcome::Success) {
            CreditMeter::approximate_tokens(s.max_tokens, s.prompt_chars)
        } else {
            0
        };
        let input_tokens = total_tokens / 2;
        let output_tokens = total_tokens - input_tokens;
        s.metrics.record_sample(Sample {
            provider_id: s.provider_id.clone(),
            logical_model: s.logical_model.clone(),
            transport: s.transport,
            is_stream: true,
            user_id: s.user_id.clone(),
            caller_key_id: s.caller_key_id.clone(),
            latency_ms,
            outcome,
            input_tokens,
            output_tokens,
            base_weight: s.base_weight,
        });
        if matches!(outcome, Outcome::Success) {
            let _ = s
                .credit
                .settle(&s.idempotency_key, s.user_id.as_deref().unwrap_or(""), &s.logical_model, &s.provider_id, s.billing_factor, total_tokens)
                .await;
        }
    }
}

impl Drop for StreamSettlementGuard {
    fn drop(&mut self) {
        if let Some(s) = self.settlement.take() {
            s.metrics.record_sample(Sample {
                provider_id: s.provider_id,
                logical_model: s.logical_model,
                transport: s.transport,
                is_stream: true,
                user_id: s.user_id,
                caller_key_id: s.caller_key_id,
                latency_ms: self.start.elapsed().as_millis() as f64,
                outcome: Outcome::Canceled,
                input_tokens: 0,
                output_tokens: 0,
                base_weight: s.base_weight,
            });
        }
    }
}

fn extract_max_tokens(body: &Value) -> Option<u32> {
    body.get("max_tokens")
        .or_else(|| body.get("max_completion_tokens"))
        .or_else(|| body.get("max_tokens_to_sample"))
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
}

/// Cheap proxy for input size used only to seed `approximate_tokens` when
/// the upstream never returns a usage block; not a tokenizer.
fn estimate_prompt_chars(body: &Value) -> usize {
    fn walk(value: &Value, total: &mut usize) {
        match value {
            Value::String(s) => *total += s.len(),
            Value::Array(items) => items.iter().for_each(|v| walk(v, total)),
            Value::Object(map) => map.values().for_each(|v| walk(v, total)),
            _ => {}
        }
    }
    let mut total = 0;
    if let Some(messages) = body.get("messages") {
        walk(messages, &mut total);
    }
    if let Some(input) = body.get("input") {
        walk(input, &mut total);
    }
    total
}

/// Wraps the raw upstream byte stream in the SSE translator. Once the first
/// byte has been forwarded, failover is no longer possible, so a transport
/// error here ends the stream with one translated error frame rather than a
/// retry; an upstream-declared `error` event is instead handled inside
/// `translator.feed` and never reaches this match arm.
fn translate_stream(
    mut upstream: Pin<Box<dyn Stream<Item = UpstreamChunk> + Send>>,
    mut translator: SseTranslator,
    settlement: StreamSettlement,
) -> impl Stream<Item = Bytes> {
    async_stream::stream! {
        let mut guard = StreamSettlementGuard::new(settlement);
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    for frame in translator.feed(&bytes) {
                        yield Bytes::from(frame);
                    }
                    if translator.is_done() {
                        guard.complete(Outcome::Success).await;
                        return;
                    }
                }
                Err(()) => {
                    for frame in translator.abort("upstream connection failed") {
                        yield Bytes::from(frame);
                    }
                    guard.complete(Outcome::Error5xx).await;
                    return;
                }
            }
        }
        for frame in translator.finish() {
            yield Bytes::from(frame);
        }
        guard.complete(Outcome::Success).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_status_ranges() {
        assert!(matches!(classify(429), Outcome::Error429));
        assert!(matches!(classify(404), Outcome::Error4xx));
        assert!(matches!(classify(500), Outcome::Error5xx));
        assert!(matches!(classify(503), Outcome::Error5xx));
    }

    #[test]
    fn extract_usage_reads_openai_and_claude_shapes() {
        let openai = serde_json::json!({"usage": {"prompt_tokens": 12, "completion_tokens": 34}});
        assert_eq!(extract_usage(&openai, ApiStyle::Openai), (12, 34));

        let claude = serde_json::json!({"usage": {"input_tokens": 5, "output_tokens": 7}});
        assert_eq!(extract_usage(&claude, ApiStyle::Claude), (5, 7));
        assert_eq!(extract_usage(&claude, ApiStyle::Responses), (5, 7));
    }

    #[test]
    fn extract_usage_defaults_to_zero_when_missing() {
        let empty = serde_json::json!({});
        assert_eq!(extract_usage(&empty, ApiStyle::Openai), (0, 0));
    }

    #[test]
    fn extract_max_tokens_checks_all_three_field_names() {
        assert_eq!(extract_max_tokens(&serde_json::json!({"max_tokens": 50})), Some(50));
        assert_eq!(extract_max_tokens(&serde_json::json!({"max_completion_tokens": 60})), Some(60));
        assert_eq!(extract_max_tokens(&serde_json::json!({"max_tokens_to_sample": 70})), Some(70));
        assert_eq!(extract_max_tokens(&serde_json::json!({})), None);
    }

    fn test_registry_and_meter() -> (Arc<MetricsRegistry>, Arc<CreditMeter>, Arc<crate::store::InMemoryStore>) {
        let store = crate::store::InMemoryStore::new();
        store.seed_credit_account(crate::domain::CreditAccount {
            user_id: "u1".to_string(),
            balance_cents: 1000,
            daily_limit_cents: None,
            status: crate::domain::CreditAccountStatus::Active,
        });
        let kv = crate::kv::InMemoryKv::new();
        let metrics = Arc::new(MetricsRegistry::new(
            store.clone(),
            kv,
            1.0,
            crate::metrics::DynamicWeightParams::default(),
        ));
        let credit = Arc::new(CreditMeter::new(store.clone(), crate::credit::CreditConfig::default()));
        (metrics, credit, store)
    }

    /// End-to-end over `translate_stream`: a Claude text stream translated to
    /// OpenAI records exactly one success sample (is_stream=true) and settles
    /// the ledger exactly once, closing the gap where stream completions
    /// never reached C5/C10 (§4.8 "on end-of-stream: record_sample ... settle
    /// C10").
    #[tokio::test]
    async fn stream_completion_records_sample_and_settles_once() {
        let (metrics, credit, store) = test_registry_and_meter();
        let translator = SseTranslator::new(ApiStyle::Claude, ApiStyle::Openai, "claude-3".to_string());
        let settlement = StreamSettlement {
            metrics: metrics.clone(),
            credit: credit.clone(),
            logical_model: "gpt-4".to_string(),
            provider_id: "p1".to_string(),
            billing_factor: 1.0,
            transport: Transport::Http,
            user_id: Some("u1".to_string()),
            caller_key_id: Some("caller-1".to_string()),
            idempotency_key: "req-stream-1".to_string(),
            max_tokens: Some(100),
            prompt_chars: 40,
            base_weight: 1.0,
        };

        let chunks: Vec<UpstreamChunk> = vec![
            Ok(Bytes::from_static(b"event: message_start\ndata: {\"type\":\"message_start\"}\n\n")),
            Ok(Bytes::from_static(
                b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
            )),
            Ok(Bytes::from_static(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n")),
        ];
        let upstream: Pin<Box<dyn Stream<Item = UpstreamChunk> + Send>> = Box::pin(futures::stream::iter(chunks));
        let stream = translate_stream(upstream, translator, settlement);
        let out: Vec<Bytes> = stream.collect().await;
        let joined: String = out.iter().map(|b| String::from_utf8_lossy(b).into_owned()).collect();
        assert!(joined.ends_with("data: [DONE]\n\n"));

        metrics.flush().await;
        let window = metrics.get_window("gpt-4", "p1").await.expect("window recorded");
        assert_eq!(window.counters.success, 1);

        let account = store.get_credit_account("u1").await.unwrap().unwrap();
        assert!(account.balance_cents < 1000);
    }

    /// A stream dropped before completion (caller disconnect) must not
    /// settle the ledger, only record a `Canceled` sample.
    #[tokio::test]
    async fn dropped_stream_records_canceled_and_does_not_settle() {
        let (metrics, credit, store) = test_registry_and_meter();
        let translator = SseTranslator::new(ApiStyle::Claude, ApiStyle::Openai, "claude-3".to_string());
        let settlement = StreamSettlement {
            metrics: metrics.clone(),
            credit: credit.clone(),
            logical_model: "gpt-4".to_string(),
            provider_id: "p1".to_string(),
            billing_factor: 1.0,
            transport: Transport::Http,
            user_id: Some("u1".to_string()),
            caller_key_id: Some("caller-1".to_string()),
            idempotency_key: "req-stream-2".to_string(),
            max_tokens: Some(100),
            prompt_chars: 40,
            base_weight: 1.0,
        };

        {
            let mut guard = StreamSettlementGuard::new(settlement);
            let _ = &mut guard; // dropped without calling `complete`
        }

        metrics.flush().await;
        let window = metrics.get_window("gpt-4", "p1").await.expect("window recorded");
        assert_eq!(window.counters.success, 0);

        let account = store.get_credit_account("u1").await.unwrap().unwrap();
        assert_eq!(account.balance_cents, 1000);
    }
}
