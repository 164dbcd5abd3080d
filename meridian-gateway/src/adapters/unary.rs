//! Unary (non-streaming) request/response translation.

use crate::domain::ApiStyle;
use serde_json::{json, Value};

#[derive(Debug, Clone, Default)]
struct CanonMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Default)]
struct Canonical {
    model: String,
    system: Option<String>,
    messages: Vec<CanonMessage>,
    max_tokens: Option<u64>,
    temperature: Option<f64>,
    stream: bool,
    extra: serde_json::Map<String, Value>,
}

/// Flattens each segment's `text`/`input_text` field in order, per 's
/// Gemini/Responses flattening rule.
fn flatten_segments(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(segments)) => segments
            .iter()
            .filter_map(|seg| {
                seg.get("text")
                    .or_else(|| seg.get("input_text"))
                    .and_then(|v| v.as_str())
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Detects the dialect of a raw body independent of which endpoint it
/// arrived on, per : `max_tokens_to_sample`/`anthropic_version` signal
/// claude; `max_completion_tokens` alone signals openai; an `input` array
/// signals responses.
pub fn detect_style(body: &Value) -> ApiStyle {
    if body.get("input").is_some() {
        ApiStyle::Responses
    } else if body.get("max_tokens_to_sample").is_some() || body.get("anthropic_version").is_some() {
        ApiStyle::Claude
    } else {
        ApiStyle::Openai
    }
}

fn canonicalize(body: &Value, from: ApiStyle) -> Canonical {
    let mut canon = Canonical::default();
    canon.model = body.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    canon.stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    canon.max_tokens = body
        .get("max_tokens")
        .or_else(|| body.get("max_completion_tokens"))
        .or_else(|| body.get("max_tokens_to_sample"))
        .and_then(|v| v.as_u64());
    canon.temperature = body.get("temperature").and_then(|v| v.as_f64());

    // `input`-array bodies (Responses style, or a Gemini-shaped body
    // regardless of declared `from`) take precedence.
    if let Some(input) = body.get("input").and_then(|v| v.as_array()) {
        if let Some(instructions) = body.get("instructions").and_then(|v| v.as_str()) {
            canon.system = Some(instructions.to_string());
        }
        for item in input {
            let role = item.get("role").and_then(|v| v.as_str()).unwrap_or("user").to_string();
            let content = flatten_segments(item.get("content"));
            canon.messages.push(CanonMessage { role, content });
        }
        return canon;
    }

    match from {
        ApiStyle::Claude => {
            if let Some(system) = body.get("system") {
                canon.system = Some(flatten_segments(Some(system)));
            }
        }
        _ => {}
    }

    if let Some(messages) = body.get("messages").and_then(|v| v.as_array()) {
        for item in messages {
            let role = item.get("role").and_then(|v| v.as_str()).unwrap_or("user").to_string();
            if role == "system" && canon.system.is_none() && from != ApiStyle::Claude {
                canon.system = Some(flatten_segments(item.get("content")));
                continue;
            }
            let content = flatten_segments(item.get("content"));
            canon.messages.push(CanonMessage { role, content });
        }
    }

    canon
}

fn render_openai(canon: &Canonical) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &canon.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    for m in &canon.messages {
        messages.push(json!({"role": m.role, "content": m.content}));
    }
    let mut body = json!({
        "model": canon.model,
        "messages": messages,
        "stream": canon.stream,
    });
    if let Some(mt) = canon.max_tokens {
        body["max_tokens"] = json!(mt);
    }
    if let Some(t) = canon.temperature {
        body["temperature"] = json!(t);
    }
    body
}

fn render_claude(canon: &Canonical) -> Value {
    let messages: Vec<Value> = canon
        .messages
        .iter()
        .filter(|m| m.role != "system")
        .map(|m| json!({"role": m.role, "content": m.content}))
        .collect();
    let mut body = json!({
        "model": canon.model,
        "messages": messages,
        // Claude requires `max_tokens`; default conservatively if unset.
        "max_tokens": canon.max_tokens.unwrap_or(1024),
        "stream": canon.stream,
    });
    if let Some(system) = &canon.system {
        body["system"] = json!(system);
    }
    if let Some(t) = canon.temperature {
        body["temperature"] = json!(t);
    }
    body
}

fn render_responses(canon: &Canonical) -> Value {
    let input: Vec<Value> = canon
        .messages
        .iter()
        .map(|m| json!({"role": m.role, "content": [{"type": "input_text", "text": m.content}]}))
        .collect();
    let mut body = json!({
        "model": canon.model,
        "input": input,
        "stream": canon.stream,
    });
    if let Some(system) = &canon.system {
        body["instructions"] = json!(system);
    }
    if let Some(mt) = canon.max_tokens {
        body["max_output_tokens"] = json!(mt);
    }
    body
}

/// Rewrites an outbound request body from the caller's wire style to the
/// chosen upstream's native style. Passthrough when `from == to`.
pub fn translate_request(body: &Value, from: ApiStyle, to: ApiStyle) -> Value {
    if from == to && body.get("input").is_none() {
        return body.clone();
    }
    let canon = canonicalize(body, from);
    match to {
        ApiStyle::Openai => render_openai(&canon),
        ApiStyle::Claude => render_claude(&canon),
        ApiStyle::Responses => render_responses(&canon),
    }
}

fn map_finish_reason(reason: &str, to: ApiStyle) -> String {
    match to {
        ApiStyle::Claude => match reason {
            "stop" => "end_turn".to_string(),
            "length" => "max_tokens".to_string(),
            "tool_calls" => "tool_use".to_string(),
            other => other.to_string(),
        },
        _ => match reason {
            "end_turn" => "stop".to_string(),
            "max_tokens" => "length".to_string(),
            "tool_use" => "tool_calls".to_string(),
            other => other.to_string(),
        },
    }
}

/// Rewrites an upstream's unary reply into the caller's wire style.
/// Passthrough when `from == to`.
pub fn translate_unary_response(body: &Value, from: ApiStyle, to: ApiStyle) -> Value {
    if from == to {
        return body.clone();
    }

    let (content, finish_reason, input_tokens, output_tokens, model) = match from {
        ApiStyle::Claude => {
            let content = body
                .get("content")
                .and_then(|v| v.as_array())
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
            let finish = body.get("stop_reason").and_then(|v| v.as_str()).unwrap_or("end_turn").to_string();
            let input = body.get("usage").and_then(|u| u.get("input_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
            let output = body.get("usage").and_then(|u| u.get("output_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
            let model = body.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            (content, finish, input, output, model)
        }
        ApiStyle::Responses => {
            let content = body
                .get("output")
                .and_then(|v| v.as_array())
                .and_then(|arr| arr.first())
                .and_then(|o| o.get("content"))
                .and_then(|v| v.as_array())
                .map(|segs| {
                    segs.iter()
                        .filter_map(|s| s.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
            let finish = "stop".to_string();
            let input = body.get("usage").and_then(|u| u.get("input_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
            let output = body.get("usage").and_then(|u| u.get("output_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
            let model = body.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            (content, finish, input, output, model)
        }
        ApiStyle::Openai => {
            let choice = body.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first());
            let content = choice
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let finish = choice
                .and_then(|c| c.get("finish_reason"))
                .and_then(|v| v.as_str())
                .unwrap_or("stop")
                .to_string();
            let input = body.get("usage").and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
            let output = body.get("usage").and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0);
            let model = body.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            (content, finish, input, output, model)
        }
    };

    let mapped_finish = map_finish_reason(&finish_reason, to);
    let now = chrono::Utc::now().timestamp() as u64;
    let id = format!("gw-{}", uuid::Uuid::new_v4());

    match to {
        ApiStyle::Openai => json!({
            "id": id,
            "object": "chat.completion",
            "created": now,
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": mapped_finish,
            }],
            "usage": {
                "prompt_tokens": input_tokens,
                "completion_tokens": output_tokens,
                "total_tokens": input_tokens + output_tokens,
            }
        }),
        ApiStyle::Claude => json!({
            "id": id,
            "type": "message",
            "role": "assistant",
            "model": model,
            "content": [{"type": "text", "text": content}],
            "stop_reason": mapped_finish,
            "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens},
        }),
        ApiStyle::Responses => json!({
            "id": id,
            "object": "response",
            "created_at": now,
            "model": model,
            "status": "completed",
            "output": [{
                "type": "message",
                "role": "assistant",
                "content": [{"type": "output_text", "text": content}],
            }],
            "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens},
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_input_flattens_to_openai_messages() {
        let body = json!({
            "model": "gemini-1.5",
            "input": [{"role": "user", "content": [{"type": "input_text", "text": "hi"}]}]
        });
        let out = translate_request(&body, ApiStyle::Responses, ApiStyle::Openai);
        assert_eq!(out["messages"][0]["role"], "user");
        assert_eq!(out["messages"][0]["content"], "hi");
    }

    #[test]
    fn responses_instructions_become_system_message() {
        let body = json!({
            "model": "gpt-4",
            "instructions": "be terse",
            "input": [{"role": "user", "content": [{"type": "input_text", "text": "hi"}]}]
        });
        let out = translate_request(&body, ApiStyle::Responses, ApiStyle::Openai);
        assert_eq!(out["messages"][0]["role"], "system");
        assert_eq!(out["messages"][0]["content"], "be terse");
        assert_eq!(out["messages"][1]["role"], "user");
    }

    #[test]
    fn openai_to_responses_preserves_content() {
        let response = json!({
            "id": "c1", "object": "chat.completion", "created": 1, "model": "gpt-4",
            "choices": [{"index":0,"message":{"role":"assistant","content":"hello"},"finish_reason":"stop"}],
            "usage": {"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}
        });
        let out = translate_unary_response(&response, ApiStyle::Openai, ApiStyle::Responses);
        assert_eq!(out["output"][0]["content"][0]["text"], "hello");
    }

    #[test]
    fn finish_reason_maps_claude_to_openai() {
        let response = json!({
            "id": "m1", "type": "message", "role": "assistant", "model": "claude-3",
            "content": [{"type":"text","text":"hi"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens":1,"output_tokens":1}
        });
        let out = translate_unary_response(&response, ApiStyle::Claude, ApiStyle::Openai);
        assert_eq!(out["choices"][0]["finish_reason"], "length");
    }
}
