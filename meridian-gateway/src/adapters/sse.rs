//! SSE stream translators between the openai/claude/responses wire dialects.
//!
//! Modeled as an explicit stateful struct — a byte buffer, a started flag,
//! a tool-call index map, and an accumulated finish reason — rather than
//! closure-captured state. One `SseTranslator` is created per in-flight
//! stream and fed raw upstream bytes as they arrive; it returns zero or more
//! complete, already-framed SSE text chunks ready to forward to the caller.

use crate::domain::ApiStyle;
use serde_json::{json, Value};
use std::collections::HashMap;

struct RawEvent {
    event: Option<String>,
    data: String,
}

pub struct SseTranslator {
    from: ApiStyle,
    to: ApiStyle,
    model: String,
    buffer: String,
    done: bool,
    started: bool,
    response_id: String,
    created: i64,
    tool_index: HashMap<u64, u32>,
    next_tool_index: u32,
    finish_reason: Option<String>,
    text_emitted: bool,
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

impl SseTranslator {
    pub fn new(from: ApiStyle, to: ApiStyle, model: String) -> Self {
        Self {
            from,
            to,
            model,
            buffer: String::new(),
            done: false,
            started: false,
            response_id: format!("gw-{}", uuid::Uuid::new_v4()),
            created: chrono::Utc::now().timestamp(),
            tool_index: HashMap::new(),
            next_tool_index: 0,
            finish_reason: None,
            text_emitted: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feeds a chunk of raw upstream bytes and returns complete, framed SSE
    /// text ready to forward. Never panics on malformed input: a chunk that
    /// is not itself valid UTF-8 (e.g. a multi-byte character split across
    /// a chunk boundary) yields zero output frames and leaves `self.buffer`
    /// untouched (c) rather than corrupting it with replacement characters;
    /// malformed JSON inside a `data:` frame is silently dropped (b).
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        let Ok(decoded) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        if self.from == self.to {
            // Byte-exact passthrough: forward untouched.
            return vec![decoded.to_string()];
        }

        self.buffer.push_str(decoded);
        let mut out = Vec::new();
        for raw in self.drain_events() {
            out.extend(self.translate_event(raw));
            if self.done {
                break;
            }
        }
        out
    }

    /// Call once the upstream byte stream ends without an explicit terminal
    /// event (defensive — invariant (a) "always terminates with [DONE]").
    pub fn finish(&mut self) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        vec!["data: [DONE]\n\n".to_string()]
    }

    /// Emits one terminal error frame in the caller's own style, then marks
    /// the stream done. Used when the upstream transport fails mid-stream
    /// (as opposed to an upstream-emitted `error` SSE event, which `feed`
    /// already translates) after at least one byte has already reached the
    /// caller, so failover is no longer possible.
    pub fn abort(&mut self, message: &str) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        match self.to {
            ApiStyle::Openai => vec![
                format!("data: {}\n\n", json!({"error": {"message": message, "type": "upstream_error"}})),
                "data: [DONE]\n\n".to_string(),
            ],
            ApiStyle::Claude => vec![format!(
                "event: error\ndata: {}\n\n",
                json!({"type": "error", "error": {"type": "upstream_error", "message": message}})
            )],
            ApiStyle::Responses => vec![format!(
                "event: response.error\ndata: {}\n\n",
                json!({"type": "response.error", "response": {"id": self.response_id, "status": "failed"}, "error": {"message": message}})
            )],
        }
    }

    fn drain_events(&mut self) -> Vec<RawEvent> {
        let mut events = Vec::new();
        let normalized = self.buffer.replace("\r\n", "\n");
        self.buffer = normalized;
        loop {
            let Some(pos) = self.buffer.find("\n\n") else { break };
            let block: String = self.buffer.drain(..pos + 2).collect();
            let mut event_type = None;
            let mut data_lines = Vec::new();
            for line in block.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event_type = Some(rest.trim().to_string());
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.trim_start().to_string());
                }
            }
            if event_type.is_none() && data_lines.is_empty() {
                continue;
            }
            events.push(RawEvent {
                event: event_type,
                data: data_lines.join("\n"),
            });
        }
        events
    }

    fn translate_event(&mut self, raw: RawEvent) -> Vec<String> {
        match self.to {
            ApiStyle::Openai => self.to_openai(raw),
            ApiStyle::Claude => self.to_claude(raw),
            ApiStyle::Responses => self.to_responses(raw),
        }
    }

    fn parse_data(&self, raw: &str) -> Option<Value> {
        if raw.trim().is_empty() {
            return None;
        }
        serde_json::from_str(raw).ok()
    }

    fn openai_chunk(&self, delta: Value, finish_reason: Option<&str>) -> String {
        let frame = json!({
            "id": self.response_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        format!("data: {}\n\n", frame)
    }

    /// Claude -> OpenAI chat.completion.chunk.
    fn to_openai(&mut self, raw: RawEvent) -> Vec<String> {
        let event = raw.event.as_deref().unwrap_or("");
        match event {
            "content_block_start" => {
                let Some(data) = self.parse_data(&raw.data) else { return vec![] };
                let block = data.get("content_block");
                if block.and_then(|b| b.get("type")).and_then(|t| t.as_str()) == Some("tool_use") {
                    let index = data.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                    let tool_index = *self.tool_index.entry(index).or_insert_with(|| {
                        let idx = self.next_tool_index;
                        self.next_tool_index += 1;
                        idx
                    });
                    let id = block.and_then(|b| b.get("id")).and_then(|v| v.as_str()).unwrap_or("");
                    let name = block.and_then(|b| b.get("name")).and_then(|v| v.as_str()).unwrap_or("");
                    let delta = json!({"tool_calls": [{
                        "index": tool_index,
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": ""},
                    }]});
                    return vec![self.openai_chunk(delta, None)];
                }
                vec![]
            }
            "content_block_delta" => {
                let Some(data) = self.parse_data(&raw.data) else { return vec![] };
                let delta = data.get("delta");
                match delta.and_then(|d| d.get("type")).and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        let text = delta.and_then(|d| d.get("text")).and_then(|v| v.as_str()).unwrap_or("");
                        self.text_emitted = true;
                        vec![self.openai_chunk(json!({"content": text}), None)]
                    }
                    Some("input_json_delta") => {
                        let index = data.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                        let tool_index = *self.tool_index.get(&index).unwrap_or(&0);
                        let partial = delta.and_then(|d| d.get("partial_json")).and_then(|v| v.as_str()).unwrap_or("");
                        let delta = json!({"tool_calls": [{"index": tool_index, "function": {"arguments": partial}}]});
                        vec![self.openai_chunk(delta, None)]
                    }
                    _ => vec![],
                }
            }
            "message_delta" => {
                if let Some(data) = self.parse_data(&raw.data) {
                    if let Some(stop_reason) = data.get("delta").and_then(|d| d.get("stop_reason")).and_then(|v| v.as_str()) {
                        self.finish_reason = Some(map_finish_reason(stop_reason, ApiStyle::Openai));
                    }
                }
                vec![]
            }
            "message_stop" => {
                // A stream that opened any tool_use block always reports
                // tool_calls at the end, regardless of what stop_reason the
                // upstream's message_delta carried.
                let reason = if self.next_tool_index > 0 {
                    "tool_calls".to_string()
                } else {
                    self.finish_reason.clone().unwrap_or_else(|| "stop".to_string())
                };
                self.done = true;
                vec![self.openai_chunk(json!({}), Some(&reason)), "data: [DONE]\n\n".to_string()]
            }
            "error" => {
                self.done = true;
                let message = self
                    .parse_data(&raw.data)
                    .and_then(|d| d.get("error").and_then(|e| e.get("message")).and_then(|v| v.as_str()).map(str::to_string))
                    .unwrap_or_else(|| "upstream error".to_string());
                vec![
                    format!("data: {}\n\n", json!({"error": {"message": message, "type": "upstream_error"}})),
                    "data: [DONE]\n\n".to_string(),
                ]
            }
            _ => vec![],
        }
    }

    /// OpenAI -> Claude Messages events (the inverse translation).
    fn to_claude(&mut self, raw: RawEvent) -> Vec<String> {
        if raw.data.trim() == "[DONE]" {
            self.done = true;
            return vec!["data: [DONE]\n\n".to_string()];
        }
        let Some(data) = self.parse_data(&raw.data) else { return vec![] };
        let mut out = Vec::new();
        let choice = data.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first());
        let delta = choice.and_then(|c| c.get("delta"));
        let finish_reason = choice.and_then(|c| c.get("finish_reason")).and_then(|v| v.as_str());

        if !self.started {
            self.started = true;
            out.push(format!(
                "event: message_start\ndata: {}\n\n",
                json!({"type": "message_start", "message": {"id": self.response_id, "role": "assistant", "model": self.model, "content": []}})
            ));
        }

        if let Some(content) = delta.and_then(|d| d.get("content")).and_then(|v| v.as_str()) {
            if !self.text_emitted {
                self.text_emitted = true;
                out.push(format!(
                    "event: content_block_start\ndata: {}\n\n",
                    json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})
                ));
            }
            out.push(format!(
                "event: content_block_delta\ndata: {}\n\n",
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": content}})
            ));
        }

        if let Some(reason) = finish_reason {
            self.finish_reason = Some(map_finish_reason(reason, ApiStyle::Claude));
            if self.text_emitted {
                out.push(format!(
                    "event: content_block_stop\ndata: {}\n\n",
                    json!({"type": "content_block_stop", "index": 0})
                ));
            }
            out.push(format!(
                "event: message_delta\ndata: {}\n\n",
                json!({"type": "message_delta", "delta": {"stop_reason": self.finish_reason}})
            ));
            out.push(format!(
                "event: message_stop\ndata: {}\n\n",
                json!({"type": "message_stop"})
            ));
            self.done = true;
            out.push("data: [DONE]\n\n".to_string());
        }

        out
    }

    /// Any source style -> Responses events, wrapping text increments as
    /// `response.output_text.delta` with `response.created` first and
    /// `response.completed` last.
    fn to_responses(&mut self, raw: RawEvent) -> Vec<String> {
        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            out.push(format!(
                "event: response.created\ndata: {}\n\n",
                json!({"type": "response.created", "response": {"id": self.response_id, "model": self.model, "status": "in_progress"}})
            ));
        }

        let (text, finish) = match self.from {
            ApiStyle::Claude => {
                let event = raw.event.as_deref().unwrap_or("");
                if event == "content_block_delta" {
                    let data = match self.parse_data(&raw.data) {
                        Some(d) => d,
                        None => return out,
                    };
                    let text = data
                        .get("delta")
                        .filter(|d| d.get("type").and_then(|t| t.as_str()) == Some("text_delta"))
                        .and_then(|d| d.get("text"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    (text, None)
                } else if event == "message_stop" {
                    (None, Some("stop".to_string()))
                } else {
                    (None, None)
                }
            }
            _ => {
                if raw.data.trim() == "[DONE]" {
                    (None, Some("stop".to_string()))
                } else {
                    let data = match self.parse_data(&raw.data) {
                        Some(d) => d,
                        None => return out,
                    };
                    let choice = data.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first());
                    let text = choice
                        .and_then(|c| c.get("delta"))
                        .and_then(|d| d.get("content"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    let finish = choice.and_then(|c| c.get("finish_reason")).and_then(|v| v.as_str()).map(str::to_string);
                    (text, finish)
                }
            }
        };

        if let Some(text) = text {
            out.push(format!(
                "event: response.output_text.delta\ndata: {}\n\n",
                json!({"type": "response.output_text.delta", "delta": text})
            ));
        }

        if finish.is_some() {
            out.push(format!(
                "event: response.completed\ndata: {}\n\n",
                json!({"type": "response.completed", "response": {"id": self.response_id, "status": "completed"}})
            ));
            self.done = true;
            out.push("data: [DONE]\n\n".to_string());
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_text_stream_translates_to_openai_and_terminates() {
        let mut translator = SseTranslator::new(ApiStyle::Claude, ApiStyle::Openai, "claude-3".to_string());
        let mut out = Vec::new();
        out.extend(translator.feed(b"event: message_start\ndata: {\"type\":\"message_start\"}\n\n"));
        out.extend(translator.feed(
            b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
        ));
        out.extend(translator.feed(
            b"event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"}}\n\n",
        ));
        out.extend(translator.feed(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));

        let joined = out.join("");
        assert!(joined.contains("\"content\":\"Hello\""));
        assert!(joined.contains("\"finish_reason\":\"stop\""));
        assert!(out.last().unwrap().ends_with("data: [DONE]\n\n"));
    }

    #[test]
    fn tool_call_stream_reports_tool_calls_finish_reason_on_stop() {
        let mut translator = SseTranslator::new(ApiStyle::Claude, ApiStyle::Openai, "claude-3".to_string());
        translator.feed(b"event: message_start\ndata: {\"type\":\"message_start\"}\n\n");
        translator.feed(
            b"event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\
\"content_block\":{\"type\":\"tool_use\",\"id\":\"call_1\",\"name\":\"get_weather\"}}\n\n",
        );
        translator.feed(
            b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\
\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"city\\\":\\\"SF\\\"}\"}}\n\n",
        );
        // A tool-call turn ends with stop_reason "tool_use"; this still must
        // map to "tool_calls", not fall back to the mapped message_delta
        // value directly without the tool-open check.
        translator.feed(
            b"event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"}}\n\n",
        );
        let out = translator.feed(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");

        let joined = out.join("");
        assert!(joined.contains("\"finish_reason\":\"tool_calls\""));
        assert!(out.last().unwrap().ends_with("data: [DONE]\n\n"));
    }

    /// Even if an upstream's `message_delta` never arrives (or reports
    /// something else) before `message_stop`, having opened a tool_use
    /// block is sufficient on its own to force `tool_calls`.
    #[test]
    fn tool_call_stream_forces_tool_calls_even_without_message_delta() {
        let mut translator = SseTranslator::new(ApiStyle::Claude, ApiStyle::Openai, "claude-3".to_string());
        translator.feed(b"event: message_start\ndata: {\"type\":\"message_start\"}\n\n");
        translator.feed(
            b"event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\
\"content_block\":{\"type\":\"tool_use\",\"id\":\"call_1\",\"name\":\"get_weather\"}}\n\n",
        );
        let out = translator.feed(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");

        let joined = out.join("");
        assert!(joined.contains("\"finish_reason\":\"tool_calls\""));
    }

    #[test]
    fn malformed_json_is_dropped_not_fatal() {
        let mut translator = SseTranslator::new(ApiStyle::Claude, ApiStyle::Openai, "claude-3".to_string());
        let out = translator.feed(b"event: content_block_delta\ndata: {not json}\n\n");
        assert!(out.is_empty());
        assert!(!translator.is_done());
    }

    /// A multi-byte UTF-8 character split across a chunk boundary must not
    /// corrupt the buffer with a replacement character: the chunk containing
    /// the split byte yields zero frames and is dropped, matching the
    /// grounding original's `except UnicodeDecodeError: return outputs`.
    #[test]
    fn chunk_split_mid_utf8_character_yields_no_frames_and_does_not_corrupt_buffer() {
        let mut translator = SseTranslator::new(ApiStyle::Claude, ApiStyle::Openai, "claude-3".to_string());
        let text = "caf\u{00e9}"; // "café", the 'é' is a 2-byte UTF-8 sequence
        let full = format!(
            "event: content_block_delta\ndata: {{\"type\":\"content_block_delta\",\"delta\":{{\"type\":\"text_delta\",\"text\":\"{text}\"}}}}\n\n"
        );
        let bytes = full.as_bytes();
        let split_at = bytes.len() - 2; // splits inside the 2-byte 'é' sequence

        let first = translator.feed(&bytes[..split_at]);
        assert!(first.is_empty(), "an incomplete UTF-8 boundary must yield zero frames");
        assert!(
            !translator.buffer.contains('\u{fffd}'),
            "buffer must never be corrupted with a replacement character"
        );

        // The trailing bytes alone aren't a standalone valid UTF-8 event, so
        // this chunk is also dropped rather than salvaged — the original's
        // documented behavior is "not an error", not "reassembled".
        let second = translator.feed(&bytes[split_at..]);
        assert!(second.is_empty());
        assert!(!translator.buffer.contains('\u{fffd}'));
    }

    #[test]
    fn partial_event_across_chunk_boundaries_is_buffered() {
        let mut translator = SseTranslator::new(ApiStyle::Claude, ApiStyle::Openai, "claude-3".to_string());
        let first = translator.feed(b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",");
        assert!(first.is_empty());
        let second = translator.feed(b"\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n");
        assert!(second.iter().any(|f| f.contains("\"content\":\"Hi\"")));
    }

    #[test]
    fn error_event_emits_one_frame_then_done() {
        let mut translator = SseTranslator::new(ApiStyle::Claude, ApiStyle::Openai, "claude-3".to_string());
        let out = translator.feed(b"event: error\ndata: {\"error\":{\"message\":\"boom\"}}\n\n");
        assert_eq!(out.len(), 2);
        assert!(out[1].contains("[DONE]"));
        assert!(translator.is_done());
    }

    #[test]
    fn passthrough_forwards_bytes_unchanged() {
        let mut translator = SseTranslator::new(ApiStyle::Openai, ApiStyle::Openai, "gpt-4".to_string());
        let out = translator.feed(b"data: {\"hello\":1}\n\n");
        assert_eq!(out, vec!["data: {\"hello\":1}\n\n".to_string()]);
    }

    #[test]
    fn abort_emits_one_terminal_frame_per_style() {
        let mut openai = SseTranslator::new(ApiStyle::Claude, ApiStyle::Openai, "claude-3".to_string());
        let out = openai.abort("upstream connection failed");
        assert_eq!(out.len(), 2);
        assert!(out[0].contains("upstream_error"));
        assert!(out[1].contains("[DONE]"));
        assert!(openai.is_done());

        let mut claude = SseTranslator::new(ApiStyle::Openai, ApiStyle::Claude, "gpt-4".to_string());
        let out = claude.abort("upstream connection failed");
        assert_eq!(out.len(), 1);
        assert!(out[0].starts_with("event: error"));

        let mut responses = SseTranslator::new(ApiStyle::Openai, ApiStyle::Responses, "gpt-4".to_string());
        let out = responses.abort("upstream connection failed");
        assert_eq!(out.len(), 1);
        assert!(out[0].starts_with("event: response.error"));
    }

    #[test]
    fn abort_after_done_is_a_noop() {
        let mut translator = SseTranslator::new(ApiStyle::Claude, ApiStyle::Openai, "claude-3".to_string());
        translator.finish();
        assert!(translator.abort("too late").is_empty());
    }
}
