//! Normalization of provider-native chunks into [`StreamEvent`]s.

use serde_json::Value;
use tracing::debug;

use crate::errors::{ProviderError, api_error_from_payload};
use crate::json_stream::{IncrementalJsonParser, ScanMode};
use crate::model::ProviderId;
use crate::profile::ResponseShape;
use crate::sse::SseDecoder;
use crate::stream::{StreamEvent, ToolCallFragment, Usage};

enum Framing {
    Sse(SseDecoder),
    JsonObjects(IncrementalJsonParser),
    PlainText,
}

/// Turns raw body chunks of one response into normalized events.
///
/// `Done` is held back until the body ends so that trailing chunks (usage
/// usually arrives after the finish reason) are still delivered before it.
pub struct ChunkMapper {
    provider: ProviderId,
    framing: Framing,
    utf8_carry: Vec<u8>,
    finish_reason: Option<String>,
    finished: bool,
}

impl ChunkMapper {
    pub fn new(provider: ProviderId, shape: ResponseShape, scan: ScanMode) -> Self {
        let framing = match shape {
            ResponseShape::Sse => Framing::Sse(SseDecoder::default()),
            ResponseShape::JsonObjects => {
                Framing::JsonObjects(IncrementalJsonParser::with_mode(scan))
            }
            ResponseShape::PlainText => Framing::PlainText,
        };
        Self {
            provider,
            framing,
            utf8_carry: Vec::new(),
            finish_reason: None,
            finished: false,
        }
    }

    /// Maps one body chunk. Never yields `Done`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        match &mut self.framing {
            Framing::Sse(decoder) => {
                let frames = decoder.push_chunk(chunk);
                for frame in frames {
                    self.map_sse_data(&frame.data, &mut out);
                }
            }
            Framing::JsonObjects(_) | Framing::PlainText => {
                let text = decode_utf8(&mut self.utf8_carry, chunk);
                if text.is_empty() {
                    return out;
                }
                match &mut self.framing {
                    Framing::JsonObjects(parser) => {
                        for value in parser.process_chunk(&text) {
                            self.map_value(&value, &mut out);
                        }
                    }
                    _ => out.push(StreamEvent::Text(text)),
                }
            }
        }
        out
    }

    /// Flushes buffered input once the body has ended and closes the stream:
    /// `Done` when the provider signalled completion (or for plain text),
    /// `StreamIncomplete` otherwise.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        match &mut self.framing {
            Framing::Sse(decoder) => {
                if let Some(frame) = decoder.finish() {
                    self.map_sse_data(&frame.data, &mut out);
                }
            }
            Framing::JsonObjects(parser) => {
                if !parser.pending().trim().is_empty() {
                    debug!(provider = %self.provider, pending = parser.pending().len(), "discarding trailing partial json");
                }
                parser.reset();
            }
            Framing::PlainText => {
                if !self.utf8_carry.is_empty() {
                    let rest = String::from_utf8_lossy(&self.utf8_carry).into_owned();
                    self.utf8_carry.clear();
                    out.push(StreamEvent::Text(rest));
                }
                self.finished = true;
            }
        }

        if out.iter().any(|e| matches!(e, StreamEvent::Error(_))) {
            return out;
        }
        if self.finished {
            out.push(StreamEvent::Done {
                finish_reason: self.finish_reason.take(),
            });
        } else {
            out.push(StreamEvent::Error(ProviderError::StreamIncomplete {
                provider: self.provider.clone(),
            }));
        }
        out
    }

    fn map_sse_data(&mut self, data: &str, out: &mut Vec<StreamEvent>) {
        let data = data.trim();
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            self.finished = true;
            return;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(value) => self.map_value(&value, out),
            Err(err) => {
                debug!(provider = %self.provider, error = %err, "skipping undecodable sse data");
            }
        }
    }

    /// Maps one decoded provider chunk.
    pub fn map_value(&mut self, value: &Value, out: &mut Vec<StreamEvent>) {
        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            let fallback = error.as_str().unwrap_or("provider stream error").to_string();
            out.push(StreamEvent::Error(api_error_from_payload(
                &self.provider,
                None,
                value.clone(),
                &fallback,
                None,
            )));
            return;
        }

        if let Some(choices) = value.get("choices").and_then(Value::as_array) {
            for choice in choices {
                let delta = choice.get("delta").or_else(|| choice.get("message"));
                if let Some(delta) = delta {
                    map_delta(delta, out);
                }
                if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                    self.mark_finished(reason);
                }
            }
        } else if let Some(message) = value.get("message").filter(|m| m.is_object()) {
            // NDJSON chat format: {"message":{"content":..},"done":false}
            map_delta(message, out);
        } else if let Some(text) = value
            .get("delta")
            .and_then(|d| d.get("text"))
            .and_then(Value::as_str)
        {
            push_text(out, text);
        } else if let Some(text) = value.get("response").and_then(Value::as_str) {
            push_text(out, text);
        }

        if value.get("done").and_then(Value::as_bool) == Some(true) {
            let reason = value
                .get("done_reason")
                .and_then(Value::as_str)
                .unwrap_or("stop");
            self.mark_finished(reason);
        }
        if let Some(reason) = value.get("stopReason").and_then(Value::as_str) {
            self.mark_finished(reason);
        }

        if let Some(usage) = parse_usage(value) {
            out.push(StreamEvent::Usage(usage));
        }
    }

    fn mark_finished(&mut self, reason: &str) {
        self.finished = true;
        self.finish_reason = Some(reason.to_string());
    }
}

/// Converts a whole (non-streamed) response into the event sequence a stream
/// of the same content would produce.
pub fn events_from_response(provider: &ProviderId, response: &Value) -> Vec<StreamEvent> {
    let mut mapper = ChunkMapper::new(provider.clone(), ResponseShape::Sse, ScanMode::default());
    let mut events = Vec::new();
    mapper.map_value(response, &mut events);
    if events.iter().any(|e| matches!(e, StreamEvent::Error(_))) {
        return events;
    }
    events.push(StreamEvent::Done {
        finish_reason: mapper.finish_reason.take(),
    });
    events
}

fn push_text(out: &mut Vec<StreamEvent>, text: &str) {
    if !text.is_empty() {
        out.push(StreamEvent::Text(text.to_string()));
    }
}

fn map_delta(delta: &Value, out: &mut Vec<StreamEvent>) {
    for key in ["reasoning_content", "reasoning", "thinking"] {
        if let Some(reasoning) = delta.get(key).and_then(Value::as_str)
            && !reasoning.is_empty()
        {
            out.push(StreamEvent::Reasoning(reasoning.to_string()));
            break;
        }
    }
    if let Some(content) = delta.get("content").and_then(Value::as_str) {
        push_text(out, content);
    }
    if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
        for (position, call) in calls.iter().enumerate() {
            let index = call
                .get("index")
                .and_then(Value::as_u64)
                .map(|i| i as usize)
                .unwrap_or(position);
            let function = call.get("function");
            let arguments = match function.and_then(|f| f.get("arguments")) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            out.push(StreamEvent::ToolCallDelta {
                index,
                fragment: ToolCallFragment {
                    id: call.get("id").and_then(Value::as_str).map(ToOwned::to_owned),
                    name: function
                        .and_then(|f| f.get("name"))
                        .and_then(Value::as_str)
                        .map(ToOwned::to_owned),
                    arguments,
                },
            });
        }
    }
}

fn parse_usage(value: &Value) -> Option<Usage> {
    if let Some(usage) = value.get("usage").filter(|u| u.is_object()) {
        let field = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| usage.get(*name).and_then(Value::as_u64))
        };
        let prompt = field(&["prompt_tokens", "input_tokens", "inputTokens"])?;
        let completion = field(&["completion_tokens", "output_tokens", "outputTokens"]).unwrap_or(0);
        let mut parsed = Usage::new(prompt, completion);
        if let Some(total) = field(&["total_tokens", "totalTokens"]) {
            parsed.total_tokens = total;
        }
        return Some(parsed);
    }
    let prompt = value.get("prompt_eval_count").and_then(Value::as_u64)?;
    let completion = value.get("eval_count").and_then(Value::as_u64).unwrap_or(0);
    Some(Usage::new(prompt, completion))
}

/// Decodes `chunk` as UTF-8, carrying an incomplete trailing sequence over to
/// the next call.
fn decode_utf8(carry: &mut Vec<u8>, chunk: &[u8]) -> String {
    carry.extend_from_slice(chunk);
    match std::str::from_utf8(carry) {
        Ok(text) => {
            let text = text.to_string();
            carry.clear();
            text
        }
        Err(err) if err.error_len().is_none() => {
            let valid = err.valid_up_to();
            let text = String::from_utf8_lossy(&carry[..valid]).into_owned();
            carry.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ApiErrorKind;
    use serde_json::json;

    fn mapper(shape: ResponseShape) -> ChunkMapper {
        ChunkMapper::new(ProviderId::new("acme"), shape, ScanMode::default())
    }

    fn texts(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn openai_sse_stream_holds_done_until_body_end() {
        let mut m = mapper(ResponseShape::Sse);
        let mut events = m.push(
            b"data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"think\"}}]}\n\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n\
              data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        );
        events.extend(m.push(
            b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\ndata: [DONE]\n\n",
        ));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Done { .. })));
        events.extend(m.finish());
        assert_eq!(
            events,
            vec![
                StreamEvent::Reasoning("think".into()),
                StreamEvent::text("Hi"),
                StreamEvent::Usage(Usage::new(3, 2)),
                StreamEvent::done(Some("stop")),
            ]
        );
    }

    #[test]
    fn invalid_sse_json_is_skipped() {
        let mut m = mapper(ResponseShape::Sse);
        let mut events = m.push(b"data: {oops\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"},\"finish_reason\":\"stop\"}]}\n\n");
        events.extend(m.finish());
        assert_eq!(texts(&events), "ok");
        assert_eq!(events.last(), Some(&StreamEvent::done(Some("stop"))));
    }

    #[test]
    fn sse_body_without_finish_is_incomplete() {
        let mut m = mapper(ResponseShape::Sse);
        let mut events = m.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\n");
        events.extend(m.finish());
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error(ProviderError::StreamIncomplete { .. }))
        ));
    }

    #[test]
    fn tool_call_fragments_keep_their_index() {
        let mut m = mapper(ResponseShape::Sse);
        let events = m.push(
            br#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_1","function":{"name":"search","arguments":"{\"q\":"}}]}}]}

"#,
        );
        assert_eq!(
            events,
            vec![StreamEvent::ToolCallDelta {
                index: 1,
                fragment: ToolCallFragment {
                    id: Some("call_1".into()),
                    name: Some("search".into()),
                    arguments: "{\"q\":".into(),
                },
            }]
        );
    }

    #[test]
    fn in_stream_error_object_becomes_error_event() {
        let mut m = mapper(ResponseShape::Sse);
        let events = m.push(b"data: {\"error\":{\"code\":\"insufficient_quota\",\"message\":\"quota\"}}\n\n");
        match &events[..] {
            [StreamEvent::Error(err)] => {
                assert_eq!(err.api_kind(), Some(ApiErrorKind::InsufficientQuota));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(m.finish().as_slice(), [StreamEvent::Error(_)]));
    }

    #[test]
    fn ndjson_objects_split_anywhere() {
        let body = "{\"message\":{\"content\":\"Hel\"},\"done\":false}\n{\"message\":{\"content\":\"lo\"},\"done\":true,\"done_reason\":\"stop\",\"prompt_eval_count\":4,\"eval_count\":2}\n";
        let (a, b) = body.split_at(17);
        let mut m = mapper(ResponseShape::JsonObjects);
        let mut events = m.push(a.as_bytes());
        events.extend(m.push(b.as_bytes()));
        events.extend(m.finish());
        assert_eq!(texts(&events), "Hello");
        assert!(events.contains(&StreamEvent::Usage(Usage::new(4, 2))));
        assert_eq!(events.last(), Some(&StreamEvent::done(Some("stop"))));
    }

    #[test]
    fn delta_text_objects_with_stop_reason() {
        let mut m = mapper(ResponseShape::JsonObjects);
        let mut events = m.push(br#"{"delta":{"text":"a"}}{"delta":{"text":"b"}}{"stopReason":"end_turn"}"#);
        events.extend(m.finish());
        assert_eq!(texts(&events), "ab");
        assert_eq!(events.last(), Some(&StreamEvent::done(Some("end_turn"))));
    }

    #[test]
    fn plain_text_carries_split_utf8_and_ends_with_done() {
        let mut m = mapper(ResponseShape::PlainText);
        let bytes = "héllo".as_bytes();
        let mut events = m.push(&bytes[..2]);
        events.extend(m.push(&bytes[2..]));
        events.extend(m.finish());
        assert_eq!(texts(&events), "héllo");
        assert_eq!(events.last(), Some(&StreamEvent::done(None)));
    }

    #[test]
    fn whole_response_maps_to_stream_sequence() {
        let response = json!({
            "choices": [{
                "message": {
                    "content": "answer",
                    "reasoning_content": "why",
                    "tool_calls": [{"id": "c1", "function": {"name": "f", "arguments": ""}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        });
        let events = events_from_response(&ProviderId::new("acme"), &response);
        assert_eq!(
            events,
            vec![
                StreamEvent::Reasoning("why".into()),
                StreamEvent::text("answer"),
                StreamEvent::ToolCallDelta {
                    index: 0,
                    fragment: ToolCallFragment {
                        id: Some("c1".into()),
                        name: Some("f".into()),
                        arguments: String::new(),
                    },
                },
                StreamEvent::Usage(Usage::new(1, 1)),
                StreamEvent::done(Some("tool_calls")),
            ]
        );
    }
}
