//! Anthropic Messages stream: `event:`-named content blocks.

use serde_json::Value;
use tracing::warn;

use crate::error::CoreResult;
use crate::event::{CanonicalDeltaEvent, ToolCallKey, UsageReport};
use crate::frame::Dialect;
use crate::model::{Role, Status};
use crate::normalizer::{
    EventNormalizer, UsagePolicy, error_envelope, index_field, str_field, unexpected,
};

#[derive(Debug, Clone)]
pub struct Anthropic {
    name: String,
    usage_policy: UsagePolicy,
}

impl Anthropic {
    pub fn new(name: impl Into<String>) -> Self {
        // message_start reports input tokens, message_delta only output tokens.
        Self { name: name.into(), usage_policy: UsagePolicy::Merge }
    }

    pub fn with_usage_policy(mut self, policy: UsagePolicy) -> Self {
        self.usage_policy = policy;
        self
    }

    fn map_stop(&self, reason: &str) -> Option<Status> {
        match reason {
            "end_turn" | "stop_sequence" | "tool_use" | "refusal" => Some(Status::Complete),
            "max_tokens" | "model_context_window_exceeded" => Some(Status::Length),
            other => {
                warn!(provider = %self.name, reason = %other, "unrecognized stop_reason; skipping");
                None
            }
        }
    }

    fn block_start(&self, payload: &Value) -> CanonicalDeltaEvent {
        let position = index_field(payload, "index");
        let block = payload.get("content_block").unwrap_or(&Value::Null);
        match str_field(block, "type") {
            Some("tool_use") => CanonicalDeltaEvent::ToolCallStarted {
                index: 0,
                call_id: str_field(block, "id").map(str::to_string),
                item_id: None,
                position: Some(position),
                name: str_field(block, "name").map(str::to_string),
                role: None,
            },
            Some("text") => match str_field(block, "text").filter(|t| !t.is_empty()) {
                Some(text) => CanonicalDeltaEvent::ContentDelta {
                    index: 0,
                    text: text.to_string(),
                    role: None,
                },
                None => CanonicalDeltaEvent::ignorable("content_block_start:text"),
            },
            other => CanonicalDeltaEvent::ignorable(format!(
                "content_block_start:{}",
                other.unwrap_or("untyped")
            )),
        }
    }

    fn block_delta(&self, payload: &Value) -> CoreResult<CanonicalDeltaEvent> {
        let position = index_field(payload, "index");
        let delta = payload.get("delta").unwrap_or(&Value::Null);
        let event = match str_field(delta, "type") {
            Some("text_delta") => CanonicalDeltaEvent::ContentDelta {
                index: 0,
                text: str_field(delta, "text").unwrap_or_default().to_string(),
                role: None,
            },
            Some("input_json_delta") => CanonicalDeltaEvent::ToolCallArgumentsDelta {
                index: 0,
                key: ToolCallKey::by_position(position),
                fragment: str_field(delta, "partial_json").unwrap_or_default().to_string(),
            },
            Some(kind @ ("thinking_delta" | "signature_delta" | "citations_delta")) => {
                CanonicalDeltaEvent::ignorable(format!("content_block_delta:{kind}"))
            }
            other => {
                return Err(unexpected(
                    &self.name,
                    format!("content_block_delta of type '{}'", other.unwrap_or("untyped")),
                ));
            }
        };
        Ok(event)
    }
}

impl EventNormalizer for Anthropic {
    fn provider(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> Dialect {
        Dialect::EventData
    }

    fn usage_policy(&self) -> UsagePolicy {
        self.usage_policy
    }

    fn is_transient(&self, code: &str) -> bool {
        matches!(code, "overloaded_error" | "api_error" | "timeout_error")
    }

    fn announces_tool_calls(&self) -> bool {
        true
    }

    fn normalize_value(
        &self,
        event: Option<&str>,
        payload: &Value,
    ) -> CoreResult<Vec<CanonicalDeltaEvent>> {
        let name = event.or_else(|| str_field(payload, "type")).unwrap_or_default();
        let events = match name {
            "message_start" => {
                let message = payload.get("message").unwrap_or(&Value::Null);
                let mut events = Vec::new();
                if let Some(role) = str_field(message, "role").and_then(Role::from_wire) {
                    events.push(CanonicalDeltaEvent::ContentDelta {
                        index: 0,
                        text: String::new(),
                        role: Some(role),
                    });
                }
                if let Some(report) = message
                    .get("usage")
                    .and_then(|u| UsageReport::from_object(u, "input_tokens", "output_tokens"))
                {
                    events.push(CanonicalDeltaEvent::Usage { index: Some(0), usage: report });
                }
                events
            }
            "content_block_start" => vec![self.block_start(payload)],
            "content_block_delta" => vec![self.block_delta(payload)?],
            "content_block_stop" => vec![CanonicalDeltaEvent::ContentDone {
                index: 0,
                content_index: index_field(payload, "index"),
            }],
            "message_delta" => {
                let mut events = Vec::new();
                if let Some(report) = payload
                    .get("usage")
                    .and_then(|u| UsageReport::from_object(u, "input_tokens", "output_tokens"))
                {
                    events.push(CanonicalDeltaEvent::Usage { index: Some(0), usage: report });
                }
                let reason = payload.get("delta").and_then(|d| str_field(d, "stop_reason"));
                if let Some(status) = reason.and_then(|r| self.map_stop(r)) {
                    events.push(CanonicalDeltaEvent::Finish { index: 0, status });
                }
                events
            }
            "error" => {
                let err = payload.get("error").unwrap_or(payload);
                vec![CanonicalDeltaEvent::Error(error_envelope(err, &["type", "code"]))]
            }
            "" => vec![CanonicalDeltaEvent::ignorable("untyped")],
            other => vec![CanonicalDeltaEvent::ignorable(other)],
        };
        Ok(events)
    }
}
