//! Responses-API stream events, discriminated by their `type` field.
//!
//! A Responses stream describes a single response, so every event maps onto
//! choice index 0; output items are tool-call positions within it.

use serde_json::Value;
use tracing::warn;

use crate::error::CoreResult;
use crate::event::{CanonicalDeltaEvent, ToolCallKey, UsageReport};
use crate::frame::Dialect;
use crate::model::{Role, Status};
use crate::normalizer::{
    EventNormalizer, UsagePolicy, describe_shape, error_envelope, index_field, str_field,
    unexpected,
};

/// Named events that carry nothing the merger models.
pub const IGNORABLE_EVENTS: &[&str] = &[
    "response.created",
    "response.in_progress",
    "response.queued",
    "response.output_item.done",
    "response.content_part.added",
    "response.content_part.done",
    "response.output_text.annotation.added",
    "response.refusal.delta",
    "response.refusal.done",
    "response.reasoning_summary_part.added",
    "response.reasoning_summary_part.done",
    "response.reasoning_summary_text.delta",
    "response.reasoning_summary_text.done",
    "response.reasoning_text.delta",
    "response.reasoning_text.done",
    "response.file_search_call.in_progress",
    "response.file_search_call.searching",
    "response.file_search_call.completed",
    "response.web_search_call.in_progress",
    "response.web_search_call.searching",
    "response.web_search_call.completed",
    "response.code_interpreter_call.in_progress",
    "response.code_interpreter_call.interpreting",
    "response.code_interpreter_call.completed",
    "response.code_interpreter_call_code.delta",
    "response.code_interpreter_call_code.done",
    "response.image_generation_call.in_progress",
    "response.image_generation_call.generating",
    "response.image_generation_call.partial_image",
    "response.image_generation_call.completed",
    "response.mcp_call.in_progress",
    "response.mcp_call.completed",
    "response.mcp_call.failed",
    "response.mcp_call_arguments.delta",
    "response.mcp_call_arguments.done",
    "response.mcp_list_tools.in_progress",
    "response.mcp_list_tools.completed",
    "response.mcp_list_tools.failed",
    "response.custom_tool_call_input.delta",
    "response.custom_tool_call_input.done",
    "response.audio.delta",
    "response.audio.done",
    "response.audio.transcript.delta",
    "response.audio.transcript.done",
];

#[derive(Debug, Clone)]
pub struct Responses {
    name: String,
    usage_policy: UsagePolicy,
}

impl Responses {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), usage_policy: UsagePolicy::Replace }
    }

    pub fn with_usage_policy(mut self, policy: UsagePolicy) -> Self {
        self.usage_policy = policy;
        self
    }

    fn output_item_added(&self, payload: &Value) -> Vec<CanonicalDeltaEvent> {
        let item = payload.get("item").unwrap_or(&Value::Null);
        let position = payload.get("output_index").and_then(Value::as_u64).map(|n| n as u32);
        match str_field(item, "type") {
            Some("function_call") => {
                let item_id = str_field(item, "id").map(str::to_string);
                let mut events = vec![CanonicalDeltaEvent::ToolCallStarted {
                    index: 0,
                    call_id: str_field(item, "call_id").map(str::to_string),
                    item_id: item_id.clone(),
                    position,
                    name: str_field(item, "name").map(str::to_string),
                    role: None,
                }];
                if let Some(args) = str_field(item, "arguments").filter(|a| !a.is_empty()) {
                    events.push(CanonicalDeltaEvent::ToolCallArgumentsDelta {
                        index: 0,
                        key: ToolCallKey { id: item_id, position },
                        fragment: args.to_string(),
                    });
                }
                events
            }
            Some("message") => {
                let role = str_field(item, "role").and_then(Role::from_wire);
                vec![CanonicalDeltaEvent::ContentDelta { index: 0, text: String::new(), role }]
            }
            other => vec![CanonicalDeltaEvent::ignorable(format!(
                "response.output_item.added:{}",
                other.unwrap_or("untyped")
            ))],
        }
    }

    /// Usage and terminal status from `response.completed` / `response.incomplete`.
    fn terminal(&self, payload: &Value) -> Vec<CanonicalDeltaEvent> {
        let response = payload.get("response").unwrap_or(&Value::Null);
        let mut events = Vec::new();
        if let Some(report) = response
            .get("usage")
            .and_then(|u| UsageReport::from_object(u, "input_tokens", "output_tokens"))
        {
            events.push(CanonicalDeltaEvent::Usage { index: Some(0), usage: report });
        }

        let status = match str_field(response, "status") {
            Some("completed") | None => Some(Status::Complete),
            Some("incomplete") => {
                let reason = response
                    .get("incomplete_details")
                    .and_then(|d| str_field(d, "reason"))
                    .unwrap_or_default();
                match reason {
                    "max_output_tokens" | "max_tokens" => Some(Status::Length),
                    "content_filter" => Some(Status::Complete),
                    other => {
                        warn!(
                            provider = %self.name,
                            reason = %other,
                            "unrecognized incomplete reason; skipping"
                        );
                        None
                    }
                }
            }
            Some(other) => {
                warn!(
                    provider = %self.name,
                    status = %other,
                    "unrecognized response status; skipping"
                );
                None
            }
        };
        if let Some(status) = status {
            events.push(CanonicalDeltaEvent::Finish { index: 0, status });
        }
        events
    }
}

impl EventNormalizer for Responses {
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
        matches!(code, "server_error" | "internal_error" | "timeout" | "overloaded")
    }

    fn normalize_value(
        &self,
        _event: Option<&str>,
        payload: &Value,
    ) -> CoreResult<Vec<CanonicalDeltaEvent>> {
        let Some(kind) = str_field(payload, "type") else {
            return Err(unexpected(&self.name, describe_shape(payload)));
        };
        let item_key = || ToolCallKey {
            id: str_field(payload, "item_id").map(str::to_string),
            position: payload.get("output_index").and_then(Value::as_u64).map(|n| n as u32),
        };

        let events = match kind {
            "response.output_text.delta" => vec![CanonicalDeltaEvent::ContentDelta {
                index: 0,
                text: str_field(payload, "delta").unwrap_or_default().to_string(),
                role: None,
            }],
            "response.output_text.done" => vec![CanonicalDeltaEvent::ContentDone {
                index: 0,
                content_index: index_field(payload, "content_index"),
            }],
            "response.output_item.added" => self.output_item_added(payload),
            "response.function_call_arguments.delta" => {
                vec![CanonicalDeltaEvent::ToolCallArgumentsDelta {
                    index: 0,
                    key: item_key(),
                    fragment: str_field(payload, "delta").unwrap_or_default().to_string(),
                }]
            }
            "response.function_call_arguments.done" => vec![CanonicalDeltaEvent::ToolCallDone {
                index: 0,
                key: item_key(),
                arguments: str_field(payload, "arguments").map(str::to_string),
            }],
            "response.completed" | "response.incomplete" => self.terminal(payload),
            "response.failed" => {
                let err = payload
                    .get("response")
                    .and_then(|r| r.get("error"))
                    .unwrap_or(&Value::Null);
                vec![CanonicalDeltaEvent::Error(error_envelope(err, &["code", "type"]))]
            }
            "error" => vec![CanonicalDeltaEvent::Error(error_envelope(payload, &["code", "type"]))],
            other if IGNORABLE_EVENTS.contains(&other) => {
                vec![CanonicalDeltaEvent::ignorable(other)]
            }
            other => return Err(unexpected(&self.name, format!("event type '{other}'"))),
        };
        Ok(events)
    }
}
