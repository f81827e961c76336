//! Chat-completions stream chunks (OpenAI and the compatible family: Groq,
//! DeepSeek, Grok, Perplexity, Azure, local servers).

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

#[derive(Debug, Clone)]
pub struct ChatCompletions {
    name: String, // "openai", "groq", ...
    usage_policy: UsagePolicy,
}

impl ChatCompletions {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), usage_policy: UsagePolicy::Replace }
    }

    pub fn with_usage_policy(mut self, policy: UsagePolicy) -> Self {
        self.usage_policy = policy;
        self
    }

    fn push_choice(
        &self,
        choice: &Value,
        events: &mut Vec<CanonicalDeltaEvent>,
    ) -> Option<CanonicalDeltaEvent> {
        let index = index_field(choice, "index");
        if let Some(delta) = choice.get("delta") {
            let role = str_field(delta, "role").and_then(Role::from_wire);
            let text = str_field(delta, "content").unwrap_or_default();
            if role.is_some() || !text.is_empty() {
                events.push(CanonicalDeltaEvent::ContentDelta {
                    index,
                    text: text.to_string(),
                    role,
                });
            }
            for call in delta.get("tool_calls").and_then(Value::as_array).into_iter().flatten() {
                push_tool_call(index, call, events);
            }
        }

        match choice.get("finish_reason") {
            None | Some(Value::Null) => None,
            Some(Value::String(reason)) => match map_finish(reason) {
                Some(status) => Some(CanonicalDeltaEvent::Finish { index, status }),
                None => {
                    warn!(
                        provider = %self.name,
                        reason = %reason,
                        index,
                        "unrecognized finish_reason; skipping"
                    );
                    None
                }
            },
            Some(other) => {
                warn!(
                    provider = %self.name,
                    reason = %other,
                    index,
                    "non-string finish_reason; skipping"
                );
                None
            }
        }
    }
}

fn push_tool_call(index: u32, call: &Value, events: &mut Vec<CanonicalDeltaEvent>) {
    let position = call.get("index").and_then(Value::as_u64).map(|n| n as u32);
    let id = str_field(call, "id");
    let function = call.get("function");
    let name = function.and_then(|f| str_field(f, "name"));
    let arguments = function.and_then(|f| str_field(f, "arguments")).unwrap_or_default();

    if id.is_some() || name.is_some() {
        events.push(CanonicalDeltaEvent::ToolCallStarted {
            index,
            call_id: id.map(str::to_string),
            item_id: None,
            position,
            name: name.map(str::to_string),
            role: None,
        });
    }
    if !arguments.is_empty() {
        events.push(CanonicalDeltaEvent::ToolCallArgumentsDelta {
            index,
            key: ToolCallKey { id: id.map(str::to_string), position },
            fragment: arguments.to_string(),
        });
    }
}

/// `finish_reason` table shared by the chat-completions family.
pub(crate) fn map_finish(reason: &str) -> Option<Status> {
    match reason {
        "stop" | "tool_calls" | "content_filter" | "function_call" => Some(Status::Complete),
        "length" | "max_tokens" => Some(Status::Length),
        _ => None,
    }
}

impl EventNormalizer for ChatCompletions {
    fn provider(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> Dialect {
        Dialect::Data
    }

    fn usage_policy(&self) -> UsagePolicy {
        self.usage_policy
    }

    fn is_transient(&self, code: &str) -> bool {
        matches!(
            code,
            "server_error" | "internal_error" | "timeout" | "overloaded" | "service_unavailable"
        )
    }

    fn normalize_value(
        &self,
        _event: Option<&str>,
        payload: &Value,
    ) -> CoreResult<Vec<CanonicalDeltaEvent>> {
        if let Some(err) = payload.get("error").filter(|e| !e.is_null()) {
            return Ok(vec![CanonicalDeltaEvent::Error(error_envelope(err, &["code", "type"]))]);
        }

        let choices = payload.get("choices").and_then(Value::as_array);
        let usage = payload.get("usage").filter(|u| !u.is_null());
        if choices.is_none() && usage.is_none() {
            return Err(unexpected(&self.name, describe_shape(payload)));
        }

        let mut events = Vec::new();
        let mut finishes = Vec::new();
        for choice in choices.into_iter().flatten() {
            if let Some(finish) = self.push_choice(choice, &mut events) {
                finishes.push(finish);
            }
        }
        if let Some(report) =
            usage.and_then(|u| UsageReport::from_object(u, "prompt_tokens", "completion_tokens"))
        {
            events.push(CanonicalDeltaEvent::Usage { index: None, usage: report });
        }
        events.extend(finishes);
        Ok(events)
    }
}
