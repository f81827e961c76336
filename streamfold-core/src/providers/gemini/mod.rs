//! Google AI `streamGenerateContent?alt=sse` chunks.
//!
//! Gemini repeats `usageMetadata` on every chunk with growing counts; each
//! occurrence becomes a usage event and the merger treats it per the
//! configured [`UsagePolicy`] (cumulative snapshots by default).

use serde_json::Value;
use tracing::warn;

use crate::error::CoreResult;
use crate::event::{CanonicalDeltaEvent, ErrorEnvelope, ToolCallKey, UsageReport};
use crate::frame::Dialect;
use crate::model::{Role, Status};
use crate::normalizer::{
    EventNormalizer, UsagePolicy, describe_shape, error_envelope, index_field, str_field,
    unexpected,
};

#[derive(Debug, Clone)]
pub struct Gemini {
    name: String,
    usage_policy: UsagePolicy,
}

enum Finish {
    Status(Status),
    Error(ErrorEnvelope),
}

impl Gemini {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), usage_policy: UsagePolicy::Replace }
    }

    pub fn with_usage_policy(mut self, policy: UsagePolicy) -> Self {
        self.usage_policy = policy;
        self
    }

    fn map_finish(&self, reason: &str) -> Option<Finish> {
        match reason {
            "STOP" => Some(Finish::Status(Status::Complete)),
            "MAX_TOKENS" => Some(Finish::Status(Status::Length)),
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII"
            | "IMAGE_SAFETY" => Some(Finish::Status(Status::Complete)),
            "MALFORMED_FUNCTION_CALL" => Some(Finish::Error(ErrorEnvelope {
                code: "malformed_function_call".into(),
                message: "model produced a malformed function call".into(),
            })),
            other => {
                warn!(
                    provider = %self.name,
                    reason = %other,
                    "unrecognized finishReason; skipping"
                );
                None
            }
        }
    }

    fn push_candidate(
        &self,
        candidate: &Value,
        events: &mut Vec<CanonicalDeltaEvent>,
        finishes: &mut Vec<CanonicalDeltaEvent>,
    ) {
        let index = index_field(candidate, "index");
        let content = candidate.get("content").unwrap_or(&Value::Null);
        let role = str_field(content, "role").and_then(Role::from_wire);
        for part in content.get("parts").and_then(Value::as_array).into_iter().flatten() {
            if part.get("thought").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            if let Some(text) = str_field(part, "text") {
                events.push(CanonicalDeltaEvent::ContentDelta {
                    index,
                    text: text.to_string(),
                    role,
                });
            } else if let Some(call) = part.get("functionCall") {
                push_function_call(index, call, role, events);
            }
        }

        let finish = candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .and_then(|r| self.map_finish(r));
        match finish {
            Some(Finish::Status(status)) => {
                finishes.push(CanonicalDeltaEvent::Finish { index, status })
            }
            Some(Finish::Error(env)) => finishes.push(CanonicalDeltaEvent::Error(env)),
            None => {}
        }
    }
}

/// Gemini delivers each function call whole, so it starts, fills and
/// completes its slot in one go.
fn push_function_call(
    index: u32,
    call: &Value,
    role: Option<Role>,
    events: &mut Vec<CanonicalDeltaEvent>,
) {
    let id = str_field(call, "id").map(str::to_string);
    let key = match &id {
        Some(id) => ToolCallKey::by_id(id.clone()),
        None => ToolCallKey::latest(),
    };
    let arguments = call.get("args").map_or_else(|| "{}".to_string(), Value::to_string);
    events.push(CanonicalDeltaEvent::ToolCallStarted {
        index,
        call_id: id,
        item_id: None,
        position: None,
        name: str_field(call, "name").map(str::to_string),
        role,
    });
    events.push(CanonicalDeltaEvent::ToolCallArgumentsDelta {
        index,
        key: key.clone(),
        fragment: arguments,
    });
    events.push(CanonicalDeltaEvent::ToolCallDone { index, key, arguments: None });
}

impl EventNormalizer for Gemini {
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
        matches!(code, "UNAVAILABLE" | "INTERNAL" | "DEADLINE_EXCEEDED" | "500" | "503" | "504")
    }

    fn normalize_value(
        &self,
        _event: Option<&str>,
        payload: &Value,
    ) -> CoreResult<Vec<CanonicalDeltaEvent>> {
        if let Some(err) = payload.get("error").filter(|e| !e.is_null()) {
            return Ok(vec![CanonicalDeltaEvent::Error(error_envelope(err, &["status", "code"]))]);
        }

        let candidates = payload.get("candidates").and_then(Value::as_array);
        let usage = payload.get("usageMetadata");
        if candidates.is_none() && usage.is_none() {
            if let Some(reason) = payload
                .get("promptFeedback")
                .and_then(|f| str_field(f, "blockReason"))
            {
                return Ok(vec![CanonicalDeltaEvent::Error(ErrorEnvelope {
                    code: format!("prompt_blocked:{reason}"),
                    message: "prompt was blocked before generation".into(),
                })]);
            }
            return Err(unexpected(&self.name, describe_shape(payload)));
        }

        let mut events = Vec::new();
        let mut finishes = Vec::new();
        for candidate in candidates.into_iter().flatten() {
            self.push_candidate(candidate, &mut events, &mut finishes);
        }
        if let Some(report) = usage.and_then(|u| {
            UsageReport::from_object(u, "promptTokenCount", "candidatesTokenCount")
        }) {
            events.push(CanonicalDeltaEvent::Usage { index: None, usage: report });
        }
        events.extend(finishes);
        Ok(events)
    }
}
