use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreResult, StreamError};
use crate::event::{CanonicalDeltaEvent, ErrorEnvelope, UsageReport};
use crate::frame::{Dialect, Frame};
use crate::model::Usage;
use crate::provider_factory::ProviderRegistry;

/// How successive usage reports for one index combine.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UsagePolicy {
    /// Each report is a cumulative snapshot and replaces the previous one.
    Replace,
    /// Counters present in the report overwrite; absent ones are kept.
    Merge,
    /// Each report is an increment and is added to the running total.
    Accumulate,
}

impl UsagePolicy {
    pub fn apply(self, current: Option<Usage>, report: UsageReport) -> Usage {
        match self {
            Self::Replace => report.into_usage(),
            Self::Merge => {
                let mut usage = current.unwrap_or_default();
                if let Some(n) = report.input_tokens {
                    usage.input_tokens = n;
                }
                if let Some(n) = report.output_tokens {
                    usage.output_tokens = n;
                }
                usage.raw.extend(report.raw);
                usage
            }
            Self::Accumulate => {
                let mut usage = current.unwrap_or_default();
                usage.input_tokens += report.input_tokens.unwrap_or(0);
                usage.output_tokens += report.output_tokens.unwrap_or(0);
                usage.raw.extend(report.raw);
                usage
            }
        }
    }
}

/// Maps one provider's decoded frames onto canonical events.
///
/// Implementations are pure: the same frame always yields the same events.
/// A frame can yield several events (content, then usage, then finish), or
/// none at all.
pub trait EventNormalizer: Send + Sync {
    /// Provider name used in errors and telemetry.
    fn provider(&self) -> &str;

    fn dialect(&self) -> Dialect;

    fn usage_policy(&self) -> UsagePolicy;

    /// Provider-specific table: may an error envelope with this code be retried?
    fn is_transient(&self, code: &str) -> bool;

    /// True when every client tool call is opened by a start event, so
    /// argument fragments that match no open call belong to something else
    /// (a server-side tool block) and are dropped.
    fn announces_tool_calls(&self) -> bool {
        false
    }

    fn normalize_value(&self, event: Option<&str>, payload: &Value)
    -> CoreResult<Vec<CanonicalDeltaEvent>>;

    fn normalize(&self, frame: &Frame) -> CoreResult<Vec<CanonicalDeltaEvent>> {
        let payload = frame.json().map_err(|e| StreamError::FrameDecode {
            reason: format!("frame payload is not JSON: {e}"),
            discarded_bytes: frame.payload.len(),
        })?;
        self.normalize_value(frame.event.as_deref(), &payload)
    }
}

/// Normalize `frame` with the normalizer registered under `provider`.
pub fn normalize(
    registry: &ProviderRegistry,
    provider: &str,
    frame: &Frame,
) -> CoreResult<Vec<CanonicalDeltaEvent>> {
    let normalizer = registry.get(provider).ok_or_else(|| {
        StreamError::Validation(format!("no event normalizer registered for provider '{provider}'"))
    })?;
    normalizer.normalize(frame)
}

pub(crate) fn unexpected(provider: &str, event: impl Into<String>) -> StreamError {
    StreamError::UnexpectedEventShape { provider: provider.to_string(), event: event.into() }
}

/// Reads an index-like field, defaulting to 0 when absent.
pub(crate) fn index_field(v: &Value, key: &str) -> u32 {
    v.get(key).and_then(Value::as_u64).map_or(0, |n| n as u32)
}

pub(crate) fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

/// Builds an error envelope from the first of `code_keys` present on `err`
/// (string or number), falling back to "unknown".
pub(crate) fn error_envelope(err: &Value, code_keys: &[&str]) -> ErrorEnvelope {
    let code = code_keys
        .iter()
        .find_map(|k| match err.get(*k) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| "unknown".to_string());
    let message = str_field(err, "message").unwrap_or("no message").to_string();
    ErrorEnvelope { code, message }
}

/// Short description of a payload's shape for `UnexpectedEventShape`.
pub(crate) fn describe_shape(v: &Value) -> String {
    match v.as_object() {
        Some(obj) => {
            let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
            format!("object with keys [{}]", keys.join(", "))
        }
        None => format!("non-object payload ({})", json_type(v)),
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
