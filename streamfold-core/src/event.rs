//! Canonical, provider-agnostic form of one decoded frame.
//!
//! Normalizers produce these; the [`crate::merger::DeltaMerger`] consumes
//! them. The set is closed: a provider shape that maps to none of the
//! variants is an `UnexpectedEventShape` error, never a silent skip.

use serde_json::{Map, Value};

use crate::model::{Role, Status, Usage};

/// Identifies a tool-call slot. Providers address slots differently: by
/// call id, by item id, by their position in the message, or implicitly
/// (the slot started most recently).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolCallKey {
    pub id: Option<String>,
    pub position: Option<u32>,
}

impl ToolCallKey {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self { id: Some(id.into()), position: None }
    }

    pub fn by_position(position: u32) -> Self {
        Self { id: None, position: Some(position) }
    }

    /// The slot started most recently.
    pub fn latest() -> Self {
        Self::default()
    }
}

/// Usage snapshot as reported by the provider. Missing counters are `None`
/// so that partial reports can be merged.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UsageReport {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub raw: Map<String, Value>,
}

impl UsageReport {
    /// Reads the counters at `input_key` / `output_key` out of a usage object.
    pub fn from_object(obj: &Value, input_key: &str, output_key: &str) -> Option<Self> {
        let raw = obj.as_object()?;
        Some(Self {
            input_tokens: raw.get(input_key).and_then(Value::as_u64),
            output_tokens: raw.get(output_key).and_then(Value::as_u64),
            raw: raw.clone(),
        })
    }

    pub fn into_usage(self) -> Usage {
        Usage {
            input_tokens: self.input_tokens.unwrap_or(0),
            output_tokens: self.output_tokens.unwrap_or(0),
            raw: self.raw,
        }
    }
}

/// Explicit error envelope found in a stream payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalDeltaEvent {
    /// Text for choice `index`. An empty fragment may still carry the role.
    ContentDelta {
        index: u32,
        text: String,
        role: Option<Role>,
    },
    /// Content part `content_index` of choice `index` is complete.
    ContentDone { index: u32, content_index: u32 },
    ToolCallStarted {
        index: u32,
        /// Id surfaced on the final `ToolCall`; synthesized when absent.
        call_id: Option<String>,
        /// Secondary id the provider uses to address later fragments.
        item_id: Option<String>,
        position: Option<u32>,
        name: Option<String>,
        role: Option<Role>,
    },
    ToolCallArgumentsDelta {
        index: u32,
        key: ToolCallKey,
        fragment: String,
    },
    ToolCallDone {
        index: u32,
        key: ToolCallKey,
        /// Full argument text, when the provider repeats it on completion.
        arguments: Option<String>,
    },
    Finish { index: u32, status: Status },
    /// `index: None` applies to every open index.
    Usage { index: Option<u32>, usage: UsageReport },
    Error(ErrorEnvelope),
    /// A known event kind that carries nothing the merger models.
    Ignorable { kind: String },
}

impl CanonicalDeltaEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ContentDelta { .. } => "content_delta",
            Self::ContentDone { .. } => "content_done",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::ToolCallArgumentsDelta { .. } => "tool_call_arguments_delta",
            Self::ToolCallDone { .. } => "tool_call_done",
            Self::Finish { .. } => "finish",
            Self::Usage { .. } => "usage",
            Self::Error(_) => "error",
            Self::Ignorable { .. } => "ignorable",
        }
    }

    pub fn ignorable(kind: impl Into<String>) -> Self {
        Self::Ignorable { kind: kind.into() }
    }
}
