use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    #[default]
    Assistant,
    Tool,
}

impl Role {
    /// Parses the role strings providers put on the wire. Gemini calls the
    /// assistant "model".
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "system" | "developer" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" | "model" => Some(Self::Assistant),
            "tool" | "function" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// Completion status of one choice index. Only moves forward:
/// `Incomplete` → `Complete` | `Length`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Incomplete,
    Complete,
    Length,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Incomplete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::Complete => "complete",
            Self::Length => "length",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// The provider's usage object as received (last snapshot wins per key).
    #[serde(default)]
    pub raw: serde_json::Map<String, serde_json::Value>,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One partial piece of a tool invocation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolCallFragment {
    pub call_id: String,
    pub name_fragment: Option<String>,
    pub arguments_fragment: Option<String>,
    /// Position of the tool call inside its message.
    pub index: u32,
}

/// Externally visible partial-message update.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Delta {
    pub role: Option<Role>,
    pub content_fragment: Option<String>,
    #[serde(default)]
    pub tool_call_fragments: Vec<ToolCallFragment>,
    pub status: Status,
    pub index: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    /// Raw JSON text; guaranteed to parse once the owning message is terminal.
    pub arguments: String,
}

impl ToolCall {
    pub fn arguments_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.arguments)
    }
}

/// Terminal merged result for one choice index.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AccumulatedMessage {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub status: Status,
    pub usage: Option<Usage>,
    pub index: u32,
}
