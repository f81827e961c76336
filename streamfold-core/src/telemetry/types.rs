use serde::{Deserialize, Serialize};

/// One record per driver run, covering every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StreamTrace {
    /// Provider identifier, e.g. "openai", "anthropic".
    pub provider: Option<String>,

    /// Transport opens, including the first.
    pub attempts: u32,

    pub frames: u64,
    pub deltas: u64,
    pub messages: u64,
    /// Buffered bytes given up on by the frame decoder.
    pub discarded_frames: u64,
    pub unexpected_events: u64,
    pub observer_panics: u64,

    /// "completed", "failed" or "cancelled".
    pub final_state: Option<String>,
    /// Status of the lowest-index message, e.g. "complete", "length".
    pub finish_status: Option<String>,

    pub tokens_input: Option<u64>,
    pub tokens_output: Option<u64>,
    pub tokens_total: Option<u64>,

    /// Elapsed wall time of the whole run in milliseconds.
    pub latency_ms: Option<u128>,

    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl StreamTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }

    pub fn set_tokens(
        mut self,
        input: Option<u64>,
        output: Option<u64>,
        total: Option<u64>,
    ) -> Self {
        self.tokens_input = input;
        self.tokens_output = output;
        self.tokens_total = total;
        self
    }

    pub fn final_state(mut self, state: &str) -> Self {
        self.final_state = Some(state.to_string());
        self
    }

    pub fn finish_status_opt(mut self, status: Option<&str>) -> Self {
        self.finish_status = status.map(|s| s.to_string());
        self
    }

    pub fn latency_ms(mut self, ms: u128) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn error_kind(mut self, kind: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self
    }

    pub fn error_message(mut self, msg: &str) -> Self {
        self.error_message = Some(msg.to_string());
        self
    }
}
