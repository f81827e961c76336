use thiserror::Error;

/// Core error type for streamfold.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// Buffered bytes that never became a frame and were discarded.
    #[error("frame decode failed ({reason}); discarded {discarded_bytes} bytes")]
    FrameDecode {
        reason: String,
        discarded_bytes: usize,
    },

    #[error("unexpected event shape from {provider}: {event}")]
    UnexpectedEventShape { provider: String, event: String },

    #[error("upstream error from {provider}: {code} {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
        transient: bool,
    },

    #[error("rate limited by provider {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("provider unavailable: {provider}")]
    ProviderUnavailable { provider: String },

    #[error("transport timed out talking to {provider}")]
    TransportTimeout { provider: String },

    #[error("transport closed by {provider}: {reason}")]
    TransportClosed { provider: String, reason: String },

    #[error("tool call {call_id} ({name}) has malformed arguments: {source}")]
    MalformedToolCallArguments {
        call_id: String,
        name: String,
        arguments: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{provider} ended the stream without a terminal event for indices {indices:?}")]
    MissingTerminal { provider: String, indices: Vec<u32> },

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<StreamError>,
    },

    #[error("stream cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StreamError {
    /// Whether the stream driver may re-issue the request after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransportTimeout { .. }
            | Self::TransportClosed { .. }
            | Self::ProviderUnavailable { .. } => true,
            Self::ProviderError { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Short, stable label used for telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::FrameDecode { .. } => "frame_decode",
            Self::UnexpectedEventShape { .. } => "unexpected_event_shape",
            Self::ProviderError { .. } => "provider_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::TransportTimeout { .. } => "transport_timeout",
            Self::TransportClosed { .. } => "transport_closed",
            Self::MalformedToolCallArguments { .. } => "malformed_tool_call_arguments",
            Self::MissingTerminal { .. } => "missing_terminal",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, StreamError>;
