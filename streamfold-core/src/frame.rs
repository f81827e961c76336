//! Frame recombiner: raw SSE bytes in, self-contained JSON frames out.
//!
//! The decoder only interprets complete lines, so chunk boundaries (including
//! ones that fall inside a multi-byte codepoint) never change the frames it
//! produces. A frame candidate is tried as JSON at every delimiter; candidates
//! that do not parse stay buffered and are joined with the lines that follow.
//!
//! Buffer policy: a candidate that keeps failing is dropped after
//! `max_resplit_depth` attempts, and the whole buffer is dropped once it grows
//! past `max_buffer_bytes`. Both cases log a warning and are reported through
//! [`Decoded::discarded`]; nothing is dropped silently and decoding continues.

use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StreamError;

pub const DEFAULT_MAX_RESPLIT_DEPTH: usize = 10;
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const DONE_SENTINEL: &str = "[DONE]";

/// SSE flavour spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Bare `data: <json>` frames. Every `data:` marker starts a new
    /// candidate, so servers that omit the blank line are still split.
    Data,
    /// `event: <name>` / `data: <json>` pairs. Adjacent `data:` lines belong
    /// to one payload.
    EventData,
}

/// One self-contained protocol unit, ready for JSON parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: Option<String>,
    pub payload: String,
}

impl Frame {
    pub fn data(payload: impl Into<String>) -> Self {
        Self { event: None, payload: payload.into() }
    }

    pub fn named(event: impl Into<String>, payload: impl Into<String>) -> Self {
        Self { event: Some(event.into()), payload: payload.into() }
    }

    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.payload)
    }
}

/// Result of one decode call.
#[derive(Debug, Default)]
pub struct Decoded {
    pub frames: Vec<Frame>,
    /// `FrameDecode` errors for buffered bytes that were given up on.
    pub discarded: Vec<StreamError>,
}

/// Incremental SSE frame decoder. One instance per HTTP response.
#[derive(Debug)]
pub struct FrameDecoder {
    dialect: Dialect,
    max_depth: usize,
    max_buffer: usize,
    /// Bytes of the line currently being received.
    line: Vec<u8>,
    event: Option<String>,
    data: Option<String>,
    /// Offset in `data` where the most recently joined `data:` segment starts.
    segment_start: usize,
    failures: usize,
    done: bool,
}

impl FrameDecoder {
    pub fn new(dialect: Dialect) -> Self {
        Self::with_limits(dialect, DEFAULT_MAX_RESPLIT_DEPTH, DEFAULT_MAX_BUFFER_BYTES)
    }

    pub fn with_limits(
        dialect: Dialect,
        max_resplit_depth: usize,
        max_buffer_bytes: usize,
    ) -> Self {
        Self {
            dialect,
            max_depth: max_resplit_depth,
            max_buffer: max_buffer_bytes.max(1),
            line: Vec::new(),
            event: None,
            data: None,
            segment_start: 0,
            failures: 0,
            done: false,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// True once the `[DONE]` end marker has been consumed.
    pub fn saw_done(&self) -> bool {
        self.done
    }

    /// Bytes currently carried over to the next call.
    pub fn buffered_len(&self) -> usize {
        self.line.len() + self.data.as_ref().map_or(0, String::len)
    }

    /// Append a raw chunk and return every frame it completes.
    pub fn decode(&mut self, chunk: impl AsRef<[u8]>) -> Decoded {
        let mut out = Decoded::default();
        let mut rest = chunk.as_ref();
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.line.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];
            let line = std::mem::take(&mut self.line);
            self.on_line(&line, &mut out);
        }
        self.line.extend_from_slice(rest);

        let buffered = self.buffered_len();
        if buffered > self.max_buffer {
            warn!(
                buffered,
                limit = self.max_buffer,
                "sse buffer exceeded its limit; dropping buffered bytes"
            );
            self.reset();
            out.discarded.push(StreamError::FrameDecode {
                reason: format!("buffer exceeded {} bytes", self.max_buffer),
                discarded_bytes: buffered,
            });
        }
        out
    }

    /// Flush whatever is left once the response body has ended.
    pub fn finish(&mut self) -> Decoded {
        let mut out = Decoded::default();
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.on_line(&line, &mut out);
        }
        self.close_candidate(&mut out);
        if let Some(data) = self.data.take() {
            warn!(bytes = data.len(), "stream ended inside an incomplete frame");
            out.discarded.push(StreamError::FrameDecode {
                reason: "stream ended inside an incomplete frame".into(),
                discarded_bytes: data.len(),
            });
        }
        self.reset();
        out
    }

    fn reset(&mut self) {
        self.line.clear();
        self.event = None;
        self.data = None;
        self.segment_start = 0;
        self.failures = 0;
    }

    fn on_line(&mut self, raw: &[u8], out: &mut Decoded) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        if line.is_empty() {
            self.close_candidate(out);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        // A field name without a colon carries an empty value.
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, field_value(value)),
            None => (&*line, ""),
        };
        match field {
            "event" => {
                if self.data.is_some() {
                    self.close_candidate(out);
                }
                self.event = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => {
                if self.data.is_some() && self.dialect == Dialect::Data {
                    self.close_candidate(out);
                }
                self.push_data(value);
            }
            "id" | "retry" => {}
            _ => self.push_continuation(&line),
        }
    }

    fn push_data(&mut self, value: &str) {
        match &mut self.data {
            Some(data) => {
                data.push('\n');
                self.segment_start = data.len();
                data.push_str(value);
            }
            None => {
                self.segment_start = 0;
                self.data = Some(value.to_string());
            }
        }
    }

    fn push_continuation(&mut self, line: &str) {
        match &mut self.data {
            Some(data) => {
                data.push('\n');
                data.push_str(line);
            }
            None => debug!(line = %line, "ignoring line outside of any frame"),
        }
    }

    /// Try the pending candidate as a frame.
    fn close_candidate(&mut self, out: &mut Decoded) {
        let Some(data) = self.data.take() else {
            // `event:` followed by a blank line and no data dispatches nothing.
            self.event = None;
            return;
        };
        let candidate = data.trim();
        if candidate.is_empty() {
            self.event = None;
            self.failures = 0;
            return;
        }
        if self.accept(candidate, out) {
            return;
        }

        // The newest segment may be a valid frame behind stale garbage.
        if self.segment_start > 0 {
            let tail = data[self.segment_start..].trim();
            if !tail.is_empty() && is_frame_payload(tail) {
                let stale = self.segment_start;
                warn!(bytes = stale, "dropping unparseable bytes ahead of a valid frame");
                out.discarded.push(StreamError::FrameDecode {
                    reason: "unparseable bytes ahead of a valid frame".into(),
                    discarded_bytes: stale,
                });
                self.accept(tail, out);
                return;
            }
        }

        self.failures += 1;
        if self.failures > self.max_depth {
            warn!(
                attempts = self.failures,
                bytes = data.len(),
                "frame candidate never became valid JSON; dropping it"
            );
            out.discarded.push(StreamError::FrameDecode {
                reason: format!("no valid JSON after {} attempts", self.failures),
                discarded_bytes: data.len(),
            });
            self.event = None;
            self.segment_start = 0;
            self.failures = 0;
        } else {
            debug!(attempt = self.failures, "incomplete frame candidate; buffering");
            self.data = Some(data);
        }
    }

    /// Emits `candidate` if it is a frame or the end marker.
    fn accept(&mut self, candidate: &str, out: &mut Decoded) -> bool {
        if candidate == DONE_SENTINEL {
            self.done = true;
        } else if is_frame_payload(candidate) {
            out.frames.push(Frame { event: self.event.take(), payload: candidate.to_string() });
        } else {
            return false;
        }
        self.event = None;
        self.segment_start = 0;
        self.failures = 0;
        true
    }
}

fn field_value(raw: &str) -> &str {
    raw.strip_prefix(' ').unwrap_or(raw)
}

/// Provider events are JSON objects or arrays; a bare scalar is never a frame.
fn is_frame_payload(s: &str) -> bool {
    s == DONE_SENTINEL
        || s.starts_with(['{', '[']) && serde_json::from_str::<IgnoredAny>(s).is_ok()
}
