//! Observer fan-out for the stream driver.
//!
//! Contract:
//! - Every `Delta` and `AccumulatedMessage` is handed to each observer, in
//!   registration order, before the driver reads the next chunk.
//! - Delivery is at-least-once per attempt. After a retry the new attempt
//!   starts over; observers see a fresh role-bearing first delta and must
//!   reset anything they accumulated themselves.
//! - A panicking observer is logged and skipped; it never aborts the stream
//!   or affects other observers.
//! - Usage reported after the body finished an index (chat-completions
//!   `include_usage`) arrives through `on_usage` once the body ends, after
//!   `on_message` already fired for that index.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::warn;

use crate::error::StreamError;
use crate::model::{AccumulatedMessage, Delta, Usage};

/// Receives stream progress. All hooks default to no-ops.
pub trait StreamObserver: Send + Sync {
    fn on_delta(&self, _delta: &Delta) {}
    fn on_message(&self, _message: &AccumulatedMessage) {}
    /// Usage for a message that was already delivered without it.
    fn on_usage(&self, _index: u32, _usage: &Usage) {}
    /// Non-fatal diagnostics (dropped frames, unexpected events).
    fn on_error(&self, _error: &StreamError) {}
    /// The driver is about to re-open the transport for `attempt`.
    fn on_retry(&self, _attempt: u32, _error: &StreamError) {}
}

/// Registered observers, each call isolated with `catch_unwind`.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn StreamObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn StreamObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn delta(&self, delta: &Delta) -> usize {
        self.each("on_delta", |o| o.on_delta(delta))
    }

    pub fn message(&self, message: &AccumulatedMessage) -> usize {
        self.each("on_message", |o| o.on_message(message))
    }

    pub fn usage(&self, index: u32, usage: &Usage) -> usize {
        self.each("on_usage", |o| o.on_usage(index, usage))
    }

    pub fn error(&self, error: &StreamError) -> usize {
        self.each("on_error", |o| o.on_error(error))
    }

    pub fn retry(&self, attempt: u32, error: &StreamError) -> usize {
        self.each("on_retry", |o| o.on_retry(attempt, error))
    }

    /// Returns how many observers panicked.
    fn each(&self, hook: &'static str, f: impl Fn(&dyn StreamObserver)) -> usize {
        let mut panicked = 0;
        for (position, observer) in self.observers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                panicked += 1;
                warn!(hook, observer = position, "stream observer panicked; continuing");
            }
        }
        panicked
    }
}

/// What an observer saw, in order.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Delta(Delta),
    Message(AccumulatedMessage),
    Usage { index: u32, usage: Usage },
    /// Diagnostic that did not stop the stream.
    Error { kind: String, message: String },
    Retry { attempt: u32, reason: String },
}

impl StreamEvent {
    /// Returns true for a finished message.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Message(_))
    }

    /// Convenience accessor for a delta's text fragment.
    pub fn as_text_delta(&self) -> Option<&str> {
        match self {
            Self::Delta(d) => d.content_fragment.as_deref(),
            _ => None,
        }
    }
}

/// Observer that records everything it sees.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<StreamEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Concatenated text of every delta delivered for `index`, across attempts.
    pub fn text(&self, index: u32) -> String {
        self.events()
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Delta(d) if d.index == index => d.content_fragment.clone(),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: StreamEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

impl StreamObserver for RecordingObserver {
    fn on_delta(&self, delta: &Delta) {
        self.push(StreamEvent::Delta(delta.clone()));
    }

    fn on_message(&self, message: &AccumulatedMessage) {
        self.push(StreamEvent::Message(message.clone()));
    }

    fn on_usage(&self, index: u32, usage: &Usage) {
        self.push(StreamEvent::Usage { index, usage: usage.clone() });
    }

    fn on_error(&self, error: &StreamError) {
        self.push(StreamEvent::Error {
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
    }

    fn on_retry(&self, attempt: u32, error: &StreamError) {
        self.push(StreamEvent::Retry { attempt, reason: error.to_string() });
    }
}

/// Adapts a pair of closures to [`StreamObserver`].
pub struct FnObserver<D, M> {
    on_delta: D,
    on_message: M,
}

impl<D, M> FnObserver<D, M>
where
    D: Fn(&Delta) + Send + Sync,
    M: Fn(&AccumulatedMessage) + Send + Sync,
{
    pub fn new(on_delta: D, on_message: M) -> Self {
        Self { on_delta, on_message }
    }
}

impl<D, M> StreamObserver for FnObserver<D, M>
where
    D: Fn(&Delta) + Send + Sync,
    M: Fn(&AccumulatedMessage) + Send + Sync,
{
    fn on_delta(&self, delta: &Delta) {
        (self.on_delta)(delta)
    }

    fn on_message(&self, message: &AccumulatedMessage) {
        (self.on_message)(message)
    }
}
