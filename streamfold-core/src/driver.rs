//! Stream driver: transport → frames → canonical events → merged messages.
//!
//! States per run: `Connecting → Streaming → {Completed, Failed}`. Each
//! attempt gets a fresh decoder and merger; a transient failure re-issues the
//! whole request. Deltas delivered by an aborted attempt are not retracted.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

use crate::config::StreamCfg;
use crate::error::{CoreResult, StreamError};
use crate::event::CanonicalDeltaEvent;
use crate::frame::{Decoded, FrameDecoder};
use crate::merger::{DeltaMerger, Merged};
use crate::model::{AccumulatedMessage, Delta};
use crate::normalizer::EventNormalizer;
use crate::provider_factory::ProviderRegistry;
use crate::stream::{FnObserver, ObserverSet, StreamObserver};
use crate::telemetry::{self, StreamTrace};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Connecting,
    Streaming,
    Completed,
    Failed,
}

impl DriverState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

pub struct StreamDriver {
    normalizer: Arc<dyn EventNormalizer>,
    cfg: StreamCfg,
    observers: ObserverSet,
    cancel: CancellationToken,
}

impl StreamDriver {
    pub fn new(normalizer: Arc<dyn EventNormalizer>, cfg: StreamCfg) -> Self {
        Self { normalizer, cfg, observers: ObserverSet::new(), cancel: CancellationToken::new() }
    }

    pub fn from_registry(
        registry: &ProviderRegistry,
        provider: &str,
        cfg: StreamCfg,
    ) -> CoreResult<Self> {
        let normalizer = registry.get(provider).ok_or_else(|| {
            StreamError::Validation(format!(
                "no event normalizer registered for provider '{provider}'"
            ))
        })?;
        Ok(Self::new(normalizer, cfg))
    }

    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Use an externally owned token; cancelling it aborts the run at the
    /// next transport read.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn provider(&self) -> &str {
        self.normalizer.provider()
    }

    /// Run to completion and return the message for the lowest index.
    pub async fn run(&self, transport: &dyn Transport) -> CoreResult<AccumulatedMessage> {
        first(self.drive(transport, &self.observers).await?, self.provider())
    }

    /// Run to completion and return one message per index, ordered by index.
    pub async fn run_all(&self, transport: &dyn Transport) -> CoreResult<Vec<AccumulatedMessage>> {
        self.drive(transport, &self.observers).await
    }

    /// Like [`run`](Self::run), with two closures added to the registered observers.
    pub async fn run_with<D, M>(
        &self,
        transport: &dyn Transport,
        on_delta: D,
        on_message: M,
    ) -> CoreResult<AccumulatedMessage>
    where
        D: Fn(&Delta) + Send + Sync + 'static,
        M: Fn(&AccumulatedMessage) + Send + Sync + 'static,
    {
        let mut observers = self.observers.clone();
        observers.push(Arc::new(FnObserver::new(on_delta, on_message)));
        first(self.drive(transport, &observers).await?, self.provider())
    }

    async fn drive(
        &self,
        transport: &dyn Transport,
        observers: &ObserverSet,
    ) -> CoreResult<Vec<AccumulatedMessage>> {
        let provider = self.provider().to_string();
        let started = Instant::now();
        let mut trace = StreamTrace::new().provider(&provider);
        let mut attempt = 0u32;

        let result = loop {
            attempt += 1;
            trace.attempts = attempt;
            let span = info_span!("stream.attempt", provider = %provider, attempt);
            let outcome = self.attempt(transport, observers, &mut trace).instrument(span).await;
            match outcome {
                Ok(messages) => break Ok(messages),
                Err(err) if err.is_transient() && attempt <= self.cfg.max_retries => {
                    warn!(
                        provider = %provider,
                        attempt,
                        error = %err,
                        "transient stream failure; re-issuing request"
                    );
                    trace.observer_panics += observers.retry(attempt + 1, &err) as u64;
                }
                Err(err) if err.is_transient() => {
                    break Err(StreamError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => break Err(err),
            }
        };

        let state = if result.is_ok() { DriverState::Completed } else { DriverState::Failed };
        match &result {
            Ok(messages) => info!(
                provider = %provider,
                attempts = attempt,
                messages = messages.len(),
                "stream completed"
            ),
            Err(err) => {
                warn!(provider = %provider, attempts = attempt, error = %err, "stream failed")
            }
        }
        telemetry::emit(finish_trace(trace, state, &result, started));
        result
    }

    async fn attempt(
        &self,
        transport: &dyn Transport,
        observers: &ObserverSet,
        trace: &mut StreamTrace,
    ) -> CoreResult<Vec<AccumulatedMessage>> {
        debug!(state = DriverState::Connecting.as_str());
        let mut body = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(StreamError::Cancelled),
            opened = transport.open() => opened?,
        };

        debug!(state = DriverState::Streaming.as_str());
        let mut decoder = FrameDecoder::with_limits(
            self.normalizer.dialect(),
            self.cfg.max_resplit_depth,
            self.cfg.max_buffer_bytes,
        );
        let mut merger = DeltaMerger::new(self.provider(), self.normalizer.usage_policy())
            .open_unannounced_tool_calls(!self.normalizer.announces_tool_calls());
        let mut messages = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(StreamError::Cancelled),
                next = body.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    let decoded = decoder.decode(&chunk);
                    self.apply(decoded, &mut merger, &mut messages, observers, trace)?;
                }
                Some(Err(err)) => return Err(err),
                None => break,
            }
        }
        self.apply(decoder.finish(), &mut merger, &mut messages, observers, trace)?;
        merger.finish_stream()?;

        // Chat-completions report usage in a chunk after the last finish.
        if let Some(usage) = merger.trailing_usage() {
            for message in messages.iter_mut().filter(|m| m.usage.is_none()) {
                message.usage = Some(usage.clone());
                trace.observer_panics += observers.usage(message.index, usage) as u64;
            }
        }
        messages.sort_by_key(|m| m.index);
        Ok(messages)
    }

    fn apply(
        &self,
        decoded: Decoded,
        merger: &mut DeltaMerger,
        messages: &mut Vec<AccumulatedMessage>,
        observers: &ObserverSet,
        trace: &mut StreamTrace,
    ) -> CoreResult<()> {
        for err in decoded.discarded {
            trace.discarded_frames += 1;
            trace.observer_panics += observers.error(&err) as u64;
        }

        for frame in decoded.frames {
            trace.frames += 1;
            let events = match self.normalizer.normalize(&frame) {
                Ok(events) => events,
                Err(err @ StreamError::UnexpectedEventShape { .. }) => {
                    trace.unexpected_events += 1;
                    if self.cfg.strict_events {
                        return Err(err);
                    }
                    warn!(error = %err, "unexpected provider event; skipping");
                    trace.observer_panics += observers.error(&err) as u64;
                    continue;
                }
                Err(err @ StreamError::FrameDecode { .. }) => {
                    trace.discarded_frames += 1;
                    warn!(error = %err, "frame is not JSON; skipping");
                    trace.observer_panics += observers.error(&err) as u64;
                    continue;
                }
                Err(err) => return Err(err),
            };

            for event in events {
                if let CanonicalDeltaEvent::Error(env) = &event {
                    return Err(StreamError::ProviderError {
                        provider: self.provider().to_string(),
                        code: env.code.clone(),
                        message: env.message.clone(),
                        transient: self.normalizer.is_transient(&env.code),
                    });
                }
                match merger.merge(event)? {
                    Merged::Delta(delta) => {
                        trace.deltas += 1;
                        trace.observer_panics += observers.delta(&delta) as u64;
                    }
                    Merged::Message(message) => {
                        trace.messages += 1;
                        trace.observer_panics += observers.message(&message) as u64;
                        messages.push(message);
                    }
                    Merged::Skip => {}
                }
            }
        }
        Ok(())
    }
}

fn first(messages: Vec<AccumulatedMessage>, provider: &str) -> CoreResult<AccumulatedMessage> {
    messages.into_iter().next().ok_or_else(|| StreamError::MissingTerminal {
        provider: provider.to_string(),
        indices: Vec::new(),
    })
}

fn finish_trace(
    trace: StreamTrace,
    state: DriverState,
    result: &CoreResult<Vec<AccumulatedMessage>>,
    started: Instant,
) -> StreamTrace {
    let trace = trace.latency_ms(started.elapsed().as_millis());
    match result {
        Ok(messages) => {
            let head = messages.first();
            let usage = head.and_then(|m| m.usage.as_ref());
            trace
                .final_state(state.as_str())
                .finish_status_opt(head.map(|m| m.status.as_str()))
                .set_tokens(
                    usage.map(|u| u.input_tokens),
                    usage.map(|u| u.output_tokens),
                    usage.map(|u| u.total()),
                )
        }
        Err(err) => {
            let final_state = if matches!(err, StreamError::Cancelled) {
                "cancelled"
            } else {
                state.as_str()
            };
            trace.final_state(final_state).error_kind(err.kind()).error_message(&err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Role, Status};
    use crate::normalizer::UsagePolicy;
    use crate::providers::anthropic::Anthropic;
    use crate::providers::gemini::Gemini;
    use crate::providers::openai_responses::Responses;
    use crate::providers::openai::ChatCompletions;
    use crate::stream::{RecordingObserver, StreamEvent};
    use crate::transport::{ByteStream, MemoryTransport};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use serde_json::json;

    fn chunk(content: &str) -> String {
        format!("data: {}\n\n", json!({"choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]}))
    }

    fn role_chunk() -> String {
        format!("data: {}\n\n", json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": ""}}]}))
    }

    fn finish_chunk(reason: &str) -> String {
        format!("data: {}\n\n", json!({"choices": [{"index": 0, "delta": {}, "finish_reason": reason}]}))
    }

    fn openai_body(fragments: &[&str]) -> String {
        let mut body = role_chunk();
        for f in fragments {
            body.push_str(&chunk(f));
        }
        body.push_str(&finish_chunk("stop"));
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn driver(provider: &str) -> StreamDriver {
        StreamDriver::new(Arc::new(ChatCompletions::new(provider)), StreamCfg::default())
    }

    fn closed(provider: &str) -> StreamError {
        StreamError::TransportClosed { provider: provider.into(), reason: "connection reset".into() }
    }

    #[tokio::test]
    async fn simple_text_through_every_layer() {
        let recorder = Arc::new(RecordingObserver::new());
        let d = driver("openai").with_observer(recorder.clone());
        let t = MemoryTransport::replay("openai", openai_body(&["Hel", "lo", " there", "!"]), 7);

        let msg = d.run(&t).await.unwrap();
        assert_eq!(msg.content, "Hello there!");
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.status, Status::Complete);
        assert_eq!(recorder.text(0), "Hello there!");
        assert!(matches!(recorder.events().last(), Some(StreamEvent::Message(_))));
    }

    #[tokio::test]
    async fn connection_closed_mid_stream_reissues_the_request() {
        let fragments = ["Hel", "lo", " th", "ere", "!"];
        let mut partial = role_chunk();
        partial.push_str(&chunk(fragments[0]));
        partial.push_str(&chunk(fragments[1]));

        let recorder = Arc::new(RecordingObserver::new());
        let d = driver("openai").with_observer(recorder.clone());
        let t = MemoryTransport::new("openai")
            .with_attempt(vec![Ok(Bytes::from(partial)), Err(closed("openai"))])
            .with_body(openai_body(&fragments), 11);

        let msg = d.run(&t).await.unwrap();
        assert_eq!(t.opened(), 2);
        assert_eq!(msg.content, "Hello there!");
        assert_eq!(msg.status, Status::Complete);

        // Deltas from the aborted attempt were delivered and are not retracted.
        assert_eq!(recorder.text(0), "HelloHello there!");
        let events = recorder.events();
        let retry_at = events.iter().position(|e| matches!(e, StreamEvent::Retry { attempt: 2, .. })).unwrap();
        let role_deltas: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, StreamEvent::Delta(d) if d.role.is_some()))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(role_deltas.len(), 2);
        assert!(role_deltas[0] < retry_at && retry_at < role_deltas[1]);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let cfg = StreamCfg { max_retries: 1, ..StreamCfg::default() };
        let d = StreamDriver::new(Arc::new(ChatCompletions::new("groq")), cfg);
        let t = MemoryTransport::new("groq")
            .with_attempt(vec![Ok(Bytes::from(role_chunk())), Err(closed("groq"))])
            .with_refusal(StreamError::TransportTimeout { provider: "groq".into() })
            .with_body(openai_body(&["never"]), 0);

        match d.run(&t).await.unwrap_err() {
            StreamError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, StreamError::TransportTimeout { .. }));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(t.opened(), 2);
    }

    #[tokio::test]
    async fn non_transient_provider_error_stops_immediately() {
        let body = format!(
            "{}data: {}\n\n",
            chunk("partial"),
            json!({"error": {"message": "bad request", "type": "invalid_request_error"}})
        );
        let t = MemoryTransport::replay("openai", body.clone(), 0).with_body(body, 0);
        match driver("openai").run(&t).await.unwrap_err() {
            StreamError::ProviderError { code, transient, .. } => {
                assert_eq!(code, "invalid_request_error");
                assert!(!transient);
            }
            other => panic!("expected ProviderError, got {other:?}"),
        }
        assert_eq!(t.opened(), 1);
    }

    #[tokio::test]
    async fn transient_provider_error_is_retried() {
        let failing = format!("data: {}\n\n", json!({"error": {"message": "try later", "type": "server_error"}}));
        let t = MemoryTransport::replay("deepseek", failing, 0).with_body(openai_body(&["ok"]), 5);
        let msg = driver("deepseek").run(&t).await.unwrap();
        assert_eq!(msg.content, "ok");
        assert_eq!(t.opened(), 2);
    }

    #[tokio::test]
    async fn rate_limit_is_not_retried() {
        let t = MemoryTransport::new("openai")
            .with_refusal(StreamError::RateLimited { provider: "openai".into(), retry_after: Some(3) })
            .with_body(openai_body(&["never"]), 0);
        assert!(matches!(driver("openai").run(&t).await, Err(StreamError::RateLimited { .. })));
        assert_eq!(t.opened(), 1);
    }

    struct Stalling;

    #[async_trait]
    impl Transport for Stalling {
        async fn open(&self) -> CoreResult<ByteStream> {
            let first = stream::iter(vec![Ok(Bytes::from(role_chunk() + &chunk("tick")))]);
            Ok(first.chain(stream::pending()).boxed())
        }
    }

    #[tokio::test]
    async fn cancellation_aborts_a_stalled_stream() {
        let d = driver("local");
        let token = d.cancellation_token();
        let result = d
            .run_with(
                &Stalling,
                move |delta| {
                    if delta.content_fragment.as_deref() == Some("tick") {
                        token.cancel();
                    }
                },
                |_| {},
            )
            .await;
        assert!(matches!(result, Err(StreamError::Cancelled)));
    }

    #[tokio::test]
    async fn cancelled_before_open_never_connects() {
        let token = CancellationToken::new();
        token.cancel();
        let d = driver("openai").with_cancellation(token);
        let t = MemoryTransport::replay("openai", openai_body(&["x"]), 0);
        assert!(matches!(d.run(&t).await, Err(StreamError::Cancelled)));
        assert_eq!(t.opened(), 0);
    }

    struct Panicky;

    impl StreamObserver for Panicky {
        fn on_delta(&self, _delta: &Delta) {
            panic!("observer bug");
        }
    }

    #[tokio::test]
    async fn panicking_observer_is_isolated() {
        let sink = telemetry::test_sink::install();
        let recorder = Arc::new(RecordingObserver::new());
        let d = driver("openai-panicky-observer").with_observer(Arc::new(Panicky)).with_observer(recorder.clone());
        let t = MemoryTransport::replay("openai", openai_body(&["a", "b"]), 3);

        let msg = d.run(&t).await.unwrap();
        assert_eq!(msg.content, "ab");
        assert_eq!(recorder.text(0), "ab");
        let traces = sink.for_provider("openai-panicky-observer");
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].observer_panics, 3);
    }

    #[tokio::test]
    async fn unexpected_events_are_reported_unless_strict() {
        let mut body = chunk("fine");
        body.push_str(&format!("data: {}\n\n", json!({"object": "mystery"})));
        body.push_str(&finish_chunk("stop"));

        let recorder = Arc::new(RecordingObserver::new());
        let lenient = driver("openai").with_observer(recorder.clone());
        let msg = lenient.run(&MemoryTransport::replay("openai", body.clone(), 0)).await.unwrap();
        assert_eq!(msg.content, "fine");
        assert!(
            recorder
                .events()
                .iter()
                .any(|e| matches!(e, StreamEvent::Error { kind, .. } if kind == "unexpected_event_shape"))
        );

        let cfg = StreamCfg { strict_events: true, ..StreamCfg::default() };
        let strict = StreamDriver::new(Arc::new(ChatCompletions::new("openai")), cfg);
        let err = strict.run(&MemoryTransport::replay("openai", body, 0)).await.unwrap_err();
        assert!(matches!(err, StreamError::UnexpectedEventShape { .. }));
    }

    #[tokio::test]
    async fn body_without_finish_is_missing_terminal() {
        let body = role_chunk() + &chunk("cut off") + "data: [DONE]\n\n";
        let err = driver("openai").run(&MemoryTransport::replay("openai", body, 0)).await.unwrap_err();
        match err {
            StreamError::MissingTerminal { indices, .. } => assert_eq!(indices, vec![0]),
            other => panic!("expected MissingTerminal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn trailing_usage_chunk_is_attached() {
        let mut body = openai_body(&["hi"]);
        body = body.replace(
            "data: [DONE]",
            &format!("data: {}\n\ndata: [DONE]", json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 2}})),
        );
        let recorder = Arc::new(RecordingObserver::new());
        let d = driver("openai").with_observer(recorder.clone());
        let msg = d.run(&MemoryTransport::replay("openai", body, 9)).await.unwrap();
        let usage = msg.usage.unwrap();
        assert_eq!((usage.input_tokens, usage.output_tokens), (5, 2));

        // The message reached observers before the usage chunk; usage follows it.
        let events = recorder.events();
        let at = |pred: fn(&StreamEvent) -> bool| events.iter().position(pred).unwrap();
        let message_at = at(|e| matches!(e, StreamEvent::Message(m) if m.usage.is_none()));
        let usage_at = at(|e| matches!(e, StreamEvent::Usage { index: 0, .. }));
        assert!(message_at < usage_at);
        assert_eq!(events[usage_at], StreamEvent::Usage { index: 0, usage });
    }

    #[tokio::test]
    async fn multiple_choices_return_in_index_order() {
        let body = [
            json!({"choices": [{"index": 1, "delta": {"role": "assistant", "content": "B"}}]}),
            json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": "A"}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}, {"index": 1, "delta": {}, "finish_reason": "length"}]}),
        ]
        .iter()
        .map(|v| format!("data: {v}\n\n"))
        .collect::<String>();
        let all = driver("openai").run_all(&MemoryTransport::replay("openai", body, 6)).await.unwrap();
        let got: Vec<_> = all.iter().map(|m| (m.index, m.content.as_str(), m.status)).collect();
        assert_eq!(got, [(0, "A", Status::Complete), (1, "B", Status::Length)]);
    }

    #[tokio::test]
    async fn anthropic_tool_use_stream() {
        let events = [
            ("message_start", json!({"type": "message_start", "message": {"role": "assistant", "usage": {"input_tokens": 12, "output_tokens": 1}}})),
            ("content_block_start", json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})),
            ("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Checking."}})),
            ("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
            ("content_block_start", json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {}}})),
            ("content_block_delta", json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"loc"}})),
            ("ping", json!({"type": "ping"})),
            ("content_block_delta", json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "ation\":\"S"}})),
            ("content_block_delta", json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "F\"}"}})),
            ("content_block_stop", json!({"type": "content_block_stop", "index": 1})),
            ("message_delta", json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 30}})),
            ("message_stop", json!({"type": "message_stop"})),
        ];
        let body: String = events.iter().map(|(name, v)| format!("event: {name}\ndata: {v}\n\n")).collect();
        let d = StreamDriver::new(Arc::new(Anthropic::new("anthropic")), StreamCfg::default());

        let msg = d.run(&MemoryTransport::replay("anthropic", body, 13)).await.unwrap();
        assert_eq!(msg.content, "Checking.");
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].call_id, "toolu_1");
        assert_eq!(msg.tool_calls[0].arguments_json().unwrap(), json!({"location": "SF"}));
        let usage = msg.usage.unwrap();
        assert_eq!((usage.input_tokens, usage.output_tokens), (12, 30));
    }

    fn named_events(events: &[(&str, serde_json::Value)]) -> String {
        events.iter().map(|(name, v)| format!("event: {name}\ndata: {v}\n\n")).collect()
    }

    /// Replays `body` at many chunk sizes and checks every run merges to the same message.
    async fn run_at_every_chunking(d: &StreamDriver, body: &str) -> AccumulatedMessage {
        let provider = d.provider().to_string();
        let single = MemoryTransport::replay(provider.clone(), body.to_string(), 0);
        let whole = d.run(&single).await.unwrap();
        for size in (1..=32).chain([61, 257]) {
            let t = MemoryTransport::replay(provider.clone(), body.to_string(), size);
            let msg = d.run(&t).await.unwrap();
            assert_eq!(msg, whole, "chunk size {size}");
        }
        whole
    }

    #[tokio::test]
    async fn anthropic_server_tool_blocks_are_not_client_calls() {
        let body = named_events(&[
            ("message_start", json!({"type": "message_start", "message": {"role": "assistant", "usage": {"input_tokens": 9}}})),
            ("content_block_start", json!({"type": "content_block_start", "index": 0, "content_block": {"type": "server_tool_use", "id": "srvtoolu_1", "name": "web_search", "input": {}}})),
            ("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"query\":\"x\"}"}})),
            ("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
            ("content_block_start", json!({"type": "content_block_start", "index": 1, "content_block": {"type": "web_search_tool_result", "tool_use_id": "srvtoolu_1", "content": []}})),
            ("content_block_stop", json!({"type": "content_block_stop", "index": 1})),
            ("content_block_start", json!({"type": "content_block_start", "index": 2, "content_block": {"type": "text", "text": ""}})),
            ("content_block_delta", json!({"type": "content_block_delta", "index": 2, "delta": {"type": "text_delta", "text": "Found it."}})),
            ("content_block_stop", json!({"type": "content_block_stop", "index": 2})),
            ("message_delta", json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 4}})),
            ("message_stop", json!({"type": "message_stop"})),
        ]);
        let d = StreamDriver::new(Arc::new(Anthropic::new("anthropic")), StreamCfg::default());

        let msg = d.run(&MemoryTransport::replay("anthropic", body, 17)).await.unwrap();
        assert!(msg.tool_calls.is_empty(), "got {:?}", msg.tool_calls);
        assert_eq!(msg.content, "Found it.");
        assert_eq!(msg.status, Status::Complete);
    }

    #[tokio::test]
    async fn responses_stream_merges_identically_at_any_chunking() {
        let body = named_events(&[
            ("response.created", json!({"type": "response.created", "response": {"id": "resp_1", "status": "in_progress"}})),
            ("response.output_item.added", json!({"type": "response.output_item.added", "output_index": 0, "item": {"type": "message", "id": "msg_1", "role": "assistant", "content": []}})),
            ("response.output_text.delta", json!({"type": "response.output_text.delta", "item_id": "msg_1", "output_index": 0, "content_index": 0, "delta": "Checking "})),
            ("response.output_text.delta", json!({"type": "response.output_text.delta", "item_id": "msg_1", "output_index": 0, "content_index": 0, "delta": "the weather."})),
            ("response.output_text.done", json!({"type": "response.output_text.done", "item_id": "msg_1", "output_index": 0, "content_index": 0, "text": "Checking the weather."})),
            ("response.output_item.added", json!({"type": "response.output_item.added", "output_index": 1, "item": {"type": "function_call", "id": "fc_1", "call_id": "call_abc", "name": "get_weather", "arguments": ""}})),
            ("response.function_call_arguments.delta", json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "output_index": 1, "delta": "{\"city\":"})),
            ("response.function_call_arguments.delta", json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "output_index": 1, "delta": "\"Paris\"}"})),
            ("response.function_call_arguments.done", json!({"type": "response.function_call_arguments.done", "item_id": "fc_1", "output_index": 1, "arguments": "{\"city\":\"Paris\"}"})),
            ("response.output_item.done", json!({"type": "response.output_item.done", "output_index": 1, "item": {"type": "function_call", "id": "fc_1"}})),
            ("response.completed", json!({"type": "response.completed", "response": {"id": "resp_1", "status": "completed", "usage": {"input_tokens": 10, "output_tokens": 7, "total_tokens": 17}}})),
        ]);
        let d = StreamDriver::new(Arc::new(Responses::new("openai-responses")), StreamCfg::default());

        let msg = run_at_every_chunking(&d, &body).await;
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.content, "Checking the weather.");
        assert_eq!(msg.status, Status::Complete);
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].call_id, "call_abc");
        assert_eq!(msg.tool_calls[0].name, "get_weather");
        assert_eq!(msg.tool_calls[0].arguments_json().unwrap(), json!({"city": "Paris"}));
        let usage = msg.usage.unwrap();
        assert_eq!((usage.input_tokens, usage.output_tokens), (10, 7));
    }

    #[tokio::test]
    async fn gemini_usage_snapshots_replace_at_any_chunking() {
        let body = [
            json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "Hel"}]}, "index": 0}],
                   "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 1, "totalTokenCount": 5}}),
            json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "lo"}, {"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}}]}, "index": 0}],
                   "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}}),
            json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "!"}]}, "finishReason": "STOP", "index": 0}],
                   "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 3, "totalTokenCount": 7}}),
        ]
        .iter()
        .map(|v| format!("data: {v}\r\n\r\n"))
        .collect::<String>();
        let d = StreamDriver::new(Arc::new(Gemini::new("google")), StreamCfg::default());

        let msg = run_at_every_chunking(&d, &body).await;
        assert_eq!(msg.content, "Hello!");
        assert_eq!(msg.status, Status::Complete);
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].call_id, "call_0_0");
        assert_eq!(msg.tool_calls[0].arguments_json().unwrap(), json!({"city": "Paris"}));
        // Last snapshot wins; the three reports are not summed.
        let usage = msg.usage.unwrap();
        assert_eq!((usage.input_tokens, usage.output_tokens), (4, 3));
    }

    #[tokio::test]
    async fn telemetry_records_one_trace_per_run() {
        let sink = telemetry::test_sink::install();
        let cfg = StreamCfg::default();
        let d = StreamDriver::new(
            Arc::new(ChatCompletions::new("openai-telemetry").with_usage_policy(UsagePolicy::Replace)),
            cfg,
        );
        let t = MemoryTransport::new("openai")
            .with_refusal(StreamError::ProviderUnavailable { provider: "openai".into() })
            .with_body(openai_body(&["x", "y"]), 4);
        d.run(&t).await.unwrap();

        let traces = sink.for_provider("openai-telemetry");
        assert_eq!(traces.len(), 1);
        let trace = &traces[0];
        assert_eq!(trace.attempts, 2);
        assert_eq!(trace.messages, 1);
        assert_eq!(trace.deltas, 3);
        assert_eq!(trace.final_state.as_deref(), Some("completed"));
        assert_eq!(trace.finish_status.as_deref(), Some("complete"));
        assert!(trace.error_kind.is_none());
    }

    #[tokio::test]
    async fn unknown_provider_is_a_validation_error() {
        let err = StreamDriver::from_registry(&ProviderRegistry::builtin(), "nope", StreamCfg::default())
            .err()
            .expect("should fail");
        assert!(matches!(err, StreamError::Validation(_)));
    }
}
