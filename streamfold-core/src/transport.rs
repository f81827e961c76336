//! Byte sources for the stream driver.
//!
//! A transport is re-opened from scratch on every attempt; there is no
//! resume protocol.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::Mutex;

use crate::error::{CoreResult, StreamError};

/// Response body as a stream of raw chunks.
pub type ByteStream = BoxStream<'static, CoreResult<Bytes>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue the request and return its body. Called once per attempt.
    async fn open(&self) -> CoreResult<ByteStream>;
}

enum Attempt {
    Body(Vec<CoreResult<Bytes>>),
    Refuse(StreamError),
}

/// Replays scripted attempts in order. Once the script runs out, further
/// opens fail with `ProviderUnavailable`.
pub struct MemoryTransport {
    provider: String,
    attempts: Mutex<VecDeque<Attempt>>,
    opened: AtomicU32,
}

impl MemoryTransport {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            attempts: Mutex::new(VecDeque::new()),
            opened: AtomicU32::new(0),
        }
    }

    /// Single attempt that delivers `body` in `chunk_size`-byte pieces.
    pub fn replay(provider: impl Into<String>, body: impl Into<Bytes>, chunk_size: usize) -> Self {
        Self::new(provider).with_body(body, chunk_size)
    }

    /// Queue an attempt yielding these items, errors included, in order.
    pub fn with_attempt(mut self, items: Vec<CoreResult<Bytes>>) -> Self {
        self.attempts.get_mut().push_back(Attempt::Body(items));
        self
    }

    pub fn with_body(self, body: impl Into<Bytes>, chunk_size: usize) -> Self {
        let items = split(body.into(), chunk_size).into_iter().map(Ok).collect();
        self.with_attempt(items)
    }

    /// Queue an attempt whose `open` itself fails.
    pub fn with_refusal(mut self, err: StreamError) -> Self {
        self.attempts.get_mut().push_back(Attempt::Refuse(err));
        self
    }

    /// Number of times `open` has been called.
    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> CoreResult<ByteStream> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        match self.attempts.lock().await.pop_front() {
            Some(Attempt::Body(items)) => Ok(stream::iter(items).boxed()),
            Some(Attempt::Refuse(err)) => Err(err),
            None => Err(StreamError::ProviderUnavailable { provider: self.provider.clone() }),
        }
    }
}

/// Split `body` into pieces of at most `chunk_size` bytes (0 means one piece).
pub fn split(body: Bytes, chunk_size: usize) -> Vec<Bytes> {
    if chunk_size == 0 || body.len() <= chunk_size {
        return vec![body];
    }
    let mut out = Vec::with_capacity(body.len().div_ceil(chunk_size));
    let mut rest = body;
    while !rest.is_empty() {
        let take = chunk_size.min(rest.len());
        out.push(rest.split_to(take));
    }
    out
}
