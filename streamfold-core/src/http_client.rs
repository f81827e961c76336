use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::debug;

use crate::config::HttpCfg;
use crate::error::{CoreResult, StreamError};
use crate::transport::{ByteStream, Transport};

/// Request context carries tracing IDs and idempotency key.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    pub request_id: Option<&'a str>,
    pub idempotency_key: Option<&'a str>,
}

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| StreamError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("streamfold/", env!("CARGO_PKG_VERSION")).to_string(),
        })
    }

    /// POST JSON and return the `text/event-stream` body as raw chunks.
    /// Non-2xx responses are mapped to typed errors before any byte is read.
    pub async fn post_sse<T: Serialize + ?Sized>(
        &self,
        provider: &str,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<ByteStream> {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/event-stream");

        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        if let Some(rid) = ctx.request_id {
            req = req.header("X-Request-Id", rid);
        }
        if let Some(ik) = ctx.idempotency_key {
            req = req.header("Idempotency-Key", ik);
        }

        let resp = req.send().await.map_err(|e| map_send_error(provider, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let ra = parse_retry_after(&headers);
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error(provider, status, ra, &body));
        }
        debug!(provider, request_id = ?extract_request_id(resp.headers()), "sse stream opened");

        let provider = provider.to_string();
        Ok(resp
            .bytes_stream()
            .map_err(move |e| map_body_error(&provider, &e))
            .boxed())
    }
}

/// Transport that POSTs a prebuilt request payload for every attempt.
pub struct HttpTransport {
    client: HttpClient,
    provider: String,
    url: String,
    body: serde_json::Value,
    headers: Vec<(String, String)>,
    bearer: Option<SecretString>,
}

impl HttpTransport {
    pub fn new(
        client: HttpClient,
        provider: impl Into<String>,
        url: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            client,
            provider: provider.into(),
            url: url.into(),
            body,
            headers: Vec::new(),
            bearer: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sent as `Authorization: Bearer <token>`.
    pub fn bearer(mut self, token: SecretString) -> Self {
        self.bearer = Some(token);
        self
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self) -> CoreResult<ByteStream> {
        let auth = self.bearer.as_ref().map(|t| format!("Bearer {}", t.expose_secret()));
        let mut headers: Vec<(&str, &str)> =
            self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        if let Some(auth) = &auth {
            headers.push(("Authorization", auth.as_str()));
        }
        self.client
            .post_sse(&self.provider, &self.url, &self.body, &headers, &RequestCtx::default())
            .await
    }
}

fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 4] =
        ["x-request-id", "request-id", "x-amzn-requestid", "x-amz-request-id"];
    for k in CANDIDATES {
        if let Some(v) = headers.get(k)
            && let Ok(s) = v.to_str()
        {
            return Some(s.to_string());
        }
    }
    None
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    // HTTP-date forms are ignored.
    None
}

fn map_send_error(provider: &str, e: &reqwest::Error) -> StreamError {
    if e.is_timeout() {
        StreamError::TransportTimeout { provider: provider.to_string() }
    } else if e.is_connect() {
        StreamError::ProviderUnavailable { provider: provider.to_string() }
    } else {
        StreamError::TransportClosed { provider: provider.to_string(), reason: e.to_string() }
    }
}

fn map_body_error(provider: &str, e: &reqwest::Error) -> StreamError {
    if e.is_timeout() {
        StreamError::TransportTimeout { provider: provider.to_string() }
    } else {
        StreamError::TransportClosed { provider: provider.to_string(), reason: e.to_string() }
    }
}

fn map_http_error(
    provider: &str,
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> StreamError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => StreamError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => StreamError::TransportTimeout {
            provider: provider.to_string(),
        },
        s if s.is_server_error() => StreamError::ProviderUnavailable {
            provider: provider.to_string(),
        },
        s => StreamError::ProviderError {
            provider: provider.to_string(),
            code: s.as_u16().to_string(),
            message: truncate(body, 300),
            transient: false,
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
