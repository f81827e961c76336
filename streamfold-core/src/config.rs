use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};

use crate::error::{CoreResult, StreamError};
use crate::frame::{DEFAULT_MAX_BUFFER_BYTES, DEFAULT_MAX_RESPLIT_DEPTH};
use crate::normalizer::UsagePolicy;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamCfg {
    /// Re-opens allowed after the first attempt (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Failed JSON attempts on one candidate before it is dropped (default 10).
    #[serde(default = "default_max_resplit_depth")]
    pub max_resplit_depth: usize,
    /// Cap on bytes buffered by the frame decoder (default 4 MiB).
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
    /// Treat unrecognized provider events as fatal instead of logging them.
    #[serde(default)]
    pub strict_events: bool,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_resplit_depth: default_max_resplit_depth(),
            max_buffer_bytes: default_max_buffer_bytes(),
            strict_events: false,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_max_resplit_depth() -> usize {
    DEFAULT_MAX_RESPLIT_DEPTH
}
fn default_max_buffer_bytes() -> usize {
    DEFAULT_MAX_BUFFER_BYTES
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds (default 60000ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}

/// Per-provider overrides, keyed by provider name in [`Config::providers`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct ProviderCfg {
    #[serde(default)]
    pub usage_policy: Option<UsagePolicy>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderCfg>,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(StreamError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| StreamError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| StreamError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| StreamError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| StreamError::Other(e.into()))
                .or_else(|_| toml::from_str::<Self>(s).map_err(|e| StreamError::Other(e.into())))?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.stream.max_resplit_depth == 0 {
            return Err(StreamError::Validation(
                "stream.max_resplit_depth must be at least 1".into(),
            ));
        }
        if self.stream.max_buffer_bytes == 0 {
            return Err(StreamError::Validation(
                "stream.max_buffer_bytes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn load_from_json() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("streamfold.json");
        let json = r#"{
          "stream": {"max_retries": 5, "strict_events": true},
          "providers": {
            "anthropic": {"usage_policy": "accumulate"},
            "groq": {}
          }
        }"#;
        fs::write(&file, json).unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.stream.max_retries, 5);
        assert!(cfg.stream.strict_events);
        assert_eq!(cfg.stream.max_resplit_depth, 10);
        assert_eq!(cfg.stream.max_buffer_bytes, 4 * 1024 * 1024);
        assert_eq!(cfg.providers["anthropic"].usage_policy, Some(UsagePolicy::Accumulate));
        assert_eq!(cfg.providers["groq"].usage_policy, None);
        assert_eq!(cfg.http.connect_timeout_ms, 5_000);
        assert_eq!(cfg.http.request_timeout_ms, 60_000);
        assert_eq!(cfg.http.pool_max_idle_per_host, None);
    }

    #[test]
    fn load_from_toml() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("streamfold.toml");
        let toml = r#"
[stream]
max_retries = 1
max_buffer_bytes = 65536

[http]
request_timeout_ms = 120000
pool_max_idle_per_host = 4

[providers.google]
usage_policy = "replace"
"#;
        fs::write(&file, toml).unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.stream.max_retries, 1);
        assert_eq!(cfg.stream.max_buffer_bytes, 65_536);
        assert!(!cfg.stream.strict_events);
        assert_eq!(cfg.http.request_timeout_ms, 120_000);
        assert_eq!(cfg.http.pool_max_idle_per_host, Some(4));
        assert_eq!(cfg.providers["google"].usage_policy, Some(UsagePolicy::Replace));
    }

    #[test]
    fn empty_document_is_all_defaults() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("empty.json");
        fs::write(&file, "{}").unwrap();
        assert_eq!(Config::from_path(&file).unwrap(), Config::default());
    }

    #[test]
    fn missing_file_returns_io_error() {
        let missing = std::path::PathBuf::from("/definitely/not/here/streamfold-missing.json");
        let err = Config::from_path(&missing).unwrap_err();
        match err {
            StreamError::Io(_) => {}
            other => panic!("expected Io error, got: {:?}", other),
        }
    }

    #[test]
    fn bad_utf8_returns_other_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad.bin");
        fs::write(&file, [0xff, 0xfe, 0xfd, 0x00, 0x80]).unwrap();
        let err = Config::from_path(&file).unwrap_err();
        assert!(matches!(err, StreamError::Other(_)), "got {err:?}");
    }

    #[test]
    fn bad_json_returns_other_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad.json");
        fs::write(&file, r#"{ "stream": { "max_retries": "three" }"#).unwrap();
        let err = Config::from_path(&file).unwrap_err();
        assert!(matches!(err, StreamError::Other(_)), "got {err:?}");
    }

    #[test]
    fn zero_limits_are_rejected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("zero.json");
        fs::write(&file, r#"{"stream": {"max_resplit_depth": 0}}"#).unwrap();
        let err = Config::from_path(&file).unwrap_err();
        assert!(matches!(err, StreamError::Validation(_)), "got {err:?}");
    }

    #[test]
    fn unknown_extension_falls_back_to_json_then_toml() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("a.conf");
        fs::write(&json_path, r#"{"stream":{"max_retries":7}}"#).unwrap();
        assert_eq!(Config::from_path(&json_path).unwrap().stream.max_retries, 7);

        let toml_path = dir.path().join("b.conf");
        fs::write(&toml_path, "[stream]\nmax_retries = 2\n").unwrap();
        let cfg = Config::from_path(&toml_path).unwrap();
        assert_eq!(cfg.stream.max_retries, 2);
        assert_eq!(cfg.http, HttpCfg::default());
    }
}
