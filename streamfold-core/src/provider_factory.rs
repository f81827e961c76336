use std::{collections::HashMap, sync::Arc};

use crate::config::Config;
use crate::error::{CoreResult, StreamError};
use crate::normalizer::{EventNormalizer, UsagePolicy};
use crate::providers::anthropic::Anthropic;
use crate::providers::gemini::Gemini;
use crate::providers::openai::ChatCompletions;
use crate::providers::openai_responses::Responses;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    ChatCompletions,
    Responses,
    Anthropic,
    Gemini,
}

/// Provider names accepted by the registry and the wire dialect each one speaks.
pub const BUILTIN_PROVIDERS: &[(&str, ProviderKind)] = &[
    ("openai", ProviderKind::ChatCompletions),
    ("groq", ProviderKind::ChatCompletions),
    ("deepseek", ProviderKind::ChatCompletions),
    ("grok", ProviderKind::ChatCompletions),
    ("xai", ProviderKind::ChatCompletions),
    ("perplexity", ProviderKind::ChatCompletions),
    ("azure", ProviderKind::ChatCompletions),
    ("local", ProviderKind::ChatCompletions),
    ("openai-compatible", ProviderKind::ChatCompletions),
    ("openai-responses", ProviderKind::Responses),
    ("responses", ProviderKind::Responses),
    ("anthropic", ProviderKind::Anthropic),
    ("google", ProviderKind::Gemini),
    ("gemini", ProviderKind::Gemini),
    ("google-ai", ProviderKind::Gemini),
];

impl ProviderKind {
    pub fn for_name(name: &str) -> Option<Self> {
        BUILTIN_PROVIDERS.iter().find(|(n, _)| *n == name).map(|(_, kind)| *kind)
    }

    fn build(self, name: &str, policy: Option<UsagePolicy>) -> Arc<dyn EventNormalizer> {
        match (self, policy) {
            (Self::ChatCompletions, None) => Arc::new(ChatCompletions::new(name)),
            (Self::ChatCompletions, Some(p)) => {
                Arc::new(ChatCompletions::new(name).with_usage_policy(p))
            }
            (Self::Responses, None) => Arc::new(Responses::new(name)),
            (Self::Responses, Some(p)) => Arc::new(Responses::new(name).with_usage_policy(p)),
            (Self::Anthropic, None) => Arc::new(Anthropic::new(name)),
            (Self::Anthropic, Some(p)) => Arc::new(Anthropic::new(name).with_usage_policy(p)),
            (Self::Gemini, None) => Arc::new(Gemini::new(name)),
            (Self::Gemini, Some(p)) => Arc::new(Gemini::new(name).with_usage_policy(p)),
        }
    }
}

/// Registry of event normalizers by provider name.
pub struct ProviderRegistry {
    normalizers: HashMap<String, Arc<dyn EventNormalizer>>,
}

impl ProviderRegistry {
    /// Every built-in provider name with its default usage policy.
    pub fn builtin() -> Self {
        let normalizers = BUILTIN_PROVIDERS
            .iter()
            .map(|(name, kind)| (name.to_string(), kind.build(name, None)))
            .collect();
        Self { normalizers }
    }

    /// Built-in providers with the `providers.<name>` overrides applied.
    /// Overrides for names the registry does not know are rejected.
    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        let mut reg = Self::builtin();
        for (name, pcfg) in &cfg.providers {
            let kind = ProviderKind::for_name(name).ok_or_else(|| {
                StreamError::Validation(format!("config names unknown provider '{name}'"))
            })?;
            if pcfg.usage_policy.is_some() {
                reg.normalizers.insert(name.clone(), kind.build(name, pcfg.usage_policy));
            }
        }
        Ok(reg)
    }

    /// Register (or replace) a normalizer under `name`.
    pub fn insert(&mut self, name: impl Into<String>, normalizer: Arc<dyn EventNormalizer>) {
        self.normalizers.insert(name.into(), normalizer);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn EventNormalizer>> {
        self.normalizers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.normalizers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
