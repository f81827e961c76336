//! Delta merger: folds canonical events into per-index messages.
//!
//! One merger serves one response attempt. It owns the `index → in-progress`
//! map; events for an index are applied strictly in arrival order and a
//! finish freezes the entry into an [`AccumulatedMessage`] and retires it.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::IgnoredAny;
use tracing::{debug, warn};

use crate::error::{CoreResult, StreamError};
use crate::event::{CanonicalDeltaEvent, ToolCallKey, UsageReport};
use crate::model::{AccumulatedMessage, Delta, Role, Status, ToolCall, ToolCallFragment, Usage};
use crate::normalizer::UsagePolicy;

/// Outcome of merging one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Merged {
    Delta(Delta),
    Message(AccumulatedMessage),
    Skip,
}

#[derive(Debug)]
struct ToolSlot {
    call_id: String,
    item_id: Option<String>,
    position: Option<u32>,
    name: Option<String>,
    arguments: String,
    done: bool,
}

#[derive(Debug, Default)]
struct InProgress {
    role: Option<Role>,
    content: String,
    tools: Vec<ToolSlot>,
    usage: Option<Usage>,
}

impl InProgress {
    /// Sets the role if none is set yet; returns it when this call set it.
    fn offer_role(&mut self, role: Option<Role>) -> Option<Role> {
        match (self.role, role) {
            (None, Some(r)) => {
                self.role = Some(r);
                Some(r)
            }
            _ => None,
        }
    }

    fn resolve(&self, key: &ToolCallKey) -> Option<usize> {
        if let Some(id) = &key.id
            && let Some(i) = self
                .tools
                .iter()
                .rposition(|s| s.call_id == *id || s.item_id.as_deref() == Some(id.as_str()))
        {
            return Some(i);
        }
        if let Some(p) = key.position
            && let Some(i) = self.tools.iter().rposition(|s| s.position == Some(p))
        {
            return Some(i);
        }
        if key.id.is_none() && key.position.is_none() {
            return self.tools.len().checked_sub(1);
        }
        None
    }

    fn open_slot(
        &mut self,
        index: u32,
        call_id: Option<String>,
        item_id: Option<String>,
        position: Option<u32>,
    ) -> usize {
        let n = self.tools.len();
        self.tools.push(ToolSlot {
            call_id: call_id.unwrap_or_else(|| format!("call_{index}_{n}")),
            item_id,
            position,
            name: None,
            arguments: String::new(),
            done: false,
        });
        n
    }

    fn freeze(self, index: u32, status: Status) -> CoreResult<AccumulatedMessage> {
        let mut tool_calls = Vec::with_capacity(self.tools.len());
        for slot in self.tools {
            let name = slot.name.unwrap_or_default();
            let arguments = if slot.arguments.trim().is_empty() {
                "{}".to_string()
            } else {
                slot.arguments
            };
            if let Err(source) = serde_json::from_str::<IgnoredAny>(&arguments) {
                return Err(StreamError::MalformedToolCallArguments {
                    call_id: slot.call_id,
                    name,
                    arguments,
                    source,
                });
            }
            tool_calls.push(ToolCall { call_id: slot.call_id, name, arguments });
        }
        Ok(AccumulatedMessage {
            role: self.role.unwrap_or_default(),
            content: self.content,
            tool_calls,
            status,
            usage: self.usage,
            index,
        })
    }
}

#[derive(Debug)]
pub struct DeltaMerger {
    provider: String,
    policy: UsagePolicy,
    open: BTreeMap<u32, InProgress>,
    retired: BTreeSet<u32>,
    /// Unindexed usage seen so far; seeds indices opened later.
    shared_usage: Option<Usage>,
    /// Unindexed usage that arrived after every index had retired.
    trailing_usage: Option<Usage>,
    /// Whether argument fragments for an unknown call open a new slot.
    open_unannounced: bool,
}

impl DeltaMerger {
    pub fn new(provider: impl Into<String>, policy: UsagePolicy) -> Self {
        Self {
            provider: provider.into(),
            policy,
            open: BTreeMap::new(),
            retired: BTreeSet::new(),
            shared_usage: None,
            trailing_usage: None,
            open_unannounced: true,
        }
    }

    /// When `false`, argument fragments that match no started call are
    /// dropped instead of opening a slot with a synthesized id.
    pub fn open_unannounced_tool_calls(mut self, open: bool) -> Self {
        self.open_unannounced = open;
        self
    }

    pub fn open_indices(&self) -> Vec<u32> {
        self.open.keys().copied().collect()
    }

    pub fn is_retired(&self, index: u32) -> bool {
        self.retired.contains(&index)
    }

    pub fn trailing_usage(&self) -> Option<&Usage> {
        self.trailing_usage.as_ref()
    }

    /// Apply one event. Error envelopes must be classified by the caller;
    /// reaching the merger they become a non-transient `ProviderError`.
    pub fn merge(&mut self, event: CanonicalDeltaEvent) -> CoreResult<Merged> {
        match event {
            CanonicalDeltaEvent::ContentDelta { index, text, role } => {
                Ok(self.content(index, text, role))
            }
            CanonicalDeltaEvent::ToolCallStarted {
                index,
                call_id,
                item_id,
                position,
                name,
                role,
            } => Ok(self.tool_started(index, call_id, item_id, position, name, role)),
            CanonicalDeltaEvent::ToolCallArgumentsDelta { index, key, fragment } => {
                Ok(self.tool_arguments(index, key, fragment))
            }
            CanonicalDeltaEvent::ToolCallDone { index, key, arguments } => {
                Ok(self.tool_done(index, key, arguments))
            }
            CanonicalDeltaEvent::Finish { index, status } => self.finish(index, status),
            CanonicalDeltaEvent::Usage { index, usage } => {
                self.usage(index, usage);
                Ok(Merged::Skip)
            }
            CanonicalDeltaEvent::Error(env) => Err(StreamError::ProviderError {
                provider: self.provider.clone(),
                code: env.code,
                message: env.message,
                transient: false,
            }),
            CanonicalDeltaEvent::ContentDone { .. } | CanonicalDeltaEvent::Ignorable { .. } => {
                Ok(Merged::Skip)
            }
        }
    }

    /// Called when the body ends. Every index that was opened must have
    /// finished, and at least one index must have been seen.
    pub fn finish_stream(&self) -> CoreResult<()> {
        if self.open.is_empty() && !self.retired.is_empty() {
            return Ok(());
        }
        Err(StreamError::MissingTerminal {
            provider: self.provider.clone(),
            indices: self.open_indices(),
        })
    }

    fn entry(&mut self, index: u32) -> Option<&mut InProgress> {
        if self.retired.contains(&index) {
            warn!(provider = %self.provider, index, "event for a finished index; skipping");
            return None;
        }
        let seed = self.shared_usage.clone();
        let entry = self
            .open
            .entry(index)
            .or_insert_with(|| InProgress { usage: seed, ..Default::default() });
        Some(entry)
    }

    fn content(&mut self, index: u32, text: String, role: Option<Role>) -> Merged {
        let Some(entry) = self.entry(index) else {
            return Merged::Skip;
        };
        let role = entry.offer_role(role);
        if text.is_empty() && role.is_none() {
            return Merged::Skip;
        }
        entry.content.push_str(&text);
        Merged::Delta(Delta {
            role,
            content_fragment: (!text.is_empty()).then_some(text),
            tool_call_fragments: Vec::new(),
            status: Status::Incomplete,
            index,
        })
    }

    fn tool_started(
        &mut self,
        index: u32,
        call_id: Option<String>,
        item_id: Option<String>,
        position: Option<u32>,
        name: Option<String>,
        role: Option<Role>,
    ) -> Merged {
        let Some(entry) = self.entry(index) else {
            return Merged::Skip;
        };
        let role = entry.offer_role(role);

        let existing = match (&call_id, &item_id) {
            (Some(id), _) => entry.resolve(&ToolCallKey::by_id(id.clone())),
            (None, Some(id)) => entry.resolve(&ToolCallKey::by_id(id.clone())),
            (None, None) => position.and_then(|p| entry.resolve(&ToolCallKey::by_position(p))),
        };
        let slot_ix =
            existing.unwrap_or_else(|| entry.open_slot(index, call_id, item_id, position));
        let slot = &mut entry.tools[slot_ix];

        // First name wins.
        let name_fragment = if slot.name.is_none() && name.is_some() {
            slot.name = name.clone();
            name
        } else {
            None
        };
        Merged::Delta(Delta {
            role,
            content_fragment: None,
            tool_call_fragments: vec![ToolCallFragment {
                call_id: slot.call_id.clone(),
                name_fragment,
                arguments_fragment: None,
                index: slot_ix as u32,
            }],
            status: Status::Incomplete,
            index,
        })
    }

    fn tool_arguments(&mut self, index: u32, key: ToolCallKey, fragment: String) -> Merged {
        let provider = self.provider.clone();
        let open_unannounced = self.open_unannounced;
        let Some(entry) = self.entry(index) else {
            return Merged::Skip;
        };
        let slot_ix = match entry.resolve(&key) {
            Some(ix) => ix,
            None if open_unannounced => {
                debug!(
                    provider = %provider,
                    index,
                    ?key,
                    "arguments for an unannounced tool call; opening a slot"
                );
                entry.open_slot(index, key.id, None, key.position)
            }
            None => {
                debug!(
                    provider = %provider,
                    index,
                    ?key,
                    "arguments for no started tool call; skipping"
                );
                return Merged::Skip;
            }
        };
        let slot = &mut entry.tools[slot_ix];
        if slot.done {
            warn!(
                provider = %provider,
                index,
                call_id = %slot.call_id,
                "arguments after tool call completed; skipping"
            );
            return Merged::Skip;
        }
        slot.arguments.push_str(&fragment);
        Merged::Delta(Delta {
            role: None,
            content_fragment: None,
            tool_call_fragments: vec![ToolCallFragment {
                call_id: slot.call_id.clone(),
                name_fragment: None,
                arguments_fragment: Some(fragment),
                index: slot_ix as u32,
            }],
            status: Status::Incomplete,
            index,
        })
    }

    fn tool_done(&mut self, index: u32, key: ToolCallKey, arguments: Option<String>) -> Merged {
        let Some(entry) = self.entry(index) else {
            return Merged::Skip;
        };
        let Some(slot_ix) = entry.resolve(&key) else {
            return Merged::Skip;
        };
        let slot = &mut entry.tools[slot_ix];
        slot.done = true;
        match arguments {
            // Only fills a slot that never saw fragments.
            Some(full) if slot.arguments.is_empty() && !full.is_empty() => {
                slot.arguments = full.clone();
                Merged::Delta(Delta {
                    role: None,
                    content_fragment: None,
                    tool_call_fragments: vec![ToolCallFragment {
                        call_id: slot.call_id.clone(),
                        name_fragment: None,
                        arguments_fragment: Some(full),
                        index: slot_ix as u32,
                    }],
                    status: Status::Incomplete,
                    index,
                })
            }
            _ => Merged::Skip,
        }
    }

    fn finish(&mut self, index: u32, status: Status) -> CoreResult<Merged> {
        if !status.is_terminal() {
            warn!(provider = %self.provider, index, "finish without a terminal status; skipping");
            return Ok(Merged::Skip);
        }
        if self.retired.contains(&index) {
            warn!(
                provider = %self.provider,
                index,
                status = status.as_str(),
                "second finish for index; skipping"
            );
            return Ok(Merged::Skip);
        }
        let entry = match self.open.remove(&index) {
            Some(entry) => entry,
            None => InProgress { usage: self.shared_usage.clone(), ..Default::default() },
        };
        self.retired.insert(index);
        debug!(provider = %self.provider, index, status = status.as_str(), "index finished");
        entry.freeze(index, status).map(Merged::Message)
    }

    fn usage(&mut self, index: Option<u32>, report: UsageReport) {
        let policy = self.policy;
        match index {
            Some(index) => {
                if let Some(entry) = self.entry(index) {
                    entry.usage = Some(policy.apply(entry.usage.take(), report));
                }
            }
            None => {
                if self.open.is_empty() && !self.retired.is_empty() {
                    let trailing = policy.apply(self.trailing_usage.take(), report.clone());
                    self.trailing_usage = Some(trailing);
                }
                for entry in self.open.values_mut() {
                    entry.usage = Some(policy.apply(entry.usage.take(), report.clone()));
                }
                self.shared_usage = Some(policy.apply(self.shared_usage.take(), report));
            }
        }
    }
}
