use serde::{Deserialize, Serialize};

use crate::agent::prompts;
use crate::llm_client::{LanguageModel, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn to_message(&self) -> Message {
        match self.role {
            Role::System => Message::system(self.content.clone()),
            Role::User => Message::user(self.content.clone()),
            Role::Assistant => Message::assistant(self.content.clone()),
        }
    }
}

/// When and how far the log is compacted.
///
/// Compaction is lossy: turns older than the last `keep_recent` survive only
/// through the synthetic summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPolicy {
    pub summary_threshold: usize,
    pub keep_recent: usize,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            summary_threshold: 10,
            keep_recent: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compaction {
    pub before: usize,
    pub after: usize,
}

/// Ordered log of prior turns for one configured agent.
#[derive(Debug, Clone, Default)]
pub struct ConversationMemory {
    turns: Vec<ConversationTurn>,
    policy: MemoryPolicy,
}

impl ConversationMemory {
    pub fn new(policy: MemoryPolicy) -> Self {
        Self {
            turns: Vec::new(),
            policy,
        }
    }

    pub fn append(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn needs_compaction(&self) -> bool {
        self.policy.summary_threshold > 0 && self.turns.len() >= self.policy.summary_threshold
    }

    /// Replace the log with `[summary] + last keep_recent turns` once it reaches
    /// the threshold. A failed summary call leaves the log untouched.
    pub async fn maybe_compact(&mut self, llm: &dyn LanguageModel) -> Option<Compaction> {
        if !self.needs_compaction() {
            return None;
        }

        let before = self.turns.len();
        let summary = match llm.complete(prompts::summary_messages(&self.turns)).await {
            Ok(summary) if !summary.trim().is_empty() => summary,
            Ok(_) => {
                tracing::warn!("Conversation summary came back empty; keeping full history");
                return None;
            }
            Err(e) => {
                tracing::warn!("Conversation summary failed; keeping full history: {:#}", e);
                return None;
            }
        };

        let keep = self.policy.keep_recent.min(before.saturating_sub(1));
        let tail = self.turns.split_off(before - keep);
        let mut compacted = Vec::with_capacity(keep + 1);
        compacted.push(ConversationTurn::new(
            Role::System,
            format!("{}{}", prompts::SUMMARY_PREFIX, summary.trim()),
        ));
        compacted.extend(tail);
        self.turns = compacted;

        let after = self.turns.len();
        tracing::debug!("Compacted conversation memory {} -> {} turns", before, after);
        Some(Compaction { before, after })
    }
}
