//! Per-call session context: who the caller is, what is remembered about
//! them, and the rolling conversation state owned by the state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Long-term memory keys the gateway understands. Anything else in the
/// mapping is carried along but not surfaced to the generator.
pub const MEMORY_KEYS: [&str; 6] = [
    "facts",
    "preferences",
    "important_people",
    "recent_topics",
    "mood_indicator",
    "health_notes",
];

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Agent,
}

/// A single turn in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Caller profile handed to the gateway at session start. Read-only for the
/// life of the call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonProfile {
    pub display_name: String,
    pub age: Option<u32>,
    /// Free-text profile fields: interests, important people, sensitive
    /// topics, routines, preferred topics, short description.
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

impl PersonProfile {
    /// First name only, for greetings. None when the caller is unknown.
    pub fn first_name(&self) -> Option<&str> {
        let name = self.display_name.trim();
        if name.is_empty() || name == "Anrufer" {
            return None;
        }
        name.split_whitespace().next()
    }
}

/// Long-term memory loaded from storage at session start. Read-only during
/// the session; post-call extraction updates it elsewhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryState {
    #[serde(flatten)]
    pub entries: HashMap<String, serde_json::Value>,
}

impl MemoryState {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Up to `limit` string items under a recognized key.
    pub fn string_list(&self, key: &str, limit: usize) -> Vec<&str> {
        self.entries
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str())
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Bounded recent-history buffer sent to the generator as dialogue context.
/// Overflow drops the oldest turns.
#[derive(Debug)]
pub struct ShortBuffer {
    turns: VecDeque<ConversationTurn>,
    max_turns: usize,
}

impl ShortBuffer {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(max_turns),
            max_turns: max_turns.max(1),
        }
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.turns.push_back(ConversationTurn::new(role, content));
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    pub fn turns(&self) -> Vec<ConversationTurn> {
        self.turns.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Everything the gateway owns for one call. Created when the media stream
/// opens, destroyed when it closes.
#[derive(Debug)]
pub struct SessionContext {
    pub call_id: String,
    pub profile: PersonProfile,
    pub memory: MemoryState,
    pub short_buffer: ShortBuffer,
    /// Unbounded record of the whole call, returned by `stop()` for
    /// post-call processing.
    pub full_conversation: Vec<ConversationTurn>,
    /// Transcript role labels: (caller, agent).
    transcript_labels: (String, String),
}

impl SessionContext {
    pub fn new(
        call_id: impl Into<String>,
        profile: PersonProfile,
        memory: MemoryState,
        max_buffer_turns: usize,
        transcript_labels: (String, String),
    ) -> Self {
        Self {
            call_id: call_id.into(),
            profile,
            memory,
            short_buffer: ShortBuffer::new(max_buffer_turns),
            full_conversation: Vec::new(),
            transcript_labels,
        }
    }

    /// Record a completed turn into both the short buffer and the full record.
    pub fn append_turn(&mut self, role: Role, content: &str) {
        self.short_buffer.push(role, content);
        self.full_conversation
            .push(ConversationTurn::new(role, content));
    }

    /// Full conversation as labeled text for post-call processing.
    pub fn full_transcript(&self) -> String {
        let (caller, agent) = &self.transcript_labels;
        self.full_conversation
            .iter()
            .map(|t| {
                let label = match t.role {
                    Role::Caller => caller.as_str(),
                    Role::Agent => agent.as_str(),
                };
                format!("{}: {}", label, t.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
