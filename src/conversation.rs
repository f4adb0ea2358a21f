//! Conversation state handed to the pipeline
//!
//! Validated once at the entry point, trimmed to the most recent messages,
//! and read-only for the rest of the run.

use crate::error::OrchestrationError;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    fn parse(role: &str) -> Option<Self> {
        match role.trim().to_lowercase().as_str() {
            "system" => Some(MessageRole::System),
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

/// A raw message as received from a transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// A validated conversation message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Ordered, trimmed conversation. The last message drives the current turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    messages: VecDeque<ConversationMessage>,
}

impl ConversationState {
    /// Validate raw messages and keep the last `max_messages`.
    pub fn from_messages(messages: Vec<ChatMessage>, max_messages: usize) -> Result<Self> {
        if messages.is_empty() {
            return Err(OrchestrationError::ValidationError(
                "conversation has no messages".to_string(),
            ));
        }

        let mut validated = VecDeque::with_capacity(messages.len());

        for (index, message) in messages.into_iter().enumerate() {
            let role = MessageRole::parse(&message.role).ok_or_else(|| {
                OrchestrationError::ValidationError(format!(
                    "message {} has unsupported role '{}'",
                    index, message.role
                ))
            })?;

            let content = message.content.trim();
            if content.is_empty() {
                return Err(OrchestrationError::ValidationError(format!(
                    "message {} has empty content",
                    index
                )));
            }

            validated.push_back(ConversationMessage {
                role,
                content: content.to_string(),
            });
        }

        let mut state = Self {
            messages: validated,
        };
        state.trim_to_recent(max_messages.max(1));

        if state.latest().role != MessageRole::User {
            return Err(OrchestrationError::ValidationError(
                "latest message must come from the user".to_string(),
            ));
        }

        Ok(state)
    }

    fn trim_to_recent(&mut self, keep_count: usize) {
        while self.messages.len() > keep_count {
            self.messages.pop_front();
        }
    }

    /// All messages, oldest first
    pub fn messages(&self) -> impl Iterator<Item = &ConversationMessage> {
        self.messages.iter()
    }

    /// Everything before the latest message
    pub fn history(&self) -> impl Iterator<Item = &ConversationMessage> {
        self.messages.iter().take(self.messages.len().saturating_sub(1))
    }

    pub fn latest(&self) -> &ConversationMessage {
        // Construction guarantees at least one message.
        &self.messages[self.messages.len() - 1]
    }

    pub fn latest_text(&self) -> &str {
        &self.latest().content
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// SHA-256 over the serialized messages, hex encoded
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for msg in &self.messages {
            hasher.update(msg.role.as_str().as_bytes());
            hasher.update([0u8]);
            hasher.update(msg.content.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}
