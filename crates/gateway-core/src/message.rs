//! Conversation Messages
//!
//! The canonical message shape every provider adapter translates from.

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Role of a message sender
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt/instructions
    System,
    /// User input
    User,
    /// Assistant (LLM) response
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single message in a conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message role
    pub role: Role,

    /// Text content (never empty in a valid sequence)
    pub content: String,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Validate a message sequence for generation.
///
/// Rules: every body non-empty; at most one system message, which must
/// come first; the remainder alternates user/assistant starting with
/// user; the final message must be from the user.
pub fn validate_sequence(messages: &[Message]) -> Result<()> {
    if messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "message sequence is empty".into(),
        ));
    }

    if let Some(pos) = messages.iter().position(|m| m.content.trim().is_empty()) {
        return Err(GatewayError::InvalidRequest(format!(
            "message at index {pos} has an empty body"
        )));
    }

    let rest = if messages[0].role == Role::System {
        &messages[1..]
    } else {
        &messages[..]
    };

    if rest.iter().any(|m| m.role == Role::System) {
        return Err(GatewayError::InvalidRequest(
            "only one system message is allowed and it must come first".into(),
        ));
    }

    if rest.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "at least one user message is required".into(),
        ));
    }

    for (i, msg) in rest.iter().enumerate() {
        let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
        if msg.role != expected {
            return Err(GatewayError::InvalidRequest(format!(
                "messages must alternate user/assistant starting with user; \
                 found {} at position {i}",
                msg.role
            )));
        }
    }

    if rest.last().map(|m| m.role) != Some(Role::User) {
        return Err(GatewayError::InvalidRequest(
            "a trailing user message is required for generation".into(),
        ));
    }

    Ok(())
}
