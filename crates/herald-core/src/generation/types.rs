use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Normalized generation request.
///
/// Single-turn requests carry one user message; chat replies carry the
/// accumulated history, oldest first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
}

impl GenerationRequest {
    pub fn single(system: Option<String>, prompt: impl Into<String>) -> Self {
        Self {
            system,
            messages: vec![ChatMessage::user(prompt)],
        }
    }

    pub fn chat(system: Option<String>, messages: Vec<ChatMessage>) -> Self {
        Self { system, messages }
    }

    /// Text of the last user turn (handy for logs and fakes).
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}
