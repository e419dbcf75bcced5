use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{OpKind, Platform},
    generation::types::Role,
};

/// Key of one daily usage counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub platform: Platform,
    pub op: OpKind,
    pub day: NaiveDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    TargetPost,
    Mention,
}

impl InteractionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InteractionKind::TargetPost => "target_post",
            InteractionKind::Mention => "mention",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "target_post" => Some(InteractionKind::TargetPost),
            "mention" => Some(InteractionKind::Mention),
            _ => None,
        }
    }
}

/// One ledger row, unique by `(platform, external_id)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Interaction {
    pub id: u64,
    pub platform: Platform,
    pub external_id: String,
    pub kind: InteractionKind,
    pub author_id: String,
    pub processed: bool,
    pub response_sent: bool,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Start of the in-flight reply lease, cleared on release or mark.
    pub claimed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct NewInteraction {
    pub platform: Platform,
    pub external_id: String,
    pub kind: InteractionKind,
    pub author_id: String,
    pub metadata: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Terminal transition of an interaction.
#[derive(Clone, Debug)]
pub struct ProcessedMark {
    pub response_sent: bool,
    pub conversation_id: Option<String>,
    pub metadata: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub platform: Platform,
    pub messages: Vec<ConversationMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
