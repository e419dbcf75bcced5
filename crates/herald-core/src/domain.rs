use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Social platform a counter, interaction or conversation belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitter,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Twitter => "twitter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "twitter" => Some(Platform::Twitter),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of external operation metered by admission control.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Read,
    Write,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Read => "read",
            OpKind::Write => "write",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category response tone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStrategy {
    Aggressive,
    Moderate,
    Conservative,
    Minimal,
}

impl ResponseStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseStrategy::Aggressive => "aggressive",
            ResponseStrategy::Moderate => "moderate",
            ResponseStrategy::Conservative => "conservative",
            ResponseStrategy::Minimal => "minimal",
        }
    }
}

/// A monitored account. Read-only after the registry is loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetAccount {
    pub name: String,
    pub handle: String,
    pub category: String,
    pub notes: String,
    pub valid: bool,
}

/// A named group of accounts sharing priority and strategy.
#[derive(Clone, Debug)]
pub struct AccountCategory {
    pub name: String,
    /// 1 (lowest) ..= 5 (highest).
    pub priority: u8,
    pub strategy: ResponseStrategy,
    pub accounts: Vec<TargetAccount>,
}

impl AccountCategory {
    pub fn valid_accounts(&self) -> impl Iterator<Item = &TargetAccount> {
        self.accounts.iter().filter(|a| a.valid)
    }
}

/// A post as returned by the social client.
///
/// `author_id` is opaque; `author_handle` is only present when the adapter
/// could expand it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub author_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}
