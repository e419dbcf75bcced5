use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::Platform,
    store::{
        merge_metadata,
        port::{ConversationStore, InteractionStore, UsageStore},
        types::{
            Conversation, ConversationMessage, Interaction, NewInteraction, ProcessedMark,
            UsageKey,
        },
    },
    Error, Result,
};

/// In-process implementation of every persistence port.
///
/// Each operation runs under one lock, so increments and upserts are atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    usage: HashMap<UsageKey, u64>,
    interactions: HashMap<(Platform, String), Interaction>,
    next_interaction_id: u64,
    conversations: HashMap<String, Conversation>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Ledger("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn usage(&self, key: UsageKey) -> Result<u64> {
        Ok(self.lock()?.usage.get(&key).copied().unwrap_or(0))
    }

    async fn increment(&self, key: UsageKey, n: u64) -> Result<u64> {
        let mut st = self.lock()?;
        let v = st.usage.entry(key).or_insert(0);
        *v = v.saturating_add(n);
        Ok(*v)
    }
}

#[async_trait]
impl InteractionStore for MemoryStore {
    async fn get(&self, platform: Platform, external_id: &str) -> Result<Option<Interaction>> {
        Ok(self
            .lock()?
            .interactions
            .get(&(platform, external_id.to_string()))
            .cloned())
    }

    async fn upsert(&self, new: NewInteraction) -> Result<u64> {
        let mut st = self.lock()?;
        let key = (new.platform, new.external_id.clone());
        if let Some(existing) = st.interactions.get_mut(&key) {
            merge_metadata(&mut existing.metadata, &new.metadata);
            existing.updated_at = new.at;
            return Ok(existing.id);
        }

        st.next_interaction_id += 1;
        let id = st.next_interaction_id;
        st.interactions.insert(
            key,
            Interaction {
                id,
                platform: new.platform,
                external_id: new.external_id,
                kind: new.kind,
                author_id: new.author_id,
                processed: false,
                response_sent: false,
                metadata: new.metadata,
                created_at: new.at,
                updated_at: new.at,
                processed_at: None,
                claimed_at: None,
            },
        );
        Ok(id)
    }

    async fn claim(
        &self,
        platform: Platform,
        external_id: &str,
        at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let mut st = self.lock()?;
        let Some(row) = st
            .interactions
            .get_mut(&(platform, external_id.to_string()))
        else {
            return Ok(false);
        };
        if row.processed || row.claimed_at.is_some_and(|t| t >= stale_before) {
            return Ok(false);
        }
        row.claimed_at = Some(at);
        Ok(true)
    }

    async fn release(&self, platform: Platform, external_id: &str) -> Result<()> {
        let mut st = self.lock()?;
        if let Some(row) = st
            .interactions
            .get_mut(&(platform, external_id.to_string()))
        {
            if !row.processed {
                row.claimed_at = None;
            }
        }
        Ok(())
    }

    async fn mark_processed(
        &self,
        platform: Platform,
        external_id: &str,
        mark: ProcessedMark,
    ) -> Result<bool> {
        let mut st = self.lock()?;
        let Some(row) = st
            .interactions
            .get_mut(&(platform, external_id.to_string()))
        else {
            return Err(Error::Ledger(format!(
                "no interaction {platform}:{external_id} to mark"
            )));
        };
        if row.processed {
            return Ok(false);
        }

        row.processed = true;
        row.response_sent = mark.response_sent;
        row.processed_at = Some(mark.at);
        row.updated_at = mark.at;
        row.claimed_at = None;
        merge_metadata(&mut row.metadata, &mark.metadata);
        if let Some(conv) = mark.conversation_id {
            merge_metadata(
                &mut row.metadata,
                &serde_json::json!({ "conversation_id": conv }),
            );
        }
        Ok(true)
    }

    async fn count_responses_since(&self, platform: Platform, since: DateTime<Utc>) -> Result<u64> {
        let st = self.lock()?;
        let n = st
            .interactions
            .values()
            .filter(|i| i.platform == platform && i.response_sent)
            .filter(|i| i.processed_at.map(|t| t >= since).unwrap_or(false))
            .count();
        Ok(n as u64)
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn get_or_create(
        &self,
        platform: Platform,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Conversation> {
        let mut st = self.lock()?;
        let conv = st
            .conversations
            .entry(id.to_string())
            .or_insert_with(|| Conversation {
                id: id.to_string(),
                platform,
                messages: Vec::new(),
                created_at: at,
                updated_at: at,
            });
        Ok(conv.clone())
    }

    async fn append(&self, id: &str, message: ConversationMessage) -> Result<()> {
        let mut st = self.lock()?;
        let Some(conv) = st.conversations.get_mut(id) else {
            return Err(Error::Ledger(format!("no conversation {id}")));
        };
        conv.updated_at = message.created_at;
        conv.messages.push(message);
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(self.lock()?.conversations.get(id).cloned())
    }
}
