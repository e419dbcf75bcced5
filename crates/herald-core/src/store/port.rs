use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::Platform,
    store::types::{
        Conversation, ConversationMessage, Interaction, NewInteraction, ProcessedMark, UsageKey,
    },
    Result,
};

/// Daily usage counters.
///
/// `increment` must be a single atomic upsert-increment in the backing store;
/// concurrent batches race on the same row.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn usage(&self, key: UsageKey) -> Result<u64>;

    /// Add `n` and return the new total.
    async fn increment(&self, key: UsageKey, n: u64) -> Result<u64>;
}

/// Interaction ledger storage.
#[async_trait]
pub trait InteractionStore: Send + Sync {
    async fn get(&self, platform: Platform, external_id: &str) -> Result<Option<Interaction>>;

    /// Insert or refresh metadata; never clears `processed`. Returns the row id.
    async fn upsert(&self, new: NewInteraction) -> Result<u64>;

    /// Take the in-flight lease on an unprocessed row, atomically.
    ///
    /// Succeeds when the row exists, is unprocessed, and has no lease or one that
    /// started before `stale_before`. Exactly one concurrent caller wins.
    async fn claim(
        &self,
        platform: Platform,
        external_id: &str,
        at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drop the lease of a row that is still unprocessed.
    async fn release(&self, platform: Platform, external_id: &str) -> Result<()>;

    /// Flip `processed` false -> true. Returns `false` when it was already processed.
    async fn mark_processed(
        &self,
        platform: Platform,
        external_id: &str,
        mark: ProcessedMark,
    ) -> Result<bool>;

    /// Rows with `response_sent` processed at or after `since`.
    async fn count_responses_since(&self, platform: Platform, since: DateTime<Utc>) -> Result<u64>;
}

/// Append-only conversation log.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_or_create(
        &self,
        platform: Platform,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Conversation>;

    async fn append(&self, id: &str, message: ConversationMessage) -> Result<()>;

    async fn load(&self, id: &str) -> Result<Option<Conversation>>;
}
