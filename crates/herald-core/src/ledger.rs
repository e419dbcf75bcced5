//! Interaction dedup ledger: the only record of which external posts were handled.
//!
//! Error policy per call:
//! - `is_processed` failures fail closed: the post is treated as processed and skipped.
//! - `record` failures abort the response for that post (no idempotence guarantee without a row).
//! - `claim` failures count as lost claims: nobody replies until the next poll.
//! - marking failures after a successful reply are surfaced to the caller, which logs them.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::warn;

use crate::{
    clock::Clock,
    domain::Platform,
    store::{
        port::InteractionStore,
        types::{InteractionKind, NewInteraction, ProcessedMark},
    },
    utils::bounded,
    Error, Result,
};

/// How long an in-flight claim blocks other pollers. Must outlast one
/// generate-and-post run.
pub const CLAIM_LEASE_MINUTES: i64 = 15;

pub struct Ledger {
    store: Arc<dyn InteractionStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl Ledger {
    pub fn new(store: Arc<dyn InteractionStore>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    fn ledger_err(e: Error) -> Error {
        match e {
            Error::Ledger(_) => e,
            other => Error::Ledger(other.to_string()),
        }
    }

    /// `true` once the interaction reached a terminal state. Errors count as processed.
    pub async fn is_processed(&self, platform: Platform, external_id: &str) -> bool {
        match bounded(self.timeout, "ledger lookup", self.store.get(platform, external_id)).await {
            Ok(row) => row.map(|r| r.processed).unwrap_or(false),
            Err(e) => {
                warn!(%platform, external_id, error = %e, "ledger lookup failed; treating as processed");
                true
            }
        }
    }

    /// Idempotent upsert; returns the ledger row id.
    pub async fn record(
        &self,
        platform: Platform,
        external_id: &str,
        kind: InteractionKind,
        author_id: &str,
        metadata: serde_json::Value,
    ) -> Result<u64> {
        let new = NewInteraction {
            platform,
            external_id: external_id.to_string(),
            kind,
            author_id: author_id.to_string(),
            metadata,
            at: self.clock.now(),
        };
        bounded(self.timeout, "ledger record", self.store.upsert(new))
            .await
            .map_err(Self::ledger_err)
    }

    /// Take the right to reply to a recorded, unprocessed post.
    ///
    /// `false` means another task is replying or the post was already handled.
    pub async fn claim(&self, platform: Platform, external_id: &str) -> Result<bool> {
        let now = self.clock.now();
        let stale_before = now - chrono::Duration::minutes(CLAIM_LEASE_MINUTES);
        bounded(
            self.timeout,
            "ledger claim",
            self.store.claim(platform, external_id, now, stale_before),
        )
        .await
        .map_err(Self::ledger_err)
    }

    /// Give up a claim without marking the post, so a later poll can retry it.
    pub async fn release(&self, platform: Platform, external_id: &str) {
        if let Err(e) = bounded(
            self.timeout,
            "ledger release",
            self.store.release(platform, external_id),
        )
        .await
        {
            warn!(%platform, external_id, error = %e, "could not release claim; it will expire");
        }
    }

    /// A reply was sent.
    pub async fn mark_processed(
        &self,
        platform: Platform,
        external_id: &str,
        conversation_id: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<bool> {
        self.mark(platform, external_id, true, conversation_id, metadata)
            .await
    }

    /// Terminal without a reply: rejected by the content filter.
    pub async fn mark_filtered(
        &self,
        platform: Platform,
        external_id: &str,
        reason: &str,
    ) -> Result<bool> {
        self.mark(
            platform,
            external_id,
            false,
            None,
            json!({ "filter_reason": reason }),
        )
        .await
    }

    /// Terminal without a reply: the reply could not be posted.
    pub async fn mark_failed(
        &self,
        platform: Platform,
        external_id: &str,
        conversation_id: Option<&str>,
        error: &str,
    ) -> Result<bool> {
        self.mark(
            platform,
            external_id,
            false,
            conversation_id,
            json!({ "post_failed": true, "error": error }),
        )
        .await
    }

    async fn mark(
        &self,
        platform: Platform,
        external_id: &str,
        response_sent: bool,
        conversation_id: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<bool> {
        let mark = ProcessedMark {
            response_sent,
            conversation_id: conversation_id.map(str::to_string),
            metadata,
            at: self.clock.now(),
        };
        bounded(
            self.timeout,
            "ledger mark",
            self.store.mark_processed(platform, external_id, mark),
        )
        .await
        .map_err(Self::ledger_err)
    }

    /// Replies sent since `since` (drives the hourly mention cap).
    pub async fn responses_since(&self, platform: Platform, since: DateTime<Utc>) -> Result<u64> {
        bounded(
            self.timeout,
            "ledger count",
            self.store.count_responses_since(platform, since),
        )
        .await
        .map_err(Self::ledger_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, store::memory::MemoryStore};
    use chrono::TimeZone;

    fn ledger() -> (Ledger, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 4, 2, 8, 0, 0).unwrap(),
        ));
        (
            Ledger::new(store.clone(), clock.clone(), Duration::from_secs(1)),
            store,
            clock,
        )
    }

    #[tokio::test]
    async fn unseen_is_not_processed_until_marked() {
        let (l, _, _) = ledger();
        for id in ["1", "2", "3"] {
            assert!(!l.is_processed(Platform::Twitter, id).await);
        }

        l.record(Platform::Twitter, "2", InteractionKind::TargetPost, "a", json!({}))
            .await
            .unwrap();
        assert!(!l.is_processed(Platform::Twitter, "2").await);

        assert!(l
            .mark_processed(Platform::Twitter, "2", Some("c"), json!({ "reply_id": "r" }))
            .await
            .unwrap());
        for _ in 0..3 {
            assert!(l.is_processed(Platform::Twitter, "2").await);
        }
        // Second mark is a no-op.
        assert!(!l
            .mark_processed(Platform::Twitter, "2", None, json!({}))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn filtered_posts_are_processed_without_response() {
        let (l, store, clock) = ledger();
        l.record(Platform::Twitter, "9", InteractionKind::TargetPost, "a", json!({}))
            .await
            .unwrap();
        l.mark_filtered(Platform::Twitter, "9", "too_short")
            .await
            .unwrap();

        let row = store.get(Platform::Twitter, "9").await.unwrap().unwrap();
        assert!(row.processed);
        assert!(!row.response_sent);
        assert_eq!(row.metadata["filter_reason"], "too_short");

        let since = clock.now() - chrono::Duration::hours(1);
        assert_eq!(l.responses_since(Platform::Twitter, since).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claims_are_exclusive_until_released_or_expired() {
        let (l, _, clock) = ledger();
        l.record(Platform::Twitter, "5", InteractionKind::Mention, "a", json!({}))
            .await
            .unwrap();

        assert!(l.claim(Platform::Twitter, "5").await.unwrap());
        assert!(!l.claim(Platform::Twitter, "5").await.unwrap());

        l.release(Platform::Twitter, "5").await;
        assert!(l.claim(Platform::Twitter, "5").await.unwrap());

        // The holder went away without releasing.
        clock.advance(chrono::Duration::minutes(CLAIM_LEASE_MINUTES + 1));
        assert!(l.claim(Platform::Twitter, "5").await.unwrap());

        l.mark_processed(Platform::Twitter, "5", None, json!({}))
            .await
            .unwrap();
        assert!(!l.claim(Platform::Twitter, "5").await.unwrap());
    }

    #[tokio::test]
    async fn marking_unknown_interaction_is_a_ledger_error() {
        let (l, _, _) = ledger();
        let err = l
            .mark_processed(Platform::Twitter, "nope", None, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ledger(_)));
    }
}
