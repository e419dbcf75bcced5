//! Rate-limit admission control over shared daily counters.
//!
//! Every external read or write is preceded by [`AdmissionControl::can_proceed`]
//! and, once it succeeded, followed by [`AdmissionControl::record_usage`].
//! The check never mutates; two batches can both pass a check for the last slot,
//! which is accepted (the counter then ends one over the limit, never corrupt).

use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};

use crate::{
    clock::Clock,
    domain::{OpKind, Platform},
    store::{port::UsageStore, types::UsageKey},
    utils::bounded,
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DailyLimits {
    pub reads: u64,
    pub writes: u64,
}

impl DailyLimits {
    pub fn for_op(&self, op: OpKind) -> u64 {
        match op {
            OpKind::Read => self.reads,
            OpKind::Write => self.writes,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub limits: DailyLimits,
}

pub struct AdmissionControl {
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    limits: DailyLimits,
    store_timeout: Duration,
}

impl AdmissionControl {
    pub fn new(
        store: Arc<dyn UsageStore>,
        clock: Arc<dyn Clock>,
        limits: DailyLimits,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            limits,
            store_timeout,
        }
    }

    fn key(&self, platform: Platform, op: OpKind) -> UsageKey {
        UsageKey {
            platform,
            op,
            day: self.clock.now().date_naive(),
        }
    }

    /// Whether today's counter is still below `daily_limit`.
    ///
    /// A failing store denies.
    pub async fn can_proceed(&self, platform: Platform, op: OpKind, daily_limit: u64) -> bool {
        let key = self.key(platform, op);
        match bounded(self.store_timeout, "usage read", self.store.usage(key)).await {
            Ok(used) => {
                let ok = used < daily_limit;
                if !ok {
                    debug!(%platform, %op, used, daily_limit, "admission denied");
                }
                ok
            }
            Err(e) => {
                warn!(%platform, %op, error = %e, "usage lookup failed; denying");
                false
            }
        }
    }

    /// Check against the configured limit, as an error for `?` chains.
    pub async fn admit(&self, platform: Platform, op: OpKind) -> Result<()> {
        if self
            .can_proceed(platform, op, self.limits.for_op(op))
            .await
        {
            Ok(())
        } else {
            Err(Error::QuotaExceeded { platform, op })
        }
    }

    /// Count `n` successful external operations.
    pub async fn record_usage(&self, platform: Platform, op: OpKind, n: u64) {
        let key = self.key(platform, op);
        if let Err(e) = bounded(
            self.store_timeout,
            "usage increment",
            self.store.increment(key, n),
        )
        .await
        {
            warn!(%platform, %op, n, error = %e, "failed to record usage");
        }
    }

    pub async fn snapshot(&self, platform: Platform) -> Result<UsageSnapshot> {
        let reads = self.store.usage(self.key(platform, OpKind::Read)).await?;
        let writes = self.store.usage(self.key(platform, OpKind::Write)).await?;
        Ok(UsageSnapshot {
            reads,
            writes,
            limits: self.limits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, store::memory::MemoryStore};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    fn control(clock: Arc<ManualClock>) -> (AdmissionControl, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ac = AdmissionControl::new(
            store.clone(),
            clock,
            DailyLimits {
                reads: 3,
                writes: 1,
            },
            Duration::from_secs(1),
        );
        (ac, store)
    }

    #[tokio::test]
    async fn denies_once_limit_reached_and_check_does_not_mutate() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap(),
        ));
        let (ac, _) = control(clock);

        for _ in 0..5 {
            assert!(ac.can_proceed(Platform::Twitter, OpKind::Write, 1).await);
        }
        ac.record_usage(Platform::Twitter, OpKind::Write, 1).await;
        assert!(!ac.can_proceed(Platform::Twitter, OpKind::Write, 1).await);
        assert!(matches!(
            ac.admit(Platform::Twitter, OpKind::Write).await,
            Err(Error::QuotaExceeded {
                op: OpKind::Write,
                ..
            })
        ));
        assert!(ac.admit(Platform::Twitter, OpKind::Read).await.is_ok());
    }

    #[tokio::test]
    async fn counters_roll_over_by_date() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 1, 23, 59, 0).unwrap(),
        ));
        let (ac, _) = control(clock.clone());
        ac.record_usage(Platform::Twitter, OpKind::Read, 3).await;
        assert!(!ac.can_proceed(Platform::Twitter, OpKind::Read, 3).await);

        clock.advance(chrono::Duration::minutes(2));
        assert!(ac.can_proceed(Platform::Twitter, OpKind::Read, 3).await);
        let snap = ac.snapshot(Platform::Twitter).await.unwrap();
        assert_eq!(snap.reads, 0);
    }

    struct BrokenStore;

    #[async_trait]
    impl UsageStore for BrokenStore {
        async fn usage(&self, _key: UsageKey) -> Result<u64> {
            Err(Error::Ledger("db down".into()))
        }

        async fn increment(&self, _key: UsageKey, _n: u64) -> Result<u64> {
            Err(Error::Ledger("db down".into()))
        }
    }

    #[tokio::test]
    async fn store_failure_fails_closed() {
        let ac = AdmissionControl::new(
            Arc::new(BrokenStore),
            Arc::new(crate::clock::SystemClock),
            DailyLimits {
                reads: 100,
                writes: 50,
            },
            Duration::from_secs(1),
        );
        assert!(!ac.can_proceed(Platform::Twitter, OpKind::Read, 100).await);
        // Recording failures are swallowed.
        ac.record_usage(Platform::Twitter, OpKind::Read, 1).await;
    }
}
