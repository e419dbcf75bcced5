//! Priority-tiered batch scheduler.
//!
//! - Categories are polled highest priority first, in batches sized by priority.
//! - Batch *i* first fires after `i * stagger`, then on its own interval.
//! - Each tick spawns its poll, so a slow poll never delays the next tick.
//! - `stop()` cancels the tickers only; polls already in flight run to completion.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    clock::Clock,
    config::Policy,
    domain::{ResponseStrategy, TargetAccount},
    poller::{BatchPoller, PollReport},
    registry::AccountRegistry,
    Error, Result,
};

const PREVIEW_LEN: usize = 5;

#[derive(Clone, Copy, Debug, Default)]
struct BatchTimes {
    last_checked_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
}

/// A slice of one category's accounts polled with a single search.
#[derive(Debug)]
pub struct Batch {
    pub index: usize,
    pub category: String,
    pub priority: u8,
    pub strategy: ResponseStrategy,
    pub accounts: Vec<TargetAccount>,
    pub interval: Duration,
    times: Mutex<BatchTimes>,
}

impl Batch {
    pub fn new(
        index: usize,
        category: String,
        priority: u8,
        strategy: ResponseStrategy,
        accounts: Vec<TargetAccount>,
        interval: Duration,
    ) -> Self {
        Self {
            index,
            category,
            priority,
            strategy,
            accounts,
            interval,
            times: Mutex::new(BatchTimes::default()),
        }
    }

    pub fn handles(&self) -> Vec<String> {
        self.accounts.iter().map(|a| a.handle.clone()).collect()
    }

    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        self.times.lock().ok().and_then(|t| t.last_checked_at)
    }

    pub fn mark_checked(&self, at: DateTime<Utc>) {
        if let Ok(mut t) = self.times.lock() {
            t.last_checked_at = Some(at);
        }
    }

    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.times.lock().ok().and_then(|t| t.next_run_at)
    }

    fn set_next_run(&self, at: Option<DateTime<Utc>>) {
        if let Ok(mut t) = self.times.lock() {
            t.next_run_at = at;
        }
    }
}

pub fn batch_size(priority: u8) -> usize {
    match priority {
        p if p >= 5 => 3,
        4 => 5,
        3 => 6,
        _ => 10,
    }
}

/// The lowest tier polls at twice the configured low interval.
pub fn interval_for(priority: u8, policy: &Policy) -> Duration {
    match priority {
        p if p >= 4 => policy.high_priority_interval,
        3 => policy.medium_priority_interval,
        _ => policy.low_priority_interval * 2,
    }
}

/// Partition the registry's valid accounts into batches, highest priority first.
pub fn build_batches(registry: &AccountRegistry, policy: &Policy) -> Vec<Batch> {
    let mut categories: Vec<_> = registry.categories().iter().collect();
    categories.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut batches = Vec::new();
    for category in categories {
        let accounts: Vec<TargetAccount> = category.valid_accounts().cloned().collect();
        for chunk in accounts.chunks(batch_size(category.priority)) {
            batches.push(Batch::new(
                batches.len(),
                category.name.clone(),
                category.priority,
                category.strategy,
                chunk.to_vec(),
                interval_for(category.priority, policy),
            ));
        }
    }
    batches
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchPreview {
    pub index: usize,
    pub category: String,
    pub priority: u8,
    pub accounts: usize,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub running: bool,
    pub batch_count: usize,
    pub account_count: usize,
    pub next_batches: Vec<BatchPreview>,
}

#[derive(Clone)]
pub struct BatchScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    batches: Vec<Arc<Batch>>,
    poller: Arc<BatchPoller>,
    clock: Arc<dyn Clock>,
    stagger: Duration,
    state: tokio::sync::Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    cancel: Option<CancellationToken>,
    tickers: Vec<JoinHandle<()>>,
}

impl BatchScheduler {
    pub fn new(
        batches: Vec<Batch>,
        poller: Arc<BatchPoller>,
        clock: Arc<dyn Clock>,
        stagger: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                batches: batches.into_iter().map(Arc::new).collect(),
                poller,
                clock,
                stagger,
                state: tokio::sync::Mutex::new(SchedulerState::default()),
            }),
        }
    }

    pub fn batches(&self) -> &[Arc<Batch>] {
        &self.inner.batches
    }

    pub async fn start(&self) -> Result<()> {
        let mut st = self.inner.state.lock().await;
        if st.cancel.is_some() {
            debug!("scheduler already running");
            return Ok(());
        }
        if self.inner.batches.is_empty() {
            return Err(Error::Config("no valid accounts to schedule".to_string()));
        }

        let cancel = CancellationToken::new();
        let now = self.inner.clock.now();
        for (i, batch) in self.inner.batches.iter().enumerate() {
            let delay = self.inner.stagger * i as u32;
            batch.set_next_run(chrono::Duration::from_std(delay).ok().map(|d| now + d));

            let scheduler = self.clone();
            let batch = batch.clone();
            let cancel = cancel.clone();
            st.tickers.push(tokio::spawn(async move {
                scheduler.ticker(batch, delay, cancel).await;
            }));
        }
        st.cancel = Some(cancel);

        info!(
            batches = self.inner.batches.len(),
            accounts = self.account_count(),
            "batch scheduler started"
        );
        Ok(())
    }

    /// Prevent new polls. In-flight polls finish and commit their side effects.
    pub async fn stop(&self) {
        let mut st = self.inner.state.lock().await;
        let Some(cancel) = st.cancel.take() else {
            return;
        };
        cancel.cancel();
        for handle in st.tickers.drain(..) {
            handle.abort();
        }
        for batch in &self.inner.batches {
            batch.set_next_run(None);
        }
        info!("batch scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.cancel.is_some()
    }

    pub async fn status(&self) -> SchedulerStatus {
        let running = self.is_running().await;

        let mut preview: Vec<BatchPreview> = self
            .inner
            .batches
            .iter()
            .map(|b| BatchPreview {
                index: b.index,
                category: b.category.clone(),
                priority: b.priority,
                accounts: b.accounts.len(),
                next_run_at: b.next_run_at(),
                last_checked_at: b.last_checked_at(),
            })
            .collect();
        // Scheduled batches first, soonest first.
        preview.sort_by_key(|p| (p.next_run_at.is_none(), p.next_run_at, p.index));
        preview.truncate(PREVIEW_LEN);

        SchedulerStatus {
            running,
            batch_count: self.inner.batches.len(),
            account_count: self.account_count(),
            next_batches: preview,
        }
    }

    /// Poll one batch now, outside its schedule.
    pub async fn trigger_batch(&self, index: usize) -> Result<PollReport> {
        let batch = self
            .inner
            .batches
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no batch with index {index}")))?;
        info!(batch = index, category = %batch.category, "manual batch trigger");
        Ok(self.inner.poller.poll_batch(&batch).await)
    }

    fn account_count(&self) -> usize {
        self.inner.batches.iter().map(|b| b.accounts.len()).sum()
    }

    async fn ticker(&self, batch: Arc<Batch>, delay: Duration, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let mut tick = tokio::time::interval(batch.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let next = chrono::Duration::from_std(batch.interval)
                        .ok()
                        .map(|d| self.inner.clock.now() + d);
                    batch.set_next_run(next);
                    self.spawn_poll(batch.clone());
                }
            }
        }
    }

    fn spawn_poll(&self, batch: Arc<Batch>) {
        let poller = self.inner.poller.clone();
        let index = batch.index;
        let task = tokio::spawn(async move { poller.poll_batch(&batch).await });
        tokio::spawn(async move {
            match task.await {
                Ok(report) => debug!(batch = index, outcome = %report.outcome, "poll finished"),
                Err(e) => error!(batch = index, error = %e, "poll task failed"),
            }
        });
    }
}
