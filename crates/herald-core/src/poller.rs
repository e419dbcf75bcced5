//! One poll of one batch: fetch, dedup, filter, gate, respond.

use std::{fmt, sync::Arc};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    clock::{Clock, RandomSource},
    filter::{ContentFilter, PostState, Verdict},
    ledger::Ledger,
    query::{attribute, Fetcher},
    responder::{ReplyJob, ReplyMode, Responder, ResponseOutcome},
    scheduler::Batch,
    social::port::SocialClient,
    store::types::InteractionKind,
    thread::ThreadAssembler,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Completed,
    /// Read budget spent; nothing was fetched.
    QuotaExceeded,
    FetchFailed(String),
}

impl fmt::Display for PollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollOutcome::Completed => f.write_str("completed"),
            PollOutcome::QuotaExceeded => f.write_str("quota_exceeded"),
            PollOutcome::FetchFailed(e) => write!(f, "fetch_failed: {e}"),
        }
    }
}

/// Per-poll tallies, one bucket per state a post ended in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollReport {
    pub batch: usize,
    pub outcome: PollOutcome,
    pub fetched: usize,
    pub already_processed: usize,
    pub candidates: usize,
    pub filtered: usize,
    pub skipped: usize,
    pub selected: usize,
    pub responded: usize,
    pub deferred: usize,
    /// Selected, but another poll was already replying.
    pub in_flight: usize,
    pub failed: usize,
}

impl PollReport {
    fn new(batch: usize) -> Self {
        Self {
            batch,
            outcome: PollOutcome::Completed,
            fetched: 0,
            already_processed: 0,
            candidates: 0,
            filtered: 0,
            skipped: 0,
            selected: 0,
            responded: 0,
            deferred: 0,
            in_flight: 0,
            failed: 0,
        }
    }
}

pub struct BatchPoller {
    social: Arc<dyn SocialClient>,
    fetcher: Fetcher,
    ledger: Arc<Ledger>,
    filter: Arc<ContentFilter>,
    threads: Arc<ThreadAssembler>,
    responder: Arc<Responder>,
    clock: Arc<dyn Clock>,
    rng: Arc<dyn RandomSource>,
}

impl BatchPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        social: Arc<dyn SocialClient>,
        fetcher: Fetcher,
        ledger: Arc<Ledger>,
        filter: Arc<ContentFilter>,
        threads: Arc<ThreadAssembler>,
        responder: Arc<Responder>,
        clock: Arc<dyn Clock>,
        rng: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            social,
            fetcher,
            ledger,
            filter,
            threads,
            responder,
            clock,
            rng,
        }
    }

    pub async fn poll_batch(&self, batch: &Batch) -> PollReport {
        let mut report = PollReport::new(batch.index);

        let posts = match self.fetcher.fetch(batch).await {
            Ok(p) => p,
            Err(e) if e.is_quota() => {
                info!(batch = batch.index, "read budget spent; skipping poll");
                report.outcome = PollOutcome::QuotaExceeded;
                return report;
            }
            Err(e) => {
                warn!(batch = batch.index, error = %e, "batch fetch failed");
                report.outcome = PollOutcome::FetchFailed(e.to_string());
                return report;
            }
        };
        batch.mark_checked(self.clock.now());
        report.fetched = posts.len();

        let platform = self.social.platform();
        for post in posts {
            let mut state = PostState::New;
            if self.ledger.is_processed(platform, &post.id).await {
                report.already_processed += 1;
                debug!(post_id = %post.id, state = %PostState::AlreadyProcessed, "post");
                continue;
            }
            report.candidates += 1;

            let account = attribute(&post, &batch.accounts, &batch.category);
            let verdict = self
                .filter
                .decide(&post, &batch.category, self.clock.now(), self.rng.as_ref());
            debug!(post_id = %post.id, from = %state, to = %verdict.state(), "post");
            state = verdict.state();

            match verdict {
                Verdict::Filtered(reason) => {
                    report.filtered += 1;
                    let meta = json!({ "batch": batch.index, "category": batch.category, "handle": account.handle });
                    let res = match self
                        .ledger
                        .record(platform, &post.id, InteractionKind::TargetPost, &post.author_id, meta)
                        .await
                    {
                        Ok(_) => self.ledger.mark_filtered(platform, &post.id, reason.as_str()).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = res {
                        warn!(post_id = %post.id, %reason, error = %e, "could not record filtered post");
                    }
                }
                Verdict::Skipped { probability, draw } => {
                    report.skipped += 1;
                    debug!(post_id = %post.id, probability, draw, "gate skipped post");
                }
                Verdict::Selected {
                    probability,
                    relevant,
                } => {
                    report.selected += 1;
                    debug!(post_id = %post.id, probability, relevant, handle = %account.handle, "selected");
                    let context = self.threads.assemble(&post).await;
                    let outcome = self
                        .responder
                        .respond(ReplyJob {
                            kind: InteractionKind::TargetPost,
                            account,
                            strategy: batch.strategy,
                            context,
                            mode: ReplyMode::Single,
                            metadata: json!({ "batch": batch.index, "probability": probability }),
                        })
                        .await;
                    match outcome {
                        ResponseOutcome::Responded { .. } => {
                            state = PostState::Responded;
                            report.responded += 1;
                        }
                        ResponseOutcome::Deferred => report.deferred += 1,
                        ResponseOutcome::InFlight => report.in_flight += 1,
                        ResponseOutcome::Aborted
                        | ResponseOutcome::GenerationFailed
                        | ResponseOutcome::PostFailed => report.failed += 1,
                    }
                }
            }
            debug!(post_id = %post.id, %state, terminal = state.is_terminal(), "post done");
        }

        info!(
            batch = batch.index,
            category = %batch.category,
            fetched = report.fetched,
            candidates = report.candidates,
            filtered = report.filtered,
            skipped = report.skipped,
            responded = report.responded,
            "batch polled"
        );
        report
    }
}
