//! Mention monitor: answers posts that address the bot's own handle.
//!
//! Reuses the ledger, filter, thread assembler and responder. Differences from
//! batch polling: no probability gate, an hourly reply cap, multi-turn replies,
//! and a `since_id` high-water mark that only moves once every fetched mention
//! reached a terminal state.

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tokio::{sync::Mutex, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    admission::AdmissionControl,
    clock::Clock,
    domain::{OpKind, Post, ResponseStrategy, TargetAccount},
    filter::ContentFilter,
    ledger::Ledger,
    registry::AccountRegistry,
    responder::{ReplyJob, ReplyMode, Responder, ResponseOutcome},
    social::{port::SocialClient, types::SearchRequest},
    store::types::InteractionKind,
    thread::ThreadAssembler,
    utils::cmp_ids,
    Error, Result,
};

const MENTION_CATEGORY: &str = "Mentions";

/// `@bot -is:retweet -from:bot`
pub fn mention_query(bot_handle: &str) -> String {
    format!("@{bot_handle} -is:retweet -from:{bot_handle}")
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MentionReport {
    pub fetched: usize,
    pub already_processed: usize,
    pub filtered: usize,
    pub responded: usize,
    /// Left for a later poll (hourly cap, write budget or a failed step).
    pub pending: usize,
    pub capped: bool,
    pub since_id: Option<String>,
}

pub struct MentionSettings {
    pub interval: Duration,
    pub max_per_hour: u64,
    pub max_results: u32,
}

#[derive(Clone)]
pub struct MentionMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    bot_handle: String,
    social: Arc<dyn SocialClient>,
    admission: Arc<AdmissionControl>,
    ledger: Arc<Ledger>,
    filter: Arc<ContentFilter>,
    threads: Arc<ThreadAssembler>,
    responder: Arc<Responder>,
    registry: Arc<AccountRegistry>,
    clock: Arc<dyn Clock>,
    settings: MentionSettings,
    since_id: Mutex<Option<String>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl MentionMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot_handle: String,
        social: Arc<dyn SocialClient>,
        admission: Arc<AdmissionControl>,
        ledger: Arc<Ledger>,
        filter: Arc<ContentFilter>,
        threads: Arc<ThreadAssembler>,
        responder: Arc<Responder>,
        registry: Arc<AccountRegistry>,
        clock: Arc<dyn Clock>,
        settings: MentionSettings,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                bot_handle,
                social,
                admission,
                ledger,
                filter,
                threads,
                responder,
                registry,
                clock,
                settings,
                since_id: Mutex::new(None),
                cancel: Mutex::new(None),
            }),
        }
    }

    pub fn bot_handle(&self) -> &str {
        &self.inner.bot_handle
    }

    pub async fn since_id(&self) -> Option<String> {
        self.inner.since_id.lock().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.cancel.lock().await.is_some()
    }

    /// Poll now and then every interval. No-op while already running.
    pub async fn start(&self) {
        let mut cancel_slot = self.inner.cancel.lock().await;
        if cancel_slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *cancel_slot = Some(cancel.clone());

        let monitor = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(monitor.inner.settings.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        match monitor.poll_once().await {
                            Ok(r) => debug!(responded = r.responded, pending = r.pending, "mention poll done"),
                            Err(e) if e.is_quota() => info!("read budget spent; mention poll skipped"),
                            Err(e) => warn!(error = %e, "mention poll failed"),
                        }
                    }
                }
            }
        });
        info!(bot = %self.inner.bot_handle, "mention monitor started");
    }

    pub async fn stop(&self) {
        if let Some(cancel) = self.inner.cancel.lock().await.take() {
            cancel.cancel();
            info!("mention monitor stopped");
        }
    }

    pub async fn poll_once(&self) -> Result<MentionReport> {
        let inner = &self.inner;
        let platform = inner.social.platform();
        let since_id = inner.since_id.lock().await.clone();

        inner.admission.admit(platform, OpKind::Read).await?;
        let mut mentions = inner
            .social
            .search(
                SearchRequest::new(mention_query(&inner.bot_handle), inner.settings.max_results)
                    .since(since_id.clone()),
            )
            .await?;
        inner.admission.record_usage(platform, OpKind::Read, 1).await;

        // Oldest first, so the cap answers people in the order they asked.
        mentions.sort_by(|a, b| cmp_ids(&a.id, &b.id));

        let mut report = MentionReport {
            fetched: mentions.len(),
            ..MentionReport::default()
        };
        let mut all_terminal = true;

        for (i, mention) in mentions.iter().enumerate() {
            if inner.ledger.is_processed(platform, &mention.id).await {
                report.already_processed += 1;
                continue;
            }

            if self.at_hourly_cap().await {
                report.capped = true;
                report.pending += mentions.len() - i;
                all_terminal = false;
                info!(left = mentions.len() - i, "hourly mention cap reached");
                break;
            }

            let terminal = self.handle(mention, &mut report).await;
            if !terminal {
                report.pending += 1;
                all_terminal = false;
            }
        }

        let newest = mentions.last().map(|m| m.id.clone());
        if all_terminal {
            if let Some(newest) = newest {
                *inner.since_id.lock().await = Some(newest);
            }
        }
        report.since_id = inner.since_id.lock().await.clone();
        Ok(report)
    }

    async fn at_hourly_cap(&self) -> bool {
        let inner = &self.inner;
        let since = inner.clock.now() - chrono::Duration::hours(1);
        match inner
            .ledger
            .responses_since(inner.social.platform(), since)
            .await
        {
            Ok(n) => n >= inner.settings.max_per_hour,
            Err(e) => {
                warn!(error = %e, "cannot count recent replies; holding mentions");
                true
            }
        }
    }

    /// Returns whether the mention reached a terminal state.
    async fn handle(&self, mention: &Post, report: &mut MentionReport) -> bool {
        let inner = &self.inner;
        let platform = inner.social.platform();

        if let Err(reason) = inner.filter.check_mention(mention, inner.clock.now()) {
            report.filtered += 1;
            let res = match inner
                .ledger
                .record(
                    platform,
                    &mention.id,
                    InteractionKind::Mention,
                    &mention.author_id,
                    json!({ "source": "mention" }),
                )
                .await
            {
                Ok(_) => inner
                    .ledger
                    .mark_filtered(platform, &mention.id, reason.as_str())
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            return match res {
                Ok(()) => true,
                Err(e) => {
                    warn!(post_id = %mention.id, error = %e, "could not record filtered mention");
                    false
                }
            };
        }

        let context = inner.threads.assemble(mention).await;
        let outcome = inner
            .responder
            .respond(ReplyJob {
                kind: InteractionKind::Mention,
                account: self.mention_account(mention),
                strategy: ResponseStrategy::Moderate,
                context,
                mode: ReplyMode::Chat,
                metadata: json!({ "source": "mention" }),
            })
            .await;
        if let ResponseOutcome::Responded { .. } = outcome {
            report.responded += 1;
        }
        outcome.is_terminal()
    }
}

impl MentionMonitor {
    /// Who wrote the mention. Monitored accounts keep their registry name and notes.
    fn mention_account(&self, mention: &Post) -> TargetAccount {
        let inner = &self.inner;
        let note = format!("They mentioned you (@{}) directly.", inner.bot_handle);
        let known = mention
            .author_handle
            .as_deref()
            .and_then(|h| inner.registry.find_by_handle(h));
        match known {
            Some((_, account)) => TargetAccount {
                name: account.name.clone(),
                handle: account.handle.clone(),
                category: MENTION_CATEGORY.to_string(),
                notes: format!("{} {note}", account.notes).trim().to_string(),
                valid: true,
            },
            None => {
                let author = mention
                    .author_handle
                    .clone()
                    .unwrap_or_else(|| mention.author_id.clone());
                TargetAccount {
                    name: author.clone(),
                    handle: author,
                    category: MENTION_CATEGORY.to_string(),
                    notes: note,
                    valid: true,
                }
            }
        }
    }
}

impl std::fmt::Debug for MentionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MentionMonitor")
            .field("bot_handle", &self.inner.bot_handle)
            .finish()
    }
}

/// Validate a configured bot handle.
pub fn normalize_bot_handle(raw: &str) -> Result<String> {
    let h = crate::registry::normalize_handle(raw);
    if h.is_empty() {
        return Err(Error::Config("bot handle is empty".to_string()));
    }
    Ok(h)
}
