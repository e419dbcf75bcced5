//! Wires the engine's components from injected collaborators.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    admission::{AdmissionControl, DailyLimits, UsageSnapshot},
    clock::{Clock, RandomSource},
    config::Policy,
    filter::ContentFilter,
    generation::{bounded::BoundedGenerator, port::Generator},
    ledger::Ledger,
    mentions::{normalize_bot_handle, MentionMonitor, MentionSettings},
    poller::BatchPoller,
    query::Fetcher,
    registry::AccountRegistry,
    responder::{Responder, ResponderSettings},
    scheduler::{build_batches, BatchScheduler, SchedulerStatus},
    social::{bounded::BoundedSocial, port::SocialClient},
    store::port::{ConversationStore, InteractionStore, UsageStore},
    thread::ThreadAssembler,
    Result,
};

/// External collaborators the engine runs against.
#[derive(Clone)]
pub struct Services {
    pub social: Arc<dyn SocialClient>,
    pub generator: Arc<dyn Generator>,
    pub usage: Arc<dyn UsageStore>,
    pub interactions: Arc<dyn InteractionStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub clock: Arc<dyn Clock>,
    pub rng: Arc<dyn RandomSource>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineStatus {
    pub scheduler: SchedulerStatus,
    /// `None` when the usage store could not be read.
    pub usage: Option<UsageSnapshot>,
    pub mentions_running: bool,
}

pub struct Engine {
    policy: Policy,
    registry: Arc<AccountRegistry>,
    social: Arc<dyn SocialClient>,
    admission: Arc<AdmissionControl>,
    scheduler: BatchScheduler,
    mentions: Option<MentionMonitor>,
}

impl Engine {
    /// Without a bot handle the mention monitor is disabled.
    pub fn new(
        policy: Policy,
        registry: AccountRegistry,
        services: Services,
        bot_handle: Option<String>,
    ) -> Result<Self> {
        let social: Arc<dyn SocialClient> =
            Arc::new(BoundedSocial::new(services.social, policy.call_timeout));
        let generator: Arc<dyn Generator> = Arc::new(BoundedGenerator::new(
            services.generator,
            policy.generation_timeout,
        ));
        let clock = services.clock;
        let registry = Arc::new(registry);

        let admission = Arc::new(AdmissionControl::new(
            services.usage,
            clock.clone(),
            DailyLimits {
                reads: policy.daily_read_limit,
                writes: policy.daily_write_limit,
            },
            policy.store_timeout,
        ));
        let ledger = Arc::new(Ledger::new(
            services.interactions,
            clock.clone(),
            policy.store_timeout,
        ));
        let filter = Arc::new(ContentFilter::new(&policy)?);
        let threads = Arc::new(ThreadAssembler::new(
            social.clone(),
            admission.clone(),
            policy.thread_max_posts,
        ));
        let responder = Arc::new(Responder::new(
            generator,
            social.clone(),
            admission.clone(),
            ledger.clone(),
            services.conversations,
            clock.clone(),
            ResponderSettings {
                persona: policy.persona.clone(),
                max_reply_len: policy.max_reply_len,
                truncated_reply_len: policy.truncated_reply_len,
                store_timeout: policy.store_timeout,
            },
        ));

        let poller = Arc::new(BatchPoller::new(
            social.clone(),
            Fetcher::new(social.clone(), admission.clone(), policy.search_max_results),
            ledger.clone(),
            filter.clone(),
            threads.clone(),
            responder.clone(),
            clock.clone(),
            services.rng,
        ));
        let scheduler = BatchScheduler::new(
            build_batches(&registry, &policy),
            poller,
            clock.clone(),
            policy.batch_stagger,
        );

        let mentions = match bot_handle {
            Some(raw) => Some(MentionMonitor::new(
                normalize_bot_handle(&raw)?,
                social.clone(),
                admission.clone(),
                ledger,
                filter,
                threads,
                responder,
                registry.clone(),
                clock,
                MentionSettings {
                    interval: policy.mention_interval,
                    max_per_hour: policy.max_mentions_per_hour,
                    max_results: policy.search_max_results,
                },
            )),
            None => {
                warn!("no bot handle configured; mention monitor disabled");
                None
            }
        };

        Ok(Self {
            policy,
            registry,
            social,
            admission,
            scheduler,
            mentions,
        })
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    pub fn mentions(&self) -> Option<&MentionMonitor> {
        self.mentions.as_ref()
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await?;
        if let Some(m) = &self.mentions {
            m.start().await;
        }
        info!("engine started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
        if let Some(m) = &self.mentions {
            m.stop().await;
        }
        info!("engine stopped");
    }

    pub async fn status(&self) -> EngineStatus {
        let usage = match self.admission.snapshot(self.social.platform()).await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "usage snapshot unavailable");
                None
            }
        };
        let mentions_running = match &self.mentions {
            Some(m) => m.is_running().await,
            None => false,
        };
        EngineStatus {
            scheduler: self.scheduler.status().await,
            usage,
            mentions_running,
        }
    }
}
