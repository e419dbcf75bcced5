//! Response orchestration: prompt, generate, cap, post, persist.
//!
//! Only the task holding the ledger claim on a post generates and posts for it;
//! a concurrent poll that sees the same post backs off with `InFlight`.
//!
//! Failure policy:
//! - write budget spent (before generating or right before posting): nothing is
//!   posted or recorded, the interaction stays unprocessed and is retried later.
//! - generation failure: logged, interaction stays unprocessed.
//! - post failure: the interaction is marked processed with a `post_failed` tag so
//!   a flaky endpoint cannot cause a retry storm. The reply is dropped.

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::{
    admission::AdmissionControl,
    clock::Clock,
    domain::{OpKind, ResponseStrategy, TargetAccount},
    generation::{
        port::Generator,
        types::{ChatMessage, GenerationRequest, Role},
    },
    ledger::Ledger,
    social::port::SocialClient,
    store::{
        merge_metadata,
        port::ConversationStore,
        types::{ConversationMessage, InteractionKind},
    },
    thread::ThreadContext,
    utils::{bounded, enforce_reply_cap, preview},
    Error, Result,
};

pub fn strategy_instruction(strategy: ResponseStrategy) -> &'static str {
    match strategy {
        ResponseStrategy::Aggressive => {
            "Take a clear, confident position. If the argument is weak, challenge it directly \
             and offer a sharper alternative."
        }
        ResponseStrategy::Moderate => {
            "Add one thoughtful perspective or a concrete example that extends the point. \
             Be friendly and direct."
        }
        ResponseStrategy::Conservative => {
            "Respond respectfully and cautiously. Ask a genuine question or point out a nuance; \
             avoid strong claims."
        }
        ResponseStrategy::Minimal => "Reply with a single short observation.",
    }
}

/// Single-turn prompt for replying to a monitored account.
pub fn compose_prompt(
    strategy: ResponseStrategy,
    account: &TargetAccount,
    ctx: &ThreadContext,
    max_chars: usize,
) -> String {
    let mut out = String::new();
    out.push_str(strategy_instruction(strategy));
    out.push_str("\n\n");
    out.push_str(&format!("Account: {} (@{})\n", account.name, account.handle));
    out.push_str(&format!("Category: {}\n", account.category));
    if !account.notes.trim().is_empty() {
        out.push_str(&format!("Notes: {}\n", account.notes.trim()));
    }
    out.push_str("\nThread:\n");
    out.push_str(&ctx.rendered);
    out.push_str(&format!(
        "\n\nWrite a reply to the last post in the thread. Keep it under {max_chars} characters."
    ));
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyMode {
    /// One prompt, no history.
    Single,
    /// Stored conversation history plus the new turn.
    Chat,
}

/// Everything needed to answer one post.
#[derive(Clone, Debug)]
pub struct ReplyJob {
    pub kind: InteractionKind,
    /// Who we are answering (a monitored account or the author of a mention).
    pub account: TargetAccount,
    pub strategy: ResponseStrategy,
    pub context: ThreadContext,
    pub mode: ReplyMode,
    /// Extra ledger metadata (batch, category, ...).
    pub metadata: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseOutcome {
    Responded { reply_id: String, text: String },
    /// Write budget spent; left unprocessed.
    Deferred,
    /// Ledger row could not be written or claimed; left unprocessed.
    Aborted,
    /// Another task holds the claim, or the post was handled meanwhile.
    InFlight,
    /// Generation failed or returned nothing; left unprocessed.
    GenerationFailed,
    /// Marked processed without a reply.
    PostFailed,
}

impl ResponseOutcome {
    /// Whether the ledger now holds a final state for the post.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResponseOutcome::Responded { .. } | ResponseOutcome::PostFailed
        )
    }
}

pub struct Responder {
    generator: Arc<dyn Generator>,
    social: Arc<dyn SocialClient>,
    admission: Arc<AdmissionControl>,
    ledger: Arc<Ledger>,
    conversations: Arc<dyn ConversationStore>,
    clock: Arc<dyn Clock>,
    persona: String,
    max_reply_len: usize,
    truncated_reply_len: usize,
    store_timeout: Duration,
}

pub struct ResponderSettings {
    pub persona: String,
    pub max_reply_len: usize,
    pub truncated_reply_len: usize,
    pub store_timeout: Duration,
}

impl Responder {
    pub fn new(
        generator: Arc<dyn Generator>,
        social: Arc<dyn SocialClient>,
        admission: Arc<AdmissionControl>,
        ledger: Arc<Ledger>,
        conversations: Arc<dyn ConversationStore>,
        clock: Arc<dyn Clock>,
        settings: ResponderSettings,
    ) -> Self {
        Self {
            generator,
            social,
            admission,
            ledger,
            conversations,
            clock,
            persona: settings.persona,
            max_reply_len: settings.max_reply_len,
            truncated_reply_len: settings.truncated_reply_len,
            store_timeout: settings.store_timeout,
        }
    }

    pub async fn respond(&self, job: ReplyJob) -> ResponseOutcome {
        let platform = self.social.platform();
        let post = &job.context.post;

        if self.admission.admit(platform, OpKind::Write).await.is_err() {
            info!(post_id = %post.id, "write budget spent; deferring reply");
            return ResponseOutcome::Deferred;
        }

        let mut metadata = job.metadata.clone();
        merge_metadata(
            &mut metadata,
            &json!({ "handle": job.account.handle, "category": job.account.category }),
        );
        if let Err(e) = self
            .ledger
            .record(platform, &post.id, job.kind, &post.author_id, metadata)
            .await
        {
            error!(post_id = %post.id, error = %e, "could not record interaction; not responding");
            return ResponseOutcome::Aborted;
        }
        match self.ledger.claim(platform, &post.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(post_id = %post.id, "reply already in flight elsewhere");
                return ResponseOutcome::InFlight;
            }
            Err(e) => {
                error!(post_id = %post.id, error = %e, "could not claim interaction; not responding");
                return ResponseOutcome::Aborted;
            }
        }

        let conversation_id = format!(
            "{platform}:{}",
            job.context.conversation_id.as_deref().unwrap_or(&post.id)
        );
        let history = self.load_history(&conversation_id, job.mode).await;

        let prompt = compose_prompt(job.strategy, &job.account, &job.context, self.max_reply_len);
        let request = match job.mode {
            ReplyMode::Single => GenerationRequest::single(Some(self.persona.clone()), prompt),
            ReplyMode::Chat => {
                let mut messages = history;
                messages.push(ChatMessage::user(prompt));
                GenerationRequest::chat(Some(self.persona.clone()), messages)
            }
        };

        let text = match self.generate(request).await {
            Ok(t) => t,
            Err(e) => {
                warn!(post_id = %post.id, error = %e, "generation failed; leaving unprocessed");
                self.ledger.release(platform, &post.id).await;
                return ResponseOutcome::GenerationFailed;
            }
        };
        let text = enforce_reply_cap(&text, self.max_reply_len, self.truncated_reply_len);

        if self.admission.admit(platform, OpKind::Write).await.is_err() {
            info!(post_id = %post.id, "write budget spent while generating; deferring reply");
            self.ledger.release(platform, &post.id).await;
            return ResponseOutcome::Deferred;
        }

        let published = match self.social.post(&text, Some(&post.id)).await {
            Ok(p) => p,
            Err(e) => {
                warn!(post_id = %post.id, error = %e, "posting reply failed; marking processed");
                if let Err(me) = self
                    .ledger
                    .mark_failed(platform, &post.id, Some(&conversation_id), &e.to_string())
                    .await
                {
                    error!(post_id = %post.id, error = %me, "could not mark failed reply");
                }
                return ResponseOutcome::PostFailed;
            }
        };
        self.admission.record_usage(platform, OpKind::Write, 1).await;

        self.persist_exchange(&conversation_id, &job, &text, &published.id)
            .await;

        match self
            .ledger
            .mark_processed(
                platform,
                &post.id,
                Some(&conversation_id),
                json!({ "reply_id": published.id, "reply_text": text }),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(post_id = %post.id, "interaction was already processed"),
            Err(e) => {
                error!(post_id = %post.id, reply_id = %published.id, error = %e, "reply posted but not marked processed")
            }
        }

        info!(
            post_id = %post.id,
            reply_id = %published.id,
            handle = %job.account.handle,
            reply = %preview(&text, 80),
            "replied"
        );
        ResponseOutcome::Responded {
            reply_id: published.id,
            text,
        }
    }

    async fn generate(&self, request: GenerationRequest) -> Result<String> {
        let raw = self.generator.generate(request).await?;
        let text = raw.trim();
        if text.is_empty() {
            return Err(Error::Generation("empty completion".to_string()));
        }
        Ok(text.to_string())
    }

    async fn load_history(&self, conversation_id: &str, mode: ReplyMode) -> Vec<ChatMessage> {
        let platform = self.social.platform();
        let res = bounded(
            self.store_timeout,
            "conversation load",
            self.conversations
                .get_or_create(platform, conversation_id, self.clock.now()),
        )
        .await;
        match (res, mode) {
            (Ok(conv), ReplyMode::Chat) => conv
                .messages
                .into_iter()
                .map(|m| ChatMessage {
                    role: m.role,
                    content: m.content,
                })
                .collect(),
            (Ok(_), ReplyMode::Single) => Vec::new(),
            (Err(e), _) => {
                warn!(conversation_id, error = %e, "conversation unavailable; replying without history");
                Vec::new()
            }
        }
    }

    async fn persist_exchange(
        &self,
        conversation_id: &str,
        job: &ReplyJob,
        reply: &str,
        reply_id: &str,
    ) {
        let now = self.clock.now();
        let post = &job.context.post;
        let messages = [
            ConversationMessage {
                role: Role::User,
                content: post.text.clone(),
                metadata: json!({ "post_id": post.id, "author_id": post.author_id }),
                created_at: now,
            },
            ConversationMessage {
                role: Role::Assistant,
                content: reply.to_string(),
                metadata: json!({ "reply_id": reply_id }),
                created_at: now,
            },
        ];
        for m in messages {
            if let Err(e) = bounded(
                self.store_timeout,
                "conversation append",
                self.conversations.append(conversation_id, m),
            )
            .await
            {
                warn!(conversation_id, error = %e, "could not persist conversation message");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        admission::DailyLimits,
        clock::ManualClock,
        domain::Platform,
        store::{
            memory::MemoryStore,
            port::{InteractionStore, UsageStore},
            types::UsageKey,
        },
        testing::{post, t0, FakeGenerator, FakeSocial, LONG_AI_TEXT},
    };
    use async_trait::async_trait;

    struct Harness {
        social: Arc<FakeSocial>,
        store: Arc<MemoryStore>,
        responder: Responder,
    }

    fn harness(generator: Arc<dyn Generator>, writes: u64) -> Harness {
        harness_with(|_| generator, writes)
    }

    fn harness_with(
        make_generator: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn Generator>,
        writes: u64,
    ) -> Harness {
        let social = Arc::new(FakeSocial::new());
        let store = Arc::new(MemoryStore::new());
        let generator = make_generator(store.clone());
        let clock = Arc::new(ManualClock::new(t0()));
        let admission = Arc::new(AdmissionControl::new(
            store.clone(),
            clock.clone(),
            DailyLimits { reads: 100, writes },
            Duration::from_secs(1),
        ));
        let ledger = Arc::new(Ledger::new(store.clone(), clock.clone(), Duration::from_secs(1)));
        let responder = Responder::new(
            generator,
            social.clone(),
            admission,
            ledger,
            store.clone(),
            clock,
            ResponderSettings {
                persona: "persona".into(),
                max_reply_len: 280,
                truncated_reply_len: 247,
                store_timeout: Duration::from_secs(1),
            },
        );
        Harness {
            social,
            store,
            responder,
        }
    }

    fn account() -> TargetAccount {
        TargetAccount {
            name: "Andrej".into(),
            handle: "karpathy".into(),
            category: "AI Research".into(),
            notes: "Likes deep technical takes".into(),
            valid: true,
        }
    }

    fn job(mode: ReplyMode) -> ReplyJob {
        ReplyJob {
            kind: InteractionKind::TargetPost,
            account: account(),
            strategy: ResponseStrategy::Moderate,
            context: ThreadContext::single(&post("100", "karpathy", LONG_AI_TEXT, t0())),
            mode,
            metadata: json!({ "batch": 0 }),
        }
    }

    fn writes_key() -> UsageKey {
        UsageKey {
            platform: Platform::Twitter,
            op: OpKind::Write,
            day: t0().date_naive(),
        }
    }

    #[tokio::test]
    async fn write_budget_spent_means_no_post_and_no_usage() {
        let gen = Arc::new(FakeGenerator::replying("hi"));
        let h = harness(gen.clone(), 50);
        h.store.increment(writes_key(), 50).await.unwrap();

        let out = h.responder.respond(job(ReplyMode::Single)).await;
        assert_eq!(out, ResponseOutcome::Deferred);
        assert!(h.social.posted().is_empty());
        assert!(gen.requests().is_empty());
        assert_eq!(h.store.usage(writes_key()).await.unwrap(), 50);
        assert!(h
            .store
            .get(Platform::Twitter, "100")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn successful_reply_is_capped_posted_and_persisted() {
        let gen = Arc::new(FakeGenerator::replying(&format!("  {}  ", "z".repeat(300))));
        let h = harness(gen.clone(), 50);

        let out = h.responder.respond(job(ReplyMode::Single)).await;
        let ResponseOutcome::Responded { reply_id, text } = out else {
            panic!("expected a reply, got {out:?}");
        };
        assert_eq!(text.chars().count(), 250);
        assert!(text.ends_with("..."));

        let posted = h.social.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].1.as_deref(), Some("100"));
        assert_eq!(h.store.usage(writes_key()).await.unwrap(), 1);

        let row = h.store.get(Platform::Twitter, "100").await.unwrap().unwrap();
        assert!(row.processed && row.response_sent);
        assert_eq!(row.metadata["reply_id"], reply_id.as_str());
        assert_eq!(row.metadata["handle"], "karpathy");

        let conv = h.store.load("twitter:100").await.unwrap().unwrap();
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.messages[0].role, Role::User);
        assert_eq!(conv.messages[1].content, text);

        let req = &gen.requests()[0];
        assert_eq!(req.system.as_deref(), Some("persona"));
        let prompt = req.last_user_text().unwrap();
        assert!(prompt.contains("Account: Andrej (@karpathy)"));
        assert!(prompt.contains("Notes: Likes deep technical takes"));
        assert!(prompt.contains(&format!("1. {LONG_AI_TEXT}")));
    }

    #[tokio::test]
    async fn post_failure_marks_processed_without_response() {
        let h = harness(Arc::new(FakeGenerator::replying("good point")), 50);
        h.social.fail_posts();

        assert_eq!(
            h.responder.respond(job(ReplyMode::Single)).await,
            ResponseOutcome::PostFailed
        );
        let row = h.store.get(Platform::Twitter, "100").await.unwrap().unwrap();
        assert!(row.processed);
        assert!(!row.response_sent);
        assert_eq!(row.metadata["post_failed"], true);
        assert_eq!(h.store.usage(writes_key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn generation_failure_leaves_post_unprocessed() {
        for gen in [FakeGenerator::failing("backend down"), FakeGenerator::replying("   ")] {
            let h = harness(Arc::new(gen), 50);
            assert_eq!(
                h.responder.respond(job(ReplyMode::Single)).await,
                ResponseOutcome::GenerationFailed
            );
            assert!(h.social.posted().is_empty());
            let row = h.store.get(Platform::Twitter, "100").await.unwrap().unwrap();
            assert!(!row.processed);
            assert_eq!(row.claimed_at, None, "claim released for the next poll");
        }
    }

    #[tokio::test]
    async fn claimed_post_is_left_to_its_holder() {
        let gen = Arc::new(FakeGenerator::replying("me too"));
        let h = harness(gen.clone(), 50);
        h.store
            .upsert(crate::store::types::NewInteraction {
                platform: Platform::Twitter,
                external_id: "100".into(),
                kind: InteractionKind::Mention,
                author_id: "uid-karpathy".into(),
                metadata: json!({}),
                at: t0(),
            })
            .await
            .unwrap();
        assert!(h
            .store
            .claim(Platform::Twitter, "100", t0(), t0())
            .await
            .unwrap());

        assert_eq!(
            h.responder.respond(job(ReplyMode::Single)).await,
            ResponseOutcome::InFlight
        );
        assert!(gen.requests().is_empty());
        assert!(h.social.posted().is_empty());
        let row = h.store.get(Platform::Twitter, "100").await.unwrap().unwrap();
        assert!(row.claimed_at.is_some());
    }

    #[tokio::test]
    async fn chat_mode_sends_stored_history() {
        let gen = Arc::new(FakeGenerator::replying("again, yes"));
        let h = harness(gen.clone(), 50);
        h.store
            .get_or_create(Platform::Twitter, "twitter:100", t0())
            .await
            .unwrap();
        for (role, content) in [(Role::User, "earlier q"), (Role::Assistant, "earlier a")] {
            h.store
                .append(
                    "twitter:100",
                    ConversationMessage {
                        role,
                        content: content.into(),
                        metadata: json!({}),
                        created_at: t0(),
                    },
                )
                .await
                .unwrap();
        }

        h.responder.respond(job(ReplyMode::Chat)).await;
        let req = &gen.requests()[0];
        assert_eq!(req.messages.len(), 3);
        assert_eq!(req.messages[0].content, "earlier q");
        assert_eq!(req.messages[1].role, Role::Assistant);
        assert_eq!(
            h.store.load("twitter:100").await.unwrap().unwrap().messages.len(),
            4
        );
    }

    /// Spends the write budget while "thinking".
    struct Exhausting {
        store: Arc<MemoryStore>,
    }

    #[async_trait]
    impl Generator for Exhausting {
        async fn generate(&self, _req: GenerationRequest) -> Result<String> {
            self.store.increment(writes_key(), 1).await?;
            Ok("late reply".into())
        }
    }

    #[tokio::test]
    async fn write_budget_is_rechecked_before_posting() {
        let h = harness_with(|store| Arc::new(Exhausting { store }), 1);

        assert_eq!(
            h.responder.respond(job(ReplyMode::Single)).await,
            ResponseOutcome::Deferred
        );
        assert!(h.social.posted().is_empty());
        assert_eq!(h.store.usage(writes_key()).await.unwrap(), 1);
        let row = h.store.get(Platform::Twitter, "100").await.unwrap().unwrap();
        assert!(!row.processed);
        assert_eq!(row.claimed_at, None);
    }
}
