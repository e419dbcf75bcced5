//! Thread-context assembly for a selected post.
//!
//! Context is best effort: any failure degrades to a single-post context instead
//! of failing the response.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    admission::AdmissionControl,
    domain::{OpKind, Post},
    social::{port::SocialClient, types::SearchRequest},
    Result,
};

/// Ephemeral context handed to the prompt builder. Never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct ThreadContext {
    pub post: Post,
    pub conversation_id: Option<String>,
    /// Chronological, always ending at `post`.
    pub posts: Vec<Post>,
    pub rendered: String,
}

impl ThreadContext {
    pub fn single(post: &Post) -> Self {
        let posts = vec![post.clone()];
        Self {
            post: post.clone(),
            conversation_id: post.conversation_id.clone(),
            rendered: render(&posts),
            posts,
        }
    }
}

/// `1. first\n\n2. second`
pub fn render(posts: &[Post]) -> String {
    posts
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{}. {}", i + 1, p.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Sort ascending by creation time and cut after the target. When the search
/// missed the target, it is appended so the thread still ends with it.
pub fn arrange(mut posts: Vec<Post>, target: &Post) -> Vec<Post> {
    posts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    match posts.iter().position(|p| p.id == target.id) {
        Some(idx) => posts.truncate(idx + 1),
        None => posts.push(target.clone()),
    }
    posts
}

pub struct ThreadAssembler {
    social: Arc<dyn SocialClient>,
    admission: Arc<AdmissionControl>,
    max_posts: u32,
}

impl ThreadAssembler {
    pub fn new(
        social: Arc<dyn SocialClient>,
        admission: Arc<AdmissionControl>,
        max_posts: u32,
    ) -> Self {
        Self {
            social,
            admission,
            max_posts: max_posts.clamp(10, 20),
        }
    }

    pub async fn assemble(&self, post: &Post) -> ThreadContext {
        match self.try_assemble(post).await {
            Ok(Some(ctx)) => ctx,
            Ok(None) => ThreadContext::single(post),
            Err(e) => {
                warn!(post_id = %post.id, error = %e, "thread context unavailable; using single post");
                ThreadContext::single(post)
            }
        }
    }

    async fn try_assemble(&self, post: &Post) -> Result<Option<ThreadContext>> {
        let Some(conversation_id) = self.conversation_id(post).await? else {
            return Ok(None);
        };

        let platform = self.social.platform();
        self.admission.admit(platform, OpKind::Read).await?;
        let found = self
            .social
            .search(SearchRequest::new(
                format!("conversation_id:{conversation_id}"),
                self.max_posts,
            ))
            .await?;
        self.admission.record_usage(platform, OpKind::Read, 1).await;

        if found.is_empty() {
            return Ok(None);
        }
        let posts = arrange(found, post);
        debug!(post_id = %post.id, %conversation_id, len = posts.len(), "thread assembled");
        Ok(Some(ThreadContext {
            post: post.clone(),
            conversation_id: Some(conversation_id),
            rendered: render(&posts),
            posts,
        }))
    }

    async fn conversation_id(&self, post: &Post) -> Result<Option<String>> {
        if let Some(id) = &post.conversation_id {
            return Ok(Some(id.clone()));
        }

        let platform = self.social.platform();
        self.admission.admit(platform, OpKind::Read).await?;
        let found = self.social.get_post(&post.id).await?;
        self.admission.record_usage(platform, OpKind::Read, 1).await;
        Ok(found.and_then(|p| p.conversation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        admission::DailyLimits,
        clock::ManualClock,
        store::{memory::MemoryStore, port::UsageStore, types::UsageKey},
        testing::{post, t0, FakeSocial},
    };
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn setup(reads: u64) -> (Arc<FakeSocial>, ThreadAssembler, Arc<MemoryStore>) {
        let social = Arc::new(FakeSocial::new());
        let store = Arc::new(MemoryStore::new());
        let admission = Arc::new(AdmissionControl::new(
            store.clone(),
            Arc::new(ManualClock::new(t0())),
            DailyLimits { reads, writes: 5 },
            Duration::from_secs(1),
        ));
        let asm = ThreadAssembler::new(social.clone(), admission, 20);
        (social, asm, store)
    }

    fn at(min: i64) -> chrono::DateTime<chrono::Utc> {
        t0() - ChronoDuration::minutes(60 - min)
    }

    #[tokio::test]
    async fn renders_prefix_up_to_target() {
        let (social, asm, store) = setup(10);
        social.on_search(
            "conversation_id:c1",
            vec![
                post("3", "b", "third", at(30)),
                post("1", "a", "first", at(10)),
                post("2", "b", "second", at(20)),
            ],
        );
        let mut target = post("2", "b", "second", at(20));
        target.conversation_id = Some("c1".into());

        let ctx = asm.assemble(&target).await;
        assert_eq!(ctx.rendered, "1. first\n\n2. second");
        assert!(!ctx.rendered.contains("3."));
        assert_eq!(social.lookup_calls(), 0);
        assert_eq!(social.searches()[0].max_results, 20);

        let key = UsageKey {
            platform: crate::domain::Platform::Twitter,
            op: OpKind::Read,
            day: t0().date_naive(),
        };
        assert_eq!(store.usage(key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn resolves_conversation_id_with_one_lookup() {
        let (social, asm, _) = setup(10);
        let mut resolved = post("5", "a", "root question", at(0));
        resolved.conversation_id = Some("c9".into());
        social.on_lookup(resolved);
        social.on_search("conversation_id:c9", vec![post("9", "z", "other", at(5))]);

        let ctx = asm.assemble(&post("5", "a", "root question", at(0))).await;
        assert_eq!(social.lookup_calls(), 1);
        assert_eq!(ctx.rendered, "1. other\n\n2. root question");
        assert_eq!(ctx.conversation_id.as_deref(), Some("c9"));
    }

    #[tokio::test]
    async fn target_missing_from_search_closes_the_thread() {
        let (social, asm, _) = setup(10);
        social.on_search(
            "conversation_id:c4",
            vec![post("40", "a", "root", at(0)), post("41", "b", "follow-up", at(5))],
        );
        let mut target = post("42", "c", "the reply we answer", at(10));
        target.conversation_id = Some("c4".into());

        let ctx = asm.assemble(&target).await;
        assert_eq!(
            ctx.rendered,
            "1. root\n\n2. follow-up\n\n3. the reply we answer"
        );
        assert_eq!(ctx.posts.last().map(|p| p.id.as_str()), Some("42"));
    }

    #[tokio::test]
    async fn degrades_to_single_post() {
        let (social, asm, _) = setup(10);
        let p = post("7", "a", "lonely", at(0));

        // No conversation id anywhere.
        assert_eq!(asm.assemble(&p).await.rendered, "1. lonely");

        // Search failure.
        let mut with_conv = p.clone();
        with_conv.conversation_id = Some("c7".into());
        social.fail_searches();
        let ctx = asm.assemble(&with_conv).await;
        assert_eq!(ctx.posts.len(), 1);
        assert_eq!(ctx.rendered, "1. lonely");
    }

    #[tokio::test]
    async fn read_budget_exhausted_degrades_without_calls() {
        let (social, asm, _) = setup(0);
        let mut p = post("8", "a", "budget", at(0));
        p.conversation_id = Some("c8".into());
        let ctx = asm.assemble(&p).await;
        assert_eq!(ctx.rendered, "1. budget");
        assert!(social.searches().is_empty());
    }
}
