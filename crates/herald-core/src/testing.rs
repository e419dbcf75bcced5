//! Hand-written fakes for the ports, shared by the unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::{
    clock::{FixedRandom, ManualClock},
    domain::{Platform, Post},
    engine::Services,
    generation::{port::Generator, types::GenerationRequest},
    social::{
        port::SocialClient,
        types::{PublishedPost, SearchRequest},
    },
    store::memory::MemoryStore,
    utils::cmp_ids,
    Error, Result,
};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 10, 12, 0, 0).unwrap()
}

pub const LONG_AI_TEXT: &str =
    "Scaling laws keep surprising us: the next AI model will reason better than most benchmarks can measure.";

pub fn post(id: &str, handle: &str, text: &str, created_at: DateTime<Utc>) -> Post {
    Post {
        id: id.to_string(),
        text: text.to_string(),
        created_at,
        author_id: format!("uid-{handle}"),
        author_handle: Some(handle.to_string()),
        reply_to_id: None,
        conversation_id: None,
    }
}

/// Fakes plus a fresh memory store, a clock pinned at [`t0`] and a draw of 0.0.
pub fn services(social: Arc<FakeSocial>, generator: Arc<FakeGenerator>) -> Services {
    let store = Arc::new(MemoryStore::new());
    Services {
        social,
        generator,
        usage: store.clone(),
        interactions: store.clone(),
        conversations: store,
        clock: Arc::new(ManualClock::new(t0())),
        rng: Arc::new(FixedRandom(0.0)),
    }
}

#[derive(Default)]
pub struct FakeSocial {
    responses: Mutex<Vec<(String, Vec<Post>)>>,
    lookups: Mutex<HashMap<String, Post>>,
    searches: Mutex<Vec<SearchRequest>>,
    lookup_calls: AtomicUsize,
    posts: Mutex<Vec<(String, Option<String>)>>,
    fail_search: AtomicBool,
    fail_post: AtomicBool,
    next_id: AtomicUsize,
}

impl FakeSocial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries starting with `prefix` return `posts` (filtered by `since_id`).
    /// Registering the same prefix again replaces its posts.
    pub fn on_search(&self, prefix: &str, posts: Vec<Post>) {
        let mut responses = self.responses.lock().unwrap();
        match responses.iter_mut().find(|(p, _)| p == prefix) {
            Some(entry) => entry.1 = posts,
            None => responses.push((prefix.to_string(), posts)),
        }
    }

    pub fn on_lookup(&self, post: Post) {
        self.lookups.lock().unwrap().insert(post.id.clone(), post);
    }

    pub fn fail_searches(&self) {
        self.fail_search.store(true, Ordering::SeqCst);
    }

    pub fn fail_posts(&self) {
        self.fail_post.store(true, Ordering::SeqCst);
    }

    pub fn searches(&self) -> Vec<SearchRequest> {
        self.searches.lock().unwrap().clone()
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    pub fn posted(&self) -> Vec<(String, Option<String>)> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SocialClient for FakeSocial {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    async fn search(&self, req: SearchRequest) -> Result<Vec<Post>> {
        self.searches.lock().unwrap().push(req.clone());
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(Error::Transport("search unavailable".into()));
        }
        let responses = self.responses.lock().unwrap();
        let Some((_, posts)) = responses.iter().find(|(p, _)| req.query.starts_with(p)) else {
            return Ok(Vec::new());
        };
        Ok(posts
            .iter()
            .filter(|p| match &req.since_id {
                Some(since) => cmp_ids(&p.id, since) == std::cmp::Ordering::Greater,
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn get_post(&self, id: &str) -> Result<Option<Post>> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.lookups.lock().unwrap().get(id).cloned())
    }

    async fn post(&self, text: &str, reply_to_id: Option<&str>) -> Result<PublishedPost> {
        if self.fail_post.load(Ordering::SeqCst) {
            return Err(Error::Transport("post rejected".into()));
        }
        self.posts
            .lock()
            .unwrap()
            .push((text.to_string(), reply_to_id.map(str::to_string)));
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PublishedPost {
            id: format!("reply-{n}"),
        })
    }
}

pub struct FakeGenerator {
    reply: Mutex<std::result::Result<String, String>>,
    requests: Mutex<Vec<GenerationRequest>>,
    delay: Duration,
}

impl FakeGenerator {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Mutex::new(Ok(text.to_string())),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(msg: &str) -> Self {
        Self {
            reply: Mutex::new(Err(msg.to_string())),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Sleep (tokio time) before answering.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(&self, req: GenerationRequest) -> Result<String> {
        self.requests.lock().unwrap().push(req);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply
            .lock()
            .unwrap()
            .clone()
            .map_err(Error::Generation)
    }
}
