//! Content filter and the probabilistic response gate.
//!
//! Each fetched post walks a small state machine:
//!
//! ```text
//! New -> AlreadyProcessed
//!     -> Candidate -> FilteredOut              (terminal, recorded with a reason)
//!                  -> Eligible -> Skipped      (not recorded, reconsidered next poll)
//!                              -> Selected -> Responded
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::{clock::RandomSource, config::Policy, domain::Post, Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostState {
    New,
    AlreadyProcessed,
    Candidate,
    FilteredOut,
    Eligible,
    Skipped,
    Selected,
    Responded,
}

impl PostState {
    pub fn as_str(self) -> &'static str {
        match self {
            PostState::New => "new",
            PostState::AlreadyProcessed => "already_processed",
            PostState::Candidate => "candidate",
            PostState::FilteredOut => "filtered_out",
            PostState::Eligible => "eligible",
            PostState::Skipped => "skipped",
            PostState::Selected => "selected",
            PostState::Responded => "responded",
        }
    }

    /// Whether the ledger holds a final answer for the post in this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PostState::AlreadyProcessed | PostState::FilteredOut | PostState::Responded
        )
    }
}

impl fmt::Display for PostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterReason {
    TooOld,
    TooShort,
    EmptyText,
    TooManyUrls,
    TooManyMentions,
}

impl FilterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterReason::TooOld => "too_old",
            FilterReason::TooShort => "too_short",
            FilterReason::EmptyText => "empty_text",
            FilterReason::TooManyUrls => "too_many_urls",
            FilterReason::TooManyMentions => "too_many_mentions",
        }
    }
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of running a candidate through the filter chain and the gate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Verdict {
    Filtered(FilterReason),
    Skipped { probability: f64, draw: f64 },
    Selected { probability: f64, relevant: bool },
}

impl Verdict {
    pub fn state(&self) -> PostState {
        match self {
            Verdict::Filtered(_) => PostState::FilteredOut,
            Verdict::Skipped { .. } => PostState::Skipped,
            Verdict::Selected { .. } => PostState::Selected,
        }
    }
}

/// Substrings that mark a post as on-topic (AI, tech, philosophy).
pub const KEYWORDS: &[&str] = &[
    "artificial intelligence",
    "machine learning",
    "deep learning",
    "neural net",
    "language model",
    "llm",
    "gpt",
    "openai",
    "anthropic",
    "deepmind",
    "transformer",
    "alignment",
    "superintelligence",
    "singularity",
    "robot",
    "automation",
    "algorithm",
    "compute",
    "benchmark",
    "reasoning",
    "startup",
    "software",
    "technology",
    "innovation",
    "consciousness",
    "philosophy",
    "ethics",
    "future of",
];

/// Short tokens matched as whole words only.
const KEYWORD_TOKENS: &[&str] = &["ai", "agi", "ml", "a.i."];

pub fn is_relevant(text: &str) -> bool {
    let lower = text.to_lowercase();
    if KEYWORDS.iter().any(|k| lower.contains(k)) {
        return true;
    }
    lower
        .split(|c: char| !(c.is_alphanumeric() || c == '.'))
        .map(|w| w.trim_end_matches('.'))
        .any(|w| KEYWORD_TOKENS.iter().any(|t| t.trim_end_matches('.') == w))
}

/// Response probability by category name, with and without keyword relevance.
pub fn response_probability(category: &str, relevant: bool) -> f64 {
    let c = category.to_lowercase();
    let (hit, miss) = if c.contains("ai research") || c.contains("ai acceleration") {
        (0.8, 0.4)
    } else if c.contains("vc") || c.contains("tech ceo") {
        (0.6, 0.2)
    } else if c.contains("ethics") || c.contains("safety") {
        (0.4, 0.1)
    } else {
        (0.3, 0.05)
    };
    if relevant {
        hit
    } else {
        miss
    }
}

pub struct ContentFilter {
    max_age: chrono::Duration,
    min_text_len: usize,
    max_urls: usize,
    max_mentions: usize,
    url_re: Regex,
    mention_re: Regex,
}

impl ContentFilter {
    pub fn new(policy: &Policy) -> Result<Self> {
        let url_re = Regex::new(r"https?://\S+")
            .map_err(|e| Error::Config(format!("url pattern: {e}")))?;
        let mention_re = Regex::new(r"@[A-Za-z0-9_]+")
            .map_err(|e| Error::Config(format!("mention pattern: {e}")))?;
        Ok(Self {
            max_age: policy.max_post_age,
            min_text_len: policy.min_text_len,
            max_urls: policy.max_urls,
            max_mentions: policy.max_mentions,
            url_re,
            mention_re,
        })
    }

    fn too_old(&self, post: &Post, now: DateTime<Utc>) -> bool {
        now - post.created_at > self.max_age
    }

    /// Filter chain for target posts. Short-circuits on the first failure.
    pub fn check(&self, post: &Post, now: DateTime<Utc>) -> std::result::Result<(), FilterReason> {
        if self.too_old(post, now) {
            return Err(FilterReason::TooOld);
        }
        if post.text.chars().count() < self.min_text_len {
            return Err(FilterReason::TooShort);
        }
        if self.url_re.find_iter(&post.text).count() > self.max_urls {
            return Err(FilterReason::TooManyUrls);
        }
        if self.mention_re.find_iter(&post.text).count() > self.max_mentions {
            return Err(FilterReason::TooManyMentions);
        }
        Ok(())
    }

    /// Looser chain for mentions of the bot: someone addressed us directly.
    pub fn check_mention(
        &self,
        post: &Post,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), FilterReason> {
        if self.too_old(post, now) {
            return Err(FilterReason::TooOld);
        }
        if self.strip_mentions(&post.text).is_empty() {
            return Err(FilterReason::EmptyText);
        }
        if self.url_re.find_iter(&post.text).count() > self.max_urls {
            return Err(FilterReason::TooManyUrls);
        }
        Ok(())
    }

    pub fn strip_mentions(&self, text: &str) -> String {
        self.mention_re.replace_all(text, "").trim().to_string()
    }

    /// Filter chain, then the category-weighted gate.
    pub fn decide(
        &self,
        post: &Post,
        category: &str,
        now: DateTime<Utc>,
        rng: &dyn RandomSource,
    ) -> Verdict {
        if let Err(reason) = self.check(post, now) {
            return Verdict::Filtered(reason);
        }

        let relevant = is_relevant(&post.text);
        let probability = response_probability(category, relevant);
        let draw = rng.uniform();
        if draw < probability {
            Verdict::Selected {
                probability,
                relevant,
            }
        } else {
            Verdict::Skipped { probability, draw }
        }
    }
}
