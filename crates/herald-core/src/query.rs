//! Batched search queries.
//!
//! One search per batch per tick, never one per account: this is what keeps the
//! read budget proportional to the number of batches.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    admission::AdmissionControl,
    domain::{OpKind, Post, TargetAccount},
    scheduler::Batch,
    social::{port::SocialClient, types::SearchRequest},
    Error, Result,
};

/// `(from:a OR from:b) -is:retweet`
pub fn build_query<S: AsRef<str>>(handles: &[S]) -> String {
    let parts = handles
        .iter()
        .map(|h| format!("from:{}", h.as_ref()))
        .collect::<Vec<_>>()
        .join(" OR ");
    format!("({parts}) -is:retweet")
}

pub struct Fetcher {
    social: Arc<dyn SocialClient>,
    admission: Arc<AdmissionControl>,
    max_results: u32,
}

impl Fetcher {
    pub fn new(
        social: Arc<dyn SocialClient>,
        admission: Arc<AdmissionControl>,
        max_results: u32,
    ) -> Self {
        Self {
            social,
            admission,
            max_results,
        }
    }

    /// Run the batch's combined search.
    ///
    /// Fails with `QuotaExceeded` before touching the network when today's read
    /// budget is spent; usage is only recorded after a successful call.
    pub async fn fetch(&self, batch: &Batch) -> Result<Vec<Post>> {
        let handles = batch.handles();
        if handles.is_empty() {
            return Ok(Vec::new());
        }

        let platform = self.social.platform();
        self.admission.admit(platform, OpKind::Read).await?;

        let query = build_query(&handles);
        debug!(batch = batch.index, %query, "searching");
        let posts = self
            .social
            .search(SearchRequest::new(query, self.max_results))
            .await
            .map_err(|e| match e {
                Error::Timeout { .. } | Error::Transport(_) => e,
                other => Error::Transport(other.to_string()),
            })?;
        self.admission.record_usage(platform, OpKind::Read, 1).await;

        Ok(posts)
    }
}

/// Best-effort attribution of a fetched post to one of the batch's accounts.
///
/// Posts carry an opaque author id; the adapter may also expand the author's
/// handle. Either is compared case-insensitively against the batch handles.
/// This is approximate: an id never equals a handle unless the platform uses
/// handles as ids, so attribution mostly relies on expanded handles. Unmatched
/// posts get a placeholder account in the batch's category.
pub fn attribute(post: &Post, accounts: &[TargetAccount], category: &str) -> TargetAccount {
    let candidates = [post.author_handle.as_deref(), Some(post.author_id.as_str())];
    for cand in candidates.into_iter().flatten() {
        if let Some(acc) = accounts
            .iter()
            .find(|a| a.handle.eq_ignore_ascii_case(cand))
        {
            return acc.clone();
        }
    }

    warn!(
        post_id = %post.id,
        author_id = %post.author_id,
        category,
        "could not attribute post to a monitored account"
    );
    TargetAccount {
        name: post
            .author_handle
            .clone()
            .unwrap_or_else(|| post.author_id.clone()),
        handle: post
            .author_handle
            .clone()
            .unwrap_or_else(|| post.author_id.clone()),
        category: category.to_string(),
        notes: String::new(),
        valid: true,
    }
}
