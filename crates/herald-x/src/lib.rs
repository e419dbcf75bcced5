//! X (Twitter) API v2 adapter for the `SocialClient` port.
//!
//! Reads (recent search, tweet lookup) use the app bearer token; creating
//! tweets uses the user-context token.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::{
    domain::{Platform, Post},
    social::{
        port::SocialClient,
        types::{PublishedPost, SearchRequest},
    },
    Error, Result,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const TWEET_FIELDS: &str = "created_at,author_id,conversation_id,referenced_tweets";
const MIN_RESULTS: u32 = 10;
const MAX_RESULTS: u32 = 100;

#[derive(Clone, Debug)]
pub struct XConfig {
    pub api_base: String,
    pub bearer_token: String,
    pub user_token: String,
}

#[derive(Clone, Debug)]
pub struct XClient {
    cfg: XConfig,
    http: reqwest::Client,
}

impl XClient {
    pub fn new(cfg: XConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("herald/0.1")
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(Self { cfg, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.cfg.api_base.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl SocialClient for XClient {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    async fn search(&self, req: SearchRequest) -> Result<Vec<Post>> {
        let max = req.max_results.clamp(MIN_RESULTS, MAX_RESULTS).to_string();
        let mut params = vec![
            ("query", req.query.as_str()),
            ("max_results", max.as_str()),
            ("tweet.fields", TWEET_FIELDS),
            ("expansions", "author_id"),
            ("user.fields", "username"),
        ];
        if let Some(since) = &req.since_id {
            params.push(("since_id", since.as_str()));
        }

        let resp = self
            .http
            .get(self.url("tweets/search/recent"))
            .bearer_auth(&self.cfg.bearer_token)
            .query(&params)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("x search request: {e}")))?;
        let resp = check(resp, "search").await?;
        let body: SearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Transport(format!("x search body: {e}")))?;

        let posts = body.into_posts();
        debug!(query = %req.query, count = posts.len(), "x search");
        Ok(posts)
    }

    async fn get_post(&self, id: &str) -> Result<Option<Post>> {
        let resp = self
            .http
            .get(self.url(&format!("tweets/{id}")))
            .bearer_auth(&self.cfg.bearer_token)
            .query(&[
                ("tweet.fields", TWEET_FIELDS),
                ("expansions", "author_id"),
                ("user.fields", "username"),
            ])
            .send()
            .await
            .map_err(|e| Error::Transport(format!("x lookup request: {e}")))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check(resp, "lookup").await?;
        let body: LookupResponse = resp
            .json()
            .await
            .map_err(|e| Error::Transport(format!("x lookup body: {e}")))?;
        Ok(body.into_post())
    }

    async fn post(&self, text: &str, reply_to_id: Option<&str>) -> Result<PublishedPost> {
        let req = CreateTweetRequest {
            text,
            reply: reply_to_id.map(|id| CreateTweetReply {
                in_reply_to_tweet_id: id,
            }),
        };
        let resp = self
            .http
            .post(self.url("tweets"))
            .bearer_auth(&self.cfg.user_token)
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("x create request: {e}")))?;
        let resp = check(resp, "create tweet").await?;
        let body: CreateTweetResponse = resp
            .json()
            .await
            .map_err(|e| Error::Transport(format!("x create body: {e}")))?;
        Ok(PublishedPost { id: body.data.id })
    }
}

async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let body: String = body.chars().take(200).collect();
    if status == StatusCode::TOO_MANY_REQUESTS {
        warn!(what, "x api rate limited");
        return Err(Error::Transport(format!("x {what} rate limited (429)")));
    }
    Err(Error::Transport(format!("x {what} failed: {status} {body}")))
}

// ============== Wire types ==============

#[derive(Serialize)]
struct CreateTweetRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply: Option<CreateTweetReply<'a>>,
}

#[derive(Serialize)]
struct CreateTweetReply<'a> {
    in_reply_to_tweet_id: &'a str,
}

#[derive(Deserialize)]
struct CreateTweetResponse {
    data: CreatedTweet,
}

#[derive(Deserialize)]
struct CreatedTweet {
    id: String,
}

#[derive(Deserialize, Default)]
struct Includes {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Deserialize)]
struct User {
    id: String,
    username: String,
}

#[derive(Deserialize)]
struct ReferencedTweet {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

#[derive(Deserialize)]
struct Tweet {
    id: String,
    text: String,
    created_at: Option<DateTime<Utc>>,
    author_id: Option<String>,
    conversation_id: Option<String>,
    #[serde(default)]
    referenced_tweets: Vec<ReferencedTweet>,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Tweet>,
    #[serde(default)]
    includes: Includes,
}

#[derive(Deserialize)]
struct LookupResponse {
    data: Option<Tweet>,
    #[serde(default)]
    includes: Includes,
}

impl Includes {
    fn usernames(&self) -> HashMap<&str, &str> {
        self.users
            .iter()
            .map(|u| (u.id.as_str(), u.username.as_str()))
            .collect()
    }
}

impl Tweet {
    /// `None` without a creation time: the age filter cannot judge it.
    fn into_post(self, users: &HashMap<&str, &str>) -> Option<Post> {
        let Some(created_at) = self.created_at else {
            warn!(id = %self.id, "tweet without created_at; dropping");
            return None;
        };
        let author_id = self.author_id.unwrap_or_default();
        let author_handle = users.get(author_id.as_str()).map(|s| s.to_string());
        let reply_to_id = self
            .referenced_tweets
            .into_iter()
            .find(|r| r.kind == "replied_to")
            .map(|r| r.id);
        Some(Post {
            id: self.id,
            text: self.text,
            created_at,
            author_id,
            author_handle,
            reply_to_id,
            conversation_id: self.conversation_id,
        })
    }
}

impl SearchResponse {
    fn into_posts(self) -> Vec<Post> {
        let users = self.includes.usernames();
        self.data
            .into_iter()
            .filter_map(|t| t.into_post(&users))
            .collect()
    }
}

impl LookupResponse {
    fn into_post(self) -> Option<Post> {
        let users = self.includes.usernames();
        self.data.and_then(|t| t.into_post(&users))
    }
}
