use async_trait::async_trait;

use crate::{
    domain::{Platform, Post},
    social::types::{PublishedPost, SearchRequest},
    Result,
};

/// Port for the social platform client.
///
/// Implementations own auth, HTTP and pagination. Every method may fail; callers
/// catch failures per call and never abort a whole batch because of one.
#[async_trait]
pub trait SocialClient: Send + Sync {
    fn platform(&self) -> Platform;

    async fn search(&self, req: SearchRequest) -> Result<Vec<Post>>;

    /// Look up a single post (used to resolve its conversation id).
    async fn get_post(&self, id: &str) -> Result<Option<Post>>;

    async fn post(&self, text: &str, reply_to_id: Option<&str>) -> Result<PublishedPost>;
}
