use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    domain::{Platform, Post},
    social::{
        port::SocialClient,
        types::{PublishedPost, SearchRequest},
    },
    utils::bounded,
    Result,
};

/// SocialClient decorator that puts a deadline on every call.
///
/// A hung request surfaces as `Error::Timeout` instead of stalling a batch forever.
pub struct BoundedSocial {
    inner: Arc<dyn SocialClient>,
    timeout: Duration,
}

impl BoundedSocial {
    pub fn new(inner: Arc<dyn SocialClient>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl SocialClient for BoundedSocial {
    fn platform(&self) -> Platform {
        self.inner.platform()
    }

    async fn search(&self, req: SearchRequest) -> Result<Vec<Post>> {
        bounded(self.timeout, "social search", self.inner.search(req)).await
    }

    async fn get_post(&self, id: &str) -> Result<Option<Post>> {
        bounded(self.timeout, "social lookup", self.inner.get_post(id)).await
    }

    async fn post(&self, text: &str, reply_to_id: Option<&str>) -> Result<PublishedPost> {
        bounded(self.timeout, "social post", self.inner.post(text, reply_to_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    struct Hanging;

    #[async_trait]
    impl SocialClient for Hanging {
        fn platform(&self) -> Platform {
            Platform::Twitter
        }

        async fn search(&self, _req: SearchRequest) -> Result<Vec<Post>> {
            std::future::pending().await
        }

        async fn get_post(&self, _id: &str) -> Result<Option<Post>> {
            Ok(None)
        }

        async fn post(&self, _text: &str, _reply_to_id: Option<&str>) -> Result<PublishedPost> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_search_times_out() {
        let s = BoundedSocial::new(Arc::new(Hanging), Duration::from_secs(30));
        let err = s.search(SearchRequest::new("q", 10)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { secs: 30, .. }));
        assert_eq!(s.get_post("1").await.unwrap(), None);
    }
}
