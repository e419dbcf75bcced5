/// Parameters of a single search call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub max_results: u32,
    /// Only return posts newer than this id.
    pub since_id: Option<String>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, max_results: u32) -> Self {
        Self {
            query: query.into(),
            max_results,
            since_id: None,
        }
    }

    pub fn since(mut self, since_id: Option<String>) -> Self {
        self.since_id = since_id;
        self
    }
}

/// Identifier of a post we published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedPost {
    pub id: String,
}
