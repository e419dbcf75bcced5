use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    generation::{port::Generator, types::GenerationRequest},
    utils::bounded,
    Result,
};

/// Generator decorator with a per-call deadline.
pub struct BoundedGenerator {
    inner: Arc<dyn Generator>,
    timeout: Duration,
}

impl BoundedGenerator {
    pub fn new(inner: Arc<dyn Generator>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl Generator for BoundedGenerator {
    async fn generate(&self, req: GenerationRequest) -> Result<String> {
        bounded(self.timeout, "generation", self.inner.generate(req)).await
    }
}
