use async_trait::async_trait;

use crate::{generation::types::GenerationRequest, Result};

/// Port for the text-generation backend.
///
/// The output is unstructured text with no guarantees about length or shape.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, req: GenerationRequest) -> Result<String>;
}
