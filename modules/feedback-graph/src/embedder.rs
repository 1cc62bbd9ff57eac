use ai_client::OpenAi;
use anyhow::Result;

pub use feedback_common::TextEmbedder;

/// OpenAI embeddings behind the [`TextEmbedder`] seam.
pub struct Embedder {
    client: OpenAi,
}

impl Embedder {
    pub fn new(api_key: &str, model: &str) -> Self {
        let client = OpenAi::new(api_key, model).with_embedding_model(model);
        Self { client }
    }

    pub fn model(&self) -> &str {
        self.client.embedding_model()
    }
}

#[async_trait::async_trait]
impl TextEmbedder for Embedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.client.embed(text).await?)
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(self.client.embed_batch(&texts).await?)
    }
}
