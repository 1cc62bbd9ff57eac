use anyhow::Result;

/// Text to fixed-length vector. Implemented over an embedding service in
/// production and by deterministic fakes in tests.
#[async_trait::async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;
}
