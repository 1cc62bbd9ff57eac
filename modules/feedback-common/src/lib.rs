pub mod types;
pub mod edges;
pub mod config;
pub mod error;
pub mod embedder;

pub use types::*;
pub use edges::EdgeSchema;
pub use config::{Config, GraphEndpoint};
pub use error::StorageError;
pub use embedder::TextEmbedder;
