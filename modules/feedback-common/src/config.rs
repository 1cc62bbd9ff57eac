use std::env;

use tracing::info;

use crate::error::StorageError;
use crate::types::{ConsistencyDomain, Environment};

/// Connection settings for one graph instance.
#[derive(Debug, Clone)]
pub struct GraphEndpoint {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,

    // Neo4j, one instance per consistency domain
    pub eventual_graph: GraphEndpoint,
    pub strong_graph: GraphEndpoint,

    // Vector index
    pub pinecone_api_key: String,
    pub pinecone_index_host: String,

    // AI providers
    pub openai_api_key: String,
    pub embedding_model: String,
    pub topic_model: String,
}

impl Config {
    /// Load configuration from environment variables.
    /// Fails naming the first required variable that is missing.
    pub fn from_env() -> Result<Self, StorageError> {
        let environment = env::var("APP_ENV")
            .unwrap_or_else(|_| "test".to_string())
            .parse()?;

        Ok(Self {
            environment,
            eventual_graph: graph_endpoint(ConsistencyDomain::Eventual)?,
            strong_graph: graph_endpoint(ConsistencyDomain::Strong)?,
            pinecone_api_key: required_env("PINECONE_API_KEY")?,
            pinecone_index_host: required_env("PINECONE_INDEX_HOST")?,
            openai_api_key: required_env("OPENAI_API_KEY")?,
            embedding_model: env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            topic_model: env::var("TOPIC_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        })
    }

    pub fn graph(&self, domain: ConsistencyDomain) -> &GraphEndpoint {
        match domain {
            ConsistencyDomain::Eventual => &self.eventual_graph,
            ConsistencyDomain::Strong => &self.strong_graph,
        }
    }

    /// Log the loaded configuration with secrets masked.
    pub fn log_redacted(&self) {
        info!(
            environment = %self.environment,
            eventual_uri = self.eventual_graph.uri.as_str(),
            eventual_db = self.eventual_graph.database.as_str(),
            eventual_password = redact(&self.eventual_graph.password),
            strong_uri = self.strong_graph.uri.as_str(),
            strong_db = self.strong_graph.database.as_str(),
            strong_password = redact(&self.strong_graph.password),
            pinecone_index_host = self.pinecone_index_host.as_str(),
            pinecone_api_key = redact(&self.pinecone_api_key),
            openai_api_key = redact(&self.openai_api_key),
            embedding_model = self.embedding_model.as_str(),
            topic_model = self.topic_model.as_str(),
            "Loaded configuration"
        );
    }
}

fn graph_endpoint(domain: ConsistencyDomain) -> Result<GraphEndpoint, StorageError> {
    let prefix = match domain {
        ConsistencyDomain::Eventual => "NEO4J_EVENTUAL",
        ConsistencyDomain::Strong => "NEO4J_STRONG",
    };
    Ok(GraphEndpoint {
        uri: required_env(&format!("{prefix}_URI"))?,
        user: required_env(&format!("{prefix}_USER"))?,
        password: required_env(&format!("{prefix}_PASSWORD"))?,
        database: required_env(&format!("{prefix}_DB"))?,
    })
}

fn required_env(key: &str) -> Result<String, StorageError> {
    env::var(key).map_err(|_| StorageError::Config(format!("{key} environment variable is required")))
}

/// Keep the last four characters so operators can tell keys apart.
fn redact(secret: &str) -> String {
    let visible: String = secret
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("****{visible}")
    }
}
