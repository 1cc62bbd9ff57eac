use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use pinecone_client::{PineconeClient, PineconeError, Vector};
use tracing::debug;

use feedback_common::{Environment, NodeType, StorageError};

/// Partition of the vector index for one (environment, node type).
/// Only embeddable types have a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Namespace {
    environment: Environment,
    node_type: NodeType,
}

impl Namespace {
    pub fn new(environment: Environment, node_type: NodeType) -> Result<Self, StorageError> {
        if !node_type.is_embeddable() {
            return Err(StorageError::SchemaViolation(format!(
                "{node_type} is not embeddable and has no vector namespace"
            )));
        }
        Ok(Self {
            environment,
            node_type,
        })
    }

    /// Every namespace of one environment.
    pub fn all(environment: Environment) -> Vec<Namespace> {
        NodeType::ALL
            .into_iter()
            .filter(NodeType::is_embeddable)
            .map(|node_type| Namespace {
                environment,
                node_type,
            })
            .collect()
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }
}

/// `test-observations`, `prod-action-items`.
impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.environment,
            self.node_type.subject().replace('_', "-")
        )
    }
}

/// One nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
}

/// Namespaced embedding store keyed by node id.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, namespace: &Namespace, node_id: &str, vector: Vec<f32>) -> Result<(), StorageError>;

    /// Top `top_k` matches, best first.
    async fn query(&self, namespace: &Namespace, vector: &[f32], top_k: usize)
        -> Result<Vec<VectorMatch>, StorageError>;

    /// Stored vectors for `ids`; ids without a vector are absent from the map.
    async fn fetch(&self, namespace: &Namespace, ids: &[String]) -> Result<HashMap<String, Vec<f32>>, StorageError>;

    /// Remove the vectors for `ids`. Unknown ids are ignored.
    async fn delete(&self, namespace: &Namespace, ids: &[String]) -> Result<(), StorageError>;

    /// Environment reset only.
    async fn delete_namespace_contents(&self, namespace: &Namespace) -> Result<(), StorageError>;
}

/// Vector index backed by a Pinecone index.
pub struct PineconeIndex {
    client: PineconeClient,
}

impl PineconeIndex {
    pub fn new(client: PineconeClient) -> Self {
        Self { client }
    }

    pub fn connect(api_key: &str, host: &str) -> Result<Self, StorageError> {
        let client = PineconeClient::new(api_key.to_string(), host).map_err(vector_error)?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn upsert(&self, namespace: &Namespace, node_id: &str, vector: Vec<f32>) -> Result<(), StorageError> {
        let record = Vector {
            id: node_id.to_string(),
            values: vector,
        };
        self.client
            .upsert(&namespace.to_string(), std::slice::from_ref(&record))
            .await
            .map_err(vector_error)?;
        debug!(%namespace, node_id, "Upserted vector");
        Ok(())
    }

    async fn query(
        &self,
        namespace: &Namespace,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorMatch>, StorageError> {
        let matches = self
            .client
            .query(&namespace.to_string(), vector, top_k)
            .await
            .map_err(vector_error)?;
        Ok(matches
            .into_iter()
            .map(|m| VectorMatch {
                id: m.id,
                score: m.score,
            })
            .collect())
    }

    async fn fetch(&self, namespace: &Namespace, ids: &[String]) -> Result<HashMap<String, Vec<f32>>, StorageError> {
        let vectors = self
            .client
            .fetch(&namespace.to_string(), ids)
            .await
            .map_err(vector_error)?;
        Ok(vectors.into_iter().map(|v| (v.id, v.values)).collect())
    }

    async fn delete(&self, namespace: &Namespace, ids: &[String]) -> Result<(), StorageError> {
        self.client
            .delete(&namespace.to_string(), ids)
            .await
            .map_err(vector_error)?;
        debug!(%namespace, count = ids.len(), "Deleted vectors");
        Ok(())
    }

    async fn delete_namespace_contents(&self, namespace: &Namespace) -> Result<(), StorageError> {
        self.client
            .delete_all(&namespace.to_string())
            .await
            .map_err(vector_error)
    }
}

fn vector_error(err: PineconeError) -> StorageError {
    if err.is_transient() {
        StorageError::TransientBackend(format!("vector index: {err}"))
    } else {
        StorageError::Query(format!("vector index: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_names_join_environment_and_type() {
        let ns = Namespace::new(Environment::Test, NodeType::Observation).unwrap();
        assert_eq!(ns.to_string(), "test-observations");

        let ns = Namespace::new(Environment::Prod, NodeType::ActionItem).unwrap();
        assert_eq!(ns.to_string(), "prod-action-items");
    }

    #[test]
    fn non_embeddable_types_have_no_namespace() {
        for t in [NodeType::Review, NodeType::Score, NodeType::AppState] {
            let err = Namespace::new(Environment::Test, t).unwrap_err();
            assert!(matches!(err, StorageError::SchemaViolation(_)));
        }
        assert_eq!(Namespace::all(Environment::Test).len(), 4);
    }

    #[test]
    fn throttling_maps_to_transient() {
        let err = vector_error(PineconeError::Api {
            status: 429,
            message: "slow down".into(),
        });
        assert!(err.is_transient());

        let err = vector_error(PineconeError::Api {
            status: 400,
            message: "bad dimension".into(),
        });
        assert!(!err.is_transient());
    }
}
