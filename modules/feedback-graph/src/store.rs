use async_trait::async_trait;

use feedback_common::{ConsistencyDomain, GraphNode, NodeRef, NodeType, StorageError};

/// One row of a raw query result, column name to value.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Outcome of an idempotent create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Created,
    AlreadyExists,
}

/// CRUD and one-hop traversal against a single graph backend instance.
///
/// Implementations never retry. Retry policy belongs to the caller, which
/// knows which operations are safe to repeat.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// The consistency domain this instance serves.
    fn domain(&self) -> ConsistencyDomain;

    /// Name of the connected database, the confirmation for `reset_graph`.
    fn database(&self) -> &str;

    /// Fails with `NotFound` when no node has `id` and with `TypeMismatch`
    /// when the stored label is not `expected`.
    async fn get_node(&self, id: &str, expected: NodeType) -> Result<GraphNode, StorageError>;

    async fn get_all_nodes_by_type(&self, node_type: NodeType) -> Result<Vec<GraphNode>, StorageError>;

    async fn node_exists(&self, node: &NodeRef) -> Result<bool, StorageError>;

    /// With `skip_if_exists`, an existing id is a silent no-op and concurrent
    /// creates of one id yield a single node.
    async fn add_node(&self, node: &GraphNode, skip_if_exists: bool) -> Result<AddOutcome, StorageError>;

    /// Removes the node and every edge touching it. Unknown ids are a no-op.
    async fn delete_node(&self, node: &NodeRef) -> Result<(), StorageError>;

    /// Overwrites every field except `id`. Fails with `NotFound` if absent.
    async fn update_node(&self, node: &GraphNode) -> Result<(), StorageError>;

    /// Fails with `NotFound` when either endpoint is not visible yet.
    async fn add_edge(&self, from: &NodeRef, to: &NodeRef, label: &str) -> Result<(), StorageError>;

    async fn edge_exists(&self, from: &NodeRef, to: &NodeRef, label: &str) -> Result<bool, StorageError>;

    /// Outbound neighbours of `node` over edges labelled exactly `label`.
    async fn traverse(&self, node: &NodeRef, label: &str) -> Result<Vec<GraphNode>, StorageError>;

    /// Escape hatch for aggregation queries. Read paths only.
    async fn run_raw_query(&self, query: &str) -> Result<Vec<Record>, StorageError>;

    /// Delete every node in the connected database. `confirm_database` must
    /// equal the database name this instance is connected to.
    async fn reset_graph(&self, confirm_database: &str) -> Result<(), StorageError>;
}

/// Edge labels are interpolated into queries, so only schema-shaped labels
/// are accepted.
pub(crate) fn check_label(label: &str) -> Result<(), StorageError> {
    let valid = !label.is_empty() && label.chars().all(|c| c.is_ascii_lowercase() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::SchemaViolation(format!("invalid edge label '{label}'")))
    }
}
