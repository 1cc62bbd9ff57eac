use neo4rs::query;
use tracing::info;

use feedback_common::{NodeType, StorageError};

use crate::store::GraphStore;
use crate::GraphClient;

/// Run idempotent schema migrations: one `id` uniqueness constraint per node
/// label. The constraint is what makes concurrent `MERGE` of one id safe.
pub async fn migrate(client: &GraphClient) -> Result<(), StorageError> {
    info!(database = client.database(), "Running schema migrations...");

    for node_type in NodeType::ALL {
        client.run(query(&constraint_statement(node_type))).await?;
    }

    info!(count = NodeType::ALL.len(), "Uniqueness constraints ensured");
    Ok(())
}

fn constraint_statement(node_type: NodeType) -> String {
    format!(
        "CREATE CONSTRAINT {}_id_unique IF NOT EXISTS FOR (n:{}) REQUIRE n.id IS UNIQUE",
        node_type.subject(),
        node_type.label()
    )
}
