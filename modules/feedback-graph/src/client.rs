use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use neo4rs::{query, BoltType, ConfigBuilder, Graph, Query, Row};
use serde_json::Value;
use tracing::{debug, info, warn};

use feedback_common::{ConsistencyDomain, GraphEndpoint, GraphNode, NodeRef, NodeType, StorageError};

use crate::store::{check_label, AddOutcome, GraphStore, Record};

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin wrapper around neo4rs::Graph bound to one consistency domain.
///
/// The connection pool is released when the last clone is dropped.
#[derive(Clone)]
pub struct GraphClient {
    pub(crate) graph: Graph,
    domain: ConsistencyDomain,
    database: String,
    timeout: Duration,
}

impl GraphClient {
    /// Connect to the Neo4j instance serving `domain`.
    pub async fn connect(endpoint: &GraphEndpoint, domain: ConsistencyDomain) -> Result<Self, StorageError> {
        let config = ConfigBuilder::default()
            .uri(endpoint.uri.as_str())
            .user(endpoint.user.as_str())
            .password(endpoint.password.as_str())
            .db(endpoint.database.as_str())
            .fetch_size(500)
            .max_connections(10)
            .build()
            .map_err(|e| StorageError::Config(format!("invalid {domain} graph config: {e}")))?;
        let graph = Graph::connect(config).await.map_err(classify)?;
        info!(%domain, uri = endpoint.uri.as_str(), database = endpoint.database.as_str(), "Connected to graph");
        Ok(Self {
            graph,
            domain,
            database: endpoint.database.clone(),
            timeout: DEFAULT_QUERY_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get a reference to the underlying neo4rs Graph.
    pub fn inner(&self) -> &Graph {
        &self.graph
    }

    /// Run a query and collect every row, bounded by the client timeout.
    pub(crate) async fn fetch_rows(&self, q: Query) -> Result<Vec<Row>, StorageError> {
        self.bounded(async {
            let mut stream = self.graph.execute(q).await?;
            let mut rows = Vec::new();
            while let Some(row) = stream.next().await? {
                rows.push(row);
            }
            Ok(rows)
        })
        .await
    }

    pub(crate) async fn run(&self, q: Query) -> Result<(), StorageError> {
        self.bounded(self.graph.run(q)).await
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, neo4rs::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(StorageError::TransientBackend(format!(
                "{} graph query timed out after {:?}",
                self.domain, self.timeout
            ))),
        }
    }

    /// Single-row aggregate. No row reads as zero; an undecodable value is
    /// an error, never a silent zero.
    async fn first_count(&self, q: Query, column: &str) -> Result<i64, StorageError> {
        let rows = self.fetch_rows(q).await?;
        match rows.first() {
            Some(row) => row.get::<i64>(column).map_err(|e| column_error(column, e)),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl GraphStore for GraphClient {
    fn domain(&self) -> ConsistencyDomain {
        self.domain
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn get_node(&self, id: &str, expected: NodeType) -> Result<GraphNode, StorageError> {
        let q = query(&format!(
            "MATCH (n:{} {{id: $id}})
             RETURN labels(n) AS labels, properties(n) AS props",
            expected.label()
        ))
        .param("id", id);

        let rows = self.fetch_rows(q).await?;
        if let Some(row) = rows.first() {
            return node_from_row(row, Some(expected));
        }

        // Miss under the expected label: an unlabelled lookup tells a node of
        // another type apart from an absent one.
        let q = query(
            "MATCH (n) WHERE n.id = $id
             RETURN labels(n) AS labels, properties(n) AS props
             LIMIT 1",
        )
        .param("id", id);
        let rows = self.fetch_rows(q).await?;
        let row = rows.first().ok_or_else(|| StorageError::not_found(id))?;
        node_from_row(row, Some(expected))
    }

    async fn get_all_nodes_by_type(&self, node_type: NodeType) -> Result<Vec<GraphNode>, StorageError> {
        let q = query(&format!(
            "MATCH (n:{}) RETURN labels(n) AS labels, properties(n) AS props",
            node_type.label()
        ));

        let rows = self.fetch_rows(q).await?;
        let nodes = rows
            .iter()
            .map(|row| node_from_row(row, Some(node_type)))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(%node_type, count = nodes.len(), "Loaded nodes by type");
        Ok(nodes)
    }

    async fn node_exists(&self, node: &NodeRef) -> Result<bool, StorageError> {
        let q = query(&format!(
            "MATCH (n:{} {{id: $id}}) RETURN count(n) AS found",
            node.node_type.label()
        ))
        .param("id", node.id.as_str());
        Ok(self.first_count(q, "found").await? > 0)
    }

    async fn add_node(&self, node: &GraphNode, skip_if_exists: bool) -> Result<AddOutcome, StorageError> {
        let props = json_map_to_bolt(node.to_properties()?);
        let label = node.node_type().label();

        if !skip_if_exists {
            let q = query(&format!("CREATE (n:{label}) SET n = $props")).param("props", props);
            self.run(q).await?;
            debug!(id = node.id(), label, "Created node");
            return Ok(AddOutcome::Created);
        }

        // The marker property distinguishes a fresh create from a merge onto
        // an existing node in one round trip.
        let q = query(&format!(
            "MERGE (n:{label} {{id: $id}})
             ON CREATE SET n += $props, n._created = true
             WITH n, coalesce(n._created, false) AS created
             REMOVE n._created
             RETURN created"
        ))
        .param("id", node.id())
        .param("props", props);

        let rows = self.fetch_rows(q).await?;
        let row = rows
            .first()
            .ok_or_else(|| StorageError::Serialization(format!("MERGE of {} returned no row", node.id())))?;
        let created = row.get::<bool>("created").map_err(|e| column_error("created", e))?;

        if created {
            debug!(id = node.id(), label, "Created node");
            Ok(AddOutcome::Created)
        } else {
            debug!(id = node.id(), label, "Node already exists, skipped");
            Ok(AddOutcome::AlreadyExists)
        }
    }

    async fn delete_node(&self, node: &NodeRef) -> Result<(), StorageError> {
        let q = query(&format!(
            "MATCH (n:{} {{id: $id}}) DETACH DELETE n",
            node.node_type.label()
        ))
        .param("id", node.id.as_str());
        self.run(q).await?;
        debug!(id = node.id.as_str(), "Deleted node");
        Ok(())
    }

    async fn update_node(&self, node: &GraphNode) -> Result<(), StorageError> {
        let props = json_map_to_bolt(node.to_properties()?);
        let q = query(&format!(
            "MATCH (n:{} {{id: $id}}) SET n = $props RETURN count(n) AS updated",
            node.node_type().label()
        ))
        .param("id", node.id())
        .param("props", props);

        if self.first_count(q, "updated").await? == 0 {
            return Err(StorageError::not_found(node.id()));
        }
        debug!(id = node.id(), "Updated node");
        Ok(())
    }

    async fn add_edge(&self, from: &NodeRef, to: &NodeRef, label: &str) -> Result<(), StorageError> {
        check_label(label)?;
        let q = query(&format!(
            "MATCH (a:{} {{id: $from}})
             MATCH (b:{} {{id: $to}})
             CREATE (a)-[:{label}]->(b)
             RETURN count(*) AS created",
            from.node_type.label(),
            to.node_type.label()
        ))
        .param("from", from.id.as_str())
        .param("to", to.id.as_str());

        if self.first_count(q, "created").await? == 0 {
            return Err(StorageError::NotFound {
                id: format!("{} -[{label}]-> {}", from.id, to.id),
            });
        }
        Ok(())
    }

    async fn edge_exists(&self, from: &NodeRef, to: &NodeRef, label: &str) -> Result<bool, StorageError> {
        check_label(label)?;
        let q = query(&format!(
            "MATCH (a:{} {{id: $from}})-[r:{label}]->(b:{} {{id: $to}})
             RETURN count(r) AS found",
            from.node_type.label(),
            to.node_type.label()
        ))
        .param("from", from.id.as_str())
        .param("to", to.id.as_str());

        Ok(self.first_count(q, "found").await? > 0)
    }

    async fn traverse(&self, node: &NodeRef, label: &str) -> Result<Vec<GraphNode>, StorageError> {
        check_label(label)?;
        let q = query(&format!(
            "MATCH (a:{} {{id: $id}})-[:{label}]->(b)
             RETURN labels(b) AS labels, properties(b) AS props",
            node.node_type.label()
        ))
        .param("id", node.id.as_str());

        let rows = self.fetch_rows(q).await?;
        rows.iter().map(|row| node_from_row(row, None)).collect()
    }

    async fn run_raw_query(&self, raw: &str) -> Result<Vec<Record>, StorageError> {
        let rows = self.fetch_rows(query(raw)).await?;
        rows.iter()
            .map(|row| {
                row.to::<Record>()
                    .map_err(|e| StorageError::Serialization(format!("raw query row: {e}")))
            })
            .collect()
    }

    async fn reset_graph(&self, confirm_database: &str) -> Result<(), StorageError> {
        if confirm_database != self.database {
            return Err(StorageError::Config(format!(
                "refusing to reset {} graph: confirmation '{confirm_database}' does not match database '{}'",
                self.domain, self.database
            )));
        }
        self.run(query("MATCH (n) DETACH DELETE n")).await?;
        warn!(domain = %self.domain, database = self.database.as_str(), "Graph reset, all nodes deleted");
        Ok(())
    }
}

/// Connection and IO failures may succeed on retry. Everything else is a
/// query the backend rejected.
fn classify(err: neo4rs::Error) -> StorageError {
    match err {
        neo4rs::Error::IOError { .. } | neo4rs::Error::ConnectionError { .. } => {
            StorageError::TransientBackend(err.to_string())
        }
        other => {
            let message = other.to_string();
            if message.contains("TransientError") {
                StorageError::TransientBackend(message)
            } else {
                StorageError::Query(message)
            }
        }
    }
}

fn column_error(column: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Serialization(format!("column '{column}': {err}"))
}

fn node_from_row(row: &Row, expected: Option<NodeType>) -> Result<GraphNode, StorageError> {
    let labels: Vec<String> = row.get("labels").map_err(|e| column_error("labels", e))?;
    let props: Value = row.get("props").map_err(|e| column_error("props", e))?;

    // Nodes carry exactly one schema label; fall back to the first for errors.
    let label = labels
        .iter()
        .find(|l| NodeType::from_label(l).is_some())
        .or_else(|| labels.first())
        .cloned()
        .unwrap_or_default();

    match expected {
        Some(node_type) => GraphNode::decode_as(node_type, &label, props),
        None => GraphNode::decode(&label, props),
    }
}

fn json_map_to_bolt(map: serde_json::Map<String, Value>) -> BoltType {
    BoltType::Map(neo4rs::BoltMap::from_iter(map.into_iter().filter_map(|(key, value)| {
        json_to_bolt(value).map(|v| (neo4rs::BoltString::from(key.as_str()), v))
    })))
}

/// Null has no property representation; nulls are dropped.
fn json_to_bolt(value: Value) -> Option<BoltType> {
    Some(match value {
        Value::Null => return None,
        Value::Bool(b) => BoltType::Boolean(neo4rs::BoltBoolean::new(b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => BoltType::Integer(neo4rs::BoltInteger::new(i)),
            None => BoltType::Float(neo4rs::BoltFloat::new(n.as_f64().unwrap_or_default())),
        },
        Value::String(s) => BoltType::String(neo4rs::BoltString::from(s.as_str())),
        Value::Array(items) => BoltType::from(items.into_iter().filter_map(json_to_bolt).collect::<Vec<BoltType>>()),
        Value::Object(map) => json_map_to_bolt(map),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_stay_integers_and_floats_stay_floats() {
        assert!(matches!(json_to_bolt(serde_json::json!(1_690_000_000)), Some(BoltType::Integer(_))));
        assert!(matches!(json_to_bolt(serde_json::json!(4.5)), Some(BoltType::Float(_))));
        assert!(matches!(json_to_bolt(serde_json::json!("yelp")), Some(BoltType::String(_))));
        assert!(json_to_bolt(Value::Null).is_none());
    }

    #[test]
    fn undecodable_columns_are_serialization_errors() {
        let err = column_error("created", "expected Boolean, found String");
        assert!(matches!(&err, StorageError::Serialization(m) if m.contains("'created'")));
        assert!(!err.is_transient());
    }

    #[test]
    fn nulls_are_dropped_from_property_maps() {
        let mut map = serde_json::Map::new();
        map.insert("id".into(), serde_json::json!("Topic_1"));
        map.insert("name".into(), Value::Null);

        match json_map_to_bolt(map) {
            BoltType::Map(bolt) => assert!(!format!("{bolt:?}").contains("name")),
            other => panic!("expected map, got {other:?}"),
        }
    }
}
