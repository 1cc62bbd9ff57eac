use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::try_join_all;
use tracing::{debug, info, warn};

use feedback_common::{
    AppState, Config, ConsistencyDomain, EdgeSchema, Environment, FeedbackItem, GraphNode, NodeKind, NodeRef,
    NodeType, Observation, Review, Score, StorageError, TextEmbedder, Topic, APP_STATE_ID,
};

use crate::client::GraphClient;
use crate::embedder::Embedder;
use crate::migrate::migrate;
use crate::store::{AddOutcome, GraphStore, Record};
use crate::vector::{Namespace, PineconeIndex, VectorIndex};

/// Bounded retry for edge creation against the eventual domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOutcome {
    Created,
    AlreadyPresent,
}

/// An edge that could not be written after exhausting retries.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedEdge {
    pub from_id: String,
    pub to_id: String,
    pub label: &'static str,
    pub error: String,
}

/// Result of a `connect_nodes` call. Missing edges degrade connectivity but
/// never abort the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectReport {
    pub created: usize,
    pub already_present: usize,
    pub failed: Vec<FailedEdge>,
}

impl ConnectReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn merge(&mut self, other: ConnectReport) {
        self.created += other.created;
        self.already_present += other.already_present;
        self.failed.extend(other.failed);
    }
}

/// Parallel lists of matched nodes and their similarity, best first.
#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub nodes: Vec<GraphNode>,
    pub scores: Vec<f32>,
}

impl SearchResults {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GraphNode, f32)> {
        self.nodes.iter().zip(self.scores.iter().copied())
    }
}

/// Single entry point for graph and vector operations.
///
/// Owns one graph per consistency domain and the vector index. AppState is
/// routed to the strong domain, everything else to the eventual domain.
/// Connections are released when the façade is dropped.
pub struct Storage {
    eventual: Arc<dyn GraphStore>,
    strong: Arc<dyn GraphStore>,
    vectors: Arc<dyn VectorIndex>,
    embedder: Arc<dyn TextEmbedder>,
    environment: Environment,
    retry: RetryPolicy,
}

impl Storage {
    pub fn new(
        eventual: Arc<dyn GraphStore>,
        strong: Arc<dyn GraphStore>,
        vectors: Arc<dyn VectorIndex>,
        embedder: Arc<dyn TextEmbedder>,
        environment: Environment,
    ) -> Self {
        Self {
            eventual,
            strong,
            vectors,
            embedder,
            environment,
            retry: RetryPolicy::default(),
        }
    }

    /// Connect both graph domains, run migrations on each, then connect the
    /// vector index and the embedder.
    pub async fn connect(config: &Config) -> Result<Self, StorageError> {
        let eventual = GraphClient::connect(config.graph(ConsistencyDomain::Eventual), ConsistencyDomain::Eventual).await?;
        let strong = GraphClient::connect(config.graph(ConsistencyDomain::Strong), ConsistencyDomain::Strong).await?;
        migrate(&eventual).await?;
        migrate(&strong).await?;

        let vectors = PineconeIndex::connect(&config.pinecone_api_key, &config.pinecone_index_host)?;
        let embedder = Embedder::new(&config.openai_api_key, &config.embedding_model);

        Ok(Self::new(
            Arc::new(eventual),
            Arc::new(strong),
            Arc::new(vectors),
            Arc::new(embedder),
            config.environment,
        ))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    fn graph_for(&self, node_type: NodeType) -> &dyn GraphStore {
        match node_type.consistency_domain() {
            ConsistencyDomain::Strong => self.strong.as_ref(),
            ConsistencyDomain::Eventual => self.eventual.as_ref(),
        }
    }

    // --- Node CRUD ---

    pub async fn get_node(&self, id: &str, node_type: NodeType) -> Result<GraphNode, StorageError> {
        self.graph_for(node_type).get_node(id, node_type).await
    }

    /// Typed read: `storage.get::<Review>(id)`.
    pub async fn get<T: NodeKind>(&self, id: &str) -> Result<T, StorageError> {
        T::from_node(self.get_node(id, T::TYPE).await?)
    }

    pub async fn get_all_nodes_by_type(&self, node_type: NodeType) -> Result<Vec<GraphNode>, StorageError> {
        self.graph_for(node_type).get_all_nodes_by_type(node_type).await
    }

    pub async fn get_all<T: NodeKind>(&self) -> Result<Vec<T>, StorageError> {
        self.get_all_nodes_by_type(T::TYPE)
            .await?
            .into_iter()
            .map(T::from_node)
            .collect()
    }

    pub async fn node_exists(&self, id: &str, node_type: NodeType) -> Result<bool, StorageError> {
        self.graph_for(node_type).node_exists(&NodeRef::new(id, node_type)).await
    }

    /// Idempotent create. Re-adding an existing id is a silent no-op.
    pub async fn add_node(&self, node: impl Into<GraphNode>) -> Result<AddOutcome, StorageError> {
        let node = node.into();
        self.graph_for(node.node_type()).add_node(&node, true).await
    }

    pub async fn add_nodes(&self, nodes: Vec<GraphNode>) -> Result<Vec<AddOutcome>, StorageError> {
        let mut outcomes = Vec::with_capacity(nodes.len());
        for node in nodes {
            outcomes.push(self.add_node(node).await?);
        }
        Ok(outcomes)
    }

    pub async fn update_node(&self, node: impl Into<GraphNode>) -> Result<(), StorageError> {
        let node = node.into();
        self.graph_for(node.node_type()).update_node(&node).await
    }

    pub async fn delete_node(&self, node: &NodeRef) -> Result<(), StorageError> {
        self.graph_for(node.node_type).delete_node(node).await
    }

    // --- Edges ---

    /// Connect every `from` to every `to` in both directions, with labels
    /// from the edge schema. Every label is resolved before the first write,
    /// so an unregistered pair anywhere writes nothing.
    pub async fn connect_nodes(&self, from_nodes: &[NodeRef], to_nodes: &[NodeRef]) -> Result<ConnectReport, StorageError> {
        let mut report = ConnectReport::default();
        if from_nodes.is_empty() || to_nodes.is_empty() {
            return Ok(report);
        }

        let mut plan = Vec::with_capacity(from_nodes.len() * to_nodes.len());
        for from in from_nodes {
            for to in to_nodes {
                let (forward, backward) = EdgeSchema::labels_between(from.node_type, to.node_type)?;
                plan.push((from, to, forward, backward));
            }
        }

        for (from, to, forward, backward) in plan {
            for (a, b, label) in [(from, to, forward), (to, from, backward)] {
                match self.add_edge_with_retry(a, b, label).await {
                    Ok(EdgeOutcome::Created) => report.created += 1,
                    Ok(EdgeOutcome::AlreadyPresent) => report.already_present += 1,
                    Err(e) if is_retryable_edge_error(&e) => {
                        warn!(from = a.id.as_str(), to = b.id.as_str(), label, error = %e, "Edge not created after retries");
                        report.failed.push(FailedEdge {
                            from_id: a.id.clone(),
                            to_id: b.id.clone(),
                            label,
                            error: e.to_string(),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        debug!(
            created = report.created,
            already_present = report.already_present,
            failed = report.failed.len(),
            "Connected nodes"
        );
        Ok(report)
    }

    /// Create one directed edge unless it already exists. Missing endpoints
    /// and transient failures are retried per the retry policy, since a node
    /// written moments ago may not be visible to the eventual domain yet.
    /// Each attempt re-checks for the edge, so a write whose ack was lost is
    /// not duplicated.
    pub async fn add_edge_with_retry(&self, from: &NodeRef, to: &NodeRef, label: &str) -> Result<EdgeOutcome, StorageError> {
        let graph = self.graph_for(from.node_type);
        let mut attempt = 1;
        loop {
            match ensure_edge(graph, from, to, label).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < self.retry.attempts && is_retryable_edge_error(&e) => {
                    debug!(from = from.id.as_str(), to = to.id.as_str(), label, attempt, error = %e, "Edge write failed, retrying");
                    tokio::time::sleep(self.retry.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn edge_exists(&self, from: &NodeRef, to: &NodeRef, label: &str) -> Result<bool, StorageError> {
        self.graph_for(from.node_type).edge_exists(from, to, label).await
    }

    pub async fn traverse(&self, node: &NodeRef, label: &str) -> Result<Vec<GraphNode>, StorageError> {
        self.graph_for(node.node_type).traverse(node, label).await
    }

    /// Aggregation queries over application data (eventual domain).
    pub async fn run_raw_query(&self, query: &str) -> Result<Vec<Record>, StorageError> {
        self.eventual.run_raw_query(query).await
    }

    // --- AppState ---

    /// The singleton AppState, created on first read. More than one stored
    /// instance means the data is corrupt and is never repaired here.
    pub async fn get_app_state(&self) -> Result<AppState, StorageError> {
        let graph = self.graph_for(NodeType::AppState);
        let mut nodes = graph.get_all_nodes_by_type(NodeType::AppState).await?;

        match nodes.len() {
            0 => {
                info!("No app state found in graph, creating");
                let state = AppState::default();
                match graph.add_node(&state.clone().into(), true).await? {
                    AddOutcome::Created => Ok(state),
                    // Another caller created it between our read and write.
                    AddOutcome::AlreadyExists => AppState::from_node(graph.get_node(APP_STATE_ID, NodeType::AppState).await?),
                }
            }
            1 => AppState::from_node(nodes.remove(0)),
            count => Err(StorageError::InvariantViolation(format!(
                "expected exactly one AppState, found {count}"
            ))),
        }
    }

    /// Persist `new_state` if any stamp differs from the stored state.
    /// Returns whether a write happened.
    pub async fn update_app_state(&self, new_state: &AppState) -> Result<bool, StorageError> {
        if new_state.id != APP_STATE_ID {
            return Err(StorageError::InvariantViolation(format!(
                "AppState id must be '{APP_STATE_ID}', got '{}'",
                new_state.id
            )));
        }

        let current = self.get_app_state().await?;
        let changes = current.diff(new_state);
        if changes.is_empty() {
            info!("No changes to app state");
            return Ok(false);
        }

        for change in &changes {
            info!(
                key = change.key.as_str(),
                old = ?change.old,
                new = ?change.new,
                "App state key changing"
            );
        }

        self.graph_for(NodeType::AppState)
            .update_node(&new_state.clone().into())
            .await?;
        Ok(true)
    }

    /// Stamp `<subject>_last_modified = now` after changing data of a
    /// clusterable type.
    pub async fn mark_modified(&self, node_type: NodeType) -> Result<(), StorageError> {
        let mut state = self.get_app_state().await?;
        state.set_last_modified(node_type.subject(), Utc::now());
        self.update_app_state(&state).await?;
        Ok(())
    }

    // --- Vectors ---

    /// Embed the node's text and upsert it under the node's id.
    pub async fn embed_and_store(&self, node: &GraphNode) -> Result<(), StorageError> {
        let namespace = Namespace::new(self.environment, node.node_type())?;
        let text = node.embedding_text().ok_or_else(|| {
            StorageError::SchemaViolation(format!("{} has no embeddable text", node.node_type()))
        })?;

        let vector = self.embed(text).await?;
        self.vectors.upsert(&namespace, node.id(), vector).await?;
        debug!(id = node.id(), %namespace, "Embedded and stored node");
        Ok(())
    }

    /// Stored vectors for `ids` in the namespace of `node_type`.
    pub async fn fetch_vectors(&self, node_type: NodeType, ids: &[String]) -> Result<HashMap<String, Vec<f32>>, StorageError> {
        let namespace = Namespace::new(self.environment, node_type)?;
        self.vectors.fetch(&namespace, ids).await
    }

    /// Nodes of `node_type` most similar to `query_text`, scoring above
    /// `min_score`. Matches whose node is gone from the graph are skipped.
    pub async fn search_semantically(
        &self,
        node_type: NodeType,
        query_text: &str,
        top_k: usize,
        min_score: f32,
    ) -> Result<SearchResults, StorageError> {
        let namespace = Namespace::new(self.environment, node_type)?;
        let vector = self.embed(query_text).await?;
        let matches = self.vectors.query(&namespace, &vector, top_k).await?;

        let mut hits = Vec::with_capacity(matches.len());
        for m in matches {
            if m.score <= min_score {
                continue;
            }
            match self.get_node(&m.id, node_type).await {
                Ok(node) => hits.push((node, m.score)),
                Err(StorageError::NotFound { .. }) => {
                    let race = StorageError::ConsistencyRace {
                        id: m.id.clone(),
                        store: "vector index",
                    };
                    warn!(error = %race, %namespace, "Skipping search match with no graph node");
                }
                Err(e) => return Err(e),
            }
        }

        hits.sort_by(|a, b| b.1.total_cmp(&a.1));
        let (nodes, scores) = hits.into_iter().unzip();
        Ok(SearchResults { nodes, scores })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, StorageError> {
        self.embedder
            .embed(text)
            .await
            .map_err(|e| StorageError::Embedding(e.to_string()))
    }

    // --- Environment reset ---

    /// Wipe both graph domains and every vector namespace of `environment`.
    /// `confirm` must repeat the environment name, and the façade must be
    /// connected to that environment.
    pub async fn reset_storage(&self, environment: Environment, confirm: &str) -> Result<(), StorageError> {
        if environment != self.environment || confirm != environment.as_str() {
            return Err(StorageError::Config(format!(
                "refusing to reset '{environment}': connected to '{}', confirmation was '{confirm}'",
                self.environment
            )));
        }

        self.eventual.reset_graph(self.eventual.database()).await?;
        self.strong.reset_graph(self.strong.database()).await?;

        let namespaces = Namespace::all(environment);
        try_join_all(namespaces.iter().map(|ns| self.vectors.delete_namespace_contents(ns))).await?;

        warn!(%environment, namespaces = namespaces.len(), "Storage reset");
        Ok(())
    }

    // --- Domain helpers ---

    /// Add a FeedbackItem and link it to the Review it came from.
    pub async fn add_feedback_item(&self, item: &FeedbackItem, constituted_by: &Review) -> Result<ConnectReport, StorageError> {
        self.add_node(item.clone()).await?;
        self.connect_nodes(&[item.node_ref()], &[constituted_by.node_ref()]).await
    }

    pub async fn add_observation_for_feedback_item(
        &self,
        observation: &Observation,
        item: &FeedbackItem,
    ) -> Result<ConnectReport, StorageError> {
        self.add_node(observation.clone()).await?;
        self.connect_nodes(&[item.node_ref()], &[observation.node_ref()]).await
    }

    /// Add a Score and attach it to the node it scores.
    pub async fn add_score(&self, node: &NodeRef, score: &Score) -> Result<ConnectReport, StorageError> {
        // Resolve first so an unscorable type writes no orphan Score.
        EdgeSchema::labels_between(NodeType::Score, node.node_type)?;
        self.add_node(score.clone()).await?;
        self.connect_nodes(&[score.node_ref()], std::slice::from_ref(node)).await
    }

    pub async fn get_scores(&self, node: &NodeRef) -> Result<Vec<Score>, StorageError> {
        let label = EdgeSchema::label_for(node.node_type, NodeType::Score)?;
        self.traverse(node, label)
            .await?
            .into_iter()
            .map(Score::from_node)
            .collect()
    }

    /// Add a Topic, link its Observations, and link every FeedbackItem those
    /// Observations were derived from.
    pub async fn add_topic_for_observations(
        &self,
        topic: &Topic,
        observations: &[Observation],
    ) -> Result<ConnectReport, StorageError> {
        self.add_node(topic.clone()).await?;

        let topic_ref = [topic.node_ref()];
        let observation_refs: Vec<NodeRef> = observations.iter().map(|o| o.node_ref()).collect();
        let mut report = self.connect_nodes(&observation_refs, &topic_ref).await?;

        let derived_from = EdgeSchema::label_for(NodeType::Observation, NodeType::FeedbackItem)?;
        let mut items = BTreeSet::new();
        for observation in &observation_refs {
            for node in self.traverse(observation, derived_from).await? {
                if node.node_type() == NodeType::FeedbackItem {
                    items.insert(node.id().to_string());
                }
            }
        }

        let item_refs: Vec<NodeRef> = items
            .into_iter()
            .map(|id| NodeRef::new(id, NodeType::FeedbackItem))
            .collect();
        report.merge(self.connect_nodes(&item_refs, &topic_ref).await?);

        info!(
            topic = topic.id.as_str(),
            observations = observation_refs.len(),
            feedback_items = item_refs.len(),
            "Added topic"
        );
        Ok(report)
    }

    /// Delete every Topic and its vector. Used by a full re-clustering pass.
    pub async fn clear_topics(&self) -> Result<usize, StorageError> {
        let topics = self.get_all::<Topic>().await?;
        self.delete_topics(&topics).await
    }

    /// Delete the Topics an earlier clustering run over `target` produced,
    /// leaving hand-made topics and other targets' topics alone.
    pub async fn clear_clustered_topics(&self, target: NodeType) -> Result<usize, StorageError> {
        let subject = target.subject();
        let topics: Vec<Topic> = self
            .get_all::<Topic>()
            .await?
            .into_iter()
            .filter(|t| t.clustered_from.as_deref() == Some(subject))
            .collect();
        self.delete_topics(&topics).await
    }

    async fn delete_topics(&self, topics: &[Topic]) -> Result<usize, StorageError> {
        if topics.is_empty() {
            return Ok(0);
        }

        let graph = self.graph_for(NodeType::Topic);
        for topic in topics {
            graph.delete_node(&topic.node_ref()).await?;
        }

        let namespace = Namespace::new(self.environment, NodeType::Topic)?;
        let ids: Vec<String> = topics.iter().map(|t| t.id.clone()).collect();
        self.vectors.delete(&namespace, &ids).await?;

        info!(deleted = topics.len(), %namespace, "Cleared topics");
        Ok(topics.len())
    }

    /// The Review a FeedbackItem was built from. Anything other than exactly
    /// one source is corrupt data.
    pub async fn get_feedback_item_source(&self, item: &FeedbackItem) -> Result<Review, StorageError> {
        let label = EdgeSchema::label_for(NodeType::FeedbackItem, NodeType::Review)?;
        let mut sources = self.traverse(&item.node_ref(), label).await?;
        if sources.len() != 1 {
            return Err(StorageError::InvariantViolation(format!(
                "FeedbackItem {} is constituted by {} nodes, expected exactly one",
                item.id,
                sources.len()
            )));
        }
        Review::from_node(sources.remove(0))
    }
}

async fn ensure_edge(graph: &dyn GraphStore, from: &NodeRef, to: &NodeRef, label: &str) -> Result<EdgeOutcome, StorageError> {
    if graph.edge_exists(from, to, label).await? {
        return Ok(EdgeOutcome::AlreadyPresent);
    }
    graph.add_edge(from, to, label).await?;
    Ok(EdgeOutcome::Created)
}

fn is_retryable_edge_error(err: &StorageError) -> bool {
    err.is_transient() || matches!(err, StorageError::NotFound { .. })
}
