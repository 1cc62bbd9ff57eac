use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use ai_client::truncate_to_char_boundary;
use feedback_common::{EdgeSchema, GraphNode, NodeKind, NodeRef, NodeType, Observation, StorageError, Topic};

use crate::similarity::cosine_distance;
use crate::storage::{ConnectReport, Storage};

/// Cluster id reserved for points that belong to no cluster.
pub const NOISE: i32 = -1;

/// Fewer vectors than this cannot form a cluster.
const MIN_NODES: usize = 2;

/// Longest topic name taken from a member's text when naming fails.
const FALLBACK_NAME_MAX: usize = 80;

/// Vectors in, one cluster id per vector out. `NOISE` marks unclustered.
pub trait ClusterAlgorithm: Send + Sync {
    fn cluster(&self, vectors: &[Vec<f32>]) -> Vec<i32>;
}

/// Names a cluster from its members' texts.
#[async_trait]
pub trait TopicNamer: Send + Sync {
    async fn name_topic(&self, member_texts: &[String]) -> AnyResult<String>;
}

/// DBSCAN over cosine distance.
#[derive(Debug, Clone, Copy)]
pub struct DensityClusterer {
    pub eps: f64,
    pub min_points: usize,
}

impl Default for DensityClusterer {
    fn default() -> Self {
        Self {
            eps: 0.25,
            min_points: 2,
        }
    }
}

impl DensityClusterer {
    /// Indices within `eps` of `i`, `i` included.
    fn region(&self, vectors: &[Vec<f32>], i: usize) -> Vec<usize> {
        (0..vectors.len())
            .filter(|&j| cosine_distance(&vectors[i], &vectors[j]) <= self.eps)
            .collect()
    }
}

impl ClusterAlgorithm for DensityClusterer {
    fn cluster(&self, vectors: &[Vec<f32>]) -> Vec<i32> {
        const UNVISITED: i32 = -2;

        let mut labels = vec![UNVISITED; vectors.len()];
        let mut next_cluster = 0;

        for i in 0..vectors.len() {
            if labels[i] != UNVISITED {
                continue;
            }
            let neighbours = self.region(vectors, i);
            if neighbours.len() < self.min_points {
                labels[i] = NOISE;
                continue;
            }

            let cluster = next_cluster;
            next_cluster += 1;
            labels[i] = cluster;

            let mut frontier = neighbours;
            while let Some(j) = frontier.pop() {
                if labels[j] == NOISE {
                    // Border point: joins the cluster but does not expand it.
                    labels[j] = cluster;
                    continue;
                }
                if labels[j] != UNVISITED {
                    continue;
                }
                labels[j] = cluster;
                let reach = self.region(vectors, j);
                if reach.len() >= self.min_points {
                    frontier.extend(reach);
                }
            }
        }

        labels
    }
}

/// Groups embeddable nodes of one type by vector similarity and gives each
/// group a Topic. Guarded by the AppState debounce so an unchanged data set
/// is never clustered twice.
pub struct ClusteringJob {
    storage: Arc<Storage>,
    algorithm: Box<dyn ClusterAlgorithm>,
    namer: Arc<dyn TopicNamer>,
    target: NodeType,
    full_rebuild: bool,
}

impl ClusteringJob {
    /// `target` must be embeddable and connectable to Topic.
    pub fn new(storage: Arc<Storage>, namer: Arc<dyn TopicNamer>, target: NodeType) -> Result<Self, StorageError> {
        if !target.is_embeddable() || !EdgeSchema::is_registered(target, NodeType::Topic) {
            return Err(StorageError::SchemaViolation(format!(
                "{target} nodes cannot be clustered into topics"
            )));
        }
        Ok(Self {
            storage,
            algorithm: Box::new(DensityClusterer::default()),
            namer,
            target,
            full_rebuild: false,
        })
    }

    pub fn with_algorithm(mut self, algorithm: Box<dyn ClusterAlgorithm>) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Delete every existing topic, hand-made ones included, before writing
    /// new ones (Observation only). Without it a run still replaces the
    /// topics earlier runs over the same target produced.
    pub fn with_full_rebuild(mut self, full_rebuild: bool) -> Self {
        self.full_rebuild = full_rebuild;
        self
    }

    pub async fn run(&self) -> Result<ClusterStats, StorageError> {
        let subject = self.target.subject();
        let mut stats = ClusterStats::default();

        // 1. Debounce
        let mut state = self.storage.get_app_state().await?;
        if state.clustering_in_flight(subject) {
            info!(
                subject,
                started = %state.clustering_last_started(subject),
                modified = %state.last_modified(subject),
                "Clustering already ran for current data, skipping"
            );
            stats.status = ClusterStatus::SkippedInFlight;
            return Ok(stats);
        }
        state.set_clustering_started(subject, Utc::now());
        self.storage.update_app_state(&state).await?;

        // 2. Load nodes and join with their vectors
        let nodes = self.storage.get_all_nodes_by_type(self.target).await?;
        stats.nodes_considered = nodes.len();

        let ids: Vec<String> = nodes.iter().map(|n| n.id().to_string()).collect();
        let mut vectors = self.storage.fetch_vectors(self.target, &ids).await?;

        let mut members = Vec::with_capacity(nodes.len());
        let mut member_vectors = Vec::with_capacity(nodes.len());
        for node in nodes {
            match vectors.remove(node.id()) {
                Some(vector) => {
                    members.push(node);
                    member_vectors.push(vector);
                }
                None => {
                    debug!(id = node.id(), "No stored vector, skipping");
                    stats.missing_vectors += 1;
                }
            }
        }
        if stats.missing_vectors > 0 {
            warn!(subject, missing = stats.missing_vectors, "Nodes without vectors left out of clustering");
        }

        if members.len() < MIN_NODES {
            info!(subject, nodes = members.len(), "Insufficient nodes for clustering");
            stats.status = ClusterStatus::InsufficientNodes;
            return Ok(stats);
        }

        // 3. Cluster and group
        let labels = self.algorithm.cluster(&member_vectors);
        if labels.len() != members.len() {
            return Err(StorageError::InvariantViolation(format!(
                "clustering returned {} labels for {} vectors",
                labels.len(),
                members.len()
            )));
        }

        let mut groups: BTreeMap<i32, Vec<GraphNode>> = BTreeMap::new();
        for (node, label) in members.into_iter().zip(labels) {
            if label == NOISE {
                stats.noise += 1;
            } else {
                groups.entry(label).or_default().push(node);
            }
        }
        stats.clusters = groups.len();
        info!(subject, clusters = stats.clusters, noise = stats.noise, "Clusters detected");

        // 4. Topics. The previous run's topics describe stale groupings.
        stats.topics_cleared = if self.full_rebuild && self.target == NodeType::Observation {
            self.storage.clear_topics().await?
        } else {
            self.storage.clear_clustered_topics(self.target).await?
        };

        if groups.is_empty() {
            stats.status = ClusterStatus::NoClusters;
            return Ok(stats);
        }

        for group in groups.into_values() {
            let texts: Vec<String> = group
                .iter()
                .filter_map(|n| n.embedding_text().map(str::to_string))
                .collect();
            let topic = Topic::clustered(self.name_cluster(&texts).await, self.target);

            let report = self.attach(&topic, group).await?;
            if !report.is_complete() {
                warn!(topic = topic.id.as_str(), failed = report.failed.len(), "Topic partially connected");
            }

            self.storage.embed_and_store(&topic.clone().into()).await?;
            info!(topic = topic.id.as_str(), name = topic.name.as_str(), members = texts.len(), "Created topic");
            stats.topics_created += 1;
        }

        stats.status = ClusterStatus::Complete;
        info!("{stats}");
        Ok(stats)
    }

    async fn attach(&self, topic: &Topic, group: Vec<GraphNode>) -> Result<ConnectReport, StorageError> {
        if self.target == NodeType::Observation {
            let observations = group
                .into_iter()
                .map(Observation::from_node)
                .collect::<Result<Vec<_>, _>>()?;
            return self.storage.add_topic_for_observations(topic, &observations).await;
        }

        self.storage.add_node(topic.clone()).await?;
        let refs: Vec<NodeRef> = group.iter().map(GraphNode::node_ref).collect();
        self.storage.connect_nodes(&refs, &[topic.node_ref()]).await
    }

    /// Ask the namer; on failure use the first member's text.
    async fn name_cluster(&self, texts: &[String]) -> String {
        match self.namer.name_topic(texts).await {
            Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
            Ok(_) => {
                warn!("Topic namer returned an empty name, using fallback");
                fallback_name(texts)
            }
            Err(e) => {
                warn!(error = %e, "Topic naming failed, using fallback");
                fallback_name(texts)
            }
        }
    }
}

fn fallback_name(texts: &[String]) -> String {
    texts
        .first()
        .map(|t| truncate_to_char_boundary(t.trim(), FALLBACK_NAME_MAX).to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Unnamed topic".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterStatus {
    #[default]
    NotRun,
    SkippedInFlight,
    InsufficientNodes,
    NoClusters,
    Complete,
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClusterStatus::NotRun => "not_run",
            ClusterStatus::SkippedInFlight => "skipped_in_flight",
            ClusterStatus::InsufficientNodes => "insufficient_nodes",
            ClusterStatus::NoClusters => "no_clusters",
            ClusterStatus::Complete => "complete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
pub struct ClusterStats {
    pub status: ClusterStatus,
    pub nodes_considered: usize,
    pub missing_vectors: usize,
    pub clusters: usize,
    pub noise: usize,
    pub topics_cleared: usize,
    pub topics_created: usize,
}

impl std::fmt::Display for ClusterStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Clustering Complete ===")?;
        writeln!(f, "Nodes considered: {}", self.nodes_considered)?;
        writeln!(f, "Missing vectors:  {}", self.missing_vectors)?;
        writeln!(f, "Clusters:         {}", self.clusters)?;
        writeln!(f, "Noise:            {}", self.noise)?;
        writeln!(f, "Topics cleared:   {}", self.topics_cleared)?;
        writeln!(f, "Topics created:   {}", self.topics_created)?;
        writeln!(f, "Status:           {}", self.status)?;
        Ok(())
    }
}
