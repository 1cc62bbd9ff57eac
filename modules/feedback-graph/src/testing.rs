// In-memory doubles for the storage seams.
//
// - MemoryGraph (GraphStore): stateful graph with operation counters and an
//   optional edge visibility lag
// - MemoryVectorIndex (VectorIndex): cosine top-k over stored vectors
// - FixedEmbedder (TextEmbedder): deterministic hash-based vectors
// - FixedTopicNamer (TopicNamer): canned topic names
//
// Plus `memory_storage`, which wires them into a Storage façade.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use feedback_common::{ConsistencyDomain, Environment, GraphNode, NodeRef, NodeType, StorageError, TextEmbedder};

use crate::cluster::TopicNamer;
use crate::similarity::cosine_similarity;
use crate::storage::{RetryPolicy, Storage};
use crate::store::{check_label, AddOutcome, GraphStore, Record};
use crate::vector::{Namespace, VectorIndex, VectorMatch};

/// Standard embedding dimension for test vectors.
pub const TEST_EMBEDDING_DIM: usize = 64;

// ---------------------------------------------------------------------------
// MemoryGraph
// ---------------------------------------------------------------------------

/// Reads and writes issued against a MemoryGraph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub reads: usize,
    pub writes: usize,
}

impl OpCounts {
    pub fn total(&self) -> usize {
        self.reads + self.writes
    }
}

#[derive(Default)]
struct MemoryGraphInner {
    nodes: HashMap<String, GraphNode>,
    /// (from, to, label), duplicates kept so tests can count them.
    edges: Vec<(String, String, String)>,
    ops: OpCounts,
    /// Failed attempts so far per (from, to, label) while lagging.
    edge_attempts: HashMap<(String, String, String), u32>,
    raw_results: HashMap<String, Vec<Record>>,
    /// Remaining `edge_exists` calls that fail as transient.
    failing_edge_checks: u32,
    /// Remaining `add_edge` calls that store the edge but report a
    /// transient failure, as when the ack is lost on the wire.
    lost_edge_acks: u32,
}

/// Stateful in-memory graph. Thread-safe via interior Mutex.
pub struct MemoryGraph {
    domain: ConsistencyDomain,
    database: String,
    /// `add_edge` fails with `NotFound` this many times per edge before it
    /// lands, mimicking read-your-own-write lag.
    edge_lag: u32,
    inner: Mutex<MemoryGraphInner>,
}

impl MemoryGraph {
    pub fn new(domain: ConsistencyDomain) -> Self {
        Self {
            domain,
            database: format!("memory-{domain}"),
            edge_lag: 0,
            inner: Mutex::new(MemoryGraphInner::default()),
        }
    }

    pub fn with_edge_lag(mut self, failures_per_edge: u32) -> Self {
        self.edge_lag = failures_per_edge;
        self
    }

    pub fn with_failing_edge_checks(self, count: u32) -> Self {
        self.inner.lock().unwrap().failing_edge_checks = count;
        self
    }

    pub fn with_lost_edge_acks(self, count: u32) -> Self {
        self.inner.lock().unwrap().lost_edge_acks = count;
        self
    }

    /// Canned result for `run_raw_query(query)`.
    pub fn on_query(self, query: &str, records: Vec<Record>) -> Self {
        self.inner
            .lock()
            .unwrap()
            .raw_results
            .insert(query.to_string(), records);
        self
    }

    /// Insert a node without counting an operation or checking for
    /// duplicates of its type. Used to set up corrupt states.
    pub fn seed(&self, node: impl Into<GraphNode>) {
        let node = node.into();
        self.inner.lock().unwrap().nodes.insert(node.id().to_string(), node);
    }

    // --- Assertion helpers ---

    pub fn ops(&self) -> OpCounts {
        self.inner.lock().unwrap().ops
    }

    pub fn reset_ops(&self) {
        self.inner.lock().unwrap().ops = OpCounts::default();
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    pub fn count_of_type(&self, node_type: NodeType) -> usize {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .values()
            .filter(|n| n.node_type() == node_type)
            .count()
    }

    pub fn edge_count(&self, from_id: &str, to_id: &str, label: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .edges
            .iter()
            .filter(|(f, t, l)| f == from_id && t == to_id && l == label)
            .count()
    }

    pub fn total_edges(&self) -> usize {
        self.inner.lock().unwrap().edges.len()
    }

    /// The stored node behind `node`, if its type matches.
    fn typed<'a>(inner: &'a MemoryGraphInner, node: &NodeRef) -> Option<&'a GraphNode> {
        inner.nodes.get(&node.id).filter(|n| n.node_type() == node.node_type)
    }

    fn read(&self) -> std::sync::MutexGuard<'_, MemoryGraphInner> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.reads += 1;
        inner
    }

    fn write(&self) -> std::sync::MutexGuard<'_, MemoryGraphInner> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.writes += 1;
        inner
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    fn domain(&self) -> ConsistencyDomain {
        self.domain
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn get_node(&self, id: &str, expected: NodeType) -> Result<GraphNode, StorageError> {
        let inner = self.read();
        let node = inner.nodes.get(id).ok_or_else(|| StorageError::not_found(id))?;
        if node.node_type() != expected {
            return Err(StorageError::TypeMismatch {
                id: id.to_string(),
                expected,
                found: node.node_type().to_string(),
            });
        }
        Ok(node.clone())
    }

    async fn get_all_nodes_by_type(&self, node_type: NodeType) -> Result<Vec<GraphNode>, StorageError> {
        let inner = self.read();
        Ok(inner
            .nodes
            .values()
            .filter(|n| n.node_type() == node_type)
            .cloned()
            .collect())
    }

    async fn node_exists(&self, node: &NodeRef) -> Result<bool, StorageError> {
        Ok(Self::typed(&self.read(), node).is_some())
    }

    async fn add_node(&self, node: &GraphNode, skip_if_exists: bool) -> Result<AddOutcome, StorageError> {
        let mut inner = self.write();
        if inner.nodes.contains_key(node.id()) {
            if skip_if_exists {
                return Ok(AddOutcome::AlreadyExists);
            }
            return Err(StorageError::Query(format!(
                "node {} already exists (uniqueness constraint)",
                node.id()
            )));
        }
        inner.nodes.insert(node.id().to_string(), node.clone());
        Ok(AddOutcome::Created)
    }

    async fn delete_node(&self, node: &NodeRef) -> Result<(), StorageError> {
        let mut inner = self.write();
        if Self::typed(&inner, node).is_none() {
            return Ok(());
        }
        let id = node.id.as_str();
        inner.nodes.remove(id);
        inner.edges.retain(|(f, t, _)| f != id && t != id);
        Ok(())
    }

    async fn update_node(&self, node: &GraphNode) -> Result<(), StorageError> {
        let mut inner = self.write();
        let stored = inner
            .nodes
            .get_mut(node.id())
            .filter(|n| n.node_type() == node.node_type())
            .ok_or_else(|| StorageError::not_found(node.id()))?;
        *stored = node.clone();
        Ok(())
    }

    async fn add_edge(&self, from: &NodeRef, to: &NodeRef, label: &str) -> Result<(), StorageError> {
        check_label(label)?;
        let (from_id, to_id) = (from.id.as_str(), to.id.as_str());
        let mut inner = self.write();

        let key = (from_id.to_string(), to_id.to_string(), label.to_string());
        let attempts = inner.edge_attempts.entry(key).or_insert(0);
        if *attempts < self.edge_lag {
            *attempts += 1;
            return Err(StorageError::NotFound {
                id: format!("{from_id} -[{label}]-> {to_id}"),
            });
        }

        if Self::typed(&inner, from).is_none() || Self::typed(&inner, to).is_none() {
            return Err(StorageError::NotFound {
                id: format!("{from_id} -[{label}]-> {to_id}"),
            });
        }
        inner
            .edges
            .push((from_id.to_string(), to_id.to_string(), label.to_string()));

        if inner.lost_edge_acks > 0 {
            inner.lost_edge_acks -= 1;
            return Err(StorageError::TransientBackend(format!(
                "connection reset after {from_id} -[{label}]-> {to_id}"
            )));
        }
        Ok(())
    }

    async fn edge_exists(&self, from: &NodeRef, to: &NodeRef, label: &str) -> Result<bool, StorageError> {
        check_label(label)?;
        let mut inner = self.read();
        if inner.failing_edge_checks > 0 {
            inner.failing_edge_checks -= 1;
            return Err(StorageError::TransientBackend("edge check timed out".to_string()));
        }
        if Self::typed(&inner, from).is_none() || Self::typed(&inner, to).is_none() {
            return Ok(false);
        }
        Ok(inner
            .edges
            .iter()
            .any(|(f, t, l)| *f == from.id && *t == to.id && l == label))
    }

    async fn traverse(&self, node: &NodeRef, label: &str) -> Result<Vec<GraphNode>, StorageError> {
        check_label(label)?;
        let inner = self.read();
        if Self::typed(&inner, node).is_none() {
            return Ok(Vec::new());
        }
        Ok(inner
            .edges
            .iter()
            .filter(|(f, _, l)| *f == node.id && l == label)
            .filter_map(|(_, t, _)| inner.nodes.get(t).cloned())
            .collect())
    }

    async fn run_raw_query(&self, query: &str) -> Result<Vec<Record>, StorageError> {
        self.read()
            .raw_results
            .get(query)
            .cloned()
            .ok_or_else(|| StorageError::Query(format!("no canned result for query: {query}")))
    }

    async fn reset_graph(&self, confirm_database: &str) -> Result<(), StorageError> {
        if confirm_database != self.database {
            return Err(StorageError::Config(format!(
                "confirmation '{confirm_database}' does not match '{}'",
                self.database
            )));
        }
        let mut inner = self.write();
        inner.nodes.clear();
        inner.edges.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryVectorIndex
// ---------------------------------------------------------------------------

/// Namespaced vectors in memory, queried by exact cosine similarity.
#[derive(Default)]
pub struct MemoryVectorIndex {
    namespaces: Mutex<HashMap<String, HashMap<String, Vec<f32>>>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, namespace: &Namespace, id: &str) -> bool {
        self.namespaces
            .lock()
            .unwrap()
            .get(&namespace.to_string())
            .is_some_and(|ns| ns.contains_key(id))
    }

    pub fn len(&self, namespace: &Namespace) -> usize {
        self.namespaces
            .lock()
            .unwrap()
            .get(&namespace.to_string())
            .map_or(0, HashMap::len)
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, namespace: &Namespace, node_id: &str, vector: Vec<f32>) -> Result<(), StorageError> {
        self.namespaces
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_default()
            .insert(node_id.to_string(), vector);
        Ok(())
    }

    async fn query(
        &self,
        namespace: &Namespace,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorMatch>, StorageError> {
        let namespaces = self.namespaces.lock().unwrap();
        let Some(stored) = namespaces.get(&namespace.to_string()) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<VectorMatch> = stored
            .iter()
            .map(|(id, v)| VectorMatch {
                id: id.clone(),
                score: cosine_similarity(vector, v) as f32,
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn fetch(&self, namespace: &Namespace, ids: &[String]) -> Result<HashMap<String, Vec<f32>>, StorageError> {
        let namespaces = self.namespaces.lock().unwrap();
        let Some(stored) = namespaces.get(&namespace.to_string()) else {
            return Ok(HashMap::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| stored.get(id).map(|v| (id.clone(), v.clone())))
            .collect())
    }

    async fn delete(&self, namespace: &Namespace, ids: &[String]) -> Result<(), StorageError> {
        if let Some(stored) = self.namespaces.lock().unwrap().get_mut(&namespace.to_string()) {
            for id in ids {
                stored.remove(id);
            }
        }
        Ok(())
    }

    async fn delete_namespace_contents(&self, namespace: &Namespace) -> Result<(), StorageError> {
        self.namespaces.lock().unwrap().remove(&namespace.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FixedEmbedder
// ---------------------------------------------------------------------------

/// Deterministic embedder for testing. Registered texts get exact vectors;
/// unmatched texts get a unique hash-based vector (low similarity to everything).
pub struct FixedEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    dimension: usize,
}

impl FixedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            vectors: HashMap::new(),
            dimension,
        }
    }

    /// Register a text→vector mapping for controlled similarity.
    pub fn on_text(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        self.vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| hash_vector(text, self.dimension))
    }
}

/// Unit vector seeded from the SHA-256 of the text. Same text, same vector,
/// across runs and processes.
pub fn hash_vector(text: &str, dimension: usize) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    let mut state = u64::from_le_bytes(seed);

    let mut vec = vec![0.0f32; dimension];
    for v in vec.iter_mut() {
        // Simple LCG PRNG
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        *v = ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0;
    }
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
    vec
}

#[async_trait]
impl TextEmbedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

// ---------------------------------------------------------------------------
// FixedTopicNamer
// ---------------------------------------------------------------------------

/// Names a cluster by its first member's text. Returns `Err` for
/// unregistered members unless a default is set.
#[derive(Default)]
pub struct FixedTopicNamer {
    names: HashMap<String, String>,
    default: Option<String>,
    calls: Mutex<usize>,
}

impl FixedTopicNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_member(mut self, member_text: &str, name: &str) -> Self {
        self.names.insert(member_text.to_string(), name.to_string());
        self
    }

    pub fn with_default(mut self, name: &str) -> Self {
        self.default = Some(name.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl TopicNamer for FixedTopicNamer {
    async fn name_topic(&self, member_texts: &[String]) -> Result<String> {
        *self.calls.lock().unwrap() += 1;
        if let Some(name) = member_texts.iter().find_map(|t| self.names.get(t)) {
            return Ok(name.clone());
        }
        match &self.default {
            Some(name) => Ok(name.clone()),
            None => bail!("no topic name registered for {member_texts:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// The doubles behind a façade, kept so tests can inspect them.
pub struct MemoryStorage {
    pub storage: Storage,
    pub eventual: Arc<MemoryGraph>,
    pub strong: Arc<MemoryGraph>,
    pub vectors: Arc<MemoryVectorIndex>,
}

/// A test-environment façade over fresh doubles, with a 1ms retry delay.
pub fn memory_storage(embedder: FixedEmbedder) -> MemoryStorage {
    memory_storage_with(MemoryGraph::new(ConsistencyDomain::Eventual), embedder)
}

/// Like [`memory_storage`] with a preconfigured eventual graph.
pub fn memory_storage_with(eventual: MemoryGraph, embedder: FixedEmbedder) -> MemoryStorage {
    let eventual = Arc::new(eventual);
    let strong = Arc::new(MemoryGraph::new(ConsistencyDomain::Strong));
    let vectors = Arc::new(MemoryVectorIndex::new());

    let storage = Storage::new(
        eventual.clone(),
        strong.clone(),
        vectors.clone(),
        Arc::new(embedder),
        Environment::Test,
    )
    .with_retry_policy(RetryPolicy {
        attempts: 3,
        delay: Duration::from_millis(1),
    });

    MemoryStorage {
        storage,
        eventual,
        strong,
        vectors,
    }
}

/// Unit vector along axis `i`, tilted slightly toward axis `i + 1`.
pub fn axis_vector(i: usize, tilt: f32) -> Vec<f32> {
    let mut v = vec![0.0f32; TEST_EMBEDDING_DIM];
    v[i % TEST_EMBEDDING_DIM] = 1.0;
    v[(i + 1) % TEST_EMBEDDING_DIM] = tilt;
    v
}
