use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StorageError;

/// Id of the single AppState node.
pub const APP_STATE_ID: &str = "only_app_state";

// --- Enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    Review,
    FeedbackItem,
    Observation,
    Topic,
    ActionItem,
    Score,
    AppState,
}

impl NodeType {
    pub const ALL: [NodeType; 7] = [
        NodeType::Review,
        NodeType::FeedbackItem,
        NodeType::Observation,
        NodeType::Topic,
        NodeType::ActionItem,
        NodeType::Score,
        NodeType::AppState,
    ];

    /// Graph label, also the prefix of generated ids.
    pub fn label(&self) -> &'static str {
        match self {
            NodeType::Review => "Review",
            NodeType::FeedbackItem => "FeedbackItem",
            NodeType::Observation => "Observation",
            NodeType::Topic => "Topic",
            NodeType::ActionItem => "ActionItem",
            NodeType::Score => "Score",
            NodeType::AppState => "AppState",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        NodeType::ALL.into_iter().find(|t| t.label() == label)
    }

    /// Plural snake_case name used for AppState keys and vector namespaces.
    pub fn subject(&self) -> &'static str {
        match self {
            NodeType::Review => "reviews",
            NodeType::FeedbackItem => "feedback_items",
            NodeType::Observation => "observations",
            NodeType::Topic => "topics",
            NodeType::ActionItem => "action_items",
            NodeType::Score => "scores",
            NodeType::AppState => "app_state",
        }
    }

    /// Types that carry a vector in the similarity index.
    pub fn is_embeddable(&self) -> bool {
        matches!(
            self,
            NodeType::FeedbackItem | NodeType::Observation | NodeType::ActionItem | NodeType::Topic
        )
    }

    /// AppState guards the clustering debounce and must never be read stale.
    pub fn consistency_domain(&self) -> ConsistencyDomain {
        match self {
            NodeType::AppState => ConsistencyDomain::Strong,
            _ => ConsistencyDomain::Eventual,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyDomain {
    Eventual,
    Strong,
}

impl fmt::Display for ConsistencyDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyDomain::Eventual => write!(f, "eventual"),
            ConsistencyDomain::Strong => write!(f, "strong"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Test,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Test => "test",
            Environment::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(StorageError::Config(format!("unknown environment '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewSource {
    Yelp,
    Google,
    Other,
}

impl ReviewSource {
    /// Fragment used in deterministic review ids.
    pub fn id_fragment(&self) -> &'static str {
        match self {
            ReviewSource::Yelp => "YELP",
            ReviewSource::Google => "GOOGLE",
            ReviewSource::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreName {
    Satisfaction,
    Specificity,
    BusinessImpact,
    Urgency,
}

impl ScoreName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreName::Satisfaction => "satisfaction",
            ScoreName::Specificity => "specificity",
            ScoreName::BusinessImpact => "business_impact",
            ScoreName::Urgency => "urgency",
        }
    }
}

impl fmt::Display for ScoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Star rating, 1 through 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rating(u8);

impl Rating {
    pub fn new(value: u8) -> Result<Self, StorageError> {
        Rating::try_from(value).map_err(StorageError::Serialization)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Rating {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (1..=5).contains(&value) {
            Ok(Rating(value))
        } else {
            Err(format!("rating must be between 1 and 5, got {value}"))
        }
    }
}

impl From<Rating> for u8 {
    fn from(rating: Rating) -> Self {
        rating.0
    }
}

// --- Node variants ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub rating: Rating,
    pub text: String,
    pub source: ReviewSource,
    pub source_review_id: String,
    pub published_at: DateTime<Utc>,
}

impl Review {
    /// The id is derived from (type, source, source id) so re-scraping the
    /// same review lands on the same node.
    pub fn new(
        source: ReviewSource,
        source_review_id: impl Into<String>,
        rating: Rating,
        text: impl Into<String>,
        published_at: DateTime<Utc>,
    ) -> Self {
        let source_review_id = source_review_id.into();
        Self {
            id: Review::derive_id(source, &source_review_id),
            rating,
            text: text.into(),
            source,
            source_review_id,
            published_at,
        }
    }

    pub fn derive_id(source: ReviewSource, source_review_id: &str) -> String {
        format!(
            "{}_{}_{}",
            NodeType::Review.label(),
            source.id_fragment(),
            source_review_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackItem {
    pub id: String,
    pub text: String,
    /// Unix seconds.
    pub text_written_at: i64,
    /// Unix seconds.
    pub node_created_at: i64,
}

impl FeedbackItem {
    pub fn new(text: impl Into<String>, text_written_at: i64) -> Self {
        Self {
            id: generated_id(NodeType::FeedbackItem),
            text: text.into(),
            text_written_at,
            node_created_at: Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    pub text: String,
    pub created_at: i64,
}

impl Observation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: generated_id(NodeType::Observation),
            text: text.into(),
            created_at: Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub name: String,
    /// Subject of the clustering run that produced this topic, e.g.
    /// `observations`. Unset for topics added by hand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clustered_from: Option<String>,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: generated_id(NodeType::Topic),
            name: name.into(),
            clustered_from: None,
        }
    }

    /// A topic produced by clustering nodes of `target`.
    pub fn clustered(name: impl Into<String>, target: NodeType) -> Self {
        Self {
            clustered_from: Some(target.subject().to_string()),
            ..Self::new(name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub id: String,
    pub text: String,
    pub created_at: i64,
}

impl ActionItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: generated_id(NodeType::ActionItem),
            text: text.into(),
            created_at: Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub id: String,
    pub name: ScoreName,
    pub value: f64,
    #[serde(default)]
    pub explanation: String,
}

impl Score {
    pub fn new(name: ScoreName, value: f64, explanation: impl Into<String>) -> Self {
        Self {
            id: generated_id(NodeType::Score),
            name,
            value,
            explanation: explanation.into(),
        }
    }
}

/// The singleton record guarding recurring batch jobs.
///
/// Holds `<subject>_last_modified` and `<subject>_clustering_last_started`
/// stamps keyed by subject (see [`NodeType::subject`]). A missing stamp reads
/// as the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    pub id: String,
    #[serde(flatten)]
    pub stamps: BTreeMap<String, DateTime<Utc>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            id: APP_STATE_ID.to_string(),
            stamps: BTreeMap::new(),
        }
    }
}

impl AppState {
    pub fn last_modified_key(subject: &str) -> String {
        format!("{subject}_last_modified")
    }

    pub fn clustering_started_key(subject: &str) -> String {
        format!("{subject}_clustering_last_started")
    }

    pub fn last_modified(&self, subject: &str) -> DateTime<Utc> {
        self.stamp(&Self::last_modified_key(subject))
    }

    pub fn clustering_last_started(&self, subject: &str) -> DateTime<Utc> {
        self.stamp(&Self::clustering_started_key(subject))
    }

    pub fn set_last_modified(&mut self, subject: &str, at: DateTime<Utc>) {
        self.stamps.insert(Self::last_modified_key(subject), at);
    }

    pub fn set_clustering_started(&mut self, subject: &str, at: DateTime<Utc>) {
        self.stamps.insert(Self::clustering_started_key(subject), at);
    }

    /// A run started after the last data change is still covering that data.
    pub fn clustering_in_flight(&self, subject: &str) -> bool {
        self.clustering_last_started(subject) > self.last_modified(subject)
    }

    /// Keys whose values differ between `self` and `other`, with (old, new).
    pub fn diff(&self, other: &AppState) -> Vec<StampChange> {
        let mut keys: Vec<&String> = self.stamps.keys().chain(other.stamps.keys()).collect();
        keys.sort();
        keys.dedup();

        keys.into_iter()
            .filter_map(|key| {
                let old = self.stamps.get(key).copied();
                let new = other.stamps.get(key).copied();
                (old != new).then(|| StampChange {
                    key: key.clone(),
                    old,
                    new,
                })
            })
            .collect()
    }

    fn stamp(&self, key: &str) -> DateTime<Utc> {
        self.stamps.get(key).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StampChange {
    pub key: String,
    pub old: Option<DateTime<Utc>>,
    pub new: Option<DateTime<Utc>>,
}

// --- GraphNode ---

/// Any node stored in the graph, tagged by its concrete type.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphNode {
    Review(Review),
    FeedbackItem(FeedbackItem),
    Observation(Observation),
    Topic(Topic),
    ActionItem(ActionItem),
    Score(Score),
    AppState(AppState),
}

impl GraphNode {
    pub fn id(&self) -> &str {
        match self {
            GraphNode::Review(n) => &n.id,
            GraphNode::FeedbackItem(n) => &n.id,
            GraphNode::Observation(n) => &n.id,
            GraphNode::Topic(n) => &n.id,
            GraphNode::ActionItem(n) => &n.id,
            GraphNode::Score(n) => &n.id,
            GraphNode::AppState(n) => &n.id,
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self {
            GraphNode::Review(_) => NodeType::Review,
            GraphNode::FeedbackItem(_) => NodeType::FeedbackItem,
            GraphNode::Observation(_) => NodeType::Observation,
            GraphNode::Topic(_) => NodeType::Topic,
            GraphNode::ActionItem(_) => NodeType::ActionItem,
            GraphNode::Score(_) => NodeType::Score,
            GraphNode::AppState(_) => NodeType::AppState,
        }
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef::new(self.id(), self.node_type())
    }

    /// Text that gets embedded for the similarity index. `None` for types
    /// that are not embeddable.
    pub fn embedding_text(&self) -> Option<&str> {
        match self {
            GraphNode::FeedbackItem(n) => Some(&n.text),
            GraphNode::Observation(n) => Some(&n.text),
            GraphNode::ActionItem(n) => Some(&n.text),
            GraphNode::Topic(n) => Some(&n.name),
            _ => None,
        }
    }

    /// Flat property map as stored on the graph node, `id` included.
    pub fn to_properties(&self) -> Result<serde_json::Map<String, Value>, StorageError> {
        let value = match self {
            GraphNode::Review(n) => serde_json::to_value(n)?,
            GraphNode::FeedbackItem(n) => serde_json::to_value(n)?,
            GraphNode::Observation(n) => serde_json::to_value(n)?,
            GraphNode::Topic(n) => serde_json::to_value(n)?,
            GraphNode::ActionItem(n) => serde_json::to_value(n)?,
            GraphNode::Score(n) => serde_json::to_value(n)?,
            GraphNode::AppState(n) => serde_json::to_value(n)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            other => Err(StorageError::Serialization(format!(
                "{} did not serialize to a map: {other}",
                self.node_type()
            ))),
        }
    }

    /// Build a node from a stored label and property map.
    pub fn decode(label: &str, properties: Value) -> Result<Self, StorageError> {
        let node_type = NodeType::from_label(label).ok_or_else(|| {
            StorageError::Serialization(format!(
                "unknown node label '{label}' on {}",
                property_id(&properties)
            ))
        })?;
        Self::decode_variant(node_type, properties)
    }

    /// Like [`GraphNode::decode`], but fails with `TypeMismatch` before
    /// constructing anything if the stored label is not `expected`.
    pub fn decode_as(expected: NodeType, label: &str, properties: Value) -> Result<Self, StorageError> {
        if NodeType::from_label(label) != Some(expected) {
            return Err(StorageError::TypeMismatch {
                id: property_id(&properties),
                expected,
                found: label.to_string(),
            });
        }
        Self::decode_variant(expected, properties)
    }

    fn decode_variant(node_type: NodeType, properties: Value) -> Result<Self, StorageError> {
        Ok(match node_type {
            NodeType::Review => GraphNode::Review(serde_json::from_value(properties)?),
            NodeType::FeedbackItem => GraphNode::FeedbackItem(serde_json::from_value(properties)?),
            NodeType::Observation => GraphNode::Observation(serde_json::from_value(properties)?),
            NodeType::Topic => GraphNode::Topic(serde_json::from_value(properties)?),
            NodeType::ActionItem => GraphNode::ActionItem(serde_json::from_value(properties)?),
            NodeType::Score => GraphNode::Score(serde_json::from_value(properties)?),
            NodeType::AppState => GraphNode::AppState(serde_json::from_value(properties)?),
        })
    }
}

fn property_id(properties: &Value) -> String {
    properties
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn generated_id(node_type: NodeType) -> String {
    format!("{}_{}", node_type.label(), Uuid::new_v4())
}

/// Lightweight handle to a stored node: enough to address it and to resolve
/// edge labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub id: String,
    pub node_type: NodeType,
}

impl NodeRef {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
        }
    }
}

impl From<&GraphNode> for NodeRef {
    fn from(node: &GraphNode) -> Self {
        node.node_ref()
    }
}

/// A concrete node variant, usable as a typed handle into the graph.
pub trait NodeKind: Into<GraphNode> + Clone + Send + Sync + Sized + 'static {
    const TYPE: NodeType;

    fn node_id(&self) -> &str;

    fn from_node(node: GraphNode) -> Result<Self, StorageError>;

    fn node_ref(&self) -> NodeRef {
        NodeRef::new(self.node_id(), Self::TYPE)
    }
}

macro_rules! node_kind {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for GraphNode {
                fn from(node: $variant) -> Self {
                    GraphNode::$variant(node)
                }
            }

            impl NodeKind for $variant {
                const TYPE: NodeType = NodeType::$variant;

                fn node_id(&self) -> &str {
                    &self.id
                }

                fn from_node(node: GraphNode) -> Result<Self, StorageError> {
                    match node {
                        GraphNode::$variant(n) => Ok(n),
                        other => Err(StorageError::TypeMismatch {
                            id: other.id().to_string(),
                            expected: NodeType::$variant,
                            found: other.node_type().to_string(),
                        }),
                    }
                }
            }
        )*
    };
}

node_kind!(Review, FeedbackItem, Observation, Topic, ActionItem, Score, AppState);
