use crate::error::StorageError;
use crate::types::NodeType;

/// Every (from, to) pair that may be connected, with the label of the edge in
/// that direction. Each pair is registered in both directions with its own
/// label; reciprocity is a property of this table, never inferred.
const EDGE_TABLE: &[(NodeType, NodeType, &str)] = &[
    (NodeType::Review, NodeType::FeedbackItem, "constitutes"),
    (NodeType::FeedbackItem, NodeType::Review, "constituted_by"),
    (NodeType::FeedbackItem, NodeType::Observation, "derived"),
    (NodeType::Observation, NodeType::FeedbackItem, "derived_from"),
    (NodeType::Score, NodeType::Observation, "scores_for"),
    (NodeType::Observation, NodeType::Score, "scored_by"),
    (NodeType::ActionItem, NodeType::FeedbackItem, "addresses"),
    (NodeType::FeedbackItem, NodeType::ActionItem, "addressed_by"),
    (NodeType::ActionItem, NodeType::Topic, "addresses"),
    (NodeType::Topic, NodeType::ActionItem, "addressed_by"),
    (NodeType::ActionItem, NodeType::Observation, "addresses"),
    (NodeType::Observation, NodeType::ActionItem, "addressed_by"),
    (NodeType::Topic, NodeType::Observation, "contains"),
    (NodeType::Observation, NodeType::Topic, "belongs_to"),
    (NodeType::Topic, NodeType::FeedbackItem, "informed_by"),
    (NodeType::FeedbackItem, NodeType::Topic, "informs"),
];

/// Static table of which node types may be connected, and by which label.
pub struct EdgeSchema;

impl EdgeSchema {
    /// Label for an edge from `from` to `to`. An unregistered pair is a
    /// programming error and always fails.
    pub fn label_for(from: NodeType, to: NodeType) -> Result<&'static str, StorageError> {
        EDGE_TABLE
            .iter()
            .find(|(f, t, _)| *f == from && *t == to)
            .map(|(_, _, label)| *label)
            .ok_or_else(|| {
                StorageError::SchemaViolation(format!("no edge label registered for {from} -> {to}"))
            })
    }

    /// Forward and backward labels for a reciprocal pair.
    pub fn labels_between(from: NodeType, to: NodeType) -> Result<(&'static str, &'static str), StorageError> {
        Ok((Self::label_for(from, to)?, Self::label_for(to, from)?))
    }

    pub fn pairs() -> impl Iterator<Item = (NodeType, NodeType, &'static str)> {
        EDGE_TABLE.iter().copied()
    }

    pub fn is_registered(from: NodeType, to: NodeType) -> bool {
        EDGE_TABLE.iter().any(|(f, t, _)| *f == from && *t == to)
    }

    /// Every distinct label, for backend setup and validation of raw labels.
    pub fn labels() -> Vec<&'static str> {
        let mut labels: Vec<&'static str> = EDGE_TABLE.iter().map(|(_, _, l)| *l).collect();
        labels.sort_unstable();
        labels.dedup();
        labels
    }
}
