use std::fmt;

use feedback_common::{EdgeSchema, NodeType, StorageError};

use crate::storage::Storage;
use crate::store::Record;

/// Mean and count of one score name.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreSummary {
    pub name: String,
    pub mean: f64,
    pub count: u64,
}

/// Aggregate scores attached to every node of one type.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreReport {
    pub node_type: NodeType,
    pub scores: Vec<ScoreSummary>,
}

impl ScoreReport {
    pub async fn build(storage: &Storage, node_type: NodeType) -> Result<Self, StorageError> {
        let records = storage.run_raw_query(&score_query(node_type)?).await?;
        let scores = records.iter().map(summary_from_record).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { node_type, scores })
    }

    pub fn get(&self, name: &str) -> Option<&ScoreSummary> {
        self.scores.iter().find(|s| s.name == name)
    }
}

impl fmt::Display for ScoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Scores for {} ===", self.node_type)?;
        if self.scores.is_empty() {
            writeln!(f, "(no scores)")?;
        }
        for s in &self.scores {
            writeln!(f, "{:<16} mean {:>5.2}  n={}", s.name, s.mean, s.count)?;
        }
        Ok(())
    }
}

/// Only types with a registered Score edge can be reported on.
pub(crate) fn score_query(node_type: NodeType) -> Result<String, StorageError> {
    let scored_by = EdgeSchema::label_for(node_type, NodeType::Score)?;
    Ok(format!(
        "MATCH (n:{})-[:{scored_by}]->(s:{}) \
         RETURN s.name AS name, avg(s.value) AS mean, count(s) AS count \
         ORDER BY name",
        node_type.label(),
        NodeType::Score.label()
    ))
}

fn summary_from_record(record: &Record) -> Result<ScoreSummary, StorageError> {
    let field = |key: &str| {
        record
            .get(key)
            .ok_or_else(|| StorageError::Serialization(format!("score report row missing '{key}'")))
    };

    Ok(ScoreSummary {
        name: field("name")?.as_str().unwrap_or_default().to_string(),
        mean: field("mean")?.as_f64().unwrap_or_default(),
        count: field("count")?.as_u64().unwrap_or_default(),
    })
}
