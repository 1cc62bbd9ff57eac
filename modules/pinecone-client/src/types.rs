use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vector {
    pub id: String,
    pub values: Vec<f32>,
}

#[derive(Debug, Serialize)]
pub(crate) struct UpsertRequest<'a> {
    pub vectors: &'a [Vector],
    pub namespace: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertResponse {
    #[serde(default)]
    pub upserted_count: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryRequest<'a> {
    pub namespace: &'a str,
    pub vector: &'a [f32],
    pub top_k: usize,
    pub include_values: bool,
    pub include_metadata: bool,
}

#[derive(Debug, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub matches: Vec<ScoredVector>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ScoredVector {
    pub id: String,
    #[serde(default)]
    pub score: f32,
}

#[derive(Debug, Deserialize)]
pub struct FetchResponse {
    #[serde(default)]
    pub vectors: HashMap<String, Vector>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeleteRequest<'a> {
    pub namespace: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<&'a [String]>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub delete_all: bool,
}
