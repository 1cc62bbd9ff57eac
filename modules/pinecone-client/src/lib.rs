pub mod error;
pub mod types;

use std::time::Duration;

pub use error::{PineconeError, Result};
pub use types::{FetchResponse, QueryResponse, ScoredVector, UpsertResponse, Vector};

use serde::de::DeserializeOwned;
use serde::Serialize;
use types::{DeleteRequest, QueryRequest, UpsertRequest};

/// Largest upsert batch the data plane accepts for dense vectors.
const UPSERT_BATCH_SIZE: usize = 100;

/// Ids per fetch request; keeps the query string well under URL limits.
const FETCH_BATCH_SIZE: usize = 100;

/// Ids per delete request.
const DELETE_BATCH_SIZE: usize = 1000;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Client for one Pinecone index, addressed by its data-plane host.
pub struct PineconeClient {
    client: reqwest::Client,
    api_key: String,
    host: String,
}

impl PineconeClient {
    /// `host` is the index host from the control plane, with or without scheme.
    pub fn new(api_key: String, host: &str) -> Result<Self> {
        Self::with_timeout(api_key, host, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(api_key: String, host: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", host.trim_end_matches('/'))
        };
        Ok(Self {
            client,
            api_key,
            host,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Insert or overwrite vectors by id. Returns the number upserted.
    pub async fn upsert(&self, namespace: &str, vectors: &[Vector]) -> Result<u64> {
        let mut total = 0;
        for batch in vectors.chunks(UPSERT_BATCH_SIZE) {
            let req = UpsertRequest {
                vectors: batch,
                namespace,
            };
            let resp: UpsertResponse = self.post("/vectors/upsert", &req).await?;
            total += resp.upserted_count;
        }
        tracing::debug!(namespace, total, "Upserted vectors");
        Ok(total)
    }

    /// Nearest neighbours of `vector`, best first.
    pub async fn query(&self, namespace: &str, vector: &[f32], top_k: usize) -> Result<Vec<ScoredVector>> {
        let req = QueryRequest {
            namespace,
            vector,
            top_k,
            include_values: false,
            include_metadata: false,
        };
        let resp: QueryResponse = self.post("/query", &req).await?;
        Ok(resp.matches)
    }

    /// Stored vectors for `ids`. Ids with no vector are absent from the result.
    pub async fn fetch(&self, namespace: &str, ids: &[String]) -> Result<Vec<Vector>> {
        let mut found = Vec::with_capacity(ids.len());
        for batch in ids.chunks(FETCH_BATCH_SIZE) {
            let mut params: Vec<(&str, &str)> = batch.iter().map(|id| ("ids", id.as_str())).collect();
            params.push(("namespace", namespace));

            let resp = self
                .client
                .get(format!("{}/vectors/fetch", self.host))
                .header("Api-Key", &self.api_key)
                .query(&params)
                .send()
                .await?;

            let fetched: FetchResponse = Self::parse(resp).await?;
            found.extend(fetched.vectors.into_values());
        }
        Ok(found)
    }

    /// Delete the vectors for `ids`. Ids with no vector are ignored.
    pub async fn delete(&self, namespace: &str, ids: &[String]) -> Result<()> {
        for batch in ids.chunks(DELETE_BATCH_SIZE) {
            let req = DeleteRequest {
                namespace,
                ids: Some(batch),
                delete_all: false,
            };
            self.post::<_, serde_json::Value>("/vectors/delete", &req).await?;
        }
        tracing::debug!(namespace, count = ids.len(), "Deleted vectors");
        Ok(())
    }

    /// Delete every vector in a namespace. A namespace that does not exist
    /// yet counts as already empty.
    pub async fn delete_all(&self, namespace: &str) -> Result<()> {
        let req = DeleteRequest {
            namespace,
            ids: None,
            delete_all: true,
        };
        match self.post::<_, serde_json::Value>("/vectors/delete", &req).await {
            Ok(_) => {}
            Err(PineconeError::Api { status: 404, .. }) => {
                tracing::debug!(namespace, "Namespace absent, nothing to delete");
            }
            Err(e) => return Err(e),
        }
        tracing::info!(namespace, "Deleted all vectors in namespace");
        Ok(())
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self
            .client
            .post(format!("{}{}", self.host, path))
            .header("Api-Key", &self.api_key)
            .json(body)
            .send()
            .await?;
        Self::parse(resp).await
    }

    async fn parse<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PineconeError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Ok(serde_json::from_str("{}")?);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}
