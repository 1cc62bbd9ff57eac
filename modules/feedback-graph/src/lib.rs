pub mod client;
pub mod cluster;
pub mod embedder;
pub mod migrate;
pub mod reporting;
pub mod similarity;
pub mod storage;
pub mod store;
pub mod topic_namer;
pub mod vector;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use client::GraphClient;
pub use cluster::{ClusterAlgorithm, ClusterStats, ClusterStatus, ClusteringJob, DensityClusterer, TopicNamer};
pub use embedder::Embedder;
pub use migrate::migrate;
pub use reporting::{ScoreReport, ScoreSummary};
pub use storage::{ConnectReport, EdgeOutcome, FailedEdge, RetryPolicy, SearchResults, Storage};
pub use store::{AddOutcome, GraphStore, Record};
pub use topic_namer::LlmTopicNamer;
pub use vector::{Namespace, PineconeIndex, VectorIndex, VectorMatch};
