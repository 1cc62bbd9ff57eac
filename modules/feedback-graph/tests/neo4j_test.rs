//! Integration tests for the Bolt-backed graph client.
//!
//! Requirements: Docker (for Neo4j via testcontainers)
//!
//! Run with: cargo test -p feedback-graph --features test-utils --test neo4j_test

#![cfg(feature = "test-utils")]

use std::sync::Arc;

use feedback_common::{
    ConsistencyDomain, Environment, FeedbackItem, GraphNode, NodeKind, NodeRef, NodeType, Observation, Rating, Review,
    ReviewSource, StorageError,
};
use feedback_graph::testing::{FixedEmbedder, MemoryVectorIndex, TEST_EMBEDDING_DIM};
use feedback_graph::{AddOutcome, GraphClient, GraphStore, Storage};

async fn setup(domain: ConsistencyDomain) -> (impl std::any::Any, GraphClient) {
    let (container, client) = feedback_graph::testutil::neo4j_container(domain).await;
    feedback_graph::migrate(&client).await.expect("migration failed");
    (container, client)
}

fn review(source_id: &str) -> Review {
    Review::new(
        ReviewSource::Yelp,
        source_id,
        Rating::new(2).unwrap(),
        "Waited forever, food was cold",
        chrono::Utc::now(),
    )
}

#[tokio::test]
async fn migrate_is_idempotent() {
    let (_container, client) = setup(ConsistencyDomain::Eventual).await;
    feedback_graph::migrate(&client).await.expect("second migration failed");
}

#[tokio::test]
async fn add_node_skips_existing_ids() {
    let (_container, client) = setup(ConsistencyDomain::Eventual).await;
    let node: GraphNode = review("y-1").into();

    assert_eq!(client.add_node(&node, true).await.unwrap(), AddOutcome::Created);
    assert_eq!(client.add_node(&node, true).await.unwrap(), AddOutcome::AlreadyExists);
    assert!(client.add_node(&node, false).await.is_err());

    let all = client.get_all_nodes_by_type(NodeType::Review).await.unwrap();
    assert_eq!(all, vec![node.clone()]);
    assert_eq!(client.get_node(node.id(), NodeType::Review).await.unwrap(), node);
}

#[tokio::test]
async fn typed_reads_reject_the_wrong_label() {
    let (_container, client) = setup(ConsistencyDomain::Eventual).await;
    let obs = Observation::new("Bathrooms were spotless");
    client.add_node(&obs.clone().into(), true).await.unwrap();

    let err = client.get_node(&obs.id, NodeType::Topic).await.unwrap_err();
    assert!(matches!(err, StorageError::TypeMismatch { .. }));

    let err = client.get_node("missing", NodeType::Topic).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

#[tokio::test]
async fn edges_are_directed_and_traversable() {
    let (_container, client) = setup(ConsistencyDomain::Eventual).await;
    let item = FeedbackItem::new("Service was slow", 1_690_000_000);
    let obs = Observation::new("Slow service");
    client.add_node(&item.clone().into(), true).await.unwrap();
    client.add_node(&obs.clone().into(), true).await.unwrap();

    client.add_edge(&item.node_ref(), &obs.node_ref(), "derived").await.unwrap();

    assert!(client.edge_exists(&item.node_ref(), &obs.node_ref(), "derived").await.unwrap());
    assert!(!client.edge_exists(&obs.node_ref(), &item.node_ref(), "derived").await.unwrap());
    let reached = client.traverse(&item.node_ref(), "derived").await.unwrap();
    assert_eq!(reached, vec![GraphNode::from(obs.clone())]);

    let nobody = NodeRef::new("nobody", NodeType::Observation);
    let err = client.add_edge(&item.node_ref(), &nobody, "derived").await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

#[tokio::test]
async fn lookups_are_scoped_to_the_node_label() {
    let (_container, client) = setup(ConsistencyDomain::Eventual).await;
    let obs = Observation::new("Patio heaters broken");
    client.add_node(&obs.clone().into(), true).await.unwrap();

    // Same id under another label is a different node.
    let as_topic = NodeRef::new(obs.id.clone(), NodeType::Topic);
    assert!(client.node_exists(&obs.node_ref()).await.unwrap());
    assert!(!client.node_exists(&as_topic).await.unwrap());

    client.delete_node(&as_topic).await.unwrap();
    assert!(client.node_exists(&obs.node_ref()).await.unwrap());

    client.delete_node(&obs.node_ref()).await.unwrap();
    assert!(!client.node_exists(&obs.node_ref()).await.unwrap());
}

#[tokio::test]
async fn update_replaces_properties() {
    let (_container, client) = setup(ConsistencyDomain::Eventual).await;
    let mut obs = Observation::new("Music too loud");
    client.add_node(&obs.clone().into(), true).await.unwrap();

    obs.text = "Music far too loud on weekends".to_string();
    client.update_node(&obs.clone().into()).await.unwrap();

    let stored: Observation = Observation::from_node(client.get_node(&obs.id, NodeType::Observation).await.unwrap()).unwrap();
    assert_eq!(stored.text, "Music far too loud on weekends");
}

#[tokio::test]
async fn reset_requires_the_database_name() {
    let (_container, client) = setup(ConsistencyDomain::Eventual).await;
    client.add_node(&Observation::new("Nice patio").into(), true).await.unwrap();

    let err = client.reset_graph("wrong").await.unwrap_err();
    assert!(matches!(err, StorageError::Config(_)));
    assert_eq!(client.get_all_nodes_by_type(NodeType::Observation).await.unwrap().len(), 1);

    client.reset_graph("neo4j").await.unwrap();
    assert!(client.get_all_nodes_by_type(NodeType::Observation).await.unwrap().is_empty());
}

#[tokio::test]
async fn storage_over_two_graphs() {
    let (_eventual_container, eventual) = setup(ConsistencyDomain::Eventual).await;
    let (_strong_container, strong) = setup(ConsistencyDomain::Strong).await;
    let eventual = Arc::new(eventual);
    let strong = Arc::new(strong);

    let storage = Storage::new(
        eventual.clone(),
        strong.clone(),
        Arc::new(MemoryVectorIndex::new()),
        Arc::new(FixedEmbedder::new(TEST_EMBEDDING_DIM)),
        Environment::Test,
    );

    let review = review("y-2");
    let item = FeedbackItem::new(review.text.clone(), 1_690_000_000);
    storage.add_node(review.clone()).await.unwrap();
    let report = storage.add_feedback_item(&item, &review).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.created, 2);

    assert_eq!(storage.get_feedback_item_source(&item).await.unwrap(), review);

    let state = storage.get_app_state().await.unwrap();
    assert_eq!(strong.get_all_nodes_by_type(NodeType::AppState).await.unwrap().len(), 1);
    assert!(eventual.get_all_nodes_by_type(NodeType::AppState).await.unwrap().is_empty());
    assert_eq!(storage.get_app_state().await.unwrap(), state);

    let rows = storage
        .run_raw_query("MATCH (n:FeedbackItem) RETURN count(n) AS count")
        .await
        .unwrap();
    assert_eq!(rows[0]["count"], serde_json::json!(1));
}
