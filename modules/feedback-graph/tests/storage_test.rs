//! Storage façade behaviour against the in-memory graph doubles.

use chrono::{Duration, Utc};

use feedback_common::{
    ActionItem, AppState, ConsistencyDomain, EdgeSchema, Environment, FeedbackItem, GraphNode, NodeKind, NodeRef,
    NodeType, Observation, Rating, Review, ReviewSource, Score, ScoreName, StorageError, Topic, APP_STATE_ID,
};
use feedback_graph::testing::{
    hash_vector, memory_storage, memory_storage_with, FixedEmbedder, MemoryGraph, TEST_EMBEDDING_DIM,
};
use feedback_graph::{AddOutcome, Namespace, ScoreReport};

fn embedder() -> FixedEmbedder {
    FixedEmbedder::new(TEST_EMBEDDING_DIM)
}

fn yelp_review() -> Review {
    Review::new(
        ReviewSource::Yelp,
        "abc123",
        Rating::new(4).unwrap(),
        "Tacos were great but we waited forty minutes",
        Utc::now(),
    )
}

fn sample(node_type: NodeType) -> GraphNode {
    match node_type {
        NodeType::Review => yelp_review().into(),
        NodeType::FeedbackItem => FeedbackItem::new("Waited forty minutes", 1_690_000_000).into(),
        NodeType::Observation => Observation::new("Wait time exceeded thirty minutes").into(),
        NodeType::Topic => Topic::new("Long waits").into(),
        NodeType::ActionItem => ActionItem::new("Add a host at peak hours").into(),
        NodeType::Score => Score::new(ScoreName::Urgency, 0.8, "Repeated complaint").into(),
        NodeType::AppState => AppState::default().into(),
    }
}

// =========================================================================
// Node creation
// =========================================================================

#[tokio::test]
async fn adding_same_review_twice_yields_one_node() {
    let mem = memory_storage(embedder());

    let first = mem.storage.add_node(yelp_review()).await.unwrap();
    let second = mem.storage.add_node(yelp_review()).await.unwrap();

    assert_eq!(first, AddOutcome::Created);
    assert_eq!(second, AddOutcome::AlreadyExists);
    assert_eq!(mem.eventual.count_of_type(NodeType::Review), 1);

    let stored = mem.storage.get::<Review>("Review_YELP_abc123").await.unwrap();
    assert_eq!(stored.rating.value(), 4);
}

#[tokio::test]
async fn concurrent_adds_of_one_review_create_one_node() {
    let mem = memory_storage(embedder());

    let (a, b) = tokio::join!(mem.storage.add_node(yelp_review()), mem.storage.add_node(yelp_review()));
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| *o == AddOutcome::AlreadyExists);

    assert_eq!(outcomes, vec![AddOutcome::Created, AddOutcome::AlreadyExists]);
    assert_eq!(mem.eventual.count_of_type(NodeType::Review), 1);
}

#[tokio::test]
async fn typed_read_of_wrong_type_is_a_mismatch() {
    let mem = memory_storage(embedder());
    let obs = Observation::new("Soup was cold");
    mem.storage.add_node(obs.clone()).await.unwrap();

    let err = mem.storage.get::<Topic>(&obs.id).await.unwrap_err();
    assert!(matches!(err, StorageError::TypeMismatch { expected: NodeType::Topic, .. }));

    let err = mem.storage.get::<Topic>("Topic_missing").await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

#[tokio::test]
async fn update_of_missing_node_is_not_found() {
    let mem = memory_storage(embedder());
    let err = mem.storage.update_node(Topic::new("Never stored")).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

#[tokio::test]
async fn app_state_is_routed_to_the_strong_domain() {
    let mem = memory_storage(embedder());
    mem.storage.get_app_state().await.unwrap();
    mem.storage.add_node(Topic::new("Parking")).await.unwrap();

    assert_eq!(mem.strong.count_of_type(NodeType::AppState), 1);
    assert_eq!(mem.eventual.count_of_type(NodeType::AppState), 0);
    assert_eq!(mem.eventual.count_of_type(NodeType::Topic), 1);
    assert_eq!(mem.strong.count_of_type(NodeType::Topic), 0);
}

// =========================================================================
// Edges
// =========================================================================

#[tokio::test]
async fn every_registered_pair_gets_reciprocal_edges() {
    for (from_type, to_type, forward) in EdgeSchema::pairs() {
        let mem = memory_storage(embedder());
        let a = sample(from_type);
        let b = sample(to_type);
        mem.storage.add_node(a.clone()).await.unwrap();
        mem.storage.add_node(b.clone()).await.unwrap();

        let report = mem.storage.connect_nodes(&[a.node_ref()], &[b.node_ref()]).await.unwrap();
        assert!(report.is_complete());

        let backward = EdgeSchema::label_for(to_type, from_type).unwrap();
        assert!(mem.storage.edge_exists(&a.node_ref(), &b.node_ref(), forward).await.unwrap());
        assert!(mem.storage.edge_exists(&b.node_ref(), &a.node_ref(), backward).await.unwrap());
    }
}

#[tokio::test]
async fn empty_side_is_a_no_op() {
    let mem = memory_storage(embedder());
    let obs = sample(NodeType::Observation);

    let report = mem.storage.connect_nodes(&[obs.node_ref()], &[]).await.unwrap();
    let report2 = mem.storage.connect_nodes(&[], &[obs.node_ref()]).await.unwrap();

    assert_eq!(report.created + report2.created, 0);
    assert_eq!(mem.eventual.ops().total(), 0);
}

#[tokio::test]
async fn unregistered_pair_fails_before_any_write() {
    let mem = memory_storage(embedder());
    let review = sample(NodeType::Review);
    let item = sample(NodeType::FeedbackItem);
    let obs = sample(NodeType::Observation);
    for n in [&review, &item, &obs] {
        mem.storage.add_node(n.clone()).await.unwrap();
    }

    // Review -> FeedbackItem is fine, Review -> Observation is not.
    let err = mem
        .storage
        .connect_nodes(&[review.node_ref()], &[item.node_ref(), obs.node_ref()])
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::SchemaViolation(_)));
    assert_eq!(mem.eventual.total_edges(), 0);
}

#[tokio::test]
async fn reconnecting_does_not_duplicate_edges() {
    let mem = memory_storage(embedder());
    let review = yelp_review();
    let item = FeedbackItem::new("Waited forty minutes", 1_690_000_000);
    mem.storage.add_node(review.clone()).await.unwrap();

    let first = mem.storage.add_feedback_item(&item, &review).await.unwrap();
    let second = mem
        .storage
        .connect_nodes(&[item.node_ref()], &[review.node_ref()])
        .await
        .unwrap();

    assert_eq!(first.created, 2);
    assert_eq!(second.created, 0);
    assert_eq!(second.already_present, 2);
    assert_eq!(mem.eventual.edge_count(&item.id, &review.id, "constituted_by"), 1);
    assert_eq!(mem.eventual.edge_count(&review.id, &item.id, "constitutes"), 1);
}

#[tokio::test]
async fn retry_absorbs_visibility_lag() {
    let mem = memory_storage_with(
        MemoryGraph::new(ConsistencyDomain::Eventual).with_edge_lag(2),
        embedder(),
    );
    let item = FeedbackItem::new("Great patio", 1_690_000_000);
    let obs = Observation::new("Patio seating is appreciated");
    mem.storage.add_node(item.clone()).await.unwrap();

    let report = mem.storage.add_observation_for_feedback_item(&obs, &item).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.created, 2);
    assert_eq!(mem.eventual.edge_count(&item.id, &obs.id, "derived"), 1);
    assert_eq!(mem.eventual.edge_count(&obs.id, &item.id, "derived_from"), 1);
}

#[tokio::test]
async fn exhausted_retries_warn_and_continue() {
    let mem = memory_storage_with(
        MemoryGraph::new(ConsistencyDomain::Eventual).with_edge_lag(3),
        embedder(),
    );
    let item = FeedbackItem::new("Great patio", 1_690_000_000);
    let obs = Observation::new("Patio seating is appreciated");
    mem.storage.add_node(item.clone()).await.unwrap();

    let report = mem.storage.add_observation_for_feedback_item(&obs, &item).await.unwrap();

    assert_eq!(report.created, 0);
    assert_eq!(report.failed.len(), 2);
    assert_eq!(report.failed[0].label, "derived");
    assert_eq!(report.failed[1].label, "derived_from");
    assert_eq!(mem.eventual.total_edges(), 0);
    // The node write itself still landed.
    assert!(mem.storage.node_exists(&obs.id, NodeType::Observation).await.unwrap());
}

#[tokio::test]
async fn transient_edge_check_is_retried() {
    let mem = memory_storage_with(
        MemoryGraph::new(ConsistencyDomain::Eventual).with_failing_edge_checks(1),
        embedder(),
    );
    let item = FeedbackItem::new("Great patio", 1_690_000_000);
    let obs = Observation::new("Patio seating is appreciated");
    mem.storage.add_node(item.clone()).await.unwrap();

    let report = mem.storage.add_observation_for_feedback_item(&obs, &item).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.created, 2);
    assert_eq!(mem.eventual.edge_count(&item.id, &obs.id, "derived"), 1);
    assert_eq!(mem.eventual.edge_count(&obs.id, &item.id, "derived_from"), 1);
}

#[tokio::test]
async fn lost_write_ack_does_not_duplicate_the_edge() {
    let mem = memory_storage_with(
        MemoryGraph::new(ConsistencyDomain::Eventual).with_lost_edge_acks(1),
        embedder(),
    );
    let item = FeedbackItem::new("Great patio", 1_690_000_000);
    let obs = Observation::new("Patio seating is appreciated");
    mem.storage.add_node(item.clone()).await.unwrap();

    let report = mem.storage.add_observation_for_feedback_item(&obs, &item).await.unwrap();

    assert!(report.is_complete());
    // The retry finds the edge the unacknowledged write stored.
    assert_eq!(report.already_present, 1);
    assert_eq!(report.created, 1);
    assert_eq!(mem.eventual.edge_count(&item.id, &obs.id, "derived"), 1);
    assert_eq!(mem.eventual.edge_count(&obs.id, &item.id, "derived_from"), 1);
}

// =========================================================================
// AppState
// =========================================================================

#[tokio::test]
async fn app_state_is_created_once_on_first_read() {
    let mem = memory_storage(embedder());

    let first = mem.storage.get_app_state().await.unwrap();
    let second = mem.storage.get_app_state().await.unwrap();

    assert_eq!(first.id, APP_STATE_ID);
    assert_eq!(second.id, first.id);
    assert_eq!(mem.strong.count_of_type(NodeType::AppState), 1);
}

#[tokio::test]
async fn two_app_states_are_an_invariant_violation() {
    let mem = memory_storage(embedder());
    mem.strong.seed(AppState::default());
    mem.strong.seed(AppState {
        id: "only_app_state_copy".to_string(),
        ..AppState::default()
    });

    let err = mem.storage.get_app_state().await.unwrap_err();
    assert!(matches!(err, StorageError::InvariantViolation(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn unchanged_app_state_is_not_written() {
    let mem = memory_storage(embedder());
    let state = mem.storage.get_app_state().await.unwrap();
    mem.strong.reset_ops();

    let wrote = mem.storage.update_app_state(&state).await.unwrap();

    assert!(!wrote);
    assert_eq!(mem.strong.ops().writes, 0);
}

#[tokio::test]
async fn changed_app_state_is_persisted() {
    let mem = memory_storage(embedder());
    let mut state = mem.storage.get_app_state().await.unwrap();
    let at = Utc::now() - Duration::minutes(5);
    state.set_clustering_started("observations", at);

    assert!(mem.storage.update_app_state(&state).await.unwrap());

    let stored = mem.storage.get_app_state().await.unwrap();
    assert_eq!(stored.clustering_last_started("observations"), at);
}

#[tokio::test]
async fn mark_modified_moves_the_stamp_forward() {
    let mem = memory_storage(embedder());
    let before = Utc::now();

    mem.storage.mark_modified(NodeType::Observation).await.unwrap();

    let state = mem.storage.get_app_state().await.unwrap();
    assert!(state.last_modified("observations") >= before);
    assert_eq!(state.last_modified("topics").timestamp(), 0);
}

#[tokio::test]
async fn app_state_with_foreign_id_is_rejected() {
    let mem = memory_storage(embedder());
    let state = AppState {
        id: "another".to_string(),
        ..AppState::default()
    };
    let err = mem.storage.update_app_state(&state).await.unwrap_err();
    assert!(matches!(err, StorageError::InvariantViolation(_)));
}

// =========================================================================
// Domain helpers
// =========================================================================

#[tokio::test]
async fn review_to_observation_traversal() {
    let mem = memory_storage(embedder());
    let review = yelp_review();
    let item = FeedbackItem::new("Tacos were great but we waited forty minutes", 1_690_000_000);
    let obs = Observation::new("Wait time of forty minutes");

    mem.storage.add_node(review.clone()).await.unwrap();
    mem.storage.add_node(item.clone()).await.unwrap();
    mem.storage
        .connect_nodes(&[item.node_ref()], &[review.node_ref()])
        .await
        .unwrap();
    mem.storage.add_observation_for_feedback_item(&obs, &item).await.unwrap();

    let derived = mem.storage.traverse(&item.node_ref(), "derived").await.unwrap();
    assert_eq!(derived, vec![GraphNode::from(obs.clone())]);

    let derived_from = mem.storage.traverse(&obs.node_ref(), "derived_from").await.unwrap();
    assert_eq!(derived_from, vec![GraphNode::from(item.clone())]);

    let source = mem.storage.get_feedback_item_source(&item).await.unwrap();
    assert_eq!(source.id, "Review_YELP_abc123");
}

#[tokio::test]
async fn feedback_item_without_source_is_an_invariant_violation() {
    let mem = memory_storage(embedder());
    let item = FeedbackItem::new("Orphan", 1_690_000_000);
    mem.storage.add_node(item.clone()).await.unwrap();

    let err = mem.storage.get_feedback_item_source(&item).await.unwrap_err();
    assert!(matches!(err, StorageError::InvariantViolation(_)));
}

#[tokio::test]
async fn scores_attach_to_observations_only() {
    let mem = memory_storage(embedder());
    let obs = Observation::new("Staff were rude");
    mem.storage.add_node(obs.clone()).await.unwrap();

    let score = Score::new(ScoreName::Satisfaction, 1.0, "Strongly negative");
    mem.storage.add_score(&obs.node_ref(), &score).await.unwrap();

    let scores = mem.storage.get_scores(&obs.node_ref()).await.unwrap();
    assert_eq!(scores, vec![score]);

    let review = yelp_review();
    mem.storage.add_node(review.clone()).await.unwrap();
    let err = mem
        .storage
        .add_score(&review.node_ref(), &Score::new(ScoreName::Urgency, 0.2, ""))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::SchemaViolation(_)));
    assert_eq!(mem.eventual.count_of_type(NodeType::Score), 1);
}

#[tokio::test]
async fn topic_links_observations_and_their_feedback_items() {
    let mem = memory_storage(embedder());
    let item = FeedbackItem::new("Cold fries and slow service", 1_690_000_000);
    let cold = Observation::new("Fries arrived cold");
    let slow = Observation::new("Service was slow");
    mem.storage.add_node(item.clone()).await.unwrap();
    mem.storage.add_observation_for_feedback_item(&cold, &item).await.unwrap();
    mem.storage.add_observation_for_feedback_item(&slow, &item).await.unwrap();

    let topic = Topic::new("Food quality and speed");
    let report = mem
        .storage
        .add_topic_for_observations(&topic, &[cold.clone(), slow.clone()])
        .await
        .unwrap();

    assert!(report.is_complete());
    for obs in [&cold, &slow] {
        assert_eq!(mem.eventual.edge_count(&obs.id, &topic.id, "belongs_to"), 1);
        assert_eq!(mem.eventual.edge_count(&topic.id, &obs.id, "contains"), 1);
    }
    // Shared source item is linked once.
    assert_eq!(mem.eventual.edge_count(&item.id, &topic.id, "informs"), 1);
    assert_eq!(mem.eventual.edge_count(&topic.id, &item.id, "informed_by"), 1);
}

#[tokio::test]
async fn clear_topics_removes_topics_and_their_edges() {
    let mem = memory_storage(embedder());
    let obs = Observation::new("Music too loud");
    mem.storage.add_node(obs.clone()).await.unwrap();
    let noise = Topic::new("Noise");
    let parking = Topic::new("Parking");
    mem.storage.add_topic_for_observations(&noise, &[obs.clone()]).await.unwrap();
    mem.storage.add_node(parking.clone()).await.unwrap();
    for topic in [&noise, &parking] {
        mem.storage.embed_and_store(&topic.clone().into()).await.unwrap();
    }
    let topic_ns = Namespace::new(Environment::Test, NodeType::Topic).unwrap();
    assert_eq!(mem.vectors.len(&topic_ns), 2);

    let deleted = mem.storage.clear_topics().await.unwrap();

    assert_eq!(deleted, 2);
    assert_eq!(mem.eventual.count_of_type(NodeType::Topic), 0);
    assert_eq!(mem.vectors.len(&topic_ns), 0);
    assert!(mem.storage.traverse(&obs.node_ref(), "belongs_to").await.unwrap().is_empty());
    assert!(mem.storage.node_exists(&obs.id, NodeType::Observation).await.unwrap());
}

#[tokio::test]
async fn clear_clustered_topics_only_touches_that_target() {
    let mem = memory_storage(embedder());
    let from_observations = Topic::clustered("Noise", NodeType::Observation);
    let from_actions = Topic::clustered("Staffing", NodeType::ActionItem);
    let manual = Topic::new("Parking");
    for topic in [&from_observations, &from_actions, &manual] {
        mem.storage.add_node(topic.clone()).await.unwrap();
    }

    let deleted = mem.storage.clear_clustered_topics(NodeType::Observation).await.unwrap();

    assert_eq!(deleted, 1);
    let mut left: Vec<String> = mem.storage.get_all::<Topic>().await.unwrap().into_iter().map(|t| t.id).collect();
    left.sort();
    let mut expected = vec![from_actions.id.clone(), manual.id.clone()];
    expected.sort();
    assert_eq!(left, expected);
}

#[tokio::test]
async fn delete_node_removes_it() {
    let mem = memory_storage(embedder());
    let action = ActionItem::new("Hire another cook");
    mem.storage.add_node(action.clone()).await.unwrap();

    mem.storage.delete_node(&action.node_ref()).await.unwrap();

    assert!(!mem.storage.node_exists(&action.id, NodeType::ActionItem).await.unwrap());
    let all = mem.storage.get_all::<ActionItem>().await.unwrap();
    assert!(all.is_empty());
}

#[tokio::test]
async fn add_nodes_is_idempotent_per_node() {
    let mem = memory_storage(embedder());
    let topic = Topic::new("Prices");
    let outcomes = mem
        .storage
        .add_nodes(vec![topic.clone().into(), yelp_review().into(), topic.into()])
        .await
        .unwrap();

    assert_eq!(
        outcomes,
        vec![AddOutcome::Created, AddOutcome::Created, AddOutcome::AlreadyExists]
    );
}

// =========================================================================
// Reset and reporting
// =========================================================================

#[tokio::test]
async fn reset_requires_matching_environment_name() {
    let mem = memory_storage(embedder());
    mem.storage.add_node(yelp_review()).await.unwrap();
    mem.storage.get_app_state().await.unwrap();

    let err = mem.storage.reset_storage(Environment::Prod, "prod").await.unwrap_err();
    assert!(matches!(err, StorageError::Config(_)));
    let err = mem.storage.reset_storage(Environment::Test, "yes").await.unwrap_err();
    assert!(matches!(err, StorageError::Config(_)));
    assert_eq!(mem.eventual.node_count(), 1);

    mem.storage.reset_storage(Environment::Test, "test").await.unwrap();
    assert_eq!(mem.eventual.node_count(), 0);
    assert_eq!(mem.strong.node_count(), 0);
}

#[tokio::test]
async fn score_report_reads_aggregates() {
    let query = "MATCH (n:Observation)-[:scored_by]->(s:Score) \
         RETURN s.name AS name, avg(s.value) AS mean, count(s) AS count \
         ORDER BY name";
    let rows = vec![
        serde_json::from_value(serde_json::json!({"name": "satisfaction", "mean": 2.5, "count": 8})).unwrap(),
        serde_json::from_value(serde_json::json!({"name": "urgency", "mean": 0.75, "count": 4})).unwrap(),
    ];
    let mem = memory_storage_with(
        MemoryGraph::new(ConsistencyDomain::Eventual).on_query(query, rows),
        embedder(),
    );

    let report = ScoreReport::build(&mem.storage, NodeType::Observation).await.unwrap();

    assert_eq!(report.scores.len(), 2);
    let urgency = report.get("urgency").unwrap();
    assert_eq!(urgency.mean, 0.75);
    assert_eq!(urgency.count, 4);
}

#[tokio::test]
async fn node_refs_route_by_type() {
    let mem = memory_storage(embedder());
    let missing = NodeRef::new(APP_STATE_ID, NodeType::AppState);
    assert!(!mem.storage.node_exists(&missing.id, missing.node_type).await.unwrap());

    mem.storage.get_app_state().await.unwrap();
    assert!(mem.storage.node_exists(APP_STATE_ID, NodeType::AppState).await.unwrap());
    assert!(!mem.storage.node_exists(APP_STATE_ID, NodeType::Topic).await.unwrap());
}

#[tokio::test]
async fn refs_of_the_wrong_type_address_nothing() {
    let mem = memory_storage(embedder());
    let obs = Observation::new("Menu hard to read");
    let action = ActionItem::new("Print a larger menu");
    mem.storage.add_node(obs.clone()).await.unwrap();
    mem.storage.add_node(action.clone()).await.unwrap();

    let as_topic = NodeRef::new(obs.id.clone(), NodeType::Topic);
    assert!(!mem.storage.node_exists(&obs.id, NodeType::Topic).await.unwrap());

    mem.storage.delete_node(&as_topic).await.unwrap();
    assert!(mem.storage.node_exists(&obs.id, NodeType::Observation).await.unwrap());

    let err = mem
        .storage
        .add_edge_with_retry(&action.node_ref(), &as_topic, "addresses")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
    assert_eq!(mem.eventual.total_edges(), 0);
}

#[test]
fn hash_vectors_are_stable_unit_vectors() {
    let a = hash_vector("Tacos were great", TEST_EMBEDDING_DIM);
    let b = hash_vector("Tacos were great", TEST_EMBEDDING_DIM);
    let other = hash_vector("Parking was easy", TEST_EMBEDDING_DIM);

    assert_eq!(a, b);
    assert_ne!(a, other);
    assert_eq!(a.len(), TEST_EMBEDDING_DIM);
    let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
}
