//! Test utilities for spinning up a real Neo4j instance via testcontainers.

use testcontainers::{
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};

use feedback_common::{ConsistencyDomain, GraphEndpoint};

use crate::GraphClient;

const NEO4J_PASSWORD: &str = "feedback-test";

/// Spin up a Neo4j container and return the container handle + connected GraphClient.
///
/// The container is dropped (and stopped) when `ContainerAsync` goes out of scope,
/// so callers must hold it alive for the duration of the test.
pub async fn neo4j_container(domain: ConsistencyDomain) -> (ContainerAsync<GenericImage>, GraphClient) {
    let image = GenericImage::new("neo4j", "5.25.1")
        .with_exposed_port(ContainerPort::Tcp(7687))
        .with_wait_for(WaitFor::message_on_stdout("Started."))
        .with_env_var("NEO4J_AUTH", format!("neo4j/{NEO4J_PASSWORD}"));

    let container: ContainerAsync<GenericImage> = image
        .start()
        .await
        .expect("Failed to start Neo4j container");

    let host_port = container
        .get_host_port_ipv4(7687)
        .await
        .expect("Failed to get Neo4j host port");

    let endpoint = GraphEndpoint {
        uri: format!("bolt://127.0.0.1:{host_port}"),
        user: "neo4j".to_string(),
        password: NEO4J_PASSWORD.to_string(),
        database: "neo4j".to_string(),
    };
    let client = GraphClient::connect(&endpoint, domain)
        .await
        .expect("Failed to connect to Neo4j");

    (container, client)
}
