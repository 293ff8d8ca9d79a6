//! Test utilities for spinning up a real Neo4j instance via testcontainers.

use testcontainers::{
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};

use crate::GraphClient;

pub const TEST_PASSWORD: &str = "testpassword";

/// Spin up a Neo4j container and return the container handle, its bolt URI and
/// a connected GraphClient.
///
/// The container is stopped when `ContainerAsync` is dropped, so callers must
/// hold it for the duration of the test.
pub async fn neo4j_container() -> (ContainerAsync<GenericImage>, String, GraphClient) {
    let image = GenericImage::new("neo4j", "5.25.1")
        .with_exposed_port(ContainerPort::Tcp(7687))
        .with_wait_for(WaitFor::message_on_stdout("Started."))
        .with_env_var("NEO4J_AUTH", format!("neo4j/{TEST_PASSWORD}"));

    let container: ContainerAsync<GenericImage> = image
        .start()
        .await
        .expect("Failed to start Neo4j container");

    let host_port = container
        .get_host_port_ipv4(7687)
        .await
        .expect("Failed to get Neo4j host port");

    let uri = format!("bolt://127.0.0.1:{host_port}");
    let client = GraphClient::connect(&uri, "neo4j", TEST_PASSWORD, "neo4j")
        .await
        .expect("Failed to connect to Neo4j");

    (container, uri, client)
}

/// Node and relationship counts plus per-item property digests, ordered, so
/// two snapshots compare equal only if nothing was written in between.
#[derive(Debug, PartialEq, Eq)]
pub struct GraphSnapshot {
    pub nodes: i64,
    pub relationships: i64,
    pub node_rows: Vec<String>,
    pub edge_rows: Vec<String>,
}

pub async fn snapshot(client: &GraphClient) -> GraphSnapshot {
    let (nodes, node_rows) = count_and_rows(
        client,
        "MATCH (n)
         WITH n ORDER BY n.id
         RETURN count(n) AS n,
                collect(coalesce(n.id, '') + '|' + coalesce(n.name, '') + '|' +
                        coalesce(n.content_hash, '') + '|' + toString(size(keys(n))) + '|' +
                        coalesce(toString(n.updated_at), '')) AS rows",
    )
    .await;
    let (relationships, edge_rows) = count_and_rows(
        client,
        "MATCH (s)-[r]->(t)
         WITH s, r, t ORDER BY s.id, type(r), t.id
         RETURN count(r) AS n,
                collect(coalesce(s.id, '') + '-' + type(r) + '->' + coalesce(t.id, '') + '|' +
                        coalesce(r.certainty, '') + '|' + coalesce(r.source_doc, '') + '|' +
                        toString(size(keys(r)))) AS rows",
    )
    .await;
    GraphSnapshot {
        nodes,
        relationships,
        node_rows,
        edge_rows,
    }
}

async fn count_and_rows(client: &GraphClient, cypher: &str) -> (i64, Vec<String>) {
    let mut stream = client
        .graph
        .execute(neo4rs::query(cypher))
        .await
        .expect("snapshot query failed");
    let row = stream
        .next()
        .await
        .expect("snapshot stream failed")
        .expect("snapshot returned no row");
    (
        row.get::<i64>("n").expect("count column"),
        row.get::<Vec<String>>("rows").expect("rows column"),
    )
}
