//! Templates, writer and connector against a real Neo4j instance.
//!
//! Requirements: Docker (for Neo4j via testcontainers)
//!
//! Run with: cargo test -p graphrag-graph --features test-utils --test neo4j_test

#![cfg(feature = "test-utils")]

use std::sync::Arc;

use serde_json::{json, Value};

use graphrag_common::{Entity, EntityType, GraphRagConfig, Relationship, RelationshipType};
use graphrag_graph::testutil::snapshot;
use graphrag_graph::{
    EdgeRow, GraphBackend, GraphClient, GraphStore, GraphWriter, Neo4jStore, QueryOutcome, TemplateName,
};

async fn setup() -> (impl std::any::Any, String, GraphClient) {
    let (container, uri, client) = graphrag_graph::testutil::neo4j_container().await;
    graphrag_graph::migrate::migrate(&client)
        .await
        .expect("migration failed");
    (container, uri, client)
}

async fn seed(writer: &GraphWriter) {
    let gateway = Entity::new(EntityType::System, "Gateway", None).with_aliases(["gw"]);
    let auth = Entity::new(EntityType::System, "Auth Service", None);
    let token = Entity::new(EntityType::Concept, "Token Cache", None);
    for e in [&gateway, &auth, &token] {
        writer.upsert_entity(e, &e.content_hash()).await.unwrap();
    }
    writer
        .upsert_relationship(
            &Relationship::new(&gateway.id, RelationshipType::DependsOn, &auth.id)
                .sourced_from("document:adr_001", Some(12)),
        )
        .await
        .unwrap();
    writer
        .upsert_relationship(&Relationship::new(&auth.id, RelationshipType::Contains, &token.id))
        .await
        .unwrap();
}

#[tokio::test]
async fn migrate_is_idempotent() {
    let (_container, _uri, client) = setup().await;
    graphrag_graph::migrate::migrate(&client).await.unwrap();
}

#[tokio::test]
async fn upsert_skips_unchanged_entities() {
    let (_container, _uri, client) = setup().await;
    let writer = GraphWriter::new(client);
    let e = Entity::new(EntityType::Person, "Alice Smith", None);

    assert!(writer.upsert_entity(&e, &e.content_hash()).await.unwrap());
    assert!(!writer.upsert_entity(&e, &e.content_hash()).await.unwrap());
    assert_eq!(writer.entity_count().await.unwrap(), 1);
    assert_eq!(writer.entity_hash(&e.id).await.unwrap(), Some(e.content_hash()));
}

#[tokio::test]
async fn expand_neighbors_returns_shortest_paths() {
    let (_container, _uri, client) = setup().await;
    let writer = GraphWriter::new(client.clone());
    seed(&writer).await;

    let store = Neo4jStore::from_client(client, "neo4j");
    let query = graphrag_graph::validate("expand_neighbors", &json!({"entity_id": "system:gateway"})).unwrap();
    let rows = store.fetch(&query).await.unwrap();

    let ids: Vec<&str> = rows.iter().filter_map(|r| r.get_str("neighbor_id")).collect();
    assert_eq!(ids, vec!["system:auth_service", "concept:token_cache"]);

    let edges: Vec<EdgeRow> = rows[0].get_as("edges").unwrap();
    assert_eq!(edges[0].rel_type, "DEPENDS_ON");
    assert_eq!(edges[0].source_doc(), Some("document:adr_001"));
    assert_eq!(edges[0].source_line(), Some(12));
}

fn sample_params(template: TemplateName) -> Value {
    match template {
        TemplateName::HealthCheck => json!({}),
        TemplateName::EntityLookup => json!({"entity_ids": ["system:gateway", "system:auth_service"]}),
        TemplateName::ExpandNeighbors => json!({"entity_id": "system:gateway"}),
        TemplateName::RelatedDocuments => json!({"doc_id": "document:adr_001"}),
        TemplateName::EntityCatalog => json!({"after": ""}),
    }
}

#[tokio::test]
async fn registered_templates_leave_the_database_untouched() {
    let (_container, _uri, client) = setup().await;
    let writer = GraphWriter::new(client.clone());
    seed(&writer).await;
    let adr = Entity::new(EntityType::Document, "ADR-001", None);
    writer.upsert_entity(&adr, &adr.content_hash()).await.unwrap();

    let before = snapshot(&client).await;
    assert_eq!(before.nodes, 4);
    assert_eq!(before.relationships, 2);

    let store = Neo4jStore::from_client(client.clone(), "neo4j");
    for template in TemplateName::ALL {
        let query = graphrag_graph::validate(template.as_str(), &sample_params(template)).unwrap();
        for _ in 0..2 {
            store.fetch(&query).await.unwrap();
        }
    }

    assert_eq!(snapshot(&client).await, before);
}

#[tokio::test]
async fn diamond_expansion_is_stable() {
    let (_container, _uri, client) = setup().await;
    let writer = GraphWriter::new(client.clone());
    for name in ["a", "b", "c", "d"] {
        let e = Entity::new(EntityType::System, name, None);
        writer.upsert_entity(&e, &e.content_hash()).await.unwrap();
    }
    for (s, t) in [("c", "d"), ("a", "c"), ("b", "d"), ("a", "b")] {
        writer
            .upsert_relationship(&Relationship::new(
                &format!("system:{s}"),
                RelationshipType::DependsOn,
                &format!("system:{t}"),
            ))
            .await
            .unwrap();
    }

    let store = Neo4jStore::from_client(client, "neo4j");
    let query = graphrag_graph::validate("expand_neighbors", &json!({"entity_id": "system:a"})).unwrap();
    for _ in 0..5 {
        let rows = store.fetch(&query).await.unwrap();
        let ids: Vec<&str> = rows.iter().filter_map(|r| r.get_str("neighbor_id")).collect();
        assert_eq!(ids, vec!["system:b", "system:c", "system:d"]);

        let edges: Vec<EdgeRow> = rows[2].get_as("edges").unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].target, "system:b");
        assert_eq!(edges[1].source, "system:b");
    }
}

#[tokio::test]
async fn catalog_lists_non_document_entities_in_pages() {
    let (_container, _uri, client) = setup().await;
    let writer = GraphWriter::new(client.clone());
    seed(&writer).await;
    let adr = Entity::new(EntityType::Document, "ADR-001", None);
    writer.upsert_entity(&adr, &adr.content_hash()).await.unwrap();

    let store = Neo4jStore::from_client(client, "neo4j");
    let first = graphrag_graph::validate("entity_catalog", &json!({"limit": 2})).unwrap();
    let rows = store.fetch(&first).await.unwrap();
    let ids: Vec<&str> = rows.iter().filter_map(|r| r.get_str("id")).collect();
    assert_eq!(ids, vec!["concept:token_cache", "system:auth_service"]);

    let next = graphrag_graph::validate("entity_catalog", &json!({"after": "system:auth_service"})).unwrap();
    let rows = store.fetch(&next).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_str("id"), Some("system:gateway"));
    assert_eq!(rows[0].get_str_list("aliases"), vec!["gw"]);
}

#[tokio::test]
async fn connector_reports_available_and_answers() {
    let (_container, uri, client) = setup().await;
    seed(&GraphWriter::new(client)).await;

    let config = GraphRagConfig {
        enabled: true,
        neo4j_uri: uri,
        neo4j_password: graphrag_graph::testutil::TEST_PASSWORD.to_string(),
        ..GraphRagConfig::default()
    };
    let backend = GraphBackend::probe(&config).await;
    let connector = backend.connector().cloned().expect("present");
    assert!(connector.is_available());

    let outcome = connector
        .run_query("entity_lookup", &json!({"entity_ids": ["system:gateway", "system:nope"]}))
        .await
        .unwrap();
    match outcome {
        QueryOutcome::Available { records, .. } => {
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].get_str("name"), Some("Gateway"));
        }
        other => panic!("unexpected {other:?}"),
    }
    connector.close().await;
}

#[tokio::test]
async fn unreachable_neo4j_is_present_but_unavailable() {
    let config = GraphRagConfig {
        enabled: true,
        neo4j_uri: "bolt://127.0.0.1:1".to_string(),
        connection_timeout_ms: 500,
        ..GraphRagConfig::default()
    };
    let backend = GraphBackend::probe(&config).await;
    let connector: Arc<_> = backend.connector().cloned().expect("present");
    assert!(!connector.is_available());
    assert_eq!(connector.status().state, "unavailable");
}
