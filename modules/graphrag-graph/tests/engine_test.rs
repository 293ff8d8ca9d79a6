//! Safe query engine behavior against the in-memory graph.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use graphrag_common::{Entity, EntityType, Relationship, RelationshipType, ValidationError};
use graphrag_graph::{
    BoundQuery, EdgeRow, ExpandNeighborsParams, GraphStore, MemoryGraph, SafeQueryEngine,
    StoreError, TemplateName,
};

fn engine(graph: Arc<MemoryGraph>) -> SafeQueryEngine {
    SafeQueryEngine::new(graph, Duration::from_millis(250)).expect("registry passes audit")
}

/// A hub with many spokes, each spoke with a further leaf, plus a three-hop tail.
fn star_graph(spokes: usize) -> Arc<MemoryGraph> {
    let g = Arc::new(MemoryGraph::new());
    g.insert_entity(Entity::new(EntityType::System, "hub", None));
    for i in 0..spokes {
        let spoke = Entity::new(EntityType::System, &format!("spoke {i:03}"), None);
        let leaf = Entity::new(EntityType::Concept, &format!("leaf {i:03}"), None);
        g.insert_relationship(Relationship::new("system:hub", RelationshipType::DependsOn, &spoke.id));
        g.insert_relationship(Relationship::new(&spoke.id, RelationshipType::Contains, &leaf.id));
        g.insert_entity(spoke);
        g.insert_entity(leaf);
    }
    for name in ["t1", "t2", "t3"] {
        g.insert_entity(Entity::new(EntityType::Incident, name, None));
    }
    g.insert_relationship(Relationship::new("system:hub", RelationshipType::Affects, "incident:t1"));
    g.insert_relationship(Relationship::new("incident:t1", RelationshipType::CausedBy, "incident:t2"));
    g.insert_relationship(Relationship::new("incident:t2", RelationshipType::CausedBy, "incident:t3"));
    g
}

#[tokio::test]
async fn expansion_never_exceeds_two_hops_or_limit() {
    let graph = star_graph(120);
    let engine = engine(graph.clone());

    let bound = engine
        .validate(
            "expand_neighbors",
            &json!({"entity_id": "system:hub", "max_hops": 10, "limit": 1000}),
        )
        .unwrap();
    let result = engine.execute(&bound).await.unwrap();

    assert_eq!(result.records.len(), 100);
    for record in &result.records {
        let hops = record.get_i64("hops").unwrap();
        assert!((1..=2).contains(&hops));
        let edges: Vec<EdgeRow> = record.get_as("edges").unwrap();
        assert_eq!(edges.len() as i64, hops);
    }
    assert!(result
        .records
        .iter()
        .all(|r| r.get_str("neighbor_id") != Some("incident:t3")));
}

#[tokio::test]
async fn ordering_is_stable_for_identical_inputs() {
    let graph = star_graph(30);
    let engine = engine(graph);
    let bound = BoundQuery::ExpandNeighbors(ExpandNeighborsParams::new("system:hub").limit(40));

    let first = engine.execute(&bound).await.unwrap();
    let second = engine.execute(&bound).await.unwrap();
    assert_eq!(first.records, second.records);

    let hops: Vec<i64> = first.records.iter().filter_map(|r| r.get_i64("hops")).collect();
    let mut sorted = hops.clone();
    sorted.sort();
    assert_eq!(hops, sorted);
}

// Write-freedom against a real database is covered in neo4j_test.rs.
#[tokio::test]
async fn every_template_runs_through_the_engine() {
    let graph = star_graph(5);
    let engine = engine(graph.clone());

    let calls = [
        ("health_check", json!({}), 1),
        ("entity_lookup", json!({"entity_ids": ["system:hub", "system:spoke_000"], "limit": 5000}), 2),
        ("expand_neighbors", json!({"entity_id": "system:hub", "relationships": ["DEPENDS_ON"]}), 5),
        ("related_documents", json!({"doc_id": "document:adr_001"}), 0),
        ("entity_catalog", json!({"limit": 3}), 3),
    ];
    assert_eq!(calls.len(), TemplateName::ALL.len());
    for (name, params, rows) in calls {
        let bound = engine.validate(name, &params).unwrap();
        let result = engine.execute(&bound).await.unwrap();
        assert_eq!(result.records.len(), rows, "{name}");
    }
    assert_eq!(graph.fetch_count(), TemplateName::ALL.len());
}

#[tokio::test]
async fn relationship_filter_narrows_traversal() {
    let graph = star_graph(3);
    let engine = engine(graph);
    let bound = engine
        .validate(
            "expand_neighbors",
            &json!({"entity_id": "system:hub", "relationships": ["AFFECTS", "CAUSED_BY"]}),
        )
        .unwrap();
    let result = engine.execute(&bound).await.unwrap();
    let ids: Vec<&str> = result.records.iter().filter_map(|r| r.get_str("neighbor_id")).collect();
    assert_eq!(ids, vec!["incident:t1", "incident:t2"]);
}

#[tokio::test]
async fn scenario_d_limit_is_clamped() {
    let bound = graphrag_graph::validate("entity_lookup", &json!({"entity_ids": [], "limit": 5000})).unwrap();
    assert_eq!(bound.template(), TemplateName::EntityLookup);
    assert_eq!(bound.limit(), 100);
}

#[tokio::test]
async fn scenario_e_unknown_template() {
    let engine = engine(Arc::new(MemoryGraph::new()));
    let err = engine.validate("drop_everything", &json!({})).unwrap_err();
    assert!(matches!(err, ValidationError::UnknownTemplate(name) if name == "drop_everything"));
}

#[tokio::test]
async fn stalled_store_hits_query_timeout() {
    let graph = star_graph(1);
    graph.stall_on("system:hub");
    let engine = engine(graph);

    let started = std::time::Instant::now();
    let err = engine
        .execute(&BoundQuery::ExpandNeighbors(ExpandNeighborsParams::new("system:hub")))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::Timeout(250));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn related_documents_follow_references_only() {
    let graph = Arc::new(MemoryGraph::new());
    for name in ["adr_001", "adr_002", "inc_007"] {
        graph.insert_entity(Entity::new(EntityType::Document, name, None));
    }
    graph.insert_entity(Entity::new(EntityType::System, "gateway", None));
    graph.insert_relationship(Relationship::new("document:adr_001", RelationshipType::References, "document:inc_007"));
    graph.insert_relationship(Relationship::new("document:adr_001", RelationshipType::References, "document:adr_002"));
    graph.insert_relationship(Relationship::new("document:adr_001", RelationshipType::Mentions, "system:gateway"));

    let rows = graph
        .fetch(&graphrag_graph::validate("related_documents", &json!({"doc_id": "document:adr_001"})).unwrap())
        .await
        .unwrap();
    let ids: Vec<&str> = rows.iter().filter_map(|r| r.get_str("doc_id")).collect();
    assert_eq!(ids, vec!["document:adr_002", "document:inc_007"]);
}
