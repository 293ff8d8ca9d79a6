//! In-process graph store used by tests and local runs without Neo4j.
//!
//! Answers the same templates as [`Neo4jStore`](crate::Neo4jStore) with the same
//! ordering, and can be told to go offline, stall or fail for chosen entities.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use graphrag_common::{Entity, EntityType, Relationship, RelationshipType};

use crate::engine::{BoundQuery, ExpandNeighborsParams};
use crate::store::{EdgeRow, GraphStore, Record, StoreError};

#[derive(Default)]
struct State {
    entities: BTreeMap<String, Entity>,
    hashes: HashMap<String, String>,
    relationships: Vec<Relationship>,
}

#[derive(Default)]
struct Faults {
    delay: Option<Duration>,
    failing: HashSet<String>,
    stalled: HashSet<String>,
}

pub struct MemoryGraph {
    state: RwLock<State>,
    faults: Mutex<Faults>,
    reachable: AtomicBool,
    fetches: AtomicUsize,
    writes: AtomicUsize,
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            faults: Mutex::new(Faults::default()),
            reachable: AtomicBool::new(true),
            fetches: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Insert or replace an entity. Returns false when the stored hash already matches.
    pub fn upsert_entity(&self, entity: &Entity, hash: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.hashes.get(&entity.id).map(String::as_str) == Some(hash) {
            return false;
        }
        state.entities.insert(entity.id.clone(), entity.clone());
        state.hashes.insert(entity.id.clone(), hash.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub fn insert_entity(&self, entity: Entity) {
        let hash = entity.content_hash();
        self.upsert_entity(&entity, &hash);
    }

    /// Add an edge, replacing any edge with the same endpoints and type.
    pub fn insert_relationship(&self, rel: Relationship) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.relationships.retain(|r| r.key() != rel.key());
        state.relationships.push(rel);
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn entity(&self, id: &str) -> Option<Entity> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.entities.get(id).cloned()
    }

    pub fn entity_hash(&self, id: &str) -> Option<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.hashes.get(id).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.state.read().unwrap_or_else(|e| e.into_inner()).entities.len()
    }

    pub fn relationships(&self) -> Vec<Relationship> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .relationships
            .clone()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay every fetch by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).delay = delay;
    }

    /// Expansions starting at `entity_id` fail with a query error.
    pub fn fail_on(&self, entity_id: &str) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .failing
            .insert(entity_id.to_string());
    }

    /// Expansions starting at `entity_id` never answer.
    pub fn stall_on(&self, entity_id: &str) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stalled
            .insert(entity_id.to_string());
    }

    /// Number of template queries received, including failed ones.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn expand(&self, p: &ExpandNeighborsParams) -> Vec<Record> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if !state.entities.contains_key(&p.entity_id) {
            return Vec::new();
        }

        let allowed: HashSet<RelationshipType> = p.relationships.iter().copied().collect();
        let mut adjacency: HashMap<&str, Vec<(&str, &Relationship)>> = HashMap::new();
        for rel in state.relationships.iter().filter(|r| allowed.contains(&r.rel_type)) {
            adjacency
                .entry(rel.source_id.as_str())
                .or_default()
                .push((rel.target_id.as_str(), rel));
            adjacency
                .entry(rel.target_id.as_str())
                .or_default()
                .push((rel.source_id.as_str(), rel));
        }
        for edges in adjacency.values_mut() {
            edges.sort_by(|a, b| a.0.cmp(b.0).then(a.1.rel_type.as_str().cmp(b.1.rel_type.as_str())));
        }

        // Breadth-first over id-sorted adjacency, so the first path reaching a
        // node is the shortest one with the smallest node ids.
        let mut paths: HashMap<&str, Vec<&Relationship>> = HashMap::new();
        paths.insert(p.entity_id.as_str(), Vec::new());
        let mut frontier = VecDeque::from([p.entity_id.as_str()]);
        while let Some(node) = frontier.pop_front() {
            let path = paths[node].clone();
            if path.len() >= p.max_hops as usize {
                continue;
            }
            for (next, rel) in adjacency.get(node).into_iter().flatten() {
                if paths.contains_key(next) || !state.entities.contains_key(*next) {
                    continue;
                }
                let mut extended = path.clone();
                extended.push(*rel);
                paths.insert(*next, extended);
                frontier.push_back(*next);
            }
        }

        let mut rows: Vec<(usize, &str, Vec<&Relationship>)> = paths
            .into_iter()
            .filter(|(id, _)| *id != p.entity_id)
            .map(|(id, path)| (path.len(), id, path))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(b.1)));

        rows.into_iter()
            .take(p.limit as usize)
            .map(|(hops, id, path)| {
                let neighbor = &state.entities[id];
                let edges: Vec<EdgeRow> = path.into_iter().map(edge_row).collect();
                Record::new()
                    .with("neighbor_id", neighbor.id.as_str())
                    .with("neighbor_name", neighbor.name.as_str())
                    .with("neighbor_type", neighbor.entity_type.as_str())
                    .with("hops", hops as i64)
                    .with("edges", serde_json::to_value(edges).unwrap_or(Value::Null))
            })
            .collect()
    }
}

fn edge_row(rel: &Relationship) -> EdgeRow {
    EdgeRow {
        source: rel.source_id.clone(),
        rel_type: rel.rel_type.as_str().to_string(),
        target: rel.target_id.clone(),
        certainty: rel.certainty.as_str().to_string(),
        source_doc: rel.source_doc.clone().unwrap_or_default(),
        source_line: rel.source_line.map(i64::from).unwrap_or(0),
        conflict_doc: rel.conflict_doc.clone().unwrap_or_default(),
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn fetch(&self, query: &BoundQuery) -> Result<Vec<Record>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let (delay, fail, stall) = {
            let faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
            let target = match query {
                BoundQuery::ExpandNeighbors(p) => Some(p.entity_id.as_str()),
                _ => None,
            };
            (
                faults.delay,
                target.is_some_and(|t| faults.failing.contains(t)),
                target.is_some_and(|t| faults.stalled.contains(t)),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if stall {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(StoreError::Connectivity("memory graph offline".to_string()));
        }
        if fail {
            return Err(StoreError::Query("injected expansion failure".to_string()));
        }

        let records = match query {
            BoundQuery::HealthCheck => vec![Record::new().with("health", 1)],
            BoundQuery::EntityLookup(p) => {
                let state = self.state.read().unwrap_or_else(|e| e.into_inner());
                let wanted: HashSet<&str> = p.entity_ids.iter().map(String::as_str).collect();
                state
                    .entities
                    .values()
                    .filter(|e| wanted.contains(e.id.as_str()))
                    .take(p.limit as usize)
                    .map(|e| {
                        Record::new()
                            .with("id", e.id.as_str())
                            .with("name", e.name.as_str())
                            .with("type", e.entity_type.as_str())
                            .with("confidence", e.confidence)
                    })
                    .collect()
            }
            BoundQuery::ExpandNeighbors(p) => self.expand(p),
            BoundQuery::EntityCatalog(p) => {
                let state = self.state.read().unwrap_or_else(|e| e.into_inner());
                state
                    .entities
                    .values()
                    .filter(|e| e.id.as_str() > p.after.as_str() && e.entity_type != EntityType::Document)
                    .take(p.limit as usize)
                    .map(|e| {
                        Record::new()
                            .with("id", e.id.as_str())
                            .with("name", e.name.as_str())
                            .with("type", e.entity_type.as_str())
                            .with("aliases", e.aliases.iter().cloned().collect::<Vec<String>>())
                            .with("confidence", e.confidence)
                    })
                    .collect()
            }
            BoundQuery::RelatedDocuments(p) => {
                let state = self.state.read().unwrap_or_else(|e| e.into_inner());
                let mut related: Vec<&Entity> = state
                    .relationships
                    .iter()
                    .filter(|r| r.rel_type == RelationshipType::References && r.source_id == p.doc_id)
                    .filter_map(|r| state.entities.get(&r.target_id))
                    .filter(|e| e.entity_type == EntityType::Document)
                    .collect();
                related.sort_by(|a, b| a.id.cmp(&b.id));
                related.dedup_by(|a, b| a.id == b.id);
                related
                    .into_iter()
                    .take(p.limit as usize)
                    .map(|e| Record::new().with("doc_id", e.id.as_str()).with("name", e.name.as_str()))
                    .collect()
            }
        };
        Ok(records)
    }

    async fn close(&self) {}

    fn describe(&self) -> String {
        "in-memory graph".to_string()
    }
}
