// Test mocks for the retrieval pipeline.
//
// Three mocks matching the collaborator boundaries:
// - MockVectorSearch (VectorSearch): fixed ranked hits, call counter, failure/delay toggles
// - MockExtractor (EntityExtractor): HashMap-based query→entities
// - RecordingStore (EntityStore): records writes, can be made to fail

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use graphrag_common::{Entity, GraphRagConfig, Relationship};

use crate::traits::{EntityExtractor, EntityStore, ExtractedEntity, SeedDocument, VectorSearch};

/// Config with the graph switched on and short timeouts.
pub fn enabled_config() -> GraphRagConfig {
    GraphRagConfig {
        enabled: true,
        connection_timeout_ms: 300,
        query_timeout_ms: 300,
        collaborator_timeout_ms: 300,
        health_recheck_secs: 0,
        ..GraphRagConfig::default()
    }
}

// ---------------------------------------------------------------------------
// MockVectorSearch
// ---------------------------------------------------------------------------

/// Returns the registered documents, best first, truncated to `k`.
pub struct MockVectorSearch {
    docs: Vec<SeedDocument>,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl Default for MockVectorSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVectorSearch {
    pub fn new() -> Self {
        Self {
            docs: Vec::new(),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay: Mutex::new(None),
        }
    }

    pub fn with_doc(mut self, doc_id: &str, text: &str) -> Self {
        let score = 1.0 - self.docs.len() as f64 * 0.1;
        self.docs.push(SeedDocument::new(doc_id, text, score));
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorSearch for MockVectorSearch {
    async fn similarity_search(&self, _query: &str, k: usize) -> Result<Vec<SeedDocument>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            bail!("vector index offline");
        }
        Ok(self.docs.iter().take(k).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Query text → extracted entities. Unregistered text extracts nothing.
#[derive(Default)]
pub struct MockExtractor {
    responses: HashMap<String, Vec<ExtractedEntity>>,
    calls: AtomicUsize,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, text: &str, entities: Vec<ExtractedEntity>) -> Self {
        self.responses.insert(text.to_string(), entities);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntityExtractor for MockExtractor {
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedEntity>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.responses.get(text).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// RecordingStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingInner {
    hashes: HashMap<String, String>,
    entity_writes: Vec<Entity>,
    relationship_writes: Vec<Relationship>,
}

/// Entity store that keeps every write for inspection.
#[derive(Default)]
pub struct RecordingStore {
    inner: Mutex<RecordingInner>,
    failing: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn entity_writes(&self) -> Vec<Entity> {
        self.inner.lock().unwrap().entity_writes.clone()
    }

    pub fn relationship_writes(&self) -> Vec<Relationship> {
        self.inner.lock().unwrap().relationship_writes.clone()
    }
}

#[async_trait]
impl EntityStore for RecordingStore {
    async fn stored_hash(&self, id: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().hashes.get(id).cloned())
    }

    async fn put_entity(&self, entity: &Entity, hash: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("store write rejected");
        }
        let mut inner = self.inner.lock().unwrap();
        inner.hashes.insert(entity.id.clone(), hash.to_string());
        inner.entity_writes.push(entity.clone());
        Ok(())
    }

    async fn put_relationship(&self, rel: &Relationship) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("store write rejected");
        }
        self.inner.lock().unwrap().relationship_writes.push(rel.clone());
        Ok(())
    }
}
