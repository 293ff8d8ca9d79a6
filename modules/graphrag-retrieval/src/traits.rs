// Collaborator boundaries of the retrieval core.
//
// VectorSearch and EntityExtractor are owned by the host (embedding index, LLM).
// EntityStore is the write side used by the resolver and the graph builder;
// the retrieval hot path never writes.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use graphrag_common::{Entity, Relationship};
use graphrag_graph::{GraphWriter, MemoryGraph};

/// One ranked hit from vector search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedDocument {
    pub doc_id: String,
    pub text: String,
    #[serde(default)]
    pub score: f64,
}

impl SeedDocument {
    pub fn new(doc_id: &str, text: &str, score: f64) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            text: text.to_string(),
            score,
        }
    }
}

fn default_confidence() -> f64 {
    1.0
}

/// Raw extractor output. `entity_type` is free text until the resolver maps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

impl ExtractedEntity {
    pub fn new(entity_type: &str, name: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            name: name.to_string(),
            aliases: Vec::new(),
            confidence: 1.0,
        }
    }
}

#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Top `k` documents for `query`, best first. Assumed side-effect free.
    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<SeedDocument>>;
}

#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedEntity>>;
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Stored content hash for `id`, if the entity exists.
    async fn stored_hash(&self, id: &str) -> Result<Option<String>>;

    async fn put_entity(&self, entity: &Entity, hash: &str) -> Result<()>;

    async fn put_relationship(&self, rel: &Relationship) -> Result<()>;
}

#[async_trait]
impl EntityStore for GraphWriter {
    async fn stored_hash(&self, id: &str) -> Result<Option<String>> {
        Ok(self.entity_hash(id).await?)
    }

    async fn put_entity(&self, entity: &Entity, hash: &str) -> Result<()> {
        self.upsert_entity(entity, hash).await?;
        Ok(())
    }

    async fn put_relationship(&self, rel: &Relationship) -> Result<()> {
        self.upsert_relationship(rel).await?;
        Ok(())
    }
}

#[async_trait]
impl EntityStore for MemoryGraph {
    async fn stored_hash(&self, id: &str) -> Result<Option<String>> {
        Ok(self.entity_hash(id))
    }

    async fn put_entity(&self, entity: &Entity, hash: &str) -> Result<()> {
        self.upsert_entity(entity, hash);
        Ok(())
    }

    async fn put_relationship(&self, rel: &Relationship) -> Result<()> {
        self.insert_relationship(rel.clone());
        Ok(())
    }
}
