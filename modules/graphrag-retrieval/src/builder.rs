//! Builds graph nodes and edges from documents.
//!
//! Each document becomes a `document` entity. Explicit references to other
//! documents become `REFERENCES` edges with line provenance; known entities
//! named in the text become `MENTIONS` edges. Everything goes through the
//! resolver, so repeated builds of unchanged content write nothing.

use std::collections::HashMap;
use std::ops::AddAssign;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use graphrag_common::{Certainty, Entity, EntityType, Relationship, RelationshipType};

use crate::resolver::{contains_word, document_id, document_references, EntityResolver, PinSource};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub title: Option<String>,
    pub source: Option<String>,
}

impl Document {
    pub fn new(id: &str, content: &str) -> Self {
        Self {
            id: id.trim().to_string(),
            content: content.to_string(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn content_hash(&self) -> String {
        hex::encode(Sha256::digest(self.content.as_bytes()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BuildStats {
    pub documents: usize,
    pub unchanged: usize,
    pub entities: usize,
    pub relationships: usize,
    pub failed: usize,
}

impl AddAssign for BuildStats {
    fn add_assign(&mut self, other: Self) {
        self.documents += other.documents;
        self.unchanged += other.unchanged;
        self.entities += other.entities;
        self.relationships += other.relationships;
        self.failed += other.failed;
    }
}

/// 1-based line of the first whole-word occurrence of `needle`.
fn first_line(text: &str, needle: &str) -> Option<u32> {
    let needle = needle.to_lowercase();
    text.lines()
        .position(|line| contains_word(&line.to_lowercase(), &needle))
        .map(|idx| idx as u32 + 1)
}

pub struct GraphBuilder {
    resolver: Arc<EntityResolver>,
    content_hashes: RwLock<HashMap<String, String>>,
}

impl GraphBuilder {
    pub fn new(resolver: Arc<EntityResolver>) -> Self {
        Self {
            resolver,
            content_hashes: RwLock::new(HashMap::new()),
        }
    }

    pub fn resolver(&self) -> &Arc<EntityResolver> {
        &self.resolver
    }

    pub async fn build_from_document(&self, doc: &Document) -> Result<BuildStats> {
        if doc.id.is_empty() {
            bail!("document has no id");
        }

        let hash = doc.content_hash();
        let known = self
            .content_hashes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&doc.id)
            .cloned();
        if known.as_deref() == Some(hash.as_str()) {
            debug!(doc_id = doc.id.as_str(), "Document unchanged, skipping");
            return Ok(BuildStats {
                unchanged: 1,
                ..BuildStats::default()
            });
        }

        let mut stats = BuildStats {
            documents: 1,
            ..BuildStats::default()
        };

        let mut doc_entity = Entity::new(EntityType::Document, &doc.id, None);
        if let Some(title) = doc.title.as_deref().map(str::trim).filter(|t| !t.is_empty() && *t != doc.id) {
            doc_entity = doc_entity.with_aliases([title]);
        }
        let doc_entity_id = doc_entity.id.clone();
        if self.resolver.ingest(doc_entity).await?.upsert.changed {
            stats.entities += 1;
        }

        for reference in document_references(&doc.content) {
            let target_id = document_id(&reference.reference);
            if target_id == doc_entity_id {
                continue;
            }
            let target = Entity::new(EntityType::Document, &reference.reference, None);
            if self.resolver.ingest(target).await?.upsert.changed {
                stats.entities += 1;
            }
            let rel = Relationship::new(&doc_entity_id, RelationshipType::References, &target_id)
                .sourced_from(&doc.id, Some(reference.line))
                .with_certainty(Certainty::Supported);
            self.resolver.link(&rel).await?;
            stats.relationships += 1;
        }

        for pin in self.resolver.pin_mentions(&doc.id, &doc.content) {
            if !matches!(pin.source, PinSource::Name | PinSource::Alias) || pin.entity.entity_type == EntityType::Document
            {
                continue;
            }
            let line = first_line(&doc.content, &pin.entity.name).or_else(|| {
                pin.entity
                    .aliases
                    .iter()
                    .find_map(|alias| first_line(&doc.content, alias))
            });
            let rel = Relationship::new(&doc_entity_id, RelationshipType::Mentions, &pin.entity.id)
                .sourced_from(&doc.id, line)
                .with_certainty(Certainty::Likely);
            self.resolver.link(&rel).await?;
            stats.relationships += 1;
        }

        self.content_hashes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(doc.id.clone(), hash);

        debug!(
            doc_id = doc.id.as_str(),
            source = doc.source.as_deref().unwrap_or(""),
            entities = stats.entities,
            relationships = stats.relationships,
            "Document indexed"
        );
        Ok(stats)
    }

    /// Index every `*.md` file under `dir` (not recursive), in file name
    /// order. The file stem is the document id. A failing document is logged
    /// and counted; the rest still build.
    pub async fn build_from_directory(&self, dir: &Path) -> Result<BuildStats> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("reading corpus directory {}", dir.display()))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "md") && entry.file_type().await?.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut stats = BuildStats::default();
        for path in paths {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read document");
                    stats.failed += 1;
                    continue;
                }
            };
            let doc = Document::new(stem, &content).with_source(&path.display().to_string());
            match self.build_from_document(&doc).await {
                Ok(doc_stats) => stats += doc_stats,
                Err(e) => {
                    warn!(doc_id = stem, error = %e, "Failed to index document");
                    stats.failed += 1;
                }
            }
        }

        info!(
            dir = %dir.display(),
            documents = stats.documents,
            unchanged = stats.unchanged,
            entities = stats.entities,
            relationships = stats.relationships,
            failed = stats.failed,
            "Corpus indexed"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingStore;

    fn builder() -> (GraphBuilder, Arc<RecordingStore>) {
        let store = Arc::new(RecordingStore::new());
        let resolver = Arc::new(EntityResolver::with_store(store.clone()));
        (GraphBuilder::new(resolver), store)
    }

    #[tokio::test]
    async fn references_carry_line_provenance() {
        let (builder, store) = builder();
        let doc = Document::new("ADR-002", "# Gateway\n\nSupersedes ADR-001.\nSee INC-7 too.");
        let stats = builder.build_from_document(&doc).await.unwrap();

        assert_eq!(stats.documents, 1);
        assert_eq!(stats.entities, 3);
        let rels = store.relationship_writes();
        assert_eq!(rels.len(), 2);
        assert_eq!(rels[0].target_id, "document:adr_001");
        assert_eq!(rels[0].source_line, Some(3));
        assert_eq!(rels[1].target_id, "document:inc_7");
        assert_eq!(rels[1].source_doc.as_deref(), Some("ADR-002"));
    }

    #[tokio::test]
    async fn known_entities_get_mentions_edges() {
        let (builder, store) = builder();
        builder
            .resolver()
            .insert_known(Entity::new(EntityType::System, "Auth Service", None));

        builder
            .build_from_document(&Document::new("notes", "line one\nthe auth service is slow"))
            .await
            .unwrap();

        let rels = store.relationship_writes();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].rel_type, RelationshipType::Mentions);
        assert_eq!(rels[0].target_id, "system:auth_service");
        assert_eq!(rels[0].source_line, Some(2));
    }

    #[tokio::test]
    async fn unchanged_document_writes_nothing() {
        let (builder, store) = builder();
        let doc = Document::new("ADR-003", "refs ADR-001");
        builder.build_from_document(&doc).await.unwrap();
        let writes = store.entity_writes().len();

        let again = builder.build_from_document(&doc).await.unwrap();
        assert_eq!(again.unchanged, 1);
        assert_eq!(store.entity_writes().len(), writes);
    }

    #[tokio::test]
    async fn failing_store_surfaces_error() {
        let (builder, store) = builder();
        store.set_failing(true);
        assert!(builder
            .build_from_document(&Document::new("ADR-004", "text"))
            .await
            .is_err());
        assert!(builder.resolver().is_empty());
    }

    #[tokio::test]
    async fn directory_build_uses_file_stems() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ADR-001.md"), "Gateway decision").unwrap();
        std::fs::write(dir.path().join("INC-002.md"), "Caused by ADR-001").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let (builder, _store) = builder();
        let stats = builder.build_from_directory(dir.path()).await.unwrap();
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.failed, 0);
        assert!(builder.resolver().get("document:inc_002").is_some());
        assert!(builder.resolver().get("document:notes").is_none());
    }
}
