//! Entity resolution: stable ids, duplicate tiers and the human review queue.
//!
//! Tiers are applied in order and the first match wins:
//! 1. exact normalized id
//! 2. explicit `SAME_AS` link at or above the merge threshold
//! 3. fuzzy name match (Levenshtein, same type) which is queued, never merged
//! 4. distinct

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock, RwLock};

use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use graphrag_common::identity::canonical_name;
use graphrag_common::{normalize_entity_id, Entity, EntityType, Relationship, RelationshipType};
use graphrag_graph::templates::MAX_TEMPLATE_RESULTS;
use graphrag_graph::{BoundQuery, EntityCatalogParams, GraphConnector, QueryOutcome, Record, UnavailableReason};

use crate::traits::{EntityStore, ExtractedEntity};

/// Minimum confidence for a `SAME_AS` link to merge.
pub const SAME_AS_THRESHOLD: f64 = 0.9;
/// Largest edit distance between canonical names that is queued for review.
pub const FUZZY_MAX_DISTANCE: usize = 2;
// Shorter names match too much to be worth a review item.
const FUZZY_MIN_LEN: usize = 4;
// Catalog pages read per hydration.
const MAX_CATALOG_PAGES: usize = 50;

static DOCUMENT_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:(?:ADR|INC|CHG)-\d+|MEETING-\d{4}-\d{2}-\d{2})\b").expect("valid reference regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeTier {
    Exact,
    SameAs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Merged { id: String, via: MergeTier },
    Ambiguous { candidate: String, existing: String, distance: usize },
    Distinct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UpsertOutcome {
    pub created: bool,
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    /// Id the entity ended up under, after merging.
    pub id: String,
    pub upsert: UpsertOutcome,
    pub queued_for_review: bool,
}

/// A candidate that looked like an existing entity but was not merged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewItem {
    pub candidate: Entity,
    pub existing_id: String,
    pub distance: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Merge,
    Distinct,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SameAsLink {
    pub canonical_id: String,
    pub confidence: f64,
    pub provenance: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PinSource {
    Name,
    Alias,
    DocumentReference,
    SeedDocument,
    Extracted,
}

/// An entity linked to the text that mentioned it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PinnedEntity {
    pub entity: Entity,
    pub mentioned_in: Vec<String>,
    pub source: PinSource,
}

/// A document reference found in text, with its first 1-based line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentReference {
    pub reference: String,
    pub line: u32,
}

/// Entity id for a document reference or doc id.
pub fn document_id(reference: &str) -> String {
    normalize_entity_id(EntityType::Document, reference, None)
}

/// Find `ADR-n`, `INC-n`, `CHG-n` and `MEETING-YYYY-MM-DD` references, first
/// occurrence of each, in order of appearance.
pub fn document_references(text: &str) -> Vec<DocumentReference> {
    let mut seen = BTreeSet::new();
    let mut refs = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        for m in DOCUMENT_REF_RE.find_iter(line) {
            if seen.insert(m.as_str().to_string()) {
                refs.push(DocumentReference {
                    reference: m.as_str().to_string(),
                    line: idx as u32 + 1,
                });
            }
        }
    }
    refs
}

/// Case-insensitive whole-word containment. Both sides must already be lowercase.
pub(crate) fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
    })
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Map extractor output onto the closed entity type set.
pub fn entity_from_extracted(extracted: &ExtractedEntity) -> Entity {
    let entity_type = extracted.entity_type.parse().unwrap_or_else(|_| {
        warn!(
            entity_type = extracted.entity_type.as_str(),
            name = extracted.name.as_str(),
            "Unknown entity type, using concept"
        );
        EntityType::Concept
    });
    Entity::new(entity_type, &extracted.name, None)
        .with_aliases(extracted.aliases.iter().map(|a| a.trim().to_string()).filter(|a| !a.is_empty()))
        .with_confidence(extracted.confidence)
}

#[derive(Default)]
struct ResolverState {
    entities: BTreeMap<String, Entity>,
    hashes: BTreeMap<String, String>,
    same_as: BTreeMap<String, SameAsLink>,
    reviews: Vec<ReviewItem>,
}

impl ResolverState {
    /// Follow a qualifying `SAME_AS` link to the entity it merges into.
    fn canonical_id<'a>(&'a self, id: &'a str, threshold: f64) -> &'a str {
        match self.same_as.get(id) {
            Some(link) if link.confidence >= threshold && self.entities.contains_key(&link.canonical_id) => {
                &link.canonical_id
            }
            _ => id,
        }
    }
}

pub struct EntityResolver {
    state: RwLock<ResolverState>,
    store: Option<Arc<dyn EntityStore>>,
}

impl Default for EntityResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityResolver {
    /// In-memory resolver with no backing store.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ResolverState::default()),
            store: None,
        }
    }

    pub fn with_store(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    pub fn normalize(entity_type: EntityType, name: &str, namespace: Option<&str>) -> String {
        normalize_entity_id(entity_type, name, namespace)
    }

    pub fn get(&self, id: &str) -> Option<Entity> {
        self.read().entities.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register an entity in the index without writing it anywhere.
    pub fn insert_known(&self, entity: Entity) {
        let hash = entity.content_hash();
        let mut state = self.write();
        state.hashes.insert(entity.id.clone(), hash);
        state.entities.insert(entity.id.clone(), entity);
    }

    /// Load the entities the graph already holds through the read-only
    /// `entity_catalog` template, one keyset page at a time. Entities already
    /// in the index are left as they are. Returns how many were added.
    pub async fn hydrate_from(&self, connector: &GraphConnector) -> Result<usize, UnavailableReason> {
        let mut after = String::new();
        let mut added = 0;

        for _ in 0..MAX_CATALOG_PAGES {
            let query =
                BoundQuery::EntityCatalog(EntityCatalogParams::first_page(MAX_TEMPLATE_RESULTS).after(&after)).bounded();
            let records = match connector.run_bound(&query).await {
                QueryOutcome::Available { records, .. } => records,
                QueryOutcome::Unavailable { reason } => return Err(reason),
            };

            for record in &records {
                if let Some(id) = record.get_str("id") {
                    after = id.to_string();
                }
                let Some(entity) = entity_from_catalog(record) else {
                    continue;
                };
                let mut state = self.write();
                if !state.entities.contains_key(&entity.id) {
                    state.hashes.insert(entity.id.clone(), entity.content_hash());
                    state.entities.insert(entity.id.clone(), entity);
                    added += 1;
                }
            }

            if records.len() < query.limit() {
                info!(added, known = self.len(), "Resolver hydrated from graph");
                return Ok(added);
            }
        }

        warn!(
            added,
            pages = MAX_CATALOG_PAGES,
            after = after.as_str(),
            "Entity catalog larger than hydration cap, remainder not loaded"
        );
        Ok(added)
    }

    /// Classify a candidate against the index. Pure lookup, no writes.
    pub fn resolve(&self, candidate: &Entity) -> Resolution {
        let state = self.read();

        if state.entities.contains_key(&candidate.id) {
            return Resolution::Merged {
                id: candidate.id.clone(),
                via: MergeTier::Exact,
            };
        }

        let canonical = state.canonical_id(&candidate.id, SAME_AS_THRESHOLD);
        if canonical != candidate.id {
            return Resolution::Merged {
                id: canonical.to_string(),
                via: MergeTier::SameAs,
            };
        }

        if candidate.entity_type == EntityType::Document {
            return Resolution::Distinct;
        }
        let name = canonical_name(&candidate.name);
        if name.chars().count() < FUZZY_MIN_LEN {
            return Resolution::Distinct;
        }

        let closest = state
            .entities
            .values()
            .filter(|e| e.entity_type == candidate.entity_type)
            .filter_map(|e| {
                let other = canonical_name(&e.name);
                if other.chars().count() < FUZZY_MIN_LEN {
                    return None;
                }
                let distance = strsim::levenshtein(&name, &other);
                (1..=FUZZY_MAX_DISTANCE)
                    .contains(&distance)
                    .then_some((distance, e.id.as_str()))
            })
            .min();

        match closest {
            Some((distance, existing)) => Resolution::Ambiguous {
                candidate: candidate.id.clone(),
                existing: existing.to_string(),
                distance,
            },
            None => Resolution::Distinct,
        }
    }

    /// Idempotent write: no store call and `changed=false` when the content
    /// hash is unchanged. A failed store write leaves the index untouched.
    pub async fn upsert(&self, entity: &Entity) -> Result<UpsertOutcome> {
        let hash = entity.content_hash();
        let (known, unchanged) = {
            let state = self.read();
            (
                state.entities.contains_key(&entity.id),
                state.hashes.get(&entity.id) == Some(&hash),
            )
        };
        if unchanged {
            return Ok(UpsertOutcome::default());
        }

        if let Some(store) = &self.store {
            if !known && store.stored_hash(&entity.id).await?.as_deref() == Some(hash.as_str()) {
                self.insert_known(entity.clone());
                return Ok(UpsertOutcome::default());
            }
            store.put_entity(entity, &hash).await?;
        }

        let mut state = self.write();
        let created = !state.entities.contains_key(&entity.id);
        state.entities.insert(entity.id.clone(), entity.clone());
        state.hashes.insert(entity.id.clone(), hash);
        debug!(entity = entity.id.as_str(), created, "Entity upserted");
        Ok(UpsertOutcome {
            created,
            changed: true,
        })
    }

    /// Resolve then upsert. Merges fold names and aliases into the existing
    /// entity; ambiguous candidates are kept distinct and queued.
    pub async fn ingest(&self, candidate: Entity) -> Result<IngestOutcome> {
        match self.resolve(&candidate) {
            Resolution::Merged { id, via } => {
                let Some(existing) = self.get(&id) else {
                    let upsert = self.upsert(&candidate).await?;
                    return Ok(IngestOutcome {
                        id: candidate.id,
                        upsert,
                        queued_for_review: false,
                    });
                };
                let mut merged = existing.clone();
                merged.aliases.extend(candidate.aliases.iter().cloned());
                if via == MergeTier::SameAs || candidate.name != existing.name {
                    merged.aliases.insert(candidate.name.clone());
                }
                merged.aliases.remove(&merged.name);
                merged.confidence = existing.confidence.max(candidate.confidence);
                let upsert = self.upsert(&merged).await?;
                Ok(IngestOutcome {
                    id,
                    upsert,
                    queued_for_review: false,
                })
            }
            Resolution::Ambiguous {
                existing, distance, ..
            } => {
                let upsert = self.upsert(&candidate).await?;
                let queued = {
                    let mut state = self.write();
                    let fresh = !state
                        .reviews
                        .iter()
                        .any(|r| r.candidate.id == candidate.id && r.existing_id == existing);
                    if fresh {
                        info!(
                            candidate = candidate.id.as_str(),
                            existing = existing.as_str(),
                            distance,
                            "Possible duplicate queued for review"
                        );
                        state.reviews.push(ReviewItem {
                            candidate: candidate.clone(),
                            existing_id: existing,
                            distance,
                        });
                    }
                    fresh
                };
                Ok(IngestOutcome {
                    id: candidate.id,
                    upsert,
                    queued_for_review: queued,
                })
            }
            Resolution::Distinct => {
                let upsert = self.upsert(&candidate).await?;
                Ok(IngestOutcome {
                    id: candidate.id,
                    upsert,
                    queued_for_review: false,
                })
            }
        }
    }

    /// Record an explicit identity link. Returns whether it is strong enough to merge.
    pub fn record_same_as(&self, alias_id: &str, canonical_id: &str, confidence: f64, provenance: Option<&str>) -> bool {
        let qualifies = confidence >= SAME_AS_THRESHOLD;
        self.write().same_as.insert(
            alias_id.to_string(),
            SameAsLink {
                canonical_id: canonical_id.to_string(),
                confidence,
                provenance: provenance.map(str::to_string),
            },
        );
        debug!(alias = alias_id, canonical = canonical_id, confidence, qualifies, "SAME_AS recorded");
        qualifies
    }

    pub fn pending_reviews(&self) -> Vec<ReviewItem> {
        self.read().reviews.clone()
    }

    /// Close a review item. `Merge` links the candidate to the existing entity,
    /// folds its names into the existing aliases and persists a `SAME_AS` edge.
    /// Returns false when no such item is queued.
    pub async fn resolve_review(&self, candidate_id: &str, existing_id: &str, decision: ReviewDecision) -> Result<bool> {
        let item = {
            let mut state = self.write();
            let Some(pos) = state
                .reviews
                .iter()
                .position(|r| r.candidate.id == candidate_id && r.existing_id == existing_id)
            else {
                return Ok(false);
            };
            state.reviews.remove(pos)
        };

        if decision == ReviewDecision::Distinct {
            info!(candidate = candidate_id, existing = existing_id, "Review closed as distinct");
            return Ok(true);
        }

        if let Some(existing) = self.get(existing_id) {
            let mut merged = existing;
            merged.aliases.insert(item.candidate.name.clone());
            merged.aliases.extend(item.candidate.aliases.iter().cloned());
            merged.aliases.remove(&merged.name);
            self.upsert(&merged).await?;
        }
        if let Some(store) = &self.store {
            let edge = Relationship::new(candidate_id, RelationshipType::SameAs, existing_id)
                .with_certainty(graphrag_common::Certainty::Supported);
            store.put_relationship(&edge).await?;
        }
        self.record_same_as(candidate_id, existing_id, 1.0, Some("review"));
        info!(candidate = candidate_id, existing = existing_id, "Review closed as merge");
        Ok(true)
    }

    /// Write an edge through the store, if there is one.
    pub async fn link(&self, rel: &Relationship) -> Result<()> {
        if let Some(store) = &self.store {
            store.put_relationship(rel).await?;
        }
        Ok(())
    }

    /// Digest of the whole index: entities, identity links and review queue.
    pub fn state_hash(&self) -> String {
        let state = self.read();
        let mut hasher = Sha256::new();
        for (id, hash) in &state.hashes {
            hasher.update(id.as_bytes());
            hasher.update(b"=");
            hasher.update(hash.as_bytes());
            hasher.update(b"\n");
        }
        for (alias, link) in &state.same_as {
            hasher.update(format!("{alias}~{}@{:.4}\n", link.canonical_id, link.confidence).as_bytes());
        }
        for review in &state.reviews {
            hasher.update(format!("?{}~{}\n", review.candidate.id, review.existing_id).as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Deterministic mention detection over `text`: known names and aliases at
    /// word boundaries, plus document references. Ordered by entity id.
    pub fn pin_mentions(&self, doc_id: &str, text: &str) -> Vec<PinnedEntity> {
        let lower = text.to_lowercase();
        let state = self.read();
        let mut pinned: BTreeMap<String, PinnedEntity> = BTreeMap::new();

        for entity in state.entities.values() {
            let source = if contains_word(&lower, &entity.name.to_lowercase()) {
                PinSource::Name
            } else if entity
                .aliases
                .iter()
                .any(|a| a.chars().count() > 1 && contains_word(&lower, &a.to_lowercase()))
            {
                PinSource::Alias
            } else {
                continue;
            };
            let id = state.canonical_id(&entity.id, SAME_AS_THRESHOLD);
            let Some(target) = state.entities.get(id) else {
                continue;
            };
            pinned.entry(target.id.clone()).or_insert_with(|| PinnedEntity {
                entity: target.clone(),
                mentioned_in: vec![doc_id.to_string()],
                source,
            });
        }

        for reference in document_references(text) {
            let id = document_id(&reference.reference);
            let entity = state
                .entities
                .get(&id)
                .cloned()
                .unwrap_or_else(|| Entity::new(EntityType::Document, &reference.reference, None));
            pinned.entry(id).or_insert_with(|| PinnedEntity {
                entity,
                mentioned_in: vec![doc_id.to_string()],
                source: PinSource::DocumentReference,
            });
        }

        pinned.into_values().collect()
    }

    /// Pin extractor output. Merged candidates resolve to the stored entity;
    /// everything else is pinned as extracted. Nothing is written.
    pub fn pin_extracted(&self, extracted: &[ExtractedEntity], source_doc: Option<&str>) -> Vec<PinnedEntity> {
        let mut pinned: Vec<PinnedEntity> = Vec::new();
        for raw in extracted {
            if raw.name.trim().is_empty() {
                continue;
            }
            let candidate = entity_from_extracted(raw);
            let entity = match self.resolve(&candidate) {
                Resolution::Merged { id, .. } => self.get(&id).unwrap_or(candidate),
                Resolution::Ambiguous { .. } | Resolution::Distinct => candidate,
            };
            if pinned.iter().any(|p| p.entity.id == entity.id) {
                continue;
            }
            pinned.push(PinnedEntity {
                entity,
                mentioned_in: source_doc.map(|d| vec![d.to_string()]).unwrap_or_default(),
                source: PinSource::Extracted,
            });
        }
        pinned
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ResolverState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ResolverState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn entity_from_catalog(record: &Record) -> Option<Entity> {
    let id = record.get_str("id")?;
    let name = record.get_str("name")?;
    let entity_type: EntityType = record.get_str("type")?.parse().ok()?;
    Some(Entity {
        id: id.to_string(),
        entity_type,
        name: name.to_string(),
        aliases: record.get_str_list("aliases").into_iter().collect(),
        confidence: record.get_f64("confidence").unwrap_or(1.0),
    })
}
