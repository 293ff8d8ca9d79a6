//! Hybrid retrieval: Seed, Pin, Expand, Pack.
//!
//! Phases run strictly in that order for one call. Only Expand may be skipped.
//! `retrieve` never fails: every fault degrades the phase that hit it to
//! "contributed nothing" and is reported in `fallback_reasons`.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use graphrag_common::{
    Certainty, Entity, EntityType, FallbackReason, GraphRagConfig, Relationship, RelationshipType,
};
use graphrag_graph::{
    AbsentReason, BoundQuery, EdgeRow, ExpandNeighborsParams, GraphBackend, GraphConnector, QueryOutcome, Record,
    RelatedDocumentsParams, UnavailableReason,
};

use crate::cache::{CacheKey, ExpansionCache};
use crate::pack::{self, PackInput};
use crate::resolver::{document_id, EntityResolver, PinSource, PinnedEntity};
use crate::traits::{EntityExtractor, SeedDocument, VectorSearch};

const RELATED_DOCUMENTS_LIMIT: u32 = 10;

/// How far the graph got for one retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphStatus {
    /// Graph switched off; Pin and Expand never ran.
    Disabled,
    /// Graph absent or unreachable; Expand was skipped.
    Unavailable,
    /// Graph answered with nothing related.
    Empty,
    /// Every expansion answered.
    Engaged,
    /// Some expansions failed; the rest are kept.
    Degraded,
}

impl GraphStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphStatus::Disabled => "disabled",
            GraphStatus::Unavailable => "unavailable",
            GraphStatus::Empty => "empty",
            GraphStatus::Engaged => "engaged",
            GraphStatus::Degraded => "degraded",
        }
    }

    /// Whether the packed context is not fully graph-grounded.
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            GraphStatus::Disabled | GraphStatus::Unavailable | GraphStatus::Degraded
        )
    }
}

/// Which Pin path ran. Exactly one runs per call, decided by Seed's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PinPath {
    SeedDocuments,
    Query,
    Skipped,
}

/// Wall-clock milliseconds per phase. Generation time is never included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyBreakdown {
    pub seed_ms: f64,
    pub pin_ms: f64,
    pub graph_query_ms: f64,
    pub pack_ms: f64,
}

impl LatencyBreakdown {
    pub fn total(&self) -> f64 {
        self.seed_ms + self.pin_ms + self.graph_query_ms + self.pack_ms
    }

    pub fn as_map(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            ("seed_ms", self.seed_ms),
            ("pin_ms", self.pin_ms),
            ("graph_query_ms", self.graph_query_ms),
            ("pack_ms", self.pack_ms),
            ("total", self.total()),
        ])
    }
}

/// Output of one retrieval. Built fresh per call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub query: String,
    pub context: String,
    pub seed_documents: Vec<SeedDocument>,
    pub pinned: Vec<PinnedEntity>,
    pub pin_path: PinPath,
    /// Entities the graph contributed. Pinned entities are in `pinned`.
    pub entities: Vec<Entity>,
    /// Graph edges, labeled with the certainty Pack computed.
    pub relationships: Vec<Relationship>,
    pub related_documents: Vec<String>,
    /// Entity id to the document ids supporting it.
    pub provenance: BTreeMap<String, Vec<String>>,
    pub latency: LatencyBreakdown,
    pub graph_status: GraphStatus,
    pub fallback: bool,
    pub fallback_reasons: Vec<FallbackReason>,
    pub cache_hits: usize,
}

impl RetrievalResult {
    /// Every document id the context cites: seeds first, then related documents.
    pub fn cited_documents(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.seed_documents
            .iter()
            .map(|s| s.doc_id.clone())
            .chain(self.related_documents.iter().cloned())
            .filter(|d| seen.insert(d.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrieverConfig {
    pub top_k: usize,
    pub max_hops: u32,
    pub expand_limit: u32,
    pub max_results: usize,
    pub max_expand_entities: usize,
    pub collaborator_timeout: Duration,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self::from(&GraphRagConfig::default())
    }
}

impl From<&GraphRagConfig> for RetrieverConfig {
    fn from(config: &GraphRagConfig) -> Self {
        let config = config.clone().clamped();
        Self {
            top_k: config.top_k.max(1),
            max_hops: config.max_hops,
            expand_limit: config.expand_limit,
            max_results: config.max_results as usize,
            max_expand_entities: config.max_expand_entities,
            collaborator_timeout: config.collaborator_timeout(),
        }
    }
}

/// What the graph contributed to one retrieval. Neighbors are keyed by id
/// and remember the fewest hops any pinned entity reached them in.
struct Expansion {
    status: GraphStatus,
    entities: BTreeMap<String, (u32, Entity)>,
    relationships: BTreeMap<(String, RelationshipType, String), Relationship>,
    provenance: BTreeMap<String, BTreeSet<String>>,
    related_documents: Vec<String>,
    reasons: Vec<FallbackReason>,
    failed: bool,
    cache_hits: usize,
}

impl Expansion {
    fn skipped(status: GraphStatus, reason: Option<FallbackReason>) -> Self {
        Self {
            status,
            entities: BTreeMap::new(),
            relationships: BTreeMap::new(),
            provenance: BTreeMap::new(),
            related_documents: Vec::new(),
            reasons: reason.into_iter().collect(),
            failed: false,
            cache_hits: 0,
        }
    }

    fn fail(&mut self, step: &'static str, subject: &str, detail: impl ToString) {
        let reason = FallbackReason::PartialExpansion {
            step,
            subject: subject.to_string(),
            detail: detail.to_string(),
        };
        warn!(reason = %reason, "Expansion dropped");
        self.failed = true;
        self.reasons.push(reason);
    }

    fn cite(&mut self, entity_id: &str, docs: impl IntoIterator<Item = String>) {
        self.provenance
            .entry(entity_id.to_string())
            .or_default()
            .extend(docs);
    }

    /// Fold one `expand_neighbors` answer in. Neighbors inherit the start
    /// entity's documents plus every `source_doc` on the path that reached them.
    fn absorb_neighbors(&mut self, start: &PinnedEntity, records: &[Record], pinned_ids: &BTreeSet<&str>) {
        for record in records {
            let (Some(id), Some(name)) = (record.get_str("neighbor_id"), record.get_str("neighbor_name")) else {
                debug!(start = start.entity.id.as_str(), "Skipping neighbor row without id or name");
                continue;
            };
            let edges: Vec<EdgeRow> = match record.get_as("edges") {
                Ok(edges) => edges,
                Err(e) => {
                    debug!(error = %e, neighbor = id, "Neighbor row without readable edges");
                    Vec::new()
                }
            };

            let hops = record
                .get_i64("hops")
                .and_then(|h| u32::try_from(h).ok())
                .unwrap_or(edges.len() as u32);

            let mut path_docs: BTreeSet<String> = start.mentioned_in.iter().cloned().collect();
            for edge in &edges {
                let Some(rel) = relationship_from_edge(edge) else {
                    continue;
                };
                path_docs.extend(rel.source_doc.iter().cloned());
                let key = (rel.source_id.clone(), rel.rel_type, rel.target_id.clone());
                self.relationships.entry(key).or_insert(rel);
            }

            if !pinned_ids.contains(id) {
                let entity_type = record
                    .get_str("neighbor_type")
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(EntityType::Concept);
                let entry = self.entities.entry(id.to_string()).or_insert_with(|| {
                    let entity = Entity {
                        id: id.to_string(),
                        entity_type,
                        name: name.to_string(),
                        aliases: BTreeSet::new(),
                        confidence: 1.0,
                    };
                    (hops, entity)
                });
                entry.0 = entry.0.min(hops);
            }
            self.cite(id, path_docs);
        }
    }

    /// Up to `max` neighbors, fewest hops first, ties by id.
    fn nearest(&self, max: usize) -> Vec<Entity> {
        let mut ranked: Vec<&(u32, Entity)> = self.entities.values().collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        ranked.into_iter().take(max).map(|(_, e)| e.clone()).collect()
    }

    fn finish(mut self) -> Self {
        self.status = if self.failed {
            GraphStatus::Degraded
        } else if self.entities.is_empty() && self.relationships.is_empty() && self.related_documents.is_empty() {
            GraphStatus::Empty
        } else {
            GraphStatus::Engaged
        };
        self
    }
}

fn relationship_from_edge(edge: &EdgeRow) -> Option<Relationship> {
    let rel_type: RelationshipType = match edge.rel_type.parse() {
        Ok(t) => t,
        Err(e) => {
            debug!(error = %e, "Skipping edge of unknown type");
            return None;
        }
    };
    let mut rel = Relationship::new(&edge.source, rel_type, &edge.target)
        .with_certainty(edge.certainty.parse().unwrap_or(Certainty::Unknown));
    if let Some(doc) = edge.source_doc() {
        rel = rel.sourced_from(doc, edge.source_line());
    }
    rel.conflict_doc = edge.conflict_doc().map(str::to_string);
    Some(rel)
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Merge a pin into `pins`, keeping first-seen order and unioning mentions.
fn merge_pin(pins: &mut Vec<PinnedEntity>, pin: PinnedEntity) {
    match pins.iter_mut().find(|p| p.entity.id == pin.entity.id) {
        Some(existing) => {
            for doc in pin.mentioned_in {
                if !existing.mentioned_in.contains(&doc) {
                    existing.mentioned_in.push(doc);
                }
            }
        }
        None => pins.push(pin),
    }
}

pub struct HybridRetriever {
    config: RetrieverConfig,
    backend: GraphBackend,
    vector: Arc<dyn VectorSearch>,
    extractor: Option<Arc<dyn EntityExtractor>>,
    resolver: Arc<EntityResolver>,
    cache: ExpansionCache,
    hydrated: AtomicBool,
}

impl HybridRetriever {
    pub fn new(
        config: &GraphRagConfig,
        backend: GraphBackend,
        vector: Arc<dyn VectorSearch>,
        resolver: Arc<EntityResolver>,
    ) -> Self {
        Self {
            config: RetrieverConfig::from(config),
            backend,
            vector,
            extractor: None,
            resolver,
            cache: ExpansionCache::new(config.cache_enabled, config.cache_ttl()),
            hydrated: AtomicBool::new(false),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn EntityExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_cache(mut self, cache: ExpansionCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_config(mut self, config: RetrieverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    pub fn backend(&self) -> &GraphBackend {
        &self.backend
    }

    pub fn resolver(&self) -> &Arc<EntityResolver> {
        &self.resolver
    }

    pub fn cache(&self) -> &ExpansionCache {
        &self.cache
    }

    fn disabled(&self) -> bool {
        matches!(self.backend, GraphBackend::Absent(AbsentReason::Disabled))
    }

    pub async fn retrieve(&self, query: &str) -> RetrievalResult {
        let mut latency = LatencyBreakdown::default();
        let mut reasons = Vec::new();

        // Seed
        let started = Instant::now();
        let seeds = self.seed(query, &mut reasons).await;
        latency.seed_ms = elapsed_ms(started);

        // Connectivity check and resolver warm-up count as graph time.
        let graph_ready = if self.disabled() {
            false
        } else {
            let started = Instant::now();
            let ready = self.prepare_graph().await;
            latency.graph_query_ms += elapsed_ms(started);
            ready
        };

        // Pin
        let started = Instant::now();
        let (pinned, pin_path) = if self.disabled() {
            (Vec::new(), PinPath::Skipped)
        } else {
            self.pin(query, &seeds, &mut reasons).await
        };
        latency.pin_ms = elapsed_ms(started);

        // Expand
        let expansion = if self.disabled() {
            Expansion::skipped(GraphStatus::Disabled, None)
        } else {
            let started = Instant::now();
            let expansion = self.expand(graph_ready, &pinned, &seeds).await;
            latency.graph_query_ms += elapsed_ms(started);
            expansion
        };
        reasons.extend(expansion.reasons.iter().cloned());

        // Pack. Only the nearest `max_results` neighbors survive, and only
        // edges and provenance between surviving or pinned entities are kept.
        let started = Instant::now();
        let entities = expansion.nearest(self.config.max_results);
        let kept: BTreeSet<&str> = pinned
            .iter()
            .map(|p| p.entity.id.as_str())
            .chain(entities.iter().map(|e| e.id.as_str()))
            .collect();
        if expansion.entities.len() > entities.len() {
            debug!(
                reached = expansion.entities.len(),
                kept = entities.len(),
                "Neighbors capped at max_results"
            );
        }

        let mut provenance: BTreeMap<String, BTreeSet<String>> = expansion
            .provenance
            .iter()
            .filter(|(id, _)| kept.contains(id.as_str()))
            .map(|(id, docs)| (id.clone(), docs.clone()))
            .collect();
        for pin in &pinned {
            provenance
                .entry(pin.entity.id.clone())
                .or_default()
                .extend(pin.mentioned_in.iter().cloned());
        }
        let provenance: BTreeMap<String, Vec<String>> = provenance
            .into_iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(id, docs)| (id, docs.into_iter().collect()))
            .collect();

        let relationships: Vec<Relationship> = expansion
            .relationships
            .values()
            .filter(|r| kept.contains(r.source_id.as_str()) && kept.contains(r.target_id.as_str()))
            .cloned()
            .collect();
        let relationships = pack::label_relationships(&relationships, &pinned);

        let context = pack::pack(&PackInput {
            status: expansion.status,
            seeds: &seeds,
            pinned: &pinned,
            entities: &entities,
            relationships: &relationships,
            related_documents: &expansion.related_documents,
            provenance: &provenance,
            max_results: self.config.max_results,
        });
        latency.pack_ms = elapsed_ms(started);

        let result = RetrievalResult {
            query: query.to_string(),
            context,
            seed_documents: seeds,
            pinned,
            pin_path,
            entities,
            relationships,
            related_documents: expansion.related_documents,
            provenance,
            latency,
            graph_status: expansion.status,
            fallback: expansion.status.is_fallback(),
            fallback_reasons: reasons,
            cache_hits: expansion.cache_hits,
        };

        info!(
            graph_status = result.graph_status.as_str(),
            seeds = result.seed_documents.len(),
            pinned = result.pinned.len(),
            entities = result.entities.len(),
            relationships = result.relationships.len(),
            cache_hits = result.cache_hits,
            total_ms = result.latency.total(),
            "Retrieval complete"
        );
        result
    }

    /// Run a collaborator call under the collaborator timeout.
    async fn call_collaborator<T, F>(
        &self,
        phase: &'static str,
        fut: F,
        reasons: &mut Vec<FallbackReason>,
    ) -> Option<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.config.collaborator_timeout, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(phase, error = %e, "Collaborator failed");
                reasons.push(FallbackReason::Collaborator {
                    phase,
                    detail: format!("{e:#}"),
                });
                None
            }
            Err(_) => {
                let timeout_ms = self.config.collaborator_timeout.as_millis() as u64;
                warn!(phase, timeout_ms, "Collaborator timed out");
                reasons.push(FallbackReason::CollaboratorTimeout { phase, timeout_ms });
                None
            }
        }
    }

    /// Connect if needed and, once per process, load the entities the graph
    /// already holds into the resolver so name pinning survives restarts.
    async fn prepare_graph(&self) -> bool {
        let Some(connector) = self.backend.connector() else {
            return false;
        };
        if !connector.ensure_connected().await {
            return false;
        }
        if !self.hydrated.load(Ordering::Acquire) {
            match self.resolver.hydrate_from(connector).await {
                Ok(_) => self.hydrated.store(true, Ordering::Release),
                Err(reason) => warn!(reason = %reason, "Resolver hydration skipped"),
            }
        }
        connector.is_available()
    }

    async fn seed(&self, query: &str, reasons: &mut Vec<FallbackReason>) -> Vec<SeedDocument> {
        if query.trim().is_empty() {
            return Vec::new();
        }
        let hits = self
            .call_collaborator("seed", self.vector.similarity_search(query, self.config.top_k), reasons)
            .await
            .unwrap_or_default();

        let mut seen = BTreeSet::new();
        hits.into_iter()
            .filter(|s| !s.doc_id.trim().is_empty() && seen.insert(s.doc_id.clone()))
            .take(self.config.max_results.min(self.config.top_k))
            .collect()
    }

    async fn pin(
        &self,
        query: &str,
        seeds: &[SeedDocument],
        reasons: &mut Vec<FallbackReason>,
    ) -> (Vec<PinnedEntity>, PinPath) {
        let mut pins = Vec::new();

        if !seeds.is_empty() {
            for seed in seeds {
                let doc = Entity::new(EntityType::Document, &seed.doc_id, None);
                merge_pin(
                    &mut pins,
                    PinnedEntity {
                        entity: self.resolver.get(&doc.id).unwrap_or(doc),
                        mentioned_in: vec![seed.doc_id.clone()],
                        source: PinSource::SeedDocument,
                    },
                );
                for pin in self.resolver.pin_mentions(&seed.doc_id, &seed.text) {
                    merge_pin(&mut pins, pin);
                }
            }
            debug!(pinned = pins.len(), "Pinned from seed documents");
            return (pins, PinPath::SeedDocuments);
        }

        if query.trim().is_empty() {
            return (pins, PinPath::Query);
        }
        match &self.extractor {
            Some(extractor) => {
                if let Some(extracted) = self.call_collaborator("pin", extractor.extract(query), reasons).await {
                    pins = self.resolver.pin_extracted(&extracted, None);
                }
            }
            None => {
                pins = self
                    .resolver
                    .pin_mentions("", query)
                    .into_iter()
                    .map(|mut p| {
                        p.mentioned_in.clear();
                        p
                    })
                    .collect();
            }
        }
        debug!(pinned = pins.len(), "Pinned from query");
        (pins, PinPath::Query)
    }

    async fn expand(&self, graph_ready: bool, pinned: &[PinnedEntity], seeds: &[SeedDocument]) -> Expansion {
        let connector = match &self.backend {
            GraphBackend::Present(connector) => connector,
            GraphBackend::Absent(reason) => {
                let reason = FallbackReason::Absent {
                    detail: reason.to_string(),
                };
                return Expansion::skipped(GraphStatus::Unavailable, Some(reason));
            }
        };

        if !graph_ready {
            let detail = connector.status().reason.unwrap_or_else(|| "not connected".to_string());
            debug!(reason = detail.as_str(), "Graph unavailable, skipping expansion");
            let reason = FallbackReason::Connectivity { detail };
            return Expansion::skipped(GraphStatus::Unavailable, Some(reason));
        }

        let mut expansion = Expansion::skipped(GraphStatus::Empty, None);
        let pinned_ids: BTreeSet<&str> = pinned.iter().map(|p| p.entity.id.as_str()).collect();

        for start in pinned.iter().take(self.config.max_expand_entities) {
            if !connector.is_available() {
                expansion.fail("expand", &start.entity.id, "graph became unavailable");
                continue;
            }
            let query = BoundQuery::ExpandNeighbors(
                ExpandNeighborsParams::new(&start.entity.id)
                    .hops(self.config.max_hops)
                    .limit(self.config.expand_limit),
            )
            .bounded();
            match self.cached(connector, query, &start.entity.id, &mut expansion).await {
                Ok(records) => expansion.absorb_neighbors(start, &records, &pinned_ids),
                Err(reason) => expansion.fail("expand", &start.entity.id, reason),
            }
        }
        if pinned.len() > self.config.max_expand_entities {
            debug!(
                pinned = pinned.len(),
                expanded = self.config.max_expand_entities,
                "Expansion capped"
            );
        }

        let mut related = BTreeSet::new();
        let cited: BTreeSet<&str> = seeds.iter().map(|s| s.doc_id.as_str()).collect();
        for seed in seeds {
            if !connector.is_available() {
                expansion.fail("related", &seed.doc_id, "graph became unavailable");
                continue;
            }
            let doc_id = document_id(&seed.doc_id);
            let query = BoundQuery::RelatedDocuments(RelatedDocumentsParams {
                doc_id: doc_id.clone(),
                limit: RELATED_DOCUMENTS_LIMIT,
            })
            .bounded();
            match self.cached(connector, query, &doc_id, &mut expansion).await {
                Ok(records) => {
                    for record in &records {
                        let name = record.get_str("name").or_else(|| record.get_str("doc_id"));
                        if let Some(name) = name.filter(|n| !cited.contains(n)) {
                            if related.insert(name.to_string()) {
                                expansion.related_documents.push(name.to_string());
                            }
                        }
                    }
                }
                Err(reason) => expansion.fail("related", &seed.doc_id, reason),
            }
        }

        expansion.finish()
    }

    /// One graph call through the expansion cache. Only successful answers are cached.
    async fn cached(
        &self,
        connector: &GraphConnector,
        query: BoundQuery,
        subject: &str,
        expansion: &mut Expansion,
    ) -> Result<Vec<Record>, UnavailableReason> {
        let (hops, limit) = match &query {
            BoundQuery::ExpandNeighbors(p) => (p.max_hops, p.limit),
            other => (0, other.limit() as u32),
        };
        let key = CacheKey {
            template: query.template(),
            subject: subject.to_string(),
            hops,
            limit,
        };
        if let Some(records) = self.cache.get(&key) {
            expansion.cache_hits += 1;
            return Ok(records);
        }

        match connector.run_bound(&query).await {
            QueryOutcome::Available { records, latency_ms } => {
                debug!(
                    template = %key.template,
                    subject,
                    rows = records.len(),
                    latency_ms,
                    "Graph query answered"
                );
                self.cache.insert(key, records.clone());
                Ok(records)
            }
            QueryOutcome::Unavailable { reason } => Err(reason),
        }
    }
}
