//! Host integration: inject graph context into prompt extras and index saved
//! memories. Nothing here ever returns an error to the host.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use graphrag_common::GraphRagConfig;

use crate::builder::{BuildStats, Document, GraphBuilder};
use crate::resolver::PinSource;
use crate::retriever::{GraphStatus, HybridRetriever};

pub const GRAPHRAG_KEY: &str = "graphrag";
pub const CONTEXT_SOURCE: &str = "GraphRAG (Neo4j)";
const MAX_RELATED_ENTITIES: usize = 30;
// Host memory extras that always render ahead of graph context.
const LEADING_KEYS: [&str; 2] = ["memories", "solutions"];

/// Ordered prompt extras as the host renders them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extras(Vec<(String, String)>);

impl Extras {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Insert or replace in place.
    pub fn insert(&mut self, key: &str, value: String) {
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.0.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(pos).1)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.0.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `memories`, `solutions`, `graphrag`, then everything else in its original order.
    pub fn reorder_hybrid(&mut self) {
        let mut rest = std::mem::take(&mut self.0);
        for key in LEADING_KEYS.iter().chain([GRAPHRAG_KEY].iter()) {
            if let Some(pos) = rest.iter().position(|(k, _)| k == key) {
                self.0.push(rest.remove(pos));
            }
        }
        self.0.extend(rest);
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Extras {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    Disabled,
    GraphUnavailable,
    EmptyMessage,
    EmptyContext,
    Injected { sha256: String, entities: usize, latency_ms: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookHealth {
    pub enabled: bool,
    pub graph_available: bool,
    pub uri: Option<String>,
}

pub struct GraphRagHook {
    enabled: bool,
    uri: String,
    retriever: Arc<HybridRetriever>,
    builder: Option<Arc<GraphBuilder>>,
}

impl GraphRagHook {
    pub fn new(config: &GraphRagConfig, retriever: Arc<HybridRetriever>) -> Self {
        Self {
            enabled: config.enabled,
            uri: config.neo4j_uri.clone(),
            retriever,
            builder: None,
        }
    }

    pub fn with_builder(mut self, builder: Arc<GraphBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    async fn graph_ready(&self) -> bool {
        match self.retriever.backend().connector() {
            Some(connector) => connector.ensure_connected().await,
            None => false,
        }
    }

    /// Add graph context for `user_message` under the `graphrag` key. Any turn
    /// that does not inject removes a stale `graphrag` entry.
    pub async fn on_prompt(&self, user_message: &str, extras: &mut Extras) -> HookOutcome {
        if !self.enabled {
            clear(extras);
            return HookOutcome::Disabled;
        }
        if !self.graph_ready().await {
            info!("GraphRAG no-op, graph unavailable");
            clear(extras);
            return HookOutcome::GraphUnavailable;
        }
        if user_message.trim().is_empty() {
            clear(extras);
            return HookOutcome::EmptyMessage;
        }

        let result = self.retriever.retrieve(user_message).await;
        if result.graph_status == GraphStatus::Unavailable {
            clear(extras);
            return HookOutcome::GraphUnavailable;
        }
        let knowledge = result.context.trim();
        if knowledge.is_empty() {
            debug!("GraphRAG no-op, empty context");
            clear(extras);
            return HookOutcome::EmptyContext;
        }

        let related: Vec<&str> = result
            .pinned
            .iter()
            .filter(|p| p.source != PinSource::SeedDocument)
            .map(|p| p.entity.name.as_str())
            .chain(result.entities.iter().map(|e| e.name.as_str()))
            .take(MAX_RELATED_ENTITIES)
            .collect();

        let mut payload = json!({
            "source": CONTEXT_SOURCE,
            "injected_knowledge": knowledge,
        });
        if !related.is_empty() {
            payload["related_entities"] = json!(related);
        }
        let text = match serde_json::to_string_pretty(&payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "GraphRAG context not serializable");
                clear(extras);
                return HookOutcome::EmptyContext;
            }
        };
        let sha256 = hex::encode(Sha256::digest(text.as_bytes()));

        extras.insert(GRAPHRAG_KEY, text);
        extras.reorder_hybrid();

        let latency_ms = result.latency.total();
        info!(
            sha256 = sha256.as_str(),
            entities = related.len(),
            documents = ?result.cited_documents(),
            latency_ms,
            keys = ?extras.keys(),
            "GraphRAG context injected"
        );
        HookOutcome::Injected {
            sha256,
            entities: related.len(),
            latency_ms,
        }
    }

    /// Index a saved memory. Returns `None` whenever indexing was skipped or failed.
    pub async fn on_memory_saved(&self, doc_id: &str, text: &str, title: Option<&str>) -> Option<BuildStats> {
        if !self.enabled {
            return None;
        }
        let builder = self.builder.as_ref()?;
        if !self.graph_ready().await {
            debug!(doc_id, "Graph unavailable, memory not indexed");
            return None;
        }

        let doc = Document::new(doc_id, text)
            .with_title(title.unwrap_or(doc_id))
            .with_source("memory");
        match builder.build_from_document(&doc).await {
            Ok(stats) => {
                debug!(doc_id, relationships = stats.relationships, "Memory indexed");
                Some(stats)
            }
            Err(e) => {
                warn!(doc_id, error = %e, "Memory sync failed");
                None
            }
        }
    }

    /// Fire-and-forget `on_memory_saved`.
    pub fn spawn_memory_saved(self: &Arc<Self>, doc_id: String, text: String, title: Option<String>) -> JoinHandle<()> {
        let hook = Arc::clone(self);
        tokio::spawn(async move {
            hook.on_memory_saved(&doc_id, &text, title.as_deref()).await;
        })
    }

    pub fn health(&self) -> HookHealth {
        let graph_available = self
            .retriever
            .backend()
            .connector()
            .is_some_and(|c| c.is_available());
        HookHealth {
            enabled: self.enabled,
            graph_available,
            uri: self.enabled.then(|| self.uri.clone()),
        }
    }
}

fn clear(extras: &mut Extras) {
    if extras.remove(GRAPHRAG_KEY).is_some() {
        debug!("Stale GraphRAG context cleared");
    }
}
