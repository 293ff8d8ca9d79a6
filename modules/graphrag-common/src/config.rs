use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::GraphRagError;

/// Hard ceiling on traversal depth.
pub const MAX_HOPS_LIMIT: u32 = 2;
/// Hard ceiling on records returned by one expansion query.
pub const EXPAND_LIMIT_MAX: u32 = 100;
/// Hard ceiling on seed documents and entities carried in one result.
pub const MAX_RESULTS_LIMIT: u32 = 50;

/// Configuration for the graph-augmented retrieval core. Built once at startup
/// and passed explicitly to every component that needs it.
#[derive(Debug, Clone)]
pub struct GraphRagConfig {
    /// Master switch. When false no graph connector is ever constructed.
    pub enabled: bool,

    // Neo4j
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub neo4j_database: String,
    pub connection_timeout_ms: u64,
    pub query_timeout_ms: u64,
    /// How long an unavailable connector waits before the next lazy re-check.
    pub health_recheck_secs: u64,

    // Retrieval bounds
    pub max_hops: u32,
    pub expand_limit: u32,
    pub max_results: u32,
    pub top_k: usize,
    pub max_expand_entities: usize,
    /// Upper bound on vector search and extraction calls.
    pub collaborator_timeout_ms: u64,

    // Expansion cache
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
}

impl Default for GraphRagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            neo4j_uri: "bolt://localhost:7687".to_string(),
            neo4j_user: "neo4j".to_string(),
            neo4j_password: String::new(),
            neo4j_database: "neo4j".to_string(),
            connection_timeout_ms: 5_000,
            query_timeout_ms: 10_000,
            health_recheck_secs: 30,
            max_hops: MAX_HOPS_LIMIT,
            expand_limit: EXPAND_LIMIT_MAX,
            max_results: MAX_RESULTS_LIMIT,
            top_k: 5,
            max_expand_entities: 20,
            collaborator_timeout_ms: 5_000,
            cache_enabled: true,
            cache_ttl_secs: 3_600,
        }
    }
}

impl GraphRagConfig {
    /// Load configuration from environment variables. Missing variables take
    /// defaults; unparsable ones are a configuration error.
    pub fn from_env() -> Result<Self, GraphRagError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GraphRagError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let config = Self {
            enabled: flag(&lookup, "GRAPH_RAG_ENABLED", d.enabled)?,
            neo4j_uri: lookup("NEO4J_URI").unwrap_or(d.neo4j_uri),
            neo4j_user: lookup("NEO4J_USER").unwrap_or(d.neo4j_user),
            neo4j_password: lookup("NEO4J_PASSWORD").unwrap_or(d.neo4j_password),
            neo4j_database: lookup("NEO4J_DATABASE").unwrap_or(d.neo4j_database),
            connection_timeout_ms: number(
                &lookup,
                "NEO4J_CONNECTION_TIMEOUT_MS",
                d.connection_timeout_ms,
            )?,
            query_timeout_ms: number(&lookup, "NEO4J_QUERY_TIMEOUT_MS", d.query_timeout_ms)?,
            health_recheck_secs: number(
                &lookup,
                "GRAPH_HEALTH_RECHECK_SECS",
                d.health_recheck_secs,
            )?,
            max_hops: number(&lookup, "GRAPH_EXPAND_MAX_HOPS", d.max_hops)?,
            expand_limit: number(&lookup, "GRAPH_EXPAND_LIMIT", d.expand_limit)?,
            max_results: number(&lookup, "GRAPH_MAX_RESULTS", d.max_results)?,
            top_k: number(&lookup, "GRAPH_SEED_TOP_K", d.top_k)?,
            max_expand_entities: number(
                &lookup,
                "GRAPH_MAX_EXPAND_ENTITIES",
                d.max_expand_entities,
            )?,
            collaborator_timeout_ms: number(
                &lookup,
                "GRAPH_COLLABORATOR_TIMEOUT_MS",
                d.collaborator_timeout_ms,
            )?,
            cache_enabled: flag(&lookup, "GRAPH_RAG_CACHE_ENABLED", d.cache_enabled)?,
            cache_ttl_secs: number(&lookup, "GRAPH_RAG_CACHE_TTL", d.cache_ttl_secs)?,
        };
        Ok(config.clamped())
    }

    /// Pull every bound back inside its hard ceiling.
    pub fn clamped(mut self) -> Self {
        if self.max_hops > MAX_HOPS_LIMIT {
            warn!(requested = self.max_hops, max = MAX_HOPS_LIMIT, "max_hops clamped");
            self.max_hops = MAX_HOPS_LIMIT;
        }
        if self.max_hops == 0 {
            self.max_hops = 1;
        }
        if self.expand_limit > EXPAND_LIMIT_MAX {
            warn!(requested = self.expand_limit, max = EXPAND_LIMIT_MAX, "expand_limit clamped");
            self.expand_limit = EXPAND_LIMIT_MAX;
        }
        if self.max_results > MAX_RESULTS_LIMIT {
            warn!(requested = self.max_results, max = MAX_RESULTS_LIMIT, "max_results clamped");
            self.max_results = MAX_RESULTS_LIMIT;
        }
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }

    pub fn health_recheck(&self) -> Duration {
        Duration::from_secs(self.health_recheck_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Log the effective configuration without secrets.
    pub fn log_redacted(&self) {
        info!(
            enabled = self.enabled,
            neo4j_uri = self.neo4j_uri.as_str(),
            neo4j_user = self.neo4j_user.as_str(),
            neo4j_database = self.neo4j_database.as_str(),
            password_set = !self.neo4j_password.is_empty(),
            connection_timeout_ms = self.connection_timeout_ms,
            query_timeout_ms = self.query_timeout_ms,
            max_hops = self.max_hops,
            expand_limit = self.expand_limit,
            max_results = self.max_results,
            top_k = self.top_k,
            cache_enabled = self.cache_enabled,
            cache_ttl_secs = self.cache_ttl_secs,
            "GraphRAG configuration"
        );
    }
}

fn flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool, GraphRagError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" | "" => Ok(false),
            _ => Err(GraphRagError::Config(format!("{key} must be a boolean, got {raw:?}"))),
        },
    }
}

fn number<F, T>(lookup: &F, key: &str, default: T) -> Result<T, GraphRagError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| GraphRagError::Config(format!("{key} must be a number, got {raw:?}"))),
    }
}
