use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use graphrag_common::{GraphRagConfig, GraphRagError, ValidationError};

use crate::engine::{BoundQuery, SafeQueryEngine};
use crate::store::{GraphStore, Neo4jStore, Record, StoreError};

/// Why the graph could not answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UnavailableReason {
    /// Connection, auth or pool failure.
    Offline(String),
    /// The call exceeded its timeout, in milliseconds.
    Timeout(u64),
    /// The store answered with an error. Does not mark the connector down.
    QueryFailed(String),
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::Offline(detail) => write!(f, "offline: {detail}"),
            UnavailableReason::Timeout(ms) => write!(f, "timed out after {ms}ms"),
            UnavailableReason::QueryFailed(detail) => write!(f, "query failed: {detail}"),
        }
    }
}

impl From<StoreError> for UnavailableReason {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Connectivity(detail) => UnavailableReason::Offline(detail),
            StoreError::Timeout(ms) => UnavailableReason::Timeout(ms),
            other => UnavailableReason::QueryFailed(other.to_string()),
        }
    }
}

/// Last known connectivity of the graph store.
#[derive(Debug, Clone, PartialEq)]
pub enum Availability {
    Unknown,
    Available {
        since: DateTime<Utc>,
    },
    Unavailable {
        reason: UnavailableReason,
        since: DateTime<Utc>,
    },
}

impl Availability {
    pub fn label(&self) -> &'static str {
        match self {
            Availability::Unknown => "unknown",
            Availability::Available { .. } => "available",
            Availability::Unavailable { .. } => "unavailable",
        }
    }
}

/// Result of one query through the connector. Never an error: an unreachable
/// graph is a state, not a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Available { records: Vec<Record>, latency_ms: f64 },
    Unavailable { reason: UnavailableReason },
}

impl QueryOutcome {
    /// Records, or an empty slice when the graph did not answer.
    pub fn records(&self) -> &[Record] {
        match self {
            QueryOutcome::Available { records, .. } => records,
            QueryOutcome::Unavailable { .. } => &[],
        }
    }

    pub fn latency_ms(&self) -> f64 {
        match self {
            QueryOutcome::Available { latency_ms, .. } => *latency_ms,
            QueryOutcome::Unavailable { .. } => 0.0,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, QueryOutcome::Available { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorStatus {
    pub state: &'static str,
    pub reason: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub backend: String,
}

/// Owns the query engine and the availability state machine. Safe to share
/// across concurrent retrievals; state reads never block.
pub struct GraphConnector {
    engine: SafeQueryEngine,
    state: ArcSwap<Availability>,
    connection_timeout: Duration,
    recheck: Duration,
}

impl GraphConnector {
    pub fn new(store: Arc<dyn GraphStore>, config: &GraphRagConfig) -> Result<Self, GraphRagError> {
        let engine = SafeQueryEngine::new(store, config.query_timeout()).map_err(|violations| {
            let joined = violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            GraphRagError::Config(format!("template registry failed audit: {joined}"))
        })?;
        Ok(Self {
            engine,
            state: ArcSwap::from_pointee(Availability::Unknown),
            connection_timeout: config.connection_timeout(),
            recheck: config.health_recheck(),
        })
    }

    /// Verify connectivity with the `health_check` template. Never fails; the
    /// outcome is recorded in the availability state.
    pub async fn connect(&self) -> bool {
        let probe = self.engine.execute(&BoundQuery::HealthCheck);
        let result = match tokio::time::timeout(self.connection_timeout, probe).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.connection_timeout.as_millis() as u64)),
        };

        match result {
            Ok(_) => {
                self.state.store(Arc::new(Availability::Available { since: Utc::now() }));
                info!(backend = %self.engine.store().describe(), "Graph store available");
                true
            }
            Err(e) => {
                warn!(backend = %self.engine.store().describe(), error = %e, "Graph store unavailable");
                self.mark_unavailable(e.into());
                false
            }
        }
    }

    /// Last known state. No I/O.
    pub fn is_available(&self) -> bool {
        matches!(**self.state.load(), Availability::Available { .. })
    }

    pub fn availability(&self) -> Arc<Availability> {
        self.state.load_full()
    }

    /// Connect on first use, or again once an outage is older than the
    /// recheck interval.
    pub async fn ensure_connected(&self) -> bool {
        let due = match &**self.state.load() {
            Availability::Available { .. } => return true,
            Availability::Unknown => true,
            Availability::Unavailable { since, .. } => {
                let elapsed = Utc::now().signed_duration_since(*since);
                elapsed.to_std().map(|e| e >= self.recheck).unwrap_or(false)
            }
        };
        if !due {
            return false;
        }
        debug!("Re-checking graph store availability");
        self.connect().await
    }

    /// Validate and run a named template. Only contract violations are errors.
    pub async fn run_query(&self, template: &str, params: &Value) -> Result<QueryOutcome, ValidationError> {
        let bound = self.engine.validate(template, params)?;
        if !self.ensure_connected().await {
            return Ok(self.unavailable_outcome());
        }
        Ok(self.run_bound(&bound).await)
    }

    /// Run an already-bound query if the store is currently available.
    pub async fn run_bound(&self, query: &BoundQuery) -> QueryOutcome {
        if !self.is_available() {
            return self.unavailable_outcome();
        }

        match self.engine.execute(query).await {
            Ok(result) => QueryOutcome::Available {
                records: result.records,
                latency_ms: result.latency_ms,
            },
            Err(e) if e.is_connectivity() => {
                warn!(template = %query.template(), error = %e, "Graph store lost");
                let reason = UnavailableReason::from(e);
                self.mark_unavailable(reason.clone());
                QueryOutcome::Unavailable { reason }
            }
            Err(e) => {
                warn!(template = %query.template(), error = %e, "Graph query failed");
                QueryOutcome::Unavailable { reason: e.into() }
            }
        }
    }

    /// Release the pool. The next `ensure_connected` reconnects.
    pub async fn close(&self) {
        self.engine.store().close().await;
        self.state.store(Arc::new(Availability::Unknown));
    }

    pub fn status(&self) -> ConnectorStatus {
        let state = self.state.load_full();
        let (reason, since) = match &*state {
            Availability::Unknown => (None, None),
            Availability::Available { since } => (None, Some(*since)),
            Availability::Unavailable { reason, since } => (Some(reason.to_string()), Some(*since)),
        };
        ConnectorStatus {
            state: state.label(),
            reason,
            since,
            backend: self.engine.store().describe(),
        }
    }

    fn mark_unavailable(&self, reason: UnavailableReason) {
        self.state.store(Arc::new(Availability::Unavailable {
            reason,
            since: Utc::now(),
        }));
    }

    fn unavailable_outcome(&self) -> QueryOutcome {
        let reason = match &**self.state.load() {
            Availability::Unavailable { reason, .. } => reason.clone(),
            _ => UnavailableReason::Offline("not connected".to_string()),
        };
        QueryOutcome::Unavailable { reason }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AbsentReason {
    Disabled,
    Misconfigured(String),
}

impl fmt::Display for AbsentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbsentReason::Disabled => f.write_str("disabled"),
            AbsentReason::Misconfigured(detail) => write!(f, "misconfigured: {detail}"),
        }
    }
}

/// Startup capability check, consumed by whatever wires the retriever.
#[derive(Clone)]
pub enum GraphBackend {
    Present(Arc<GraphConnector>),
    Absent(AbsentReason),
}

impl GraphBackend {
    /// Build the Neo4j-backed connector when enabled and try a first connect.
    /// A store that is down at startup is still `Present`; it is re-checked lazily.
    pub async fn probe(config: &GraphRagConfig) -> Self {
        if !config.enabled {
            info!("GraphRAG disabled");
            return GraphBackend::Absent(AbsentReason::Disabled);
        }
        if config.neo4j_uri.trim().is_empty() {
            warn!("GraphRAG enabled without NEO4J_URI");
            return GraphBackend::Absent(AbsentReason::Misconfigured("NEO4J_URI is empty".into()));
        }

        let store: Arc<dyn GraphStore> = Arc::new(Neo4jStore::new(config));
        let backend = Self::with_store(store, config);
        if let GraphBackend::Present(connector) = &backend {
            connector.connect().await;
        }
        backend
    }

    /// Wrap an arbitrary store. Honors `enabled` without touching the store.
    pub fn with_store(store: Arc<dyn GraphStore>, config: &GraphRagConfig) -> Self {
        if !config.enabled {
            return GraphBackend::Absent(AbsentReason::Disabled);
        }
        match GraphConnector::new(store, config) {
            Ok(connector) => GraphBackend::Present(Arc::new(connector)),
            Err(e) => {
                warn!(error = %e, "Graph connector not constructed");
                GraphBackend::Absent(AbsentReason::Misconfigured(e.to_string()))
            }
        }
    }

    pub fn connector(&self) -> Option<&Arc<GraphConnector>> {
        match self {
            GraphBackend::Present(connector) => Some(connector),
            GraphBackend::Absent(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGraph;
    use serde_json::json;

    fn enabled() -> GraphRagConfig {
        GraphRagConfig {
            enabled: true,
            connection_timeout_ms: 200,
            query_timeout_ms: 200,
            health_recheck_secs: 0,
            ..GraphRagConfig::default()
        }
    }

    fn connector(graph: Arc<MemoryGraph>, config: &GraphRagConfig) -> Arc<GraphConnector> {
        GraphBackend::with_store(graph, config)
            .connector()
            .cloned()
            .expect("backend present")
    }

    #[tokio::test]
    async fn disabled_backend_is_absent() {
        let graph = Arc::new(MemoryGraph::new());
        let backend = GraphBackend::with_store(graph.clone(), &GraphRagConfig::default());
        assert!(matches!(backend, GraphBackend::Absent(AbsentReason::Disabled)));
        assert_eq!(graph.fetch_count(), 0);
    }

    #[tokio::test]
    async fn unknown_until_first_connect() {
        let graph = Arc::new(MemoryGraph::new());
        let c = connector(graph.clone(), &enabled());
        assert!(!c.is_available());
        assert_eq!(c.status().state, "unknown");
        assert!(c.connect().await);
        assert!(c.is_available());
    }

    #[tokio::test]
    async fn unreachable_store_flips_unavailable() {
        let graph = Arc::new(MemoryGraph::new());
        graph.set_reachable(false);
        let c = connector(graph, &enabled());
        assert!(!c.connect().await);
        assert_eq!(c.status().state, "unavailable");

        let outcome = c.run_query("health_check", &json!({})).await.unwrap();
        assert!(!outcome.is_available());
        assert!(outcome.records().is_empty());
        assert_eq!(outcome.latency_ms(), 0.0);
    }

    #[tokio::test]
    async fn validation_errors_surface_even_when_offline() {
        let graph = Arc::new(MemoryGraph::new());
        graph.set_reachable(false);
        let c = connector(graph, &enabled());
        let err = c.run_query("drop_everything", &json!({})).await.unwrap_err();
        assert!(matches!(err, ValidationError::UnknownTemplate(_)));
    }

    #[tokio::test]
    async fn slow_store_times_out_and_recovers_lazily() {
        let graph = Arc::new(MemoryGraph::new());
        graph.set_delay(Some(Duration::from_millis(500)));
        let c = connector(graph.clone(), &enabled());
        assert!(!c.connect().await);
        match &*c.availability() {
            Availability::Unavailable { reason, .. } => {
                assert!(matches!(reason, UnavailableReason::Timeout(_)))
            }
            other => panic!("unexpected {other:?}"),
        }

        graph.set_delay(None);
        assert!(c.ensure_connected().await);
        assert!(c.is_available());
    }

    #[tokio::test]
    async fn query_error_keeps_connector_available() {
        let graph = Arc::new(MemoryGraph::new());
        graph.fail_on("system:gateway");
        let c = connector(graph, &enabled());
        assert!(c.connect().await);

        let outcome = c
            .run_query("expand_neighbors", &json!({"entity_id": "system:gateway"}))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            QueryOutcome::Unavailable {
                reason: UnavailableReason::QueryFailed(_)
            }
        ));
        assert!(c.is_available());
    }

    #[tokio::test]
    async fn close_resets_state() {
        let graph = Arc::new(MemoryGraph::new());
        let c = connector(graph, &enabled());
        assert!(c.connect().await);
        c.close().await;
        assert_eq!(c.status().state, "unknown");
    }
}
