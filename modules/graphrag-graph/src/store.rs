use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use graphrag_common::GraphRagConfig;

use crate::engine::{BoundQuery, ParamValue};
use crate::templates::ColumnKind;
use crate::GraphClient;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Network, auth, pool or protocol failure. The store should be treated as down.
    #[error("connectivity: {0}")]
    Connectivity(String),

    #[error("query timed out after {0}ms")]
    Timeout(u64),

    /// The store answered but the query failed.
    #[error("query failed: {0}")]
    Query(String),

    #[error("cannot decode column {column}: {reason}")]
    Decode { column: String, reason: String },
}

impl StoreError {
    /// Whether this failure says the store itself is unreachable.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connectivity(_) | StoreError::Timeout(_))
    }
}

impl From<neo4rs::Error> for StoreError {
    fn from(e: neo4rs::Error) -> Self {
        match e {
            neo4rs::Error::IOError { .. }
            | neo4rs::Error::ConnectionError
            | neo4rs::Error::AuthenticationError(_)
            | neo4rs::Error::UnsupportedVersion(_)
            | neo4rs::Error::UnexpectedMessage(_) => StoreError::Connectivity(e.to_string()),
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// One result row, keyed by column name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record(pub BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.0.insert(column.to_string(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.0.get(column).and_then(Value::as_str)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.0.get(column).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, column: &str) -> Option<f64> {
        self.0.get(column).and_then(Value::as_f64)
    }

    pub fn get_str_list(&self, column: &str) -> Vec<String> {
        self.0
            .get(column)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_as<T: DeserializeOwned>(&self, column: &str) -> Result<T, StoreError> {
        let value = self.0.get(column).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| StoreError::Decode {
            column: column.to_string(),
            reason: e.to_string(),
        })
    }
}

/// One edge of an expansion path as returned by `expand_neighbors`. Empty
/// strings and a zero line number stand in for missing provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRow {
    pub source: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub target: String,
    #[serde(default)]
    pub certainty: String,
    #[serde(default)]
    pub source_doc: String,
    #[serde(default)]
    pub source_line: i64,
    #[serde(default)]
    pub conflict_doc: String,
}

impl EdgeRow {
    pub fn source_doc(&self) -> Option<&str> {
        Some(self.source_doc.as_str()).filter(|s| !s.is_empty())
    }

    pub fn conflict_doc(&self) -> Option<&str> {
        Some(self.conflict_doc.as_str()).filter(|s| !s.is_empty())
    }

    pub fn source_line(&self) -> Option<u32> {
        u32::try_from(self.source_line).ok().filter(|l| *l > 0)
    }
}

/// Executes bound template queries. Implementations never see free-form query
/// text, only a template and its validated parameters.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn fetch(&self, query: &BoundQuery) -> Result<Vec<Record>, StoreError>;

    /// Release pooled resources. Later fetches may reconnect.
    async fn close(&self);

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// Neo4j-backed store. The bolt client is created on first use and reused.
pub struct Neo4jStore {
    uri: String,
    user: String,
    password: String,
    database: String,
    connection_timeout: Duration,
    client: ArcSwapOption<GraphClient>,
    connecting: Mutex<()>,
}

impl Neo4jStore {
    pub fn new(config: &GraphRagConfig) -> Self {
        Self {
            uri: config.neo4j_uri.clone(),
            user: config.neo4j_user.clone(),
            password: config.neo4j_password.clone(),
            database: config.neo4j_database.clone(),
            connection_timeout: config.connection_timeout(),
            client: ArcSwapOption::empty(),
            connecting: Mutex::new(()),
        }
    }

    /// Wrap an already connected client.
    pub fn from_client(client: GraphClient, database: &str) -> Self {
        Self {
            uri: String::new(),
            user: String::new(),
            password: String::new(),
            database: database.to_string(),
            connection_timeout: Duration::from_secs(5),
            client: ArcSwapOption::from_pointee(client),
            connecting: Mutex::new(()),
        }
    }

    /// The shared client, connecting if needed.
    pub async fn client(&self) -> Result<Arc<GraphClient>, StoreError> {
        if let Some(client) = self.client.load_full() {
            return Ok(client);
        }

        let _guard = self.connecting.lock().await;
        if let Some(client) = self.client.load_full() {
            return Ok(client);
        }

        debug!(uri = self.uri.as_str(), "Connecting to Neo4j");
        let connect = GraphClient::connect(&self.uri, &self.user, &self.password, &self.database);
        let client = match tokio::time::timeout(self.connection_timeout, connect).await {
            Ok(result) => Arc::new(result?),
            Err(_) => {
                return Err(StoreError::Connectivity(format!(
                    "connect to {} timed out after {}ms",
                    self.uri,
                    self.connection_timeout.as_millis()
                )))
            }
        };
        self.client.store(Some(client.clone()));
        info!(uri = self.uri.as_str(), database = self.database.as_str(), "Connected to Neo4j");
        Ok(client)
    }

    fn build_query(query: &BoundQuery) -> neo4rs::Query {
        query
            .bindings()
            .into_iter()
            .fold(neo4rs::query(query.spec().pattern), |q, (name, value)| match value {
                ParamValue::Int(v) => q.param(name, v),
                ParamValue::Str(v) => q.param(name, v),
                ParamValue::StrList(v) => q.param(name, v),
            })
    }
}

fn decode_row(row: &neo4rs::Row, query: &BoundQuery) -> Result<Record, StoreError> {
    let mut record = Record::new();
    for column in query.spec().columns {
        let decode_err = |e: neo4rs::DeError| StoreError::Decode {
            column: column.name.to_string(),
            reason: e.to_string(),
        };
        let value = match column.kind {
            ColumnKind::Int => row
                .get::<Option<i64>>(column.name)
                .map_err(decode_err)?
                .map(Value::from)
                .unwrap_or(Value::Null),
            ColumnKind::Float => row
                .get::<Option<f64>>(column.name)
                .map_err(decode_err)?
                .map(Value::from)
                .unwrap_or(Value::Null),
            ColumnKind::Str => row
                .get::<Option<String>>(column.name)
                .map_err(decode_err)?
                .map(Value::from)
                .unwrap_or(Value::Null),
            ColumnKind::StrList => Value::from(
                row.get::<Option<Vec<String>>>(column.name)
                    .map_err(decode_err)?
                    .unwrap_or_default(),
            ),
            ColumnKind::Edges => {
                let edges: Vec<EdgeRow> = row
                    .get::<Option<Vec<EdgeRow>>>(column.name)
                    .map_err(decode_err)?
                    .unwrap_or_default();
                serde_json::to_value(edges).map_err(|e| StoreError::Decode {
                    column: column.name.to_string(),
                    reason: e.to_string(),
                })?
            }
        };
        record.0.insert(column.name.to_string(), value);
    }
    Ok(record)
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn fetch(&self, query: &BoundQuery) -> Result<Vec<Record>, StoreError> {
        let client = self.client().await?;
        let mut stream = client.graph.execute(Self::build_query(query)).await?;

        let mut records = Vec::new();
        while let Some(row) = stream.next().await? {
            records.push(decode_row(&row, query)?);
            if records.len() >= query.limit() {
                break;
            }
        }
        Ok(records)
    }

    async fn close(&self) {
        if self.client.swap(None).is_some() {
            info!(uri = self.uri.as_str(), "Neo4j client released");
        }
    }

    fn describe(&self) -> String {
        format!("neo4j {} ({})", self.uri, self.database)
    }
}
