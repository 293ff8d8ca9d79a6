pub mod client;
pub mod connector;
pub mod engine;
pub mod memory;
pub mod migrate;
pub mod store;
pub mod templates;
pub mod writer;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use client::GraphClient;
pub use connector::{
    AbsentReason, Availability, ConnectorStatus, GraphBackend, GraphConnector, QueryOutcome,
    UnavailableReason,
};
pub use engine::{
    validate, BoundQuery, EntityCatalogParams, EntityLookupParams, ExpandNeighborsParams, ParamValue, QueryResult,
    RelatedDocumentsParams, SafeQueryEngine,
};
pub use memory::MemoryGraph;
pub use store::{EdgeRow, GraphStore, Neo4jStore, Record, StoreError};
pub use templates::{AuditViolation, TemplateName, TemplateRegistry, TemplateSpec};
pub use writer::GraphWriter;
