pub mod config;
pub mod error;
pub mod identity;
pub mod types;

pub use config::GraphRagConfig;
pub use error::{FallbackReason, GraphRagError, ValidationError};
pub use identity::normalize_entity_id;
pub use types::*;
