pub mod builder;
pub mod cache;
pub mod certainty;
pub mod hook;
pub mod pack;
pub mod resolver;
pub mod retriever;
pub mod traits;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use builder::{BuildStats, Document, GraphBuilder};
pub use cache::{CacheKey, ExpansionCache};
pub use hook::{Extras, GraphRagHook, HookHealth, HookOutcome};
pub use resolver::{EntityResolver, PinSource, PinnedEntity, Resolution, ReviewDecision};
pub use retriever::{GraphStatus, HybridRetriever, LatencyBreakdown, PinPath, RetrievalResult, RetrieverConfig};
pub use traits::{EntityExtractor, EntityStore, ExtractedEntity, SeedDocument, VectorSearch};
