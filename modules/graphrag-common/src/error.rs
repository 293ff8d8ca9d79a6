use serde::Serialize;
use thiserror::Error;

/// Contract violations by a caller of the query engine. The only error class
/// allowed to propagate out of the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("template {template} requires parameter {parameter}")]
    MissingParameter {
        template: &'static str,
        parameter: &'static str,
    },

    #[error("parameter {parameter} of {template} exceeds its bound ({value} > {max})")]
    ParameterOutOfBounds {
        template: &'static str,
        parameter: &'static str,
        value: i64,
        max: i64,
    },

    #[error("parameter {parameter} of {template} must be {expected}")]
    InvalidParameter {
        template: &'static str,
        parameter: &'static str,
        expected: &'static str,
    },

    #[error("template {template} does not accept parameter {parameter}")]
    UnexpectedParameter {
        template: &'static str,
        parameter: String,
    },

    #[error("relationship type not allowed: {0}")]
    RelationshipNotAllowed(String),
}

#[derive(Error, Debug)]
pub enum GraphRagError {
    /// Disabled or misconfigured. Treated as an inert state, not a failure.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Why a retrieval fell back to less than full graph context. Recovered
/// locally and reported on the result, never returned as an error.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackReason {
    /// No connector was built for this process.
    #[error("graph backend absent: {detail}")]
    Absent { detail: String },

    /// Network, auth or timeout against the graph store.
    #[error("graph unavailable: {detail}")]
    Connectivity { detail: String },

    /// One graph call in the Expand batch failed; the others were kept.
    #[error("{step} {subject}: {detail}")]
    PartialExpansion {
        step: &'static str,
        subject: String,
        detail: String,
    },

    /// A host collaborator (vector search, extractor) failed.
    #[error("{phase}: {detail}")]
    Collaborator { phase: &'static str, detail: String },

    #[error("{phase}: timed out after {timeout_ms}ms")]
    CollaboratorTimeout { phase: &'static str, timeout_ms: u64 },
}

impl FallbackReason {
    /// Whether the graph itself could not be reached.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, FallbackReason::Connectivity { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_messages() {
        let partial = FallbackReason::PartialExpansion {
            step: "expand",
            subject: "system:gateway".into(),
            detail: "timed out after 300ms".into(),
        };
        assert_eq!(partial.to_string(), "expand system:gateway: timed out after 300ms");

        let slow = FallbackReason::CollaboratorTimeout {
            phase: "seed",
            timeout_ms: 5000,
        };
        assert_eq!(slow.to_string(), "seed: timed out after 5000ms");
        assert!(!slow.is_connectivity());
    }

    #[test]
    fn fallback_serializes_with_kind() {
        let reason = FallbackReason::Connectivity {
            detail: "offline: refused".into(),
        };
        let value = serde_json::to_value(&reason).unwrap();
        assert_eq!(value["kind"], "connectivity");
        assert_eq!(value["detail"], "offline: refused");
    }
}
