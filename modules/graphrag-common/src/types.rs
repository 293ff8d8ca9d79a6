use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::identity::normalize_entity_id;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

// --- Entity types ---

/// Closed set of node kinds in the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    System,
    Artifact,
    Decision,
    Incident,
    Concept,
    Document,
    Change,
}

impl EntityType {
    pub const ALL: [EntityType; 8] = [
        EntityType::Person,
        EntityType::System,
        EntityType::Artifact,
        EntityType::Decision,
        EntityType::Incident,
        EntityType::Concept,
        EntityType::Document,
        EntityType::Change,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::System => "system",
            EntityType::Artifact => "artifact",
            EntityType::Decision => "decision",
            EntityType::Incident => "incident",
            EntityType::Concept => "concept",
            EntityType::Document => "document",
            EntityType::Change => "change",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == lowered)
            .ok_or_else(|| UnknownVariant {
                kind: "entity type",
                value: s.to_string(),
            })
    }
}

// --- Relationship types ---

/// Fixed allowlist of edge types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    DependsOn,
    References,
    Mentions,
    Contains,
    RelatedTo,
    Supersedes,
    Amends,
    ApprovedBy,
    AuthoredBy,
    AssignedTo,
    CausedBy,
    ResolvedBy,
    Affects,
    SameAs,
    PossibleSameAs,
    RenamedTo,
}

impl RelationshipType {
    pub const ALL: [RelationshipType; 16] = [
        RelationshipType::DependsOn,
        RelationshipType::References,
        RelationshipType::Mentions,
        RelationshipType::Contains,
        RelationshipType::RelatedTo,
        RelationshipType::Supersedes,
        RelationshipType::Amends,
        RelationshipType::ApprovedBy,
        RelationshipType::AuthoredBy,
        RelationshipType::AssignedTo,
        RelationshipType::CausedBy,
        RelationshipType::ResolvedBy,
        RelationshipType::Affects,
        RelationshipType::SameAs,
        RelationshipType::PossibleSameAs,
        RelationshipType::RenamedTo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::DependsOn => "DEPENDS_ON",
            RelationshipType::References => "REFERENCES",
            RelationshipType::Mentions => "MENTIONS",
            RelationshipType::Contains => "CONTAINS",
            RelationshipType::RelatedTo => "RELATED_TO",
            RelationshipType::Supersedes => "SUPERSEDES",
            RelationshipType::Amends => "AMENDS",
            RelationshipType::ApprovedBy => "APPROVED_BY",
            RelationshipType::AuthoredBy => "AUTHORED_BY",
            RelationshipType::AssignedTo => "ASSIGNED_TO",
            RelationshipType::CausedBy => "CAUSED_BY",
            RelationshipType::ResolvedBy => "RESOLVED_BY",
            RelationshipType::Affects => "AFFECTS",
            RelationshipType::SameAs => "SAME_AS",
            RelationshipType::PossibleSameAs => "POSSIBLE_SAME_AS",
            RelationshipType::RenamedTo => "RENAMED_TO",
        }
    }

    /// Identity-review edges are bookkeeping, never followed during expansion.
    pub fn is_traversable(&self) -> bool {
        !matches!(self, RelationshipType::SameAs | RelationshipType::PossibleSameAs)
    }

    /// All edge types expansion may follow, in declaration order.
    pub fn traversable() -> Vec<RelationshipType> {
        Self::ALL.into_iter().filter(|r| r.is_traversable()).collect()
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationshipType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        RelationshipType::ALL
            .into_iter()
            .find(|r| r.as_str() == upper)
            .ok_or_else(|| UnknownVariant {
                kind: "relationship type",
                value: s.to_string(),
            })
    }
}

// --- Certainty ---

/// Evidence label attached to every asserted fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Certainty {
    Supported,
    Likely,
    Possible,
    Conflicting,
    #[default]
    Unknown,
}

impl Certainty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Certainty::Supported => "supported",
            Certainty::Likely => "likely",
            Certainty::Possible => "possible",
            Certainty::Conflicting => "conflicting",
            Certainty::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Certainty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Certainty {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "supported" => Ok(Certainty::Supported),
            "likely" => Ok(Certainty::Likely),
            "possible" => Ok(Certainty::Possible),
            "conflicting" => Ok(Certainty::Conflicting),
            "unknown" | "" => Ok(Certainty::Unknown),
            _ => Err(UnknownVariant {
                kind: "certainty",
                value: s.to_string(),
            }),
        }
    }
}

// --- Entity ---

/// A normalized knowledge-graph node. `id` is always derived from
/// `(entity_type, name, namespace)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub name: String,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    pub confidence: f64,
}

impl Entity {
    pub fn new(entity_type: EntityType, name: &str, namespace: Option<&str>) -> Self {
        Self {
            id: normalize_entity_id(entity_type, name, namespace),
            entity_type,
            name: name.trim().to_string(),
            aliases: BTreeSet::new(),
            confidence: 1.0,
        }
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// SHA-256 over the entity's attributes. Aliases are a sorted set, so the
    /// hash does not depend on insertion order.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update([0]);
        hasher.update(self.entity_type.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.name.as_bytes());
        for alias in &self.aliases {
            hasher.update([0]);
            hasher.update(alias.as_bytes());
        }
        hasher.update([0]);
        // Fixed precision so float formatting noise cannot change the hash.
        hasher.update(format!("{:.4}", self.confidence).as_bytes());
        hex::encode(hasher.finalize())
    }
}

// --- Relationship ---

/// A typed, directed edge with provenance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub source_id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub rel_type: RelationshipType,
    #[serde(default)]
    pub certainty: Certainty,
    #[serde(default)]
    pub source_doc: Option<String>,
    #[serde(default)]
    pub source_line: Option<u32>,
    /// Second named source when `certainty` is `conflicting`.
    #[serde(default)]
    pub conflict_doc: Option<String>,
}

impl Relationship {
    pub fn new(source_id: &str, rel_type: RelationshipType, target_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            rel_type,
            certainty: Certainty::Unknown,
            source_doc: None,
            source_line: None,
            conflict_doc: None,
        }
    }

    pub fn sourced_from(mut self, doc: &str, line: Option<u32>) -> Self {
        self.source_doc = Some(doc.to_string());
        self.source_line = line;
        self
    }

    pub fn with_certainty(mut self, certainty: Certainty) -> Self {
        self.certainty = certainty;
        self
    }

    /// Identity of the edge, ignoring provenance.
    pub fn key(&self) -> (&str, RelationshipType, &str) {
        (&self.source_id, self.rel_type, &self.target_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_round_trips_through_str() {
        for ty in EntityType::ALL {
            assert_eq!(ty.as_str().parse::<EntityType>().unwrap(), ty);
        }
        assert_eq!("  System ".parse::<EntityType>().unwrap(), EntityType::System);
        assert!("team".parse::<EntityType>().is_err());
    }

    #[test]
    fn relationship_type_parses_case_insensitively() {
        assert_eq!(
            "depends_on".parse::<RelationshipType>().unwrap(),
            RelationshipType::DependsOn
        );
        assert!("DROP_ALL".parse::<RelationshipType>().is_err());
    }

    #[test]
    fn identity_edges_are_not_traversable() {
        let traversable = RelationshipType::traversable();
        assert!(!traversable.contains(&RelationshipType::SameAs));
        assert!(!traversable.contains(&RelationshipType::PossibleSameAs));
        assert_eq!(traversable.len(), RelationshipType::ALL.len() - 2);
    }

    #[test]
    fn entity_serializes_type_field() {
        let e = Entity::new(EntityType::System, "Gateway", None);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "system");
        assert_eq!(json["id"], "system:gateway");
    }

    #[test]
    fn content_hash_ignores_alias_order() {
        let a = Entity::new(EntityType::System, "Gateway", None).with_aliases(["gw", "edge"]);
        let b = Entity::new(EntityType::System, "Gateway", None).with_aliases(["edge", "gw"]);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_changes_with_attributes() {
        let a = Entity::new(EntityType::System, "Gateway", None);
        let b = a.clone().with_confidence(0.5);
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn confidence_is_clamped() {
        let e = Entity::new(EntityType::Concept, "x", None).with_confidence(3.0);
        assert_eq!(e.confidence, 1.0);
    }
}
