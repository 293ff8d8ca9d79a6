//! The allowlisted query registry.
//!
//! Every pattern here is hand-authored: read-only, parameter-bound, at most two
//! hops deep and capped by `LIMIT $limit`. The set is closed at compile time and
//! checked once by [`TemplateRegistry::audit`] when an engine is built.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Hard ceiling on traversal depth across every template.
pub const MAX_TEMPLATE_HOPS: u32 = 2;
/// Hard ceiling on `$limit` across every template.
pub const MAX_TEMPLATE_RESULTS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Int,
    Str,
    StrList,
}

/// Declared shape of one template parameter. For `Int`, `max` bounds the value;
/// for `StrList`, it bounds the list length.
#[derive(Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub default: Option<i64>,
    pub max: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Int,
    Float,
    Str,
    StrList,
    Edges,
}

#[derive(Debug)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

#[derive(Debug)]
pub struct TemplateSpec {
    pub name: &'static str,
    pub pattern: &'static str,
    pub parameters: &'static [ParamSpec],
    pub columns: &'static [Column],
    pub max_hops: u32,
    pub max_results: u32,
}

impl TemplateSpec {
    pub fn parameter(&self, name: &str) -> Option<&'static ParamSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Closed set of registered templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateName {
    HealthCheck,
    EntityLookup,
    ExpandNeighbors,
    RelatedDocuments,
    EntityCatalog,
}

impl TemplateName {
    pub const ALL: [TemplateName; 5] = [
        TemplateName::HealthCheck,
        TemplateName::EntityLookup,
        TemplateName::ExpandNeighbors,
        TemplateName::RelatedDocuments,
        TemplateName::EntityCatalog,
    ];

    pub fn spec(&self) -> &'static TemplateSpec {
        match self {
            TemplateName::HealthCheck => &HEALTH_CHECK,
            TemplateName::EntityLookup => &ENTITY_LOOKUP,
            TemplateName::ExpandNeighbors => &EXPAND_NEIGHBORS,
            TemplateName::RelatedDocuments => &RELATED_DOCUMENTS,
            TemplateName::EntityCatalog => &ENTITY_CATALOG,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.spec().name
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for TemplateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const LIMIT_PARAM_NAME: &str = "limit";

static HEALTH_CHECK: TemplateSpec = TemplateSpec {
    name: "health_check",
    pattern: "RETURN 1 AS health",
    parameters: &[],
    columns: &[Column {
        name: "health",
        kind: ColumnKind::Int,
    }],
    max_hops: 0,
    max_results: 1,
};

static ENTITY_LOOKUP: TemplateSpec = TemplateSpec {
    name: "entity_lookup",
    pattern: "MATCH (e:Entity)
              WHERE e.id IN $entity_ids
              RETURN e.id AS id,
                     e.name AS name,
                     e.type AS type,
                     coalesce(e.confidence, 1.0) AS confidence
              ORDER BY id ASC
              LIMIT $limit",
    parameters: &[
        ParamSpec {
            name: "entity_ids",
            kind: ParamKind::StrList,
            required: true,
            default: None,
            max: Some(100),
        },
        ParamSpec {
            name: LIMIT_PARAM_NAME,
            kind: ParamKind::Int,
            required: false,
            default: Some(25),
            max: Some(100),
        },
    ],
    columns: &[
        Column {
            name: "id",
            kind: ColumnKind::Str,
        },
        Column {
            name: "name",
            kind: ColumnKind::Str,
        },
        Column {
            name: "type",
            kind: ColumnKind::Str,
        },
        Column {
            name: "confidence",
            kind: ColumnKind::Float,
        },
    ],
    max_hops: 0,
    max_results: 100,
};

// One row per neighbor, carrying its shortest path from the start entity.
// The `*1..2` bound is part of the pattern; `$max_hops` can only narrow it.
// Equal-length paths are ordered by node ids, then relationship types.
static EXPAND_NEIGHBORS: TemplateSpec = TemplateSpec {
    name: "expand_neighbors",
    pattern: "MATCH path = (start:Entity {id: $entity_id})-[*1..2]-(neighbor:Entity)
              WHERE length(path) <= $max_hops
                AND neighbor.id <> start.id
                AND ALL(r IN relationships(path) WHERE type(r) IN $relationships)
              WITH neighbor, path
              ORDER BY length(path) ASC,
                       [n IN nodes(path) | n.id] ASC,
                       [r IN relationships(path) | type(r)] ASC
              WITH neighbor, collect(path)[0] AS shortest
              RETURN neighbor.id AS neighbor_id,
                     neighbor.name AS neighbor_name,
                     neighbor.type AS neighbor_type,
                     length(shortest) AS hops,
                     [r IN relationships(shortest) | {
                         source: startNode(r).id,
                         type: type(r),
                         target: endNode(r).id,
                         certainty: coalesce(r.certainty, 'unknown'),
                         source_doc: coalesce(r.source_doc, ''),
                         source_line: coalesce(r.source_line, 0),
                         conflict_doc: coalesce(r.conflict_doc, '')
                     }] AS edges
              ORDER BY hops ASC, neighbor_id ASC
              LIMIT $limit",
    parameters: &[
        ParamSpec {
            name: "entity_id",
            kind: ParamKind::Str,
            required: true,
            default: None,
            max: None,
        },
        ParamSpec {
            name: "max_hops",
            kind: ParamKind::Int,
            required: false,
            default: Some(2),
            max: Some(MAX_TEMPLATE_HOPS as i64),
        },
        ParamSpec {
            name: "relationships",
            kind: ParamKind::StrList,
            required: false,
            default: None,
            max: Some(16),
        },
        ParamSpec {
            name: LIMIT_PARAM_NAME,
            kind: ParamKind::Int,
            required: false,
            default: Some(25),
            max: Some(100),
        },
    ],
    columns: &[
        Column {
            name: "neighbor_id",
            kind: ColumnKind::Str,
        },
        Column {
            name: "neighbor_name",
            kind: ColumnKind::Str,
        },
        Column {
            name: "neighbor_type",
            kind: ColumnKind::Str,
        },
        Column {
            name: "hops",
            kind: ColumnKind::Int,
        },
        Column {
            name: "edges",
            kind: ColumnKind::Edges,
        },
    ],
    max_hops: MAX_TEMPLATE_HOPS,
    max_results: 100,
};

static RELATED_DOCUMENTS: TemplateSpec = TemplateSpec {
    name: "related_documents",
    pattern: "MATCH (d:Entity {id: $doc_id})-[:REFERENCES]->(related:Entity)
              WHERE related.type = 'document'
              RETURN related.id AS doc_id, related.name AS name
              ORDER BY doc_id ASC
              LIMIT $limit",
    parameters: &[
        ParamSpec {
            name: "doc_id",
            kind: ParamKind::Str,
            required: true,
            default: None,
            max: None,
        },
        ParamSpec {
            name: LIMIT_PARAM_NAME,
            kind: ParamKind::Int,
            required: false,
            default: Some(10),
            max: Some(100),
        },
    ],
    columns: &[
        Column {
            name: "doc_id",
            kind: ColumnKind::Str,
        },
        Column {
            name: "name",
            kind: ColumnKind::Str,
        },
    ],
    max_hops: 1,
    max_results: 100,
};

// Keyset-paged listing of non-document entities, used to warm the resolver.
static ENTITY_CATALOG: TemplateSpec = TemplateSpec {
    name: "entity_catalog",
    pattern: "MATCH (e:Entity)
              WHERE e.id > $after
                AND e.type <> 'document'
              RETURN e.id AS id,
                     e.name AS name,
                     e.type AS type,
                     coalesce(e.aliases, []) AS aliases,
                     coalesce(e.confidence, 1.0) AS confidence
              ORDER BY id ASC
              LIMIT $limit",
    parameters: &[
        ParamSpec {
            name: "after",
            kind: ParamKind::Str,
            required: false,
            default: None,
            max: None,
        },
        ParamSpec {
            name: LIMIT_PARAM_NAME,
            kind: ParamKind::Int,
            required: false,
            default: Some(100),
            max: Some(100),
        },
    ],
    columns: &[
        Column {
            name: "id",
            kind: ColumnKind::Str,
        },
        Column {
            name: "name",
            kind: ColumnKind::Str,
        },
        Column {
            name: "type",
            kind: ColumnKind::Str,
        },
        Column {
            name: "aliases",
            kind: ColumnKind::StrList,
        },
        Column {
            name: "confidence",
            kind: ColumnKind::Float,
        },
    ],
    max_hops: 0,
    max_results: 100,
};

/// A structural rule broken by a registered pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditViolation {
    pub template: &'static str,
    pub rule: String,
}

impl fmt::Display for AuditViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.template, self.rule)
    }
}

const WRITE_KEYWORDS: &[&str] = &[
    "CREATE", "MERGE", "SET", "DELETE", "REMOVE", "DROP", "DETACH", "FOREACH", "LOAD", "CALL",
];

static VAR_LENGTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]|]*\*([^\]]*)\]").expect("valid var-length regex"));
static LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bLIMIT\s+\$limit\b").expect("valid limit regex"));
static INLINE_LITERAL_LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(LIMIT|SKIP)\s+\d").expect("valid literal regex"));

pub struct TemplateRegistry;

impl TemplateRegistry {
    pub fn names() -> impl Iterator<Item = &'static str> {
        TemplateName::ALL.into_iter().map(|t| t.as_str())
    }

    pub fn get(name: &str) -> Option<&'static TemplateSpec> {
        TemplateName::from_name(name).map(|t| t.spec())
    }

    /// Check every registered template against the structural rules.
    pub fn audit() -> Result<(), Vec<AuditViolation>> {
        let violations: Vec<AuditViolation> = TemplateName::ALL
            .into_iter()
            .flat_map(|t| audit_spec(t.spec()))
            .collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

/// Structural rules for one template. Exposed so ad-hoc patterns can be
/// checked the same way the registry is.
pub fn audit_spec(spec: &TemplateSpec) -> Vec<AuditViolation> {
    let mut violations = Vec::new();
    let mut flag = |rule: String| {
        violations.push(AuditViolation {
            template: spec.name,
            rule,
        })
    };

    for word in spec
        .pattern
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
    {
        let upper = word.to_ascii_uppercase();
        if WRITE_KEYWORDS.contains(&upper.as_str()) {
            flag(format!("contains disallowed keyword {upper}"));
        }
    }

    for caps in VAR_LENGTH_RE.captures_iter(spec.pattern) {
        let range = caps[1].trim();
        let upper = match range.split_once("..") {
            Some((_, hi)) => hi.trim(),
            None => range,
        };
        match upper.parse::<u32>() {
            Ok(hops) if hops <= MAX_TEMPLATE_HOPS && hops <= spec.max_hops => {}
            Ok(hops) => flag(format!("traversal depth {hops} exceeds {MAX_TEMPLATE_HOPS}")),
            Err(_) => flag("unbounded variable-length traversal".to_string()),
        }
    }

    if INLINE_LITERAL_LIMIT_RE.is_match(spec.pattern) {
        flag("inline literal in LIMIT/SKIP".to_string());
    }

    if spec.max_results > MAX_TEMPLATE_RESULTS {
        flag(format!(
            "declared max_results {} exceeds {MAX_TEMPLATE_RESULTS}",
            spec.max_results
        ));
    }

    if spec.max_results > 1 {
        if !LIMIT_RE.is_match(spec.pattern) {
            flag("missing LIMIT $limit".to_string());
        }
        match spec.parameter(LIMIT_PARAM_NAME).and_then(|p| p.max) {
            Some(max) if max <= MAX_TEMPLATE_RESULTS as i64 => {}
            _ => flag("limit parameter must declare max <= 100".to_string()),
        }
    }

    for param in spec.parameters {
        if !spec.pattern.contains(&format!("${}", param.name)) {
            flag(format!("declared parameter {} is never bound", param.name));
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shipped_registry_passes_audit() {
        assert_eq!(TemplateRegistry::audit(), Ok(()));
    }

    #[test]
    fn lookup_by_name() {
        assert!(TemplateRegistry::get("entity_lookup").is_some());
        assert!(TemplateRegistry::get("drop_everything").is_none());
        assert_eq!(TemplateRegistry::names().count(), TemplateName::ALL.len());
    }

    #[test]
    fn audit_rejects_write_keyword() {
        let spec = TemplateSpec {
            name: "bad_merge",
            pattern: "MERGE (e:Entity {id: $id}) RETURN e LIMIT $limit",
            parameters: &[],
            columns: &[],
            max_hops: 0,
            max_results: 0,
        };
        let violations = audit_spec(&spec);
        assert!(violations.iter().any(|v| v.rule.contains("MERGE")));
    }

    #[test]
    fn audit_rejects_deep_traversal() {
        let spec = TemplateSpec {
            name: "too_deep",
            pattern: "MATCH p = (a:Entity)-[*1..3]-(b) RETURN p LIMIT $limit",
            parameters: &[ParamSpec {
                name: "limit",
                kind: ParamKind::Int,
                required: false,
                default: Some(10),
                max: Some(100),
            }],
            columns: &[],
            max_hops: 3,
            max_results: 100,
        };
        let violations = audit_spec(&spec);
        assert!(violations.iter().any(|v| v.rule.contains("depth 3")));
    }

    #[test]
    fn audit_rejects_unbounded_traversal() {
        let spec = TemplateSpec {
            name: "unbounded",
            pattern: "MATCH p = (a:Entity)-[*]-(b) RETURN p LIMIT $limit",
            parameters: &[ParamSpec {
                name: "limit",
                kind: ParamKind::Int,
                required: false,
                default: Some(10),
                max: Some(100),
            }],
            columns: &[],
            max_hops: 2,
            max_results: 100,
        };
        let violations = audit_spec(&spec);
        assert!(violations.iter().any(|v| v.rule.contains("unbounded")));
    }

    #[test]
    fn audit_rejects_procedure_calls_and_literal_limits() {
        let spec = TemplateSpec {
            name: "proc",
            pattern: "CALL db.labels() YIELD label RETURN label LIMIT 5000",
            parameters: &[],
            columns: &[],
            max_hops: 0,
            max_results: 100,
        };
        let rules: Vec<String> = audit_spec(&spec).into_iter().map(|v| v.rule).collect();
        assert!(rules.iter().any(|r| r.contains("CALL")));
        assert!(rules.iter().any(|r| r.contains("inline literal")));
        assert!(rules.iter().any(|r| r.contains("missing LIMIT")));
    }

    #[test]
    fn expansion_breaks_path_ties_deterministically() {
        let pattern = TemplateName::ExpandNeighbors.spec().pattern;
        assert!(pattern.contains("[n IN nodes(path) | n.id] ASC"));
        assert!(pattern.contains("[r IN relationships(path) | type(r)] ASC"));
    }

    #[test]
    fn every_template_respects_declared_ceilings() {
        for t in TemplateName::ALL {
            let spec = t.spec();
            assert!(spec.max_hops <= MAX_TEMPLATE_HOPS, "{}", spec.name);
            assert!(spec.max_results <= MAX_TEMPLATE_RESULTS, "{}", spec.name);
        }
    }
}
