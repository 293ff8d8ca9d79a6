use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use graphrag_common::{RelationshipType, ValidationError};

use crate::store::{GraphStore, Record, StoreError};
use crate::templates::{AuditViolation, ParamKind, ParamSpec, TemplateName, TemplateRegistry, TemplateSpec};

/// A value bound to a template parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Str(String),
    StrList(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityLookupParams {
    pub entity_ids: Vec<String>,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpandNeighborsParams {
    pub entity_id: String,
    pub max_hops: u32,
    pub relationships: Vec<RelationshipType>,
    pub limit: u32,
}

impl ExpandNeighborsParams {
    pub fn new(entity_id: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            max_hops: 2,
            relationships: RelationshipType::traversable(),
            limit: 25,
        }
    }

    pub fn hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelatedDocumentsParams {
    pub doc_id: String,
    pub limit: u32,
}

/// One page of the entity catalog: ids strictly after `after`, ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityCatalogParams {
    pub after: String,
    pub limit: u32,
}

impl EntityCatalogParams {
    pub fn first_page(limit: u32) -> Self {
        Self {
            after: String::new(),
            limit,
        }
    }

    pub fn after(mut self, after: &str) -> Self {
        self.after = after.to_string();
        self
    }
}

/// A template together with its validated, strongly-typed parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundQuery {
    HealthCheck,
    EntityLookup(EntityLookupParams),
    ExpandNeighbors(ExpandNeighborsParams),
    RelatedDocuments(RelatedDocumentsParams),
    EntityCatalog(EntityCatalogParams),
}

impl BoundQuery {
    pub fn template(&self) -> TemplateName {
        match self {
            BoundQuery::HealthCheck => TemplateName::HealthCheck,
            BoundQuery::EntityLookup(_) => TemplateName::EntityLookup,
            BoundQuery::ExpandNeighbors(_) => TemplateName::ExpandNeighbors,
            BoundQuery::RelatedDocuments(_) => TemplateName::RelatedDocuments,
            BoundQuery::EntityCatalog(_) => TemplateName::EntityCatalog,
        }
    }

    pub fn spec(&self) -> &'static TemplateSpec {
        self.template().spec()
    }

    /// Effective row cap for this query.
    pub fn limit(&self) -> usize {
        match self {
            BoundQuery::HealthCheck => 1,
            BoundQuery::EntityLookup(p) => p.limit as usize,
            BoundQuery::ExpandNeighbors(p) => p.limit as usize,
            BoundQuery::RelatedDocuments(p) => p.limit as usize,
            BoundQuery::EntityCatalog(p) => p.limit as usize,
        }
    }

    /// Re-apply the declared ceilings. Typed parameters built in code go through
    /// the same bounds as caller-supplied JSON.
    pub fn bounded(self) -> Self {
        let spec = self.spec();
        let cap = |name: &str, value: u32| -> u32 {
            let p = spec.parameter(name);
            let max = p.and_then(|p| p.max).unwrap_or(i64::MAX);
            let default = p.and_then(|p| p.default).unwrap_or(1);
            let value = if value == 0 { default } else { value as i64 };
            value.min(max).max(1) as u32
        };
        match self {
            BoundQuery::HealthCheck => BoundQuery::HealthCheck,
            BoundQuery::EntityLookup(mut p) => {
                p.limit = cap("limit", p.limit);
                p.entity_ids.truncate(list_cap(spec, "entity_ids"));
                BoundQuery::EntityLookup(p)
            }
            BoundQuery::ExpandNeighbors(mut p) => {
                p.limit = cap("limit", p.limit);
                p.max_hops = cap("max_hops", p.max_hops);
                p.relationships.retain(|r| r.is_traversable());
                p.relationships.dedup();
                if p.relationships.is_empty() {
                    p.relationships = RelationshipType::traversable();
                }
                BoundQuery::ExpandNeighbors(p)
            }
            BoundQuery::RelatedDocuments(mut p) => {
                p.limit = cap("limit", p.limit);
                BoundQuery::RelatedDocuments(p)
            }
            BoundQuery::EntityCatalog(mut p) => {
                p.limit = cap("limit", p.limit);
                BoundQuery::EntityCatalog(p)
            }
        }
    }

    /// Parameter bindings in declaration order.
    pub fn bindings(&self) -> Vec<(&'static str, ParamValue)> {
        match self {
            BoundQuery::HealthCheck => Vec::new(),
            BoundQuery::EntityLookup(p) => vec![
                ("entity_ids", ParamValue::StrList(p.entity_ids.clone())),
                ("limit", ParamValue::Int(p.limit as i64)),
            ],
            BoundQuery::ExpandNeighbors(p) => vec![
                ("entity_id", ParamValue::Str(p.entity_id.clone())),
                ("max_hops", ParamValue::Int(p.max_hops as i64)),
                (
                    "relationships",
                    ParamValue::StrList(
                        p.relationships.iter().map(|r| r.as_str().to_string()).collect(),
                    ),
                ),
                ("limit", ParamValue::Int(p.limit as i64)),
            ],
            BoundQuery::RelatedDocuments(p) => vec![
                ("doc_id", ParamValue::Str(p.doc_id.clone())),
                ("limit", ParamValue::Int(p.limit as i64)),
            ],
            BoundQuery::EntityCatalog(p) => vec![
                ("after", ParamValue::Str(p.after.clone())),
                ("limit", ParamValue::Int(p.limit as i64)),
            ],
        }
    }
}

fn list_cap(spec: &TemplateSpec, name: &str) -> usize {
    spec.parameter(name)
        .and_then(|p| p.max)
        .map(|m| m as usize)
        .unwrap_or(usize::MAX)
}

/// Rows returned by one execution, with the wall-clock time it took.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    pub records: Vec<Record>,
    pub latency_ms: f64,
}

/// Validate caller-supplied parameters for a named template.
///
/// Numeric parameters above their declared max are clamped, not rejected.
/// Zero or negative values take the declared default.
pub fn validate(template: &str, params: &Value) -> Result<BoundQuery, ValidationError> {
    let name = TemplateName::from_name(template)
        .ok_or_else(|| ValidationError::UnknownTemplate(template.to_string()))?;
    let spec = name.spec();

    let empty = serde_json::Map::new();
    let object = match params {
        Value::Null => &empty,
        Value::Object(map) => map,
        _ => {
            return Err(ValidationError::InvalidParameter {
                template: spec.name,
                parameter: "params",
                expected: "an object",
            })
        }
    };

    if let Some(unexpected) = object.keys().find(|k| spec.parameter(k).is_none()) {
        return Err(ValidationError::UnexpectedParameter {
            template: spec.name,
            parameter: unexpected.clone(),
        });
    }

    let args = Args { spec, object };

    let bound = match name {
        TemplateName::HealthCheck => BoundQuery::HealthCheck,
        TemplateName::EntityLookup => BoundQuery::EntityLookup(EntityLookupParams {
            entity_ids: args.str_list("entity_ids")?.unwrap_or_default(),
            limit: args.int("limit")?,
        }),
        TemplateName::ExpandNeighbors => BoundQuery::ExpandNeighbors(ExpandNeighborsParams {
            entity_id: args.string("entity_id")?,
            max_hops: args.int("max_hops")?,
            relationships: relationship_filter(args.str_list("relationships")?)?,
            limit: args.int("limit")?,
        }),
        TemplateName::RelatedDocuments => BoundQuery::RelatedDocuments(RelatedDocumentsParams {
            doc_id: args.string("doc_id")?,
            limit: args.int("limit")?,
        }),
        TemplateName::EntityCatalog => BoundQuery::EntityCatalog(EntityCatalogParams {
            after: args.string("after")?,
            limit: args.int("limit")?,
        }),
    };
    Ok(bound)
}

/// Resolve a requested relationship filter against the allowlist. Mixing allowed
/// and disallowed names is an error; an empty or fully disallowed request means
/// every allowed type.
fn relationship_filter(
    requested: Option<Vec<String>>,
) -> Result<Vec<RelationshipType>, ValidationError> {
    let requested = requested.unwrap_or_default();
    let mut allowed = Vec::new();
    let mut rejected = Vec::new();
    for raw in &requested {
        match raw.parse::<RelationshipType>() {
            Ok(r) if r.is_traversable() => {
                if !allowed.contains(&r) {
                    allowed.push(r);
                }
            }
            _ => rejected.push(raw.clone()),
        }
    }

    match (allowed.is_empty(), rejected.first()) {
        (false, Some(bad)) => Err(ValidationError::RelationshipNotAllowed(bad.clone())),
        (false, None) => Ok(allowed),
        (true, _) => {
            if !rejected.is_empty() {
                debug!(?rejected, "No allowed relationship types requested, using all");
            }
            Ok(RelationshipType::traversable())
        }
    }
}

struct Args<'a> {
    spec: &'static TemplateSpec,
    object: &'a serde_json::Map<String, Value>,
}

impl Args<'_> {
    fn param(&self, name: &str) -> Result<&'static ParamSpec, ValidationError> {
        self.spec
            .parameter(name)
            .ok_or_else(|| ValidationError::UnexpectedParameter {
                template: self.spec.name,
                parameter: name.to_string(),
            })
    }

    fn int(&self, name: &str) -> Result<u32, ValidationError> {
        let p = self.param(name)?;
        debug_assert_eq!(p.kind, ParamKind::Int);
        let raw = match self.object.get(name) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_i64().ok_or(ValidationError::InvalidParameter {
                template: self.spec.name,
                parameter: p.name,
                expected: "an integer",
            })?),
        };

        let value = match (raw, p.default) {
            (Some(v), _) if v > 0 => v,
            (_, Some(default)) => default,
            (Some(v), None) => v,
            (None, None) => {
                return Err(ValidationError::MissingParameter {
                    template: self.spec.name,
                    parameter: p.name,
                })
            }
        };

        match p.max {
            Some(max) if value > max => {
                if p.default.is_some() {
                    warn!(
                        template = self.spec.name,
                        parameter = p.name,
                        requested = value,
                        max,
                        "Parameter clamped to declared max"
                    );
                    Ok(max as u32)
                } else {
                    Err(ValidationError::ParameterOutOfBounds {
                        template: self.spec.name,
                        parameter: p.name,
                        value,
                        max,
                    })
                }
            }
            _ if value < 1 => Err(ValidationError::ParameterOutOfBounds {
                template: self.spec.name,
                parameter: p.name,
                value,
                max: p.max.unwrap_or(i64::MAX),
            }),
            _ => Ok(value as u32),
        }
    }

    /// Required strings must be non-empty; optional ones default to empty.
    fn string(&self, name: &str) -> Result<String, ValidationError> {
        let p = self.param(name)?;
        debug_assert_eq!(p.kind, ParamKind::Str);
        match self.object.get(name) {
            None | Some(Value::Null) if p.required => Err(ValidationError::MissingParameter {
                template: self.spec.name,
                parameter: p.name,
            }),
            None | Some(Value::Null) => Ok(String::new()),
            Some(Value::String(s)) if !p.required || !s.trim().is_empty() => Ok(s.clone()),
            Some(_) => Err(ValidationError::InvalidParameter {
                template: self.spec.name,
                parameter: p.name,
                expected: "a non-empty string",
            }),
        }
    }

    fn str_list(&self, name: &str) -> Result<Option<Vec<String>>, ValidationError> {
        let p = self.param(name)?;
        debug_assert_eq!(p.kind, ParamKind::StrList);
        let invalid = || ValidationError::InvalidParameter {
            template: self.spec.name,
            parameter: p.name,
            expected: "a list of strings",
        };
        let items = match self.object.get(name) {
            None | Some(Value::Null) if p.required => {
                return Err(ValidationError::MissingParameter {
                    template: self.spec.name,
                    parameter: p.name,
                })
            }
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Array(items)) => items,
            Some(_) => return Err(invalid()),
        };

        if let Some(max) = p.max {
            if items.len() as i64 > max {
                return Err(ValidationError::ParameterOutOfBounds {
                    template: self.spec.name,
                    parameter: p.name,
                    value: items.len() as i64,
                    max,
                });
            }
        }

        items
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or_else(invalid))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

/// The sole path by which a query reaches the graph store.
pub struct SafeQueryEngine {
    store: Arc<dyn GraphStore>,
    query_timeout: Duration,
}

impl SafeQueryEngine {
    /// Build an engine over `store`. Fails if the registry breaks a structural rule.
    pub fn new(
        store: Arc<dyn GraphStore>,
        query_timeout: Duration,
    ) -> Result<Self, Vec<AuditViolation>> {
        TemplateRegistry::audit()?;
        Ok(Self {
            store,
            query_timeout,
        })
    }

    pub fn validate(&self, template: &str, params: &Value) -> Result<BoundQuery, ValidationError> {
        validate(template, params)
    }

    /// Run a bound query with the per-query timeout. Rows beyond the bound limit
    /// are dropped.
    pub async fn execute(&self, query: &BoundQuery) -> Result<QueryResult, StoreError> {
        let query = query.clone().bounded();
        let start = Instant::now();

        let mut records = match tokio::time::timeout(self.query_timeout, self.store.fetch(&query)).await
        {
            Ok(result) => result?,
            Err(_) => return Err(StoreError::Timeout(self.query_timeout.as_millis() as u64)),
        };

        let limit = query.limit();
        if records.len() > limit {
            warn!(
                template = query.template().as_str(),
                returned = records.len(),
                limit,
                "Store returned more rows than bound, truncating"
            );
            records.truncate(limit);
        }

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        debug!(
            template = query.template().as_str(),
            rows = records.len(),
            latency_ms,
            "Template executed"
        );
        Ok(QueryResult {
            records,
            latency_ms,
        })
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_template_is_rejected() {
        let err = validate("drop_everything", &json!({})).unwrap_err();
        assert_eq!(err, ValidationError::UnknownTemplate("drop_everything".into()));
    }

    #[test]
    fn oversized_limit_is_clamped() {
        let bound = validate("entity_lookup", &json!({"entity_ids": ["system:gateway"], "limit": 5000}))
            .unwrap();
        match bound {
            BoundQuery::EntityLookup(p) => assert_eq!(p.limit, 100),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_required_parameter() {
        let err = validate("entity_lookup", &json!({"limit": 5})).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingParameter {
                template: "entity_lookup",
                parameter: "entity_ids"
            }
        );

        let err = validate("expand_neighbors", &json!({})).unwrap_err();
        assert!(matches!(err, ValidationError::MissingParameter { parameter: "entity_id", .. }));
    }

    #[test]
    fn hops_are_clamped_to_two() {
        let bound = validate("expand_neighbors", &json!({"entity_id": "system:gateway", "max_hops": 9}))
            .unwrap();
        match bound {
            BoundQuery::ExpandNeighbors(p) => {
                assert_eq!(p.max_hops, 2);
                assert_eq!(p.limit, 25);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn zero_or_negative_limit_takes_default() {
        let bound = validate("related_documents", &json!({"doc_id": "document:adr_001", "limit": -4}))
            .unwrap();
        assert_eq!(bound.limit(), 10);
    }

    #[test]
    fn oversized_id_list_is_out_of_bounds() {
        let ids: Vec<String> = (0..101).map(|i| format!("concept:c{i}")).collect();
        let err = validate("entity_lookup", &json!({"entity_ids": ids})).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::ParameterOutOfBounds {
                parameter: "entity_ids",
                value: 101,
                max: 100,
                ..
            }
        ));
    }

    #[test]
    fn wrong_types_are_invalid() {
        let err = validate("entity_lookup", &json!({"entity_ids": "system:gateway"})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidParameter { parameter: "entity_ids", .. }));

        let err = validate("entity_lookup", &json!({"entity_ids": [1, 2]})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidParameter { .. }));

        let err = validate("entity_lookup", &json!({"entity_ids": [], "limit": "ten"})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidParameter { parameter: "limit", .. }));

        let err = validate("health_check", &json!([1])).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidParameter { parameter: "params", .. }));
    }

    #[test]
    fn undeclared_parameter_is_rejected() {
        let err = validate("health_check", &json!({"cypher": "MATCH (n) DETACH DELETE n"})).unwrap_err();
        assert!(matches!(err, ValidationError::UnexpectedParameter { .. }));
    }

    #[test]
    fn mixed_relationship_filter_is_rejected() {
        let err = validate(
            "expand_neighbors",
            &json!({"entity_id": "system:gateway", "relationships": ["DEPENDS_ON", "OWNS_EVERYTHING"]}),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::RelationshipNotAllowed("OWNS_EVERYTHING".into()));
    }

    #[test]
    fn empty_or_fully_disallowed_filter_means_all() {
        for rels in [json!([]), json!(["SAME_AS", "NOPE"])] {
            let bound = validate(
                "expand_neighbors",
                &json!({"entity_id": "system:gateway", "relationships": rels}),
            )
            .unwrap();
            match bound {
                BoundQuery::ExpandNeighbors(p) => {
                    assert_eq!(p.relationships, RelationshipType::traversable())
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn allowed_filter_is_kept_and_deduplicated() {
        let bound = validate(
            "expand_neighbors",
            &json!({"entity_id": "system:gateway", "relationships": ["depends_on", "DEPENDS_ON", "AFFECTS"]}),
        )
        .unwrap();
        match bound {
            BoundQuery::ExpandNeighbors(p) => assert_eq!(
                p.relationships,
                vec![RelationshipType::DependsOn, RelationshipType::Affects]
            ),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn typed_params_are_bounded_too() {
        let q = BoundQuery::ExpandNeighbors(ExpandNeighborsParams::new("system:gateway").hops(5).limit(10_000))
            .bounded();
        match q {
            BoundQuery::ExpandNeighbors(p) => {
                assert_eq!(p.max_hops, 2);
                assert_eq!(p.limit, 100);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn catalog_cursor_is_optional() {
        let bound = validate("entity_catalog", &json!({})).unwrap();
        assert_eq!(bound, BoundQuery::EntityCatalog(EntityCatalogParams::first_page(100)));

        let bound = validate("entity_catalog", &json!({"after": "system:gateway", "limit": 500})).unwrap();
        assert_eq!(
            bound,
            BoundQuery::EntityCatalog(EntityCatalogParams::first_page(100).after("system:gateway"))
        );

        let err = validate("entity_catalog", &json!({"after": 7})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidParameter { parameter: "after", .. }));
    }

    #[test]
    fn reading_an_undeclared_parameter_is_an_error() {
        let object = serde_json::Map::new();
        let args = Args {
            spec: TemplateName::HealthCheck.spec(),
            object: &object,
        };
        let err = args.int("limit").unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnexpectedParameter {
                template: "health_check",
                parameter: "limit".into()
            }
        );
        assert!(args.string("entity_id").is_err());
        assert!(args.str_list("entity_ids").is_err());
    }

    #[test]
    fn bindings_follow_declaration_order() {
        let q = validate("expand_neighbors", &json!({"entity_id": "system:gateway"})).unwrap();
        let names: Vec<&str> = q.bindings().into_iter().map(|(n, _)| n).collect();
        let declared: Vec<&str> = q.spec().parameters.iter().map(|p| p.name).collect();
        assert_eq!(names, declared);
    }
}
