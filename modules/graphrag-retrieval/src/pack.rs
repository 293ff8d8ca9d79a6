//! Context packing: one text block with a graph status line, seed text,
//! labeled facts and `[DOC:<id>]` citations.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use graphrag_common::{Certainty, Entity, Relationship};

use crate::certainty::{self, Evidence};
use crate::resolver::{PinSource, PinnedEntity};
use crate::retriever::GraphStatus;
use crate::traits::SeedDocument;

/// Machine-parseable citation for one document id.
pub fn citation(doc_id: &str) -> String {
    format!("[DOC:{doc_id}]")
}

/// First line of a packed context, telling graph-grounded context apart from
/// vector-only context. `None` when the graph is switched off.
pub fn status_line(status: GraphStatus) -> Option<&'static str> {
    match status {
        GraphStatus::Disabled => None,
        GraphStatus::Unavailable => Some("[graph: unavailable] vector-only context, graph facts omitted"),
        GraphStatus::Empty => Some("[graph: empty] graph reachable, no related facts found"),
        GraphStatus::Engaged => Some("[graph: engaged] graph-grounded context"),
        GraphStatus::Degraded => Some("[graph: degraded] partial graph context, some expansions failed"),
    }
}

/// A labeled entity line.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityFact {
    pub entity: Entity,
    pub certainty: Certainty,
    pub sources: Vec<String>,
}

pub struct PackInput<'a> {
    pub status: GraphStatus,
    pub seeds: &'a [SeedDocument],
    pub pinned: &'a [PinnedEntity],
    pub entities: &'a [Entity],
    pub relationships: &'a [Relationship],
    pub related_documents: &'a [String],
    pub provenance: &'a BTreeMap<String, Vec<String>>,
    pub max_results: usize,
}

/// Relabel graph edges from the evidence at hand: the edge's own provenance,
/// seed documents mentioning both endpoints, and the graph path itself.
pub fn label_relationships(relationships: &[Relationship], pinned: &[PinnedEntity]) -> Vec<Relationship> {
    let mentions: BTreeMap<&str, BTreeSet<&str>> = pinned
        .iter()
        .map(|p| (p.entity.id.as_str(), p.mentioned_in.iter().map(String::as_str).collect()))
        .collect();

    relationships
        .iter()
        .map(|rel| {
            let mut evidence = Evidence::default().with_graph_path();
            evidence.stored = rel.certainty;
            evidence.documents.extend(rel.source_doc.iter().cloned());
            if let (Some(a), Some(b)) = (mentions.get(rel.source_id.as_str()), mentions.get(rel.target_id.as_str())) {
                evidence.documents.extend(a.intersection(b).map(|d| d.to_string()));
            }
            if let (Some(a), Some(b)) = (&rel.source_doc, &rel.conflict_doc) {
                evidence.conflict = Some((a.clone(), b.clone()));
            }
            let mut labeled = rel.clone();
            labeled.certainty = certainty::label(&evidence);
            labeled
        })
        .collect()
}

/// Entity lines: pinned entities first, then graph neighbors, capped at `max_results`.
pub fn entity_facts(input: &PackInput<'_>) -> Vec<EntityFact> {
    let on_graph_path: BTreeSet<&str> = input
        .relationships
        .iter()
        .flat_map(|r| [r.source_id.as_str(), r.target_id.as_str()])
        .collect();

    let mut facts: Vec<EntityFact> = Vec::new();
    let mut seen = BTreeSet::new();

    let pinned = input
        .pinned
        .iter()
        .filter(|p| p.source != PinSource::SeedDocument)
        .map(|p| (&p.entity, p.mentioned_in.clone()));
    let neighbors = input.entities.iter().map(|e| {
        let sources = input.provenance.get(&e.id).cloned().unwrap_or_default();
        (e, sources)
    });

    for (entity, sources) in pinned.chain(neighbors) {
        if facts.len() >= input.max_results || !seen.insert(entity.id.clone()) {
            continue;
        }
        let mut evidence = Evidence::from_documents(sources.iter().cloned());
        evidence.graph_path = on_graph_path.contains(entity.id.as_str());
        facts.push(EntityFact {
            entity: entity.clone(),
            certainty: certainty::label(&evidence),
            sources,
        });
    }
    facts
}

pub fn pack(input: &PackInput<'_>) -> String {
    let mut out = String::new();

    if let Some(line) = status_line(input.status) {
        out.push_str(line);
        out.push('\n');
    }

    if !input.seeds.is_empty() {
        out.push_str("Documents:\n");
        for seed in input.seeds {
            let _ = writeln!(out, "{} {}", citation(&seed.doc_id), seed.text.trim());
        }
    }

    if input.status == GraphStatus::Disabled {
        return out.trim_end().to_string();
    }

    let facts = entity_facts(input);
    let names: BTreeMap<&str, &str> = input
        .pinned
        .iter()
        .map(|p| &p.entity)
        .chain(input.entities.iter())
        .map(|e| (e.id.as_str(), e.name.as_str()))
        .collect();

    if !facts.is_empty() {
        out.push_str("Entities:\n");
        for fact in &facts {
            let _ = write!(
                out,
                "- {} ({}) [{}]",
                fact.entity.name, fact.entity.entity_type, fact.certainty
            );
            for source in &fact.sources {
                let _ = write!(out, " {}", citation(source));
            }
            out.push('\n');
        }
    }

    if !input.relationships.is_empty() {
        out.push_str("Relationships:\n");
        for rel in input.relationships {
            let source = names.get(rel.source_id.as_str()).copied().unwrap_or(&rel.source_id);
            let target = names.get(rel.target_id.as_str()).copied().unwrap_or(&rel.target_id);
            let _ = write!(out, "- {source} -{}-> {target} [{}]", rel.rel_type, rel.certainty);
            let mut cited = BTreeSet::new();
            let docs = rel
                .source_doc
                .iter()
                .chain(rel.conflict_doc.iter())
                .chain(input.provenance.get(&rel.source_id).into_iter().flatten());
            for doc in docs {
                if cited.insert(doc.as_str()) {
                    let _ = write!(out, " {}", citation(doc));
                }
            }
            out.push('\n');
        }
    }

    if !input.related_documents.is_empty() {
        out.push_str("Related documents:");
        for doc in input.related_documents {
            let _ = write!(out, " {}", citation(doc));
        }
        out.push('\n');
    }

    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphrag_common::{EntityType, RelationshipType};

    fn pin(entity: Entity, doc: &str) -> PinnedEntity {
        PinnedEntity {
            entity,
            mentioned_in: vec![doc.to_string()],
            source: PinSource::Name,
        }
    }

    fn input<'a>(
        status: GraphStatus,
        seeds: &'a [SeedDocument],
        pinned: &'a [PinnedEntity],
        relationships: &'a [Relationship],
        provenance: &'a BTreeMap<String, Vec<String>>,
    ) -> PackInput<'a> {
        PackInput {
            status,
            seeds,
            pinned,
            entities: &[],
            relationships,
            related_documents: &[],
            provenance,
            max_results: 50,
        }
    }

    #[test]
    fn disabled_pack_is_seed_text_only() {
        let seeds = [SeedDocument::new("ADR-001", "Gateway depends on auth.", 0.9)];
        let pinned = [pin(Entity::new(EntityType::System, "Gateway", None), "ADR-001")];
        let provenance = BTreeMap::new();
        let text = pack(&input(GraphStatus::Disabled, &seeds, &pinned, &[], &provenance));
        assert_eq!(text, "Documents:\n[DOC:ADR-001] Gateway depends on auth.");
    }

    #[test]
    fn unavailable_is_labeled_first() {
        let seeds = [SeedDocument::new("ADR-001", "text", 0.9)];
        let provenance = BTreeMap::new();
        let text = pack(&input(GraphStatus::Unavailable, &seeds, &[], &[], &provenance));
        assert!(text.starts_with("[graph: unavailable]"));
        assert!(text.contains("[DOC:ADR-001] text"));
    }

    #[test]
    fn every_relationship_carries_label_and_citation() {
        let seeds = [SeedDocument::new("ADR-001", "Gateway notes", 0.9)];
        let gateway = Entity::new(EntityType::System, "Gateway", None);
        let auth = Entity::new(EntityType::System, "Auth Service", None);
        let pinned = [pin(gateway.clone(), "ADR-001")];
        let rels = label_relationships(
            &[Relationship::new(&gateway.id, RelationshipType::DependsOn, &auth.id)],
            &pinned,
        );
        let mut provenance = BTreeMap::new();
        provenance.insert(gateway.id.clone(), vec!["ADR-001".to_string()]);
        provenance.insert(auth.id.clone(), vec!["ADR-001".to_string()]);

        let mut inp = input(GraphStatus::Engaged, &seeds, &pinned, &rels, &provenance);
        let entities = [auth.clone()];
        inp.entities = &entities;
        let text = pack(&inp);

        assert!(text.starts_with("[graph: engaged]"));
        assert!(text.contains("- Gateway -DEPENDS_ON-> Auth Service [possible] [DOC:ADR-001]"));
        assert!(text.contains("- Auth Service (system) [likely] [DOC:ADR-001]"));
    }

    #[test]
    fn edge_provenance_makes_fact_likely() {
        let gateway = Entity::new(EntityType::System, "Gateway", None);
        let rel = Relationship::new(&gateway.id, RelationshipType::DependsOn, "system:auth_service")
            .sourced_from("ADR-001", Some(4));
        let labeled = label_relationships(&[rel], &[]);
        assert_eq!(labeled[0].certainty, Certainty::Likely);
    }

    #[test]
    fn entity_lines_are_capped() {
        let pinned: Vec<PinnedEntity> = (0..5)
            .map(|i| pin(Entity::new(EntityType::Concept, &format!("c{i}"), None), "d"))
            .collect();
        let provenance = BTreeMap::new();
        let mut inp = input(GraphStatus::Empty, &[], &pinned, &[], &provenance);
        inp.max_results = 3;
        assert_eq!(entity_facts(&inp).len(), 3);
    }
}
