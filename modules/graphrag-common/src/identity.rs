use crate::types::EntityType;

/// Canonical name used when a name normalizes to nothing (e.g. "???").
pub const UNNAMED: &str = "unnamed";

/// Derive the stable entity id `type:canonical_name[:namespace]`.
///
/// Pure and total: identical arguments always produce the identical string.
pub fn normalize_entity_id(entity_type: EntityType, name: &str, namespace: Option<&str>) -> String {
    let canonical = canonical_name(name);
    let canonical = if canonical.is_empty() {
        UNNAMED.to_string()
    } else {
        canonical
    };

    match namespace.map(canonical_name).filter(|ns| !ns.is_empty()) {
        Some(ns) => format!("{}:{canonical}:{ns}", entity_type.as_str()),
        None => format!("{}:{canonical}", entity_type.as_str()),
    }
}

/// Lowercase, map non-alphanumerics to `_`, collapse runs, trim.
pub fn canonical_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = true;
    for ch in raw.chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_collapses_and_trims() {
        assert_eq!(canonical_name("  Auth   Service!! "), "auth_service");
        assert_eq!(canonical_name("API-Gateway/v2"), "api_gateway_v2");
        assert_eq!(canonical_name("__x__"), "x");
    }

    #[test]
    fn id_has_type_prefix_and_optional_namespace() {
        assert_eq!(
            normalize_entity_id(EntityType::System, "Gateway", None),
            "system:gateway"
        );
        assert_eq!(
            normalize_entity_id(EntityType::Person, "Ada Lovelace", Some("Eng Team")),
            "person:ada_lovelace:eng_team"
        );
        assert_eq!(
            normalize_entity_id(EntityType::Person, "Ada", Some("  ")),
            "person:ada"
        );
    }

    #[test]
    fn empty_name_is_unnamed() {
        assert_eq!(normalize_entity_id(EntityType::Concept, "???", None), "concept:unnamed");
    }

    #[test]
    fn normalization_is_idempotent() {
        let inputs = [
            (EntityType::Incident, "INC-042 outage", Some("prod")),
            (EntityType::Document, "ADR-001", None),
            (EntityType::Artifact, "Zoë's   notebook", None),
        ];
        for (ty, name, ns) in inputs {
            assert_eq!(normalize_entity_id(ty, name, ns), normalize_entity_id(ty, name, ns));
        }
    }

    #[test]
    fn unicode_letters_survive() {
        assert_eq!(canonical_name("Zoë"), "zoë");
    }
}
