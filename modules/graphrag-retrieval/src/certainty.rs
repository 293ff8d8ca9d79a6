use std::collections::BTreeSet;

use graphrag_common::Certainty;

/// Independent signals behind one asserted fact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evidence {
    /// Distinct source documents supporting the fact.
    pub documents: BTreeSet<String>,
    /// The fact sits on a path the graph store returned.
    pub graph_path: bool,
    /// Both sources of a contradiction, when one is recorded.
    pub conflict: Option<(String, String)>,
    /// Label already stored on the edge, if any.
    pub stored: Certainty,
}

impl Evidence {
    pub fn from_documents<I, S>(docs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            documents: docs.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_graph_path(mut self) -> Self {
        self.graph_path = true;
        self
    }

    pub fn signals(&self) -> usize {
        self.documents.len() + usize::from(self.graph_path)
    }
}

/// Apply the minimum-evidence rules.
///
/// `conflicting` needs both sources named; an unnamed contradiction falls to
/// `unknown`. `supported` is only kept from the store when the fact also has
/// two independent signals here. Otherwise two signals make `likely`, one makes
/// `possible`, none makes `unknown`.
pub fn label(evidence: &Evidence) -> Certainty {
    if evidence.stored == Certainty::Conflicting || evidence.conflict.is_some() {
        return match &evidence.conflict {
            Some((a, b)) if !a.is_empty() && !b.is_empty() && a != b => Certainty::Conflicting,
            _ => Certainty::Unknown,
        };
    }

    match evidence.signals() {
        0 => Certainty::Unknown,
        1 => Certainty::Possible,
        _ if evidence.stored == Certainty::Supported => Certainty::Supported,
        _ => Certainty::Likely,
    }
}
