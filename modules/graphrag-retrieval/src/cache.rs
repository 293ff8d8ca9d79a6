use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::debug;

use graphrag_graph::{Record, TemplateName};

/// Cache key: one template call for one subject with its bounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub template: TemplateName,
    pub subject: String,
    pub hops: u32,
    pub limit: u32,
}

/// TTL cache of graph answers, shared by concurrent retrievals.
pub struct ExpansionCache {
    enabled: bool,
    ttl: Duration,
    entries: RwLock<HashMap<CacheKey, (Instant, Vec<Record>)>>,
}

impl ExpansionCache {
    pub fn new(enabled: bool, ttl: Duration) -> Self {
        Self {
            enabled,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, Duration::ZERO)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Vec<Record>> {
        if !self.enabled {
            return None;
        }
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some((at, records)) if at.elapsed() < self.ttl => {
                debug!(template = %key.template, subject = key.subject.as_str(), "Cache hit");
                Some(records.clone())
            }
            _ => {
                debug!(template = %key.template, subject = key.subject.as_str(), "Cache miss");
                None
            }
        }
    }

    pub fn insert(&self, key: CacheKey, records: Vec<Record>) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, (at, _)| at.elapsed() < self.ttl);
        entries.insert(key, (Instant::now(), records));
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
