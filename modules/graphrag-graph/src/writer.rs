use chrono::Utc;
use neo4rs::query;
use tracing::{debug, warn};

use graphrag_common::{Entity, Relationship};

use crate::GraphClient;

/// Write-side wrapper for the graph. Used by ingestion only; the retrieval
/// path never holds one.
#[derive(Clone)]
pub struct GraphWriter {
    client: GraphClient,
}

impl GraphWriter {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    /// Stored content hash of an entity, if it exists.
    pub async fn entity_hash(&self, id: &str) -> Result<Option<String>, neo4rs::Error> {
        let q = query("MATCH (e:Entity {id: $id}) RETURN e.content_hash AS hash").param("id", id);
        let mut stream = self.client.graph.execute(q).await?;
        match stream.next().await? {
            Some(row) => Ok(row.get::<Option<String>>("hash").ok().flatten()),
            None => Ok(None),
        }
    }

    /// Create or update an entity. Skips the write when `hash` matches the
    /// stored content hash. Returns whether a write happened.
    pub async fn upsert_entity(&self, entity: &Entity, hash: &str) -> Result<bool, neo4rs::Error> {
        if self.entity_hash(&entity.id).await?.as_deref() == Some(hash) {
            debug!(entity = entity.id.as_str(), "Entity unchanged, skipping write");
            return Ok(false);
        }

        let q = query(
            "MERGE (e:Entity {id: $id})
             ON CREATE SET e.created_at = datetime($now)
             SET e.name = $name,
                 e.type = $type,
                 e.aliases = $aliases,
                 e.confidence = $confidence,
                 e.content_hash = $hash,
                 e.updated_at = datetime($now)",
        )
        .param("id", entity.id.as_str())
        .param("name", entity.name.as_str())
        .param("type", entity.entity_type.as_str())
        .param("aliases", entity.aliases.iter().cloned().collect::<Vec<String>>())
        .param("confidence", entity.confidence)
        .param("hash", hash)
        .param("now", Utc::now().to_rfc3339());

        self.client.graph.run(q).await?;
        Ok(true)
    }

    /// Merge a typed edge between two existing entities. Provenance is
    /// overwritten with the latest sighting.
    pub async fn upsert_relationship(&self, rel: &Relationship) -> Result<bool, neo4rs::Error> {
        // Relationship types cannot be parameterized; the label comes from a closed enum.
        let cypher = format!(
            "MATCH (s:Entity {{id: $source}}), (t:Entity {{id: $target}})
             MERGE (s)-[r:{}]->(t)
             SET r.certainty = $certainty,
                 r.source_doc = $source_doc,
                 r.source_line = $source_line,
                 r.conflict_doc = $conflict_doc
             RETURN count(r) AS merged",
            rel.rel_type.as_str()
        );
        let q = query(&cypher)
            .param("source", rel.source_id.as_str())
            .param("target", rel.target_id.as_str())
            .param("certainty", rel.certainty.as_str())
            .param("source_doc", rel.source_doc.clone().unwrap_or_default())
            .param("source_line", rel.source_line.map(i64::from).unwrap_or(0))
            .param("conflict_doc", rel.conflict_doc.clone().unwrap_or_default());

        let mut stream = self.client.graph.execute(q).await?;
        let merged = match stream.next().await? {
            Some(row) => row.get::<i64>("merged").unwrap_or(0),
            None => 0,
        };
        if merged == 0 {
            warn!(
                source = rel.source_id.as_str(),
                target = rel.target_id.as_str(),
                rel_type = rel.rel_type.as_str(),
                "Relationship endpoints missing, edge not written"
            );
        }
        Ok(merged > 0)
    }

    pub async fn entity_count(&self) -> Result<i64, neo4rs::Error> {
        let mut stream = self
            .client
            .graph
            .execute(query("MATCH (e:Entity) RETURN count(e) AS n"))
            .await?;
        match stream.next().await? {
            Some(row) => Ok(row.get::<i64>("n").unwrap_or(0)),
            None => Ok(0),
        }
    }
}
