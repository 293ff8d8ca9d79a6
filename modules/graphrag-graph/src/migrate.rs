//! Operator bootstrap for a fresh database: the `Entity.id` uniqueness
//! constraint, created with `IF NOT EXISTS` so re-running is a no-op. No data
//! is rewritten and no other schema is managed here.

use neo4rs::query;
use tracing::{info, warn};

use crate::GraphClient;

pub(crate) const CONSTRAINTS: [&str; 1] =
    ["CREATE CONSTRAINT entity_id_unique IF NOT EXISTS FOR (e:Entity) REQUIRE e.id IS UNIQUE"];

pub async fn migrate(client: &GraphClient) -> Result<(), neo4rs::Error> {
    let g = &client.graph;

    for c in &CONSTRAINTS {
        run_ignoring_exists(g, c).await?;
    }
    info!("Entity id constraint ensured");

    Ok(())
}

async fn run_ignoring_exists(g: &neo4rs::Graph, cypher: &str) -> Result<(), neo4rs::Error> {
    match g.run(query(cypher)).await {
        Ok(_) => Ok(()),
        Err(e) => {
            let msg = e.to_string().to_lowercase();
            if msg.contains("already exists") || msg.contains("equivalent") {
                warn!("Already exists (skipped): {}", cypher.chars().take(80).collect::<String>());
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}
