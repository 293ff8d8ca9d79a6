use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use graphrag_common::GraphRagConfig;
use graphrag_graph::{migrate::migrate, GraphBackend, GraphClient, GraphWriter, QueryOutcome};
use graphrag_retrieval::{EntityResolver, GraphBuilder};

#[derive(Parser)]
#[command(name = "graphrag", about = "GraphRAG operator tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe the graph store and print connector status as JSON
    Health,
    /// Create the entity id uniqueness constraint if missing
    Migrate,
    /// Build the graph from the markdown files in a directory
    Ingest { dir: PathBuf },
    /// Look entities up by id
    Lookup {
        #[arg(required = true)]
        ids: Vec<String>,
        #[arg(long, default_value_t = 25)]
        limit: u32,
    },
}

async fn connect(config: &GraphRagConfig) -> Result<GraphClient> {
    GraphClient::connect(
        &config.neo4j_uri,
        &config.neo4j_user,
        &config.neo4j_password,
        &config.neo4j_database,
    )
    .await
    .with_context(|| format!("connecting to {}", config.neo4j_uri))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = Cli::parse();
    let config = GraphRagConfig::from_env()?;
    config.log_redacted();

    match cli.command {
        Command::Health => {
            let status = match GraphBackend::probe(&config).await {
                GraphBackend::Present(connector) => serde_json::to_value(connector.status())?,
                GraphBackend::Absent(reason) => json!({ "state": "absent", "reason": reason.to_string() }),
            };
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Migrate => {
            let client = connect(&config).await?;
            migrate(&client).await?;
        }
        Command::Ingest { dir } => {
            if !config.enabled {
                bail!("GraphRAG is disabled, set GRAPH_RAG_ENABLED=true to ingest");
            }
            let writer = GraphWriter::new(connect(&config).await?);
            let resolver = Arc::new(EntityResolver::with_store(Arc::new(writer)));
            if let GraphBackend::Present(connector) = GraphBackend::probe(&config).await {
                match resolver.hydrate_from(&connector).await {
                    Ok(added) => tracing::info!(added, "Known entities loaded"),
                    Err(reason) => tracing::warn!(reason = %reason, "Known entities not loaded"),
                }
                connector.close().await;
            }
            let stats = GraphBuilder::new(resolver).build_from_directory(&dir).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Lookup { ids, limit } => {
            let GraphBackend::Present(connector) = GraphBackend::probe(&config).await else {
                bail!("graph backend not configured");
            };
            let outcome = connector
                .run_query("entity_lookup", &json!({ "entity_ids": ids, "limit": limit }))
                .await?;
            match outcome {
                QueryOutcome::Available { records, latency_ms } => {
                    tracing::info!(rows = records.len(), latency_ms, "Lookup complete");
                    println!("{}", serde_json::to_string_pretty(&records)?);
                }
                QueryOutcome::Unavailable { reason } => bail!("graph unavailable: {reason}"),
            }
            connector.close().await;
        }
    }

    Ok(())
}
