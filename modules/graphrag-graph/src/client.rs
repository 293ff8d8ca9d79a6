use neo4rs::{ConfigBuilder, Graph};

/// Thin wrapper around neo4rs::Graph providing connection setup.
#[derive(Clone)]
pub struct GraphClient {
    pub(crate) graph: Graph,
}

impl GraphClient {
    /// Connect to Neo4j with the given credentials and database.
    pub async fn connect(
        uri: &str,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<Self, neo4rs::Error> {
        let config = ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password)
            .db(database)
            .fetch_size(200)
            .max_connections(50)
            .build()?;
        let graph = Graph::connect(config).await?;
        Ok(Self { graph })
    }
}
