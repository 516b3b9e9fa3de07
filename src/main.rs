use blockgraph::config::AppConfig;
use blockgraph::logic::Engine;
use blockgraph::seed;
use blockgraph::store::PostgresStore;
use log::info;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging with explicit filter to suppress sqlx debug logs
    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    let config = AppConfig::load()?;
    info!(
        "Configuration loaded: max_write_retries={}, page_size={}",
        config.engine.max_write_retries, config.engine.page_size
    );

    info!("Connecting to PostgreSQL...");
    let database_url = config.database_url()?;
    let max_connections = config.database.max_connections.unwrap_or(20);
    let postgres_store = PostgresStore::new(&database_url, max_connections).await?;

    info!("Running database migrations...");
    postgres_store.migrate().await?;

    let seeded = seed::seed_builtin_blocks(&postgres_store).await?;

    let engine = Engine::new(Arc::new(postgres_store), config.engine.clone());
    let catalog = engine
        .registry
        .list_available(&blockgraph::model::UserContext::system(), None)
        .await?;
    info!(
        "Block catalog ready: {} definitions ({} built-in)",
        catalog.len(),
        seeded
    );

    Ok(())
}
