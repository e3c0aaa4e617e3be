use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use reader::http::{router, AppState};
use reader::model::loader;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "reader", about = "QueryReader — OpenCRUD GraphQL read service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the GraphQL service (default)
    Serve,
    /// Load and validate the schema file, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Init structured logging (respects RUST_LOG; defaults to info)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Load .env if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let schema_file = PathBuf::from(
        std::env::var("SCHEMA_FILE").unwrap_or_else(|_| "schema.json".to_string()),
    );

    match cli.command {
        None | Some(Commands::Serve) => serve(&schema_file).await?,
        Some(Commands::Check) => {
            let model = loader::load_file(&schema_file)?;
            let entities = model.entities().count();
            tracing::info!(file = %schema_file.display(), entities, "Schema is valid");
        }
    }

    Ok(())
}

async fn serve(schema_file: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let model = Arc::new(loader::load_file(schema_file)?);
    tracing::info!(
        file = %schema_file.display(),
        entities = model.entities().count(),
        "Loaded schema"
    );

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "host=localhost user=postgres password=postgres dbname=postgres".to_string());
    let pool_size: u32 = std::env::var("POOL_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10);

    let pool = reader::db::connect_pool(&database_url, pool_size).await?;
    tracing::info!(pool_size, "Connected to PostgreSQL");

    let state = AppState::new(model, pool);

    let bind_addr =
        std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:4000".to_string());
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "GraphQL service online");

    axum::serve(listener, router(state)).await?;

    Ok(())
}
