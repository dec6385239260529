use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use senrag::chat::OpenAiChat;
use senrag::config::{find_config_path, Config, SharedConfig};
use senrag::database::QdrantStore;
use senrag::embeddings::{Embedder, OpenAiEmbedder};
use senrag::rag::RagEngine;
use senrag::server::{self, AppState};

/// A RAG (Retrieval-Augmented Generation) service backed by Qdrant and an OpenAI-compatible API
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the YAML config file (default: first of config.yaml, .config.yaml,
    /// .env.yaml, /etc/senrag/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override server.host
    #[arg(long)]
    host: Option<String>,

    /// Override server.port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(find_config_path);
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!("Config loaded from: {}", config_path.display());

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    std::fs::create_dir_all(&config.upload.save_path)
        .with_context(|| format!("Failed to create upload path {}", config.upload.save_path))?;

    let qdrant_config = config.qdrant.clone();
    let addr = config.bind_address();
    let shared = SharedConfig::new(config);

    let embedder = OpenAiEmbedder::new(shared.clone());
    // The collection is sized for the vectors the embedder produces
    let store = QdrantStore::connect(&qdrant_config, embedder.dimensions())
        .await
        .context("Failed to initialize Qdrant client")?;

    let engine = RagEngine::new(
        Arc::new(embedder),
        Arc::new(store),
        Arc::new(OpenAiChat::new(shared.clone())),
    );

    server::serve(AppState::new(engine, shared), &addr)
        .await
        .context("Server error")?;

    Ok(())
}
