mod chat;
mod config;
mod llm;
mod server;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::llm::LlamaEngine;

/// HTTP chat endpoints backed by a local GGUF model
#[derive(Parser, Debug)]
#[command(name = "promptgate")]
#[command(about = "Serve a local llama.cpp model behind fixed system prompts")]
struct Args {
    /// Path to the YAML config file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Port to listen on, overriding `server.port` from the config
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_timer(ChronoLocal::rfc_3339()))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("promptgate=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Nothing binds until both the config and the model are loaded
    let mut config = Config::load(&args.config).with_context(|| {
        format!("There is an issue with config file '{}'", args.config.display())
    })?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!("Loaded config from {}", args.config.display());
    info!("Model: {}", config.model_path.display());
    info!(
        "Context {} tokens, batch {}, GPU layers {}",
        config.model.n_ctx, config.model.n_batch, config.model.n_gpu_layers
    );

    let engine = LlamaEngine::load(&config.model_path, &config.model)
        .context("Failed to load the model")?;

    let app = server::router(&config.endpoints, Arc::new(engine));
    for endpoint in &config.endpoints {
        info!("  POST {}", endpoint.route);
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
