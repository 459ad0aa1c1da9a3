//! icemail - mail archiving gateway entry point

use anyhow::Result;
use clap::Parser;
use icemail_api::AppState;
use icemail_common::config::{Config, LoggingConfig, StoreBackend};
use icemail_core::{DeliveryActivator, IntakePipeline, QueryBuilder, SmtpRelay, SmtpServer, Whitelist};
use icemail_storage::{MeilisearchStore, MemoryStore, RecordStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Archive inbound mail, forward whitelisted mail, release the rest on demand
#[derive(Debug, Parser)]
#[command(name = "icemail", version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "FILE", env = "ICEMAIL_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting icemail...");

    // Initialize the record store
    let store: Arc<dyn RecordStore> = match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory record store; records do not survive a restart");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Meilisearch => {
            let store =
                MeilisearchStore::connect(config.store.meilisearch.clone(), &config.search).await?;
            info!("Connected to Meilisearch at {}", config.store.meilisearch.url);
            Arc::new(store)
        }
    };

    // Outbound relay
    let transport = Arc::new(SmtpRelay::new(&config.relay)?);
    info!(
        "Relaying through {}:{} ({:?})",
        config.relay.host, config.relay.port, config.relay.security
    );

    let whitelist = Whitelist::new(config.whitelist.clone());
    info!("{} whitelist entries loaded", whitelist.entries().len());

    let pipeline = Arc::new(IntakePipeline::new(store.clone(), transport.clone(), whitelist));
    let state = AppState {
        store: store.clone(),
        queries: Arc::new(QueryBuilder::new(store.clone(), config.search.clone())),
        activator: Arc::new(DeliveryActivator::new(store.clone(), transport)),
    };

    // Start SMTP server
    let smtp_server = SmtpServer::new(config.smtp.clone(), pipeline);
    let smtp_handle = tokio::spawn(async move {
        if let Err(e) = smtp_server.run().await {
            error!("SMTP server error: {}", e);
        }
    });

    // Start API server
    let app = icemail_api::create_router(state, &config.api.cors_origins);
    let api_addr = format!("{}:{}", config.api.host, config.api.port);
    let listener = tokio::net::TcpListener::bind(&api_addr).await?;
    info!("API server listening on {}", api_addr);
    let api_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("API server error: {}", e);
        }
    });

    info!("icemail started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    smtp_handle.abort();
    api_handle.abort();

    info!("icemail shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (json, text) = if config.format.eq_ignore_ascii_case("json") {
        (Some(fmt::layer().json().with_target(true)), None)
    } else {
        (None, Some(fmt::layer().with_target(true).with_level(true)))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}
