//! chat-relay server binary.
//!
//! Loads configuration, builds the identity and LLM provider clients once,
//! and serves the HTTP API until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use chat_relay::config::{Cli, Config};
use chat_relay::identity::firebase::FirebaseAuth;
use chat_relay::llm::openai::OpenAiClient;
use chat_relay::server::routes::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "chat_relay=debug,tower_http=debug"
    } else {
        "chat_relay=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("chat-relay v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);
    config.validate().context("invalid configuration")?;
    let credentials = cli.credentials().context("missing credentials")?;
    let config = Arc::new(config);

    info!(
        listen = %config.server.listen,
        model = %config.llm.default_model,
        max_tokens = config.llm.default_max_tokens,
        project = %credentials.service_account.project_id,
        "Configuration loaded"
    );

    // Provider clients live for the whole process.
    let identity = FirebaseAuth::new(config.identity.clone(), credentials.service_account)
        .context("failed to initialise identity provider")?;
    let llm = OpenAiClient::new(&config.llm, credentials.llm_api_key)
        .context("failed to initialise LLM client")?;

    let state = Arc::new(AppState {
        config: config.clone(),
        identity: Arc::new(identity),
        llm: Arc::new(llm),
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = %listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!("Listening on {listen_addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
