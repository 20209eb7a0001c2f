//! Composition root for the chat relay: parses the binary-level config,
//! wires the session hub (C1/C2/C3/C5), the collaborator HTTP client and the
//! worker bridge registry (C4) into one process, and serves until shutdown.
//!
//! A small per-binary wrapper config flattens the library's own config
//! struct ([`ServerConfig`] flattens [`RelayConfig`]), a cancellation token
//! driven by the OS shutdown signal feeds `axum::serve`'s graceful shutdown,
//! then a bounded wait lets background tasks unwind before exit.

use std::{process::ExitCode, sync::Arc, time::Duration};

use chatrelay_bridge::BridgeRegistry;
use chatrelay_collaborator_client::{CollaboratorService, CollaboratorTimeouts, HttpCollaboratorClient};
use chatrelay_hub::config::RelayConfig;
use clap::Parser;
use eyre::Context as _;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Binary-level wrapper around [`RelayConfig`] adding process-lifecycle
/// settings that don't belong in the library config itself.
#[derive(Parser, Debug)]
struct ServerConfig {
    /// Max wait time the binary waits for its background tasks during
    /// shutdown (the presence sweep and any in-flight worker bridges).
    #[clap(
        long,
        env = "RELAY_MAX_WAIT_TIME_SHUTDOWN",
        default_value = "10s",
        value_parser = humantime::parse_duration,
    )]
    max_wait_time_shutdown: Duration,

    /// The relay's own configuration.
    #[clap(flatten)]
    relay: RelayConfig,
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatrelay=info,info")))
        .init();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting chatrelay-server");

    let config = ServerConfig::parse();
    config
        .relay
        .assert_presence_ratio()
        .context("invalid presence TTL/refresh-interval configuration")?;

    match run(config).await {
        Ok(()) => {
            tracing::info!("good night!");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            tracing::error!("{err:?}");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Spawns a task that cancels the returned token on `SIGINT`/`ctrl_c`.
fn spawn_shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
        }
        signal_token.cancel();
    });
    token
}

async fn run(config: ServerConfig) -> eyre::Result<()> {
    tracing::info!(
        bind_addr = %config.relay.bind_addr,
        relay_url = %config.relay.relay_url,
        "effective configuration"
    );

    let cancellation_token = spawn_shutdown_signal();

    let collaborator: CollaboratorService = Arc::new(
        HttpCollaboratorClient::new(
            config.relay.collaborator_url.clone(),
            config.relay.shared_secret.clone(),
            CollaboratorTimeouts {
                thread_connect: config.relay.timeout_thread_connect,
                thread_history: config.relay.timeout_thread_history,
                summarize: config.relay.timeout_summarize,
                chat_sms: config.relay.timeout_chat_sms,
            },
        )
        .context("while building the collaborator HTTP client")?,
    );

    let bridge_registry = BridgeRegistry::new(cancellation_token.clone());
    let bind_addr = config.relay.bind_addr.clone();
    let router = chatrelay_hub::build_router(
        config.relay,
        collaborator,
        bridge_registry,
        cancellation_token.clone(),
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("while binding {bind_addr}"))?;
    let axum_cancel_token = cancellation_token.clone();
    let server = tokio::spawn(async move {
        tracing::info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "listening"
        );
        let shutdown_signal = axum_cancel_token.clone();
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown_signal.cancelled().await })
            .await;
        tracing::info!("axum server shut down");
        if let Err(err) = result {
            tracing::error!(?err, "axum server error");
        }
        // cancel in case axum exited on its own, so nothing is left waiting
        // on a token the server no longer intends to cancel.
        axum_cancel_token.cancel();
    });

    tracing::info!("everything started successfully - now waiting for shutdown...");
    cancellation_token.cancelled().await;

    tracing::info!(
        max_wait = ?config.max_wait_time_shutdown,
        "waiting for background tasks to finish"
    );
    match tokio::time::timeout(config.max_wait_time_shutdown, server).await {
        Ok(_) => tracing::info!("successfully finished shutdown in time"),
        Err(_) => tracing::warn!("could not finish shutdown within the configured deadline"),
    }
    Ok(())
}
