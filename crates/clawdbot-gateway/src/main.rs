//! The clawdbot gateway binary: one process serving the WS RPC surface,
//! the OpenAI-compat endpoint, the heartbeat runner, and the subagent
//! archive sweeper.

mod app;
mod auth;
mod http;
mod idempotency;
mod runner;
mod ws;

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clawdbot_agent::heartbeat;
use clawdbot_agent::{Orchestrator, SubagentRegistry};
use clawdbot_auth::AuthProfileStore;
use clawdbot_core::config::ClawdbotConfig;
use clawdbot_sessions::SessionStore;

use crate::app::AppState;
use crate::ws::dispatch::AppRpc;

#[derive(Debug, Parser)]
#[command(name = "clawdbot-gateway", about = "Clawdbot agent gateway")]
struct Args {
    /// State directory (config, credentials, sessions).
    #[arg(long, env = "CLAWDBOT_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Override the configured bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Override the configured port.
    #[arg(long)]
    port: Option<u16>,
}

fn default_state_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".clawdbot")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let state_dir = args.state_dir.unwrap_or_else(default_state_dir);
    clawdbot_core::fsio::ensure_private_dir(&state_dir)?;

    let mut config = ClawdbotConfig::load(&state_dir).context("loading clawdbot.json")?;
    if let Some(bind) = args.bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
    auth::validate_bind_policy(&config.gateway.bind, &config.gateway.auth)
        .map_err(|e| anyhow::anyhow!(e))?;

    let bind_addr = format!("{}:{}", config.gateway.bind, config.gateway.port);
    let default_agent = config.agents.default_agent.clone();
    let config = Arc::new(RwLock::new(config));

    let sessions = Arc::new(
        SessionStore::open(&state_dir, &default_agent).context("opening session store")?,
    );
    let auth_store = Arc::new(StdMutex::new(
        AuthProfileStore::ensure(&state_dir).context("opening credential store")?,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&config),
        sessions,
        auth_store,
        Arc::new(runner::DevEchoRunner),
    ));

    let state = AppState::new(state_dir.clone(), Arc::clone(&config), Arc::clone(&orchestrator));

    // Subagent registry re-enters through the same method surface.
    let subagents = Arc::new(SubagentRegistry::new(
        Arc::new(AppRpc(Arc::clone(&state))),
        Arc::clone(&config),
        orchestrator.lifecycle_sender(),
    ));
    subagents.start_sweeper();
    let _ = state.subagents.set(Arc::clone(&subagents));

    // Heartbeat runner with its own shutdown channel.
    let (hb_runner, hb_shutdown, hb_handle) =
        heartbeat::spawn(Arc::clone(&config), Arc::clone(&orchestrator));
    let _ = state.heartbeat.set(hb_runner);

    let router = app::build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(%bind_addr, "clawdbot gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    let _ = hb_shutdown.send(true);
    subagents.stop_sweeper();
    hb_handle.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
