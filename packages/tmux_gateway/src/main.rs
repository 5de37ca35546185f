use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

mod agentio;
mod agents;
mod control;
mod handlers;
mod ws;
mod wsbase;

use agentio::Prompter;
use agents::Registry;
use tmux_control::{ControlMode, PipePaneManager};
use ws::Gateway;

#[derive(Parser)]
#[command(name = "tmux-gateway")]
#[command(about = "WebSocket gateway exposing tmux-hosted coding agents as an API")]
struct Cli {
    /// WebSocket / HTTP listen port
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Only expose agents whose working directory is under this path
    /// (empty = no filter)
    #[arg(long, default_value = "")]
    work_dir: String,

    /// Required connection token (Bearer header or ?token=...); empty
    /// disables auth
    #[arg(long, default_value = "")]
    auth_token: String,

    /// Comma-separated origin patterns for the WebSocket upgrade
    #[arg(long, default_value = "localhost:*")]
    allowed_origins: String,

    /// Serve static files from this directory at / (development only)
    #[arg(long, default_value = "")]
    debug_serve_dir: String,

    /// Comma-separated session names the registry ignores
    #[arg(long, default_value = "")]
    skip_sessions: String,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("tmux_gateway=info,tmux_control=info,tower_http=warn,info")
    });
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("starting tmux-gateway");

    let origins = split_list(&cli.allowed_origins);
    let skip_sessions = split_list(&cli.skip_sessions);

    let ctrl = Arc::new(
        ControlMode::connect()
            .await
            .context("open tmux control channel")?,
    );

    let registry = Arc::new(Registry::new(ctrl.clone(), cli.work_dir.clone(), skip_sessions));
    let events = registry
        .take_events()
        .context("registry event stream already taken")?;
    registry.clone().start().await.context("initial agent scan")?;
    info!(agents = registry.count(), "registry started");

    let pipes = Arc::new(PipePaneManager::new(ctrl.clone()));
    let prompter = Arc::new(Prompter::new(ctrl.clone()));
    let gateway = Arc::new(Gateway::new(
        ctrl.clone(),
        registry.clone(),
        pipes.clone(),
        prompter,
        cli.auth_token,
        origins,
    ));
    gateway.ready.store(true, Ordering::Release);

    tokio::spawn(gateway.clone().run_event_fanout(events));

    let mut app = Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz));
    if !cli.debug_serve_dir.is_empty() {
        info!(dir = %cli.debug_serve_dir, "serving static files at /");
        app = app.fallback_service(ServeDir::new(&cli.debug_serve_dir));
    }
    let app = app
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway.clone());

    let listener = TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("bind port {}", cli.port))?;
    info!(port = cli.port, "listening");

    // Shutdown triggers: interrupt, or the control channel dying (fatal).
    let fatal = Arc::new(AtomicBool::new(false));
    {
        let shutdown = gateway.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
            }
            shutdown.cancel();
        });
    }
    {
        let shutdown = gateway.shutdown.clone();
        let fatal = fatal.clone();
        let dead = ctrl.closed();
        tokio::spawn(async move {
            dead.cancelled().await;
            if !shutdown.is_cancelled() {
                error!("tmux control channel died");
                fatal.store(true, Ordering::SeqCst);
                shutdown.cancel();
            }
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(gateway.shutdown.clone().cancelled_owned())
        .await
        .context("serve")?;

    // Teardown: close clients, stop the registry, deactivate every
    // pipe-pane, then drop the control channel.
    gateway.close_all();
    registry.stop();
    pipes.stop_all().await;
    ctrl.shutdown().await;

    if fatal.load(Ordering::SeqCst) {
        anyhow::bail!("tmux control channel closed");
    }
    info!("clean shutdown");
    Ok(())
}
