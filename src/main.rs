//! remote-dispatch - change notification server for a live railway simulation
//!
//! Runs a demo simulation on its own thread and exposes its state over HTTP:
//! long-poll, WebSocket and SSE update streams plus plain read/write
//! endpoints.

use clap::{Parser as ClapParser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use remote_dispatch::{
    api,
    bus::DirtyTagBus,
    config::{self, Config, ConfigError},
    executor::MainThreadExecutor,
    session::{SessionEvent, SessionRegistry},
    shutdown::ShutdownCoordinator,
    sim::{self, SimError, SimulationThread, World},
};

/// remote-dispatch - change notification server for a live railway simulation
#[derive(ClapParser, Debug)]
#[command(name = "remote-dispatch", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the TOML config file
    #[arg(long, env = "REMOTE_DISPATCH_CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the server (the default when no subcommand is given)
    Serve(ServeArgs),

    /// Print the default configuration as TOML
    DefaultConfig,
}

#[derive(clap::Args, Debug, Default)]
struct ServeArgs {
    /// Address to bind the HTTP/WebSocket API server
    #[arg(long, env = "REMOTE_DISPATCH_BIND")]
    bind: Option<SocketAddr>,

    /// Seconds without a poll before a session is dropped
    #[arg(long)]
    session_timeout: Option<u64>,

    /// Seconds a poll waits for a change before returning empty
    #[arg(long)]
    long_poll_timeout: Option<u64>,

    /// Simulation tick in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Seed for the generated world (random if omitted)
    #[arg(long)]
    seed: Option<u64>,

    /// Allowed CORS origin (repeatable)
    #[arg(long = "cors-origin")]
    cors_origins: Vec<String>,
}

impl ServeArgs {
    /// Flags override whatever the config file set.
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(secs) = self.session_timeout {
            config.sessions.session_timeout_secs = secs;
        }
        if let Some(secs) = self.long_poll_timeout {
            config.sessions.long_poll_timeout_secs = secs;
        }
        if let Some(ms) = self.tick_ms {
            config.simulation.tick_ms = ms;
        }
        if !self.cors_origins.is_empty() {
            config.server.cors_origins = self.cors_origins.clone();
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("simulation error: {0}")]
    Sim(#[from] SimError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);

    match cli.command {
        Some(Commands::DefaultConfig) => {
            print!("{}", Config::default().to_toml()?);
            Ok(())
        }
        Some(Commands::Serve(args)) => run_server(&config_path, args).await,
        None => run_server(&config_path, ServeArgs::default()).await,
    }
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(config_path: &std::path::Path, args: ServeArgs) -> Result<(), AppError> {
    let mut config = Config::load_or_default(config_path)?;
    args.apply(&mut config);
    init_tracing(config.log_filter());
    config.validate()?;

    tracing::info!(config = %config_path.display(), "remote-dispatch starting");

    let (executor, queue) = MainThreadExecutor::<World>::new();
    let resolvers = sim::resolvers(executor.clone());
    if !resolvers.covers_all_globals() {
        tracing::warn!("resolver table is missing a global tag; first polls will fail");
    }

    let sessions = SessionRegistry::new(config.sessions.to_session_config(), resolvers);
    let bus = DirtyTagBus::new(sessions.clone());
    let shutdown = ShutdownCoordinator::new();

    let seed = args.seed.unwrap_or_else(rand::random);
    let mut world = World::generate(&config.simulation, seed);
    world.register_change_listener(bus.listener());
    tracing::info!(
        seed,
        trainsets = world.trainset_ids().len(),
        junctions = world.junction_count(),
        "world generated"
    );
    let simulation = SimulationThread::spawn(world, queue, config.simulation.tick())?;

    let state = api::AppState {
        sessions: sessions.clone(),
        bus,
        executor,
        shutdown: shutdown.clone(),
    };
    let app = api::router(
        state,
        api::RouterConfig {
            cors_origins: config.server.cors_origins.clone(),
        },
    );

    let listener = tokio::net::TcpListener::bind(config.server.bind).await?;
    tracing::info!(addr = %config.server.bind, "HTTP/WS server listening");

    // Session presence log, fed by the registry's start/end events.
    let mut events = sessions.subscribe_events();
    let presence = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Started { id, principal }) => {
                    tracing::info!(session = %id, principal = %principal, "session started");
                }
                Ok(SessionEvent::Ended { id, reason }) => {
                    tracing::info!(session = %id, ?reason, "session ended");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });

    // Oneshot channel for server shutdown
    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
    }
    tracing::info!("received Ctrl+C, shutting down");

    // Signal push connections to send close frames
    shutdown.shutdown();
    if !shutdown.wait_for_drain(Duration::from_secs(2)).await {
        tracing::warn!(
            open = shutdown.active_connections(),
            "push connections still open at shutdown"
        );
    }
    let _ = server_shutdown_tx.send(());

    // Wait for HTTP server to stop
    http_handle.await??;

    sessions.clear();
    presence.abort();
    simulation.stop()?;

    tracing::info!("remote-dispatch stopped");
    Ok(())
}
