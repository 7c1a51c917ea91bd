// src/main.rs - Stage host: supervisor, watchdog, telemetry and HTTP API
use clap::Parser;
use stagehand_rs::config::{self, Config};
use stagehand_rs::hardware::{BackendMode, create_backend};
use stagehand_rs::telemetry::TelemetryPublisher;
use stagehand_rs::watchdog::Watchdog;
use stagehand_rs::web::api::{AppStateInner, create_router};
use stagehand_rs::{CommandRequest, Supervisor};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

const DEFAULT_CONFIG: &str = "stagehand.toml";

#[derive(Parser, Debug)]
#[command(name = "stagehand-host", version, about = "Command execution and safety supervisor for the inspection stage")]
struct Cli {
    /// Backend driving the stage
    #[arg(long, value_enum, default_value_t = BackendMode::Sim)]
    mode: BackendMode,

    /// Configuration file (defaults apply when the default file is absent)
    #[arg(long)]
    config: Option<String>,

    /// Override `web.bind`
    #[arg(long)]
    bind: Option<String>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn load(cli: &Cli) -> Result<Config, config::ConfigError> {
    match &cli.config {
        Some(path) => config::load_config(path),
        None if Path::new(DEFAULT_CONFIG).exists() => config::load_config(DEFAULT_CONFIG),
        None => {
            tracing::warn!("{} not found; using built-in defaults", DEFAULT_CONFIG);
            Ok(Config::default())
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("Starting stagehand-host {}", env!("CARGO_PKG_VERSION"));

    let mut config = load(&cli).map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?;
    if let Some(bind) = &cli.bind {
        config.web.bind = bind.clone();
    }
    let config = Arc::new(config);

    tracing::info!(
        "Stage: X {}..{} Y {}..{} Z {}..{} mm, zoom s' {}..{} mm",
        config.stage.x_min,
        config.stage.x_max,
        config.stage.y_min,
        config.stage.y_max,
        config.stage.z_min,
        config.stage.z_max,
        config.zoom.min_s_prime,
        config.zoom.max_s_prime
    );
    if config.web.reset_token.is_none() {
        tracing::warn!("web.reset_token is not set; emergency stops can only be cleared by restarting");
    }

    let backend = create_backend(cli.mode, &config);
    backend.initialize().await.map_err(|e| {
        tracing::error!("Failed to initialize {} backend: {}", backend.name(), e);
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?;

    let (supervisor, handle) = Supervisor::new(backend.clone(), &config);
    let telemetry = TelemetryPublisher::new(backend.clone(), handle.clone(), &config);
    let telemetry_tx = telemetry.sender();
    let watchdog = Watchdog::new(handle.clone(), &config.safety);

    let supervisor_task = tokio::spawn(supervisor.run());
    let telemetry_task = tokio::spawn(telemetry.run());
    let watchdog_task = tokio::spawn(watchdog.run());

    if config.stage.home_on_startup {
        match handle.submit(CommandRequest::Home).await {
            Ok(id) => tracing::info!(command_id = %id, "Homing on startup"),
            Err(e) => tracing::error!("Failed to queue startup homing: {}", e),
        }
    }

    let state = Arc::new(AppStateInner::new(handle.clone(), backend.clone(), telemetry_tx, config.clone()));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.web.bind).await?;
    tracing::info!("Web API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    handle.shutdown();
    for task in [supervisor_task, telemetry_task, watchdog_task] {
        if let Err(e) = task.await {
            tracing::error!("Background task ended abnormally: {}", e);
        }
    }
    if let Err(e) = backend.shutdown().await {
        tracing::warn!("Backend shutdown failed: {}", e);
    }
    tracing::info!("Stopped");
    Ok(())
}
