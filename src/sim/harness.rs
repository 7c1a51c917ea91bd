//! CLI entry point for the simulation harness: runs scripted sessions against
//! the simulated stage and prints every command ack.

use clap::{Parser, Subcommand};
use stagehand_rs::config::{Config, load_config};
use stagehand_rs::hardware::{BackendMode, create_backend};
use stagehand_rs::supervisor::SupervisorHandle;
use stagehand_rs::telemetry::TelemetryPublisher;
use stagehand_rs::watchdog::Watchdog;
use stagehand_rs::{CommandAck, CommandId, CommandRequest, Supervisor, ZoomAction};
use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::broadcast;

const SCENARIOS: [&str; 4] = ["basic", "rejections", "estop", "all"];

/// Simulation Harness CLI
#[derive(Parser, Debug)]
#[command(name = "sim-harness", about = "Scripted sessions against the simulated stage.")]
pub struct Cli {
    /// Path to a TOML config file (overrides defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also write acks as JSON lines to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Scenario to run
    #[arg(long, default_value = "all")]
    scenario: String,

    /// Parameter override (e.g. --param simulation.movement_delay_ms=10)
    #[arg(long, value_parser = parse_key_val, number_of_values = 1)]
    param: Vec<(String, String)>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List available scenarios
    ListScenarios,
    /// Run a scenario (default)
    Run,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.find('=') {
        Some(pos) => Ok((s[..pos].to_string(), s[pos + 1..].to_string())),
        None => Err(format!("Invalid KEY=VAL: no `=` found in '{}'.", s)),
    }
}

fn apply_param(config: &mut Config, key: &str, val: &str) -> Result<(), String> {
    let bad = |e: &dyn std::fmt::Display| format!("{}={}: {}", key, val, e);
    match key {
        "simulation.movement_delay_ms" => config.simulation.movement_delay_ms = val.parse().map_err(|e| bad(&e))?,
        "simulation.fault_probability" => config.simulation.fault_probability = val.parse().map_err(|e| bad(&e))?,
        "safety.hardware_timeout_ms" => config.safety.hardware_timeout_ms = val.parse().map_err(|e| bad(&e))?,
        "stage.feedrate_default" => config.stage.feedrate_default = val.parse().map_err(|e| bad(&e))?,
        "supervisor.queue_capacity" => config.supervisor.queue_capacity = Some(val.parse().map_err(|e| bad(&e))?),
        _ => return Err(format!("Unknown parameter '{}'", key)),
    }
    Ok(())
}

struct Session {
    handle: SupervisorHandle,
    acks: broadcast::Receiver<CommandAck>,
    output: Option<std::fs::File>,
}

impl Session {
    fn report(&mut self, ack: &CommandAck) {
        let line = serde_json::to_string(ack).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e));
        println!("{}", line);
        if let Some(file) = self.output.as_mut() {
            if let Err(e) = writeln!(file, "{}", line) {
                eprintln!("Failed to write ack: {e}");
            }
        }
    }

    async fn submit_all(&mut self, requests: Vec<CommandRequest>) -> HashSet<CommandId> {
        let mut ids = HashSet::new();
        for request in requests {
            match self.handle.submit(request.clone()).await {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(e) => eprintln!("submit {:?} refused: {e}", request),
            }
        }
        ids
    }

    /// Print acks until every id in `waiting` has its terminal ack.
    async fn wait_for(&mut self, mut waiting: HashSet<CommandId>) {
        while !waiting.is_empty() {
            match self.acks.recv().await {
                Ok(ack) => {
                    waiting.remove(&ack.id);
                    self.report(&ack);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => eprintln!("missed {n} acks"),
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Submit every request, then wait for all of their terminal acks.
    async fn batch(&mut self, requests: Vec<CommandRequest>) {
        let ids = self.submit_all(requests).await;
        self.wait_for(ids).await;
    }

    async fn basic(&mut self) {
        println!("# basic: home, moves, zoom and capture");
        self.batch(vec![
            CommandRequest::Home,
            CommandRequest::MoveNozzle { x: 100.0, y: 100.0, z: 50.0, feedrate: None },
            CommandRequest::MoveNozzleXY { x: 120.0, y: 80.0, feedrate: Some(3000) },
            CommandRequest::MoveNozzleZ { z: 20.0, feedrate: None },
            CommandRequest::Zoom { action: ZoomAction::In, value: 800.0 },
            CommandRequest::Zoom { action: ZoomAction::Goto, value: 82.5 },
            CommandRequest::Capture,
            CommandRequest::Zoom { action: ZoomAction::Home, value: 0.0 },
        ])
        .await;
    }

    async fn rejections(&mut self) {
        println!("# rejections: unhomed motion, then out of range once homed");
        self.batch(vec![
            CommandRequest::MoveNozzleZ { z: 10.0, feedrate: None },
            CommandRequest::Home,
            CommandRequest::MoveNozzle { x: 10.0, y: 10.0, z: 999.0, feedrate: None },
            CommandRequest::Zoom { action: ZoomAction::Goto, value: 10.0 },
        ])
        .await;
    }

    async fn estop(&mut self) {
        println!("# estop: stop during a move, drain, reset, re-home");
        self.batch(vec![CommandRequest::Home]).await;
        let mut waiting = self
            .submit_all(vec![
                CommandRequest::MoveNozzle { x: 200.0, y: 200.0, z: 200.0, feedrate: Some(600) },
                CommandRequest::MoveNozzleZ { z: 10.0, feedrate: None },
            ])
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        waiting.extend(self.submit_all(vec![CommandRequest::EmergencyStop, CommandRequest::EmergencyStop]).await);
        self.wait_for(waiting).await;
        match self.handle.reset_emergency_stop().await {
            Ok(()) => println!("# reset: status {}", self.handle.system_status()),
            Err(e) => println!("# reset refused: {e}"),
        }
        self.batch(vec![
            CommandRequest::MoveNozzleZ { z: 5.0, feedrate: None },
            CommandRequest::Home,
            CommandRequest::MoveNozzleZ { z: 5.0, feedrate: None },
        ])
        .await;
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(tracing::Level::WARN).init();

    if let Some(Commands::ListScenarios) = cli.command {
        println!("Available scenarios: {}", SCENARIOS.join(", "));
        return;
    }
    if !SCENARIOS.contains(&cli.scenario.as_str()) {
        eprintln!("Unknown scenario '{}'; available: {}", cli.scenario, SCENARIOS.join(", "));
        std::process::exit(2);
    }

    // 1. Load config (default or from file)
    let mut config = match &cli.config {
        Some(path) => match load_config(&path.to_string_lossy()) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    // 2. Apply parameter overrides
    for (key, val) in &cli.param {
        if let Err(e) = apply_param(&mut config, key, val) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
    if let Err(e) = config.validate() {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let output = match &cli.output {
        Some(path) => match std::fs::File::create(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("Failed to create {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => None,
    };

    // 3. Wire the simulated stage exactly as the host does
    let backend = create_backend(BackendMode::Sim, &config);
    let (supervisor, handle) = Supervisor::new(backend.clone(), &config);
    let telemetry = TelemetryPublisher::new(backend, handle.clone(), &config);
    let watchdog = Watchdog::new(handle.clone(), &config.safety);
    let supervisor_task = tokio::spawn(supervisor.run());
    tokio::spawn(telemetry.run());
    tokio::spawn(watchdog.run());

    let mut session = Session { acks: handle.subscribe_acks(), handle: handle.clone(), output };
    match cli.scenario.as_str() {
        "basic" => session.basic().await,
        "rejections" => session.rejections().await,
        "estop" => session.estop().await,
        _ => {
            session.rejections().await;
            session.basic().await;
            session.estop().await;
        }
    }

    let status = handle.queue_status().await;
    println!("# final: status {} homed {} history {}", status.status, status.homed, status.history_size);
    handle.shutdown();
    let _ = supervisor_task.await;
}
