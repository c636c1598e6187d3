//! Relay CLI - orchestration control plane.
//!
//! Single binary that provides:
//! - `relay plan` - decompose a request into a phase-ordered plan
//! - `relay audit` - verify an artifacts directory against a plan
//! - `relay telemetry` - read sensors and show the throttle level
//! - `relay execute` - run one task on the fallback tier
//! - `relay watch` - keep the governor and credit monitor running
//! - `relay status` - configuration and recent events

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use relay_core::{
    adapters::{GeminiClient, TextGenerator},
    kernel::{AuditRequest, ExecuteError, FallbackTask},
    telemetry::CommandSensor,
    ArtifactAuditor, ControlEvent, Dispatcher, EventEmitter, FallbackExecutor, Plan, RelayConfig,
    Scheduler, TaskDecomposer, TelemetryGovernor, Tier,
};

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Orchestration control plane for autonomous coding agents", version)]
struct Cli {
    /// Project root directory
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new project
    Init,

    /// Decompose a request into a plan
    Plan {
        /// Free-text work request
        request: String,

        /// Upper bound on work units
        #[arg(long, default_value_t = 3)]
        max_units: u32,

        /// Write the plan JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Audit an artifacts directory
    Audit {
        /// Plan JSON file
        #[arg(long, conflicts_with = "request")]
        plan: Option<PathBuf>,

        /// Artifacts directory
        #[arg(long, conflicts_with = "request")]
        artifacts: Option<PathBuf>,

        /// Full audit request JSON file ({plan, artifacts_path})
        #[arg(long)]
        request: Option<PathBuf>,
    },

    /// Read sensors and show the throttle level
    Telemetry,

    /// Run one task on the fallback tier
    Execute {
        /// Task title
        title: String,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        context: Option<String>,
    },

    /// Run the governor and credit monitor until interrupted
    Watch {
        /// Show the tier each ready task of this plan would get on every poll
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Primary pool size
        #[arg(long, default_value_t = 5)]
        primary_capacity: usize,
    },

    /// Show configuration and recent events
    Status {
        /// Number of events to show
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let logs = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        logs.json().init();
    } else {
        logs.init();
    }

    let project_root = match cli.project {
        Some(path) => path,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match cli.command {
        Commands::Init => init_project(&project_root),
        Commands::Plan {
            request,
            max_units,
            output,
        } => plan(&project_root, &request, max_units, output).await,
        Commands::Audit {
            plan,
            artifacts,
            request,
        } => audit(&project_root, plan, artifacts, request),
        Commands::Telemetry => telemetry(&project_root).await,
        Commands::Execute {
            title,
            description,
            context,
        } => execute(&project_root, title, description, context).await,
        Commands::Watch {
            plan,
            primary_capacity,
        } => watch(&project_root, plan, primary_capacity).await,
        Commands::Status { limit } => show_status(&project_root, limit),
    }
}

fn load_config(project_root: &Path) -> Result<RelayConfig> {
    let mut config = RelayConfig::load_from_project(project_root)?;
    config.resolve_paths(project_root);
    Ok(config)
}

fn load_plan(path: &Path) -> Result<Plan> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse plan {}", path.display()))
}

fn governor(config: &RelayConfig, project_root: &Path) -> Result<TelemetryGovernor> {
    let timeout = Duration::from_secs(config.telemetry.sensor_timeout_secs);
    let sensor = CommandSensor::from_command_line(&config.telemetry.sensor_command, timeout)
        .context("telemetry.sensor_command is empty")?
        .current_dir(project_root);
    Ok(TelemetryGovernor::new(
        config.telemetry.clone(),
        Box::new(sensor),
    ))
}

async fn plan(
    project_root: &Path,
    request: &str,
    max_units: u32,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(project_root)?;
    let api_key = config
        .api_key
        .clone()
        .context("GEMINI_API_KEY is not set")?;
    let generator: Arc<dyn TextGenerator> = Arc::new(GeminiClient::new(
        &config.api_base,
        &config.planner.model,
        api_key,
        Duration::from_secs(config.planner.timeout_secs),
    ));
    let decomposer = TaskDecomposer::new(config.planner.clone(), generator);
    let events = EventEmitter::new(&config.events_path);

    let plan = decomposer.analyze(request, max_units).await?;
    tracing::info!(summary = %plan.summary(), "Plan created");
    events.emit(
        ControlEvent::new("plan_created", "planner", plan.summary())
            .with_metadata(serde_json::json!({ "plan_id": plan.id, "tasks": plan.task_count() })),
    )?;

    let json = serde_json::to_string_pretty(&plan)?;
    match output {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write plan to {}", path.display()))?;
            println!("Wrote plan to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn audit(
    project_root: &Path,
    plan: Option<PathBuf>,
    artifacts: Option<PathBuf>,
    request: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(project_root)?;
    let request = match (request, plan, artifacts) {
        (Some(path), _, _) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read request from {}", path.display()))?;
            AuditRequest::from_json(&raw)?
        }
        (None, Some(plan), Some(artifacts)) => AuditRequest {
            plan: load_plan(&plan)?,
            artifacts_path: artifacts,
        },
        _ => anyhow::bail!("either --request or both --plan and --artifacts are required"),
    };

    let auditor = ArtifactAuditor::new(config.audit.clone());
    let events = EventEmitter::new(&config.events_path);

    let response = match auditor.handle(&request) {
        Ok(response) => response,
        Err(err) => {
            let body = serde_json::json!({
                "status": "AUDIT_ERROR",
                "code": err.http_status(),
                "error": err.to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
            events.emit_simple("audit_error", "auditor", &err.to_string())?;
            std::process::exit(2);
        }
    };

    events.emit(ControlEvent::from(&response))?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.passed() {
        std::process::exit(1);
    }
    Ok(())
}

async fn telemetry(project_root: &Path) -> Result<()> {
    let config = load_config(project_root)?;
    let governor = governor(&config, project_root)?;

    let reading = governor.poll().await;
    if reading.stale {
        tracing::warn!("Sensor read failed");
    }
    println!("{}", governor.status_message());
    Ok(())
}

async fn execute(
    project_root: &Path,
    title: String,
    description: Option<String>,
    context: Option<String>,
) -> Result<()> {
    let config = load_config(project_root)?;
    let executor = FallbackExecutor::from_config(&config);
    let events = EventEmitter::new(&config.events_path);
    let mut rx = executor.subscribe();

    let task = FallbackTask {
        title,
        description,
        context,
    };
    let result = executor.execute(&task).await;

    while let Ok(event) = rx.try_recv() {
        events.emit(ControlEvent::from(&event))?;
    }

    match result {
        Ok(report) => {
            println!("{}", report.summary);
            println!();
            println!(
                "Tokens: {}, latency: {} ms",
                report.tokens_used, report.latency_ms
            );
            Ok(())
        }
        Err(ExecuteError::Upstream(err)) if err.is_retryable() => {
            anyhow::bail!("fallback call failed (retryable): {}", err)
        }
        Err(err) => Err(err.into()),
    }
}

async fn watch(
    project_root: &Path,
    plan_path: Option<PathBuf>,
    primary_capacity: usize,
) -> Result<()> {
    let config = load_config(project_root)?;
    let plan = plan_path.as_deref().map(load_plan).transpose()?;

    let governor = Arc::new(governor(&config, project_root)?);
    let executor = Arc::new(FallbackExecutor::from_config(&config));
    let events = EventEmitter::new(&config.events_path);
    let scheduler = Scheduler::new();
    let dispatcher = Dispatcher::new(primary_capacity);

    let mut thermal = governor.subscribe();
    let mut credits = executor.subscribe();

    let poller = governor.clone().spawn();
    let monitor = executor.clone().spawn_credit_monitor();

    events.emit_simple("watch_start", "cli", "Control plane started")?;
    tracing::info!(project = %project_root.display(), "Watching");

    let mut ticker = tokio::time::interval(Duration::from_secs(
        config.telemetry.poll_interval_secs.max(1),
    ));
    let completed = HashSet::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = thermal.recv() => match event {
                Ok(event) => events.emit(ControlEvent::from(&event))?,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Dropped thermal events")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = credits.recv() => match event {
                Ok(event) => events.emit(ControlEvent::from(&event))?,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Dropped fallback events")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                let Some(plan) = &plan else { continue };
                let schedule =
                    scheduler.schedule(plan, &completed, governor.current_max_concurrent());
                let mut primary_active = 0;
                for task_id in schedule.ready.iter() {
                    let tier = dispatcher.select_tier(primary_active, &governor, &executor);
                    if tier == Tier::Primary {
                        primary_active += 1;
                    }
                    tracing::info!(task = %task_id, tier = %tier, "Would dispatch");
                }
            }
        }
    }

    poller.abort();
    if let Some(monitor) = monitor {
        monitor.abort();
    }
    events.emit_simple("watch_stop", "cli", "Control plane stopped")?;
    Ok(())
}

fn show_status(project_root: &Path, limit: usize) -> Result<()> {
    let config = load_config(project_root)?;
    let executor = FallbackExecutor::from_config(&config);
    let events = EventEmitter::new(&config.events_path);
    let recent_events = events.read_recent(limit);

    println!("Relay Status");
    println!("============");
    println!();
    println!("Project: {}", project_root.display());
    println!(
        "Poll interval: {}s, quality gate: {}",
        config.telemetry.poll_interval_secs, config.audit.quality_gate
    );
    println!();
    println!("{}", executor.status_message());
    println!();
    println!("Recent events:");
    if recent_events.is_empty() {
        println!("  (none)");
    }
    for event in &recent_events {
        println!(
            "  {} [{}] {}: {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.source,
            event.event_type,
            event.message
        );
    }

    Ok(())
}

fn init_project(project_root: &Path) -> Result<()> {
    let relay_dir = project_root.join(".relay");
    std::fs::create_dir_all(&relay_dir)?;

    let config_path = relay_dir.join("config.yaml");
    if !config_path.exists() {
        let default_config = r#"# Relay Control Plane Configuration
# The API key is read from GEMINI_API_KEY, never from this file.

telemetry:
  poll_interval_secs: 60
  # Ceilings per throttle level; stop is always 0
  max_concurrent:
    ideal: 15
    acceptable: 8
    throttle: 3
  # Prints {"cpu": .., "gpu": .., "gpuHot": ..}; -1 means unavailable
  sensor_command: ["powershell", "-NoProfile", "-ExecutionPolicy", "Bypass", "-File", "scripts/read-temps.ps1"]
  sensor_timeout_secs: 15

planner:
  model: gemini-2.5-flash
  temperature: 0.3

fallback:
  model: gemini-2.5-flash
  timeout_ms: 30000
  max_consecutive_errors: 5
  probe_interval_secs: 300

audit:
  quality_gate: 80
  manifest_name: manifest.json
"#;
        std::fs::write(&config_path, default_config)?;
    }

    println!("Initialized Relay project at {}", project_root.display());
    println!();
    println!("Created:");
    println!("  .relay/config.yaml - control plane configuration");
    println!();
    println!("Next steps:");
    println!("  1. export GEMINI_API_KEY=...");
    println!("  2. Run: relay plan \"<request>\" -o plan.json");

    Ok(())
}
