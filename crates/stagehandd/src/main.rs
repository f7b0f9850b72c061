//! stagehandd: the Stagehand rollout daemon.
//!
//! Runs the rollout scheduler against a redb state store, and offers
//! one-shot operator commands on the same store.
//!
//! # Usage
//!
//! ```text
//! stagehandd --data-dir /var/lib/stagehand run
//! stagehandd apply plan.toml --owner alice --activate
//! stagehandd advance <stage-id>
//! ```
//!
//! redb allows one process per database file, so the one-shot commands
//! must not run while `run` holds the store open.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use stagehand_rollout::{
    Clock, NewSchedule, RolloutScheduler, RolloutService, ScheduleProcessor, SchedulerConfig,
    SystemClock,
};
use stagehand_state::{FeatureFlag, ScheduleStatus, StateStore};
use tracing::info;

use crate::config::StagehandConfig;

const DEFAULT_LOG_FILTER: &str = "info,stagehandd=debug,stagehand=debug";

#[derive(Parser)]
#[command(name = "stagehandd", about = "Stagehand rollout daemon")]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for persistent state. Overrides the config file.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the rollout scheduler until interrupted.
    Run {
        /// Minutes between scheduler iterations.
        #[arg(long)]
        interval_minutes: Option<u64>,
    },

    /// Show flags and schedules, or one schedule with its stages.
    Status {
        schedule_id: Option<String>,

        /// Only schedules with this status.
        #[arg(long)]
        status: Option<String>,
    },

    /// Create a schedule from a TOML plan file.
    Apply {
        plan: PathBuf,

        /// Owner recorded on the schedule.
        #[arg(long, default_value = "operator")]
        owner: String,

        /// Activate the schedule right away.
        #[arg(long)]
        activate: bool,
    },

    /// Activate a draft schedule or resume a paused one.
    Activate { schedule_id: String },

    /// Pause an active schedule.
    Pause { schedule_id: String },

    /// Cancel a schedule.
    Cancel { schedule_id: String },

    /// Advance a manual stage by one step.
    Advance { stage_id: String },

    /// Register a feature flag, or reset its percentage.
    Flag {
        id: String,
        key: String,

        #[arg(long, default_value = "0")]
        percentage: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => StagehandConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StagehandConfig::default(),
    };
    init_tracing(cli.json_logs || config.log.json);

    let data_dir = cli.data_dir.clone().unwrap_or_else(|| config.data_dir());
    let store = open_store(&data_dir)?;
    let service = RolloutService::new(store.clone(), Arc::new(SystemClock));

    match cli.command {
        Command::Run { interval_minutes } => {
            let timing = config
                .scheduler_config(interval_minutes)
                .context("invalid scheduler timing")?;
            run_daemon(store, timing).await
        }
        Command::Status {
            schedule_id,
            status,
        } => print_status(&store, &service, schedule_id.as_deref(), status.as_deref()),
        Command::Apply {
            plan,
            owner,
            activate,
        } => {
            let plan = load_plan(&plan)?;
            let schedule = service.create_schedule(plan, &owner)?;
            println!("created schedule {} ({})", schedule.id, schedule.name);
            if activate {
                service.activate_schedule(&schedule.id).await?;
                println!("activated schedule {}", schedule.id);
            }
            Ok(())
        }
        Command::Activate { schedule_id } => {
            let schedule = service.activate_schedule(&schedule_id).await?;
            println!("schedule {} is {}", schedule.id, schedule.status);
            Ok(())
        }
        Command::Pause { schedule_id } => {
            let schedule = service.pause_schedule(&schedule_id).await?;
            println!("schedule {} is {}", schedule.id, schedule.status);
            Ok(())
        }
        Command::Cancel { schedule_id } => {
            let schedule = service.cancel_schedule(&schedule_id).await?;
            println!("schedule {} is {}", schedule.id, schedule.status);
            Ok(())
        }
        Command::Advance { stage_id } => {
            let stage = service.manually_advance_stage(&stage_id).await?;
            println!(
                "stage {} ({}) is {} at {}%",
                stage.id, stage.name, stage.status, stage.target_percentage
            );
            Ok(())
        }
        Command::Flag {
            id,
            key,
            percentage,
        } => {
            anyhow::ensure!(percentage <= 100, "percentage must be between 0 and 100");
            store.put_flag(&FeatureFlag {
                id: id.clone(),
                key,
                rollout_percentage: percentage,
                updated_at: SystemClock.now(),
            })?;
            println!("flag {id} set to {percentage}%");
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let db_path = data_dir.join("stagehand.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

fn load_plan(path: &Path) -> anyhow::Result<NewSchedule> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading plan {}", path.display()))?;
    let plan: NewSchedule =
        toml::from_str(&content).with_context(|| format!("parsing plan {}", path.display()))?;
    Ok(plan)
}

async fn run_daemon(store: StateStore, config: SchedulerConfig) -> anyhow::Result<()> {
    info!("Stagehand daemon starting");

    let scheduler = RolloutScheduler::new(
        ScheduleProcessor::new(store),
        Arc::new(SystemClock),
        config,
    );
    scheduler.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")?;
    info!("shutdown signal received");

    scheduler.stop().await;
    info!("Stagehand daemon stopped");
    Ok(())
}

fn parse_status(value: &str) -> anyhow::Result<ScheduleStatus> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .with_context(|| format!("unknown schedule status '{value}'"))
}

fn print_status(
    store: &StateStore,
    service: &RolloutService,
    schedule_id: Option<&str>,
    status: Option<&str>,
) -> anyhow::Result<()> {
    if let Some(id) = schedule_id {
        let overview = service.overview(id)?;
        println!("{}", serde_json::to_string_pretty(&overview)?);
        return Ok(());
    }

    for flag in store.list_flags()? {
        println!("flag {}  {:>3}%  {}", flag.id, flag.rollout_percentage, flag.key);
    }

    let status = status.map(parse_status).transpose()?;
    let schedules = service.list_schedules(status)?;
    if schedules.is_empty() {
        println!("no schedules");
    }
    for schedule in schedules {
        println!(
            "{}  {:<10} {}  flag={}",
            schedule.id,
            schedule.status.as_str(),
            schedule.name,
            schedule.feature_flag_id
        );
        for stage in service.stages(&schedule.id)? {
            println!(
                "    {:>2}. {:<12} {:>3}%  {:<11} {}",
                stage.stage_order,
                stage.status.as_str(),
                stage.target_percentage,
                stage.trigger_type.as_str(),
                stage.name
            );
        }
    }
    Ok(())
}
