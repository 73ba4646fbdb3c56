use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use colored::*;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};

use trainload::adaptation::{AdaptationEvent, Decision};
use trainload::aggregate::{LoadWindow, TrainingStatus};
use trainload::batch::{BatchConfig, BatchProcessor};
use trainload::collaborators::{InMemoryProfileStore, InMemorySink};
use trainload::config::EngineConfig;
use trainload::engine::{IngestStatus, TrainingEngine};
use trainload::error::ErrorSeverity;
use trainload::logging::{init_logging, LogLevel};
use trainload::models::{AthleteId, AthleteProfile};
use trainload::normalize::{ActivityNormalizer, RawActivity};
use trainload::training_plan::{PeriodizationPlanner, TrainingPlan};

/// trainload - Training Load & Periodization Engine
///
/// Folds activities into acute and chronic training load, seeds block-based
/// plans toward a target event, and adapts them when actual load drifts.
#[derive(Parser)]
#[command(name = "trainload")]
#[command(author = "trainload contributors")]
#[command(version)]
#[command(about = "Training load aggregation and adaptive periodization", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest activities in arrival order and report windows and adaptations
    Ingest {
        /// JSON file holding an array of raw activities
        #[arg(short, long)]
        activities: PathBuf,

        /// Additional athlete profile (TOML); may be repeated
        #[arg(short, long)]
        profile: Vec<PathBuf>,

        /// Evaluation date for adaptation (defaults to each activity's date)
        #[arg(long)]
        as_of: Option<NaiveDate>,

        /// Seed plans on this date, after ingesting the activities before it
        #[arg(long, value_name = "DATE")]
        plan_from: Option<NaiveDate>,

        /// Print final athlete snapshots as JSON
        #[arg(long)]
        json: bool,
    },

    /// Seed a periodized plan toward the athlete's target event
    Plan {
        /// Athlete from the configuration (defaults to the configured default)
        #[arg(short, long)]
        athlete: Option<String>,

        /// Athlete profile file (TOML) instead of a configured athlete
        #[arg(short, long)]
        profile: Option<PathBuf>,

        /// Plan seed date (YYYY-MM-DD)
        #[arg(long)]
        as_of: NaiveDate,

        /// Chronic load to seed from
        #[arg(long, conflicts_with = "activities")]
        chronic: Option<Decimal>,

        /// Derive the chronic load from this activity history (JSON)
        #[arg(long)]
        activities: Option<PathBuf>,
    },

    /// Rebuild every athlete's windows from a full activity log in parallel
    Replay {
        /// JSON file holding an array of raw activities
        #[arg(short, long)]
        activities: PathBuf,

        /// Additional athlete profile (TOML); may be repeated
        #[arg(short, long)]
        profile: Vec<PathBuf>,

        /// Worker threads (default: all cores)
        #[arg(short, long)]
        threads: Option<usize>,
    },

    /// Show or create the configuration file
    Config {
        /// Write a default configuration file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(EngineConfig::default_config_path);
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::load_or_default(),
    };

    match cli.verbose {
        0 => {}
        1 => config.logging.level = LogLevel::Debug,
        _ => config.logging.level = LogLevel::Trace,
    }
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Ingest {
            activities,
            profile,
            as_of,
            plan_from,
            json,
        } => run_ingest(&config, &activities, &profile, as_of, plan_from, json).await,
        Commands::Plan {
            athlete,
            profile,
            as_of,
            chronic,
            activities,
        } => run_plan(&config, athlete, profile, as_of, chronic, activities).await,
        Commands::Replay {
            activities,
            profile,
            threads,
        } => run_replay(&config, &activities, &profile, threads),
        Commands::Config { init } => run_config(config, &config_path, init),
    }
}

fn read_activities(path: &Path) -> Result<Vec<RawActivity>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read activities file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse activities from {}", path.display()))
}

fn read_profile(path: &Path) -> Result<AthleteProfile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read profile file: {}", path.display()))?;
    let profile: AthleteProfile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse profile from {}", path.display()))?;
    profile
        .plan_policy
        .validate()
        .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
    Ok(profile)
}

/// Configured athletes overlaid with profile files
fn collect_profiles(config: &EngineConfig, files: &[PathBuf]) -> Result<HashMap<AthleteId, AthleteProfile>> {
    let mut profiles: HashMap<AthleteId, AthleteProfile> = config
        .athletes
        .iter()
        .map(|(id, profile)| (id.clone(), profile.clone()))
        .collect();
    for path in files {
        let profile = read_profile(path)?;
        profiles.insert(profile.athlete_id.clone(), profile);
    }
    Ok(profiles)
}

fn build_engine(config: &EngineConfig, profiles: &HashMap<AthleteId, AthleteProfile>) -> TrainingEngine {
    let store = InMemoryProfileStore::with_profiles(profiles.values().cloned());
    TrainingEngine::new(config.engine.clone(), Arc::new(store), Arc::new(InMemorySink::new()))
}

async fn run_ingest(
    config: &EngineConfig,
    activities_path: &Path,
    profile_files: &[PathBuf],
    as_of: Option<NaiveDate>,
    plan_from: Option<NaiveDate>,
    json: bool,
) -> Result<()> {
    let profiles = collect_profiles(config, profile_files)?;
    let activities = read_activities(activities_path)?;
    let engine = build_engine(config, &profiles);

    // Activities before the plan date build the history the plan is seeded from
    let (before, after): (Vec<&RawActivity>, Vec<&RawActivity>) = match plan_from {
        Some(date) => activities.iter().partition(|raw| {
            ActivityNormalizer::normalize(raw)
                .map(|activity| activity.local_date() < date)
                .unwrap_or(true)
        }),
        None => (activities.iter().collect(), Vec::new()),
    };

    println!("{}", "📥 Ingesting activities".bold().blue());
    let mut failures = 0usize;
    failures += ingest_all(&engine, &before, as_of).await;

    if let Some(date) = plan_from {
        for (athlete_id, profile) in &profiles {
            if profile.target_event_date.is_none() {
                continue;
            }
            match engine.seed_plan(athlete_id, date).await {
                Ok(plan) => {
                    println!(
                        "{} {} plan seeded with {} blocks toward {}",
                        "📅".green(),
                        athlete_id.bold(),
                        plan.blocks.len(),
                        plan.target_date
                    );
                }
                Err(e) => println!("{} {}: {}", "✗".red(), athlete_id, e),
            }
        }
    }

    failures += ingest_all(&engine, &after, as_of).await;

    for athlete_id in engine.athlete_ids().await {
        if json {
            let snapshot = engine.snapshot(&athlete_id).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            continue;
        }

        println!();
        println!("{} {}", "🏃 Athlete".bold().cyan(), athlete_id.bold());
        print_window(&engine.window(&athlete_id).await?);
        if let Ok(plan) = engine.plan(&athlete_id).await {
            print_plan(&plan);
        }
        let events = engine.recent_events(&athlete_id).await?;
        if !events.is_empty() {
            println!("{}", "Adaptations:".bold());
            for event in &events {
                print_event(event);
            }
        }
    }

    if failures > 0 {
        println!();
        println!("{} {} activities rejected or failed", "⚠".yellow(), failures);
    }
    Ok(())
}

async fn ingest_all(engine: &TrainingEngine, activities: &[&RawActivity], as_of: Option<NaiveDate>) -> usize {
    let mut failures = 0;
    for raw in activities {
        let label = raw.activity_id.as_deref().unwrap_or("<unnamed>");
        match engine.ingest_activity(raw, as_of).await {
            Ok(report) => {
                let status = match report.status {
                    IngestStatus::Applied => "applied".green(),
                    IngestStatus::Replayed => "replayed".yellow(),
                    IngestStatus::ReplaySuperseded => "superseded".yellow(),
                    IngestStatus::Ignored => "ignored".dimmed(),
                };
                let partial = if report.partial { " (partial)" } else { "" };
                println!(
                    "  {} {:<20} {:>10} load {} im {}{}",
                    "✓".green(),
                    report.activity_id,
                    status,
                    report.load.round_dp(1),
                    report.intensity_minutes.round_dp(0),
                    partial
                );
                if let Some(event) = &report.event {
                    print_event(event);
                }
            }
            Err(e) => {
                failures += 1;
                let message = match e.severity() {
                    ErrorSeverity::Critical | ErrorSeverity::Error => e.user_message().red(),
                    ErrorSeverity::Warning | ErrorSeverity::Info => e.user_message().yellow(),
                };
                println!("  {} {:<20} {}", "✗".red(), label, message);
            }
        }
    }
    failures
}

fn print_window(window: &LoadWindow) {
    let as_of = window
        .as_of
        .map(|d| d.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("  As of:   {}", as_of);
    println!("  Acute:   {}", window.acute.round_dp(1));
    println!("  Chronic: {}", window.chronic.round_dp(1));
    println!("  Balance: {}", window.balance.round_dp(1));
    match (window.ratio, window.status) {
        (Some(ratio), Some(status)) => {
            let label = match status {
                TrainingStatus::Detraining => format!("{:?}", status).blue(),
                TrainingStatus::Productive => format!("{:?}", status).green(),
                TrainingStatus::Overreaching => format!("{:?}", status).yellow(),
                TrainingStatus::HighRisk => format!("{:?}", status).red(),
            };
            println!("  Ratio:   {} {} ({})", ratio.round_dp(2), label, status.description());
        }
        _ => println!("  Ratio:   {}", "not enough history".dimmed()),
    }
}

#[derive(Tabled)]
struct BlockRow {
    #[tabled(rename = "#")]
    index: u32,
    start: NaiveDate,
    end: NaiveDate,
    emphasis: String,
    target: Decimal,
    range: String,
    rev: u32,
}

fn print_plan(plan: &TrainingPlan) {
    println!(
        "{} toward {} (pattern {}, revision {})",
        "Plan".bold(),
        plan.target_date,
        plan.pattern,
        plan.revision
    );
    let rows: Vec<BlockRow> = plan
        .blocks
        .iter()
        .map(|block| BlockRow {
            index: block.index,
            start: block.start,
            end: block.end,
            emphasis: if block.emphasis == block.baseline_emphasis {
                block.emphasis.to_string()
            } else {
                format!("{} (was {})", block.emphasis, block.baseline_emphasis)
            },
            target: block.target,
            range: format!("{} - {}", block.range.low, block.range.high),
            rev: block.revision,
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()).to_string());
}

fn print_event(event: &AdaptationEvent) {
    let decision = match event.decision {
        Decision::OnTarget => "on target".green().to_string(),
        Decision::Overreach(m) => format!("overreach +{}%", (m * Decimal::ONE_HUNDRED).round_dp(1))
            .red()
            .to_string(),
        Decision::Undershoot(m) => format!("undershoot -{}%", (m * Decimal::ONE_HUNDRED).round_dp(1))
            .yellow()
            .to_string(),
    };
    println!(
        "  {} block {} {}: {} block(s) changed, plan revision {}",
        "⟳".cyan(),
        event.evaluated_block,
        decision,
        event.changes.len(),
        event.plan_revision
    );
    for change in &event.changes {
        println!(
            "      block {}: {} {} -> {} {}",
            change.index, change.old_emphasis, change.old_target, change.new_emphasis, change.new_target
        );
    }
}

async fn run_plan(
    config: &EngineConfig,
    athlete: Option<String>,
    profile_file: Option<PathBuf>,
    as_of: NaiveDate,
    chronic: Option<Decimal>,
    activities: Option<PathBuf>,
) -> Result<()> {
    let profile = match (profile_file, athlete) {
        (Some(path), _) => read_profile(&path)?,
        (None, Some(id)) => config
            .get_athlete(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Athlete not found in configuration: {}", id))?,
        (None, None) => config
            .get_default_athlete()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No athlete given and no default athlete configured"))?,
    };

    let plan = match activities {
        Some(path) => {
            let raws = read_activities(&path)?;
            let profiles = HashMap::from([(profile.athlete_id.clone(), profile.clone())]);
            let engine = build_engine(config, &profiles);
            for raw in raws
                .iter()
                .filter(|raw| raw.athlete_id.as_deref() == Some(profile.athlete_id.as_str()))
            {
                if let Err(e) = engine.ingest_activity(raw, None).await {
                    tracing::warn!(error = %e, "Activity skipped");
                }
            }
            engine.seed_plan(&profile.athlete_id, as_of).await?
        }
        None => PeriodizationPlanner::seed(&profile, chronic.unwrap_or(Decimal::ZERO), as_of)?,
    };

    println!("{} {}", "📅 Plan for".bold().blue(), profile.athlete_id.bold());
    print_plan(&plan);
    println!("Total target load: {}", plan.total_target());
    Ok(())
}

#[derive(Tabled)]
struct WindowRow {
    athlete: String,
    activities: usize,
    rejected: usize,
    acute: String,
    chronic: String,
    ratio: String,
    status: String,
}

fn run_replay(
    config: &EngineConfig,
    activities_path: &Path,
    profile_files: &[PathBuf],
    threads: Option<usize>,
) -> Result<()> {
    let profiles = collect_profiles(config, profile_files)?;
    let activities = read_activities(activities_path)?;

    let processor = BatchProcessor::new(BatchConfig { num_threads: threads });
    let (_, summary) = processor.rebuild(&activities, &profiles)?;

    let rows: Vec<WindowRow> = summary
        .results
        .iter()
        .map(|result| {
            let window = result.window.as_ref();
            WindowRow {
                athlete: result.athlete_id.clone(),
                activities: result.activities,
                rejected: result.rejected.len(),
                acute: window.map(|w| w.acute.round_dp(1).to_string()).unwrap_or_default(),
                chronic: window.map(|w| w.chronic.round_dp(1).to_string()).unwrap_or_default(),
                ratio: window
                    .and_then(|w| w.ratio)
                    .map(|r| r.round_dp(2).to_string())
                    .unwrap_or_else(|| "-".to_string()),
                status: match (&result.error, window.and_then(|w| w.status)) {
                    (Some(error), _) => error.clone(),
                    (None, Some(status)) => format!("{:?}", status),
                    (None, None) => "-".to_string(),
                },
            }
        })
        .collect();

    println!("{}", Table::new(rows).with(Style::rounded()).to_string());
    println!("{}", summary.to_string_pretty());
    Ok(())
}

fn run_config(mut config: EngineConfig, path: &Path, init: bool) -> Result<()> {
    if init {
        if path.exists() {
            anyhow::bail!("Configuration already exists: {}", path.display());
        }
        config.save_to_file(path)?;
        println!("{} Configuration written to {}", "✓".green(), path.display());
        return Ok(());
    }

    println!("{}", format!("# {}", path.display()).dimmed());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
