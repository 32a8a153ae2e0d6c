use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};

use vitalscore::baseline::BaselineWindow;
use vitalscore::clock::{Clock, FixedClock, SystemClock};
use vitalscore::config::AppConfig;
use vitalscore::database::Database;
use vitalscore::logging::{init_logging, LogLevel};
use vitalscore::orchestrator::{ComponentBreakdown, DailyScoreBundle, ScoreState};
use vitalscore::pipeline::ScoringPipeline;
use vitalscore::provider::InMemoryProvider;
use vitalscore::recovery::RecoveryCategory;
use vitalscore::MetricKind;

/// VitalScore - Daily Recovery and Sleep Scores
///
/// Computes 0-100 Recovery and Sleep Scores from wearable health samples,
/// comparing each night against personal rolling baselines.
#[derive(Parser)]
#[command(name = "vitalscore")]
#[command(author = "VitalScore Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Daily Recovery and Sleep Scores", long_about = None)]
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
    /// Compute the scores for one day
    Score {
        /// Health samples exported as JSON
        #[arg(short, long)]
        input: PathBuf,

        /// Wake date (YYYY-MM-DD, default: today)
        #[arg(short, long)]
        date: Option<NaiveDate>,

        /// Evaluate as if the local time were this (YYYY-MM-DDTHH:MM:SS)
        #[arg(long)]
        at: Option<NaiveDateTime>,

        /// Output format
        #[arg(short = 'f', long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Show or recalculate personal baselines
    Baselines {
        /// Health samples exported as JSON
        #[arg(short, long)]
        input: PathBuf,

        /// Recompute every window from scratch
        #[arg(short, long)]
        recalculate: bool,

        /// Evaluate as if the local time were this (YYYY-MM-DDTHH:MM:SS)
        #[arg(long)]
        at: Option<NaiveDateTime>,
    },

    /// Configure application settings
    Config {
        /// Write a default configuration file
        #[arg(long)]
        init: bool,

        /// Print the active configuration
        #[arg(short, long)]
        show: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Score")]
    score: String,
    #[tabled(rename = "Detail")]
    description: String,
}

impl From<&ComponentBreakdown> for ComponentRow {
    fn from(row: &ComponentBreakdown) -> Self {
        Self {
            name: row.name.clone(),
            score: format!("{:.0} / {:.0}", row.score, row.max_score),
            description: row.description.clone(),
        }
    }
}

#[derive(Tabled)]
struct BaselineRow {
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "7d")]
    week: String,
    #[tabled(rename = "14d")]
    fortnight: String,
    #[tabled(rename = "60d")]
    two_months: String,
    #[tabled(rename = "90d")]
    quarter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_config_path);
    let mut config = match &cli.config {
        Some(path) if path.exists() => AppConfig::load_from_file(path)?,
        Some(_) => AppConfig::default(),
        None => AppConfig::load_or_default(),
    };

    // Quiet by default unless a config file asks for more
    config.logging.level = match &cli.config {
        Some(_) => config.logging.level.raised_by(cli.verbose),
        None => LogLevel::Warn.raised_by(cli.verbose),
    };
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Score {
            input,
            date,
            at,
            format,
        } => {
            let pipeline = open_pipeline(&config, &input, at)?;
            pipeline.start().await?;

            let date = date.unwrap_or_else(|| pipeline.clock.today());
            let state = pipeline.orchestrator.load_data(date).await?;
            print_state(&state, format)?;
        }

        Commands::Baselines {
            input,
            recalculate,
            at,
        } => {
            let pipeline = open_pipeline(&config, &input, at)?;
            pipeline.start().await?;

            let snapshot = if recalculate {
                println!("{}", "Recalculating baselines...".blue().bold());
                pipeline.baselines.force_recalculate_baselines().await?
            } else {
                pipeline.baselines.resolve(pipeline.clock.today()).await?
            };

            println!(
                "{}",
                format!("Baselines as of {}", snapshot.reference_date).cyan().bold()
            );
            let rows: Vec<BaselineRow> = MetricKind::QUANTITIES
                .iter()
                .map(|metric| {
                    let cell = |window| {
                        snapshot
                            .get(*metric, window)
                            .map(|v| format!("{:.1}", v))
                            .unwrap_or_else(|| "-".to_string())
                    };
                    BaselineRow {
                        metric: format!("{} ({})", metric.as_str(), metric.unit()),
                        week: cell(BaselineWindow::Week),
                        fortnight: cell(BaselineWindow::Fortnight),
                        two_months: cell(BaselineWindow::TwoMonths),
                        quarter: cell(BaselineWindow::Quarter),
                    }
                })
                .collect();
            println!("{}", Table::new(rows).with(Style::rounded()));

            let clock_line = |label: &str, time: Option<chrono::NaiveTime>| match time {
                Some(time) => println!("  {}: {}", label, time.format("%H:%M")),
                None => println!("  {}: {}", label, "not enough nights".dimmed()),
            };
            clock_line("Bedtime", snapshot.bedtime());
            clock_line("Wake time", snapshot.wake_time());
        }

        Commands::Config { init, show } => {
            if init {
                if config_path.exists() {
                    println!(
                        "{}",
                        format!("Config already exists: {}", config_path.display()).yellow()
                    );
                } else {
                    AppConfig::default().save_to_file(&config_path)?;
                    println!(
                        "{}",
                        format!("✓ Wrote default config to {}", config_path.display()).green()
                    );
                }
            }
            if show || !init {
                let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
                println!("{}", rendered);
            }
        }
    }

    Ok(())
}

fn open_pipeline(config: &AppConfig, input: &Path, at: Option<NaiveDateTime>) -> Result<ScoringPipeline> {
    let provider = Arc::new(
        InMemoryProvider::from_json_file(input)
            .with_context(|| format!("Failed to load health samples: {}", input.display()))?,
    );

    let database_path = &config.storage.database_path;
    if let Some(parent) = database_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
    }
    let db = Arc::new(Database::new(database_path)?);

    let clock: Arc<dyn Clock> = match at {
        Some(at) => Arc::new(FixedClock::new(at)),
        None => Arc::new(SystemClock),
    };

    Ok(ScoringPipeline::new(provider, db, clock, &config.scoring))
}

fn print_state(state: &ScoreState, format: OutputFormat) -> Result<()> {
    match state {
        ScoreState::Ready(bundle) => match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(bundle.as_ref())?),
            OutputFormat::Table => print_bundle(bundle),
        },
        ScoreState::NotYetAvailable { date, reason } => {
            println!("{}", format!("Scores for {} are not available yet", date).yellow().bold());
            println!("  {}", reason);
        }
        ScoreState::Failed { date, message } => {
            println!("{}", format!("Scoring failed for {}", date).red().bold());
            println!("  {}", message);
        }
        ScoreState::Idle => println!("{}", "Nothing computed".dimmed()),
    }
    Ok(())
}

fn print_bundle(bundle: &DailyScoreBundle) {
    let recovery = &bundle.recovery;
    let headline = format!("Recovery {} ({})", recovery.final_score, recovery.category);
    let headline = match recovery.category {
        RecoveryCategory::Optimal => headline.green().bold(),
        RecoveryCategory::Moderate => headline.yellow().bold(),
        RecoveryCategory::Low => headline.truecolor(255, 140, 0).bold(),
        RecoveryCategory::Poor => headline.red().bold(),
    };

    println!("{}  {}", bundle.date.to_string().dimmed(), headline);
    println!("  {}", recovery.directive.italic());
    println!();

    let rows: Vec<ComponentRow> = bundle.recovery_breakdown.iter().map(ComponentRow::from).collect();
    println!("{}", Table::new(rows).with(Style::rounded()));

    println!();
    println!("{}", format!("Sleep {}", bundle.sleep.final_score).blue().bold());
    let rows: Vec<ComponentRow> = bundle.sleep_breakdown.iter().map(ComponentRow::from).collect();
    println!("{}", Table::new(rows).with(Style::rounded()));

    println!();
    for trend in &bundle.trends {
        let values: Vec<String> = trend
            .points
            .iter()
            .map(|p| p.value.map(|v| format!("{:.0}", v)).unwrap_or_else(|| "-".to_string()))
            .collect();
        let change = trend
            .percent_change
            .map(|c| format!("{:+.1}%", c))
            .unwrap_or_default();
        println!("  {:<15} {}  {}", format!("{:?}", trend.metric), values.join(" "), change.dimmed());
    }
}
