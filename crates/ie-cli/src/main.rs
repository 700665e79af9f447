//! Incident enricher CLI
//!
//! Tracks ServiceNow incidents, extracts entities from their notes, links the
//! matching configuration item and asks on Slack when the match is ambiguous.

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use ie_core::{EnrichmentOutcome, EnrichmentStage, EnrichmentState, EnrichmentStateStore};
use ie_observability::{enrichment_span, EnrichmentMetrics, LoggingConfig};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn, Instrument};

mod config;
mod runtime;
mod validator;

use config::AppConfig;
use runtime::Runtime;
use validator::ConfigValidator;

#[derive(Parser)]
#[command(name = "incident-enricher")]
#[command(version)]
#[command(about = "Links incidents to configuration items using their work notes", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(long, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start tracking a ticket
    Watch {
        /// Ticket system identifier
        ticket_id: String,

        /// Human-facing ticket number (defaults to the identifier)
        #[arg(short, long)]
        number: Option<String>,

        /// Parent case identifier
        #[arg(short, long)]
        parent: Option<String>,
    },

    /// Run one enrichment cycle for a ticket
    Enrich {
        ticket_id: String,

        /// Process even when the ticket is enriched, errored or awaiting clarification
        #[arg(short, long)]
        force: bool,
    },

    /// Run the final enrichment pass before closure
    Finalize { ticket_id: String },

    /// Answer a pending clarification with the chosen configuration item
    Respond {
        ticket_id: String,

        /// Configuration item identifier
        ci_id: String,

        /// Who made the choice
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Decline a pending clarification
    Skip {
        ticket_id: String,

        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Show the enrichment state of a ticket
    Status { ticket_id: String },

    /// Sweep active tickets periodically until Ctrl-C
    Run,

    /// Validate configuration
    Validate {
        /// Configuration file to validate
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show current configuration
    Config {
        /// Show secrets (redacted by default)
        #[arg(long)]
        show_secrets: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let (config, load_error) = match AppConfig::load(&config_path) {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };

    let mut logging = LoggingConfig::from_settings(&config.logging.level, config.logging.json_format)
        .unwrap_or_default();
    if cli.verbose {
        logging.level = tracing::Level::DEBUG;
    }
    ie_observability::init_logging_with_config(logging);

    if let Some(e) = load_error {
        if cli.verbose {
            eprintln!("Using default configuration ({:#})", e);
        }
    }

    match cli.command {
        Commands::Watch {
            ticket_id,
            number,
            parent,
        } => {
            let runtime = Runtime::build(&config).await?;
            let number = number.unwrap_or_else(|| ticket_id.clone());
            let outcome = runtime
                .orchestrator
                .start_tracking(&ticket_id, &number, parent)
                .instrument(enrichment_span!(ticket_id, command = "watch"))
                .await;
            print_outcome(&outcome, cli.format)
        }
        Commands::Enrich { ticket_id, force } => {
            let runtime = Runtime::build(&config).await?;
            let outcome = runtime
                .orchestrator
                .process_ticket(&ticket_id, force)
                .instrument(enrichment_span!(ticket_id, command = "enrich", force))
                .await;
            print_outcome(&outcome, cli.format)
        }
        Commands::Finalize { ticket_id } => {
            let runtime = Runtime::build(&config).await?;
            let outcome = runtime
                .orchestrator
                .run_final_enrichment(&ticket_id)
                .instrument(enrichment_span!(ticket_id, command = "finalize"))
                .await;
            print_outcome(&outcome, cli.format)
        }
        Commands::Respond {
            ticket_id,
            ci_id,
            by,
        } => {
            let runtime = Runtime::build(&config).await?;
            let outcome = runtime
                .orchestrator
                .handle_clarification_response(&ticket_id, &ci_id, &by)
                .instrument(enrichment_span!(ticket_id, command = "respond"))
                .await;
            print_outcome(&outcome, cli.format)
        }
        Commands::Skip { ticket_id, by } => {
            let runtime = Runtime::build(&config).await?;
            let outcome = runtime
                .orchestrator
                .handle_clarification_skip(&ticket_id, &by)
                .instrument(enrichment_span!(ticket_id, command = "skip"))
                .await;
            print_outcome(&outcome, cli.format)
        }
        Commands::Status { ticket_id } => cmd_status(config, &ticket_id, cli.format).await,
        Commands::Run => cmd_run(config).await,
        Commands::Validate { config: cfg_path } => cmd_validate(cfg_path.unwrap_or(config_path)),
        Commands::Config { show_secrets } => cmd_config(config, show_secrets, cli.format),
    }
}

fn default_config_path() -> PathBuf {
    if let Some(dirs) =
        directories::ProjectDirs::from("com", "incident-enricher", "incident-enricher")
    {
        dirs.config_dir().join("config.yaml")
    } else {
        PathBuf::from("config/default.yaml")
    }
}

fn print_outcome(outcome: &EnrichmentOutcome, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    let marker = if !outcome.success {
        "✗".red()
    } else if outcome.skipped {
        "-".yellow()
    } else {
        "✓".green()
    };
    let stage = outcome
        .stage
        .map(|s| stage_colored(s).to_string())
        .unwrap_or_else(|| "untracked".dimmed().to_string());

    println!("{} {} [{}] {}", marker, outcome.ticket_id.bold(), stage, outcome.message);
    if let Some(ci) = &outcome.linked_ci {
        println!("  Linked CI: {}", ci.cyan());
    }
    println!("  Attempts: {}", outcome.attempts);
    Ok(())
}

fn stage_colored(stage: EnrichmentStage) -> colored::ColoredString {
    match stage {
        EnrichmentStage::Enriched => stage.as_str().green(),
        EnrichmentStage::Error => stage.as_str().red(),
        EnrichmentStage::ClarificationPending => stage.as_str().yellow(),
        _ => stage.as_str().normal(),
    }
}

async fn cmd_status(config: AppConfig, ticket_id: &str, format: OutputFormat) -> Result<()> {
    let runtime = Runtime::build(&config).await?;
    let Some(state) = runtime.orchestrator.status(ticket_id).await? else {
        println!("{} is not tracked", ticket_id);
        return Ok(());
    };

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        print_state(&state);
    }
    Ok(())
}

fn print_state(state: &EnrichmentState) {
    println!("{}", format!("Ticket {}", state.ticket_number).bold());
    println!("─────────────────────");
    println!("Stage:       {}", stage_colored(state.stage));
    println!("Attempts:    {}", state.attempts);
    println!("Updated:     {}", state.updated_at.to_rfc3339());
    if let Some(last) = state.last_note_at {
        println!("Last note:   {}", last.to_rfc3339());
    }
    println!(
        "Confidence:  overall {:.2}, CI match {:.2}, extraction {:.2}",
        state.confidence_scores.overall,
        state.confidence_scores.ci_match,
        state.confidence_scores.entity_extraction
    );

    if !state.extracted_entities.is_empty() {
        println!("\nEntities:");
        for (ty, values) in &state.extracted_entities {
            println!("  {}: {}", ty, values.join(", "));
        }
    }
    if !state.matched_cis.is_empty() {
        println!("\nCandidates:");
        for ci in &state.matched_cis {
            println!(
                "  - {} ({}) {}% via {}",
                ci.name.cyan(),
                ci.id,
                ci.confidence,
                ci.reason
            );
        }
    }
    if !state.metadata.is_empty() {
        println!("\nMetadata:");
        for (key, value) in &state.metadata {
            println!("  {}: {}", key, value);
        }
    }
}

async fn cmd_run(config: AppConfig) -> Result<()> {
    let validation = ConfigValidator::validate(&config);
    validation.print();
    if validation.has_errors() {
        println!();
        println!(
            "{}",
            "Startup aborted due to configuration errors. Fix the errors above and try again."
                .red()
                .bold()
        );
        std::process::exit(1);
    }

    let runtime = Runtime::build(&config).await?;
    let runner = runtime.sweep_runner();
    let kpis = EnrichmentMetrics::new();

    let mut sweep = tokio::time::interval(Duration::from_secs(config.scheduler.sweep_interval_secs));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cleanup =
        tokio::time::interval(Duration::from_secs(config.scheduler.cleanup_interval_secs));
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

    println!("{}", "Incident enricher running. Press Ctrl+C to stop".green().bold());
    loop {
        tokio::select! {
            _ = sweep.tick() => {
                match runner.run_once().await {
                    Ok(report) => {
                        for outcome in &report.outcomes {
                            if !outcome.success {
                                enrichment_span!(outcome.ticket_id, attempts = outcome.attempts)
                                    .in_scope(|| warn!(reason = %outcome.message, "Sweep enrichment failed"));
                            }
                            if let Ok(Some(state)) = runtime.store.get(&outcome.ticket_id).await {
                                kpis.record_tracking_started(&state.ticket_id, state.created_at).await;
                            }
                            kpis.record_outcome(outcome, Utc::now()).await;
                        }
                    }
                    Err(e) => error!(error = %e, "Sweep failed"),
                }
            }
            _ = cleanup.tick() => {
                runner.cleanup_clarifications().await;
                kpis.cleanup(Utc::now(), config.enrichment.max_age_hours.saturating_mul(2)).await;
                let current = kpis.calculate_kpis().await;
                info!(
                    tickets = current.total_tickets,
                    enriched = current.enriched,
                    link_rate = current.link_rate,
                    clarification_rate = current.clarification_rate,
                    failure_rate = current.failure_rate,
                    "Enrichment KPIs"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\n{}", "Shutting down...".yellow());
                break;
            }
        }
    }

    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<()> {
    println!(
        "Validating configuration: {}",
        config_path.display().to_string().cyan()
    );

    let config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("{}: {:#}", "Configuration file error".red().bold(), e);
            std::process::exit(1);
        }
    };

    let validation = ConfigValidator::validate(&config);
    validation.print();

    println!();
    println!("{}", "Configuration Summary".bold());
    println!("─────────────────────");
    println!("  Confidence threshold: {}", config.enrichment.confidence_threshold);
    println!("  Max attempts: {}", config.enrichment.max_attempts);
    println!("  Language model: {}", if config.llm.enabled { config.llm.model.as_str() } else { "disabled" });
    println!("  Database: {}", config.database.url);

    println!();
    if validation.has_errors() {
        println!(
            "{}",
            "Configuration validation failed. Fix the errors above."
                .red()
                .bold()
        );
        std::process::exit(1);
    } else if validation.has_warnings() {
        println!(
            "{}",
            "Configuration is valid with warnings. Review the warnings above."
                .yellow()
                .bold()
        );
    } else {
        println!("{}", "Configuration is valid.".green().bold());
    }

    Ok(())
}

fn cmd_config(config: AppConfig, show_secrets: bool, format: OutputFormat) -> Result<()> {
    let display_config = if show_secrets {
        config
    } else {
        config.redact_secrets()
    };

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&display_config)?);
    } else {
        print!("{}", serde_yaml::to_string(&display_config)?);
    }

    Ok(())
}
