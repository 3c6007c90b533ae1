use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dmvsentry::catalog::{DiagnosticQuery, QueryKind};
use dmvsentry::config::Config;
use dmvsentry::error::SentryError;
use dmvsentry::executor::RunResult;
use dmvsentry::report::ReportComparator;
use dmvsentry::scheduler::{history, SchedulePlan};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "dmvsentry",
    about = "Scheduled SQL Server DMV diagnostics with result archival and regression reports",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "dmvsentry.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one catalog query now and archive the result
    Run {
        /// Catalog query id, e.g. top-io
        query_id: String,

        /// Deadline for this execution
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Manage the scheduler
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Compare the latest run of a query with an earlier one
    Report {
        /// Catalog query id
        query_id: String,

        /// Compare against the run this many runs before the latest
        #[arg(long, default_value = "1")]
        since: usize,

        /// Relative worsening that flags a regression (overrides config)
        #[arg(long)]
        threshold: Option<f64>,

        /// Show every aligned row, not only regressions
        #[arg(long)]
        all: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Inspect the query catalog
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },

    /// Show recent scheduler outcomes for a query
    History {
        /// Catalog query id
        query_id: String,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Run the scheduler in the foreground
    Start,

    /// Ask a running scheduler to stop
    Stop,

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,

        /// Maximum number of entries to print
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum CatalogAction {
    /// List all catalog queries
    List {
        #[arg(long)]
        json: bool,
    },

    /// Print one query with its SQL text
    Show { query_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for command output.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            let code = e
                .downcast_ref::<SentryError>()
                .map(SentryError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Run {
            query_id,
            timeout_secs,
            json,
        } => {
            tracing::info!(query=%query_id, "Running query");
            let result =
                dmvsentry::run_once(&config, &query_id, timeout_secs.map(Duration::from_secs)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                let catalog = dmvsentry::load_catalog(&config)?;
                print_run(catalog.get(&query_id)?, &result);
            }
        }
        Commands::Schedule { action } => match action {
            ScheduleAction::Start => {
                tracing::info!("Starting scheduler");
                dmvsentry::start_scheduler(&config).await?;
            }
            ScheduleAction::Stop => {
                dmvsentry::request_stop(&config)?;
                println!("Stop requested.");
            }
            ScheduleAction::DryRun { hours, limit } => {
                let catalog = dmvsentry::load_catalog(&config)?;
                let plan = SchedulePlan::from_config(&config.scheduler, &catalog)?;
                // One extra entry tells us whether the listing was cut short.
                let preview = plan.preview(hours, limit.saturating_add(1))?;
                if preview.is_empty() {
                    println!("No runs scheduled in next {} hours.", hours);
                } else {
                    println!("Upcoming runs (next {} hours):", hours);
                    for (time, id) in preview.iter().take(limit) {
                        println!("{} : {}", time.to_rfc3339(), id);
                    }
                    if preview.len() > limit {
                        println!("... more (raise --limit to see them)");
                    }
                }
            }
        },
        Commands::Report {
            query_id,
            since,
            threshold,
            all,
            json,
        } => {
            let catalog = dmvsentry::load_catalog(&config)?;
            let store = dmvsentry::open_store(&config)?;
            let threshold = threshold.unwrap_or(config.report.threshold);
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(SentryError::Config(format!("invalid threshold {}", threshold)).into());
            }
            let report = dmvsentry::build_report(
                &catalog,
                &store,
                ReportComparator::new(threshold),
                &query_id,
                since,
            )?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            let Some(baseline_at) = report.baseline_at else {
                println!("Only one run of '{}' stored; nothing to compare.", query_id);
                return Ok(());
            };
            println!("\n=== Regression Report: {} ===", report.query_id);
            println!("Baseline:  {}", baseline_at.to_rfc3339());
            println!("Current:   {}", report.current_at.to_rfc3339());
            println!("Threshold: {:.0}%", report.threshold * 100.0);
            println!();

            let shown: Vec<_> = if all {
                report.regressions.iter().collect()
            } else {
                report.flagged().collect()
            };
            if shown.is_empty() {
                println!("No regressions.");
            } else {
                println!("{:<36} | {:>14} | {:>14} | {:>9} | Flag", "Identity", "Baseline", "Current", "Change");
                println!("{:-<36}-|-{:->14}-|-{:->14}-|-{:->9}-|-{:-<4}", "", "", "", "", "");
                for r in shown {
                    println!(
                        "{:<36} | {:>14.2} | {:>14.2} | {:>8.1}% | {}",
                        truncate(&r.identity, 36),
                        r.baseline_value,
                        r.current_value,
                        r.relative_change * 100.0,
                        if r.exceeds_threshold { "REGRESSED" } else { "" }
                    );
                }
            }
            println!();
        }
        Commands::Catalog { action } => {
            let catalog = dmvsentry::load_catalog(&config)?;
            match action {
                CatalogAction::List { json } => {
                    if json {
                        let queries: Vec<&DiagnosticQuery> = catalog.iter().collect();
                        println!("{}", serde_json::to_string_pretty(&queries)?);
                    } else {
                        println!("{:<24} | {:<34} | {:<14} | Risk", "Id", "Target DMV", "Metric");
                        println!("{:-<24}-|-{:-<34}-|-{:-<14}-|-{:-<20}", "", "", "", "");
                        for q in catalog.iter() {
                            println!(
                                "{:<24} | {:<34} | {:<14} | {}",
                                q.id,
                                q.target_dmv,
                                q.metric.as_deref().unwrap_or("-"),
                                risk_label(q)
                            );
                        }
                    }
                }
                CatalogAction::Show { query_id } => {
                    let q = catalog.get(&query_id)?;
                    println!("{} -- {}", q.id, q.title);
                    println!("Target DMV: {}", q.target_dmv);
                    println!("Metric:     {}", q.metric.as_deref().unwrap_or("-"));
                    println!("Identity:   {}", q.identity.as_deref().unwrap_or("-"));
                    println!("Risk:       {}", risk_label(q));
                    println!();
                    println!("{}", q.sql.trim());
                }
            }
        }
        Commands::History { query_id, limit } => {
            dmvsentry::load_catalog(&config)?.get(&query_id)?;
            let store = dmvsentry::open_store(&config)?;
            let entries = history::recent(store.pool(), &query_id, limit)
                .context("Failed to read schedule history")?;
            if entries.is_empty() {
                println!("No history for '{}'.", query_id);
            } else {
                println!("{:<32} | {:<9} | Detail", "Started", "Status");
                println!("{:-<32}-|-{:-<9}-|-{:-<30}", "", "", "");
                for e in entries {
                    println!(
                        "{:<32} | {:<9} | {}",
                        e.started_at.to_rfc3339(),
                        e.status,
                        e.detail.unwrap_or_default()
                    );
                }
            }
        }
    }

    Ok(())
}

fn risk_label(q: &DiagnosticQuery) -> String {
    let mut flags = Vec::new();
    if q.kind == QueryKind::TraceSession {
        flags.push("trace-session");
    }
    if q.risk.recompile {
        flags.push("recompile");
    }
    if q.risk.large_scan {
        flags.push("large-scan");
    }
    if flags.is_empty() {
        "-".to_string()
    } else {
        flags.join(", ")
    }
}

fn print_run(query: &DiagnosticQuery, result: &RunResult) {
    println!("\n=== {} ({}) ===", query.id, result.timestamp().to_rfc3339());
    println!("{} rows in {} ms\n", result.rows().len(), result.duration().as_millis());

    let columns: Vec<String> = if query.expected_columns.is_empty() {
        result
            .rows()
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default()
    } else {
        query.expected_columns.clone()
    };
    if columns.is_empty() {
        return;
    }

    let header: Vec<String> = columns.iter().map(|c| format!("{:<20}", truncate(c, 20))).collect();
    println!("{}", header.join(" | "));
    println!("{}", vec!["-".repeat(20); columns.len()].join("-|-"));
    for row in result.rows() {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| {
                let text = match row.get(c) {
                    Some(serde_json::Value::String(s)) => s.split_whitespace().collect::<Vec<_>>().join(" "),
                    Some(serde_json::Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                };
                format!("{:<20}", truncate(&text, 20))
            })
            .collect();
        println!("{}", cells.join(" | "));
    }
    println!();
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(width.saturating_sub(3)).collect();
        out.push_str("...");
        out
    }
}
