//! Observability CLI: inspect and manage the adaptive rate-limit tracker.

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand, ValueEnum};

use delver::core::FileSettings;
use delver::ratelimit::{AdaptiveRateLimitTracker, RateLimitEstimate};

#[derive(Parser)]
#[command(name = "delver", version, about = "Deep-research engine utilities")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rate-limit tracker monitoring and management.
    #[command(subcommand, name = "rate-limit")]
    RateLimit(RateLimitCommand),
}

#[derive(Subcommand)]
enum RateLimitCommand {
    /// Show learned per-engine wait-time statistics.
    Status {
        /// Show stats for one engine only.
        #[arg(long)]
        engine: Option<String>,
    },
    /// Reset learned data for an engine.
    Reset {
        #[arg(long)]
        engine: String,
    },
    /// Export rate-limit data.
    Export {
        #[arg(long, value_enum, default_value = "table")]
        format: ExportFormat,
    },
    /// Remove attempt history older than N days.
    Cleanup {
        #[arg(long, default_value_t = 30)]
        days: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Table,
    Csv,
    Json,
}

fn format_stats_table(stats: &[RateLimitEstimate]) -> String {
    if stats.is_empty() {
        return "No rate limit data available.".to_string();
    }

    let mut lines = Vec::new();
    lines.push("Rate Limit Statistics:".to_string());
    lines.push("-".repeat(80));
    lines.push(format!(
        "{:<20} {:<12} {:<20} {:<10} {:<10} {:<15}",
        "Engine", "Base Wait", "Range", "Success", "Attempts", "Updated"
    ));
    lines.push("-".repeat(80));

    for est in stats {
        let updated = Local
            .timestamp_opt(est.last_updated as i64, 0)
            .single()
            .map(|t| t.format("%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let range = format!("{:.1}s - {:.1}s", est.min_wait, est.max_wait);
        lines.push(format!(
            "{:<20} {:<12.2} {:<20} {:<10} {:<10} {:<15}",
            est.engine,
            est.base_wait,
            range,
            format!("{:.1}%", est.success_rate * 100.0),
            est.total_attempts,
            updated
        ));
    }

    lines.join("\n")
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let settings = FileSettings::load();
    let tracker = AdaptiveRateLimitTracker::from_settings(&settings);

    match cli.command {
        Command::RateLimit(command) => match command {
            RateLimitCommand::Status { engine } => {
                let stats = tracker.stats(engine.as_deref());
                if stats.is_empty() {
                    if let Some(engine) = engine {
                        println!("No rate limit data found for engine: {engine}");
                        return std::process::ExitCode::SUCCESS;
                    }
                }
                println!("{}", format_stats_table(&stats));
            }
            RateLimitCommand::Reset { engine } => {
                tracker.reset_engine(&engine);
                println!("Reset rate limit data for {engine}");
            }
            RateLimitCommand::Export { format } => {
                let stats = tracker.stats(None);
                match format {
                    ExportFormat::Table => println!("{}", format_stats_table(&stats)),
                    ExportFormat::Csv => {
                        println!(
                            "engine,base_wait,min_wait,max_wait,last_updated,total_attempts,success_rate"
                        );
                        for est in &stats {
                            println!(
                                "{},{},{},{},{},{},{}",
                                est.engine,
                                est.base_wait,
                                est.min_wait,
                                est.max_wait,
                                est.last_updated,
                                est.total_attempts,
                                est.success_rate
                            );
                        }
                    }
                    ExportFormat::Json => match serde_json::to_string_pretty(&stats) {
                        Ok(json) => println!("{json}"),
                        Err(e) => {
                            eprintln!("Error: {e}");
                            return std::process::ExitCode::FAILURE;
                        }
                    },
                }
            }
            RateLimitCommand::Cleanup { days } => {
                let removed = tracker.cleanup_old_data(days);
                println!("Cleaned up rate limit data older than {days} days ({removed} attempts removed)");
            }
        },
    }

    std::process::ExitCode::SUCCESS
}
