//! riskgate daemon binary entry point.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use riskgate_core::audit::{AuditFilter, FileAuditSink};
use riskgate_core::config::EngineConfig;
use riskgate_core::risk::RiskTier;
use riskgate_daemon::Daemon;

/// riskgate - behavioral risk scoring for user activity events.
#[derive(Parser, Debug)]
#[command(name = "riskgate", version, about)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "~/.config/riskgate/config.toml")]
    config: String,

    /// Path to the JSON-lines audit log.
    #[arg(long, default_value = "~/.local/share/riskgate/audit.jsonl")]
    audit_log: String,

    /// Path to the anomaly model artifact (JSON).
    #[arg(short, long)]
    model: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score JSON-lines events and print one assessment per line.
    Score {
        /// Input file; stdin when omitted.
        input: Option<String>,
    },
    /// Print audit records matching the given filters, newest first.
    Query {
        /// Only this user's records.
        #[arg(long)]
        user: Option<String>,
        /// Minimum risk tier (low, medium, high, critical).
        #[arg(long)]
        min_tier: Option<String>,
        /// Maximum records to print.
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Summarize the audit log.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_env("RISKGATE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config_path = expand_tilde(&args.config);
    let audit_log_path = expand_tilde(&args.audit_log);
    tracing::info!(config = %config_path.display(), "riskgate starting");

    let config = EngineConfig::load(&config_path).context("loading configuration")?;

    match args.command {
        None => run_score(config, audit_log_path, args.model, None).await,
        Some(Command::Score { input }) => {
            run_score(config, audit_log_path, args.model, input).await
        }
        Some(Command::Query {
            user,
            min_tier,
            limit,
        }) => {
            let sink = FileAuditSink::new(audit_log_path, config.audit.clone())
                .context("opening audit log")?;
            let filter = AuditFilter {
                user_id: user,
                min_tier: min_tier.as_deref().map(parse_tier).transpose()?,
                limit,
                ..Default::default()
            };
            for record in sink.query(&filter).context("querying audit log")? {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }
        Some(Command::Stats) => {
            let sink = FileAuditSink::new(audit_log_path, config.audit.clone())
                .context("opening audit log")?;
            let stats = sink.stats().context("reading audit log")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

async fn run_score(
    config: EngineConfig,
    audit_log_path: PathBuf,
    model: Option<String>,
    input: Option<String>,
) -> Result<()> {
    let artifact = match model {
        Some(path) => {
            let path = expand_tilde(&path);
            Some(
                std::fs::read_to_string(&path)
                    .with_context(|| format!("reading model artifact {}", path.display()))?,
            )
        }
        None => None,
    };

    let daemon = Daemon::new(config, audit_log_path, artifact.as_deref())?;
    let mut stdout = tokio::io::stdout();

    match input {
        Some(path) if path != "-" => {
            let path = expand_tilde(&path);
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("opening input {}", path.display()))?;
            daemon.score_stream(file, &mut stdout).await?;
        }
        _ => {
            daemon.score_stream(tokio::io::stdin(), &mut stdout).await?;
        }
    }

    daemon.shutdown().await;
    Ok(())
}

fn parse_tier(s: &str) -> Result<RiskTier> {
    match s {
        "low" => Ok(RiskTier::Low),
        "medium" => Ok(RiskTier::Medium),
        "high" => Ok(RiskTier::High),
        "critical" => Ok(RiskTier::Critical),
        other => anyhow::bail!("unknown risk tier `{other}` (expected low, medium, high, critical)"),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
        return PathBuf::from("/tmp").join(rest);
    }
    PathBuf::from(path)
}
