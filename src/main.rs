use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use helmet_watch::config::{self, AppConfig, SourceConfig};
use helmet_watch::ledger::Ledger;
use helmet_watch::logging;
use helmet_watch::monitor::Monitor;
use helmet_watch::source::SourceKind;

#[derive(Parser)]
#[command(name = "helmet-watch", version)]
#[command(about = "Camera monitoring for missing helmets: evidence, email alert, ledger row")]
struct Cli {
    /// Config file (default ./helmet-watch.toml, optional)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start monitoring until Ctrl-C or every source stops
    Run {
        /// ID=URL, repeatable; replaces configured sources
        #[arg(long = "source")]
        sources: Vec<String>,
    },

    /// Show the latest ledger rows
    Recent {
        #[arg(short, long, default_value = "20")] limit: usize,
        #[arg(long)] json: bool,
    },

    /// List configured sources
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_dir = logging::init_logging();

    let cli = Cli::parse();
    let mut cfg = config::load_config(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(p) => format!("loading {}", p.display()),
        None => "loading helmet-watch.toml / HELMET_WATCH__* environment".to_string(),
    })?;

    match cli.command {
        Command::Run { sources } => {
            if !sources.is_empty() {
                cfg.sources = sources
                    .iter()
                    .map(|s| SourceConfig::parse_cli(s))
                    .collect::<Result<_, _>>()?;
            }
            cfg.validate()?;
            print_startup_info(&cfg, log_dir);

            let summary = Monitor::new(Arc::new(cfg)).run().await?;
            if !summary.drained {
                tracing::warn!("Some alerts were still in flight at exit");
            }
            if summary.all_failed() {
                anyhow::bail!("no source could be opened");
            }
        }

        Command::Recent { limit, json } => {
            let ledger = Ledger::open(&cfg.ledger)?;
            let rows = ledger.recent(limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No alerts logged in {}", ledger.describe());
            } else {
                println!("{:<10} {:<8} {:<12} {:<24} {}", "Date", "Time", "Source", "Location", "Image");
                println!("{}", "─".repeat(90));
                for r in rows {
                    println!(
                        "{:<10} {:<8} {:<12} {:<24} {}",
                        r.date, r.time, r.source_id, r.location, r.evidence_ref
                    );
                }
            }
        }

        Command::Sources => {
            if cfg.sources.is_empty() {
                println!("No sources configured.");
            }
            for s in &cfg.sources {
                println!(
                    "{:<12} {:<40} {}",
                    s.id,
                    SourceKind::parse(&s.url).describe(),
                    s.location.as_deref().unwrap_or("(IP lookup)")
                );
            }
        }
    }
    Ok(())
}

fn print_startup_info(cfg: &AppConfig, log_dir: Option<&Path>) {
    let email = if cfg.email.enabled {
        format!("{} via {}", cfg.email.to, cfg.email.smtp_url)
    } else {
        "disabled (alerts logged only)".into()
    };
    let backends = [
        ("onnx", cfg!(feature = "onnx")),
        ("opencv", cfg!(feature = "opencv")),
    ]
    .iter()
    .filter(|(_, on)| *on)
    .map(|(name, _)| *name)
    .collect::<Vec<_>>()
    .join(", ");

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║            HELMET WATCH v{:<32}║", env!("CARGO_PKG_VERSION"));
    println!("╠══════════════════════════════════════════════════════════╣");
    for s in &cfg.sources {
        println!("  Source:    {} → {}", s.id, SourceKind::parse(&s.url).describe());
    }
    println!(
        "  Model:     {} (label '{}', conf ≥ {})",
        cfg.detector.model_path, cfg.detector.alert_label, cfg.detector.confidence_threshold
    );
    println!(
        "  Throttle:  {} ({}s cooldown)",
        cfg.throttle.strategy.as_str(),
        cfg.throttle.cooldown_seconds
    );
    println!("  Evidence:  {}", cfg.evidence.dir);
    println!("  Ledger:    {}", cfg.ledger.path);
    println!("  Email:     {}", email);
    println!("  Backends:  {}", if backends.is_empty() { "none (image dirs only)" } else { backends.as_str() });
    match log_dir {
        Some(dir) => println!("  Logs:      {}", dir.display()),
        None => println!("  Logs:      stdout only"),
    }
    println!("╚══════════════════════════════════════════════════════════╝");
}
