use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tifda_orchestrator::{Tifda, TifdaConfig};

#[derive(Parser, Debug)]
#[command(name = "tifda", version, about = "Tactical sensor fusion and dissemination")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs sensor messages through the input firewall only.
    Validate {
        /// JSON-lines file, one sensor message per line.
        messages: PathBuf,
        /// Configuration with the sensor whitelist.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Ingests messages, runs one dissemination cycle, and delivers.
    Run {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        messages: PathBuf,
        /// Approves every parked decision as this reviewer before delivery.
        #[arg(long)]
        approve_as: Option<String>,
        /// Keeps following the visualization mirror for this many seconds.
        #[arg(long, default_value_t = 0)]
        sync_secs: u64,
    },
    /// Ingests messages and prints the resulting picture.
    Snapshot {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        messages: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Validate { messages, config } => {
            let config = config.map_or_else(|| Ok(TifdaConfig::default()), TifdaConfig::load)?;
            let tifda = Tifda::from_config(&config)?;
            let now = Utc::now();
            for (line, raw) in read_messages(&messages)? {
                let verdict = match tifda.validate(&raw, now) {
                    Ok(message) => json!({ "line": line, "sensor_id": message.sensor_id, "accepted": true }),
                    Err(rejection) => json!({ "line": line, "accepted": false, "rejection": rejection }),
                };
                println!("{verdict}");
            }
            println!("{}", serde_json::to_string_pretty(&tifda.firewall_stats())?);
            tifda.shutdown().await;
            Ok(())
        }
        Commands::Run {
            config,
            messages,
            approve_as,
            sync_secs,
        } => {
            let config = TifdaConfig::load(&config)?;
            let tifda = Tifda::from_config(&config)?;
            for error in tifda.config_errors() {
                eprintln!("recipient disabled: {error}");
            }
            let sync = tifda.spawn_sync(&config)?;
            ingest_all(&tifda, &messages)?;
            let mut report = tifda.cycle().await;
            if let Some(reviewer) = approve_as.as_deref() {
                report.decisions.extend(tifda.approve_all(reviewer).await);
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            if let Some(handle) = sync {
                tokio::time::sleep(std::time::Duration::from_secs(sync_secs)).await;
                handle.abort();
            }
            let totals = tifda.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&json!({ "delivery": totals }))?);
            Ok(())
        }
        Commands::Snapshot { config, messages } => {
            let config = TifdaConfig::load(&config)?;
            let tifda = Tifda::from_config(&config)?;
            ingest_all(&tifda, &messages)?;
            println!("{}", serde_json::to_string_pretty(tifda.snapshot().as_ref())?);
            tifda.shutdown().await;
            Ok(())
        }
    }
}

fn read_messages(path: &Path) -> Result<Vec<(usize, Value)>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut messages = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let raw = serde_json::from_str(&line)
            .with_context(|| format!("{}:{} is not JSON", path.display(), index + 1))?;
        messages.push((index + 1, raw));
    }
    Ok(messages)
}

fn ingest_all(tifda: &Tifda, path: &Path) -> Result<()> {
    for (line, raw) in read_messages(path)? {
        let report = tifda.ingest(&raw, Utc::now());
        if !report.accepted() || !report.dropped.is_empty() {
            eprintln!("line {line}: {}", serde_json::to_string(&report)?);
        }
    }
    Ok(())
}
