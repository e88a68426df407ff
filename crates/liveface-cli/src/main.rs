//! `liveface` — inspect, verify and purge captured jobs on disk.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use liveface_capture::{ArtifactKind, ArtifactStore, CaptureConfig, Lifecycle};

#[derive(Parser)]
#[command(name = "liveface", about = "Inspect liveface capture jobs")]
struct Cli {
    /// TOML configuration file. Environment variables are used when absent.
    #[arg(long, env = "LIVEFACE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the artifact root directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List job ids, optionally in a single lifecycle directory.
    Jobs {
        /// pending, submitted or failed_offline
        #[arg(long)]
        lifecycle: Option<Lifecycle>,
    },
    /// Print a job's manifest.
    Show { job_id: String },
    /// Re-hash a job's artifacts against its manifest.
    Verify { job_id: String },
    /// Move a job queued offline back to pending for resubmission.
    Requeue { job_id: String },
    /// Delete a job from every lifecycle directory.
    Purge {
        job_id: Option<String>,
        /// Delete every job in this lifecycle instead.
        #[arg(long, conflicts_with = "job_id")]
        lifecycle: Option<Lifecycle>,
    },
    /// Print the effective configuration as TOML.
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => CaptureConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CaptureConfig::from_env(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    if let Command::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let store = ArtifactStore::open(&config.data_dir)
        .with_context(|| format!("opening store at {}", config.data_dir.display()))?;

    match cli.command {
        Command::Jobs { lifecycle } => {
            let lifecycles = match lifecycle {
                Some(l) => vec![l],
                None => Lifecycle::ALL.to_vec(),
            };
            for lifecycle in lifecycles {
                for job_id in store.list_jobs(lifecycle)? {
                    let liveness = store
                        .list_in(&job_id, ArtifactKind::Liveness, lifecycle)
                        .map(|v| v.len())
                        .unwrap_or(0);
                    println!("{lifecycle:<15} {job_id}  liveness={liveness}");
                }
            }
        }
        Command::Show { job_id } => {
            let manifest = store
                .read_manifest(&job_id)
                .with_context(|| format!("reading manifest for {job_id}"))?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        Command::Verify { job_id } => {
            let manifest = store.verify_job(&job_id)?;
            let lifecycle = store
                .locate(&job_id)
                .map(|l| l.to_string())
                .unwrap_or_default();
            println!(
                "{job_id}: {} artifacts ok ({lifecycle})",
                manifest.artifacts.len()
            );
        }
        Command::Requeue { job_id } => {
            store.requeue(&job_id)?;
            tracing::info!(job_id, "job requeued");
        }
        Command::Purge { job_id, lifecycle } => {
            let targets = match (job_id, lifecycle) {
                (Some(job_id), _) => vec![job_id],
                (None, Some(lifecycle)) => store.list_jobs(lifecycle)?,
                (None, None) => bail!("purge needs a job id or --lifecycle"),
            };
            for job_id in &targets {
                store.delete(job_id)?;
            }
            tracing::info!(count = targets.len(), "jobs purged");
        }
        Command::Config => {}
    }

    Ok(())
}
