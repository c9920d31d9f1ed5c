use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use tempfile::TempDir;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod audit;
mod config;
mod error;
mod keys;
mod migrate;
mod mirror;
mod sources;
mod verify;

use audit::report::RunReport;
use config::settings::MigrateConfig;
use migrate::run::Migrator;
use mirror::fetch::{HttpFetcher, MetadataFetcher};
use verify::gpg::{GpgKeyTool, KeyTool};

/// Give every APT repository entry its own signed-by keyring instead of
/// trusting the global apt-key store.
#[derive(Parser, Debug)]
#[command(name = "apt-signedby", version)]
struct Cli {
    /// Directory receiving the per-repository keyrings [default: /usr/share/keyrings]
    keyring_dir: Option<PathBuf>,

    /// Repository files to migrate [default: /etc/apt/sources.list and /etc/apt/sources.list.d/*.list]
    repo_files: Vec<PathBuf>,

    /// TOML file overriding the built-in defaults.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Keyserver keys are fetched from.
    #[arg(long, value_name = "URL")]
    keyserver: Option<String>,

    /// Timeout for every network call, in seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Print a JSON report of the run on stdout.
    #[arg(long)]
    json: bool,

    /// More log output; repeat for trace level.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn load_config(&self) -> Result<MigrateConfig> {
        let mut config = match &self.config {
            Some(path) => MigrateConfig::load_from_file(path)?,
            None => MigrateConfig::default(),
        };

        if let Some(dir) = &self.keyring_dir {
            config.keyring_dir = dir.clone();
        }
        if let Some(keyserver) = &self.keyserver {
            config.keyserver = keyserver.clone();
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout;
        }

        Ok(config)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Runs the migration unless `cancel` resolves first. Either way the key
/// tool's helpers are stopped and `workdir` is removed before returning.
async fn run_with_cleanup<F, T, C>(
    migrator: &mut Migrator<F, T>,
    files: &[PathBuf],
    workdir: TempDir,
    cancel: C,
) -> Option<RunReport>
where
    F: MetadataFetcher,
    T: KeyTool + Sync,
    C: Future<Output = ()>,
{
    let finished = tokio::select! {
        biased;
        _ = cancel => None,
        report = migrator.run(files) => Some(report),
    };

    if let Err(e) = migrator.shutdown().await {
        warn!("failed to stop gpg helpers: {}", e);
    }
    if let Err(e) = workdir.close() {
        warn!("failed to remove temporary working directory: {}", e);
    }

    finished
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = cli.load_config()?;
    config.prepare_keyring_dir()?;

    let files = sources::enumerate::repository_files(&config, &cli.repo_files);
    if files.is_empty() {
        info!("No repository files found, nothing to migrate");
        return Ok(ExitCode::SUCCESS);
    }

    let workdir = tempfile::Builder::new()
        .prefix("apt-signedby.")
        .tempdir()
        .context("failed to create temporary working directory")?;

    let fetcher = HttpFetcher::new(config.timeout())?;
    let tool = GpgKeyTool::new(&config, workdir.path())?;
    let mut migrator = Migrator::new(config, fetcher, tool);

    let interrupted = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let finished = run_with_cleanup(&mut migrator, &files, workdir, interrupted).await;

    let report = match finished {
        Some(report) => report,
        None => {
            warn!("Interrupted; files already rewritten are kept");
            return Ok(ExitCode::from(130));
        }
    };

    report.log_summary();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(ExitCode::from(report.exit_code() as u8))
}
