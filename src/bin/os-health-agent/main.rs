//! os-health-agent CLI entry point.

mod cli;

use clap::Parser;
use cli::{Cli, Command, LogFormat, RestartMode};
use os_health_agent::upgrade::{
    BackupManager, BackupSnapshot, ExecSupervisor, GithubReleaseSource, Resolution,
    RollbackController, ServiceManagerSupervisor, UpdateContext, VersionResolver,
};
use os_health_agent::{AgentBuilder, AgentConfig, ProcessSupervisor};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }

    info!("os-health-agent v{}", env!("CARGO_PKG_VERSION"));

    let config = cli.to_config()?;

    match cli.command.clone().unwrap_or(Command::Run) {
        Command::Run => run(config, cli.restart_mode).await?,
        Command::Check => check(&config).await?,
        Command::Rollback { snapshot } => rollback(&config, snapshot.as_deref())?,
        Command::Backups { prune } => backups(&config, prune)?,
    }

    info!("Goodbye!");
    Ok(())
}

async fn run(config: AgentConfig, restart_mode: RestartMode) -> color_eyre::Result<()> {
    let supervisor: Arc<dyn ProcessSupervisor> = match restart_mode {
        RestartMode::Exec => Arc::new(ExecSupervisor),
        RestartMode::Exit => Arc::new(ServiceManagerSupervisor::default()),
    };

    let mut agent = AgentBuilder::new(config)
        .with_supervisor(supervisor)
        .build()?;
    agent.run().await?;
    Ok(())
}

async fn check(config: &AgentConfig) -> color_eyre::Result<()> {
    config.validate()?;
    let ctx = UpdateContext::from_config(config)?;
    let source = GithubReleaseSource::new(
        &config.upgrade.api_base_url,
        Duration::from_secs(config.upgrade.request_timeout_secs),
    )?;

    match VersionResolver::new(Arc::new(source)).resolve(&ctx).await? {
        Resolution::UpToDate => {
            println!("os-health-agent {} is up to date", ctx.current_version);
        }
        Resolution::Available { target, metadata } => {
            println!("Update available: {} -> {}", ctx.current_version, target);
            if let Some(published) = metadata.published_at {
                println!("Published: {published}");
            }
            if !metadata.notes().is_empty() {
                println!("\n{}", metadata.notes());
            }
        }
    }
    Ok(())
}

fn rollback(config: &AgentConfig, snapshot: Option<&Path>) -> color_eyre::Result<()> {
    let controller = RollbackController::new(config.install_dir.clone());
    let restored = match snapshot {
        Some(path) => {
            let snapshot = BackupSnapshot::open(path)?;
            controller.restore(&snapshot)?;
            snapshot
        }
        None => controller.restore_latest(&BackupManager::for_install(&config.install_dir)?)?,
    };
    println!(
        "Restored version {} from {}",
        restored.version(),
        restored.path().display()
    );
    Ok(())
}

fn backups(config: &AgentConfig, prune: Option<usize>) -> color_eyre::Result<()> {
    let manager = BackupManager::for_install(&config.install_dir)?;

    if let Some(keep) = prune {
        let removed = manager.prune(keep, None)?;
        println!("Removed {} snapshots", removed.len());
    }

    let snapshots = manager.list()?;
    if snapshots.is_empty() {
        println!("No backups in {}", manager.backup_root().display());
    }
    for snapshot in snapshots {
        println!(
            "{}  v{}  {} files  {}",
            snapshot.created_at().format("%Y-%m-%d %H:%M:%S"),
            snapshot.version(),
            snapshot.manifest().files.len(),
            snapshot.path().display()
        );
    }
    Ok(())
}
