//! vault-sync: end-to-end encrypted vault sync through a relay.
//!
//! The passphrase is read from `VAULT_SYNC_PASSPHRASE` (or `--passphrase`)
//! and never written to disk.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sync_client::config::{PASSPHRASE_ENV, SyncSettings};
use sync_client::native_fs::NativeFs;
use sync_client::orchestrator::SyncOrchestrator;
use sync_client::watcher::{FileEventKind, FileWatcher};

use sync_core::events::SyncStatus;
use sync_core::manifest::ManifestStore;
use sync_core::rules::ScanRules;

/// Auto-sync period for `watch` when neither flag nor settings give one
const DEFAULT_WATCH_INTERVAL_SECS: u64 = 300;

#[derive(Parser, Debug)]
#[command(name = "vault-sync")]
#[command(about = "End-to-end encrypted vault sync")]
struct Args {
    /// Path to the vault directory
    #[arg(short, long, global = true, default_value = ".")]
    vault: PathBuf,

    /// Vault passphrase
    #[arg(long, global = true, env = PASSPHRASE_ENV, hide_env_values = true)]
    passphrase: Option<String>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new vault and print its ID
    Init {
        #[arg(long)]
        relay: String,
    },
    /// Join an existing vault from another device
    Join {
        #[arg(long)]
        relay: String,
        #[arg(long)]
        vault_id: String,
    },
    /// Run one sync cycle and print the result as JSON
    Sync,
    /// Sync continuously: push saves immediately, full cycle on an interval
    Watch {
        /// Seconds between full cycles
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Show vault configuration and last sync
    Status,
}

fn passphrase(args: &Args) -> Result<String> {
    match &args.passphrase {
        Some(p) if !p.is_empty() => Ok(p.clone()),
        _ => bail!("No passphrase given; set {}", PASSPHRASE_ENV),
    }
}

async fn open(vault: &Path) -> Result<(NativeFs, SyncSettings)> {
    if !tokio::fs::try_exists(vault).await.unwrap_or(false) {
        bail!("Vault directory {:?} does not exist", vault);
    }
    let fs = NativeFs::new(vault.to_path_buf());
    let settings = SyncSettings::load(&fs)
        .await
        .context("Failed to load sync settings")?;
    Ok((fs, settings))
}

async fn save_settings(orchestrator: &SyncOrchestrator<Arc<NativeFs>>) -> Result<()> {
    orchestrator
        .settings()
        .save(orchestrator.fs().as_ref())
        .await
        .context("Failed to save sync settings")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info (debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sync_client=debug,sync_core=debug"
    } else {
        "info,sync_client=info,sync_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let (fs, settings) = open(&args.vault).await?;
    let fs = Arc::new(fs);
    debug!("Vault path: {:?}", fs.base_path());

    match &args.command {
        Command::Init { relay } => {
            let passphrase = passphrase(&args)?;
            if settings.vault_id.is_some() {
                bail!("Vault is already configured; delete .sync/config.json to start over");
            }
            let orchestrator = SyncOrchestrator::new(Arc::clone(&fs), settings);
            let vault_id = orchestrator
                .init(&passphrase, relay)
                .await
                .context("Failed to initialize vault")?;
            save_settings(&orchestrator).await?;
            orchestrator.disconnect().await;
            println!("{}", vault_id);
        }

        Command::Join { relay, vault_id } => {
            let passphrase = passphrase(&args)?;
            let orchestrator = SyncOrchestrator::new(Arc::clone(&fs), settings);
            if !orchestrator.join(vault_id, &passphrase, relay).await {
                bail!("Failed to join vault {}", vault_id);
            }
            save_settings(&orchestrator).await?;
            orchestrator.disconnect().await;
            info!("Joined vault {}; run `vault-sync sync` to fetch files", vault_id);
        }

        Command::Sync => {
            let passphrase = passphrase(&args)?;
            let orchestrator = SyncOrchestrator::new(Arc::clone(&fs), settings);
            orchestrator.unlock(&passphrase).await?;

            let result = orchestrator.sync().await;
            orchestrator.disconnect().await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }

        Command::Watch { interval } => {
            let passphrase = passphrase(&args)?;
            let interval = interval
                .or(settings.auto_sync_interval_secs)
                .unwrap_or(DEFAULT_WATCH_INTERVAL_SECS);
            let rules = ScanRules::new(settings.exclude.clone());

            let orchestrator = SyncOrchestrator::new(Arc::clone(&fs), settings);
            let vault_id = orchestrator.unlock(&passphrase).await?;
            info!("Watching vault {} (full sync every {}s)", vault_id, interval);

            let _progress = orchestrator.subscribe(|progress| match progress.status {
                SyncStatus::Error => warn!(
                    "Sync error: {}",
                    progress.error.as_deref().unwrap_or("unknown")
                ),
                status => debug!(
                    "{} {}/{} {}",
                    status,
                    progress.current,
                    progress.total,
                    progress.file_name.as_deref().unwrap_or("")
                ),
            });

            let initial = orchestrator.sync().await;
            if !initial.success {
                warn!("Initial sync failed; retrying on the next tick");
            }
            orchestrator.start_auto_sync(interval);

            let mut watcher = FileWatcher::new(fs.base_path().to_path_buf(), rules, Duration::from_millis(200))
                .context("Failed to start file watcher")?;
            info!("Press Ctrl+C to stop.");

            loop {
                tokio::select! {
                    Some(event) = watcher.event_rx().recv() => match event.kind {
                        FileEventKind::Modified => {
                            if orchestrator.push_file(&event.path).await {
                                info!("Pushed {}", event.path);
                            }
                        }
                        // Deletions travel with the next full cycle
                        FileEventKind::Deleted => debug!("Deleted {}", event.path),
                    },

                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received");
                        break;
                    }
                }
            }

            orchestrator.disconnect().await;
        }

        Command::Status => {
            let store = ManifestStore::new(ScanRules::new(settings.exclude.clone()));
            let manifest = store.load(fs.as_ref()).await;
            let status = json!({
                "vaultId": settings.vault_id.map(|id| id.to_string()),
                "relayUrl": settings.relay_url,
                "trackedFiles": manifest.as_ref().map_or(0, |m| m.files.len()),
                "lastSyncTime": manifest.as_ref().map(|m| m.last_sync_time).filter(|t| *t > 0),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
