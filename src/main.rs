use std::{fs, path::Path, process::ExitCode, sync::Arc};

use anyhow::{Context, Error};
use clap::Parser;
use log::{error, info};

use keel::{
    cli::{Cli, Commands},
    diagnostics::{DiagnosticsSink, FileSink, NullSink},
    engine::{EngineConfig, StorageEngine},
    probe::{
        prober::LsblkProber,
        watcher::{udev_monitor, UdevSettle},
        ProbeClass, Prober,
    },
    KEEL_VERSION,
};
use keel_api::{config::StorageAutoinstall, status::ProbeStatus};

fn setup_logging(args: &Cli) {
    env_logger::builder()
        .format_timestamp(None)
        .filter_level(args.verbosity)
        .init();
}

fn load_storage_document(path: &Path) -> Result<StorageAutoinstall, Error> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read '{}'", path.display()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&text).context("Failed to parse document")?;
    // Accept either a full document carrying a `storage:` section or the
    // section itself.
    let section = value.get("storage").cloned().unwrap_or(value);
    serde_yaml::from_value(section).context("Failed to parse the storage section")
}

async fn run(args: Cli) -> Result<(), Error> {
    match args.command {
        Commands::Probe { privileged } => {
            let class = if privileged {
                ProbeClass::Privileged
            } else {
                ProbeClass::Safe
            };
            let payload = tokio::task::spawn_blocking(move || LsblkProber.probe(class))
                .await
                .context("Probe task failed")??;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }

        Commands::Scenarios { source_size } => {
            let engine = StorageEngine::new(
                Arc::new(LsblkProber),
                Arc::new(NullSink),
                EngineConfig {
                    source_size: source_size.bytes(),
                    ..Default::default()
                },
            );
            engine.trigger_probe();
            let guided = engine.guided_status(true).await;
            if guided.status == ProbeStatus::Failed {
                anyhow::bail!(
                    "hardware probe failed: {}",
                    guided
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "unknown error".to_string())
                );
            }
            println!("{}", serde_yaml::to_string(&guided.possible)?);
        }

        Commands::Plan {
            config,
            output,
            source_size,
        } => {
            let document = load_storage_document(&config)?;
            let engine = StorageEngine::new(
                Arc::new(LsblkProber),
                Arc::new(NullSink),
                EngineConfig {
                    source_size: source_size.bytes(),
                    ..Default::default()
                },
            );
            engine.load_autoinstall(Some(document), false);
            engine.trigger_probe();
            engine
                .apply_autoinstall()
                .await
                .map_err(|e| e.unstructured("Failed to apply unattended storage configuration"))?;

            let status = engine.status(false).await;
            let rendered = serde_yaml::to_string(&status.config)?;
            match output {
                Some(path) => fs::write(&path, rendered)
                    .with_context(|| format!("Failed to write '{}'", path.display()))?,
                None => print!("{rendered}"),
            }
        }

        Commands::Validate { config } => {
            let document = load_storage_document(&config)?;
            if let Some(layout) = &document.layout {
                layout
                    .mode()
                    .context("Invalid unattended storage document")?;
            }
            info!("{} is valid", config.display());
        }

        Commands::Watch { report_dir } => {
            // Long-running mode also emits span telemetry as JSON lines.
            let subscriber = tracing_subscriber::fmt()
                .json()
                .with_max_level(tracing::Level::INFO)
                .finish();
            if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
                log::warn!("failed to set tracing subscriber: {e}");
            }

            let sink: Arc<dyn DiagnosticsSink> = match report_dir {
                Some(dir) => Arc::new(FileSink::new(dir)),
                None => Arc::new(NullSink),
            };
            let engine = StorageEngine::new(
                Arc::new(LsblkProber),
                sink,
                EngineConfig::default(),
            );
            let (events, _monitor) = udev_monitor()?;
            let watcher = engine.watch(events, Arc::new(UdevSettle));
            engine.trigger_probe();
            info!("watching for device-topology changes; ctrl-c to stop");

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            engine.set_configured();
            watcher.await.context("Watcher task failed")?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    setup_logging(&args);
    info!("keel version {KEEL_VERSION}");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("keel failed: {e:?}");
            ExitCode::from(2)
        }
    }
}
