mod cli;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chorus_core::app::{Admin, RetryPolicy, Runtime, RuntimeSettings};
use chorus_core::domain::{ConfigId, SelectorCatalog};
use chorus_core::impls::{BandEnergyLoader, SqliteConnector, WavDirectorySource};
use chorus_core::ports::StoreConnector;

use crate::cli::{Cli, Command, RunArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_json);

    let connector = SqliteConnector::new(&cli.db);
    match cli.command {
        Command::Run(args) => run(connector, args).await,
        command => admin(connector, command).await,
    }
}

async fn run(connector: SqliteConnector, args: RunArgs) -> Result<()> {
    let settings = RuntimeSettings {
        workers: args.workers,
        idle_interval: args.idle,
        retry: RetryPolicy::default(),
        exit_when_idle: args.once,
    };
    let runtime = Runtime::new(
        settings,
        Arc::new(connector),
        Arc::new(WavDirectorySource::new(args.media_root)),
        Arc::new(BandEnergyLoader::new(args.model)),
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let report = runtime.run(cancel).await.context("runtime failed to start")?;
    info!(
        done = report.workers.done,
        failed = report.workers.failed,
        "run finished"
    );
    Ok(())
}

async fn admin(connector: SqliteConnector, command: Command) -> Result<()> {
    let store = connector
        .connect()
        .await
        .with_context(|| format!("cannot open queue store {}", connector.path().display()))?;
    let admin = Admin::new(store);

    match command {
        Command::Enqueue {
            config,
            selector,
            catalog,
            tag,
        } => {
            let config: ConfigId = config.parse()?;
            let catalog = SelectorCatalog::load(&catalog)?;
            let inserted = admin
                .enqueue_batch(&config, &catalog, &selector, tag.as_deref())
                .await?;
            println!("{inserted} task(s) enqueued");
        }
        Command::ResetQueue => {
            let removed = admin.reset_queue().await?;
            println!("{removed} task(s) removed");
        }
        Command::ResetFailed => {
            let requeued = admin.reset_failed().await?;
            println!("{requeued} task(s) returned to the queue");
        }
        Command::Status { json } => {
            let counts = admin.queue_status().await?;
            if json {
                println!("{}", serde_json::to_string(&counts)?);
            } else {
                println!("pending      {}", counts.pending);
                println!("in progress  {}", counts.in_progress);
                println!("done         {}", counts.done);
                println!("failed       {}", counts.failed);
            }
        }
        Command::Tasks { state } => {
            for task in admin.list_tasks(state.map(Into::into)).await? {
                println!(
                    "{}  {:<11}  {}  {}",
                    task.id,
                    format!("{:?}", task.state),
                    task.subject_id,
                    task.config_id.short()
                );
            }
        }
        Command::StoreConfig { file, comment } => {
            let id = admin.store_config_file(&file, comment.as_deref()).await?;
            println!("{id}");
        }
        Command::ShowConfig { id } => {
            let stored = admin.get_config(&id.parse()?).await?;
            println!("{}", serde_json::to_string_pretty(&stored)?);
        }
        Command::ImportSubjects { file } => {
            let report = admin.import_subjects_file(&file).await?;
            println!(
                "{} subject(s) registered, {} already known",
                report.registered, report.skipped
            );
        }
        Command::Run(_) => bail!("run is not an admin command"),
    }
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    wait_for_signal().await;
    warn!("shutdown signal received, draining");
    cancel.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let Ok(mut term) = signal(SignalKind::terminate()) else {
        let _ = tokio::signal::ctrl_c().await;
        return;
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
