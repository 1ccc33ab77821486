use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use disco_core::FetchHistory;
use disco_sync::{IngestionRuntime, RunNowRequest, RunNowResponse, SyncConfig};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "disco")]
#[command(about = "Local discovery event ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the worker pool (and recurring jobs when enabled) until ctrl-c.
    Worker,
    /// Fetch one source now and wait for the run to finish.
    Run {
        #[arg(long)]
        source: String,
        /// Run even if the source already succeeded today.
        #[arg(long)]
        force: bool,
    },
    /// Print recent fetch history, newest first.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Migrate,
    /// Admin API plus the worker pool.
    Serve,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let config = SyncConfig::from_env();
    let runtime = IngestionRuntime::from_config(config)
        .await
        .context("starting ingestion runtime")?;

    match cli.command.unwrap_or(Commands::Worker) {
        Commands::Worker => run_workers(&runtime, None).await?,
        Commands::Run { source, force } => {
            match runtime.trigger.run_now(RunNowRequest::new(source, force)).await? {
                RunNowResponse::Skipped {
                    source_id,
                    last_run_at,
                } => {
                    println!("skipped: {source_id} already succeeded at {last_run_at}");
                }
                RunNowResponse::Enqueued { job_id, .. } => {
                    info!(%job_id, "running job to completion");
                    for row in runtime.scheduler.drain().await? {
                        print_history(&row);
                    }
                }
            }
        }
        Commands::History { limit } => {
            for row in runtime.trigger.status(limit).await? {
                print_history(&row);
            }
        }
        Commands::Migrate => {
            runtime.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let port = runtime.config.web_port;
            let state = disco_web::AppState::new(runtime.trigger.clone());
            run_workers(&runtime, Some(tokio::spawn(disco_web::serve(state, port)))).await?;
        }
    }

    Ok(())
}

async fn run_workers(
    runtime: &IngestionRuntime,
    server: Option<tokio::task::JoinHandle<Result<()>>>,
) -> Result<()> {
    let (stop, shutdown) = watch::channel(false);
    let workers = runtime.scheduler.spawn_workers(shutdown);
    let mut recurring = runtime.recurring().await?;
    if let Some(recurring) = &recurring {
        recurring.start().await?;
        info!(cron = %runtime.config.sync_cron, "recurring jobs started");
    }
    info!(workers = workers.len(), "worker pool running, ctrl-c to stop");

    let server_outcome = match server {
        Some(mut server) => tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                server.abort();
                signal.context("waiting for ctrl-c")
            }
            joined = &mut server => match joined {
                Ok(result) => result.context("admin api stopped"),
                Err(err) => Err(err).context("admin api task panicked"),
            },
        },
        None => tokio::signal::ctrl_c()
            .await
            .context("waiting for ctrl-c"),
    };
    info!("shutting down");

    if let Some(recurring) = recurring.as_mut() {
        recurring.shutdown().await?;
    }
    stop.send(true).ok();
    for worker in workers {
        if let Err(err) = worker.await {
            warn!(error = %err, "worker task ended abnormally");
        }
    }
    server_outcome
}

fn print_history(row: &FetchHistory) {
    let approved = row
        .events_approved
        .map(|n| n.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{} {} status={} found={} processed={} approved={} elapsed_ms={}",
        row.started_at.to_rfc3339(),
        row.source_id,
        row.status,
        row.events_found,
        row.events_processed,
        approved,
        row.execution_time_ms
    );
    if let Some(details) = &row.error_details {
        for detail in details {
            println!(
                "    {:?} {} {}",
                detail.stage,
                detail.external_id.as_deref().unwrap_or("-"),
                detail.message
            );
        }
    }
}
