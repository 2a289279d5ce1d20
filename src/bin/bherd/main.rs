mod args;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use beanherd::connection::QueuePool;
use beanherd::enqueue::Enqueuer;
use beanherd::registry::OperationRegistry;
use beanherd::worker::{WorkerConfig, WorkerLoop};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn, Level};

use crate::args::Args;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    // Ctrl-c requests a clean shutdown: the loop settles its current job and
    // closes its sessions before exiting.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    if let Err(error) = begin(args, cancel).await {
        error!(%error, "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn begin(args: Args, cancel: CancellationToken) -> Result<()> {
    let registry = Arc::new(OperationRegistry::new());

    // The worker gets its own sessions for re-submissions, separate from the
    // ones it reserves on: a job enqueued mid-dispatch must go back to the
    // queue, never run inline.
    let producer = QueuePool::new(args.servers.clone());
    let enqueuer = Enqueuer::new(
        Some(Box::new(producer)),
        Arc::clone(&registry),
        args.app_version.clone(),
    );

    let consumer = QueuePool::new(args.servers);
    let config = WorkerConfig {
        sleep_time: Duration::from_secs(args.sleep_time),
        stale_after_secs: args.stale_after,
        ..WorkerConfig::default()
    };

    let worker =
        WorkerLoop::new(Some(Box::new(consumer)), enqueuer, config, cancel)
            .context("building worker loop")?;

    worker.run().await.context("worker loop failed")?;

    Ok(())
}
