mod failures;
mod http;
mod llm;
mod media;
mod models;
mod processor;
mod remote;
mod scheduler;
mod staging;

use crate::failures::FailureLog;
use crate::llm::{LlmClient, LlmConfig};
use crate::media::MediaFetcher;
use crate::processor::ItemProcessor;
use crate::remote::{RemoteConfig, SftpStore};
use crate::scheduler::{Scheduler, SchedulerConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target: "attrib.main", error = %err, "worker failed");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let remote_config = RemoteConfig::from_env()?;
    let scheduler_config = SchedulerConfig::from_env();
    info!(
        target: "attrib.main",
        host = %remote_config.host,
        batch_size = scheduler_config.batch_size,
        "starting attribute worker"
    );

    let classifier = Arc::new(LlmClient::new(LlmConfig::from_env()));
    let processor = Arc::new(ItemProcessor::new(
        classifier,
        MediaFetcher::new(http::build_client()),
        Arc::new(FailureLog::from_env()),
    ));
    let remote = Arc::new(SftpStore::new(remote_config));

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let scheduler = Scheduler::new(scheduler_config, remote, processor, shutdown);
    scheduler.run().await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// First SIGINT or SIGTERM cancels the token; the scheduler finishes its
/// current item and exits at the next checkpoint.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let interrupt = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(stream) => stream,
                    Err(err) => {
                        error!(target: "attrib.main", error = %err, "cannot listen for SIGTERM");
                        let _ = interrupt.await;
                        info!(target: "attrib.main", "interrupt received, requesting shutdown");
                        shutdown.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = interrupt => info!(target: "attrib.main", "interrupt received, requesting shutdown"),
                _ = terminate.recv() => info!(target: "attrib.main", "termination signal received, requesting shutdown"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = interrupt.await;
            info!(target: "attrib.main", "interrupt received, requesting shutdown");
        }
        shutdown.cancel();
    });
}
