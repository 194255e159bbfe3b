//! MedGemma worker binary.
//!
//! Loads the model eagerly when it can, then serves jobs from the queue until
//! the queue closes or the process is told to stop.

use clap::Parser;
use medgemma_worker::{
    config::{Args, WorkerConfig},
    runtime::CandleProvider,
    worker::{select_source, Worker},
    InferenceService,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    args.logging.init();

    info!("MedGemma worker starting up");

    let config = WorkerConfig::load(&args)?;
    let provider = Arc::new(CandleProvider::from_settings(&config.model));
    let service = Arc::new(InferenceService::new(provider, &config));

    info!("Initializing {}...", config.model.id);
    match service.initialize().await {
        Ok(()) => {
            if let Some(model) = service.model_info() {
                info!(device = %model.device, precision = %model.precision, "Model ready");
            }
        }
        Err(e) => {
            warn!("Could not initialize model at startup: {}", e);
            warn!("Model will be initialized on first request");
        }
    }

    let source = select_source(args.test_input.as_deref(), &config.runtime)?;
    let heartbeat = source.start_heartbeat();

    let worker = Worker::new(
        service,
        source,
        Duration::from_millis(config.runtime.poll_backoff_ms),
    )
    .with_shutdown_grace(Duration::from_millis(config.runtime.shutdown_grace_ms));
    let stats = worker.run(shutdown_signal()).await;

    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }

    info!(
        jobs_processed = stats.jobs_processed,
        jobs_failed = stats.jobs_failed,
        "MedGemma worker stopped"
    );
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
