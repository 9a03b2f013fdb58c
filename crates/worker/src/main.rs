//! `genqueue-worker` -- batch image generation against a ComfyUI server.
//!
//! Reads a prompt file, queues one job per prompt and drives them through
//! the orchestrator until the queue drains or the process is signalled.
//! A JSON report of the batch is printed to stdout at the end.
//!
//! See [`WorkerConfig::from_env`] for the environment variables.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use genqueue_comfyui::accessor::RenderAccessor;
use genqueue_comfyui::api::ComfyUIApi;
use genqueue_core::job::WorkflowParams;
use genqueue_pipeline::orchestrator::Orchestrator;
use genqueue_pipeline::progress::logging_observer;
use genqueue_worker::config::WorkerConfig;
use genqueue_worker::inputs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env();
    init_tracing(config.as_ref().is_ok_and(|c| c.log_json));
    let config = config.context("loading configuration")?;

    let prompts = inputs::load_prompts(&config.prompts_file).await?;

    let accessor: Arc<dyn RenderAccessor> = Arc::new(ComfyUIApi::new(config.api_url.clone()));
    let max_attempts = config.pipeline.executor.max_attempts;
    let mut orchestrator = Orchestrator::new(accessor, config.pipeline.clone());
    if let Some(path) = &config.workflow_file {
        orchestrator = orchestrator.with_template(inputs::load_workflow(path).await?);
        tracing::info!(workflow = %path.display(), "Workflow template loaded");
    }

    let queued = orchestrator
        .enqueue_prompts(
            prompts,
            &config.workflow_type,
            &WorkflowParams::new(),
            config.priority,
            max_attempts,
        )
        .await;
    tracing::info!(
        jobs = queued.len(),
        api_url = %config.api_url,
        max_attempts,
        "Prompts queued",
    );

    orchestrator
        .add_observer(logging_observer(config.progress_log_interval))
        .await;
    orchestrator.start().await.context("starting orchestrator")?;

    tokio::select! {
        () = orchestrator.wait() => {}
        () = shutdown_signal() => {
            if !orchestrator.stop(true).await {
                tracing::warn!("Orchestrator did not stop cleanly");
            }
        }
    }

    let results = orchestrator.batch_results().await;
    for failed in &results.failed {
        tracing::warn!(
            job_id = %failed.job_id,
            attempts = failed.attempts,
            reason = %failed.failure.as_ref().map(|f| f.to_string()).unwrap_or_default(),
            "Job failed",
        );
    }
    tracing::info!(
        completed = results.completed.len(),
        failed = results.failed.len(),
        cancelled = results.cancelled,
        success_rate = results.success_rate,
        "Batch finished",
    );

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "genqueue_worker=info,genqueue_pipeline=info,genqueue_comfyui=info".into()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

/// Resolve on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), stopping batch");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, stopping batch");
        }
    }
}
