//! Bulk enhance-and-publish worker
//!
//! Single-binary CLI that:
//! 1. Imports scraped products into source batches
//! 2. Runs jobs: enhance copy, edit two images per product, push to the store
//! 3. Parks a job until the daily quota reset when every image key runs out
//! 4. Pushes generated items that never reached the store

mod cli;
mod config;
mod enhancer;
mod error;
mod http;
mod image_edit;
mod import;
mod metrics;
mod shop;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use common::Secret;
use engine::{Job, JobId, JobService, JsonJobStore, StartedRun, TaskContext};
use key_pool::{ExhaustionLedger, KeyRotator, RotatingImageEditor};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::enhancer::HttpEnhancer;
use crate::image_edit::HttpImageEditClient;
use crate::shop::ShopifyPublisher;

/// How often a waiting CLI logs the run's progress.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cli = Cli::parse();

    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        shop_url = %config.store.shop_url,
        parallelism = config.engine.parallelism,
        image_keys = config.image_edit.keys.len(),
        data_file = %config.engine.data_file.display(),
        "configuration loaded"
    );

    let prometheus = metrics::install_recorder(config.metrics.listen_addr)
        .context("failed to install Prometheus recorder")?;

    let service = build_service(&config).await?;

    if matches!(
        cli.command,
        Command::Run { .. } | Command::Resume { .. } | Command::Push { .. }
    ) {
        let recovered = service.recover_interrupted().await?;
        if !recovered.is_empty() {
            warn!(jobs = ?recovered, "marked interrupted jobs as stopped");
        }
    }

    match cli.command {
        Command::Import { file, source_ref } => {
            let source_ref = cli::source_ref(&file, source_ref)?;
            let products = import::read_products(&file, &source_ref)?;
            let count = service.import_products(products).await?;
            info!(count, source_ref = %source_ref, "products imported");
        }
        Command::Create { source_ref } => print_json(&service.create_job(&source_ref).await?)?,
        Command::Run { job_id, options } => {
            let run = service.start_job(job_id, options.into()).await?;
            print_json(&wait_for_run(&service, job_id, run).await?)?;
        }
        Command::Resume { job_id, options } => {
            let run = service.resume_job(job_id, options.into()).await?;
            print_json(&wait_for_run(&service, job_id, run).await?)?;
        }
        Command::Push { job_id } => {
            let run = service.start_push(job_id).await?;
            print_json(&wait_for_run(&service, job_id, run).await?)?;
        }
        Command::Stop { job_id } => print_json(&service.stop_job(job_id).await?)?,
        Command::Status { job_id: Some(job_id) } => print_json(&service.job(job_id).await?)?,
        Command::Status { job_id: None } => print_json(&service.jobs().await?)?,
        Command::Health => print_json(&service.key_health().await)?,
    }

    if let Some(handle) = prometheus {
        debug!(metrics = %handle.render(), "final metrics");
    }
    Ok(())
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("failed to build HTTP client")
}

/// Wire the repository, capability clients, key rotation, and gates.
async fn build_service(config: &Config) -> Result<JobService> {
    let store = JsonJobStore::open(config.engine.data_file.clone())
        .await
        .with_context(|| format!("failed to open {}", config.engine.data_file.display()))?;

    let token = config
        .store
        .access_token
        .clone()
        .context("store access token missing")?;
    let publisher = ShopifyPublisher::new(
        http_client(config.store.timeout_secs)?,
        &config.store.shop_url,
        &config.store.api_version,
        token,
    );
    let enhancer = HttpEnhancer::new(
        http_client(config.enhancer.timeout_secs)?,
        config.enhancer.endpoint.clone(),
    );

    let image_http = http_client(config.image_edit.timeout_secs)?;
    let endpoint = config.image_edit.endpoint.clone();
    let rotator = KeyRotator::new(
        config.image_edit.keys.clone(),
        move |key: &str| {
            HttpImageEditClient::new(image_http.clone(), endpoint.clone(), Secret::new(key.to_string()))
        },
        config.reset_schedule()?,
    );
    let rotator = match &config.image_edit.ledger_path {
        Some(path) => {
            let ledger = ExhaustionLedger::load(path.clone())
                .await
                .with_context(|| format!("failed to load key ledger {}", path.display()))?;
            rotator.with_ledger(ledger).await
        }
        None => rotator,
    };
    let editor = RotatingImageEditor::new(Arc::new(rotator));

    let ctx = TaskContext {
        repo: Arc::new(store),
        enhancer: Arc::new(enhancer),
        editor: Arc::new(editor),
        publisher: Arc::new(publisher),
        gates: Arc::new(config.gate_bank()),
        settings: config.task_settings(),
    };
    Ok(JobService::new(ctx, config.engine_settings())?)
}

/// Wait for a run while logging progress; Ctrl-C asks the job to stop after
/// its in-flight products.
async fn wait_for_run(service: &JobService, job_id: JobId, run: StartedRun) -> Result<Job> {
    let StartedRun {
        run_id,
        progress,
        mut task,
    } = run;
    info!(%job_id, %run_id, "waiting for run");

    let mut ticker = tokio::time::interval(PROGRESS_LOG_INTERVAL);
    ticker.tick().await;
    let mut stop_requested = false;
    loop {
        tokio::select! {
            joined = &mut task => {
                return joined.context("run task panicked")?.context("run failed");
            }
            _ = ticker.tick() => {
                let snapshot = progress.snapshot();
                info!(
                    %job_id,
                    current = snapshot.current,
                    total = snapshot.total,
                    created = snapshot.created,
                    pushed = snapshot.pushed,
                    status = %snapshot.status,
                    "progress"
                );
            }
            signal = tokio::signal::ctrl_c(), if !stop_requested => {
                signal.context("failed to listen for ctrl-c")?;
                warn!(%job_id, "interrupt received, stopping after in-flight products");
                service.stop_job(job_id).await?;
                stop_requested = true;
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
