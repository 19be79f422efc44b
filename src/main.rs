use std::sync::Arc;

use actix_multipart::form::MultipartFormConfig;
use actix_web::{web, App, HttpServer};
use clap::Parser;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::info;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

use recon_processor::api::{health::health_config, job::handlers::job_config, job::JobService, validation};
use recon_processor::config::{Cli, Config};
use recon_processor::jobs::JobRegistry;
use recon_processor::shutdown::ShutdownCoordinator;
use recon_processor::worker::{JobWorker, QueuedJob};

/// Accepted jobs waiting for a worker; submissions block briefly when full.
const JOB_QUEUE_DEPTH: usize = 64;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = Config::from_env()
        .expect("Failed to load configuration")
        .apply_cli(Cli::parse());

    config
        .ensure_dirs()
        .expect("Failed to create data directories");

    // File-based logging with daily rotation plus console output. Per-job
    // pipeline output goes to each job's own log file, not here.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    let info_file = tracing_appender::rolling::daily(&config.server_log_dir, "info.log");
    let error_file = tracing_appender::rolling::daily(&config.server_log_dir, "error.log");

    let info_layer = tracing_subscriber::fmt::layer()
        .with_writer(info_file)
        .with_ansi(false)
        .with_filter(LevelFilter::INFO);

    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(error_file)
        .with_ansi(false)
        .with_filter(LevelFilter::ERROR);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(info_layer)
        .with(error_layer)
        .init();

    info!("Starting recon-processor");
    info!("Configuration loaded successfully:");
    info!("  - Upload dir: {}", config.dirs.upload_dir.display());
    info!("  - Output dir: {}", config.dirs.output_dir.display());
    info!("  - Gaussian splatting dir: {}", config.tools.gaussian_dir.display());
    info!("  - Trainer dir: {}", config.tools.trainer_dir.display());
    info!("  - Max concurrent jobs: {}", config.max_concurrent_jobs);
    info!("  - Number of workers: {}", config.num_workers);

    let config = Arc::new(config);
    let registry = Arc::new(JobRegistry::new(config.dirs.clone()));
    let (queue_tx, queue_rx) = mpsc::channel::<QueuedJob>(JOB_QUEUE_DEPTH);
    let queue_rx = Arc::new(Mutex::new(queue_rx));

    // Shutdown channel: watch allows every worker to observe the signal
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Spawn background workers with semaphore-based bounded concurrency
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
    let mut worker_handles = Vec::new();

    for worker_id in 1..=config.num_workers {
        let worker = JobWorker::new(registry.clone(), config.clone(), queue_rx.clone());
        let worker_semaphore = semaphore.clone();
        let worker_shutdown_rx = shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            worker.run(worker_id, worker_semaphore, worker_shutdown_rx).await;
        });

        worker_handles.push(handle);
        info!("Spawned worker {}", worker_id);
    }

    let server_config = config.clone();
    let server_registry = registry.clone();

    let server = HttpServer::new(move || {
        let job_service = web::Data::new(JobService::new(
            server_registry.clone(),
            server_config.clone(),
            queue_tx.clone(),
        ));

        let payload_config = web::PayloadConfig::default().limit(server_config.max_payload_size);
        let multipart_config =
            MultipartFormConfig::default().total_limit(server_config.max_payload_size);

        App::new()
            .app_data(web::Data::new(server_config.clone()))
            .app_data(job_service)
            .app_data(payload_config)
            .app_data(multipart_config)
            .app_data(validation::json_config())
            .configure(health_config)
            .configure(job_config)
    });

    info!("Server starting on http://{}:{}", config.host, config.port);

    let server = server.bind((config.host.as_str(), config.port))?.run();
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    let coordinator =
        ShutdownCoordinator::new(server_handle, server_task, worker_handles, shutdown_tx);

    coordinator.wait_for_shutdown().await
}
