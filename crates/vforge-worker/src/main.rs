//! Job runner binary.
//!
//! The execution engine invokes one process per job with the payload JSON
//! in the `VFORGE_JOB_PAYLOAD` environment variable.

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vforge_worker::{JobRunner, RunnerContext, WorkerConfig, WorkerError};

/// Environment variable carrying the serialized job payload.
const PAYLOAD_ENV: &str = "VFORGE_JOB_PAYLOAD";

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production.
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("vforge=info".parse().expect("valid directive"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting vforge-worker");

    let raw_payload = match std::env::var(PAYLOAD_ENV) {
        Ok(p) if !p.is_empty() => p,
        _ => {
            error!("{} not set; nothing to run", PAYLOAD_ENV);
            std::process::exit(2);
        }
    };

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    let ctx = match RunnerContext::new(config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Failed to initialize runner context: {}", e);
            std::process::exit(1);
        }
    };

    let runner = JobRunner::new(ctx);
    match runner.run(&raw_payload).await {
        Ok(()) => {
            info!("Job completed");
        }
        Err(WorkerError::Interrupted) => {
            // Non-zero exit so the engine retries the execution.
            error!("Job interrupted by shutdown");
            std::process::exit(3);
        }
        Err(e) => {
            error!("Job failed: {}", e);
            std::process::exit(1);
        }
    }
}
