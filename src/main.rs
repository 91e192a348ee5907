use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use acestep_api::config::{Cli, Config};
use acestep_api::model::device::{detect_accelerators, resolve_device};
use acestep_api::model::manager::ModelManager;
use acestep_api::queue::GenerationQueue;
use acestep_api::server::routes::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before reading any environment variables; existing vars win.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        "acestep_api=debug,tower_http=debug"
    } else {
        "acestep_api=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("acestep-api v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::resolve(&cli)?);

    info!(
        host = %config.host,
        port = config.port,
        auth = config.auth_enabled(),
        lm_model = %config.lm_model_path,
        lm_backend = %config.lm_backend,
        init_llm = ?config.init_llm,
        queue_maxsize = config.queue_maxsize,
        queue_workers = config.queue_workers,
        "configuration resolved"
    );

    if let Some(dir) = &config.triton_cache_dir {
        info!(dir = %dir.display(), "kernel cache directory");
    }

    // Detect hardware and bring up the models.
    let accelerators = detect_accelerators();
    for acc in &accelerators {
        info!(
            id = acc.id,
            name = %acc.name,
            total = acc.total_memory,
            free = acc.free_memory,
            "detected accelerator"
        );
    }
    let device = resolve_device(config.device, &accelerators)?;

    let manager = Arc::new(ModelManager::new(config.clone(), device));
    manager.init(&accelerators).await?;

    let queue = GenerationQueue::start(
        config.queue_maxsize,
        config.queue_workers,
        manager.clone(),
    );

    let state = AppState {
        config: config.clone(),
        manager,
        queue,
        start_time: Instant::now(),
    };

    let app = build_router(state);

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
