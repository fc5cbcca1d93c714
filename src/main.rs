use clap::Parser;
use fleet_dataplane::batch::types::BatchConfig;
use fleet_dataplane::carves::manager::CarveManager;
use fleet_dataplane::carves::reaper::spawn_reaper;
use fleet_dataplane::carves::s3::{ObjectStore, S3Client, S3Config};
use fleet_dataplane::config::{CarverKind, Config};
use fleet_dataplane::fleet::{router, spawn_maintenance, Fleet, SeedFile};
use fleet_dataplane::logging::sink::build_sink;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting fleet data-plane on {}", config.bind);

    // 1. Carve storage:
    let objects = match config.carver {
        CarverKind::S3 => Some(s3_client(&config)?),
        CarverKind::Db | CarverKind::Local => None,
    };
    let carves = CarveManager::new(config.carver, &config.carves_dir, objects)?;
    tracing::info!(
        "Carver: {:?} (archives in {})",
        config.carver,
        config.carves_dir.display()
    );

    // 2. Shared context:
    let sink = build_sink(config.logger);
    tracing::info!("Log sink: {}", sink.name());
    let fleet = Fleet::new(
        carves,
        sink,
        config.settings(),
        BatchConfig {
            batch_size: config.batch_size,
            timeout: config.batch_timeout(),
            buffer: config.batch_buffer,
        },
    );

    if let Some(path) = &config.seed_file {
        fleet.seed(SeedFile::load(path)?)?;
    }

    // 3. Background loops:
    spawn_reaper(fleet.carves.clone(), config.carve_ttl(), config.reaper_interval());
    spawn_maintenance(
        fleet.queries.clone(),
        fleet.environments.clone(),
        config.reaper_interval(),
    );

    // 4. HTTP server:
    let app = router(fleet.clone());
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!("HTTP server listening on {}", config.bind);
    tracing::info!("Press Ctrl+C to shutdown");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
    })
    .await?;

    tracing::info!("Shutting down, flushing pending writes");
    fleet.shutdown().await;
    Ok(())
}

fn s3_client(config: &Config) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let bucket = config
        .s3_bucket
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--s3-bucket is required for the s3 carver"))?;
    let client = S3Client::new(S3Config {
        bucket,
        region: config.s3_region.clone(),
        endpoint: config.s3_endpoint.clone(),
        access_key: config.s3_access_key.clone().unwrap_or_default(),
        secret_key: config.s3_secret_key.clone().unwrap_or_default(),
    })?;
    Ok(Arc::new(client))
}
