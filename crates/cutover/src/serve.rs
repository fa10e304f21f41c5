//! Migration server: wires the collaborators, the engine and the HTTP routes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tracing::info;

use cutover_engine::http::{HttpCompatibilityChecker, HttpMessageProcessing, HttpProvisioningBackend};
use cutover_engine::{
    FileStore, InMemoryProvisioningBackend, MigrationConfig, MigrationService, ProvisioningBackend,
};
use cutover_web::{AppState, create_router};

/// Options of the `serve` subcommand.
pub struct ServeOptions {
    pub port: u16,
    pub data_dir: PathBuf,
    pub compatibility_url: String,
    pub provisioning_url: Option<String>,
    pub processing_url: String,
    pub poll_interval: u64,
    pub max_attempts: u32,
    pub check_timeout: u64,
}

pub async fn run(options: ServeOptions) -> Result<()> {
    let config = MigrationConfig {
        poll_interval: Duration::from_secs(options.poll_interval.max(1)),
        max_provisioning_attempts: options.max_attempts,
        check_timeout: Duration::from_secs(options.check_timeout),
        ..Default::default()
    };

    let store = FileStore::open(&options.data_dir)
        .await
        .map_err(|e| miette::miette!("failed to open store: {}", e))?;
    info!(dir = %options.data_dir.display(), "migration store opened");

    let checker = HttpCompatibilityChecker::new(&options.compatibility_url, config.check_timeout)
        .map_err(|e| miette::miette!("failed to create compatibility client: {}", e))?;
    let processing = HttpMessageProcessing::new(&options.processing_url, config.check_timeout)
        .map_err(|e| miette::miette!("failed to create processing client: {}", e))?;
    let provisioning: Arc<dyn ProvisioningBackend> = match &options.provisioning_url {
        Some(url) => Arc::new(
            HttpProvisioningBackend::new(url, config.check_timeout)
                .map_err(|e| miette::miette!("failed to create provisioning client: {}", e))?,
        ),
        None => {
            info!("no provisioning backend configured, waiting for status callbacks");
            Arc::new(InMemoryProvisioningBackend::new())
        }
    };

    let service = Arc::new(MigrationService::new(
        Arc::new(store),
        Arc::new(checker),
        provisioning,
        Arc::new(processing),
        config,
    ));
    service
        .recover()
        .await
        .map_err(|e| miette::miette!("failed to resume migrations: {}", e))?;

    let router = create_router(Arc::new(AppState::new(Arc::clone(&service))));
    let served = cutover_web::serve(router, options.port, shutdown_signal()).await;

    service.shutdown().await;
    served.map_err(|e| miette::miette!("{}", e))
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("received shutdown signal");
}
