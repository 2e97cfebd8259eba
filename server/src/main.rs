//! Gitspace Server
//!
//! Runs cloud development environments on the local Docker engine and exposes
//! their lifecycle over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod domain;
mod error;
mod infra;
mod service;

pub use config::Config;
pub use error::{Error, Result};

use infra::connector::NoopConnector;
use infra::docker::DockerEngineFactory;
use infra::event_bus::{EventBus, ReaderConfig};
use infra::event_repository::GitspaceEventRepository;
use infra::infra_repository::InfraRepository;
use infra::provisioner::DockerInfraProvisioner;
use infra::scm::GenericScm;
use infra::secret::SqliteSecretStore;
use infra::sqlite::{init_pool, GitspaceConfigRepository, GitspaceInstanceRepository};
use infra::template::ScriptTemplates;
use service::container::EmbeddedDockerOrchestrator;
use service::events::GitspaceEventHandler;
use service::feature::download::{FeatureDownloader, RegistryFetcher};
use service::gitspace::{GitspaceService, ServiceSettings};
use service::ide::IdeFactory;
use service::orchestrator::{GitspaceOrchestrator, OrchestratorSettings};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gitspace_service: Arc<GitspaceService>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::load()?);

    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    let http_addr: SocketAddr = format!("{}:{}", config.http_host, config.http_port).parse()?;
    info!("Starting Gitspace Server");
    info!("HTTP listening on {}", http_addr);

    // Storage
    let pool = init_pool(&config.database_url).await?;
    let configs = Arc::new(GitspaceConfigRepository::new(pool.clone()));
    let instances = Arc::new(GitspaceInstanceRepository::new(pool.clone()));
    let events = Arc::new(GitspaceEventRepository::new(pool.clone()));
    let infra_store = Arc::new(InfraRepository::new(pool.clone()));
    let secrets = Arc::new(SqliteSecretStore::new(pool));

    let shutdown = CancellationToken::new();
    let (bus, readers) = EventBus::new();
    let reporter = Arc::new(bus);

    // Container side
    let templates = Arc::new(ScriptTemplates::new()?);
    let engines = Arc::new(DockerEngineFactory::new(config.docker_socket.clone()));
    let features = Arc::new(FeatureDownloader::new(
        Arc::new(RegistryFetcher::new()),
        &config.feature_download_dir,
    ));
    let provisioner = Arc::new(DockerInfraProvisioner::new(
        infra_store,
        engines.clone(),
        reporter.clone(),
        config.gitspace_host.clone(),
        config.proxy_host.clone(),
        config.infra_timeout(),
    ));
    let containers = Arc::new(EmbeddedDockerOrchestrator::new(
        engines,
        templates.clone(),
        features,
        reporter.clone(),
        shutdown.child_token(),
    ));

    let orchestrator = Arc::new(GitspaceOrchestrator::new(
        Arc::new(GenericScm::new(&config.scm_work_dir)),
        Arc::new(NoopConnector),
        provisioner,
        containers,
        reporter.clone(),
        Arc::new(IdeFactory::new(templates)),
        secrets.clone(),
        instances.clone(),
        OrchestratorSettings {
            default_base_image: config.default_base_image.clone(),
            cleanup_timeout: config.cleanup_timeout(),
            cleanup_poll_interval: config.cleanup_poll_interval(),
        },
    ));

    let gitspace_service = Arc::new(GitspaceService::new(
        configs.clone(),
        instances.clone(),
        events.clone(),
        orchestrator.clone(),
        secrets,
        reporter.clone(),
        ServiceSettings {
            busy_action_timeout: config.busy_action_timeout(),
            provisioning_timeout: config.provisioning_timeout(),
        },
    ));

    // Event readers
    let handler = Arc::new(GitspaceEventHandler::new(
        configs,
        instances,
        events,
        orchestrator,
        reporter,
        gitspace_service.clone(),
    ));
    let mut reader_tasks = readers.spawn(
        handler.handlers(),
        ReaderConfig {
            concurrency: config.event_concurrency.max(1),
            idle_timeout: config.event_idle_timeout(),
            max_retries: config.event_max_retries,
        },
        shutdown.clone(),
    );

    let cleanup_job = tokio::spawn(run_cleanup_job(
        gitspace_service.clone(),
        config.cleanup_job_interval(),
        shutdown.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        gitspace_service,
    };
    let app = api::http::create_router(state);

    let result = axum::serve(
        tokio::net::TcpListener::bind(http_addr).await?,
        app.into_make_service(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;
    if let Err(e) = result {
        error!("HTTP server error: {}", e);
    }

    shutdown.cancel();
    if let Err(e) = cleanup_job.await {
        warn!("Cleanup job ended abnormally: {}", e);
    }
    while let Some(joined) = reader_tasks.join_next().await {
        if let Err(e) = joined {
            warn!("Event reader ended abnormally: {}", e);
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Periodically expire instances that stayed busy for too long
async fn run_cleanup_job(
    service: Arc<GitspaceService>,
    period: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = service.run_cleanup_job().await {
                    error!("Gitspace cleanup job failed: {}", e);
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
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

    info!("Received shutdown signal");
}
