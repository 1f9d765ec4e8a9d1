//! fedflowd - party scheduler daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fedflow::backends::{MemoryBackend, PostgresBackend, StateBackend};
use fedflow::components::{ComponentMeta, ComponentRegistry, NoopRunner};
use fedflow::config::{BackendKind, Config};
use fedflow::controller::PartyController;
use fedflow::federation::FederatedCoordinator;
use fedflow::resources::ResourceManager;
use fedflow::scheduler::{spawn_scheduler, JobScheduler};
use fedflow::server::{router, AppState};
use fedflow::transport::{HttpTransport, PartyTransport};

#[derive(Parser)]
#[command(name = "fedflowd", about = "Federated multi-party DAG job scheduler")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the HTTP surface and the scheduling loop.
    Serve,
    /// Apply database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        CliCommand::Migrate => migrate(&config).await,
        CliCommand::Serve => serve(config).await,
    }
}

async fn migrate(config: &Config) -> Result<()> {
    let url = config
        .database_url
        .as_deref()
        .context("migrate requires FEDFLOW_DATABASE_URL")?;
    let backend = PostgresBackend::connect(url).await?;
    backend.migrate().await?;
    info!("migrations applied");
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let backend: Arc<dyn StateBackend> = match config.backend {
        BackendKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("FEDFLOW_DATABASE_URL must be set")?;
            let backend = PostgresBackend::connect(url).await?;
            backend.migrate().await?;
            Arc::new(backend)
        }
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
    };
    backend
        .register_engine(
            &config.engine_type,
            &config.engine_name,
            config.total_cores,
            config.total_memory,
        )
        .await?;
    info!(
        engine_type = %config.engine_type,
        engine_name = %config.engine_name,
        cores = config.total_cores,
        memory = config.total_memory,
        "engine registered"
    );

    // Components with real execution engines register here; the built-in
    // passthrough covers wiring checks and engine-external components.
    let mut registry = ComponentRegistry::new();
    registry.register(
        ComponentMeta {
            name: "passthrough".into(),
            supported_roles: vec![
                "guest".into(),
                "host".into(),
                "arbiter".into(),
                "local".into(),
            ],
            input_artifacts: vec![],
            output_artifacts: vec!["output_data".into()],
        },
        Arc::new(NoopRunner),
    );
    let registry = Arc::new(registry);

    let transport: Arc<dyn PartyTransport> = Arc::new(HttpTransport::new(
        config.routes.clone(),
        config.federated_timeout,
    )?);
    let coordinator = Arc::new(FederatedCoordinator::new(
        transport.clone(),
        config.federated_concurrent,
    ));
    let resources = Arc::new(ResourceManager::new(
        backend.clone(),
        config.resource_settings(),
    ));
    let controller = Arc::new(PartyController::new(
        config.party_id.clone(),
        backend.clone(),
        registry.clone(),
        resources,
        transport,
    ));
    let scheduler = Arc::new(JobScheduler::new(
        config.party_id.clone(),
        backend.clone(),
        coordinator,
        registry,
        config.scheduler_config(),
    ));

    let loop_handle = spawn_scheduler(scheduler.clone());

    let app = router(AppState {
        controller,
        scheduler,
        backend,
    });
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(party_id = %config.party_id, addr = %config.bind_addr, "fedflowd listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    loop_handle.shutdown().await;
    Ok(())
}
