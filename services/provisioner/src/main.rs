//! pgfleet
//!
//! Provisions tenant Postgres databases on shared cluster pools or dedicated
//! clusters, and moves tenants between them on plan upgrades.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pgfleet_id::{ClusterId, ProjectId};
use pgfleet_provisioner::{
    config::Config,
    db::Database,
    migration::{DataMigrator, MigrationConfig, NoopMigrator, PgDumpRestore},
    orchestrator::{Orchestrator, OrchestratorConfig},
    plans::PlanCatalog,
    provider::{CloudProvider, MockProvider, TimewebClient},
    store::{MemoryStore, Store},
    workers::{ReconcileWorker, ReconcileWorkerConfig},
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pgfleet", version, about = "Pooled and dedicated Postgres provisioning")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the reconcile worker until interrupted.
    Serve,

    /// Apply database migrations.
    Migrate,

    #[command(flatten)]
    Project(ProjectCommand),
}

#[derive(Debug, Subcommand)]
enum ProjectCommand {
    /// Register a new project.
    CreateProject {
        slug: String,
        #[arg(long, default_value = "ru-msk")]
        region: String,
        #[arg(long, default_value = "free")]
        plan: String,
    },

    /// Provision a project's database.
    Provision {
        project: ProjectId,
        #[arg(long)]
        plan: String,
    },

    /// Show and advance a project's provisioning status.
    Status { project: ProjectId },

    /// Move a project to a higher plan.
    Upgrade {
        project: ProjectId,
        #[arg(long)]
        plan: String,
    },

    /// Release a project's database.
    Deprovision { project: ProjectId },

    /// Stop placing databases on a shared cluster and delete it once empty.
    DrainCluster { cluster: ClusterId },

    /// List the plan catalogue.
    Plans,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to PGFLEET_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    match cli.command {
        Command::Migrate => {
            let db = Database::connect(&config.database).await?;
            db.run_migrations().await?;
            info!("Migrations applied");
            Ok(())
        }
        Command::Serve => {
            let orchestrator = Arc::new(build_orchestrator(&config).await?);
            serve(orchestrator, &config).await
        }
        Command::Project(command) => {
            let orchestrator = build_orchestrator(&config).await?;
            run(&orchestrator, command).await
        }
    }
}

async fn run(orchestrator: &Orchestrator, command: ProjectCommand) -> Result<()> {
    match command {
        ProjectCommand::CreateProject { slug, region, plan } => {
            print_json(&orchestrator.create_project(&slug, &region, &plan).await?)?
        }
        ProjectCommand::Provision { project, plan } => {
            print_json(&orchestrator.provision_for_plan(project, &plan).await?)?
        }
        ProjectCommand::Status { project } => {
            print_json(&orchestrator.check_provision_status(project).await?)?
        }
        ProjectCommand::Upgrade { project, plan } => {
            print_json(&orchestrator.upgrade_plan(project, &plan).await?)?
        }
        ProjectCommand::Deprovision { project } => {
            print_json(&orchestrator.deprovision(project).await?)?
        }
        ProjectCommand::DrainCluster { cluster } => {
            let outcome = orchestrator.drain_cluster(cluster).await?;
            println!("{outcome:?}");
        }
        ProjectCommand::Plans => print_json(&orchestrator.list_plans())?,
    }

    Ok(())
}

async fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let catalog = match &config.plans_file {
        Some(path) => PlanCatalog::load(path)?,
        None => PlanCatalog::default(),
    };

    let migration = MigrationConfig::default();

    let (store, provider, migrator): (Arc<dyn Store>, Arc<dyn CloudProvider>, Arc<dyn DataMigrator>) =
        if config.dev_mode {
            warn!("Dev mode: in-memory store and mock provider");
            (
                Arc::new(MemoryStore::new()),
                Arc::new(MockProvider::new()),
                Arc::new(NoopMigrator),
            )
        } else {
            let db = match Database::connect(&config.database).await {
                Ok(db) => {
                    info!("Database connection established");
                    db
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };
            let provider_config = config
                .provider
                .as_ref()
                .context("TIMEWEB_API_TOKEN is required unless PGFLEET_DEV is set")?;
            (
                Arc::new(db.store()),
                Arc::new(TimewebClient::new(provider_config)?),
                Arc::new(PgDumpRestore::new(migration.copy_timeout)),
            )
        };

    Ok(Orchestrator::new(
        store,
        provider,
        Arc::new(catalog),
        migrator,
        OrchestratorConfig {
            migration,
            ..OrchestratorConfig::default()
        },
    ))
}

async fn serve(orchestrator: Arc<Orchestrator>, config: &Config) -> Result<()> {
    info!(
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        dev_mode = config.dev_mode,
        "Starting pgfleet"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = ReconcileWorker::new(
        orchestrator,
        ReconcileWorkerConfig {
            interval: config.reconcile_interval,
            ..ReconcileWorkerConfig::default()
        },
    );
    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Reconcile worker did not shut down in time");
    }

    info!("pgfleet shutdown complete");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
