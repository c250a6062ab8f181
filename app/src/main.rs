mod http;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use mend_adapters::migrators::migrator_from_config;
use mend_adapters::postgres::PostgresConnectionBackend;
use mend_core::config::{default_config_path, ServiceConfig};
use mend_core::connection_manager::ConnectionManager;
use mend_core::journal::FileResolutionJournal;
use mend_core::trial::ConnectionBackend;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONSOLE_SERVER: &str = "http://127.0.0.1:3001";

#[derive(Debug, Parser)]
#[command(name = "mend", version, about = "Self-healing database connection service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the diagnostics API and resolve the database connection
    Serve(ServeArgs),
    /// Open the operator console against a running server
    Console(ConsoleArgs),
}

#[derive(Debug, Default, Args)]
struct ServeArgs {
    /// Path to config.toml (defaults to the per-user config directory)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen address, overriding config and PORT
    #[arg(long)]
    bind: Option<String>,
}

#[derive(Debug, Args)]
struct ConsoleArgs {
    #[arg(long, default_value = DEFAULT_CONSOLE_SERVER)]
    server: String,
}

fn run_app(
    cli: Cli,
    run_console: impl FnOnce(&str) -> Result<(), mend_tui::TuiError>,
) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Some(Command::Console(args)) => run_console(&args.server)?,
        Some(Command::Serve(args)) => run_server(&args)?,
        None => run_server(&ServeArgs::default())?,
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    run_app(Cli::parse(), mend_tui::run)
}

fn run_server(args: &ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args)?;
    init_tracing(&config.logging.filter);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config, args.bind.clone()))
}

fn load_config(args: &ServeArgs) -> Result<ServiceConfig, Box<dyn std::error::Error>> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let mut config = ServiceConfig::load_from_path(&path)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    Ok(config)
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_manager(
    config: &ServiceConfig,
) -> Result<ConnectionManager<PostgresConnectionBackend>, Box<dyn std::error::Error>> {
    let backend = PostgresConnectionBackend::from_config(&config.pool);
    let mut manager = ConnectionManager::new(backend)
        .with_trial_timeout(config.resolution.trial_timeout())
        .with_history_capacity(config.resolution.history_capacity);

    if let Some(path) = config.journal_path()? {
        info!(path = %path.display(), "resolution journal enabled");
        manager = manager.with_journal(FileResolutionJournal::from_path(path));
    }
    if let Some(migrator) = migrator_from_config(&config.migration) {
        info!(kind = ?config.migration.kind, "schema migration hook enabled");
        manager = manager.with_migrator(migrator);
    }
    Ok(manager)
}

async fn serve(
    config: ServiceConfig,
    bind: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = Arc::new(build_manager(&config)?);
    let addr = bind.unwrap_or_else(|| config.socket_addr());
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "diagnostics API listening");

    spawn_startup_resolution(Arc::clone(&manager));

    axum::serve(listener, http::router(manager))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

fn spawn_startup_resolution<B>(manager: Arc<ConnectionManager<B>>)
where
    B: ConnectionBackend + 'static,
{
    tokio::spawn(async move {
        let outcome = manager.resolve().await;
        match outcome.strategy {
            Some(strategy) => info!(run = outcome.run, strategy = %strategy, "startup resolution connected"),
            None => warn!(
                run = outcome.run,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "startup resolution failed; waiting for operator"
            ),
        }
    });
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
