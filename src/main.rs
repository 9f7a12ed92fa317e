//! pg-toolkit - connectivity and pool health utility.
//!
//! Builds a pool from the command line / environment and runs one command
//! against it: `ping`, `health` or `status` (the default).

use pg_toolkit::config::{Command, Config};
use pg_toolkit::db::driver::Connector;
use pg_toolkit::db::{ConnectionPool, PgConnector, retry_with_backoff};
use pg_toolkit::error::DbError;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

async fn run(config: &Config) -> Result<(), DbError> {
    let (db, pool_config) = config.resolve().map_err(DbError::configuration)?;
    let connector = PgConnector::from_config(&db)?;

    match config.command.unwrap_or(Command::Status) {
        Command::Ping => {
            info!(target_db = %connector.describe(), "Probing database");
            let target = &connector;
            retry_with_backoff(&pool_config.retry, "connectivity probe", move || target.probe())
                .await?;
            println!("ok");
        }
        Command::Health => {
            let pool = ConnectionPool::new(connector, pool_config)?;
            pool.initialize().await?;
            let healthy = pool.health_check().await;
            pool.shutdown().await;
            if !healthy {
                return Err(DbError::connection(
                    "Health check failed",
                    "Check the server logs and network path to the database",
                ));
            }
            println!("healthy");
        }
        Command::Status => {
            let pool = ConnectionPool::new(connector, pool_config)?;
            pool.initialize().await?;
            let status = pool.status();
            pool.shutdown().await;
            let rendered = serde_json::to_string_pretty(&status)
                .map_err(|e| DbError::internal(format!("render status: {e}")))?;
            println!("{rendered}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    init_tracing(&config);

    info!("Starting pg-toolkit v{}", env!("CARGO_PKG_VERSION"));

    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            if let Some(suggestion) = e.suggestion() {
                warn!(suggestion, "Hint");
            }
            eprintln!("Error: {e}");
            match e {
                DbError::Configuration { .. } | DbError::InvalidInput { .. } => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
