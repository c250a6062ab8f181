use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use mend_core::config::PoolConfig;
use mend_core::trial::{BackendError, ConnectionBackend};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

const AUTH_FAILURE_CODES: [&str; 2] = ["28P01", "28000"];

#[derive(Debug, Clone)]
pub struct PostgresConnectionBackend {
    max_connections: u32,
    acquire_timeout: Duration,
}

impl Default for PostgresConnectionBackend {
    fn default() -> Self {
        Self::from_config(&PoolConfig::default())
    }
}

impl PostgresConnectionBackend {
    #[must_use]
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            max_connections: config.max_connections.max(1),
            acquire_timeout: config.acquire_timeout(),
        }
    }
}

#[async_trait]
impl ConnectionBackend for PostgresConnectionBackend {
    type Connection = PgPool;

    async fn connect(&self, descriptor: &str) -> Result<Self::Connection, BackendError> {
        let options = PgConnectOptions::from_str(descriptor).map_err(to_connection_error)?;
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(to_connection_error)
    }

    async fn ping(&self, connection: &Self::Connection) -> Result<(), BackendError> {
        sqlx::query("SELECT 1")
            .execute(connection)
            .await
            .map(|_| ())
            .map_err(to_connection_error)
    }

    // Waits for checked-out connections to come back before closing them.
    async fn disconnect(&self, connection: &Self::Connection) -> Result<(), BackendError> {
        connection.close().await;
        Ok(())
    }
}

fn to_connection_error(error: sqlx::Error) -> BackendError {
    match &error {
        sqlx::Error::Configuration(_) => BackendError::malformed(error.to_string()),
        sqlx::Error::Database(database_error)
            if database_error
                .code()
                .is_some_and(|code| AUTH_FAILURE_CODES.iter().any(|auth| *auth == code)) =>
        {
            BackendError::auth(error.to_string())
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => BackendError::network(error.to_string()),
        _ => BackendError::other(error.to_string()),
    }
}
