use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::candidates::ConnectionDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schema migration failed: {message}")]
pub struct MigrationError {
    message: String,
}

impl MigrationError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[async_trait]
pub trait SchemaMigrator: Send + Sync {
    async fn run_schema_migration(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(), MigrationError>;
}

pub fn spawn_migration(
    migrator: Arc<dyn SchemaMigrator>,
    candidate: String,
    descriptor: ConnectionDescriptor,
) -> JoinHandle<bool> {
    tokio::spawn(async move {
        info!(candidate = %candidate, "starting background schema migration");
        match migrator.run_schema_migration(&descriptor).await {
            Ok(()) => {
                info!(candidate = %candidate, "schema migration succeeded");
                true
            }
            Err(err) => {
                error!(candidate = %candidate, error = %err, "schema migration failed");
                false
            }
        }
    })
}
