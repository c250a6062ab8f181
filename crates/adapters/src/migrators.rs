use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use mend_core::candidates::ConnectionDescriptor;
use mend_core::config::{MigrationConfig, MigrationKind};
use mend_core::migration::{MigrationError, SchemaMigrator};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use tokio::process::Command;
use tracing::{debug, info};

const DESCRIPTOR_ENV_VAR: &str = "DATABASE_URL";
const STDERR_TAIL_CHARS: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMigrator {
    program: String,
    args: Vec<String>,
}

impl CommandMigrator {
    #[must_use]
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl SchemaMigrator for CommandMigrator {
    async fn run_schema_migration(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(), MigrationError> {
        debug!(program = %self.program, args = ?self.args, "launching migration command");
        let output = Command::new(&self.program)
            .args(&self.args)
            .env(DESCRIPTOR_ENV_VAR, descriptor.expose())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|error| {
                MigrationError::new(format!("failed to launch `{}`: {error}", self.program))
            })?;

        if output.status.success() {
            info!(
                program = %self.program,
                stdout = %String::from_utf8_lossy(&output.stdout).trim(),
                "migration command finished"
            );
            return Ok(());
        }

        Err(MigrationError::new(format!(
            "`{}` exited with {}: {}",
            self.program,
            output.status,
            stderr_tail(&output.stderr)
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlxMigrator {
    migrations_dir: PathBuf,
}

impl SqlxMigrator {
    #[must_use]
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
        }
    }
}

#[async_trait]
impl SchemaMigrator for SqlxMigrator {
    async fn run_schema_migration(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(), MigrationError> {
        let migrator = Migrator::new(self.migrations_dir.clone())
            .await
            .map_err(|error| {
                MigrationError::new(format!(
                    "failed to load migrations from {}: {error}",
                    self.migrations_dir.display()
                ))
            })?;

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(descriptor.expose())
            .await
            .map_err(|error| MigrationError::new(format!("failed to connect: {error}")))?;
        let result = migrator.run(&pool).await;
        pool.close().await;

        result.map_err(|error| MigrationError::new(error.to_string()))
    }
}

#[must_use]
pub fn migrator_from_config(config: &MigrationConfig) -> Option<Arc<dyn SchemaMigrator>> {
    match config.kind {
        MigrationKind::Disabled => None,
        MigrationKind::Command => CommandMigrator::from_command(&config.command)
            .map(|migrator| Arc::new(migrator) as Arc<dyn SchemaMigrator>),
        MigrationKind::Sqlx => Some(Arc::new(SqlxMigrator::new(config.migrations_dir.clone()))),
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let skip = trimmed.chars().count().saturating_sub(STDERR_TAIL_CHARS);
    trimmed.chars().skip(skip).collect()
}
