use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use thiserror::Error;

use crate::candidates::CandidateTarget;

pub const DEFAULT_TRIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    Auth,
    Network,
    MalformedDescriptor,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    kind: BackendErrorKind,
    message: String,
}

impl BackendError {
    #[must_use]
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Auth, message)
    }

    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Network, message)
    }

    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::MalformedDescriptor, message)
    }

    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Other, message)
    }

    #[must_use]
    pub fn kind(&self) -> BackendErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[async_trait]
pub trait ConnectionBackend: Send + Sync {
    type Connection: Send + Sync + 'static;

    async fn connect(&self, descriptor: &str) -> Result<Self::Connection, BackendError>;
    async fn ping(&self, connection: &Self::Connection) -> Result<(), BackendError>;
    async fn disconnect(&self, connection: &Self::Connection) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrialError {
    #[error("connection timeout after {}ms", .deadline.as_millis())]
    Timeout { candidate: String, deadline: Duration },
    #[error("authentication failed: {cause}")]
    Auth { candidate: String, cause: String },
    #[error("network failure: {cause}")]
    Network { candidate: String, cause: String },
    #[error("malformed descriptor: {cause}")]
    MalformedDescriptor { candidate: String, cause: String },
    #[error("{cause}")]
    Other { candidate: String, cause: String },
}

impl TrialError {
    fn from_backend(candidate: &str, error: BackendError) -> Self {
        let candidate = candidate.to_string();
        let cause = error.message;
        match error.kind {
            BackendErrorKind::Auth => Self::Auth { candidate, cause },
            BackendErrorKind::Network => Self::Network { candidate, cause },
            BackendErrorKind::MalformedDescriptor => Self::MalformedDescriptor { candidate, cause },
            BackendErrorKind::Other => Self::Other { candidate, cause },
        }
    }

    #[must_use]
    pub fn candidate(&self) -> &str {
        match self {
            Self::Timeout { candidate, .. }
            | Self::Auth { candidate, .. }
            | Self::Network { candidate, .. }
            | Self::MalformedDescriptor { candidate, .. }
            | Self::Other { candidate, .. } => candidate,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialExecutor {
    deadline: Duration,
}

impl Default for TrialExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_TRIAL_TIMEOUT)
    }
}

impl TrialExecutor {
    #[must_use]
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    /// Connects and pings within the deadline. When the timer wins the
    /// attempt future is dropped, so a late connection is never observed.
    /// Backend panics are reported as failures.
    pub async fn attempt<B: ConnectionBackend>(
        &self,
        backend: &B,
        candidate: &CandidateTarget,
    ) -> Result<B::Connection, TrialError> {
        let descriptor = candidate.descriptor().expose();
        let trial = AssertUnwindSafe(async {
            let connection = backend.connect(descriptor).await?;
            if let Err(error) = backend.ping(&connection).await {
                let _ = backend.disconnect(&connection).await;
                return Err(error);
            }
            Ok::<_, BackendError>(connection)
        })
        .catch_unwind();

        match tokio::time::timeout(self.deadline, trial).await {
            Err(_) => Err(TrialError::Timeout {
                candidate: candidate.name().to_string(),
                deadline: self.deadline,
            }),
            Ok(Err(panic)) => Err(TrialError::Other {
                candidate: candidate.name().to_string(),
                cause: format!("backend panicked: {}", panic_message(panic.as_ref())),
            }),
            Ok(Ok(Err(error))) => Err(TrialError::from_backend(candidate.name(), error)),
            Ok(Ok(Ok(connection))) => Ok(connection),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
