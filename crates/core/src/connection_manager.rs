use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::attempt_history::{AttemptHistory, TrialOutcome, TrialRecord};
use crate::candidates::{
    candidate_names, generate_candidates, CandidateTarget, InputSource, ProcessEnv,
};
use crate::diagnostics::{Diagnostics, ResolutionOutcome, ResolutionState, StatusReport};
use crate::journal::{FileResolutionJournal, JournalEvent, JournalRecord};
use crate::migration::{spawn_migration, SchemaMigrator};
use crate::override_store::ManualOverrideStore;
use crate::trial::{ConnectionBackend, TrialError, TrialExecutor};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error(
        "no candidates: set DATABASE_PRIVATE_URL, PGUSER/PGHOST/PGDATABASE, DATABASE_URL \
         or a manual override"
    )]
    CandidateGenerationEmpty,
    #[error("All connection attempts failed; last: {candidate} failed: {cause}")]
    Exhausted { candidate: String, cause: String },
}

impl ResolutionError {
    fn exhausted(last: &TrialError) -> Self {
        Self::Exhausted {
            candidate: last.candidate().to_string(),
            cause: last.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("not connected: no database connection has been resolved")]
    NotConnected,
}

#[derive(Debug)]
pub struct DataHandle<C> {
    connection: Option<C>,
    candidate_name: Option<String>,
    run: u64,
}

impl<C> DataHandle<C> {
    fn unresolved() -> Self {
        Self {
            connection: None,
            candidate_name: None,
            run: 0,
        }
    }

    fn resolved(connection: C, candidate_name: &str, run: u64) -> Self {
        Self {
            connection: Some(connection),
            candidate_name: Some(candidate_name.to_string()),
            run,
        }
    }

    pub fn connection(&self) -> Result<&C, HandleError> {
        self.connection.as_ref().ok_or(HandleError::NotConnected)
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.connection.is_some()
    }

    #[must_use]
    pub fn candidate_name(&self) -> Option<&str> {
        self.candidate_name.as_deref()
    }

    #[must_use]
    pub fn run(&self) -> u64 {
        self.run
    }
}

struct ResolvingFlag<'a>(&'a AtomicBool);

impl<'a> ResolvingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ResolvingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ConnectionManager<B: ConnectionBackend> {
    backend: Arc<B>,
    executor: TrialExecutor,
    inputs: Box<dyn InputSource>,
    overrides: ManualOverrideStore,
    active: ArcSwap<DataHandle<B::Connection>>,
    state: ArcSwap<ResolutionState>,
    history: Mutex<AttemptHistory>,
    journal: Option<FileResolutionJournal>,
    migrator: Option<Arc<dyn SchemaMigrator>>,
    run_lock: AsyncMutex<()>,
    resolving: AtomicBool,
    runs: AtomicU64,
}

impl<B: ConnectionBackend + 'static> ConnectionManager<B> {
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            executor: TrialExecutor::default(),
            inputs: Box::new(ProcessEnv),
            overrides: ManualOverrideStore::new(),
            active: ArcSwap::from_pointee(DataHandle::unresolved()),
            state: ArcSwap::from_pointee(ResolutionState::default()),
            history: Mutex::new(AttemptHistory::default()),
            journal: None,
            migrator: None,
            run_lock: AsyncMutex::new(()),
            resolving: AtomicBool::new(false),
            runs: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_inputs(mut self, inputs: impl InputSource + 'static) -> Self {
        self.inputs = Box::new(inputs);
        self
    }

    #[must_use]
    pub fn with_trial_timeout(mut self, deadline: Duration) -> Self {
        self.executor = TrialExecutor::new(deadline);
        self
    }

    #[must_use]
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history = Mutex::new(AttemptHistory::new(capacity));
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: FileResolutionJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    #[must_use]
    pub fn with_migrator(mut self, migrator: Arc<dyn SchemaMigrator>) -> Self {
        self.migrator = Some(migrator);
        self
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        self.backend.as_ref()
    }

    #[must_use]
    pub fn overrides(&self) -> &ManualOverrideStore {
        &self.overrides
    }

    /// Always returns a handle; its `connection()` fails with
    /// [`HandleError::NotConnected`] until a run has succeeded.
    #[must_use]
    pub fn active_handle(&self) -> Arc<DataHandle<B::Connection>> {
        self.active.load_full()
    }

    #[must_use]
    pub fn state(&self) -> ResolutionState {
        self.state.load().as_ref().clone()
    }

    #[must_use]
    pub fn candidates(&self) -> Vec<CandidateTarget> {
        let manual = self.overrides.get();
        generate_candidates(manual.as_deref(), &self.inputs.load())
    }

    #[must_use]
    pub fn diagnostics(&self) -> Diagnostics {
        let state = self.state.load_full();
        let recent_attempts = {
            let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.recent(history.capacity())
        };

        Diagnostics {
            connected: state.connected,
            strategy: state.active_candidate_name.clone(),
            error: state.last_error.clone(),
            manual_override_set: self.overrides.is_set(),
            candidate_names: candidate_names(&self.candidates()),
            resolving: self.resolving.load(Ordering::SeqCst),
            runs: state.run,
            recent_attempts,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusReport {
        let state = self.state.load();
        StatusReport {
            is_db_connected: state.connected,
            db_error: state.last_error.clone(),
        }
    }

    pub async fn apply_override(&self, descriptor: impl Into<String>) -> ResolutionOutcome {
        info!("manual connection override received");
        self.overrides.set(descriptor);
        self.resolve().await
    }

    pub async fn resolve(&self) -> ResolutionOutcome {
        let _queued = self.run_lock.lock().await;
        let _resolving = ResolvingFlag::raise(&self.resolving);
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        self.run_resolution(run).await
    }

    async fn run_resolution(&self, run: u64) -> ResolutionOutcome {
        let candidates = self.candidates();
        info!(
            run,
            candidates = candidates.len(),
            "starting connection resolution"
        );
        self.write_journal(JournalRecord::now(run, JournalEvent::RunStarted));

        if candidates.is_empty() {
            warn!(run, "no connection candidates available");
            let error = ResolutionError::CandidateGenerationEmpty.to_string();
            self.publish_failure(run, &error);
            self.write_journal(JournalRecord::now(run, JournalEvent::NoCandidates).with_error(&error));
            return ResolutionOutcome::failed(run, error, Vec::new());
        }

        let mut attempted = Vec::with_capacity(candidates.len());
        let mut last_failure = None;
        for candidate in &candidates {
            let name = candidate.name();
            attempted.push(name.to_string());
            debug!(run, candidate = name, "trying connection candidate");

            let started_at = Instant::now();
            match self.executor.attempt(self.backend.as_ref(), candidate).await {
                Ok(connection) => {
                    let elapsed_ms = millis(started_at.elapsed());
                    self.record_trial(run, name, TrialOutcome::Succeeded, elapsed_ms, None);
                    self.install(run, candidate, connection, elapsed_ms);
                    return ResolutionOutcome::connected(run, name, attempted);
                }
                Err(error) => {
                    let elapsed_ms = millis(started_at.elapsed());
                    let outcome = if error.is_timeout() {
                        TrialOutcome::TimedOut
                    } else {
                        TrialOutcome::Failed
                    };
                    warn!(run, candidate = name, error = %error, "connection candidate failed");
                    self.record_trial(run, name, outcome, elapsed_ms, Some(error.to_string()));
                    last_failure = Some(error);
                }
            }
        }

        let summary = match &last_failure {
            Some(error) => ResolutionError::exhausted(error),
            None => ResolutionError::CandidateGenerationEmpty,
        }
        .to_string();
        warn!(run, attempted = attempted.len(), "all connection candidates failed");
        self.publish_failure(run, &summary);
        self.write_journal(JournalRecord::now(run, JournalEvent::RunExhausted).with_error(&summary));
        ResolutionOutcome::failed(run, summary, attempted)
    }

    fn install(
        &self,
        run: u64,
        candidate: &CandidateTarget,
        connection: B::Connection,
        elapsed_ms: u64,
    ) {
        let name = candidate.name();
        let previous = self
            .active
            .swap(Arc::new(DataHandle::resolved(connection, name, run)));
        self.state.store(Arc::new(ResolutionState {
            connected: true,
            active_candidate_name: Some(name.to_string()),
            last_error: None,
            run,
        }));
        info!(run, candidate = name, elapsed_ms, "connected");

        if let Some(migrator) = &self.migrator {
            drop(spawn_migration(
                Arc::clone(migrator),
                name.to_string(),
                candidate.descriptor().clone(),
            ));
        }

        self.release_superseded(run, previous);
    }

    // Closing a pool waits for checked-out connections, so it runs off the
    // resolution path and never holds the run lock.
    fn release_superseded(&self, run: u64, previous: Arc<DataHandle<B::Connection>>) {
        if !previous.is_resolved() {
            return;
        }
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            let Ok(stale) = previous.connection() else {
                return;
            };
            match backend.disconnect(stale).await {
                Ok(()) => debug!(
                    run,
                    candidate = previous.candidate_name().unwrap_or("unknown"),
                    "released superseded connection"
                ),
                Err(error) => warn!(
                    run,
                    candidate = previous.candidate_name().unwrap_or("unknown"),
                    error = %error,
                    "failed to release superseded connection"
                ),
            }
        });
    }

    // The installed handle is left alone: a still-working connection keeps
    // serving while the state reports disconnected.
    fn publish_failure(&self, run: u64, error: &str) {
        let previous = self.state.load_full();
        self.state.store(Arc::new(ResolutionState {
            connected: false,
            active_candidate_name: previous.active_candidate_name.clone(),
            last_error: Some(error.to_string()),
            run,
        }));
    }

    fn record_trial(
        &self,
        run: u64,
        candidate: &str,
        outcome: TrialOutcome,
        elapsed_ms: u64,
        error: Option<String>,
    ) {
        let event = if outcome == TrialOutcome::Succeeded {
            JournalEvent::TrialSucceeded
        } else {
            JournalEvent::TrialFailed
        };
        let mut entry = JournalRecord::now(run, event)
            .with_candidate(candidate)
            .with_elapsed_ms(elapsed_ms);
        if let Some(error) = &error {
            entry = entry.with_error(error);
        }
        self.write_journal(entry);

        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(TrialRecord {
                run,
                candidate: candidate.to_string(),
                outcome,
                elapsed_ms,
                error,
            });
    }

    fn write_journal(&self, record: JournalRecord) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(error) = journal.append(&record) {
            warn!(path = %journal.path().display(), error = %error, "failed to append resolution journal");
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use super::{ConnectionManager, HandleError, ResolutionError};
    use crate::attempt_history::TrialOutcome;
    use crate::candidates::{ConnectionDescriptor, DiscreteParts, EnvInputs, InputSource};
    use crate::journal::{FileResolutionJournal, JournalEvent, JournalRecord};
    use crate::migration::{MigrationError, SchemaMigrator};
    use crate::trial::{BackendError, ConnectionBackend};

    #[derive(Debug, Clone)]
    enum Rule {
        Succeed,
        Fail(BackendError),
        Delay(Duration),
        Hang,
        Panic,
    }

    #[derive(Debug, Default)]
    struct FakeBackend {
        rules: Vec<(&'static str, Rule)>,
        connects: Mutex<Vec<String>>,
        disconnects: Mutex<Vec<String>>,
        late_connects: AtomicUsize,
        slow_release: bool,
    }

    impl FakeBackend {
        fn with_rules(rules: Vec<(&'static str, Rule)>) -> Self {
            Self {
                rules,
                ..Self::default()
            }
        }

        fn connects(&self) -> Vec<String> {
            self.connects.lock().expect("connects lock").clone()
        }

        fn disconnects(&self) -> Vec<String> {
            self.disconnects.lock().expect("disconnects lock").clone()
        }
    }

    #[async_trait::async_trait]
    impl ConnectionBackend for FakeBackend {
        type Connection = String;

        async fn connect(&self, descriptor: &str) -> Result<Self::Connection, BackendError> {
            self.connects
                .lock()
                .expect("connects lock")
                .push(descriptor.to_string());
            let rule = self
                .rules
                .iter()
                .find(|(pattern, _)| descriptor.contains(pattern))
                .map_or(
                    Rule::Fail(BackendError::network("connection refused")),
                    |(_, rule)| rule.clone(),
                );

            match rule {
                Rule::Succeed => Ok(descriptor.to_string()),
                Rule::Fail(error) => Err(error),
                Rule::Delay(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(descriptor.to_string())
                }
                Rule::Hang => {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    self.late_connects.fetch_add(1, Ordering::SeqCst);
                    Ok(descriptor.to_string())
                }
                Rule::Panic => panic!("driver bug while connecting"),
            }
        }

        async fn ping(&self, _connection: &Self::Connection) -> Result<(), BackendError> {
            Ok(())
        }

        async fn disconnect(&self, connection: &Self::Connection) -> Result<(), BackendError> {
            if self.slow_release {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }
            self.disconnects
                .lock()
                .expect("disconnects lock")
                .push(connection.clone());
            Ok(())
        }
    }

    struct ChannelMigrator {
        result: Result<(), MigrationError>,
        seen: mpsc::UnboundedSender<String>,
    }

    #[async_trait::async_trait]
    impl SchemaMigrator for ChannelMigrator {
        async fn run_schema_migration(
            &self,
            descriptor: &ConnectionDescriptor,
        ) -> Result<(), MigrationError> {
            let _ = self.seen.send(descriptor.expose().to_string());
            self.result.clone()
        }
    }

    struct SharedInputs(Arc<Mutex<EnvInputs>>);

    impl InputSource for SharedInputs {
        fn load(&self) -> EnvInputs {
            self.0.lock().expect("inputs lock").clone()
        }
    }

    async fn wait_for_disconnects(backend: &FakeBackend, count: usize) -> Vec<String> {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let released = backend.disconnects();
                if released.len() >= count {
                    return released;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("superseded handle should be released")
    }

    fn public(url: &str) -> EnvInputs {
        EnvInputs {
            public_url: Some(url.to_string()),
            ..EnvInputs::default()
        }
    }

    #[tokio::test]
    async fn empty_inputs_report_no_candidates_without_touching_handle() {
        let manager = ConnectionManager::new(FakeBackend::default()).with_inputs(EnvInputs::default());

        let outcome = manager.resolve().await;
        assert!(!outcome.connected);
        assert!(outcome
            .error
            .as_deref()
            .is_some_and(|error| error.contains("no candidates")));
        assert!(manager.backend().connects().is_empty());

        let state = manager.state();
        assert!(!state.connected);
        assert_eq!(
            state.last_error,
            Some(ResolutionError::CandidateGenerationEmpty.to_string())
        );

        let handle = manager.active_handle();
        assert!(!handle.is_resolved());
        assert_eq!(handle.connection(), Err(HandleError::NotConnected));
    }

    #[tokio::test]
    async fn handle_is_usable_before_any_resolution() {
        let manager = ConnectionManager::new(FakeBackend::default()).with_inputs(EnvInputs::default());

        let state = manager.state();
        assert_eq!(state.last_error.as_deref(), Some("Initializing"));
        assert!(matches!(
            manager.active_handle().connection(),
            Err(HandleError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn first_success_short_circuits_remaining_candidates() {
        let backend = FakeBackend::with_rules(vec![("sslmode=prefer", Rule::Succeed)]);
        let manager = ConnectionManager::new(backend).with_inputs(public("postgresql://app@db/chat"));

        let outcome = manager.resolve().await;
        assert!(outcome.connected);
        assert_eq!(outcome.strategy.as_deref(), Some("PUBLIC_ENV_SSL_PREFER"));
        assert_eq!(
            outcome.attempted,
            vec!["PUBLIC_ENV_RAW", "PUBLIC_ENV_SSL_PREFER"]
        );
        assert_eq!(manager.backend().connects().len(), 2);
        assert!(manager
            .backend()
            .connects()
            .iter()
            .all(|descriptor| !descriptor.contains("sslmode=require")));
    }

    #[tokio::test]
    async fn constructed_candidate_with_encoded_password_connects_on_tls_prefer() {
        let inputs = EnvInputs {
            parts: DiscreteParts {
                user: Some("app".to_string()),
                password: Some("p@ss#1".to_string()),
                host: Some("db.internal".to_string()),
                port: None,
                database: Some("chat".to_string()),
            },
            ..EnvInputs::default()
        };
        let backend = FakeBackend::with_rules(vec![
            ("sslmode=prefer", Rule::Succeed),
            ("p%40ss%231", Rule::Fail(BackendError::network("connection refused"))),
        ]);
        let manager = ConnectionManager::new(backend).with_inputs(inputs);

        let diagnostics = manager.diagnostics();
        assert_eq!(diagnostics.candidate_names.len(), 3);
        assert!(diagnostics
            .candidate_names
            .iter()
            .all(|name| name.starts_with("CONSTRUCTED_PRIVATE_")));

        let outcome = manager.resolve().await;
        assert!(outcome.connected);
        assert_eq!(
            outcome.strategy.as_deref(),
            Some("CONSTRUCTED_PRIVATE_SSL_PREFER")
        );
        assert!(outcome.error.is_none());
        assert!(manager
            .backend()
            .connects()
            .iter()
            .all(|descriptor| descriptor.contains("app:p%40ss%231@db.internal:5432/chat")));

        let diagnostics = manager.diagnostics();
        assert!(diagnostics.connected);
        assert_eq!(
            diagnostics.strategy.as_deref(),
            Some("CONSTRUCTED_PRIVATE_SSL_PREFER")
        );
        assert!(diagnostics.error.is_none());
        assert_eq!(diagnostics.recent_attempts.len(), 2);
        assert_eq!(diagnostics.recent_attempts[0].outcome, TrialOutcome::Failed);
        assert_eq!(diagnostics.recent_attempts[1].outcome, TrialOutcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_override_times_out_as_single_candidate() {
        let backend = FakeBackend::with_rules(vec![("unreachable", Rule::Hang)]);
        let manager = ConnectionManager::new(backend)
            .with_inputs(EnvInputs::default())
            .with_trial_timeout(Duration::from_secs(5));

        let outcome = manager
            .apply_override("postgresql://app@unreachable:5432/chat")
            .await;
        assert!(!outcome.connected);
        assert_eq!(outcome.attempted, vec!["MANUAL_OVERRIDE"]);
        assert!(outcome
            .error
            .as_deref()
            .is_some_and(|error| error.contains("MANUAL_OVERRIDE failed: connection timeout")));

        let diagnostics = manager.diagnostics();
        assert!(!diagnostics.connected);
        assert!(diagnostics.manual_override_set);
        assert_eq!(diagnostics.candidate_names, vec!["MANUAL_OVERRIDE"]);
        assert_eq!(diagnostics.recent_attempts[0].outcome, TrialOutcome::TimedOut);
    }

    #[tokio::test]
    async fn failed_reresolution_reports_disconnected_but_keeps_old_handle() {
        let inputs = Arc::new(Mutex::new(public("postgresql://good/db")));
        let backend = FakeBackend::with_rules(vec![("good", Rule::Succeed)]);
        let manager =
            ConnectionManager::new(backend).with_inputs(SharedInputs(Arc::clone(&inputs)));

        assert!(manager.resolve().await.connected);
        let first = manager.active_handle();
        assert_eq!(first.candidate_name(), Some("PUBLIC_ENV_RAW"));

        *inputs.lock().expect("inputs lock") = EnvInputs::default();
        let outcome = manager.apply_override("postgresql://bad/db").await;
        assert!(!outcome.connected);
        assert_eq!(outcome.attempted, vec!["MANUAL_OVERRIDE"]);

        let state = manager.state();
        assert!(!state.connected);
        assert!(state
            .last_error
            .as_deref()
            .is_some_and(|error| error.contains("MANUAL_OVERRIDE failed")));
        assert_eq!(state.active_candidate_name.as_deref(), Some("PUBLIC_ENV_RAW"));

        let still_installed = manager.active_handle();
        assert_eq!(
            still_installed.connection().map(String::as_str),
            Ok("postgresql://good/db")
        );
        assert!(manager.backend().disconnects().is_empty());
    }

    #[tokio::test]
    async fn successful_reresolution_releases_previous_handle_after_swap() {
        let backend = FakeBackend::with_rules(vec![("first", Rule::Succeed), ("second", Rule::Succeed)]);
        let manager = ConnectionManager::new(backend).with_inputs(public("postgresql://first/db"));

        manager.resolve().await;
        let old = manager.active_handle();

        let outcome = manager.apply_override("postgresql://second/db").await;
        assert!(outcome.connected);
        assert_eq!(outcome.strategy.as_deref(), Some("MANUAL_OVERRIDE"));

        let current = manager.active_handle();
        assert_eq!(current.connection().map(String::as_str), Ok("postgresql://second/db"));
        assert_eq!(current.run(), 2);
        assert_eq!(
            wait_for_disconnects(manager.backend(), 1).await,
            vec!["postgresql://first/db"]
        );
        // Readers that loaded the old handle still hold a valid reference.
        assert_eq!(old.connection().map(String::as_str), Ok("postgresql://first/db"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_runs_install_handles_in_completion_order() {
        let inputs = Arc::new(Mutex::new(public("postgresql://slow/db")));
        let backend = FakeBackend::with_rules(vec![
            ("slow", Rule::Delay(Duration::from_millis(300))),
            ("fast", Rule::Succeed),
        ]);
        let manager = Arc::new(
            ConnectionManager::new(backend).with_inputs(SharedInputs(Arc::clone(&inputs))),
        );

        let first = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.resolve().await }
        });
        while manager.backend().connects().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mid_run = manager.diagnostics();
        assert!(mid_run.resolving);
        assert!(!mid_run.connected);
        assert_eq!(mid_run.error.as_deref(), Some("Initializing"));

        *inputs.lock().expect("inputs lock") = public("postgresql://fast/db");
        let second = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.resolve().await }
        });

        let first = first.await.expect("first run should join");
        let second = second.await.expect("second run should join");
        assert_eq!(first.run, 1);
        assert_eq!(second.run, 2);

        let handle = manager.active_handle();
        assert_eq!(handle.run(), 2);
        assert_eq!(handle.connection().map(String::as_str), Ok("postgresql://fast/db"));
        assert_eq!(
            wait_for_disconnects(manager.backend(), 1).await,
            vec!["postgresql://slow/db"]
        );
        assert!(!manager.diagnostics().resolving);
    }

    #[tokio::test]
    async fn migration_runs_in_background_with_winning_descriptor() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let migrator = ChannelMigrator {
            result: Err(MigrationError::new("prisma exited with status 1")),
            seen: seen_tx,
        };
        let backend = FakeBackend::with_rules(vec![("db", Rule::Succeed)]);
        let manager = ConnectionManager::new(backend)
            .with_inputs(public("postgresql://app@db/chat"))
            .with_migrator(Arc::new(migrator));

        let outcome = manager.resolve().await;
        assert!(outcome.connected);

        let descriptor = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .expect("migration should start")
            .expect("migration should report descriptor");
        assert_eq!(descriptor, "postgresql://app@db/chat");
        tokio::task::yield_now().await;
        assert!(manager.state().connected);
    }

    #[tokio::test]
    async fn exhausted_run_names_last_candidate_and_writes_journal() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("resolution.ndjson");
        let backend = FakeBackend::with_rules(vec![(
            "sslmode=require",
            Rule::Fail(BackendError::auth("password authentication failed")),
        )]);
        let manager = ConnectionManager::new(backend)
            .with_inputs(public("postgresql://app:secret@db/chat"))
            .with_journal(FileResolutionJournal::from_path(&path));

        let outcome = manager.resolve().await;
        assert!(!outcome.connected);
        assert_eq!(outcome.attempted.len(), 3);
        assert_eq!(
            outcome.error.as_deref(),
            Some(
                "All connection attempts failed; last: PUBLIC_ENV_SSL_NO_VERIFY failed: \
                 authentication failed: password authentication failed"
            )
        );

        let content = std::fs::read_to_string(&path).expect("journal should exist");
        assert!(!content.contains("secret"));
        let events = content
            .lines()
            .map(|line| {
                serde_json::from_str::<JournalRecord>(line)
                    .expect("journal line should parse")
                    .event
            })
            .collect::<Vec<_>>();
        assert_eq!(
            events,
            vec![
                JournalEvent::RunStarted,
                JournalEvent::TrialFailed,
                JournalEvent::TrialFailed,
                JournalEvent::TrialFailed,
                JournalEvent::RunExhausted,
            ]
        );
    }

    #[tokio::test]
    async fn newly_set_inputs_are_picked_up_without_restart() {
        let inputs = Arc::new(Mutex::new(EnvInputs::default()));
        let backend = FakeBackend::with_rules(vec![("late", Rule::Succeed)]);
        let manager =
            ConnectionManager::new(backend).with_inputs(SharedInputs(Arc::clone(&inputs)));

        assert!(!manager.resolve().await.connected);
        *inputs.lock().expect("inputs lock") = EnvInputs {
            private_url: Some("postgresql://late/db".to_string()),
            ..EnvInputs::default()
        };

        let outcome = manager.resolve().await;
        assert!(outcome.connected);
        assert_eq!(outcome.strategy.as_deref(), Some("PRIVATE_ENV_RAW"));
        assert_eq!(manager.status().db_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_and_panicking_trials_fall_through_to_next_candidate() {
        let backend = FakeBackend::with_rules(vec![
            ("sslmode=prefer", Rule::Panic),
            ("sslmode=require", Rule::Succeed),
            ("db.internal", Rule::Hang),
        ]);
        let manager = ConnectionManager::new(backend)
            .with_inputs(public("postgresql://db.internal/chat"))
            .with_trial_timeout(Duration::from_secs(5));

        let outcome = manager.resolve().await;
        assert!(outcome.connected);
        assert_eq!(outcome.strategy.as_deref(), Some("PUBLIC_ENV_SSL_NO_VERIFY"));
        assert_eq!(
            outcome.attempted,
            vec![
                "PUBLIC_ENV_RAW",
                "PUBLIC_ENV_SSL_PREFER",
                "PUBLIC_ENV_SSL_NO_VERIFY"
            ]
        );

        let attempts = manager.diagnostics().recent_attempts;
        assert_eq!(attempts[0].outcome, TrialOutcome::TimedOut);
        assert_eq!(attempts[1].outcome, TrialOutcome::Failed);
        assert!(attempts[1]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("driver bug while connecting")));
        assert_eq!(attempts[2].outcome, TrialOutcome::Succeeded);

        tokio::time::advance(Duration::from_secs(7_200)).await;
        tokio::task::yield_now().await;

        assert_eq!(manager.backend().late_connects.load(Ordering::SeqCst), 0);
        assert_eq!(manager.backend().connects().len(), 3);
        let handle = manager.active_handle();
        assert_eq!(
            handle.connection().map(String::as_str),
            Ok("postgresql://db.internal/chat?sslmode=require")
        );
        assert_eq!(handle.run(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_release_of_superseded_handle_does_not_block_resolution() {
        let backend = FakeBackend {
            rules: vec![
                ("first", Rule::Succeed),
                ("second", Rule::Succeed),
                ("third", Rule::Succeed),
            ],
            slow_release: true,
            ..FakeBackend::default()
        };
        let manager = ConnectionManager::new(backend).with_inputs(public("postgresql://first/db"));
        assert!(manager.resolve().await.connected);

        let second = tokio::time::timeout(
            Duration::from_secs(10),
            manager.apply_override("postgresql://second/db"),
        )
        .await
        .expect("resolution should not wait for the old pool to close");
        assert!(second.connected);

        let third = tokio::time::timeout(
            Duration::from_secs(10),
            manager.apply_override("postgresql://third/db"),
        )
        .await
        .expect("queued run should not wait for the old pool to close");
        assert!(third.connected);
        assert!(manager.backend().disconnects().is_empty());
        assert_eq!(
            manager.active_handle().connection().map(String::as_str),
            Ok("postgresql://third/db")
        );
    }
}
