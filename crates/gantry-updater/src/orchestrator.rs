//! Update orchestrator - drives one pipeline run end to end.
//!
//! A run goes check → download → verify → prepare → consent → install. At
//! most one run is active at a time; a trigger arriving while a run is in
//! flight is skipped rather than queued.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::artifact::{ArtifactVerifier, VerificationFailure, VerificationResult};
use crate::config::{StrategyKind, UpdateConfig};
use crate::download::{Downloader, ARTIFACT_FILE_NAME};
use crate::error::{ErrorKind, UpdateError};
use crate::events::{EventBus, UpdateEvent};
use crate::host::{AppHost, Dialog, DialogChoice};
use crate::install::{
    CommandUpdater, DelegatedStrategy, InstallStrategy, ManagedUpdater, ManualStrategy,
};
use crate::manifest::{UpdateDecision, VersionChecker, VersionManifest};
use crate::pending::{PendingStore, PendingUpdate};

/// Directory the command updater stages packages into.
const MANAGED_PENDING_DIR: &str = "managed";

/// Current state of the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateState {
    #[default]
    Idle,
    Checking,
    Downloading,
    Verifying,
    AwaitingUserConsent,
    Installing,
    /// The process has been handed to the new version
    Terminated,
    /// The last run failed; a new trigger may start over
    Halted(ErrorKind),
}

impl UpdateState {
    /// Whether a new run may begin from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Halted(_))
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    Timer,
    /// User asked explicitly; the only trigger that reports "up to date"
    Manual,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another run was already active
    Skipped,
    UpToDate,
    /// The update was applied and the host asked to exit
    Installed,
    /// The user chose "Later"; the artifact is retained
    Deferred { version: String },
    /// The artifact failed verification and was discarded
    Rejected(VerificationFailure),
    Failed(ErrorKind),
}

/// Build the install strategy selected by `config`.
///
/// The delegated strategy uses `managed` when given, otherwise the
/// configured external updater program.
pub fn build_strategy(
    config: &UpdateConfig,
    host: &dyn AppHost,
    managed: Option<Arc<dyn ManagedUpdater>>,
) -> Result<Arc<dyn InstallStrategy>, UpdateError> {
    let data_dir = host.writable_data_dir();
    match config.strategy {
        StrategyKind::Manual => {
            let install_dir = config.install_dir.clone().unwrap_or_else(|| host.install_dir());
            Ok(Arc::new(ManualStrategy::new(install_dir, &data_dir)))
        }
        StrategyKind::Delegated => {
            let feed = config.feed.clone().ok_or_else(|| {
                UpdateError::Config("delegated strategy requires a [feed] section".to_string())
            })?;
            let updater: Arc<dyn ManagedUpdater> = match (managed, &config.managed_updater) {
                (Some(updater), _) => updater,
                (None, Some(cmd)) => Arc::new(CommandUpdater::new(
                    cmd.program.clone(),
                    cmd.args.clone(),
                    data_dir.join(MANAGED_PENDING_DIR),
                )),
                (None, None) => {
                    return Err(UpdateError::Config(
                        "delegated strategy requires a [managed_updater] section".to_string(),
                    ))
                }
            };
            Ok(Arc::new(DelegatedStrategy::new(updater, feed)))
        }
    }
}

/// Runs the update pipeline against an [`AppHost`].
pub struct UpdateOrchestrator {
    host: Arc<dyn AppHost>,
    checker: VersionChecker,
    downloader: Downloader,
    strategy: Arc<dyn InstallStrategy>,
    events: EventBus,
    pending: PendingStore,
    data_dir: PathBuf,
    auto_install: bool,
    state: Arc<RwLock<UpdateState>>,
}

impl UpdateOrchestrator {
    /// Create an orchestrator with the strategy selected by `config`.
    pub fn new(config: &UpdateConfig, host: Arc<dyn AppHost>) -> Result<Self, UpdateError> {
        let strategy = build_strategy(config, host.as_ref(), None)?;
        Self::with_strategy(config, host, strategy)
    }

    /// Create an orchestrator with an explicit install strategy.
    pub fn with_strategy(
        config: &UpdateConfig,
        host: Arc<dyn AppHost>,
        strategy: Arc<dyn InstallStrategy>,
    ) -> Result<Self, UpdateError> {
        config.validate()?;
        let manifest_url = config
            .manifest_url
            .clone()
            .ok_or_else(|| UpdateError::Config("manifest_url is required".to_string()))?;

        let events = EventBus::new();
        let mut downloader = Downloader::with_config(config.network.clone())?;
        let progress_bus = events.clone();
        downloader.set_progress_callback(move |progress| progress_bus.emit(progress.into()));

        let data_dir = host.writable_data_dir();
        let checker = VersionChecker::new(manifest_url, host.version(), config.version_policy);
        info!(
            "Update orchestrator ready: strategy={}, current version={}",
            strategy.name(),
            checker.current_version()
        );

        Ok(Self {
            pending: PendingStore::new(&data_dir),
            host,
            checker,
            downloader,
            strategy,
            events,
            data_dir,
            auto_install: config.auto_install,
            state: Arc::new(RwLock::new(UpdateState::Idle)),
        })
    }

    /// Get the current state.
    pub async fn state(&self) -> UpdateState {
        *self.state.read().await
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// Where the downloaded artifact is written.
    pub fn artifact_path(&self) -> PathBuf {
        self.data_dir.join(ARTIFACT_FILE_NAME)
    }

    /// Run the pipeline once.
    ///
    /// Returns [`RunOutcome::Skipped`] without side effects if another run
    /// is active or the process already handed over to a new version.
    pub async fn check_for_updates(&self, trigger: Trigger) -> RunOutcome {
        if !self.try_begin().await {
            info!("Update run already active, skipping {:?} trigger", trigger);
            return RunOutcome::Skipped;
        }
        info!("Starting update run ({:?})", trigger);

        match self.run(trigger).await {
            Ok(outcome) => {
                if outcome != RunOutcome::Installed {
                    self.set_state(UpdateState::Idle).await;
                }
                outcome
            }
            Err(e) => {
                let kind = e.kind();
                error!("Update run failed: {}", e);
                self.set_state(UpdateState::Halted(kind)).await;
                self.report_error(&e).await;
                RunOutcome::Failed(kind)
            }
        }
    }

    /// Run at `period` until `shutdown` flips to true or an update installs.
    ///
    /// The first run happens one period from now; missed ticks are skipped.
    pub async fn run_periodic(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.check_for_updates(Trigger::Timer).await;
                    debug!(?outcome, "Periodic update run finished");
                    if outcome == RunOutcome::Installed {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Periodic update checks stopped");
                        break;
                    }
                }
            }
        }
    }

    async fn try_begin(&self) -> bool {
        let mut state = self.state.write().await;
        if !state.can_start() {
            return false;
        }
        *state = UpdateState::Checking;
        true
    }

    async fn set_state(&self, next: UpdateState) {
        let mut state = self.state.write().await;
        debug!("Update state: {:?} -> {:?}", *state, next);
        *state = next;
    }

    async fn report_error(&self, err: &UpdateError) {
        self.events.emit(UpdateEvent::error(err));
        self.host
            .show_dialog(Dialog::Error {
                kind: err.kind(),
                message: err.to_string(),
            })
            .await;
    }

    async fn run(&self, trigger: Trigger) -> Result<RunOutcome, UpdateError> {
        self.events.emit(UpdateEvent::Checking);
        let manifest = match self.checker.check(&self.downloader).await? {
            UpdateDecision::UpToDate => {
                self.events.emit(UpdateEvent::UpToDate);
                if trigger == Trigger::Manual {
                    self.host
                        .show_dialog(Dialog::UpToDate {
                            version: self.checker.current_version().to_string(),
                        })
                        .await;
                }
                return Ok(RunOutcome::UpToDate);
            }
            UpdateDecision::UpdateAvailable(manifest) => manifest,
        };
        self.events.emit(UpdateEvent::UpdateAvailable {
            version: manifest.version.clone(),
        });

        let path = self.obtain_artifact(&manifest).await?;

        self.set_state(UpdateState::Verifying).await;
        let verifier = match manifest.sha256_bytes() {
            Some(digest) => ArtifactVerifier::with_expected_hash(digest),
            None => ArtifactVerifier::new(),
        };
        let artifact = match verifier.verify(&path).await {
            VerificationResult::Valid(artifact) => artifact,
            VerificationResult::Invalid(failure) => {
                self.discard_artifact(&path).await;
                self.report_error(&UpdateError::Verification(failure.clone())).await;
                return Ok(RunOutcome::Rejected(failure));
            }
        };

        self.strategy.prepare(&artifact, &manifest.version).await?;
        self.events.emit(UpdateEvent::UpdateDownloaded {
            version: manifest.version.clone(),
        });

        self.set_state(UpdateState::AwaitingUserConsent).await;
        if !self.auto_install {
            let choice = self
                .host
                .show_dialog(Dialog::RestartPrompt {
                    version: manifest.version.clone(),
                })
                .await;
            if choice != DialogChoice::RestartNow {
                info!("Update {} deferred by user", manifest.version);
                self.pending
                    .save(&PendingUpdate::new(
                        manifest.version.clone(),
                        path,
                        manifest.sha256.clone(),
                    ))
                    .await?;
                return Ok(RunOutcome::Deferred {
                    version: manifest.version,
                });
            }
        }

        self.set_state(UpdateState::Installing).await;
        if let Err(e) = self.pending.clear().await {
            warn!("Failed to clear pending update record: {}", e);
        }
        self.strategy.install(&artifact, self.host.as_ref()).await?;
        self.set_state(UpdateState::Terminated).await;
        Ok(RunOutcome::Installed)
    }

    /// Reuse a deferred artifact for the same version, or download afresh.
    async fn obtain_artifact(&self, manifest: &VersionManifest) -> Result<PathBuf, UpdateError> {
        match self.pending.load().await {
            Some(pending) if pending.matches(&manifest.version, manifest.sha256.as_deref()) => {
                info!(
                    "Resuming update {} deferred at {}",
                    pending.version, pending.deferred_at
                );
                return Ok(pending.artifact);
            }
            Some(stale) => {
                debug!("Dropping stale pending update {}", stale.version);
                self.pending.clear().await?;
            }
            None => {}
        }

        self.set_state(UpdateState::Downloading).await;
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let path = self.artifact_path();
        match self.downloader.download(&manifest.download_url, &path).await {
            Ok(task) => {
                info!("Downloaded {} bytes to {:?}", task.bytes_written, task.destination);
                Ok(path)
            }
            Err(e) => {
                self.discard_artifact(&path).await;
                Err(e)
            }
        }
    }

    async fn discard_artifact(&self, path: &std::path::Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("Removed artifact {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove artifact {:?}: {}", path, e),
        }
        if let Err(e) = self.pending.clear().await {
            warn!("Failed to clear pending update record: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct StubHost {
        data_dir: PathBuf,
        dialogs: Mutex<Vec<Dialog>>,
    }

    #[async_trait]
    impl AppHost for StubHost {
        fn version(&self) -> String {
            "1.0.0".to_string()
        }

        fn writable_data_dir(&self) -> PathBuf {
            self.data_dir.clone()
        }

        fn install_dir(&self) -> PathBuf {
            self.data_dir.join("app")
        }

        async fn show_dialog(&self, dialog: Dialog) -> DialogChoice {
            self.dialogs.lock().unwrap().push(dialog);
            DialogChoice::Acknowledged
        }

        fn relaunch(&self) -> Result<(), UpdateError> {
            Ok(())
        }

        fn exit(&self, _code: i32) {}
    }

    fn orchestrator(dir: &TempDir) -> (UpdateOrchestrator, Arc<StubHost>) {
        let host = Arc::new(StubHost {
            data_dir: dir.path().to_path_buf(),
            dialogs: Mutex::new(Vec::new()),
        });
        let config = UpdateConfig {
            // Nothing listens on port 1, so the connection is refused.
            manifest_url: Some("http://127.0.0.1:1/latest.json".to_string()),
            network: NetworkConfig {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let orch = UpdateOrchestrator::new(&config, host.clone()).unwrap();
        (orch, host)
    }

    #[test]
    fn test_can_start() {
        assert!(UpdateState::Idle.can_start());
        assert!(UpdateState::Halted(ErrorKind::Network).can_start());
        assert!(!UpdateState::Downloading.can_start());
        assert!(!UpdateState::AwaitingUserConsent.can_start());
        assert!(!UpdateState::Terminated.can_start());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(StubHost {
            data_dir: dir.path().to_path_buf(),
            dialogs: Mutex::new(Vec::new()),
        });
        let result = UpdateOrchestrator::new(&UpdateConfig::default(), host);
        assert!(matches!(result, Err(UpdateError::Config(_))));
    }

    #[test]
    fn test_delegated_without_updater_is_config_error() {
        let dir = TempDir::new().unwrap();
        let host = StubHost {
            data_dir: dir.path().to_path_buf(),
            dialogs: Mutex::new(Vec::new()),
        };
        let config = UpdateConfig {
            strategy: StrategyKind::Delegated,
            feed: Some(crate::config::FeedConfig {
                provider: crate::config::FeedProvider::Generic,
                url: Some("https://example.com/feed".to_string()),
                owner: None,
                repo: None,
                token: None,
            }),
            ..Default::default()
        };
        assert!(matches!(
            build_strategy(&config, &host, None),
            Err(UpdateError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_network_failure_halts_and_reports() {
        let dir = TempDir::new().unwrap();
        let (orch, host) = orchestrator(&dir);
        let mut events = orch.subscribe();

        let outcome = orch.check_for_updates(Trigger::Startup).await;
        assert_eq!(outcome, RunOutcome::Failed(ErrorKind::Network));
        assert_eq!(orch.state().await, UpdateState::Halted(ErrorKind::Network));

        assert_eq!(events.recv().await.unwrap(), UpdateEvent::Checking);
        assert!(matches!(
            events.recv().await.unwrap(),
            UpdateEvent::Error { kind: ErrorKind::Network, .. }
        ));
        let dialogs = host.dialogs.lock().unwrap().clone();
        assert_eq!(dialogs.len(), 1);
        assert!(matches!(dialogs[0], Dialog::Error { kind: ErrorKind::Network, .. }));
    }

    #[tokio::test]
    async fn test_halted_pipeline_can_restart() {
        let dir = TempDir::new().unwrap();
        let (orch, _host) = orchestrator(&dir);
        orch.check_for_updates(Trigger::Startup).await;
        let outcome = orch.check_for_updates(Trigger::Manual).await;
        assert_eq!(outcome, RunOutcome::Failed(ErrorKind::Network));
    }

    #[tokio::test]
    async fn test_active_run_skips_trigger() {
        let dir = TempDir::new().unwrap();
        let (orch, host) = orchestrator(&dir);
        *orch.state.write().await = UpdateState::Downloading;

        assert_eq!(orch.check_for_updates(Trigger::Timer).await, RunOutcome::Skipped);
        assert_eq!(orch.state().await, UpdateState::Downloading);
        assert!(host.dialogs.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let (orch, _host) = orchestrator(&dir);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::new(orch).run_periodic(Duration::from_secs(3600), rx));
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
