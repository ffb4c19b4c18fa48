//! Update installation strategies.
//!
//! Both strategies consume a [`VerifiedArtifact`], so nothing reaches the
//! install directory without passing verification first.
//!
//! - [`ManualStrategy`] extracts the archive into a staging directory, then
//!   renames each top-level entry over the install directory. A failed move
//!   restores every entry moved so far.
//! - [`DelegatedStrategy`] hands the artifact to a [`ManagedUpdater`] and
//!   lets it quit and install.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::artifact::VerifiedArtifact;
use crate::config::FeedConfig;
use crate::download::ARTIFACT_FILE_NAME;
use crate::error::UpdateError;
use crate::host::AppHost;

/// Staging directory name under the writable data directory.
const STAGING_DIR: &str = "staging";
/// Holds install-directory entries displaced during a move, until it succeeds.
const DISPLACED_DIR: &str = "displaced";

/// Applies a verified artifact to the running installation.
#[async_trait]
pub trait InstallStrategy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Work done before the consent prompt. Must not touch the install
    /// directory.
    async fn prepare(&self, artifact: &VerifiedArtifact, version: &str) -> Result<(), UpdateError>;

    /// Install and hand the process over to the new version.
    ///
    /// On success the host has been asked to exit; on failure the current
    /// installation is intact.
    async fn install(&self, artifact: &VerifiedArtifact, host: &dyn AppHost) -> Result<(), UpdateError>;
}

// ============================================================================
// Manual strategy
// ============================================================================

/// One rename from the staging directory into the install directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMove {
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// Ordered moves that apply an extracted archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallPlan {
    pub moves: Vec<FileMove>,
}

impl InstallPlan {
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}

/// Extracts the archive and moves its top-level entries over the install
/// directory.
#[derive(Debug, Clone)]
pub struct ManualStrategy {
    install_dir: PathBuf,
    staging_dir: PathBuf,
    displaced_dir: PathBuf,
}

impl ManualStrategy {
    /// `data_dir` should live on the same filesystem as `install_dir`;
    /// renames across devices fail with [`UpdateError::InstallMove`].
    pub fn new(install_dir: PathBuf, data_dir: &Path) -> Self {
        Self {
            install_dir,
            staging_dir: data_dir.join(STAGING_DIR),
            displaced_dir: data_dir.join(DISPLACED_DIR),
        }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Extract, plan, and apply without relaunching.
    pub async fn apply_artifact(&self, artifact: &VerifiedArtifact) -> Result<InstallPlan, UpdateError> {
        self.extract(artifact).await?;
        let plan = self.plan().await?;
        self.apply(&plan).await?;
        self.cleanup().await;
        Ok(plan)
    }

    /// Extract the whole archive into a fresh staging directory.
    ///
    /// Returns only once every entry is written and closed.
    pub async fn extract(&self, artifact: &VerifiedArtifact) -> Result<(), UpdateError> {
        let archive = artifact.path().to_path_buf();
        let staging = self.staging_dir.clone();
        info!("Extracting {:?} into {:?}", archive, staging);

        let count = tokio::task::spawn_blocking(move || extract_archive(&archive, &staging))
            .await
            .map_err(|e| UpdateError::Unexpected(format!("extraction task failed: {}", e)))?
            .map_err(|e| {
                error!("Archive extraction failed: {}", e);
                e
            })?;

        debug!("Extracted {} entries", count);
        Ok(())
    }

    /// Enumerate the top-level staged entries, sorted by name.
    pub async fn plan(&self) -> Result<InstallPlan, UpdateError> {
        let mut entries = tokio::fs::read_dir(&self.staging_dir)
            .await
            .map_err(|e| move_error("read staging directory", &self.staging_dir, e))?;

        let mut moves = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| move_error("read staging directory", &self.staging_dir, e))?
        {
            moves.push(FileMove {
                source: entry.path(),
                destination: self.install_dir.join(entry.file_name()),
            });
        }
        moves.sort_by(|a, b| a.source.cmp(&b.source));

        if moves.is_empty() {
            return Err(UpdateError::InstallMove("archive contains no entries".to_string()));
        }
        Ok(InstallPlan { moves })
    }

    /// Rename every planned entry into place, restoring on failure.
    pub async fn apply(&self, plan: &InstallPlan) -> Result<(), UpdateError> {
        let plan = plan.clone();
        let displaced_dir = self.displaced_dir.clone();
        tokio::task::spawn_blocking(move || apply_moves(&plan, &displaced_dir))
            .await
            .map_err(|e| UpdateError::Unexpected(format!("install task failed: {}", e)))?
    }

    /// Remove staging leftovers. Failures only warn.
    pub async fn cleanup(&self) {
        for dir in [&self.staging_dir, &self.displaced_dir] {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to clean up {:?}: {}", dir, e),
            }
        }
    }
}

#[async_trait]
impl InstallStrategy for ManualStrategy {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn prepare(&self, _artifact: &VerifiedArtifact, _version: &str) -> Result<(), UpdateError> {
        Ok(())
    }

    async fn install(&self, artifact: &VerifiedArtifact, host: &dyn AppHost) -> Result<(), UpdateError> {
        let plan = self.apply_artifact(artifact).await?;
        info!(
            "Installed {} entries into {:?}, relaunching",
            plan.len(),
            self.install_dir
        );

        if let Err(e) = host.relaunch() {
            error!("Relaunch after install failed: {}", e);
        }
        host.exit(0);
        Ok(())
    }
}

fn move_error(action: &str, path: &Path, err: io::Error) -> UpdateError {
    UpdateError::InstallMove(format!("{} {:?}: {}", action, path, err))
}

fn remove_path(path: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// Extract `archive` into `staging`, replacing any previous contents.
fn extract_archive(archive: &Path, staging: &Path) -> Result<usize, UpdateError> {
    match std::fs::remove_dir_all(staging) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(move_error("clear staging directory", staging, e)),
    }
    std::fs::create_dir_all(staging).map_err(|e| move_error("create staging directory", staging, e))?;

    let file = std::fs::File::open(archive).map_err(|e| move_error("open archive", archive, e))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| UpdateError::InstallMove(format!("invalid archive: {}", e)))?;

    let mut written = 0;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| UpdateError::InstallMove(format!("read archive entry {}: {}", index, e)))?;

        let Some(relative) = entry.enclosed_name() else {
            warn!("Skipping archive entry with unsafe path: {}", entry.name());
            continue;
        };
        let out_path = staging.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|e| move_error("create", &out_path, e))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| move_error("create", parent, e))?;
        }
        let mut out = std::fs::File::create(&out_path).map_err(|e| move_error("create", &out_path, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| move_error("write", &out_path, e))?;
        out.sync_all().map_err(|e| move_error("sync", &out_path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode & 0o7777))
                    .map_err(|e| move_error("set permissions on", &out_path, e))?;
            }
        }
        written += 1;
    }
    Ok(written)
}

/// A move that has been applied and can be undone.
struct AppliedMove {
    destination: PathBuf,
    displaced: Option<PathBuf>,
}

fn apply_moves(plan: &InstallPlan, displaced_dir: &Path) -> Result<(), UpdateError> {
    match std::fs::remove_dir_all(displaced_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(move_error("clear", displaced_dir, e)),
    }
    std::fs::create_dir_all(displaced_dir).map_err(|e| move_error("create", displaced_dir, e))?;

    let mut applied: Vec<AppliedMove> = Vec::with_capacity(plan.moves.len());
    for mv in &plan.moves {
        match apply_one(mv, displaced_dir) {
            Ok(done) => applied.push(done),
            Err(e) => {
                error!("Install move failed, restoring previous entries: {}", e);
                roll_back(&applied);
                return Err(e);
            }
        }
    }
    Ok(())
}

fn apply_one(mv: &FileMove, displaced_dir: &Path) -> Result<AppliedMove, UpdateError> {
    let name = mv
        .destination
        .file_name()
        .ok_or_else(|| UpdateError::InstallMove(format!("invalid destination {:?}", mv.destination)))?;

    let displaced = if std::fs::symlink_metadata(&mv.destination).is_ok() {
        let backup = displaced_dir.join(name);
        std::fs::rename(&mv.destination, &backup)
            .map_err(|e| move_error("move aside", &mv.destination, e))?;
        Some(backup)
    } else {
        None
    };

    if let Err(e) = std::fs::rename(&mv.source, &mv.destination) {
        if let Some(backup) = &displaced {
            if let Err(restore) = std::fs::rename(backup, &mv.destination) {
                error!("Failed to restore {:?}: {}", mv.destination, restore);
            }
        }
        return Err(move_error("move into place", &mv.destination, e));
    }

    debug!("Moved {:?} -> {:?}", mv.source, mv.destination);
    Ok(AppliedMove {
        destination: mv.destination.clone(),
        displaced,
    })
}

fn roll_back(applied: &[AppliedMove]) {
    for done in applied.iter().rev() {
        if let Err(e) = remove_path(&done.destination) {
            error!("Rollback: failed to remove {:?}: {}", done.destination, e);
            continue;
        }
        if let Some(backup) = &done.displaced {
            if let Err(e) = std::fs::rename(backup, &done.destination) {
                error!("Rollback: failed to restore {:?}: {}", done.destination, e);
            }
        }
    }
}

// ============================================================================
// Delegated strategy
// ============================================================================

/// Lifecycle signal from a managed updater once it has the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagedEvent {
    /// The updater holds the package and can install it on quit
    UpdateDownloaded { version: String },
    /// The updater rejected or failed to stage the package
    Error(String),
}

/// Third-party updater capability that installs end-to-end.
#[async_trait]
pub trait ManagedUpdater: Send + Sync {
    /// Point the updater at its feed.
    fn set_feed(&self, feed_url: &str, token: Option<&str>) -> Result<(), UpdateError>;

    /// Hand over the artifact and wait for the updater's verdict.
    async fn stage(&self, artifact: &Path, version: &str) -> Result<ManagedEvent, UpdateError>;

    /// Quit the application and install the staged update.
    fn quit_and_install(&self) -> Result<(), UpdateError>;
}

/// Installs through a [`ManagedUpdater`].
pub struct DelegatedStrategy {
    updater: Arc<dyn ManagedUpdater>,
    feed: FeedConfig,
}

impl DelegatedStrategy {
    pub fn new(updater: Arc<dyn ManagedUpdater>, feed: FeedConfig) -> Self {
        Self { updater, feed }
    }
}

#[async_trait]
impl InstallStrategy for DelegatedStrategy {
    fn name(&self) -> &'static str {
        "delegated"
    }

    async fn prepare(&self, artifact: &VerifiedArtifact, version: &str) -> Result<(), UpdateError> {
        let feed_url = self.feed.feed_url()?;
        self.updater.set_feed(&feed_url, self.feed.token.as_deref())?;

        match self.updater.stage(artifact.path(), version).await? {
            ManagedEvent::UpdateDownloaded { version: staged } => {
                if staged != version {
                    warn!("Managed updater staged {} while {} was expected", staged, version);
                }
                info!("Managed updater has {} ready", staged);
                Ok(())
            }
            ManagedEvent::Error(message) => {
                error!("Managed updater failed to stage update: {}", message);
                Err(UpdateError::InstallationFailed(message))
            }
        }
    }

    async fn install(&self, _artifact: &VerifiedArtifact, host: &dyn AppHost) -> Result<(), UpdateError> {
        info!("Handing over to managed updater");
        self.updater.quit_and_install()?;
        host.exit(0);
        Ok(())
    }
}

/// Managed updater backed by an external program.
///
/// Staging copies the artifact into the updater's own directory under a
/// fixed file name, so the remote version never shapes a path. Quitting
/// spawns `program [args..] --package <staged> [--feed <url>]` and leaves
/// the rest to it.
pub struct CommandUpdater {
    program: PathBuf,
    args: Vec<String>,
    pending_dir: PathBuf,
    feed: Mutex<Option<String>>,
    staged: Mutex<Option<PathBuf>>,
}

impl CommandUpdater {
    pub fn new(program: PathBuf, args: Vec<String>, pending_dir: PathBuf) -> Self {
        Self {
            program,
            args,
            pending_dir,
            feed: Mutex::new(None),
            staged: Mutex::new(None),
        }
    }

    pub fn staged_package(&self) -> Option<PathBuf> {
        self.staged.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Arguments the updater program is launched with.
    pub fn command_args(&self) -> Result<Vec<String>, UpdateError> {
        let staged = self.staged_package().ok_or_else(|| {
            UpdateError::InstallationFailed("no update has been staged".to_string())
        })?;
        let mut args = self.args.clone();
        args.push("--package".to_string());
        args.push(staged.display().to_string());
        if let Some(feed) = self.feed.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            args.push("--feed".to_string());
            args.push(feed);
        }
        Ok(args)
    }
}

#[async_trait]
impl ManagedUpdater for CommandUpdater {
    fn set_feed(&self, feed_url: &str, token: Option<&str>) -> Result<(), UpdateError> {
        debug!(
            "Managed updater feed: {} (token {})",
            feed_url,
            if token.is_some() { "set" } else { "unset" }
        );
        *self.feed.lock().unwrap_or_else(|e| e.into_inner()) = Some(feed_url.to_string());
        Ok(())
    }

    async fn stage(&self, artifact: &Path, version: &str) -> Result<ManagedEvent, UpdateError> {
        tokio::fs::create_dir_all(&self.pending_dir).await?;
        let target = self.pending_dir.join(ARTIFACT_FILE_NAME);
        if let Err(e) = tokio::fs::copy(artifact, &target).await {
            return Ok(ManagedEvent::Error(format!("failed to stage {:?}: {}", artifact, e)));
        }
        *self.staged.lock().unwrap_or_else(|e| e.into_inner()) = Some(target);
        Ok(ManagedEvent::UpdateDownloaded {
            version: version.to_string(),
        })
    }

    fn quit_and_install(&self) -> Result<(), UpdateError> {
        let args = self.command_args()?;
        info!("Launching updater {:?} {:?}", self.program, args);
        Command::new(&self.program)
            .args(&args)
            .spawn()
            .map_err(|e| {
                UpdateError::InstallationFailed(format!(
                    "failed to launch updater {:?}: {}",
                    self.program, e
                ))
            })?;
        Ok(())
    }
}
