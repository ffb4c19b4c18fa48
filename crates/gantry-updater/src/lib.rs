//! # gantry-updater
//!
//! Self-update pipeline for desktop applications.
//!
//! A run fetches a small JSON manifest, compares its version with the
//! running one, downloads the package, verifies it, asks the user for
//! consent, and installs it through one of two strategies:
//!
//! - **manual**: extract the ZIP and move its entries over the install
//!   directory, restoring the previous entries if a move fails
//! - **delegated**: hand the package to a managed updater that installs on
//!   quit
//!
//! The host application is reached only through [`AppHost`]; progress and
//! outcomes are published as [`UpdateEvent`]s.
//!
//! ## Guarantees
//!
//! - Nothing is written to the install directory unless the artifact passed
//!   verification ([`VerifiedArtifact`] is the only accepted input)
//! - At most one run is active at a time; concurrent triggers are skipped
//! - A failed run leaves the current installation intact

pub mod artifact;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod host;
pub mod install;
pub mod manifest;
pub mod orchestrator;
pub mod pending;
#[cfg(test)]
mod proptests;
pub mod supervisor;

// Re-export main types for convenience
pub use artifact::{ArtifactVerifier, VerificationFailure, VerificationResult, VerifiedArtifact};
pub use config::{
    FeedConfig, FeedProvider, ManagedUpdaterConfig, NetworkConfig, StrategyKind, UpdateConfig,
    VersionPolicy,
};
pub use download::{DownloadProgress, DownloadTask, Downloader, ARTIFACT_FILE_NAME};
pub use error::{ErrorKind, UpdateError};
pub use events::{EventBus, UpdateEvent};
pub use host::{AppHost, Dialog, DialogChoice, RESTART_PROMPT};
pub use install::{
    CommandUpdater, DelegatedStrategy, InstallPlan, InstallStrategy, ManagedEvent, ManagedUpdater,
    ManualStrategy,
};
pub use manifest::{decide, UpdateDecision, VersionChecker, VersionManifest};
pub use orchestrator::{build_strategy, RunOutcome, Trigger, UpdateOrchestrator, UpdateState};
pub use pending::{PendingStore, PendingUpdate};
pub use supervisor::{run_supervised, Supervised};
