//! Application host abstraction.
//!
//! The windowing layer is opaque to the pipeline. Everything the pipeline
//! needs from it (dialogs, process lifecycle, well-known directories, the
//! running version) goes through [`AppHost`], passed explicitly into the
//! orchestrator.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{ErrorKind, UpdateError};

/// Consent prompt message shown once an update is ready.
pub const RESTART_PROMPT: &str =
    "A new update has been downloaded. Restart the application to install it.";

/// Dialogs the pipeline may ask the host to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dialog {
    /// Ask whether to restart into `version` now
    RestartPrompt { version: String },
    /// Tell the user they already run the latest version
    UpToDate { version: String },
    /// Report a failed update attempt
    Error { kind: ErrorKind, message: String },
}

impl Dialog {
    /// Button labels, in display order. The first is the default.
    pub fn buttons(&self) -> &'static [&'static str] {
        match self {
            Self::RestartPrompt { .. } => &["Restart now", "Later"],
            Self::UpToDate { .. } | Self::Error { .. } => &["OK"],
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::RestartPrompt { version } => format!("{} (version {})", RESTART_PROMPT, version),
            Self::UpToDate { version } => format!("You are running the latest version ({}).", version),
            Self::Error { message, .. } => format!("The update could not be completed: {}", message),
        }
    }
}

/// User's answer to a dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogChoice {
    RestartNow,
    Later,
    Acknowledged,
}

/// The running application, as seen by the update pipeline.
#[async_trait]
pub trait AppHost: Send + Sync {
    /// Version string of the running application.
    fn version(&self) -> String;

    /// Per-user writable directory for the artifact and pipeline state.
    fn writable_data_dir(&self) -> PathBuf;

    /// Directory the running application is installed in.
    fn install_dir(&self) -> PathBuf;

    /// Show a modal dialog and wait for the user's choice.
    async fn show_dialog(&self, dialog: Dialog) -> DialogChoice;

    /// Spawn a fresh instance of the application.
    fn relaunch(&self) -> Result<(), UpdateError>;

    /// Terminate the current process with `code`.
    fn exit(&self, code: i32);
}
