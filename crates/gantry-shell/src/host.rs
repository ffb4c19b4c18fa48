//! Terminal-backed application host.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use gantry_updater::{AppHost, Dialog, DialogChoice, UpdateError};

const QUALIFIER: &str = "io";
const ORGANIZATION: &str = "gantry";
const APPLICATION: &str = "gantry";

/// Per-user data directory, e.g. `~/.local/share/gantry` on Linux.
pub fn default_data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
        .map(|dirs| dirs.data_dir().to_path_buf())
}

/// Default configuration file, e.g. `~/.config/gantry/gantry.toml` on Linux.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
        .map(|dirs| dirs.config_dir().join("gantry.toml"))
}

/// Map a typed answer to the restart prompt. Empty input picks the default
/// button ("Restart now").
pub fn parse_choice(answer: &str) -> DialogChoice {
    match answer.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "r" | "restart" | "restart now" | "y" | "yes" => DialogChoice::RestartNow,
        _ => DialogChoice::Later,
    }
}

/// Hosts the pipeline in a terminal session: dialogs go to stderr, answers
/// come from stdin.
pub struct TerminalHost {
    version: String,
    data_dir: PathBuf,
    install_dir: PathBuf,
    executable: PathBuf,
    relaunch_args: Vec<String>,
}

impl TerminalHost {
    pub fn new(version: String, data_dir: PathBuf, install_dir: Option<PathBuf>) -> Result<Self> {
        let executable = std::env::current_exe().context("cannot locate the running executable")?;
        let install_dir = match install_dir {
            Some(dir) => dir,
            None => executable
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| anyhow!("executable {:?} has no parent directory", executable))?,
        };
        debug!("Terminal host: data={:?}, install={:?}", data_dir, install_dir);

        Ok(Self {
            version,
            data_dir,
            install_dir,
            executable,
            relaunch_args: std::env::args().skip(1).collect(),
        })
    }
}

#[async_trait]
impl AppHost for TerminalHost {
    fn version(&self) -> String {
        self.version.clone()
    }

    fn writable_data_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    fn install_dir(&self) -> PathBuf {
        self.install_dir.clone()
    }

    async fn show_dialog(&self, dialog: Dialog) -> DialogChoice {
        eprintln!("\n{}", dialog.message());
        if !matches!(dialog, Dialog::RestartPrompt { .. }) {
            return DialogChoice::Acknowledged;
        }

        let buttons = dialog.buttons();
        eprint!("[1] {}  [2] {} > ", buttons[0], buttons[1]);
        let _ = std::io::stderr().flush();

        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|n| (n, line))
        })
        .await;

        match answer {
            Ok(Ok((0, _))) => {
                info!("No input available, deferring update");
                DialogChoice::Later
            }
            Ok(Ok((_, line))) => parse_choice(&line),
            Ok(Err(e)) => {
                warn!("Failed to read answer: {}", e);
                DialogChoice::Later
            }
            Err(e) => {
                warn!("Prompt task failed: {}", e);
                DialogChoice::Later
            }
        }
    }

    fn relaunch(&self) -> Result<(), UpdateError> {
        info!("Relaunching {:?}", self.executable);
        Command::new(&self.executable).args(&self.relaunch_args).spawn()?;
        Ok(())
    }

    fn exit(&self, code: i32) {
        info!("Exiting with code {}", code);
        std::process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice(""), DialogChoice::RestartNow);
        assert_eq!(parse_choice("1\n"), DialogChoice::RestartNow);
        assert_eq!(parse_choice(" Restart now "), DialogChoice::RestartNow);
        assert_eq!(parse_choice("2"), DialogChoice::Later);
        assert_eq!(parse_choice("later"), DialogChoice::Later);
        assert_eq!(parse_choice("whatever"), DialogChoice::Later);
    }

    #[test]
    fn test_install_dir_defaults_to_executable_dir() {
        let data = TempDir::new().unwrap();
        let host = TerminalHost::new("1.0.0".to_string(), data.path().to_path_buf(), None).unwrap();
        let exe = std::env::current_exe().unwrap();
        assert_eq!(host.install_dir(), exe.parent().unwrap());
        assert_eq!(host.writable_data_dir(), data.path());
        assert_eq!(host.version(), "1.0.0");
    }

    #[tokio::test]
    async fn test_informational_dialog_does_not_prompt() {
        let data = TempDir::new().unwrap();
        let host = TerminalHost::new(
            "1.0.0".to_string(),
            data.path().to_path_buf(),
            Some(data.path().join("app")),
        )
        .unwrap();
        let choice = host
            .show_dialog(Dialog::UpToDate { version: "1.0.0".to_string() })
            .await;
        assert_eq!(choice, DialogChoice::Acknowledged);
    }
}
