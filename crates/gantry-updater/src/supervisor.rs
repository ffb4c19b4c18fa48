//! Last-resort fault handling around the application's main work.
//!
//! A panic that escapes the supervised future is logged, reported to the
//! user as a generic error, and answered with a relaunch and a non-zero
//! exit.

use std::future::Future;
use std::sync::Arc;

use tracing::error;

use crate::error::ErrorKind;
use crate::host::{AppHost, Dialog};

/// Exit code used after an unexpected fault.
pub const FAULT_EXIT_CODE: i32 = 1;

/// Outcome of a supervised task.
#[derive(Debug, PartialEq, Eq)]
pub enum Supervised<T> {
    Completed(T),
    /// The task panicked and the host was asked to relaunch
    Faulted,
    Cancelled,
}

/// Run `fut` on its own task and recover from a panic.
pub async fn run_supervised<F>(host: Arc<dyn AppHost>, fut: F) -> Supervised<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(output) => Supervised::Completed(output),
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            error!("Unexpected fault: {}", message);
            host.show_dialog(Dialog::Error {
                kind: ErrorKind::Unexpected,
                message: "An unexpected error occurred. The application will restart.".to_string(),
            })
            .await;
            if let Err(e) = host.relaunch() {
                error!("Relaunch after fault failed: {}", e);
            }
            host.exit(FAULT_EXIT_CODE);
            Supervised::Faulted
        }
        Err(_) => Supervised::Cancelled,
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
