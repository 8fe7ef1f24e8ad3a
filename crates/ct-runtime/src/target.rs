use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{CancelToken, LifecycleState, StateCell};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    InProcess,
    Process,
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("target process exited unexpectedly with status {code:?}")]
    Exited { code: Option<i32> },
    #[error("target failed: {0}")]
    Failed(String),
}

/// A system under test that runs on the controller's background thread.
///
/// `run` must call [`TargetContext::report_ready`] once it accepts input and
/// return after [`TargetContext::shutdown`] fires. Returning early, with or
/// without an error, marks the target failed.
pub trait Target: Send + 'static {
    fn kind(&self) -> TargetKind;

    fn run(&mut self, ctx: &TargetContext) -> Result<(), TargetError>;
}

/// Everything a running target may see or touch.
#[derive(Debug, Clone)]
pub struct TargetContext {
    pub(crate) name: String,
    pub(crate) config_path: PathBuf,
    pub(crate) args: Vec<String>,
    pub(crate) log_path: Option<PathBuf>,
    pub(crate) state: StateCell,
    pub(crate) shutdown: CancelToken,
    pub(crate) pid: Arc<Mutex<Option<u32>>>,
}

impl TargetContext {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    #[must_use]
    pub fn shutdown(&self) -> &CancelToken {
        &self.shutdown
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    /// Moves the target from starting to running. Returns `false` if the
    /// controller already moved on (for example a stop raced the startup).
    pub fn report_ready(&self) -> bool {
        match self.state.transition(LifecycleState::Running) {
            Ok(_) => {
                tracing::info!(target_name = %self.name, "target reported running");
                true
            }
            Err(err) => {
                tracing::debug!(target_name = %self.name, error = %err, "ready report ignored");
                false
            }
        }
    }

    pub fn report_pid(&self, pid: u32) {
        *self.pid.lock() = Some(pid);
    }

    #[cfg(test)]
    pub(crate) fn for_tests(config_path: PathBuf) -> Self {
        let state = StateCell::new();
        let _ = state.transition(LifecycleState::Starting);
        Self {
            name: "test".to_owned(),
            config_path,
            args: Vec::new(),
            log_path: None,
            state,
            shutdown: CancelToken::new(),
            pid: Arc::new(Mutex::new(None)),
        }
    }
}
