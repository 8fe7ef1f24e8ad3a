//! Temporary on-disk copy of the target configuration.
//!
//! The controller and the caller share one slot holding the temp file; whichever
//! side cleans up first removes the file and later attempts are no-ops.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempPath;

use crate::LifecycleError;

#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
    slot: Arc<Mutex<Option<TempPath>>>,
}

impl ConfigFile {
    /// Writes `text` to a fresh temp file in `dir` (or the system temp dir).
    pub fn write(text: &str, dir: Option<&Path>) -> Result<Self, LifecycleError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("ct-target-").suffix(".yaml");
        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(LifecycleError::ConfigWrite)?;
        file.write_all(text.as_bytes())
            .and_then(|()| file.flush())
            .map_err(LifecycleError::ConfigWrite)?;
        let temp_path = file.into_temp_path();
        Ok(Self {
            path: temp_path.to_path_buf(),
            slot: Arc::new(Mutex::new(Some(temp_path))),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_present(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Removes the file. Returns `Ok(false)` when it was already removed.
    pub fn cleanup(&self) -> Result<bool, LifecycleError> {
        let Some(temp_path) = self.slot.lock().take() else {
            return Ok(false);
        };
        temp_path.close().map_err(LifecycleError::ConfigCleanup)?;
        tracing::debug!(path = %self.path.display(), "removed target config");
        Ok(true)
    }

    #[must_use]
    pub(crate) fn handle(&self) -> ConfigCleanup {
        ConfigCleanup {
            file: self.clone(),
        }
    }
}

/// Scoped cleanup for a prepared config; removes the file when dropped.
#[must_use = "dropping the handle removes the config file immediately"]
#[derive(Debug)]
pub struct ConfigCleanup {
    file: ConfigFile,
}

impl ConfigCleanup {
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn cleanup(self) -> Result<bool, LifecycleError> {
        self.file.cleanup()
    }
}

impl Drop for ConfigCleanup {
    fn drop(&mut self) {
        if let Err(err) = self.file.cleanup() {
            tracing::warn!(path = %self.file.path().display(), error = %err, "config cleanup failed");
        }
    }
}
