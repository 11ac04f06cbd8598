//! Production slot state kept between runs

use crate::core::slot::DeploymentSlot;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// JSON file holding the last known production slot
#[derive(Debug, Clone)]
pub struct SlotStateStore {
    path: PathBuf,
}

impl SlotStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/<slot>.json`
    pub fn in_dir(dir: impl AsRef<Path>, slot: &str) -> Self {
        Self::new(dir.as_ref().join(format!("{}.json", slot)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<slot>.lock`, next to the state file
    pub fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Take the slot's writer lock. `None` when another process holds it.
    ///
    /// The lock file is removed when the returned guard drops. A lock left
    /// behind by a crashed process has to be removed by hand.
    pub fn try_lock(&self) -> Result<Option<SlotLock>> {
        let path = self.lock_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "pid={} at={}", std::process::id(), Utc::now().to_rfc3339())
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                debug!(path = %path.display(), "slot lock taken");
                Ok(Some(SlotLock { path }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to create {}", path.display())),
        }
    }

    /// Replace the current deployment of `slot` with the saved one. Another
    /// process may have released since `slot` was restored.
    pub fn refresh(&self, slot: &mut DeploymentSlot) -> Result<()> {
        let Some(mut saved) = self.load()? else {
            return Ok(());
        };
        match saved.take_current() {
            Some(current) => {
                if slot.current_version() != Some(current.version.as_str()) {
                    debug!(slot = %slot.name, version = %current.version, "slot changed on disk");
                }
                slot.replace_current(current);
            }
            None => {
                slot.take_current();
            }
        }
        Ok(())
    }

    /// Saved slot, if there is one
    pub fn load(&self) -> Result<Option<DeploymentSlot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read slot state {}", self.path.display()))?;
        let slot: DeploymentSlot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse slot state {}", self.path.display()))?;
        Ok(Some(slot.without_incoming()))
    }

    /// Configured slot with the saved current deployment carried over
    pub fn restore(&self, template: DeploymentSlot) -> Result<DeploymentSlot> {
        let mut slot = template;
        if let Some(mut saved) = self.load()? {
            if let Some(current) = saved.take_current() {
                debug!(slot = %slot.name, version = %current.version, "restored live deployment");
                slot.replace_current(current);
            }
        }
        Ok(slot)
    }

    pub fn save(&self, slot: &DeploymentSlot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(slot)?;

        // Atomic replace
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Held writer lock on a slot; released on drop
#[derive(Debug)]
pub struct SlotLock {
    path: PathBuf,
}

impl Drop for SlotLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove slot lock");
        }
    }
}
