//! Consistency checks between the tracking table and the change files.

use tracing::info;

use crate::error::{MigrateError, Result};
use crate::loader::{ChangeLoader, ChangeRecord};
use crate::tracker::Tracker;

/// Cross-checks applied state against the migrations directory.
#[derive(Debug, Clone)]
pub struct Validator {
    tracker: Tracker,
    loader: ChangeLoader,
}

impl Validator {
    pub fn new(tracker: Tracker, loader: ChangeLoader) -> Self {
        Self { tracker, loader }
    }

    /// Fail if any applied change no longer has a file on disk.
    ///
    /// The file is the only record of what ran, so a missing one is treated
    /// as corruption and never repaired automatically.
    pub async fn validate_existing(&self) -> Result<()> {
        info!(dir = %self.loader.dir().display(), "Validating existing migrations");

        let applied = self.tracker.list_applied().await?;
        let on_disk = self.loader.names()?;

        let missing: Vec<String> = applied
            .iter()
            .filter(|name| !on_disk.contains(name.as_str()))
            .cloned()
            .collect();

        if !missing.is_empty() {
            return Err(MigrateError::Integrity { missing });
        }

        info!(count = applied.len(), "All applied migrations validated");
        Ok(())
    }

    /// The changes from `all` that are not yet applied, in input order.
    pub async fn select_pending(&self, all: Vec<ChangeRecord>) -> Result<Vec<ChangeRecord>> {
        let mut pending = Vec::new();
        for change in all {
            if !self.tracker.is_applied(&change.name).await? {
                pending.push(change);
            }
        }
        Ok(pending)
    }
}
