//! End-to-end migration workflow.

use serde::Serialize;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::MigratorConfig;
use crate::error::{MigrateError, Result};
use crate::loader::{ChangeLoader, ChangeRecord};
use crate::shadow::ShadowTester;
use crate::tracker::{AppliedEntry, Tracker};
use crate::validator::Validator;

/// What happened to shadow testing during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ShadowOutcome {
    /// Nothing was pending
    NotNeeded,
    /// Pending changes went to production untested
    Skipped { reason: String },
    /// Every pending change succeeded on the shadow
    Passed { tested: usize },
}

/// Result of a successful [`Migrator::migrate`] run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrateReport {
    /// Changes applied to production by this run, in order
    pub applied: Vec<String>,
    pub shadow: ShadowOutcome,
}

/// Applies pending changes to one database, shadow-testing them first.
#[derive(Debug, Clone)]
pub struct Migrator {
    config: MigratorConfig,
    tracker: Tracker,
    loader: ChangeLoader,
    validator: Validator,
    shadow: Option<ShadowTester>,
}

impl Migrator {
    /// Create a migrator over a live pool.
    ///
    /// Shadow testing is set up when the config carries a database URL and
    /// does not skip it. No connection is made here.
    pub fn new(pool: PgPool, config: MigratorConfig) -> Result<Self> {
        config.validate()?;

        let tracker = Tracker::with_table(pool.clone(), &config.tracking_table)?;
        let loader = ChangeLoader::new(&config.migrations_path);
        let validator = Validator::new(tracker.clone(), loader.clone());

        let shadow = if config.shadow_enabled() {
            Some(ShadowTester::new(pool, &config)?)
        } else {
            None
        };

        Ok(Self {
            config,
            tracker,
            loader,
            validator,
            shadow,
        })
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Whether pending changes will be shadow-tested.
    pub fn shadow_enabled(&self) -> bool {
        self.shadow.is_some()
    }

    /// Run the full workflow. See [`Self::migrate_with_cancel`].
    pub async fn migrate(&self) -> Result<MigrateReport> {
        self.migrate_with_cancel(&CancellationToken::new()).await
    }

    /// Run the full workflow:
    ///
    /// 1. Ensure the tracking table exists
    /// 2. Validate that every applied change still has its file
    /// 3. Load the change set
    /// 4. Select pending changes
    /// 5. Take the shadow lock, reselect pending changes, and test them on
    ///    the shadow database
    /// 6. Apply pending changes to production, one transaction each
    /// 7. Drop any leftover shadow database
    ///
    /// The first failure stops the run; later changes are not attempted.
    /// Cancelling `cancel` aborts between or during steps 5 and 6 with
    /// [`MigrateError::Cancelled`]; step 7 still runs.
    pub async fn migrate_with_cancel(&self, cancel: &CancellationToken) -> Result<MigrateReport> {
        self.tracker.ensure_schema().await?;
        self.validator.validate_existing().await?;

        let changes = self.loader.load_all()?;
        let pending = self.validator.select_pending(changes.clone()).await?;

        let result = self.test_and_apply(&changes, pending, cancel).await;
        self.final_cleanup().await;

        let report = result?;
        if report.applied.is_empty() {
            info!("All migrations are already applied");
        } else {
            info!(count = report.applied.len(), "Applied migrations successfully");
        }
        Ok(report)
    }

    async fn test_and_apply(
        &self,
        changes: &[ChangeRecord],
        pending: Vec<ChangeRecord>,
        cancel: &CancellationToken,
    ) -> Result<MigrateReport> {
        let (shadow, pending) = self.preflight(changes, pending, cancel).await?;
        let applied = self.apply_pending(&pending, cancel).await?;
        Ok(MigrateReport { applied, shadow })
    }

    /// Shadow-test `pending`. Returns the outcome and the changes that still
    /// need applying, which may be fewer than `pending` when another run
    /// applied some while this one waited for the shadow lock.
    async fn preflight(
        &self,
        changes: &[ChangeRecord],
        pending: Vec<ChangeRecord>,
        cancel: &CancellationToken,
    ) -> Result<(ShadowOutcome, Vec<ChangeRecord>)> {
        if pending.is_empty() {
            info!("No new migrations found, skipping shadow database test");
            return Ok((ShadowOutcome::NotNeeded, pending));
        }

        let Some(tester) = &self.shadow else {
            let reason = if self.config.skip_shadow_db {
                "shadow database testing disabled by configuration"
            } else {
                "no database URL configured for shadow database testing"
            };
            warn!(
                pending = pending.len(),
                reason, "Skipping shadow database test; applying directly to production"
            );
            let skipped = ShadowOutcome::Skipped {
                reason: reason.to_string(),
            };
            return Ok((skipped, pending));
        };

        let lock = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MigrateError::Cancelled),
            lock = tester.lock() => lock?,
        };

        let pending = match self.validator.select_pending(changes.to_vec()).await {
            Ok(pending) => pending,
            Err(e) => {
                lock.release().await;
                return Err(e);
            }
        };

        if pending.is_empty() {
            info!("Pending migrations were applied by another run");
            lock.release().await;
            return Ok((ShadowOutcome::NotNeeded, pending));
        }

        let tested = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MigrateError::Cancelled),
            tested = tester.test(lock, &self.tracker, changes, &pending) => tested,
        };
        tested?;

        let outcome = ShadowOutcome::Passed {
            tested: pending.len(),
        };
        Ok((outcome, pending))
    }

    async fn apply_pending(
        &self,
        pending: &[ChangeRecord],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        info!(count = pending.len(), "Applying migrations to production database");

        let mut applied = Vec::new();
        for change in pending {
            if cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }

            // A concurrent run may have applied it since pending was computed
            if self.tracker.is_applied(&change.name).await? {
                info!(migration = %change.name, "Already applied by another run, skipping");
                continue;
            }

            let timeout = self.config.apply_timeout;
            let attempt = self.tracker.apply_within(&change.name, &change.body, timeout);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(MigrateError::Cancelled),
                outcome = attempt => outcome?,
            }

            applied.push(change.name.clone());
        }

        Ok(applied)
    }

    async fn final_cleanup(&self) {
        let Some(tester) = &self.shadow else {
            return;
        };

        if let Err(e) = tester.ensure_cleanup().await {
            warn!(error = %e, "Final shadow database cleanup failed");
        }
    }

    /// Names of applied changes, oldest first.
    ///
    /// Creates the tracking table first, so this works on a new database.
    pub async fn applied_migrations(&self) -> Result<Vec<String>> {
        self.tracker.ensure_schema().await?;
        self.tracker.list_applied().await
    }

    /// Applied changes with timestamps, oldest first.
    pub async fn applied_entries(&self) -> Result<Vec<AppliedEntry>> {
        self.tracker.ensure_schema().await?;
        self.tracker.list_entries().await
    }

    /// Changes on disk that are not yet applied, in name order.
    pub async fn pending_migrations(&self) -> Result<Vec<ChangeRecord>> {
        self.tracker.ensure_schema().await?;
        let all = self.loader.load_all()?;
        self.validator.select_pending(all).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use std::time::Duration;

    fn lazy_pool() -> PgPool {
        PgPoolOptions::new()
            .connect_lazy("postgres://app@localhost:1/app")
            .unwrap()
    }

    #[tokio::test]
    async fn test_shadow_disabled_without_url() {
        let migrator = Migrator::new(lazy_pool(), MigratorConfig::new("migrations")).unwrap();
        assert!(!migrator.shadow_enabled());
    }

    #[tokio::test]
    async fn test_shadow_enabled_with_url() {
        let config = MigratorConfig::new("migrations")
            .with_database_url("postgres://app@localhost:1/app");
        let migrator = Migrator::new(lazy_pool(), config).unwrap();
        assert!(migrator.shadow_enabled());
    }

    #[tokio::test]
    async fn test_skip_overrides_url() {
        let config = MigratorConfig::new("migrations")
            .with_database_url("postgres://app@localhost:1/app")
            .with_skip_shadow_db(true);
        let migrator = Migrator::new(lazy_pool(), config).unwrap();
        assert!(!migrator.shadow_enabled());
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = MigratorConfig::new("migrations").with_apply_timeout(Duration::ZERO);
        assert!(matches!(
            Migrator::new(lazy_pool(), config),
            Err(MigrateError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_report_serializes_with_status_tag() {
        let report = MigrateReport {
            applied: vec!["001_users.sql".to_string()],
            shadow: ShadowOutcome::Passed { tested: 1 },
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["applied"][0], "001_users.sql");
        assert_eq!(json["shadow"]["status"], "passed");
        assert_eq!(json["shadow"]["tested"], 1);

        let skipped = serde_json::to_value(ShadowOutcome::Skipped {
            reason: "no url".to_string(),
        })
        .unwrap();
        assert_eq!(skipped["status"], "skipped");
    }
}
