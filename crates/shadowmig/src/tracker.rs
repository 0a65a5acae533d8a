//! Applied-state tracking table.
//!
//! One row per applied change. Rows are only ever inserted, inside the same
//! transaction as the change script (see [`Tracker::apply`]), so a row exists
//! if and only if the script's effects were committed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_TRACKING_TABLE, MAX_APPLY_TIMEOUT};
use crate::error::{is_query_canceled, is_unique_violation, MigrateError, Result};
use crate::ident::quote_identifier;

/// Extra time the client waits past a server-side statement timeout before
/// abandoning the transaction itself.
const CLIENT_GRACE: Duration = Duration::from_secs(5);

/// A recorded change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct AppliedEntry {
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// Tracks which changes have been applied to one database.
#[derive(Debug, Clone)]
pub struct Tracker {
    pool: PgPool,
    table: String,
    quoted_table: String,
}

impl Tracker {
    /// Tracker using the default table name.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: DEFAULT_TRACKING_TABLE.to_string(),
            quoted_table: format!("\"{}\"", DEFAULT_TRACKING_TABLE),
        }
    }

    /// Tracker using a custom table name.
    pub fn with_table(pool: PgPool, table: &str) -> Result<Self> {
        let quoted_table = quote_identifier(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            quoted_table,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Create the tracking table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            self.quoted_table
        );

        match sqlx::query(&sql).execute(&self.pool).await {
            Ok(_) => Ok(()),
            // IF NOT EXISTS is not atomic: a concurrent creator wins the
            // catalog insert and we see a duplicate pg_type row instead.
            Err(e) if is_unique_violation(&e) => {
                debug!(table = %self.table, "Tracking table created concurrently");
                Ok(())
            }
            Err(e) => Err(MigrateError::Schema(e)),
        }
    }

    /// Whether `name` has been recorded.
    pub async fn is_applied(&self, name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE name = $1)",
            self.quoted_table
        );

        sqlx::query_scalar::<_, bool>(&sql)
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MigrateError::query(format!("checking status of {}", name), e))
    }

    /// Record `name` as applied at the current server time.
    ///
    /// Does not run any script; callers must have checked [`Self::is_applied`].
    pub async fn record(&self, name: &str) -> Result<()> {
        let sql = format!("INSERT INTO {} (name) VALUES ($1)", self.quoted_table);

        sqlx::query(&sql)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| insert_error(name, e))?;

        Ok(())
    }

    /// Applied change names, oldest first.
    pub async fn list_applied(&self) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT name FROM {} ORDER BY applied_at, id",
            self.quoted_table
        );

        sqlx::query_scalar::<_, String>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MigrateError::query("listing applied migrations", e))
    }

    /// Applied changes with their timestamps, oldest first.
    pub async fn list_entries(&self) -> Result<Vec<AppliedEntry>> {
        let sql = format!(
            "SELECT name, applied_at FROM {} ORDER BY applied_at, id",
            self.quoted_table
        );

        sqlx::query_as::<_, AppliedEntry>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MigrateError::query("listing applied migrations", e))
    }

    /// Run `body` and record `name` in one READ COMMITTED transaction.
    ///
    /// Either both the script effects and the row are committed, or neither
    /// is. When two callers race on the same name the unique constraint
    /// decides: the loser rolls back and gets [`MigrateError::Constraint`].
    pub async fn apply(&self, name: &str, body: &str) -> Result<()> {
        self.apply_inner(name, body, None).await
    }

    /// [`Self::apply`] bounded by `deadline`.
    ///
    /// The deadline is enforced by the server through `statement_timeout`
    /// (scoped to the transaction, capped at [`MAX_APPLY_TIMEOUT`]) and, as a
    /// backstop, on the client. Either way the transaction rolls back and
    /// [`MigrateError::Timeout`] is returned.
    pub async fn apply_within(&self, name: &str, body: &str, deadline: Duration) -> Result<()> {
        let attempt = self.apply_inner(name, body, Some(deadline));
        match tokio::time::timeout(deadline.saturating_add(CLIENT_GRACE), attempt).await {
            Ok(result) => result,
            Err(_) => Err(MigrateError::Timeout {
                name: name.to_string(),
                after: deadline,
            }),
        }
    }

    async fn apply_inner(&self, name: &str, body: &str, deadline: Option<Duration>) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MigrateError::query(format!("beginning transaction for {}", name), e))?;

        if let Err(e) = sqlx::raw_sql("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await
        {
            rollback(tx, name).await;
            return Err(MigrateError::query(
                format!("setting isolation level for {}", name),
                e,
            ));
        }

        if let Some(deadline) = deadline {
            let millis = deadline.min(MAX_APPLY_TIMEOUT).as_millis().max(1);
            let sql = format!("SET LOCAL statement_timeout = {}", millis);
            if let Err(e) = sqlx::raw_sql(&sql).execute(&mut *tx).await {
                rollback(tx, name).await;
                return Err(MigrateError::query(
                    format!("setting statement timeout for {}", name),
                    e,
                ));
            }
        }

        if body.trim().is_empty() {
            warn!(migration = %name, "Migration body is empty, recording only");
        } else if let Err(e) = sqlx::raw_sql(body).execute(&mut *tx).await {
            rollback(tx, name).await;
            return Err(match deadline {
                Some(after) if is_query_canceled(&e) => MigrateError::Timeout {
                    name: name.to_string(),
                    after,
                },
                _ => MigrateError::Execute {
                    name: name.to_string(),
                    source: e,
                },
            });
        }

        let sql = format!("INSERT INTO {} (name) VALUES ($1)", self.quoted_table);
        if let Err(e) = sqlx::query(&sql).bind(name).execute(&mut *tx).await {
            rollback(tx, name).await;
            return Err(insert_error(name, e));
        }

        tx.commit()
            .await
            .map_err(|e| MigrateError::query(format!("committing {}", name), e))?;

        info!(migration = %name, table = %self.table, "Applied migration");
        Ok(())
    }
}

fn insert_error(name: &str, e: sqlx::Error) -> MigrateError {
    if is_unique_violation(&e) {
        MigrateError::Constraint {
            name: name.to_string(),
            source: e,
        }
    } else {
        MigrateError::query(format!("recording {}", name), e)
    }
}

async fn rollback(tx: Transaction<'_, Postgres>, name: &str) {
    if let Err(e) = tx.rollback().await {
        warn!(migration = %name, error = %e, "Failed to roll back transaction");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    // connect_lazy never touches the network, so these run without a server.
    fn lazy_pool() -> PgPool {
        PgPoolOptions::new()
            .connect_lazy("postgres://app@localhost:1/app")
            .unwrap()
    }

    #[tokio::test]
    async fn test_default_table_name() {
        let tracker = Tracker::new(lazy_pool());
        assert_eq!(tracker.table_name(), "_shadowmig_migrations");
    }

    #[tokio::test]
    async fn test_with_table_rejects_unsafe_names() {
        assert!(Tracker::with_table(lazy_pool(), "schema_history").is_ok());
        assert!(matches!(
            Tracker::with_table(lazy_pool(), "x; DROP TABLE users"),
            Err(MigrateError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_within_huge_deadline_does_not_overflow() {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgres://app@localhost:1/app")
            .unwrap();
        let tracker = Tracker::new(pool);

        let err = tracker
            .apply_within("001_a.sql", "SELECT 1;", Duration::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Query { .. }));
    }

    #[test]
    fn test_insert_error_classification() {
        let err = insert_error("001_a.sql", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, MigrateError::Query { .. }));
        assert!(!err.is_concurrent_apply());
    }
}
