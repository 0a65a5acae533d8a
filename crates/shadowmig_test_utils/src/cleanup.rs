//! Per-test database isolation.

use crate::pools::postgres::TestPgServer;
use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// RAII guard for a uniquely named test database.
///
/// Shadow testing creates and drops whole databases, so tests cannot share
/// one database the way schema-level isolation would. Each test gets its own
/// database; cleanup drops it together with any database whose name it
/// prefixes (the shadow derived from it).
///
/// # Example
///
/// ```rust,ignore
/// use shadowmig_test_utils::{DbVersion, TestDatabase, TestPgServer};
///
/// #[tokio::test]
/// async fn test_isolated() {
///     let server = TestPgServer::new(DbVersion::Postgres16).await.unwrap();
///     let db = TestDatabase::create(&server).await.unwrap();
///
///     db.execute("CREATE TABLE output (id INT)").await.unwrap();
///     assert!(db.table_exists("output").await.unwrap());
///
///     db.cleanup().await.unwrap();
/// }
/// ```
pub struct TestDatabase {
    server: PgPool,
    pool: PgPool,
    name: String,
    url: String,
    cleaned: bool,
}

impl TestDatabase {
    /// Create a fresh database named `shadowmig_test_<16 hex chars>`.
    ///
    /// Kept short so derived names (the shadow suffix) stay within
    /// PostgreSQL's 63-byte identifier limit.
    pub async fn create(server: &TestPgServer) -> Result<Self> {
        let id = Uuid::new_v4().simple().to_string();
        let name = format!("shadowmig_test_{}", &id[..16]);
        debug!("Creating test database: {}", name);

        sqlx::raw_sql(&format!("CREATE DATABASE {}", name))
            .execute(&server.pool)
            .await?;

        let url = server.url_for(&name)?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&url)
            .await?;

        Ok(Self {
            server: server.pool.clone(),
            pool,
            name,
            url,
            cleaned: false,
        })
    }

    /// Pool on the test database.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection URL of the test database.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Execute statements on the test database.
    pub async fn execute(&self, sql: &str) -> Result<()> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Whether `table` exists in the public schema.
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = 'public' AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Row count of `table`.
    pub async fn count_rows(&self, table: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{}\"", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Names of databases on the server derived from this one (e.g. a
    /// leftover shadow).
    pub async fn derived_databases(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT datname::text FROM pg_database WHERE datname LIKE $1 AND datname <> $2",
        )
        .bind(format!("{}%", self.name))
        .bind(&self.name)
        .fetch_all(&self.server)
        .await?;
        Ok(names)
    }

    /// Drop the test database and everything derived from it.
    ///
    /// Called automatically on Drop, but calling it explicitly at the end of
    /// a test guarantees it runs before the runtime shuts down.
    pub async fn cleanup(mut self) -> Result<()> {
        self.cleaned = true;
        self.pool.close().await;
        drop_with_prefix(&self.server, &self.name).await
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }

        let server = self.server.clone();
        let pool = self.pool.clone();
        let name = self.name.clone();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                pool.close().await;
                if let Err(e) = drop_with_prefix(&server, &name).await {
                    warn!("Failed to drop test database {}: {}", name, e);
                }
            });
        } else {
            warn!(
                "Not in async context, cannot drop test database: {}",
                self.name
            );
        }
    }
}

async fn drop_with_prefix(server: &PgPool, prefix: &str) -> Result<()> {
    let names: Vec<String> =
        sqlx::query_scalar("SELECT datname::text FROM pg_database WHERE datname LIKE $1")
            .bind(format!("{}%", prefix))
            .fetch_all(server)
            .await?;

    for name in names {
        sqlx::query(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(&name)
        .execute(server)
        .await?;

        sqlx::raw_sql(&format!("DROP DATABASE IF EXISTS \"{}\"", name))
            .execute(server)
            .await?;
        debug!("Dropped test database: {}", name);
    }

    Ok(())
}
