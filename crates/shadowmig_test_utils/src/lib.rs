//! shadowmig Test Utilities
//!
//! Docker-based PostgreSQL test infrastructure.
//!
//! # Features
//!
//! - `docker-tests`: Enable tests that require a PostgreSQL server
//!
//! Set `SHADOWMIG_TEST_DATABASE_URL` to use an existing server instead of the
//! docker-compose containers. The role needs `CREATEDB`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use shadowmig_test_utils::{DbVersion, MigrationsDir, TestDatabase, TestPgServer};
//!
//! #[tokio::test]
//! #[cfg(feature = "docker-tests")]
//! async fn test_migrate() {
//!     let server = TestPgServer::new(DbVersion::Postgres16).await.unwrap();
//!     let db = TestDatabase::create(&server).await.unwrap();
//!     let dir = MigrationsDir::new().unwrap();
//!     dir.write("001_users.sql", "CREATE TABLE users (id INT)").unwrap();
//!
//!     // ... run the migrator against db.pool() / db.url()
//!
//!     db.cleanup().await.unwrap();
//! }
//! ```

pub mod cleanup;
pub mod config;
pub mod containers;
pub mod migrations;
pub mod pools;

// Re-exports for convenience
pub use cleanup::TestDatabase;
pub use config::{DbVersion, TestDbConfig, TEST_DATABASE_URL_ENV};
pub use containers::lifecycle::{ensure_container_running, wait_for_healthy};
pub use migrations::MigrationsDir;
pub use pools::postgres::TestPgServer;

#[doc(hidden)]
pub use paste;
