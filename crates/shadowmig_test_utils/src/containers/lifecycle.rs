//! Container lifecycle: start, stop and health checks via docker compose.

use crate::config::{DbVersion, TestDbConfig};
use anyhow::{bail, Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

/// Default timeout for container startup
const CONTAINER_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Default interval between health check attempts
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Path to this crate's docker-compose.yml.
pub fn docker_compose_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("docker")
        .join("docker-compose.yml")
}

/// Check if Docker is available on the system.
pub fn is_docker_available() -> bool {
    Command::new("docker")
        .arg("info")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Run `docker compose` (v2), falling back to `docker-compose` (v1).
fn compose(args: &[&str]) -> Result<Output> {
    let compose_file = docker_compose_path();

    if let Ok(out) = Command::new("docker")
        .args(["compose", "-f"])
        .arg(&compose_file)
        .args(args)
        .output()
    {
        if out.status.success() {
            return Ok(out);
        }
    }

    Command::new("docker-compose")
        .arg("-f")
        .arg(&compose_file)
        .args(args)
        .output()
        .context("Failed to run docker compose")
}

/// Check if the container for `version` is running.
pub fn is_container_running(version: DbVersion) -> bool {
    compose(&["ps", "-q", version.service_name()])
        .map(|out| !out.stdout.is_empty())
        .unwrap_or(false)
}

/// Start the container for `version`.
pub fn start_container(version: DbVersion) -> Result<()> {
    let service = version.service_name();
    info!("Starting container: {}", service);

    let output = compose(&["up", "-d", service])?;
    if !output.status.success() {
        bail!(
            "Failed to start container {}: {}",
            service,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    Ok(())
}

/// Wait until the server for `version` accepts queries.
pub async fn wait_for_healthy(version: DbVersion) -> Result<()> {
    let port = version.port();
    info!("Waiting for {} to be healthy on port {}", version, port);

    let start = Instant::now();
    loop {
        let port_open = TcpStream::connect(("localhost", port)).await.is_ok();
        if port_open && accepts_queries(version).await {
            debug!("{} is healthy after {:?}", version, start.elapsed());
            return Ok(());
        }

        if start.elapsed() > CONTAINER_STARTUP_TIMEOUT {
            bail!(
                "Timeout waiting for {} to be healthy after {:?}",
                version,
                CONTAINER_STARTUP_TIMEOUT
            );
        }

        sleep(HEALTH_CHECK_INTERVAL).await;
    }
}

/// An open port is not enough: postgres listens before it finishes recovery.
async fn accepts_queries(version: DbVersion) -> bool {
    let conn_str = TestDbConfig::new(version).connection_string();

    let connected = timeout(
        Duration::from_secs(2),
        PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(1))
            .connect(&conn_str),
    )
    .await;

    match connected {
        Ok(Ok(pool)) => {
            let ok = sqlx::query("SELECT 1").fetch_one(&pool).await.is_ok();
            pool.close().await;
            ok
        }
        _ => false,
    }
}

/// Ensure the container for `version` is running and healthy.
pub async fn ensure_container_running(version: DbVersion) -> Result<()> {
    if !is_docker_available() {
        bail!("Docker is not available. Install Docker or set SHADOWMIG_TEST_DATABASE_URL.");
    }

    if !is_container_running(version) {
        start_container(version)?;
    }

    wait_for_healthy(version).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_compose_path() {
        let path = docker_compose_path();
        assert!(path.ends_with("docker/docker-compose.yml"));
        assert!(path.exists());
    }
}
