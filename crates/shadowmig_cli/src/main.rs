//! shadowmig command-line front end.
//!
//! Reads its settings from flags or the environment (`DATABASE_URL`,
//! `MIGRATIONS_PATH`, `SHADOWMIG_SKIP_SHADOW`, `SHADOWMIG_APPLY_TIMEOUT_SECS`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shadowmig::{CancellationToken, Migrator, MigratorConfig, DEFAULT_MIGRATIONS_PATH};
use shadowmig_logging::{init_logging, LogConfig};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

mod output;

/// Connections for the production pool; the migrator uses one at a time.
const POOL_MAX_CONNECTIONS: u32 = 5;
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(
    name = "shadowmig",
    version,
    about = "Apply SQL migrations after testing them on a shadow database"
)]
struct Cli {
    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Also write daily-rolling log files to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// PostgreSQL connection URL; also used to create the shadow database
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Directory containing the *.sql change files
    #[arg(long, env = "MIGRATIONS_PATH", global = true, default_value = DEFAULT_MIGRATIONS_PATH)]
    migrations_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Test pending changes on a shadow database, then apply them
    Migrate {
        /// Apply directly without shadow testing
        #[arg(long, env = "SHADOWMIG_SKIP_SHADOW")]
        no_shadow: bool,

        /// Per-change time limit in seconds
        #[arg(long, env = "SHADOWMIG_APPLY_TIMEOUT_SECS")]
        apply_timeout_secs: Option<u64>,

        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List applied changes with their timestamps
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List changes on disk that are not applied yet
    Pending {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    fn config(&self) -> MigratorConfig {
        let mut config = MigratorConfig::new(&self.migrations_path);
        if let Some(url) = &self.database_url {
            config = config.with_database_url(url.clone());
        }

        if let Commands::Migrate {
            no_shadow,
            apply_timeout_secs,
            ..
        } = &self.command
        {
            config = config.with_skip_shadow_db(*no_shadow);
            if let Some(secs) = apply_timeout_secs {
                config = config.with_apply_timeout(Duration::from_secs(*secs));
            }
        }

        config
    }

    fn json(&self) -> bool {
        match self.command {
            Commands::Migrate { json, .. }
            | Commands::Status { json }
            | Commands::Pending { json } => json,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match init_logging(LogConfig {
        app_name: "shadowmig",
        verbose: cli.verbose,
        quiet: cli.quiet,
        log_dir: cli.log_dir.clone(),
    }) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Warning: failed to initialize logging: {:#}", err);
            None
        }
    };

    let json_mode = cli.json();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if json_mode {
                output::print_json_error(&err);
            } else {
                eprintln!("Error: {:#}", err);
            }
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    rt.block_on(async {
        let config = cli.config();
        let url = cli
            .database_url
            .as_deref()
            .context("DATABASE_URL is not set (use --database-url or the DATABASE_URL env var)")?;
        let pool = connect(url).await?;
        let migrator = Migrator::new(pool.clone(), config)?;

        let result = match cli.command {
            Commands::Migrate { json, .. } => run_migrate(&migrator, json).await,
            Commands::Status { json } => run_status(&migrator, json).await,
            Commands::Pending { json } => run_pending(&migrator, json).await,
        };

        pool.close().await;
        result
    })
}

async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(POOL_MAX_CONNECTIONS)
        .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
        .connect(url)
        .await
        .context("Failed to connect to the database")
}

async fn run_migrate(migrator: &Migrator, json: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling migration");
            on_signal.cancel();
        }
    });

    let result = migrator.migrate_with_cancel(&cancel).await;
    signal_task.abort();

    let report = result?;
    info!(applied = report.applied.len(), "Migration run finished");
    output::print_report(&report, json)
}

async fn run_status(migrator: &Migrator, json: bool) -> Result<()> {
    let entries = migrator.applied_entries().await?;
    output::print_status(&entries, json)
}

async fn run_pending(migrator: &Migrator, json: bool) -> Result<()> {
    let pending = migrator.pending_migrations().await?;
    let names: Vec<String> = pending.into_iter().map(|c| c.name).collect();
    output::print_pending(&names, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_migrate_flags_reach_config() {
        let cli = parse(&[
            "shadowmig",
            "--database-url",
            "postgres://u:p@localhost/app",
            "--migrations-path",
            "db/changes",
            "migrate",
            "--no-shadow",
            "--apply-timeout-secs",
            "42",
        ]);

        let config = cli.config();
        assert_eq!(config.migrations_path, PathBuf::from("db/changes"));
        assert!(config.skip_shadow_db);
        assert!(!config.shadow_enabled());
        assert_eq!(config.apply_timeout, Duration::from_secs(42));
        assert!(!cli.json());
    }

    #[test]
    fn test_url_enables_shadow_testing() {
        let cli = parse(&[
            "shadowmig",
            "--database-url",
            "postgres://u:p@localhost/app",
            "migrate",
        ]);

        assert!(cli.config().shadow_enabled());
    }

    #[test]
    fn test_read_only_commands_keep_shadow_default() {
        let cli = parse(&[
            "shadowmig",
            "--database-url",
            "postgres://u:p@localhost/app",
            "status",
            "--json",
        ]);

        assert!(cli.json());
        assert!(!cli.config().skip_shadow_db);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = parse(&["shadowmig", "pending", "-v", "--log-dir", "/tmp/logs"]);

        assert!(cli.verbose);
        assert_eq!(cli.log_dir, Some(PathBuf::from("/tmp/logs")));
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["shadowmig", "-v", "-q", "status"]).is_err());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["shadowmig"]).is_err());
    }
}
