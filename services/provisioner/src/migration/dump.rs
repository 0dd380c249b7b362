//! Logical copy of one database into another.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::MigrationError;

/// Upper bound for a whole dump/restore run.
pub const DEFAULT_COPY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Captured stderr per process.
const MAX_STDERR_BYTES: u64 = 1024 * 1024;

/// Copies schema and data between two Postgres databases.
#[async_trait]
pub trait DataMigrator: Send + Sync {
    async fn migrate(&self, source_url: &str, target_url: &str) -> Result<(), MigrationError>;
}

/// `pg_dump | pg_restore` pipeline.
#[derive(Debug, Clone)]
pub struct PgDumpRestore {
    pg_dump: String,
    pg_restore: String,
    timeout: Duration,
}

impl Default for PgDumpRestore {
    fn default() -> Self {
        Self::new(DEFAULT_COPY_TIMEOUT)
    }
}

impl PgDumpRestore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pg_dump: "pg_dump".to_string(),
            pg_restore: "pg_restore".to_string(),
            timeout,
        }
    }

    /// Use other executables, for example absolute paths.
    pub fn with_programs(mut self, pg_dump: impl Into<String>, pg_restore: impl Into<String>) -> Self {
        self.pg_dump = pg_dump.into();
        self.pg_restore = pg_restore.into();
        self
    }

    async fn run(&self, source_url: &str, target_url: &str) -> Result<(), MigrationError> {
        let mut dump = Command::new(&self.pg_dump)
            .args(["--format=custom", "--no-owner", "--no-acl", "--dbname"])
            .arg(source_url)
            .env("PGCONNECT_TIMEOUT", "30")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let dump_stdout = dump
            .stdout
            .take()
            .ok_or_else(|| MigrationError::DataMigration("pg_dump stdout unavailable".to_string()))?;
        let restore_stdin: Stdio = dump_stdout.try_into()?;

        let mut restore = Command::new(&self.pg_restore)
            .args(["--no-owner", "--no-acl", "--clean", "--if-exists", "--dbname"])
            .arg(target_url)
            .env("PGCONNECT_TIMEOUT", "30")
            .stdin(restore_stdin)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let dump_stderr = tokio::spawn(read_stream(dump.stderr.take()));
        let restore_stderr = tokio::spawn(read_stream(restore.stderr.take()));

        let (dump_status, restore_status) = tokio::try_join!(dump.wait(), restore.wait())?;
        let dump_stderr = dump_stderr.await.unwrap_or_default();
        let restore_stderr = restore_stderr.await.unwrap_or_default();

        if !dump_status.success() {
            return Err(MigrationError::DataMigration(format!(
                "pg_dump exited with {dump_status}: {}",
                dump_stderr.trim()
            )));
        }

        if !restore_status.success() {
            if restore_failed(&restore_stderr) {
                return Err(MigrationError::DataMigration(format!(
                    "pg_restore exited with {restore_status}: {}",
                    restore_stderr.trim()
                )));
            }
            warn!(status = %restore_status, "pg_restore finished with warnings only");
        }

        Ok(())
    }
}

#[async_trait]
impl DataMigrator for PgDumpRestore {
    async fn migrate(&self, source_url: &str, target_url: &str) -> Result<(), MigrationError> {
        info!(timeout = ?self.timeout, "Copying database");
        match tokio::time::timeout(self.timeout, self.run(source_url, target_url)).await {
            Ok(result) => result,
            // Dropping the children kills them.
            Err(_) => Err(MigrationError::DataMigration(format!(
                "dump/restore timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

/// Whether pg_restore stderr reports anything besides warnings.
///
/// pg_restore exits non-zero for ignorable problems such as missing roles;
/// only non-warning output marks a real failure.
pub fn restore_failed(stderr: &str) -> bool {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .any(|line| !line.starts_with("pg_restore: warning"))
}

async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        if let Err(e) = (&mut h).take(MAX_STDERR_BYTES).read_to_end(&mut buf).await {
            debug!(error = %e, "Failed to read process output");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Migrator that copies nothing, for development against the mock provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMigrator;

#[async_trait]
impl DataMigrator for NoopMigrator {
    async fn migrate(&self, _source_url: &str, _target_url: &str) -> Result<(), MigrationError> {
        warn!("Skipping data copy");
        Ok(())
    }
}
