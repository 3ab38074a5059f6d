use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info, warn};

use shared::config::server::DatabaseConfig;

/// Script folders under the bootstrap root, applied in this order.
const STAGES: &[ScriptStage] = &[ScriptStage::Schema, ScriptStage::Indexes];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptStage {
    Schema,
    Indexes,
}

impl ScriptStage {
    fn folder(self) -> &'static str {
        match self {
            ScriptStage::Schema => "schema",
            ScriptStage::Indexes => "indexes",
        }
    }
}

impl std::fmt::Display for ScriptStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.folder())
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database bootstrap directory does not exist: {0}")]
    MissingRoot(PathBuf),
    #[error("database bootstrap stage '{stage}' missing at {path}")]
    MissingStage { stage: &'static str, path: PathBuf },
    #[error("failed to read directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database error executing {path}: {source}")]
    Sql {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
}

/// Applies the chat log schema and its indexes.
///
/// Every script is idempotent, so this runs on each start.
pub async fn run(pool: &PgPool, config: &DatabaseConfig) -> Result<(), BootstrapError> {
    let root = &config.bootstrap_path;
    if !root.exists() {
        return Err(BootstrapError::MissingRoot(root.clone()));
    }

    info!(path = %root.display(), "running database bootstrap");

    for stage in STAGES {
        let stage_path = root.join(stage.folder());
        if !stage_path.exists() {
            return Err(BootstrapError::MissingStage {
                stage: stage.folder(),
                path: stage_path,
            });
        }

        let files = collect_sql_files(&stage_path)?;
        if files.is_empty() {
            debug!(stage = %stage, "no bootstrap scripts found for stage");
            continue;
        }

        info!(stage = %stage, count = files.len(), "applying bootstrap scripts");
        for path in files {
            apply_script(pool, &path).await?;
        }
    }

    Ok(())
}

pub async fn ensure_liveness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

/// Ready once the chat log tables exist.
pub async fn ensure_readiness(pool: &PgPool) -> Result<(), sqlx::Error> {
    let present: bool = sqlx::query_scalar(
        "SELECT to_regclass('public.chat_logs') IS NOT NULL \
         AND to_regclass('public.chat_log_entries') IS NOT NULL",
    )
    .fetch_one(pool)
    .await?;

    if present {
        Ok(())
    } else {
        Err(sqlx::Error::Protocol("chat log tables are missing".into()))
    }
}

fn collect_sql_files(dir: &Path) -> Result<Vec<PathBuf>, BootstrapError> {
    let read_dir = fs::read_dir(dir).map_err(|source| BootstrapError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::new();
    for entry in read_dir {
        let path = entry
            .map_err(|source| BootstrapError::ReadDir {
                path: dir.to_path_buf(),
                source,
            })?
            .path();
        if path
            .extension()
            .and_then(OsStr::to_str)
            .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"))
        {
            entries.push(path);
        }
    }

    entries.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(entries)
}

async fn apply_script(pool: &PgPool, path: &Path) -> Result<(), BootstrapError> {
    let sql = fs::read_to_string(path).map_err(|source| BootstrapError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;

    let trimmed = sql.trim();
    if trimmed.is_empty() {
        warn!(path = %path.display(), "skipping empty bootstrap script");
        return Ok(());
    }

    let sql_error = |source| BootstrapError::Sql {
        path: path.to_path_buf(),
        source,
    };

    let mut transaction = pool.begin().await.map_err(sql_error)?;
    info!(script = %path.display(), "executing bootstrap script");
    sqlx::raw_sql(trimmed)
        .execute(&mut *transaction)
        .await
        .map_err(sql_error)?;
    transaction.commit().await.map_err(sql_error)
}
