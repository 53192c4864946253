use crate::error::AppError;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_DB_FILENAME: &str = "seismo-stream.db";

/// Explicit path wins; otherwise the default file name in the working directory.
pub fn resolve_db_path(explicit: Option<PathBuf>) -> Result<PathBuf, AppError> {
    let path = explicit
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FILENAME));
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(path)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, AppError> {
    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(connect_options).await?;
    run_migrations(&pool).await?;
    info!(path = %path.display(), "preferences database ready");

    Ok(pool)
}

pub async fn initialize_pool(explicit: Option<PathBuf>) -> Result<SqlitePool, AppError> {
    let db_path = resolve_db_path(explicit)?;
    initialize_pool_from_path(&db_path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_db_path() -> PathBuf {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock should be after unix epoch")
            .as_nanos();

        std::env::temp_dir().join(format!("seismo-stream-{timestamp}.db"))
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db_path = unique_db_path();

        let pool = initialize_pool(Some(db_path.clone()))
            .await
            .expect("pool initialization should succeed");

        run_migrations(&pool)
            .await
            .expect("running migrations multiple times should succeed");

        let metadata_rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM app_metadata")
            .fetch_one(&pool)
            .await
            .expect("app_metadata table must exist and be queryable");
        assert_eq!(metadata_rows, 1);

        let preference_rows =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM stream_preferences")
                .fetch_one(&pool)
                .await
                .expect("stream_preferences table must exist");
        assert_eq!(preference_rows, 0);

        drop(pool);
        let _ = std::fs::remove_file(db_path);
    }

    #[test]
    fn resolves_default_path_when_unset() {
        let path = resolve_db_path(None).expect("default path should resolve");
        assert_eq!(path, PathBuf::from(DEFAULT_DB_FILENAME));

        let path = resolve_db_path(Some(PathBuf::new())).expect("empty path falls back");
        assert_eq!(path, PathBuf::from(DEFAULT_DB_FILENAME));
    }
}
