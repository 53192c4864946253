use crate::error::AppError;
use crate::stream::types::{
    normalize_window_seconds, SaveStreamPreferencesArgs, StreamPreferencesSnapshot,
    DEFAULT_WINDOW_SECONDS,
};
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

fn map_preferences_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<StreamPreferencesSnapshot, AppError> {
    let window_seconds: f64 = row.try_get("window_seconds")?;
    let updated_at_ms: i64 = row.try_get("updated_at_ms")?;

    // Rows written by hand or by an older build may fall outside the accepted range.
    let window_seconds = normalize_window_seconds(window_seconds).unwrap_or(DEFAULT_WINDOW_SECONDS);

    Ok(StreamPreferencesSnapshot {
        window_seconds,
        updated_at_ms,
    })
}

async fn ensure_stream_preferences_seed(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::query(
        "INSERT OR IGNORE INTO stream_preferences (id, window_seconds, updated_at_ms) VALUES (1, ?, ?)",
    )
    .bind(DEFAULT_WINDOW_SECONDS)
    .bind(now_unix_ms())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_stream_preferences(
    pool: &SqlitePool,
) -> Result<StreamPreferencesSnapshot, AppError> {
    ensure_stream_preferences_seed(pool).await?;

    let row = sqlx::query("SELECT window_seconds, updated_at_ms FROM stream_preferences WHERE id = 1")
        .fetch_one(pool)
        .await?;

    map_preferences_row(&row)
}

pub async fn save_stream_preferences(
    pool: &SqlitePool,
    args: SaveStreamPreferencesArgs,
) -> Result<StreamPreferencesSnapshot, AppError> {
    let normalized = args.normalize()?;

    sqlx::query(
        "INSERT INTO stream_preferences (id, window_seconds, updated_at_ms) VALUES (1, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET window_seconds=excluded.window_seconds, updated_at_ms=excluded.updated_at_ms",
    )
    .bind(normalized.window_seconds)
    .bind(now_unix_ms())
    .execute(pool)
    .await?;

    get_stream_preferences(pool).await
}
