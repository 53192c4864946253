use crate::error::AppError;
use crate::state::AppState;
use crate::stream::persistence::{get_stream_preferences, save_stream_preferences};
use crate::stream::types::{SaveStreamPreferencesArgs, StreamPreferencesSnapshot};

pub async fn preferences_get(state: &AppState) -> Result<StreamPreferencesSnapshot, AppError> {
    get_stream_preferences(&state.db_pool).await
}

pub async fn preferences_save(
    state: &AppState,
    args: SaveStreamPreferencesArgs,
) -> Result<StreamPreferencesSnapshot, AppError> {
    save_stream_preferences(&state.db_pool, args).await
}
