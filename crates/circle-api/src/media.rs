use axum::{
    Extension, Json,
    extract::{Path, State, rejection::PathRejection},
    response::IntoResponse,
};
use uuid::Uuid;

use circle_db::{Database, posts};
use circle_types::api::{ApiResponse, Claims};
use circle_types::models::Media;

use crate::error::{ApiError, ApiResult};
use crate::graph::ensure_active;
use crate::state::{AppState, blocking};

pub fn media_of_user(db: &Database, user_id: Uuid) -> ApiResult<Vec<Media>> {
    db.with_conn(|conn| {
        ensure_active(conn, user_id)?;
        Ok(posts::media_for_user(conn, user_id)?)
    })
}

pub fn find_media(db: &Database, media_id: Uuid) -> ApiResult<Media> {
    db.with_conn(|conn| posts::find_media(conn, media_id))?
        .ok_or_else(|| ApiError::not_found("Media not found"))
}

pub async fn by_user(
    State(state): State<AppState>,
    Extension(_claims): Extension<Claims>,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(user_id) = path?;
    let media = blocking(move || media_of_user(&state.db, user_id)).await?;
    Ok(Json(ApiResponse::ok(media)))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(_claims): Extension<Claims>,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(media_id) = path?;
    let media = blocking(move || find_media(&state.db, media_id)).await?;
    Ok(Json(ApiResponse::ok(media)))
}
