use axum::{
    Extension, Json,
    extract::{
        Path, State,
        rejection::{JsonRejection, PathRejection},
    },
    response::IntoResponse,
};
use rusqlite::Connection;
use tracing::info;
use uuid::Uuid;

use circle_db::{Database, users};
use circle_types::api::{ApiResponse, Claims, UpdateUserRequest};
use circle_types::models::UserProfile;

use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, blocking};

fn load_profile(conn: &Connection, user_id: Uuid) -> ApiResult<UserProfile> {
    let user = users::find_user(conn, user_id)?
        .filter(|u| !u.is_deleted)
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    let roles = users::populate_roles(conn, users::role_refs(conn, user.id)?)?;

    Ok(UserProfile {
        id: user.id,
        username: user.username,
        display_name: user.display_name,
        email: user.email,
        avatar_url: user.avatar_url,
        roles,
        created_at: user.created_at,
    })
}

pub fn get_profile(db: &Database, user_id: Uuid) -> ApiResult<UserProfile> {
    db.with_conn(|conn| load_profile(conn, user_id))
}

pub fn update_profile(
    db: &Database,
    actor: Uuid,
    user_id: Uuid,
    req: UpdateUserRequest,
) -> ApiResult<UserProfile> {
    if actor != user_id {
        return Err(ApiError::forbidden("You can only edit your own profile"));
    }

    let display_name = req.display_name.as_deref().map(str::trim);
    if display_name.is_some_and(|name| name.is_empty() || name.chars().count() > 100) {
        return Err(ApiError::validation("Display name must be 1 to 100 characters"));
    }
    let avatar_url = req.avatar_url.as_deref().map(str::trim);

    let profile = db.with_conn(|conn| {
        if !users::update_profile(conn, user_id, display_name, avatar_url)? {
            return Err(ApiError::not_found("User not found"));
        }
        load_profile(conn, user_id)
    })?;

    info!("{} updated their profile", user_id);
    Ok(profile)
}

pub async fn get(
    State(state): State<AppState>,
    Extension(_claims): Extension<Claims>,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(user_id) = path?;
    let profile = blocking(move || get_profile(&state.db, user_id)).await?;
    Ok(Json(ApiResponse::ok(profile)))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(user_id) = path?;
    let Json(req) = payload?;
    let profile = blocking(move || update_profile(&state.db, claims.sub, user_id, req)).await?;
    Ok(Json(ApiResponse::ok_with_message("Profile updated", profile)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use circle_types::models::RoleRef;

    #[test]
    fn test_profile_has_expanded_roles() {
        let db = Database::open_in_memory().unwrap();
        let id = test_support::user(&db, "alice");
        db.with_conn(|conn| {
            let role = users::find_role_by_name(conn, "USER")?.unwrap();
            users::assign_role(conn, id, role.id)
        })
        .unwrap();

        let profile = get_profile(&db, id).unwrap();
        assert_eq!(profile.username, "alice");
        assert!(matches!(&profile.roles[..], [RoleRef::Expanded(role)] if role.name == "USER"));
        assert!(matches!(
            get_profile(&db, Uuid::new_v4()),
            Err(ApiError::NotFound(_))
        ));
    }

    #[test]
    fn test_only_owner_updates_profile() {
        let db = Database::open_in_memory().unwrap();
        let alice = test_support::user(&db, "alice");
        let bob = test_support::user(&db, "bob");
        let req = || UpdateUserRequest {
            display_name: Some("Alice A.".into()),
            avatar_url: None,
        };

        assert!(matches!(
            update_profile(&db, bob, alice, req()),
            Err(ApiError::Forbidden(_))
        ));
        let updated = update_profile(&db, alice, alice, req()).unwrap();
        assert_eq!(updated.display_name.as_deref(), Some("Alice A."));
        assert!(updated.avatar_url.is_none());
    }
}
