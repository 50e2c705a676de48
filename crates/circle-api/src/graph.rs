//! Follow, unfollow and block between two users, plus the friendship views
//! derived from the relationship edges.

use std::collections::BTreeSet;

use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use rusqlite::Connection;
use tracing::{info, warn};
use uuid::Uuid;

use circle_db::{Database, relationships, users};
use circle_gateway::{Notifier, notify};
use circle_types::api::{
    ApiResponse, BlockRequest, Claims, FollowRequest, FollowResponse, UnfollowRequest, UserList,
};
use circle_types::events::{FriendUpdateKind, RealtimeEvent, Room};
use circle_types::models::{RelationStatus, Relationship, UserSummary};

use crate::conversations::ensure_direct_conversation;
use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, blocking};

enum FollowOutcome {
    Requested(Relationship),
    Accepted(Relationship, Uuid),
}

/// Ids of everyone the user shares an accepted edge with.
pub fn friend_ids(conn: &Connection, user_id: Uuid) -> ApiResult<BTreeSet<Uuid>> {
    Ok(relationships::edges_touching(conn, user_id, RelationStatus::Accepted)?
        .iter()
        .filter_map(|edge| edge.counterpart(user_id))
        .collect())
}

pub fn friend_count(conn: &Connection, user_id: Uuid) -> ApiResult<usize> {
    Ok(friend_ids(conn, user_id)?.len())
}

pub fn are_friends(conn: &Connection, a: Uuid, b: Uuid) -> ApiResult<bool> {
    Ok(relationships::find_edge(conn, a, b, Some(RelationStatus::Accepted))?.is_some())
}

pub fn is_blocked(conn: &Connection, a: Uuid, b: Uuid) -> ApiResult<bool> {
    Ok(relationships::find_edge(conn, a, b, Some(RelationStatus::Blocked))?.is_some())
}

/// The other party of a relationship call: present and not the actor.
fn counterpart_of(actor: Uuid, other: Option<Uuid>, field: &str) -> ApiResult<Uuid> {
    let other = other.ok_or_else(|| ApiError::validation(format!("{} is required", field)))?;
    if other == actor {
        return Err(ApiError::SelfRelation);
    }
    Ok(other)
}

pub(crate) fn ensure_active(conn: &Connection, user_id: Uuid) -> ApiResult<()> {
    if users::active_user_exists(conn, user_id)? {
        Ok(())
    } else {
        Err(ApiError::not_found("User not found"))
    }
}

pub fn follow_user(
    db: &Database,
    notifier: &dyn Notifier,
    actor: Uuid,
    followee_id: Option<Uuid>,
) -> ApiResult<FollowResponse> {
    let target = counterpart_of(actor, followee_id, "followee_id")?;

    let outcome = db.with_tx(|tx| -> ApiResult<FollowOutcome> {
        ensure_active(tx, target)?;

        match relationships::find_edge(tx, actor, target, None)? {
            Some(edge) if edge.status == RelationStatus::Blocked => {
                Err(ApiError::forbidden("This user cannot be followed"))
            }
            Some(edge) if edge.status == RelationStatus::Accepted => {
                Err(ApiError::conflict("You are already friends"))
            }
            Some(edge) if edge.requester_id == actor => {
                Err(ApiError::conflict("Follow request already sent"))
            }
            Some(mut edge) => {
                relationships::set_status(tx, edge.id, RelationStatus::Accepted)?;
                edge.status = RelationStatus::Accepted;
                edge.updated_at = chrono::Utc::now();
                let conversation = ensure_direct_conversation(tx, actor, target)?;
                Ok(FollowOutcome::Accepted(edge, conversation.id))
            }
            None => {
                let edge = relationships::create_edge(tx, actor, target, RelationStatus::Pending)?;
                Ok(FollowOutcome::Requested(edge))
            }
        }
    })?;

    match outcome {
        FollowOutcome::Requested(relationship) => {
            info!("{} sent a follow request to {}", actor, target);
            push_pending(db, notifier, target, actor);
            push_friend_update(db, notifier, actor, FriendUpdateKind::RequestSent, target);
            push_friend_update(db, notifier, target, FriendUpdateKind::RequestReceived, actor);
            Ok(FollowResponse {
                relationship,
                conversation_id: None,
            })
        }
        FollowOutcome::Accepted(relationship, conversation_id) => {
            info!("{} and {} are now friends", actor, target);
            push_friend_update(db, notifier, actor, FriendUpdateKind::Accepted, target);
            push_friend_update(db, notifier, target, FriendUpdateKind::Accepted, actor);
            Ok(FollowResponse {
                relationship,
                conversation_id: Some(conversation_id),
            })
        }
    }
}

/// Drop every edge between the pair. Returns how many were removed. The
/// counterpart's account state is not checked, so edges to a deleted
/// account can still be cleared.
pub fn unfollow_user(
    db: &Database,
    notifier: &dyn Notifier,
    actor: Uuid,
    user_id: Option<Uuid>,
) -> ApiResult<usize> {
    let target = counterpart_of(actor, user_id, "user_id")?;

    let removed = db.with_conn(|conn| relationships::delete_edges(conn, actor, target))?;

    info!("{} removed {} edge(s) with {}", actor, removed, target);
    push_friend_update(db, notifier, actor, FriendUpdateKind::Unfollow, target);
    push_friend_update(db, notifier, target, FriendUpdateKind::Unfollow, actor);
    Ok(removed)
}

pub fn block_user(
    db: &Database,
    notifier: &dyn Notifier,
    actor: Uuid,
    blocked_id: Option<Uuid>,
) -> ApiResult<Relationship> {
    let target = counterpart_of(actor, blocked_id, "blocked_id")?;

    let edge = db.with_tx(|tx| {
        ensure_active(tx, target)?;
        relationships::delete_edges(tx, actor, target)?;
        Ok::<_, ApiError>(relationships::create_edge(
            tx,
            actor,
            target,
            RelationStatus::Blocked,
        )?)
    })?;

    info!("{} blocked {}", actor, target);
    push_friend_update(db, notifier, actor, FriendUpdateKind::Block, target);
    push_friend_update(db, notifier, target, FriendUpdateKind::BlockedBy, actor);
    Ok(edge)
}

// -- Friendship views --

/// Users the caller has asked to follow and who have not answered yet.
pub fn outgoing_requests(db: &Database, user_id: Uuid) -> ApiResult<Vec<UserSummary>> {
    db.with_conn(|conn| relationships::targets_of(conn, user_id, RelationStatus::Pending))
        .map_err(ApiError::from)
}

/// Users waiting for the caller to accept their request.
pub fn incoming_requests(db: &Database, user_id: Uuid) -> ApiResult<Vec<UserSummary>> {
    db.with_conn(|conn| relationships::requesters_of(conn, user_id, RelationStatus::Pending))
        .map_err(ApiError::from)
}

pub fn friends(db: &Database, user_id: Uuid) -> ApiResult<Vec<UserSummary>> {
    db.with_conn(|conn| {
        let ids: Vec<Uuid> = friend_ids(conn, user_id)?.into_iter().collect();
        Ok(users::user_summaries(conn, &ids)?)
    })
}

pub fn blocked_by_me(db: &Database, user_id: Uuid) -> ApiResult<Vec<UserSummary>> {
    db.with_conn(|conn| relationships::targets_of(conn, user_id, RelationStatus::Blocked))
        .map_err(ApiError::from)
}

// -- Realtime --

// Counts are read after commit. A failed read costs the event, not the request.
fn push_friend_update(
    db: &Database,
    notifier: &dyn Notifier,
    user_id: Uuid,
    kind: FriendUpdateKind,
    other_id: Uuid,
) {
    match db.with_conn(|conn| friend_count(conn, user_id)) {
        Ok(new_count) => notify(
            notifier,
            Room::User(user_id),
            RealtimeEvent::FriendUpdate {
                kind,
                new_count,
                other_id,
            },
        ),
        Err(e) => warn!("Skipping friend:update for {}: {:?}", user_id, e),
    }
}

/// `new_count` is the receiver's current friend count.
fn push_pending(db: &Database, notifier: &dyn Notifier, user_id: Uuid, from_id: Uuid) {
    match db.with_conn(|conn| friend_count(conn, user_id)) {
        Ok(new_count) => notify(
            notifier,
            Room::User(user_id),
            RealtimeEvent::FriendPending { from_id, new_count },
        ),
        Err(e) => warn!("Skipping friend:pending for {}: {:?}", user_id, e),
    }
}

// -- Handlers --

pub async fn follow(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<FollowRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;
    let response = blocking(move || {
        follow_user(&state.db, state.notifier(), claims.sub, req.followee_id)
    })
    .await?;

    let (status, message) = if response.conversation_id.is_some() {
        (StatusCode::OK, "Follow request accepted")
    } else {
        (StatusCode::CREATED, "Follow request sent")
    };
    Ok((status, Json(ApiResponse::ok_with_message(message, response))))
}

pub async fn unfollow(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<UnfollowRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;
    blocking(move || unfollow_user(&state.db, state.notifier(), claims.sub, req.user_id)).await?;
    Ok(Json(ApiResponse::message("Unfollowed")))
}

pub async fn block(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<BlockRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = payload?;
    let edge =
        blocking(move || block_user(&state.db, state.notifier(), claims.sub, req.blocked_id))
            .await?;
    Ok(Json(ApiResponse::ok_with_message("User blocked", edge)))
}

pub async fn follow_list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let users = blocking(move || outgoing_requests(&state.db, claims.sub)).await?;
    Ok(Json(ApiResponse::ok(UserList { users })))
}

pub async fn follower_list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let users = blocking(move || incoming_requests(&state.db, claims.sub)).await?;
    Ok(Json(ApiResponse::ok(UserList { users })))
}

pub async fn friend_list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let users = blocking(move || friends(&state.db, claims.sub)).await?;
    Ok(Json(ApiResponse::ok(UserList { users })))
}

pub async fn block_list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let users = blocking(move || blocked_by_me(&state.db, claims.sub)).await?;
    Ok(Json(ApiResponse::ok(UserList { users })))
}
