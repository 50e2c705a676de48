use axum::{
    Extension, Json,
    extract::{Path, State, rejection::PathRejection},
    response::IntoResponse,
};
use rusqlite::Connection;
use tracing::{debug, info};
use uuid::Uuid;

use circle_db::models::ConversationRow;
use circle_db::{Database, DbError, conversations, messages, users};
use circle_types::api::{ApiResponse, Claims};
use circle_types::models::ConversationSummary;

use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, blocking};

/// The live direct conversation between `a` and `b`, created when missing.
///
/// Safe to call repeatedly: the partial unique index on the pair's direct
/// key means a racing insert loses with `Conflict`, and the loser reads
/// back the winner's row.
pub fn ensure_direct_conversation(conn: &Connection, a: Uuid, b: Uuid) -> ApiResult<ConversationRow> {
    if a == b {
        return Err(ApiError::SelfRelation);
    }
    if let Some(existing) = conversations::find_direct(conn, a, b)? {
        return Ok(existing);
    }

    match conversations::insert_conversation(conn, &[a, b], false) {
        Ok(created) => {
            info!("Opened direct conversation {} for {} and {}", created.id, a, b);
            Ok(created)
        }
        Err(DbError::Conflict(_)) => {
            debug!("Direct conversation for {} and {} created concurrently", a, b);
            conversations::find_direct(conn, a, b)?.ok_or_else(|| {
                ApiError::Internal(anyhow::anyhow!(
                    "direct conversation for {}:{} vanished after conflict",
                    a,
                    b
                ))
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// A live conversation the user belongs to. Missing or deleted is
/// `NotFound`, present but foreign is `Forbidden`.
pub fn participant_conversation(
    conn: &Connection,
    conversation_id: Uuid,
    user_id: Uuid,
) -> ApiResult<ConversationRow> {
    let conversation = conversations::find_conversation(conn, conversation_id)?
        .filter(|c| !c.is_deleted)
        .ok_or_else(|| ApiError::not_found("Conversation not found"))?;

    if !conversation.has_participant(user_id) {
        return Err(ApiError::forbidden("You are not part of this conversation"));
    }
    Ok(conversation)
}

pub fn list_conversations(db: &Database, user_id: Uuid) -> ApiResult<Vec<ConversationSummary>> {
    db.with_conn(|conn| {
        let rows = conversations::list_for_user(conn, user_id)?;
        let mut summaries = Vec::with_capacity(rows.len());

        for row in rows {
            let peer = if row.is_group {
                None
            } else {
                let others: Vec<Uuid> = row
                    .participants
                    .iter()
                    .copied()
                    .filter(|id| *id != user_id)
                    .collect();
                users::user_summaries(conn, &others)?.into_iter().next()
            };

            summaries.push(ConversationSummary {
                id: row.id,
                is_group: row.is_group,
                peer,
                last_message: messages::last_message(conn, row.id)?,
                updated_at: row.updated_at,
            });
        }
        Ok(summaries)
    })
}

pub fn delete_conversation(db: &Database, user_id: Uuid, conversation_id: Uuid) -> ApiResult<()> {
    db.with_conn(|conn| {
        participant_conversation(conn, conversation_id, user_id)?;
        conversations::soft_delete(conn, conversation_id)?;
        Ok::<_, ApiError>(())
    })?;
    info!("{} deleted conversation {}", user_id, conversation_id);
    Ok(())
}

// -- Handlers --

pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let summaries = blocking(move || list_conversations(&state.db, claims.sub)).await?;
    Ok(Json(ApiResponse::ok(summaries)))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(conversation_id) = path?;
    blocking(move || delete_conversation(&state.db, claims.sub, conversation_id)).await?;
    Ok(Json(ApiResponse::message("Conversation deleted")))
}
