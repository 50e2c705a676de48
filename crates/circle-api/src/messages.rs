use axum::{
    Extension, Json,
    extract::{
        Path, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use circle_db::{Database, conversations, messages};
use circle_gateway::{Notifier, notify_except};
use circle_types::api::{ApiResponse, Claims, SendMessageRequest};
use circle_types::events::{RealtimeEvent, Room};
use circle_types::models::{Message, MessageType, PostSnippet};

use crate::conversations::{ensure_direct_conversation, participant_conversation};
use crate::error::{ApiError, ApiResult};
use crate::graph::{ensure_active, is_blocked};
use crate::posts::visible_post;
use crate::state::{AppState, blocking};

/// Message body after validation. Content may only be empty when a post is
/// shared.
struct Draft {
    content: String,
    message_type: Option<MessageType>,
    post_id: Option<Uuid>,
}

impl Draft {
    fn from_request(req: SendMessageRequest) -> ApiResult<Self> {
        let content = req.content.unwrap_or_default().trim().to_string();
        if content.is_empty() && req.post_id.is_none() {
            return Err(ApiError::validation("Message content is required"));
        }
        if req.message_type == Some(MessageType::Post) && req.post_id.is_none() {
            return Err(ApiError::validation("post_id is required for post messages"));
        }
        Ok(Self {
            content,
            message_type: req.message_type,
            post_id: req.post_id,
        })
    }
}

/// Insert a message into a conversation the sender belongs to and bump the
/// conversation's modification time. Runs inside the caller's transaction.
/// A block between the two members closes a direct conversation.
fn append_message(
    conn: &Connection,
    conversation_id: Uuid,
    sender_id: Uuid,
    draft: &Draft,
) -> ApiResult<Message> {
    let conversation = participant_conversation(conn, conversation_id, sender_id)?;
    if !conversation.is_group {
        for peer in conversation.participants.iter().filter(|&&p| p != sender_id) {
            if is_blocked(conn, sender_id, *peer)? {
                return Err(ApiError::forbidden("You cannot message this user"));
            }
        }
    }

    let snippet = match draft.post_id {
        Some(post_id) => {
            let post = visible_post(conn, sender_id, post_id)?;
            Some(PostSnippet {
                post_id: post.id,
                caption: post.caption,
                media_url: post.media.map(|m| m.url),
            })
        }
        None => None,
    };
    let message_type = if snippet.is_some() {
        MessageType::Post
    } else {
        draft.message_type.unwrap_or_default()
    };

    let id = Uuid::new_v4();
    let now = Utc::now();
    messages::insert_message(
        conn,
        &messages::NewMessage {
            id,
            conversation_id,
            sender_id,
            content: &draft.content,
            message_type,
            post: snippet.as_ref(),
            created_at: now,
        },
    )?;
    conversations::touch(conn, conversation_id, now)?;

    messages::find_message(conn, id)?
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("message {} missing after insert", id)))
}

fn announce(notifier: &dyn Notifier, message: &Message) {
    notify_except(
        notifier,
        Room::Conversation(message.conversation_id),
        RealtimeEvent::NewMessage {
            conversation_id: message.conversation_id,
            message: message.clone(),
        },
        message.sender.id,
    );
}

pub fn post_message(
    db: &Database,
    notifier: &dyn Notifier,
    conversation_id: Uuid,
    sender_id: Uuid,
    req: SendMessageRequest,
) -> ApiResult<Message> {
    let draft = Draft::from_request(req)?;
    let message = db.with_tx(|tx| append_message(tx, conversation_id, sender_id, &draft))?;

    debug!("{} posted {} to {}", sender_id, message.id, conversation_id);
    announce(notifier, &message);
    Ok(message)
}

/// Message a user directly, opening the pair's conversation on first
/// contact.
pub fn send_to_user(
    db: &Database,
    notifier: &dyn Notifier,
    sender_id: Uuid,
    receiver_id: Uuid,
    req: SendMessageRequest,
) -> ApiResult<Message> {
    let draft = Draft::from_request(req)?;
    if sender_id == receiver_id {
        return Err(ApiError::SelfRelation);
    }

    let message = db.with_tx(|tx| -> ApiResult<Message> {
        ensure_active(tx, receiver_id)?;
        if is_blocked(tx, sender_id, receiver_id)? {
            return Err(ApiError::forbidden("You cannot message this user"));
        }
        let conversation = ensure_direct_conversation(tx, sender_id, receiver_id)?;
        append_message(tx, conversation.id, sender_id, &draft)
    })?;

    debug!("{} messaged {} in {}", sender_id, receiver_id, message.conversation_id);
    announce(notifier, &message);
    Ok(message)
}

pub fn list_messages(db: &Database, conversation_id: Uuid, viewer: Uuid) -> ApiResult<Vec<Message>> {
    db.with_conn(|conn| {
        participant_conversation(conn, conversation_id, viewer)?;
        Ok(messages::messages_for_conversation(conn, conversation_id)?)
    })
}

// -- Handlers --

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(conversation_id) = path?;
    let Json(req) = payload?;
    let message = blocking(move || {
        post_message(&state.db, state.notifier(), conversation_id, claims.sub, req)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(message))))
}

pub async fn send_to_receiver(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(receiver_id) = path?;
    let Json(req) = payload?;
    let message = blocking(move || {
        send_to_user(&state.db, state.notifier(), claims.sub, receiver_id, req)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(message))))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(conversation_id) = path?;
    let messages = blocking(move || list_messages(&state.db, conversation_id, claims.sub)).await?;
    Ok(Json(ApiResponse::ok(messages)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{block_user, follow_user};
    use crate::posts::tests::publish;
    use crate::test_support::{self, RecordingNotifier};
    use circle_types::models::Visibility;

    fn text(content: &str) -> SendMessageRequest {
        SendMessageRequest {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    fn friends_with_conversation(db: &Database) -> (Uuid, Uuid, Uuid) {
        let a = test_support::user(db, "alice");
        let b = test_support::user(db, "bob");
        let notifier = RecordingNotifier::default();
        follow_user(db, &notifier, a, Some(b)).unwrap();
        let accepted = follow_user(db, &notifier, b, Some(a)).unwrap();
        (a, b, accepted.conversation_id.unwrap())
    }

    #[test]
    fn test_message_reaches_room_and_history() {
        let db = Database::open_in_memory().unwrap();
        let (a, _b, conversation) = friends_with_conversation(&db);
        let notifier = RecordingNotifier::default();

        let sent = post_message(&db, &notifier, conversation, a, text("hi")).unwrap();
        assert_eq!(sent.sender.id, a);
        assert_eq!(sent.message_type, MessageType::Text);

        let events = notifier.take();
        assert_eq!(events.len(), 1);
        let (room, event, except) = &events[0];
        assert_eq!(*room, Room::Conversation(conversation));
        assert_eq!(*except, Some(a));
        assert!(matches!(
            event,
            RealtimeEvent::NewMessage { message, .. } if message.content == "hi" && message.sender.username == "alice"
        ));

        let history = list_messages(&db, conversation, a).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[0].sender.username, "alice");
    }

    #[test]
    fn test_outsider_cannot_post_or_read() {
        let db = Database::open_in_memory().unwrap();
        let (a, _b, conversation) = friends_with_conversation(&db);
        let outsider = test_support::user(&db, "mallory");
        let notifier = RecordingNotifier::default();

        assert!(matches!(
            post_message(&db, &notifier, conversation, outsider, text("let me in")),
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            list_messages(&db, conversation, outsider),
            Err(ApiError::Forbidden(_))
        ));
        assert!(list_messages(&db, conversation, a).unwrap().is_empty());
        assert!(notifier.take().is_empty());
    }

    #[test]
    fn test_empty_content_and_missing_conversation() {
        let db = Database::open_in_memory().unwrap();
        let (a, _b, conversation) = friends_with_conversation(&db);
        let notifier = RecordingNotifier::default();

        assert!(matches!(
            post_message(&db, &notifier, conversation, a, text("   ")),
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            post_message(&db, &notifier, Uuid::new_v4(), a, text("hello?")),
            Err(ApiError::NotFound(_))
        ));
    }

    #[test]
    fn test_shared_post_embeds_snippet() {
        let db = Database::open_in_memory().unwrap();
        let (a, b, conversation) = friends_with_conversation(&db);
        let notifier = RecordingNotifier::default();

        let shared = publish(&db, b, Visibility::Friends);
        let sent = post_message(
            &db,
            &notifier,
            conversation,
            a,
            SendMessageRequest {
                post_id: Some(shared.id),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(sent.message_type, MessageType::Post);
        let snippet = sent.post.unwrap();
        assert_eq!(snippet.post_id, shared.id);
        assert_eq!(snippet.caption.as_deref(), Some("caption"));
        assert!(snippet.media_url.is_some());

        let private = publish(&db, b, Visibility::Private);
        assert!(matches!(
            post_message(
                &db,
                &notifier,
                conversation,
                a,
                SendMessageRequest {
                    post_id: Some(private.id),
                    ..Default::default()
                },
            ),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[test]
    fn test_send_to_user_opens_conversation_once() {
        let db = Database::open_in_memory().unwrap();
        let a = test_support::user(&db, "alice");
        let b = test_support::user(&db, "bob");
        let notifier = RecordingNotifier::default();

        let first = send_to_user(&db, &notifier, a, b, text("hello")).unwrap();
        let second = send_to_user(&db, &notifier, b, a, text("hey")).unwrap();
        assert_eq!(first.conversation_id, second.conversation_id);
        assert_eq!(list_messages(&db, first.conversation_id, b).unwrap().len(), 2);

        assert!(matches!(
            send_to_user(&db, &notifier, a, a, text("me")),
            Err(ApiError::SelfRelation)
        ));

        block_user(&db, &notifier, b, Some(a)).unwrap();
        assert!(matches!(
            send_to_user(&db, &notifier, a, b, text("still there?")),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[test]
    fn test_block_closes_existing_direct_conversation() {
        let db = Database::open_in_memory().unwrap();
        let (a, b, conversation) = friends_with_conversation(&db);
        let notifier = RecordingNotifier::default();
        post_message(&db, &notifier, conversation, b, text("before")).unwrap();

        block_user(&db, &notifier, a, Some(b)).unwrap();
        notifier.take();

        for sender in [a, b] {
            assert!(matches!(
                post_message(&db, &notifier, conversation, sender, text("after")),
                Err(ApiError::Forbidden(_))
            ));
        }
        assert!(notifier.take().is_empty());

        let history = list_messages(&db, conversation, a).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "before");
    }
}
