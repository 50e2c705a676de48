use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use circle_types::models::{LastMessage, Message, MessageType, PostSnippet, UserSummary};

use crate::error::Result;
use crate::models::{opt_uuid_at, parse_at, uuid_at};

pub struct NewMessage<'a> {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: &'a str,
    pub message_type: MessageType,
    pub post: Option<&'a PostSnippet>,
    pub created_at: DateTime<Utc>,
}

// JOIN users to fetch the sender summary in a single query
const MESSAGE_SELECT: &str = "
    SELECT m.id, m.conversation_id, m.content, m.message_type, m.is_read, m.created_at,
           m.post_id, m.post_caption, m.post_media_url,
           u.id, u.username, u.display_name, u.avatar_url
    FROM messages m
    JOIN users u ON u.id = m.sender_id";

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let post = opt_uuid_at(row, 6)?.map(|post_id| -> rusqlite::Result<PostSnippet> {
        Ok(PostSnippet {
            post_id,
            caption: row.get(7)?,
            media_url: row.get(8)?,
        })
    });

    Ok(Message {
        id: uuid_at(row, 0)?,
        conversation_id: uuid_at(row, 1)?,
        content: row.get(2)?,
        message_type: parse_at(row, 3)?,
        is_read: row.get(4)?,
        created_at: row.get(5)?,
        post: post.transpose()?,
        sender: UserSummary {
            id: uuid_at(row, 9)?,
            username: row.get(10)?,
            display_name: row.get(11)?,
            avatar_url: row.get(12)?,
        },
    })
}

/// Append a message to a conversation. The post snippet, if any, is copied
/// onto the message row.
pub fn insert_message(conn: &Connection, msg: &NewMessage<'_>) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, content, message_type,
                               post_id, post_caption, post_media_url, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            msg.id.to_string(),
            msg.conversation_id.to_string(),
            msg.sender_id.to_string(),
            msg.content,
            msg.message_type.as_str(),
            msg.post.map(|p| p.post_id.to_string()),
            msg.post.and_then(|p| p.caption.as_deref()),
            msg.post.and_then(|p| p.media_url.as_deref()),
            msg.created_at
        ],
    )?;
    Ok(())
}

pub fn find_message(conn: &Connection, id: Uuid) -> Result<Option<Message>> {
    let sql = format!("{} WHERE m.id = ?1", MESSAGE_SELECT);
    Ok(conn.query_row(&sql, [id.to_string()], map_message).optional()?)
}

/// Full, non-deleted history of a conversation, oldest first.
pub fn messages_for_conversation(conn: &Connection, conversation_id: Uuid) -> Result<Vec<Message>> {
    let sql = format!(
        "{} WHERE m.conversation_id = ?1 AND m.is_deleted = 0 ORDER BY m.created_at ASC, m.rowid ASC",
        MESSAGE_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([conversation_id.to_string()], map_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn last_message(conn: &Connection, conversation_id: Uuid) -> Result<Option<LastMessage>> {
    Ok(conn
        .query_row(
            "SELECT id, content, created_at FROM messages
             WHERE conversation_id = ?1 AND is_deleted = 0
             ORDER BY created_at DESC, rowid DESC
             LIMIT 1",
            [conversation_id.to_string()],
            |row| {
                Ok(LastMessage {
                    id: uuid_at(row, 0)?,
                    content: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        )
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::{conversations, fixtures};
    use crate::{Database, DbError};

    fn send(conn: &Connection, conversation_id: Uuid, sender_id: Uuid, content: &str) -> Uuid {
        let id = Uuid::new_v4();
        insert_message(
            conn,
            &NewMessage {
                id,
                conversation_id,
                sender_id,
                content,
                message_type: MessageType::Text,
                post: None,
                created_at: Utc::now(),
            },
        )
        .unwrap();
        id
    }

    #[test]
    fn test_history_is_ordered_and_populated() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let alice = fixtures::user(conn, "alice");
            let bob = fixtures::user(conn, "bob");
            let conv = conversations::insert_conversation(conn, &[alice, bob], false)?;

            send(conn, conv.id, alice, "first");
            send(conn, conv.id, bob, "second");
            let third = send(conn, conv.id, alice, "third");

            let history = messages_for_conversation(conn, conv.id)?;
            let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
            assert_eq!(contents, vec!["first", "second", "third"]);
            assert_eq!(history[1].sender.username, "bob");
            assert!(history[0].post.is_none());

            let last = last_message(conn, conv.id)?.unwrap();
            assert_eq!(last.id, third);
            Ok::<_, DbError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_deleted_messages_are_hidden() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let alice = fixtures::user(conn, "alice");
            let bob = fixtures::user(conn, "bob");
            let conv = conversations::insert_conversation(conn, &[alice, bob], false)?;
            let gone = send(conn, conv.id, alice, "oops");
            conn.execute("UPDATE messages SET is_deleted = 1 WHERE id = ?1", [gone.to_string()])?;

            assert!(messages_for_conversation(conn, conv.id)?.is_empty());
            assert!(last_message(conn, conv.id)?.is_none());
            assert!(find_message(conn, gone)?.is_some());
            Ok::<_, DbError>(())
        })
        .unwrap();
    }
}
