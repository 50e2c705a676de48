use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{Result, conflict_or};
use crate::models::{ConversationRow, uuid_at};
use crate::pair_key;

struct Header {
    id: Uuid,
    is_group: bool,
    is_deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

const HEADER_COLUMNS: &str = "id, is_group, is_deleted, created_at, updated_at";

fn map_header(row: &Row<'_>) -> rusqlite::Result<Header> {
    Ok(Header {
        id: uuid_at(row, 0)?,
        is_group: row.get(1)?,
        is_deleted: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn with_participants(conn: &Connection, header: Header) -> Result<ConversationRow> {
    Ok(ConversationRow {
        participants: participants(conn, header.id)?,
        id: header.id,
        is_group: header.is_group,
        is_deleted: header.is_deleted,
        created_at: header.created_at,
        updated_at: header.updated_at,
    })
}

pub fn participants(conn: &Connection, conversation_id: Uuid) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1 ORDER BY rowid",
    )?;
    let ids = stmt
        .query_map([conversation_id.to_string()], |row| uuid_at(row, 0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

/// Any conversation with this id, soft-deleted ones included.
pub fn find_conversation(conn: &Connection, id: Uuid) -> Result<Option<ConversationRow>> {
    let header = conn
        .query_row(
            &format!("SELECT {} FROM conversations WHERE id = ?1", HEADER_COLUMNS),
            [id.to_string()],
            map_header,
        )
        .optional()?;
    header.map(|h| with_participants(conn, h)).transpose()
}

/// The live direct conversation whose participants are exactly `{a, b}`.
pub fn find_direct(conn: &Connection, a: Uuid, b: Uuid) -> Result<Option<ConversationRow>> {
    let header = conn
        .query_row(
            &format!(
                "SELECT {} FROM conversations
                 WHERE direct_key = ?1 AND is_group = 0 AND is_deleted = 0",
                HEADER_COLUMNS
            ),
            [pair_key(a, b)],
            map_header,
        )
        .optional()?;
    header.map(|h| with_participants(conn, h)).transpose()
}

/// Create a conversation with the given participants. A two-person,
/// non-group conversation gets a direct key, so inserting a second live one
/// for the same pair fails with `Conflict`.
pub fn insert_conversation(
    conn: &Connection,
    participants: &[Uuid],
    is_group: bool,
) -> Result<ConversationRow> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let direct_key = match participants {
        [a, b] if !is_group => Some(pair_key(*a, *b)),
        _ => None,
    };

    conn.execute(
        "INSERT INTO conversations (id, is_group, direct_key, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        rusqlite::params![id.to_string(), is_group, direct_key, now],
    )
    .map_err(|e| conflict_or(e, "A direct conversation already exists for this pair"))?;

    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id) VALUES (?1, ?2)",
    )?;
    for user_id in participants {
        stmt.execute((id.to_string(), user_id.to_string()))?;
    }

    Ok(ConversationRow {
        id,
        is_group,
        participants: participants.to_vec(),
        is_deleted: false,
        created_at: now,
        updated_at: now,
    })
}

pub fn soft_delete(conn: &Connection, id: Uuid) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE conversations SET is_deleted = 1, updated_at = ?2 WHERE id = ?1",
        rusqlite::params![id.to_string(), Utc::now()],
    )?;
    Ok(changed > 0)
}

/// Bump the modification time after a message was appended.
pub fn touch(conn: &Connection, id: Uuid, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
        rusqlite::params![id.to_string(), at],
    )?;
    Ok(())
}

/// Live conversations the user takes part in, most recently active first.
pub fn list_for_user(conn: &Connection, user_id: Uuid) -> Result<Vec<ConversationRow>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.is_group, c.is_deleted, c.created_at, c.updated_at
         FROM conversations c
         JOIN conversation_participants p ON p.conversation_id = c.id
         WHERE p.user_id = ?1 AND c.is_deleted = 0
         ORDER BY c.updated_at DESC",
    )?;
    let headers = stmt
        .query_map([user_id.to_string()], map_header)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    headers
        .into_iter()
        .map(|h| with_participants(conn, h))
        .collect()
}
