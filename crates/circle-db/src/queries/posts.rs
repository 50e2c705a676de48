//! Posts and the media they embed.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use circle_types::models::{Media, Post, UserSummary, Visibility};

use crate::error::Result;
use crate::models::{PostRow, opt_uuid_at, parse_at, placeholders, uuid_at};

// -- Media --

const MEDIA_COLUMNS: &str = "id, user_id, media_type, storage_key, url, size_bytes, created_at";

fn map_media(row: &Row<'_>) -> rusqlite::Result<Media> {
    Ok(Media {
        id: uuid_at(row, 0)?,
        user_id: uuid_at(row, 1)?,
        media_type: parse_at(row, 2)?,
        storage_key: row.get(3)?,
        url: row.get(4)?,
        size_bytes: row.get(5)?,
        created_at: row.get(6)?,
    })
}

pub fn insert_media(conn: &Connection, media: &Media) -> Result<()> {
    conn.execute(
        "INSERT INTO media (id, user_id, media_type, storage_key, url, size_bytes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            media.id.to_string(),
            media.user_id.to_string(),
            media.media_type.as_str(),
            media.storage_key,
            media.url,
            media.size_bytes,
            media.created_at
        ],
    )?;
    Ok(())
}

/// A live media record.
pub fn find_media(conn: &Connection, id: Uuid) -> Result<Option<Media>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM media WHERE id = ?1 AND is_deleted = 0",
                MEDIA_COLUMNS
            ),
            [id.to_string()],
            map_media,
        )
        .optional()?)
}

pub fn media_for_user(conn: &Connection, user_id: Uuid) -> Result<Vec<Media>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM media WHERE user_id = ?1 AND is_deleted = 0 ORDER BY created_at DESC",
        MEDIA_COLUMNS
    ))?;
    let rows = stmt
        .query_map([user_id.to_string()], map_media)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn soft_delete_media(conn: &Connection, id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE media SET is_deleted = 1 WHERE id = ?1",
        [id.to_string()],
    )?;
    Ok(())
}

// -- Posts --

pub struct NewPost<'a> {
    pub id: Uuid,
    pub user_id: Uuid,
    pub media_id: Uuid,
    pub caption: Option<&'a str>,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
}

// Author joined in; media left-joined so a deleted media record reads as none.
const POST_SELECT: &str = "
    SELECT p.id, p.caption, p.visibility, p.created_at, p.updated_at, p.is_deleted, p.media_id,
           u.id, u.username, u.display_name, u.avatar_url,
           md.id, md.user_id, md.media_type, md.storage_key, md.url, md.size_bytes, md.created_at
    FROM posts p
    JOIN users u ON u.id = p.user_id
    LEFT JOIN media md ON md.id = p.media_id AND md.is_deleted = 0";

fn map_post(row: &Row<'_>) -> rusqlite::Result<PostRow> {
    let media = match opt_uuid_at(row, 11)? {
        Some(id) => Some(Media {
            id,
            user_id: uuid_at(row, 12)?,
            media_type: parse_at(row, 13)?,
            storage_key: row.get(14)?,
            url: row.get(15)?,
            size_bytes: row.get(16)?,
            created_at: row.get(17)?,
        }),
        None => None,
    };

    Ok(PostRow {
        post: Post {
            id: uuid_at(row, 0)?,
            caption: row.get(1)?,
            visibility: parse_at(row, 2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            author: UserSummary {
                id: uuid_at(row, 7)?,
                username: row.get(8)?,
                display_name: row.get(9)?,
                avatar_url: row.get(10)?,
            },
            media,
        },
        is_deleted: row.get(5)?,
        media_id: uuid_at(row, 6)?,
    })
}

pub fn insert_post(conn: &Connection, post: &NewPost<'_>) -> Result<()> {
    conn.execute(
        "INSERT INTO posts (id, user_id, media_id, caption, visibility, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        rusqlite::params![
            post.id.to_string(),
            post.user_id.to_string(),
            post.media_id.to_string(),
            post.caption,
            post.visibility.as_str(),
            post.created_at
        ],
    )?;
    Ok(())
}

/// Any post with this id, soft-deleted ones included.
pub fn find_post(conn: &Connection, id: Uuid) -> Result<Option<PostRow>> {
    let sql = format!("{} WHERE p.id = ?1", POST_SELECT);
    Ok(conn.query_row(&sql, [id.to_string()], map_post).optional()?)
}

/// Live posts by any of `authors` with one of `visibilities`, newest first.
pub fn posts_by(
    conn: &Connection,
    authors: &[Uuid],
    visibilities: &[Visibility],
) -> Result<Vec<Post>> {
    if authors.is_empty() || visibilities.is_empty() {
        return Ok(vec![]);
    }

    let sql = format!(
        "{} WHERE p.is_deleted = 0 AND p.user_id IN ({}) AND p.visibility IN ({})
         ORDER BY p.created_at DESC",
        POST_SELECT,
        placeholders(1, authors.len()),
        placeholders(authors.len() + 1, visibilities.len()),
    );
    let params: Vec<String> = authors
        .iter()
        .map(Uuid::to_string)
        .chain(visibilities.iter().map(|v| v.as_str().to_string()))
        .collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), map_post)?
        .map(|row| row.map(|r| r.post))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn soft_delete_post(conn: &Connection, id: Uuid) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE posts SET is_deleted = 1, updated_at = ?2 WHERE id = ?1",
        rusqlite::params![id.to_string(), Utc::now()],
    )?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::fixtures;
    use crate::{Database, DbError};
    use circle_types::models::MediaType;

    fn publish(conn: &Connection, author: Uuid, visibility: Visibility) -> Uuid {
        let media = Media {
            id: Uuid::new_v4(),
            user_id: author,
            media_type: MediaType::Image,
            storage_key: "uploads/x.png".into(),
            url: "http://localhost/files/uploads/x.png".into(),
            size_bytes: 3,
            created_at: Utc::now(),
        };
        insert_media(conn, &media).unwrap();
        let id = Uuid::new_v4();
        insert_post(
            conn,
            &NewPost {
                id,
                user_id: author,
                media_id: media.id,
                caption: Some("hello"),
                visibility,
                created_at: Utc::now(),
            },
        )
        .unwrap();
        id
    }

    #[test]
    fn test_filter_by_author_and_visibility() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let alice = fixtures::user(conn, "alice");
            let bob = fixtures::user(conn, "bob");
            let public = publish(conn, alice, Visibility::Public);
            publish(conn, alice, Visibility::Private);
            publish(conn, bob, Visibility::Public);

            let found = posts_by(conn, &[alice], &[Visibility::Public, Visibility::Friends])?;
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].id, public);
            assert_eq!(found[0].author.username, "alice");
            assert!(found[0].media.is_some());

            assert!(posts_by(conn, &[], &[Visibility::Public])?.is_empty());
            Ok::<_, DbError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_deleted_media_reads_as_none() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let alice = fixtures::user(conn, "alice");
            let id = publish(conn, alice, Visibility::Public);
            let row = find_post(conn, id)?.unwrap();
            soft_delete_media(conn, row.media_id)?;
            assert!(soft_delete_post(conn, id)?);

            let row = find_post(conn, id)?.unwrap();
            assert!(row.is_deleted);
            assert!(row.post.media.is_none());
            assert!(find_media(conn, row.media_id)?.is_none());
            assert!(media_for_user(conn, alice)?.is_empty());
            Ok::<_, DbError>(())
        })
        .unwrap();
    }
}
