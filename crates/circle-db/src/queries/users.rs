use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use circle_types::models::{Role, RoleRef, UserSummary};

use crate::error::{DbError, Result, conflict_or};
use crate::models::{UserRow, placeholders, uuid_at};

pub struct NewUser<'a> {
    pub id: Uuid,
    pub username: &'a str,
    pub display_name: Option<&'a str>,
    pub email: &'a str,
    pub password_hash: &'a str,
}

const USER_COLUMNS: &str =
    "id, username, display_name, email, password, avatar_url, is_deleted, is_locked, created_at";

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: uuid_at(row, 0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        email: row.get(3)?,
        password: row.get(4)?,
        avatar_url: row.get(5)?,
        is_deleted: row.get(6)?,
        is_locked: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn map_summary(row: &Row<'_>) -> rusqlite::Result<UserSummary> {
    Ok(UserSummary {
        id: uuid_at(row, 0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        avatar_url: row.get(3)?,
    })
}

pub fn insert_user(conn: &Connection, user: &NewUser<'_>) -> Result<()> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO users (id, username, display_name, email, password, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        rusqlite::params![
            user.id.to_string(),
            user.username,
            user.display_name,
            user.email,
            user.password_hash,
            now
        ],
    )
    .map_err(|e| conflict_or(e, "Username or email already exists"))?;
    Ok(())
}

pub fn find_user(conn: &Connection, id: Uuid) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    Ok(conn.query_row(&sql, [id.to_string()], map_user).optional()?)
}

pub fn find_user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS);
    Ok(conn.query_row(&sql, [username], map_user).optional()?)
}

/// Whether a live (not soft-deleted) account exists with this id.
pub fn active_user_exists(conn: &Connection, id: Uuid) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE id = ?1 AND is_deleted = 0",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Summaries for the given ids, in username order. Unknown ids are skipped.
pub fn user_summaries(conn: &Connection, ids: &[Uuid]) -> Result<Vec<UserSummary>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }

    let sql = format!(
        "SELECT id, username, display_name, avatar_url FROM users WHERE id IN ({}) ORDER BY username",
        placeholders(1, ids.len())
    );
    let params: Vec<String> = ids.iter().map(Uuid::to_string).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), map_summary)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn update_profile(
    conn: &Connection,
    id: Uuid,
    display_name: Option<&str>,
    avatar_url: Option<&str>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE users
         SET display_name = COALESCE(?2, display_name),
             avatar_url = COALESCE(?3, avatar_url),
             updated_at = ?4
         WHERE id = ?1 AND is_deleted = 0",
        rusqlite::params![id.to_string(), display_name, avatar_url, Utc::now()],
    )?;
    Ok(changed > 0)
}

// -- Roles --

fn map_role(row: &Row<'_>) -> rusqlite::Result<Role> {
    Ok(Role {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        description: row.get(2)?,
    })
}

pub fn find_role_by_name(conn: &Connection, name: &str) -> Result<Option<Role>> {
    Ok(conn
        .query_row(
            "SELECT id, name, description FROM roles WHERE name = ?1",
            [name],
            map_role,
        )
        .optional()?)
}

pub fn assign_role(conn: &Connection, user_id: Uuid, role_id: Uuid) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO user_roles (user_id, role_id) VALUES (?1, ?2)",
        (user_id.to_string(), role_id.to_string()),
    )?;
    Ok(())
}

/// The user's roles as bare references.
pub fn role_refs(conn: &Connection, user_id: Uuid) -> Result<Vec<RoleRef>> {
    let mut stmt =
        conn.prepare("SELECT role_id FROM user_roles WHERE user_id = ?1 ORDER BY role_id")?;
    let refs = stmt
        .query_map([user_id.to_string()], |row| uuid_at(row, 0).map(RoleRef::Reference))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(refs)
}

/// Expand every `RoleRef::Reference` into its record. References to roles
/// that no longer exist are kept as references.
pub fn populate_roles(conn: &Connection, refs: Vec<RoleRef>) -> Result<Vec<RoleRef>> {
    let mut stmt = conn.prepare("SELECT id, name, description FROM roles WHERE id = ?1")?;
    refs.into_iter()
        .map(|role| match role {
            RoleRef::Reference(id) => Ok(stmt
                .query_row([id.to_string()], map_role)
                .optional()?
                .map_or(RoleRef::Reference(id), RoleRef::Expanded)),
            expanded => Ok(expanded),
        })
        .collect::<std::result::Result<Vec<_>, DbError>>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::migrations::{DEFAULT_ROLE_ID, DEFAULT_ROLE_NAME};
    use crate::queries::fixtures;

    #[test]
    fn test_duplicate_username_is_conflict() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            fixtures::user(conn, "alice");
            let err = insert_user(
                conn,
                &NewUser {
                    id: Uuid::new_v4(),
                    username: "alice",
                    display_name: None,
                    email: "other@example.com",
                    password_hash: "x",
                },
            )
            .unwrap_err();
            assert!(matches!(err, DbError::Conflict(_)));
            Ok::<_, DbError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_populate_expands_default_role() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let alice = fixtures::user(conn, "alice");
            let role = find_role_by_name(conn, DEFAULT_ROLE_NAME)?.unwrap();
            assert_eq!(role.id.to_string(), DEFAULT_ROLE_ID);
            assign_role(conn, alice, role.id)?;
            assign_role(conn, alice, role.id)?;

            let refs = role_refs(conn, alice)?;
            assert_eq!(refs, vec![RoleRef::Reference(role.id)]);

            let populated = populate_roles(conn, refs)?;
            assert_eq!(populated, vec![RoleRef::Expanded(role)]);
            Ok::<_, DbError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_summaries_skip_unknown_ids() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let bob = fixtures::user(conn, "bob");
            let alice = fixtures::user(conn, "alice");
            let found = user_summaries(conn, &[bob, Uuid::new_v4(), alice])?;
            let names: Vec<_> = found.iter().map(|u| u.username.as_str()).collect();
            assert_eq!(names, vec!["alice", "bob"]);
            Ok::<_, DbError>(())
        })
        .unwrap();
    }
}
