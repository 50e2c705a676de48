//! The relationship store: one directed edge per unordered user pair.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use circle_types::models::{RelationStatus, Relationship, UserSummary};

use crate::error::{DbError, Result, conflict_or};
use crate::models::{parse_at, uuid_at};
use crate::pair_key;

const EDGE_COLUMNS: &str = "id, requester_id, target_id, status, created_at, updated_at";

fn map_edge(row: &Row<'_>) -> rusqlite::Result<Relationship> {
    Ok(Relationship {
        id: uuid_at(row, 0)?,
        requester_id: uuid_at(row, 1)?,
        target_id: uuid_at(row, 2)?,
        status: parse_at(row, 3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// The edge between `a` and `b` in either direction, optionally restricted
/// to one status.
pub fn find_edge(
    conn: &Connection,
    a: Uuid,
    b: Uuid,
    status: Option<RelationStatus>,
) -> Result<Option<Relationship>> {
    let key = pair_key(a, b);
    let edge = match status {
        Some(status) => conn
            .query_row(
                &format!(
                    "SELECT {} FROM relationships WHERE pair_key = ?1 AND status = ?2",
                    EDGE_COLUMNS
                ),
                (key, status.as_str()),
                map_edge,
            )
            .optional()?,
        None => conn
            .query_row(
                &format!("SELECT {} FROM relationships WHERE pair_key = ?1", EDGE_COLUMNS),
                [key],
                map_edge,
            )
            .optional()?,
    };
    Ok(edge)
}

/// Insert a directed edge. Fails with `SelfRelation` when `from == to`, and
/// with `Conflict` when the pair already has an edge in either direction.
pub fn create_edge(
    conn: &Connection,
    from: Uuid,
    to: Uuid,
    status: RelationStatus,
) -> Result<Relationship> {
    if from == to {
        return Err(DbError::SelfRelation);
    }

    let now = Utc::now();
    let edge = Relationship {
        id: Uuid::new_v4(),
        requester_id: from,
        target_id: to,
        status,
        created_at: now,
        updated_at: now,
    };

    conn.execute(
        "INSERT INTO relationships (id, requester_id, target_id, status, pair_key, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        rusqlite::params![
            edge.id.to_string(),
            from.to_string(),
            to.to_string(),
            status.as_str(),
            pair_key(from, to),
            now
        ],
    )
    .map_err(|e| conflict_or(e, "A relationship already exists between these users"))?;

    Ok(edge)
}

/// Returns false when no edge has this id.
pub fn set_status(conn: &Connection, edge_id: Uuid, status: RelationStatus) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE relationships SET status = ?2, updated_at = ?3 WHERE id = ?1",
        rusqlite::params![edge_id.to_string(), status.as_str(), Utc::now()],
    )?;
    Ok(changed > 0)
}

/// Remove every edge between the pair, whatever its direction or status.
pub fn delete_edges(conn: &Connection, a: Uuid, b: Uuid) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM relationships WHERE pair_key = ?1",
        [pair_key(a, b)],
    )?)
}

/// Edges with `status` where the user is on either end.
pub fn edges_touching(
    conn: &Connection,
    user_id: Uuid,
    status: RelationStatus,
) -> Result<Vec<Relationship>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM relationships
         WHERE (requester_id = ?1 OR target_id = ?1) AND status = ?2
         ORDER BY created_at",
        EDGE_COLUMNS
    ))?;
    let edges = stmt
        .query_map((user_id.to_string(), status.as_str()), map_edge)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(edges)
}

/// Users the given user has an outgoing edge to, oldest edge first.
pub fn targets_of(
    conn: &Connection,
    requester_id: Uuid,
    status: RelationStatus,
) -> Result<Vec<UserSummary>> {
    counterparts(conn, "r.requester_id", "r.target_id", requester_id, status)
}

/// Users with an edge pointing at the given user, oldest edge first.
pub fn requesters_of(
    conn: &Connection,
    target_id: Uuid,
    status: RelationStatus,
) -> Result<Vec<UserSummary>> {
    counterparts(conn, "r.target_id", "r.requester_id", target_id, status)
}

fn counterparts(
    conn: &Connection,
    own_column: &str,
    other_column: &str,
    user_id: Uuid,
    status: RelationStatus,
) -> Result<Vec<UserSummary>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT u.id, u.username, u.display_name, u.avatar_url
         FROM relationships r
         JOIN users u ON u.id = {}
         WHERE {} = ?1 AND r.status = ?2
         ORDER BY r.created_at",
        other_column, own_column
    ))?;
    let users = stmt
        .query_map((user_id.to_string(), status.as_str()), |row| {
            Ok(UserSummary {
                id: uuid_at(row, 0)?,
                username: row.get(1)?,
                display_name: row.get(2)?,
                avatar_url: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(users)
}
