use rusqlite::Connection;
use tracing::info;

use crate::Result;

/// Id of the role every new account receives.
pub const DEFAULT_ROLE_ID: &str = "00000000-0000-0000-0000-000000000001";
pub const DEFAULT_ROLE_NAME: &str = "USER";

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id           TEXT PRIMARY KEY,
            username     TEXT NOT NULL UNIQUE,
            display_name TEXT,
            email        TEXT NOT NULL UNIQUE,
            password     TEXT NOT NULL,
            avatar_url   TEXT,
            is_deleted   INTEGER NOT NULL DEFAULT 0,
            is_locked    INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS roles (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL UNIQUE,
            description TEXT
        );

        CREATE TABLE IF NOT EXISTS user_roles (
            user_id TEXT NOT NULL REFERENCES users(id),
            role_id TEXT NOT NULL REFERENCES roles(id),
            PRIMARY KEY (user_id, role_id)
        );

        -- One row per unordered pair: pair_key is 'min:max'.
        CREATE TABLE IF NOT EXISTS relationships (
            id           TEXT PRIMARY KEY,
            requester_id TEXT NOT NULL REFERENCES users(id),
            target_id    TEXT NOT NULL REFERENCES users(id),
            status       TEXT NOT NULL CHECK (status IN ('pending', 'accepted', 'blocked')),
            pair_key     TEXT NOT NULL UNIQUE,
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL,
            CHECK (requester_id <> target_id)
        );

        CREATE INDEX IF NOT EXISTS idx_relationships_requester
            ON relationships(requester_id, status);
        CREATE INDEX IF NOT EXISTS idx_relationships_target
            ON relationships(target_id, status);

        CREATE TABLE IF NOT EXISTS media (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id),
            media_type  TEXT NOT NULL CHECK (media_type IN ('image', 'video', 'audio')),
            storage_key TEXT NOT NULL,
            url         TEXT NOT NULL,
            size_bytes  INTEGER NOT NULL CHECK (size_bytes >= 0),
            is_deleted  INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_media_user ON media(user_id);

        CREATE TABLE IF NOT EXISTS posts (
            id         TEXT PRIMARY KEY,
            user_id    TEXT NOT NULL REFERENCES users(id),
            media_id   TEXT NOT NULL REFERENCES media(id),
            caption    TEXT CHECK (caption IS NULL OR length(caption) <= 255),
            visibility TEXT NOT NULL CHECK (visibility IN ('public', 'private', 'friends')),
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_posts_user ON posts(user_id, created_at);

        CREATE TABLE IF NOT EXISTS conversations (
            id         TEXT PRIMARY KEY,
            is_group   INTEGER NOT NULL DEFAULT 0,
            direct_key TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- At most one live direct conversation per unordered pair.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_direct
            ON conversations(direct_key)
            WHERE direct_key IS NOT NULL AND is_deleted = 0;

        CREATE TABLE IF NOT EXISTS conversation_participants (
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            user_id         TEXT NOT NULL REFERENCES users(id),
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON conversation_participants(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sender_id       TEXT NOT NULL REFERENCES users(id),
            content         TEXT NOT NULL,
            message_type    TEXT NOT NULL CHECK (message_type IN ('text', 'image', 'video', 'post')),
            post_id         TEXT REFERENCES posts(id),
            post_caption    TEXT,
            post_media_url  TEXT,
            is_read         INTEGER NOT NULL DEFAULT 0,
            is_deleted      INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);
        ",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO roles (id, name, description) VALUES (?1, ?2, 'User role')",
        (DEFAULT_ROLE_ID, DEFAULT_ROLE_NAME),
    )?;

    info!("Database migrations complete");
    Ok(())
}
