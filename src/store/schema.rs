//! SQLite DDL for the chat store.
//!
//! All `CREATE TABLE` / `CREATE INDEX` statements live here so they are
//! reviewable and testable in isolation.

use rusqlite::Connection;

pub(crate) const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Complete DDL for the chat database.
///
/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for concurrent reads during writes.
PRAGMA journal_mode = WAL;

-- Schema version tracking.
CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Session transcript. AUTOINCREMENT keeps ids monotonic even across
-- deletes, so per-session ordering by id is stable.
CREATE TABLE IF NOT EXISTS messages (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id     INTEGER NOT NULL,
    content        TEXT NOT NULL,
    sender_name    TEXT NOT NULL,
    sender_user_id TEXT,
    sender_kind    TEXT NOT NULL,      -- snake_case SenderKind variant
    kind           TEXT NOT NULL,      -- snake_case MessageKind variant
    character_id   INTEGER,
    created_at     INTEGER NOT NULL,   -- epoch milliseconds
    ai_metadata    TEXT                -- JSON blob, AI replies only
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id);

-- Per-(session, NPC) activation state.
CREATE TABLE IF NOT EXISTS npc_states (
    session_id            INTEGER NOT NULL,
    npc_id                INTEGER NOT NULL,
    npc_name              TEXT NOT NULL,
    active                INTEGER NOT NULL DEFAULT 0,
    visible               INTEGER NOT NULL DEFAULT 0,
    interaction_frequency INTEGER NOT NULL DEFAULT 0,
    personality           TEXT,
    last_modified_by      TEXT,
    last_modified_at      INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (session_id, npc_id)
);

-- Long-term NPC memory. Soft-deleted via `active`, never hard-deleted.
CREATE TABLE IF NOT EXISTS npc_memories (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    npc_id           INTEGER NOT NULL,
    session_id       INTEGER NOT NULL,
    content          TEXT NOT NULL,
    memory_type      TEXT NOT NULL DEFAULT '',
    importance       INTEGER NOT NULL DEFAULT 1,
    tags             TEXT NOT NULL DEFAULT '[]',  -- JSON array of strings
    related_entities TEXT NOT NULL DEFAULT '[]',  -- JSON array of strings
    created_at       INTEGER NOT NULL DEFAULT 0,
    last_accessed_at INTEGER NOT NULL DEFAULT 0,
    access_count     INTEGER NOT NULL DEFAULT 0,
    active           INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_memories_owner ON npc_memories(npc_id, session_id, active);
"#;

/// Apply the full schema to an open connection.
///
/// Safe to call multiple times — all statements use `IF NOT EXISTS`.
/// Seeds the schema version on a fresh database.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    let version_str = CURRENT_SCHEMA_VERSION.to_string();
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        rusqlite::params![version_str],
    )?;

    Ok(())
}

/// Read the current schema version from the database.
///
/// Returns `None` if the `schema_meta` table is empty or the key is missing.
pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_meta WHERE key = 'schema_version'")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().ok())
        }
        None => Ok(None),
    }
}
