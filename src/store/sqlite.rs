//! SQLite-backed implementation of the store traits.
//!
//! One database file (or the in-memory database) holds the session
//! transcript, NPC activation states, and long-term NPC memory. Thread-safe
//! via an internal `Mutex<Connection>`: all writes are serialized; WAL mode
//! keeps concurrent readers cheap on the SQLite side.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, Row, params};

use super::schema::{apply_schema, read_schema_version};
use super::{MemoryMerge, MemoryStore, MessageStore, NewMemory, NewMessage, NpcStateStore};
use crate::error::{ChatError, Result};
use crate::memory::MemoryEntry;
use crate::message::{
    Message, display_message_kind, display_sender_kind, now_epoch_millis, parse_message_kind,
    parse_sender_kind,
};
use crate::npc::NpcActivationState;

/// SQLite-backed chat store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a fresh in-memory database. Contents are lost on drop.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Read the schema version stamp.
    pub fn schema_version(&self) -> Result<Option<u32>> {
        let conn = self.lock()?;
        Ok(read_schema_version(&conn)?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ChatError::Storage("store mutex poisoned".to_owned()))
    }
}

const MESSAGE_COLUMNS: &str = "id, session_id, content, sender_name, sender_user_id, \
     sender_kind, kind, character_id, created_at, ai_metadata";

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let sender_kind_str: String = row.get(5)?;
    let kind_str: String = row.get(6)?;
    let metadata_str: Option<String> = row.get(9)?;
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        content: row.get(2)?,
        sender_name: row.get(3)?,
        sender_user_id: row.get(4)?,
        sender_kind: parse_sender_kind(&sender_kind_str).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(5, sender_kind_str, rusqlite::types::Type::Text)
        })?,
        kind: parse_message_kind(&kind_str).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(6, kind_str, rusqlite::types::Type::Text)
        })?,
        character_id: row.get(7)?,
        created_at: row.get(8)?,
        ai_metadata: metadata_str.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn row_to_npc_state(row: &Row<'_>) -> rusqlite::Result<NpcActivationState> {
    Ok(NpcActivationState {
        session_id: row.get(0)?,
        npc_id: row.get(1)?,
        npc_name: row.get(2)?,
        active: row.get(3)?,
        visible: row.get(4)?,
        interaction_frequency: row.get::<_, i64>(5)?.clamp(0, 100) as u8,
        personality: row.get(6)?,
        last_modified_by: row.get(7)?,
        last_modified_at: row.get(8)?,
    })
}

const MEMORY_COLUMNS: &str = "id, npc_id, session_id, content, memory_type, importance, \
     tags, related_entities, created_at, last_accessed_at, access_count, active";

fn row_to_memory(row: &Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let tags_json: String = row.get(6)?;
    let entities_json: String = row.get(7)?;
    Ok(MemoryEntry {
        id: row.get(0)?,
        npc_id: row.get(1)?,
        session_id: row.get(2)?,
        content: row.get(3)?,
        memory_type: row.get(4)?,
        importance: row.get::<_, i64>(5)?.clamp(1, 10) as u8,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        related_entities: serde_json::from_str(&entities_json).unwrap_or_default(),
        created_at: row.get(8)?,
        last_accessed_at: row.get(9)?,
        access_count: row.get(10)?,
        active: row.get(11)?,
    })
}

impl MessageStore for SqliteStore {
    fn insert_message(&self, new: &NewMessage) -> Result<Message> {
        let conn = self.lock()?;
        let created_at = now_epoch_millis();
        let metadata_json = new
            .ai_metadata
            .as_ref()
            .map(|v| v.to_string());

        conn.execute(
            "INSERT INTO messages \
             (session_id, content, sender_name, sender_user_id, sender_kind, kind, \
              character_id, created_at, ai_metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                new.session_id,
                new.content,
                new.sender_name,
                new.sender_user_id,
                display_sender_kind(new.sender_kind),
                display_message_kind(new.kind),
                new.character_id,
                created_at,
                metadata_json,
            ],
        )?;
        let id = conn.last_insert_rowid();

        Ok(Message {
            id,
            session_id: new.session_id,
            content: new.content.clone(),
            sender_name: new.sender_name.clone(),
            sender_user_id: new.sender_user_id.clone(),
            sender_kind: new.sender_kind,
            kind: new.kind,
            character_id: new.character_id,
            created_at,
            ai_metadata: new.ai_metadata.clone(),
        })
    }

    fn messages_after(
        &self,
        session_id: i64,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE session_id = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![session_id, after_id.unwrap_or(0), limit as i64],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for r in rows {
            messages.push(r?);
        }
        Ok(messages)
    }

    fn recent_messages(&self, session_id: i64, limit: usize) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![session_id, limit as i64], row_to_message)?;

        let mut messages = Vec::new();
        for r in rows {
            messages.push(r?);
        }
        // Fetched newest-first; callers want transcript order.
        messages.reverse();
        Ok(messages)
    }
}

impl NpcStateStore for SqliteStore {
    fn npc_state(&self, session_id: i64, npc_id: i64) -> Result<Option<NpcActivationState>> {
        let conn = self.lock()?;
        let state = conn
            .query_row(
                "SELECT session_id, npc_id, npc_name, active, visible, interaction_frequency, \
                 personality, last_modified_by, last_modified_at \
                 FROM npc_states WHERE session_id = ?1 AND npc_id = ?2",
                params![session_id, npc_id],
                row_to_npc_state,
            )
            .optional()?;
        Ok(state)
    }

    fn upsert_npc_state(&self, state: &NpcActivationState) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO npc_states \
             (session_id, npc_id, npc_name, active, visible, interaction_frequency, \
              personality, last_modified_by, last_modified_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                state.session_id,
                state.npc_id,
                state.npc_name,
                state.active,
                state.visible,
                state.frequency() as i64,
                state.personality,
                state.last_modified_by,
                now_epoch_millis(),
            ],
        )?;
        Ok(())
    }

    fn active_visible_npcs(&self, session_id: i64) -> Result<Vec<NpcActivationState>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, npc_id, npc_name, active, visible, interaction_frequency, \
             personality, last_modified_by, last_modified_at \
             FROM npc_states WHERE session_id = ?1 AND active = 1 AND visible = 1 \
             ORDER BY npc_id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], row_to_npc_state)?;

        let mut states = Vec::new();
        for r in rows {
            states.push(r?);
        }
        Ok(states)
    }
}

impl MemoryStore for SqliteStore {
    fn insert_memory(&self, new: &NewMemory) -> Result<i64> {
        let conn = self.lock()?;
        let now = now_epoch_millis();
        let tags_json = serde_json::to_string(&new.tags).unwrap_or_else(|_| "[]".to_owned());
        let entities_json =
            serde_json::to_string(&new.related_entities).unwrap_or_else(|_| "[]".to_owned());

        conn.execute(
            "INSERT INTO npc_memories \
             (npc_id, session_id, content, memory_type, importance, tags, related_entities, \
              created_at, last_accessed_at, access_count, active) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 0, 1)",
            params![
                new.npc_id,
                new.session_id,
                new.content,
                new.memory_type,
                new.importance.clamp(1, 10) as i64,
                tags_json,
                entities_json,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn memory(&self, id: i64) -> Result<Option<MemoryEntry>> {
        let conn = self.lock()?;
        let entry = conn
            .query_row(
                &format!("SELECT {MEMORY_COLUMNS} FROM npc_memories WHERE id = ?1"),
                params![id],
                row_to_memory,
            )
            .optional()?;
        Ok(entry)
    }

    fn apply_merge(&self, merge: &MemoryMerge) -> Result<()> {
        let conn = self.lock()?;
        let tags_json = serde_json::to_string(&merge.tags).unwrap_or_else(|_| "[]".to_owned());
        let rows = conn.execute(
            "UPDATE npc_memories SET content = ?1, tags = ?2, importance = ?3, \
             last_accessed_at = ?4 WHERE id = ?5 AND active = 1",
            params![
                merge.content,
                tags_json,
                merge.importance.clamp(1, 10) as i64,
                now_epoch_millis(),
                merge.target_id,
            ],
        )?;
        if rows == 0 {
            return Err(ChatError::Storage(format!(
                "merge target {} not found or inactive",
                merge.target_id
            )));
        }
        Ok(())
    }

    fn recent_memories(
        &self,
        npc_id: i64,
        session_id: i64,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM npc_memories \
             WHERE npc_id = ?1 AND session_id = ?2 AND active = 1 \
             ORDER BY created_at DESC, id DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![npc_id, session_id, limit as i64], row_to_memory)?;

        let mut entries = Vec::new();
        for r in rows {
            entries.push(r?);
        }

        // Access bookkeeping for every row handed to a prompt.
        let now = now_epoch_millis();
        for entry in &mut entries {
            conn.execute(
                "UPDATE npc_memories SET access_count = access_count + 1, \
                 last_accessed_at = ?1 WHERE id = ?2",
                params![now, entry.id],
            )?;
            entry.access_count = entry.access_count.saturating_add(1);
            entry.last_accessed_at = now;
        }
        Ok(entries)
    }

    fn prune_low_importance(&self, npc_id: i64, session_id: i64, keep: usize) -> Result<usize> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE npc_memories SET active = 0 WHERE id IN ( \
               SELECT id FROM npc_memories \
               WHERE npc_id = ?1 AND session_id = ?2 AND active = 1 \
               ORDER BY importance DESC, created_at DESC LIMIT -1 OFFSET ?3)",
            params![npc_id, session_id, keep as i64],
        )?;
        Ok(rows)
    }

    fn active_memory_count(&self, npc_id: i64, session_id: i64) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM npc_memories \
             WHERE npc_id = ?1 AND session_id = ?2 AND active = 1",
            params![npc_id, session_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::message::{MessageKind, SenderKind};

    fn new_message(session_id: i64, content: &str) -> NewMessage {
        NewMessage {
            session_id,
            content: content.to_owned(),
            sender_name: "Ayla".to_owned(),
            sender_user_id: Some("u-1".to_owned()),
            sender_kind: SenderKind::User,
            kind: MessageKind::Player,
            character_id: None,
            ai_metadata: None,
        }
    }

    fn new_memory(npc_id: i64, content: &str, importance: u8) -> NewMemory {
        NewMemory {
            npc_id,
            session_id: 1,
            content: content.to_owned(),
            memory_type: "fact".to_owned(),
            importance,
            tags: vec!["quest".to_owned()],
            related_entities: vec!["Ayla".to_owned()],
        }
    }

    #[test]
    fn message_ids_are_monotonic_within_session() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.insert_message(&new_message(1, "one")).unwrap();
        let second = store.insert_message(&new_message(1, "two")).unwrap();
        assert!(second.id > first.id);

        let all = store.messages_after(1, None, 100).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn messages_after_filters_by_id_and_session() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.insert_message(&new_message(1, "one")).unwrap();
        store.insert_message(&new_message(1, "two")).unwrap();
        store.insert_message(&new_message(2, "other session")).unwrap();

        let tail = store.messages_after(1, Some(first.id), 100).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].content, "two");
    }

    #[test]
    fn recent_messages_returns_transcript_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .insert_message(&new_message(1, &format!("m{i}")))
                .unwrap();
        }
        let recent = store.recent_messages(1, 3).unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn message_round_trips_kinds_and_metadata() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut new = new_message(1, "a reply");
        new.sender_kind = SenderKind::Ai;
        new.kind = MessageKind::AiReply;
        new.character_id = Some(9);
        new.ai_metadata = Some(serde_json::json!({"priority": 7}));
        let inserted = store.insert_message(&new).unwrap();

        let fetched = store.messages_after(1, None, 10).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, inserted.id);
        assert_eq!(fetched[0].sender_kind, SenderKind::Ai);
        assert_eq!(fetched[0].kind, MessageKind::AiReply);
        assert_eq!(fetched[0].character_id, Some(9));
        assert_eq!(
            fetched[0].ai_metadata.as_ref().unwrap()["priority"],
            serde_json::json!(7)
        );
    }

    #[test]
    fn npc_state_upsert_and_roster() {
        let store = SqliteStore::open_in_memory().unwrap();
        let state = NpcActivationState {
            session_id: 1,
            npc_id: 7,
            npc_name: "Mira".to_owned(),
            active: true,
            visible: true,
            interaction_frequency: 40,
            personality: Some("wry, cautious".to_owned()),
            last_modified_by: Some("narrator".to_owned()),
            last_modified_at: 0,
        };
        store.upsert_npc_state(&state).unwrap();

        let fetched = store.npc_state(1, 7).unwrap().unwrap();
        assert_eq!(fetched.npc_name, "Mira");
        assert!(fetched.last_modified_at > 0);

        let mut hidden = state.clone();
        hidden.npc_id = 8;
        hidden.visible = false;
        store.upsert_npc_state(&hidden).unwrap();

        let roster = store.active_visible_npcs(1).unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].npc_id, 7);
    }

    #[test]
    fn memory_insert_fetch_and_merge() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert_memory(&new_memory(7, "met the party", 4)).unwrap();

        store
            .apply_merge(&MemoryMerge {
                target_id: id,
                content: "met the party at the tavern".to_owned(),
                tags: vec!["quest".to_owned(), "tavern".to_owned()],
                importance: 6,
            })
            .unwrap();

        let entry = store.memory(id).unwrap().unwrap();
        assert_eq!(entry.content, "met the party at the tavern");
        assert_eq!(entry.importance, 6);
        assert_eq!(entry.tags.len(), 2);
        assert_eq!(store.active_memory_count(7, 1).unwrap(), 1);
    }

    #[test]
    fn merge_into_missing_target_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .apply_merge(&MemoryMerge {
                target_id: 999,
                content: "x".to_owned(),
                tags: vec![],
                importance: 1,
            })
            .unwrap_err();
        assert!(matches!(err, ChatError::Storage(_)));
    }

    #[test]
    fn recent_memories_bump_access_count() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.insert_memory(&new_memory(7, "a fact", 5)).unwrap();

        let first = store.recent_memories(7, 1, 10).unwrap();
        assert_eq!(first[0].access_count, 1);

        let again = store.recent_memories(7, 1, 10).unwrap();
        assert_eq!(again[0].access_count, 2);
        assert_eq!(again[0].id, id);
    }

    #[test]
    fn prune_soft_deactivates_lowest_importance() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (content, importance) in [("low", 2), ("mid", 5), ("high", 9)] {
            store.insert_memory(&new_memory(7, content, importance)).unwrap();
        }

        let pruned = store.prune_low_importance(7, 1, 2).unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.active_memory_count(7, 1).unwrap(), 2);

        // Soft delete: the row still exists, flagged inactive.
        let survivors = store.recent_memories(7, 1, 10).unwrap();
        assert!(survivors.iter().all(|m| m.content != "low"));
    }
}
