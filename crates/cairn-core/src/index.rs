//! SQLite persistence for checkpoint entries and timeline cursors.
//!
//! Git refs hold the snapshots themselves; this index holds what the refs
//! cannot: which conversation node each snapshot is bound to, the node
//! summary shown in timeline listings, and the undo/redo cursor.

use crate::Result;
use cairn_types::{CheckpointEntry, CheckpointRole, NodeId, NodeSummary, SessionId, Snapshot};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

const SCHEMA_VERSION: i32 = 1;

/// Persisted per-session bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    pub session_id: SessionId,
    pub project_dir: PathBuf,
    /// Next sequence number the registry will allocate.
    pub next_sequence: u64,
    pub created_at: DateTime<Utc>,
}

/// SQLite-based checkpoint index.
pub struct CheckpointIndex {
    conn: Mutex<Connection>,
}

impl CheckpointIndex {
    /// Open or create the index at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Create an index from an existing connection.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        let index = Self {
            conn: Mutex::new(conn),
        };
        index.migrate()?;
        Ok(index)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring the schema up to [`SCHEMA_VERSION`].
    fn migrate(&self) -> Result<()> {
        let conn = self.conn();
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS checkpoint_sessions (
                    session_id TEXT PRIMARY KEY,
                    project_dir TEXT NOT NULL,
                    next_sequence INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS checkpoint_entries (
                    session_id TEXT NOT NULL,
                    sequence INTEGER NOT NULL,
                    node_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    ref_name TEXT NOT NULL,
                    object_id TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    node_timestamp TEXT NOT NULL,
                    excerpt TEXT NOT NULL DEFAULT '',
                    PRIMARY KEY (session_id, sequence),
                    FOREIGN KEY (session_id) REFERENCES checkpoint_sessions(session_id) ON DELETE CASCADE
                );

                CREATE INDEX IF NOT EXISTS idx_checkpoint_entries_node
                    ON checkpoint_entries(session_id, node_id);

                CREATE TABLE IF NOT EXISTS timeline_cursors (
                    session_id TEXT PRIMARY KEY,
                    sequence INTEGER,
                    FOREIGN KEY (session_id) REFERENCES checkpoint_sessions(session_id) ON DELETE CASCADE
                );
                "#,
            )?;
        }

        if version < SCHEMA_VERSION {
            conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
            debug!(target: "cairn::index", "Migrated checkpoint index from v{} to v{}", version, SCHEMA_VERSION);
        }
        Ok(())
    }

    /// Record a session, keeping the existing row if there is one.
    pub fn upsert_session(&self, session_id: &SessionId, project_dir: &Path) -> Result<SessionRow> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO checkpoint_sessions (session_id, project_dir, next_sequence, created_at)
            VALUES (?1, ?2, 1, ?3)
            ON CONFLICT(session_id) DO NOTHING
            "#,
            params![
                session_id.as_str(),
                project_dir.to_string_lossy(),
                Utc::now().to_rfc3339()
            ],
        )?;
        let row = conn.query_row(
            "SELECT * FROM checkpoint_sessions WHERE session_id = ?1",
            params![session_id.as_str()],
            Self::row_to_session,
        )?;
        Ok(row)
    }

    pub fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRow>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT * FROM checkpoint_sessions WHERE session_id = ?1",
                params![session_id.as_str()],
                Self::row_to_session,
            )
            .optional()?;
        Ok(row)
    }

    /// Insert `entry`, deleting `replaced` in the same transaction.
    pub fn insert_entry(
        &self,
        session_id: &SessionId,
        entry: &CheckpointEntry,
        replaced: Option<&CheckpointEntry>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if let Some(old) = replaced {
            tx.execute(
                "DELETE FROM checkpoint_entries WHERE session_id = ?1 AND sequence = ?2",
                params![session_id.as_str(), old.sequence as i64],
            )?;
        }
        tx.execute(
            r#"
            INSERT INTO checkpoint_entries (
                session_id, sequence, node_id, role, ref_name, object_id,
                created_at, node_timestamp, excerpt
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                session_id.as_str(),
                entry.sequence as i64,
                entry.node_id.as_str(),
                entry.role.as_str(),
                entry.snapshot.ref_name,
                entry.snapshot.object_id,
                entry.snapshot.created_at.to_rfc3339(),
                entry.summary.timestamp.to_rfc3339(),
                entry.summary.excerpt,
            ],
        )?;
        tx.execute(
            r#"
            UPDATE checkpoint_sessions SET next_sequence = MAX(next_sequence, ?1)
            WHERE session_id = ?2
            "#,
            params![entry.sequence as i64 + 1, session_id.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_entry(&self, session_id: &SessionId, sequence: u64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM checkpoint_entries WHERE session_id = ?1 AND sequence = ?2",
            params![session_id.as_str(), sequence as i64],
        )?;
        Ok(())
    }

    /// All entries of a session in sequence order.
    pub fn list_entries(&self, session_id: &SessionId) -> Result<Vec<CheckpointEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM checkpoint_entries WHERE session_id = ?1 ORDER BY sequence ASC",
        )?;
        let entries = stmt
            .query_map(params![session_id.as_str()], Self::row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn set_cursor(&self, session_id: &SessionId, sequence: Option<u64>) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO timeline_cursors (session_id, sequence) VALUES (?1, ?2)
            ON CONFLICT(session_id) DO UPDATE SET sequence = excluded.sequence
            "#,
            params![session_id.as_str(), sequence.map(|s| s as i64)],
        )?;
        Ok(())
    }

    pub fn get_cursor(&self, session_id: &SessionId) -> Result<Option<u64>> {
        let conn = self.conn();
        let cursor: Option<Option<i64>> = conn
            .query_row(
                "SELECT sequence FROM timeline_cursors WHERE session_id = ?1",
                params![session_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor.flatten().map(|s| s as u64))
    }

    /// Remove a session's checkpoint entries and cursor. The session row and
    /// its sequence counter are kept. Returns the number of entries removed.
    pub fn clear_session(&self, session_id: &SessionId) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM checkpoint_entries WHERE session_id = ?1",
            params![session_id.as_str()],
        )?;
        tx.execute(
            "DELETE FROM timeline_cursors WHERE session_id = ?1",
            params![session_id.as_str()],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<SessionRow> {
        let session_id: String = row.get("session_id")?;
        let project_dir: String = row.get("project_dir")?;
        let next_sequence: i64 = row.get("next_sequence")?;
        let created_at: String = row.get("created_at")?;

        Ok(SessionRow {
            session_id: SessionId::new(session_id).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
            })?,
            project_dir: project_dir.into(),
            next_sequence: next_sequence.max(1) as u64,
            created_at: parse_time(&created_at),
        })
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<CheckpointEntry> {
        let sequence: i64 = row.get("sequence")?;
        let node_id: String = row.get("node_id")?;
        let role: String = row.get("role")?;
        let ref_name: String = row.get("ref_name")?;
        let object_id: String = row.get("object_id")?;
        let created_at: String = row.get("created_at")?;
        let node_timestamp: String = row.get("node_timestamp")?;
        let excerpt: String = row.get("excerpt")?;

        let role: CheckpointRole = role.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?;

        Ok(CheckpointEntry {
            node_id: NodeId::new(node_id),
            role,
            sequence: sequence as u64,
            snapshot: Snapshot {
                ref_name,
                object_id,
                created_at: parse_time(&created_at),
            },
            summary: NodeSummary {
                timestamp: parse_time(&node_timestamp),
                excerpt,
            },
        })
    }
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_index() -> (CheckpointIndex, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let index = CheckpointIndex::open(&temp_dir.path().join("cairn.db")).unwrap();
        (index, temp_dir)
    }

    fn entry(sequence: u64, role: CheckpointRole, node: &str) -> CheckpointEntry {
        CheckpointEntry {
            node_id: NodeId::from(node),
            role,
            sequence,
            snapshot: Snapshot {
                ref_name: role.ref_name(sequence, Utc::now()),
                object_id: format!("{:040x}", sequence),
                created_at: Utc::now(),
            },
            summary: NodeSummary::new(Utc::now(), Some("make the tests pass")),
        }
    }

    #[test]
    fn test_session_upsert_keeps_first_row() {
        let (index, _dir) = create_test_index();
        let sid = SessionId::new("s1").unwrap();

        let first = index.upsert_session(&sid, Path::new("/work/a")).unwrap();
        let second = index.upsert_session(&sid, Path::new("/work/b")).unwrap();
        assert_eq!(first.project_dir, PathBuf::from("/work/a"));
        assert_eq!(second.project_dir, PathBuf::from("/work/a"));
        assert_eq!(second.next_sequence, 1);
    }

    #[test]
    fn test_entry_crud_and_sequence_bump() {
        let (index, _dir) = create_test_index();
        let sid = SessionId::new("s1").unwrap();
        index.upsert_session(&sid, Path::new("/work")).unwrap();

        index.insert_entry(&sid, &entry(1, CheckpointRole::Resume, "start"), None).unwrap();
        index.insert_entry(&sid, &entry(2, CheckpointRole::User, "u1"), None).unwrap();

        let entries = index.list_entries(&sid).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].role, CheckpointRole::Resume);
        assert_eq!(entries[1].node_id, NodeId::from("u1"));
        assert_eq!(entries[1].summary.excerpt, "make the tests pass");
        assert_eq!(index.get_session(&sid).unwrap().unwrap().next_sequence, 3);

        index.delete_entry(&sid, 2).unwrap();
        assert_eq!(index.list_entries(&sid).unwrap().len(), 1);
    }

    #[test]
    fn test_replace_is_transactional() {
        let (index, _dir) = create_test_index();
        let sid = SessionId::new("s1").unwrap();
        index.upsert_session(&sid, Path::new("/work")).unwrap();

        let a1 = entry(3, CheckpointRole::Assistant, "a1");
        index.insert_entry(&sid, &a1, None).unwrap();
        let a2 = entry(5, CheckpointRole::Assistant, "a2");
        index.insert_entry(&sid, &a2, Some(&a1)).unwrap();

        let entries = index.list_entries(&sid).unwrap();
        assert_eq!(entries, vec![a2]);
    }

    #[test]
    fn test_cursor_round_trip() {
        let (index, _dir) = create_test_index();
        let sid = SessionId::new("s1").unwrap();
        index.upsert_session(&sid, Path::new("/work")).unwrap();

        assert_eq!(index.get_cursor(&sid).unwrap(), None);
        index.set_cursor(&sid, Some(4)).unwrap();
        assert_eq!(index.get_cursor(&sid).unwrap(), Some(4));
        index.set_cursor(&sid, None).unwrap();
        assert_eq!(index.get_cursor(&sid).unwrap(), None);
    }

    #[test]
    fn test_clear_session_is_scoped() {
        let (index, _dir) = create_test_index();
        let s1 = SessionId::new("s1").unwrap();
        let s2 = SessionId::new("s2").unwrap();
        for sid in [&s1, &s2] {
            index.upsert_session(sid, Path::new("/work")).unwrap();
            index.insert_entry(sid, &entry(1, CheckpointRole::Resume, "start"), None).unwrap();
            index.insert_entry(sid, &entry(2, CheckpointRole::User, "u1"), None).unwrap();
            index.set_cursor(sid, Some(2)).unwrap();
        }

        assert_eq!(index.clear_session(&s1).unwrap(), 2);
        assert!(index.list_entries(&s1).unwrap().is_empty());
        assert_eq!(index.get_cursor(&s1).unwrap(), None);
        // Sequence numbers keep counting after a clear.
        assert_eq!(index.get_session(&s1).unwrap().unwrap().next_sequence, 3);

        assert_eq!(index.list_entries(&s2).unwrap().len(), 2);
        assert_eq!(index.get_cursor(&s2).unwrap(), Some(2));
    }

    #[test]
    fn test_index_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("cairn.db");
        let sid = SessionId::new("s1").unwrap();
        {
            let index = CheckpointIndex::open(&path).unwrap();
            index.upsert_session(&sid, Path::new("/work")).unwrap();
            index.insert_entry(&sid, &entry(1, CheckpointRole::Resume, "start"), None).unwrap();
        }
        let index = CheckpointIndex::open(&path).unwrap();
        assert_eq!(index.list_entries(&sid).unwrap().len(), 1);
    }
}
