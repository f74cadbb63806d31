//! SQLite-backed item store: `memory_items`, a token index for lexical
//! recall, recorded turns for recent/related context, and an ingest ledger
//! making per-run consolidation idempotent.
//!
//! One connection behind a mutex — writes are serialized, which is the
//! shared-resource policy for this store.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use ab_domain::{Error, Result};

// Schema version (increment when changing table definitions).
const SCHEMA_VERSION: i32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct MemoryItem {
    pub item_id: Uuid,
    pub text: String,
    /// SHA-256 of the normalized text; unique across the store.
    pub norm_hash: String,
    pub importance: f64,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub embedding: Option<Vec<f32>>,
}

/// One recorded turn pair (input + final output) for an origin.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub origin: String,
    pub input: String,
    pub output: String,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MemoryStore {
    conn: Mutex<Connection>,
}

impl MemoryStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(sql_err)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── items ───────────────────────────────────────────────────────

    pub fn insert(&self, item: &MemoryItem) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memory_items
               (item_id, text, norm_hash, importance, created_at, last_seen_at, embedding_blob)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                item.item_id.to_string(),
                item.text,
                item.norm_hash,
                item.importance,
                item.created_at.to_rfc3339(),
                item.last_seen_at.to_rfc3339(),
                item.embedding.as_ref().map(|e| embedding_to_blob(e)),
            ],
        )
        .map_err(sql_err)?;
        index_tokens(&conn, &item.item_id.to_string(), &item.text)?;
        Ok(())
    }

    pub fn get(&self, item_id: &Uuid) -> Result<Option<MemoryItem>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT item_id, text, norm_hash, importance, created_at, last_seen_at, embedding_blob
             FROM memory_items WHERE item_id = ?1",
            params![item_id.to_string()],
            row_to_item,
        )
        .optional()
        .map_err(sql_err)
    }

    pub fn find_by_hash(&self, norm_hash: &str) -> Result<Option<MemoryItem>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT item_id, text, norm_hash, importance, created_at, last_seen_at, embedding_blob
             FROM memory_items WHERE norm_hash = ?1",
            params![norm_hash],
            row_to_item,
        )
        .optional()
        .map_err(sql_err)
    }

    /// Bump `last_seen_at` (exact-hash dedup hit).
    pub fn touch(&self, item_id: &Uuid, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "UPDATE memory_items SET last_seen_at = ?2 WHERE item_id = ?1",
                params![item_id.to_string(), at.to_rfc3339()],
            )
            .map_err(sql_err)?;
        Ok(n > 0)
    }

    /// Replace text/importance of a merged item and reindex its tokens.
    pub fn update_merged(&self, item_id: &Uuid, text: &str, importance: f64) -> Result<bool> {
        let conn = self.conn.lock();
        let id = item_id.to_string();
        let n = conn
            .execute(
                "UPDATE memory_items
                 SET text = ?2, importance = ?3, last_seen_at = ?4
                 WHERE item_id = ?1",
                params![id, text, importance, Utc::now().to_rfc3339()],
            )
            .map_err(sql_err)?;
        if n > 0 {
            conn.execute("DELETE FROM fts_tokens WHERE item_id = ?1", params![id])
                .map_err(sql_err)?;
            index_tokens(&conn, &id, text)?;
        }
        Ok(n > 0)
    }

    pub fn delete(&self, item_id: &Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let id = item_id.to_string();
        conn.execute("DELETE FROM fts_tokens WHERE item_id = ?1", params![id])
            .map_err(sql_err)?;
        let n = conn
            .execute("DELETE FROM memory_items WHERE item_id = ?1", params![id])
            .map_err(sql_err)?;
        Ok(n > 0)
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<MemoryItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT item_id, text, norm_hash, importance, created_at, last_seen_at, embedding_blob
                 FROM memory_items ORDER BY last_seen_at DESC LIMIT ?1",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_item)
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM memory_items", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .map_err(sql_err)
    }

    // ── lexical recall ─────────────────────────────────────────────

    /// Posting lists for the given tokens: `(item_id, token, count)`.
    pub fn postings(&self, tokens: &[String]) -> Result<Vec<(Uuid, String, u32)>> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let mut out = Vec::new();
        let mut stmt = conn
            .prepare("SELECT item_id, cnt FROM fts_tokens WHERE token = ?1")
            .map_err(sql_err)?;
        for token in tokens {
            let rows = stmt
                .query_map(params![token], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(sql_err)?;
            for row in rows {
                let (id, cnt) = row.map_err(sql_err)?;
                if let Ok(uuid) = id.parse() {
                    out.push((uuid, token.clone(), cnt as u32));
                }
            }
        }
        Ok(out)
    }

    /// Number of distinct items containing a token (document frequency).
    pub fn doc_frequency(&self, token: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(DISTINCT item_id) FROM fts_tokens WHERE token = ?1",
            params![token],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .map_err(sql_err)
    }

    // ── vector recall ──────────────────────────────────────────────

    /// The most recently seen embedded items, newest first, bounded by
    /// `limit` (the vector scan window).
    pub fn recent_embedded(&self, limit: usize) -> Result<Vec<MemoryItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT item_id, text, norm_hash, importance, created_at, last_seen_at, embedding_blob
                 FROM memory_items
                 WHERE embedding_blob IS NOT NULL
                 ORDER BY last_seen_at DESC LIMIT ?1",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_item)
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    pub fn items_without_embedding(&self, limit: usize) -> Result<Vec<MemoryItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT item_id, text, norm_hash, importance, created_at, last_seen_at, embedding_blob
                 FROM memory_items
                 WHERE embedding_blob IS NULL
                 ORDER BY created_at ASC LIMIT ?1",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_item)
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    pub fn set_embedding(&self, item_id: &Uuid, embedding: &[f32]) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "UPDATE memory_items SET embedding_blob = ?2 WHERE item_id = ?1",
                params![item_id.to_string(), embedding_to_blob(embedding)],
            )
            .map_err(sql_err)?;
        Ok(n > 0)
    }

    // ── turns ──────────────────────────────────────────────────────

    pub fn record_turn(&self, turn: &TurnRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO turns (origin, input, output, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                turn.origin,
                turn.input,
                turn.output,
                turn.created_at.to_rfc3339()
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Last `limit` turn pairs of an origin, oldest first.
    pub fn recent_turns(&self, origin: &str, limit: usize) -> Result<Vec<TurnRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT origin, input, output, created_at FROM turns
                 WHERE origin = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![origin, limit as i64], row_to_turn)
            .map_err(sql_err)?;
        let mut turns = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        turns.reverse();
        Ok(turns)
    }

    /// A window of recent turns across all origins (similarity candidates).
    pub fn latest_turns(&self, limit: usize) -> Result<Vec<TurnRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT origin, input, output, created_at FROM turns
                 ORDER BY id DESC LIMIT ?1",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_turn)
            .map_err(sql_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    // ── ingest ledger ──────────────────────────────────────────────

    /// Record a run as ingested. Returns `false` when it already was
    /// (making repeated `ingest` calls a no-op).
    pub fn mark_ingested(&self, run_id: &Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "INSERT OR IGNORE INTO ingested_runs (run_id) VALUES (?1)",
                params![run_id.to_string()],
            )
            .map_err(sql_err)?;
        Ok(n > 0)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schema & helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn init_schema(conn: &Connection) -> Result<()> {
    let current: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(sql_err)?;
    if current != 0 && current != SCHEMA_VERSION {
        return Err(Error::Storage(format!(
            "memory store schema version {current} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS memory_items (
            item_id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            norm_hash TEXT NOT NULL UNIQUE,
            importance REAL NOT NULL,
            created_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            embedding_blob BLOB
        );

        CREATE TABLE IF NOT EXISTS fts_tokens (
            token TEXT NOT NULL,
            item_id TEXT NOT NULL,
            cnt INTEGER NOT NULL,
            PRIMARY KEY (token, item_id)
        );

        CREATE TABLE IF NOT EXISTS turns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            origin TEXT NOT NULL,
            input TEXT NOT NULL,
            output TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ingested_runs (
            run_id TEXT PRIMARY KEY
        );

        CREATE INDEX IF NOT EXISTS idx_items_last_seen ON memory_items(last_seen_at DESC);
        CREATE INDEX IF NOT EXISTS idx_tokens_token ON fts_tokens(token);
        CREATE INDEX IF NOT EXISTS idx_turns_origin ON turns(origin, id DESC);
        "#,
    )
    .map_err(sql_err)?;

    conn.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])
        .map_err(sql_err)?;
    Ok(())
}

fn index_tokens(conn: &Connection, item_id: &str, text: &str) -> Result<()> {
    let mut counts: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
    for token in crate::retrieval::tokenize(text) {
        *counts.entry(token).or_insert(0) += 1;
    }
    let mut stmt = conn
        .prepare(
            "INSERT INTO fts_tokens (token, item_id, cnt) VALUES (?1, ?2, ?3)
             ON CONFLICT(token, item_id) DO UPDATE SET cnt = excluded.cnt",
        )
        .map_err(sql_err)?;
    for (token, cnt) in counts {
        stmt.execute(params![token, item_id, cnt]).map_err(sql_err)?;
    }
    Ok(())
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryItem> {
    let id: String = row.get(0)?;
    let created: String = row.get(4)?;
    let seen: String = row.get(5)?;
    let blob: Option<Vec<u8>> = row.get(6)?;
    Ok(MemoryItem {
        item_id: id.parse().unwrap_or_else(|_| Uuid::nil()),
        text: row.get(1)?,
        norm_hash: row.get(2)?,
        importance: row.get(3)?,
        created_at: parse_ts(&created),
        last_seen_at: parse_ts(&seen),
        embedding: blob.map(|b| blob_to_embedding(&b)),
    })
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<TurnRecord> {
    let created: String = row.get(3)?;
    Ok(TurnRecord {
        origin: row.get(0)?,
        input: row.get(1)?,
        output: row.get(2)?,
        created_at: parse_ts(&created),
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn sql_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
