//! Dedup & Idempotency Ledger
//!
//! Append-only SQLite table. Rows are never updated or deleted. A partial
//! unique index guarantees that a key carries at most one `sent` row even if
//! two writers race.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOutcome {
    Skipped,
    Processed,
    ExtractionFailed,
    Delivered,
    Sent,
}

impl LedgerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOutcome::Skipped => "skipped",
            LedgerOutcome::Processed => "processed",
            LedgerOutcome::ExtractionFailed => "extraction_failed",
            LedgerOutcome::Delivered => "delivered",
            LedgerOutcome::Sent => "sent",
        }
    }
}

impl FromStr for LedgerOutcome {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skipped" => Ok(LedgerOutcome::Skipped),
            "processed" => Ok(LedgerOutcome::Processed),
            "extraction_failed" => Ok(LedgerOutcome::ExtractionFailed),
            "delivered" => Ok(LedgerOutcome::Delivered),
            "sent" => Ok(LedgerOutcome::Sent),
            other => Err(AgentError::Config(format!("unknown ledger outcome '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub key: String,
    pub thread_id: String,
    pub outcome: LedgerOutcome,
    pub recorded_at: DateTime<Utc>,
}

pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    pub fn open(path: &Path) -> AgentResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> AgentResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> AgentResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS ledger_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                outcome TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ledger_key ON ledger_entries(key)",
            [],
        )?;
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_sent_once
             ON ledger_entries(key) WHERE outcome = 'sent'",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Recovers from a poisoned lock; the connection itself stays usable.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("ledger mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn has(&self, key: &str) -> AgentResult<bool> {
        let conn = self.lock();
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM ledger_entries WHERE key = ?1 LIMIT 1", params![key], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn has_sent(&self, key: &str) -> AgentResult<bool> {
        let conn = self.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM ledger_entries WHERE key = ?1 AND outcome = 'sent' LIMIT 1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// An artifact went out for `key` but the reply did not.
    pub fn awaiting_reply(&self, key: &str) -> AgentResult<bool> {
        let conn = self.lock();
        let pending: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM ledger_entries WHERE key = ?1 AND outcome = 'delivered')
                AND NOT EXISTS(SELECT 1 FROM ledger_entries WHERE key = ?1 AND outcome = 'sent')",
            params![key],
            |row| row.get(0),
        )?;
        Ok(pending != 0)
    }

    /// Appends an entry. Returns false when a second `sent` for the key was refused.
    pub fn record(&self, key: &str, thread_id: &str, outcome: LedgerOutcome) -> AgentResult<bool> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO ledger_entries (key, thread_id, outcome, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key, thread_id, outcome.as_str(), Utc::now().to_rfc3339()],
        )?;
        tracing::debug!(key = %short(key), thread = thread_id, outcome = outcome.as_str(), inserted, "ledger write");
        Ok(inserted == 1)
    }

    pub fn entries(&self, key: &str) -> AgentResult<Vec<LedgerEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT key, thread_id, outcome, recorded_at FROM ledger_entries WHERE key = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![key], read_row)?;
        collect_entries(rows)
    }

    /// Every entry written for a thread, oldest first.
    pub fn thread_entries(&self, thread_id: &str) -> AgentResult<Vec<LedgerEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT key, thread_id, outcome, recorded_at FROM ledger_entries WHERE thread_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![thread_id], read_row)?;
        collect_entries(rows)
    }

    pub fn last_processed(&self, thread_id: &str) -> AgentResult<Option<DateTime<Utc>>> {
        let conn = self.lock();
        let recorded: Option<String> = conn
            .query_row(
                "SELECT recorded_at FROM ledger_entries WHERE thread_id = ?1 ORDER BY id DESC LIMIT 1",
                params![thread_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(recorded.map(|r| parse_time(&r)))
    }
}

type RawRow = (String, String, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn collect_entries(rows: impl Iterator<Item = rusqlite::Result<RawRow>>) -> AgentResult<Vec<LedgerEntry>> {
    let mut entries = Vec::new();
    for row in rows {
        let (key, thread_id, outcome, recorded_at) = row?;
        entries.push(LedgerEntry {
            key,
            thread_id,
            outcome: outcome.parse()?,
            recorded_at: parse_time(&recorded_at),
        });
    }
    Ok(entries)
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn short(key: &str) -> &str {
    &key[..key.len().min(12)]
}
