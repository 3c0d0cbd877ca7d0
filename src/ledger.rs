//! The Ledger & store (C5): an embedded SQLite database with the
//! `quota_ledger` and `cache_entries` tables, schema-versioned, opened in
//! WAL mode (`spec.md` §4.5, §6).
//!
//! `rusqlite` is a synchronous driver; every call here goes through
//! [`tokio::task::spawn_blocking`] so the dispatcher's async call sites
//! never block the executor on disk I/O.

use crate::error::{RouterError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

/// One row of the append-only `quota_ledger` table (`spec.md` §3, §6).
#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub id: i64,
    pub timestamp: i64,
    pub backend: String,
    pub fingerprint: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub cost_eur: f64,
    pub cache_hit: bool,
    pub latency_ms: u64,
    pub metadata: String,
}

/// A new ledger row awaiting an `id` and server-assigned `timestamp`.
#[derive(Debug, Clone)]
pub struct NewLedgerRow {
    pub backend: String,
    pub fingerprint: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub cost_eur: f64,
    pub cache_hit: bool,
    pub latency_ms: u64,
    pub metadata: String,
}

/// A `cache_entries` row, as persisted for restart survival (`spec.md` §6).
#[derive(Debug, Clone)]
pub struct CacheEntryRow {
    pub cache_key: String,
    pub prompt_hash: String,
    pub response: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub access_count: u64,
    pub last_accessed: i64,
    pub size_bytes: u64,
}

/// `spec.md` §4.5 `healthCheck()` shape.
#[derive(Debug, Clone)]
pub struct StoreHealth {
    pub healthy: bool,
    pub detail: String,
}

const SCHEMA_VERSION: i64 = 1;

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// The store behind C4 (cache persistence) and C5 (ledger). One embedded
/// SQLite connection per instance, guarded by a mutex and driven from
/// `spawn_blocking` so the surrounding dispatcher stays async throughout.
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Open (creating if absent) the store at `path`, enable WAL, and run
    /// pending migrations. `path` may be `":memory:"` for tests, though an
    /// in-memory database does not survive process restart.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| RouterError::StorageError(format!("failed to open store: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| RouterError::StorageError(format!("failed to enable WAL: {e}")))?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// An in-memory store, for tests that don't need restart survival.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );",
        )
        .map_err(|e| RouterError::StorageError(format!("migration failed: {e}")))?;

        let current: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .optional()
            .map_err(|e| RouterError::StorageError(format!("migration failed: {e}")))?
            .flatten();

        if current.is_none() {
            conn.execute_batch(
                "CREATE TABLE quota_ledger (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp INTEGER NOT NULL,
                    backend TEXT NOT NULL,
                    prompt_hash TEXT NOT NULL,
                    tokens_input INTEGER NOT NULL,
                    tokens_output INTEGER NOT NULL,
                    cost_eur REAL NOT NULL,
                    cache_hit INTEGER NOT NULL,
                    latency_ms INTEGER NOT NULL,
                    metadata TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_quota_ledger_timestamp ON quota_ledger(timestamp);

                CREATE TABLE cache_entries (
                    cache_key TEXT PRIMARY KEY,
                    prompt_hash TEXT NOT NULL,
                    response TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL,
                    access_count INTEGER NOT NULL,
                    last_accessed INTEGER NOT NULL,
                    size_bytes INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at ON cache_entries(expires_at);",
            )
            .map_err(|e| RouterError::StorageError(format!("migration failed: {e}")))?;

            conn.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, now_unix()],
            )
            .map_err(|e| RouterError::StorageError(format!("migration failed: {e}")))?;
        }

        Ok(())
    }

    /// Append one row to `quota_ledger`. Insert-only; rows are never
    /// updated or deleted except by `cleanup`'s retention pruning.
    pub async fn append(&self, row: NewLedgerRow) -> Result<i64> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<i64> {
            let conn = conn
                .lock()
                .map_err(|_| RouterError::StorageError("store mutex poisoned".into()))?;
            conn.execute(
                "INSERT INTO quota_ledger
                    (timestamp, backend, prompt_hash, tokens_input, tokens_output, cost_eur, cache_hit, latency_ms, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    now_unix(),
                    row.backend,
                    row.fingerprint,
                    row.tokens_input as i64,
                    row.tokens_output as i64,
                    row.cost_eur,
                    row.cache_hit as i64,
                    row.latency_ms as i64,
                    row.metadata,
                ],
            )
            .map_err(|e| RouterError::StorageError(format!("ledger append failed: {e}")))?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .map_err(|e| RouterError::StorageError(format!("ledger append task panicked: {e}")))?
    }

    /// Rows appended within the last `since_hours` hours, most recent first.
    pub async fn recent_entries(&self, since_hours: i64) -> Result<Vec<LedgerRow>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<LedgerRow>> {
            let conn = conn
                .lock()
                .map_err(|_| RouterError::StorageError("store mutex poisoned".into()))?;
            let cutoff = now_unix() - since_hours * 3600;
            let mut stmt = conn
                .prepare(
                    "SELECT id, timestamp, backend, prompt_hash, tokens_input, tokens_output,
                            cost_eur, cache_hit, latency_ms, metadata
                     FROM quota_ledger WHERE timestamp >= ?1 ORDER BY timestamp DESC",
                )
                .map_err(|e| RouterError::StorageError(format!("query failed: {e}")))?;
            let rows = stmt
                .query_map(params![cutoff], |row| {
                    Ok(LedgerRow {
                        id: row.get(0)?,
                        timestamp: row.get(1)?,
                        backend: row.get(2)?,
                        fingerprint: row.get(3)?,
                        tokens_input: row.get::<_, i64>(4)? as u64,
                        tokens_output: row.get::<_, i64>(5)? as u64,
                        cost_eur: row.get(6)?,
                        cache_hit: row.get::<_, i64>(7)? != 0,
                        latency_ms: row.get::<_, i64>(8)? as u64,
                        metadata: row.get(9)?,
                    })
                })
                .map_err(|e| RouterError::StorageError(format!("query failed: {e}")))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| RouterError::StorageError(format!("row decode failed: {e}")))
        })
        .await
        .map_err(|e| RouterError::StorageError(format!("ledger query task panicked: {e}")))?
    }

    /// Write-through persistence for a cache entry (`spec.md` §4.4
    /// "Persistence"). Last-writer-wins on `cache_key`.
    pub async fn put_cache_entry(&self, row: CacheEntryRow) -> Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn
                .lock()
                .map_err(|_| RouterError::StorageError("store mutex poisoned".into()))?;
            conn.execute(
                "INSERT INTO cache_entries
                    (cache_key, prompt_hash, response, created_at, expires_at, access_count, last_accessed, size_bytes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(cache_key) DO UPDATE SET
                    prompt_hash = excluded.prompt_hash,
                    response = excluded.response,
                    created_at = excluded.created_at,
                    expires_at = excluded.expires_at,
                    access_count = excluded.access_count,
                    last_accessed = excluded.last_accessed,
                    size_bytes = excluded.size_bytes",
                params![
                    row.cache_key,
                    row.prompt_hash,
                    row.response,
                    row.created_at,
                    row.expires_at,
                    row.access_count as i64,
                    row.last_accessed,
                    row.size_bytes as i64,
                ],
            )
            .map_err(|e| RouterError::StorageError(format!("cache entry write failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| RouterError::StorageError(format!("cache entry task panicked: {e}")))?
    }

    /// Fetch a persisted cache row by `cache_key`, for lazy rehydration on
    /// a first `get` after process restart. Returns `None` for a missing or
    /// already-expired row (the caller still re-checks `expires_at`).
    pub async fn get_cache_entry(&self, cache_key: &str) -> Result<Option<CacheEntryRow>> {
        let conn = self.conn.clone();
        let cache_key = cache_key.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<CacheEntryRow>> {
            let conn = conn
                .lock()
                .map_err(|_| RouterError::StorageError("store mutex poisoned".into()))?;
            conn.query_row(
                "SELECT cache_key, prompt_hash, response, created_at, expires_at, access_count, last_accessed, size_bytes
                 FROM cache_entries WHERE cache_key = ?1",
                params![cache_key],
                |row| {
                    Ok(CacheEntryRow {
                        cache_key: row.get(0)?,
                        prompt_hash: row.get(1)?,
                        response: row.get(2)?,
                        created_at: row.get(3)?,
                        expires_at: row.get(4)?,
                        access_count: row.get::<_, i64>(5)? as u64,
                        last_accessed: row.get(6)?,
                        size_bytes: row.get::<_, i64>(7)? as u64,
                    })
                },
            )
            .optional()
            .map_err(|e| RouterError::StorageError(format!("cache entry query failed: {e}")))
        })
        .await
        .map_err(|e| RouterError::StorageError(format!("cache entry task panicked: {e}")))?
    }

    /// A trivial round-trip query, used by `Dispatcher::status` to report
    /// store health without assuming anything about its internal state.
    pub async fn health_check(&self) -> StoreHealth {
        let conn = self.conn.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn
                .lock()
                .map_err(|_| RouterError::StorageError("store mutex poisoned".into()))?;
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| RouterError::StorageError(format!("health check failed: {e}")))
        })
        .await;

        match result {
            Ok(Ok(())) => StoreHealth {
                healthy: true,
                detail: "ok".to_string(),
            },
            Ok(Err(e)) => StoreHealth {
                healthy: false,
                detail: e.to_string(),
            },
            Err(e) => StoreHealth {
                healthy: false,
                detail: format!("health check task panicked: {e}"),
            },
        }
    }

    /// Prune expired `cache_entries` rows and ledger rows older than
    /// `retention_hours` (0 disables ledger pruning), then run `VACUUM`.
    pub async fn cleanup(&self, retention_hours: i64) -> Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn
                .lock()
                .map_err(|_| RouterError::StorageError("store mutex poisoned".into()))?;
            conn.execute(
                "DELETE FROM cache_entries WHERE expires_at <= ?1",
                params![now_unix()],
            )
            .map_err(|e| RouterError::StorageError(format!("cleanup failed: {e}")))?;
            if retention_hours > 0 {
                let cutoff = now_unix() - retention_hours * 3600;
                conn.execute(
                    "DELETE FROM quota_ledger WHERE timestamp < ?1",
                    params![cutoff],
                )
                .map_err(|e| RouterError::StorageError(format!("cleanup failed: {e}")))?;
            }
            conn.execute_batch("VACUUM;")
                .map_err(|e| RouterError::StorageError(format!("vacuum failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| RouterError::StorageError(format!("cleanup task panicked: {e}")))?
    }

    /// Flush pending writes and drop the connection. SQLite's WAL
    /// checkpoint happens on close; no explicit step is needed beyond
    /// dropping the last handle to `conn`.
    pub async fn close(self) -> Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            if let Ok(conn) = conn.lock() {
                let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
            }
        })
        .await
        .map_err(|e| RouterError::StorageError(format!("close task panicked: {e}")))?;
        Ok(())
    }
}
