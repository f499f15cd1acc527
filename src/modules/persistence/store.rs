use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::AppResult;

pub const QUEUE_BALANCER: &str = "balancer";
pub const QUEUE_GPT_LOAD: &str = "gpt_load";

/// A validated secret with its provenance. Unique by `(secret, sha)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: i64,
    pub secret: String,
    pub provider: String,
    pub kind: String,
    pub source: String,
    pub repo_name: String,
    pub file_path: String,
    pub file_url: String,
    pub sha: String,
    pub validated_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitedFinding {
    pub id: i64,
    pub secret: String,
    pub provider: String,
    pub kind: String,
    pub source: String,
    pub repo_name: String,
    pub file_path: String,
    pub file_url: String,
    pub sha: String,
    pub reason: String,
    pub created_at: i64,
}

/// Singleton progress row consumed by the external dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanProgress {
    pub last_scan_at: i64,
    pub total_files_scanned: i64,
    pub valid_found: i64,
    pub rate_limited_found: i64,
    pub queries_processed: i64,
    pub is_scanning: bool,
    pub current_query: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_keys: i64,
    pub valid_keys: i64,
    pub rate_limited_keys: i64,
    pub total_files_scanned: i64,
    pub last_scan_at: i64,
    pub scanning_active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    pub source: Option<String>,
    pub repo_name: Option<String>,
    pub date_from: Option<i64>,
    pub date_to: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub order_by: Option<String>,
    pub descending: bool,
}

/// Embedded sqlite store. One writer connection behind a mutex; WAL keeps
/// readers from blocking the write path.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> AppResult<()> {
        let conn = self.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS findings_valid (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                secret TEXT NOT NULL,
                provider TEXT NOT NULL DEFAULT 'gemini',
                kind TEXT NOT NULL DEFAULT 'api_key',
                source TEXT NOT NULL DEFAULT 'github',
                repo_name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_url TEXT NOT NULL,
                sha TEXT NOT NULL,
                validated_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(secret, sha)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS findings_rate_limited (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                secret TEXT NOT NULL,
                provider TEXT NOT NULL DEFAULT 'gemini',
                kind TEXT NOT NULL DEFAULT 'api_key',
                source TEXT NOT NULL DEFAULT 'github',
                repo_name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_url TEXT NOT NULL,
                sha TEXT NOT NULL,
                reason TEXT NOT NULL DEFAULT 'rate_limited',
                created_at INTEGER NOT NULL,
                UNIQUE(secret, sha)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS progress (
                id INTEGER PRIMARY KEY,
                last_scan_at INTEGER,
                total_files_scanned INTEGER DEFAULT 0,
                valid_found INTEGER DEFAULT 0,
                rate_limited_found INTEGER DEFAULT 0,
                queries_processed INTEGER DEFAULT 0,
                is_scanning BOOLEAN DEFAULT 0,
                current_query TEXT DEFAULT '',
                updated_at INTEGER
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS shas_seen (
                sha TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS queries_processed (
                query_key TEXT PRIMARY KEY,
                query_text TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_queues (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_type TEXT NOT NULL,
                secret TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(queue_type, secret)
            )",
            [],
        )?;

        // Older databases predate the provider/kind columns; ignore the
        // duplicate-column error when they already exist.
        let _ = conn.execute(
            "ALTER TABLE findings_valid ADD COLUMN provider TEXT DEFAULT 'gemini'",
            [],
        );
        let _ = conn.execute(
            "ALTER TABLE findings_valid ADD COLUMN kind TEXT DEFAULT 'api_key'",
            [],
        );
        let _ = conn.execute(
            "ALTER TABLE findings_rate_limited ADD COLUMN provider TEXT DEFAULT 'gemini'",
            [],
        );
        let _ = conn.execute(
            "ALTER TABLE findings_rate_limited ADD COLUMN kind TEXT DEFAULT 'api_key'",
            [],
        );

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_findings_valid_created_at ON findings_valid(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_findings_valid_repo_name ON findings_valid(repo_name)",
            "CREATE INDEX IF NOT EXISTS idx_findings_valid_provider ON findings_valid(provider)",
            "CREATE INDEX IF NOT EXISTS idx_findings_rl_created_at ON findings_rate_limited(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_findings_rl_provider ON findings_rate_limited(provider)",
            "CREATE INDEX IF NOT EXISTS idx_shas_seen_created_at ON shas_seen(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_sync_queues_type ON sync_queues(queue_type)",
        ];
        for query in indexes {
            conn.execute(query, [])?;
        }

        conn.execute(
            "INSERT OR IGNORE INTO progress (id, last_scan_at, updated_at) VALUES (1, ?1, ?1)",
            params![Utc::now().timestamp()],
        )?;

        info!("Database migration completed");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn save_valid_findings(&self, findings: &[Finding]) -> AppResult<()> {
        if findings.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO findings_valid
                 (secret, provider, kind, source, repo_name, file_path, file_url, sha,
                  validated_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                         COALESCE((SELECT created_at FROM findings_valid
                                   WHERE secret = ?1 AND sha = ?8), ?10), ?10)",
            )?;
            let now = Utc::now().timestamp();
            for f in findings {
                stmt.execute(params![
                    f.secret,
                    f.provider,
                    f.kind,
                    f.source,
                    f.repo_name,
                    f.file_path,
                    f.file_url,
                    f.sha,
                    f.validated_at,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn save_rate_limited_findings(&self, findings: &[RateLimitedFinding]) -> AppResult<()> {
        if findings.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO findings_rate_limited
                 (secret, provider, kind, source, repo_name, file_path, file_url, sha,
                  reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            let now = Utc::now().timestamp();
            for f in findings {
                stmt.execute(params![
                    f.secret,
                    f.provider,
                    f.kind,
                    f.source,
                    f.repo_name,
                    f.file_path,
                    f.file_url,
                    f.sha,
                    f.reason,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_valid_findings(&self, filter: &KeyFilter) -> AppResult<(Vec<Finding>, i64)> {
        let conn = self.lock();
        let (where_clause, args) = build_where_clause(filter);
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM findings_valid {}", where_clause),
            arg_refs.as_slice(),
            |row| row.get(0),
        )?;

        let query = format!(
            "SELECT id, secret, provider, kind, source, repo_name, file_path, file_url, sha,
                    validated_at, created_at, updated_at
             FROM findings_valid {} {}",
            where_clause,
            build_order_clause(filter)
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(arg_refs.as_slice(), |row| {
            Ok(Finding {
                id: row.get(0)?,
                secret: row.get(1)?,
                provider: row.get(2)?,
                kind: row.get(3)?,
                source: row.get(4)?,
                repo_name: row.get(5)?,
                file_path: row.get(6)?,
                file_url: row.get(7)?,
                sha: row.get(8)?,
                validated_at: row.get(9)?,
                created_at: row.get(10)?,
                updated_at: row.get(11)?,
            })
        })?;

        let mut findings = Vec::new();
        for row in rows {
            findings.push(row?);
        }
        Ok((findings, total))
    }

    pub fn get_rate_limited_findings(
        &self,
        filter: &KeyFilter,
    ) -> AppResult<(Vec<RateLimitedFinding>, i64)> {
        let conn = self.lock();
        let (where_clause, args) = build_where_clause(filter);
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM findings_rate_limited {}", where_clause),
            arg_refs.as_slice(),
            |row| row.get(0),
        )?;

        let query = format!(
            "SELECT id, secret, provider, kind, source, repo_name, file_path, file_url, sha,
                    reason, created_at
             FROM findings_rate_limited {} {}",
            where_clause,
            build_order_clause(filter)
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(arg_refs.as_slice(), |row| {
            Ok(RateLimitedFinding {
                id: row.get(0)?,
                secret: row.get(1)?,
                provider: row.get(2)?,
                kind: row.get(3)?,
                source: row.get(4)?,
                repo_name: row.get(5)?,
                file_path: row.get(6)?,
                file_url: row.get(7)?,
                sha: row.get(8)?,
                reason: row.get(9)?,
                created_at: row.get(10)?,
            })
        })?;

        let mut findings = Vec::new();
        for row in rows {
            findings.push(row?);
        }
        Ok((findings, total))
    }

    pub fn delete_valid_finding(&self, id: i64) -> AppResult<()> {
        self.lock()
            .execute("DELETE FROM findings_valid WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn delete_rate_limited_finding(&self, id: i64) -> AppResult<()> {
        self.lock().execute(
            "DELETE FROM findings_rate_limited WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn is_sha_seen(&self, sha: &str) -> AppResult<bool> {
        let seen: Option<i64> = self
            .lock()
            .query_row(
                "SELECT 1 FROM shas_seen WHERE sha = ?1",
                params![sha],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seen.is_some())
    }

    pub fn mark_sha_seen(&self, sha: &str) -> AppResult<()> {
        self.lock().execute(
            "INSERT OR IGNORE INTO shas_seen (sha, created_at) VALUES (?1, ?2)",
            params![sha, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn scanned_sha_count(&self) -> AppResult<i64> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM shas_seen", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn is_query_processed(&self, query: &str) -> AppResult<bool> {
        let found: Option<i64> = self
            .lock()
            .query_row(
                "SELECT 1 FROM queries_processed WHERE query_key = ?1",
                params![query_key(query)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn mark_query_processed(&self, query: &str) -> AppResult<()> {
        self.lock().execute(
            "INSERT OR IGNORE INTO queries_processed (query_key, query_text, created_at)
             VALUES (?1, ?2, ?3)",
            params![query_key(query), query, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn update_progress(&self, progress: &ScanProgress) -> AppResult<()> {
        self.lock().execute(
            "UPDATE progress SET
                last_scan_at = ?1, total_files_scanned = ?2, valid_found = ?3,
                rate_limited_found = ?4, queries_processed = ?5, is_scanning = ?6,
                current_query = ?7, updated_at = ?8
             WHERE id = 1",
            params![
                progress.last_scan_at,
                progress.total_files_scanned,
                progress.valid_found,
                progress.rate_limited_found,
                progress.queries_processed,
                progress.is_scanning,
                progress.current_query,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get_progress(&self) -> AppResult<ScanProgress> {
        let progress = self.lock().query_row(
            "SELECT last_scan_at, total_files_scanned, valid_found, rate_limited_found,
                    queries_processed, is_scanning, current_query
             FROM progress WHERE id = 1",
            [],
            |row| {
                Ok(ScanProgress {
                    last_scan_at: row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                    total_files_scanned: row.get(1)?,
                    valid_found: row.get(2)?,
                    rate_limited_found: row.get(3)?,
                    queries_processed: row.get(4)?,
                    is_scanning: row.get(5)?,
                    current_query: row.get(6)?,
                })
            },
        )?;
        Ok(progress)
    }

    pub fn get_stats(&self) -> AppResult<StoreStats> {
        let conn = self.lock();
        let valid: i64 =
            conn.query_row("SELECT COUNT(*) FROM findings_valid", [], |row| row.get(0))?;
        let rate_limited: i64 = conn.query_row(
            "SELECT COUNT(*) FROM findings_rate_limited",
            [],
            |row| row.get(0),
        )?;
        let (files, last_scan_at, scanning): (i64, Option<i64>, bool) = conn.query_row(
            "SELECT total_files_scanned, last_scan_at, is_scanning FROM progress WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(StoreStats {
            total_keys: valid + rate_limited,
            valid_keys: valid,
            rate_limited_keys: rate_limited,
            total_files_scanned: files,
            last_scan_at: last_scan_at.unwrap_or(0),
            scanning_active: scanning,
        })
    }

    /// Set-semantics enqueue: a secret already waiting in the queue is not
    /// duplicated.
    pub fn enqueue(&self, queue: &str, secrets: &[String]) -> AppResult<()> {
        if secrets.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO sync_queues (queue_type, secret, created_at)
                 VALUES (?1, ?2, ?3)",
            )?;
            let now = Utc::now().timestamp();
            for secret in secrets {
                stmt.execute(params![queue, secret, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Returns the queue contents in insertion order. Callers `clear` the
    /// queue only after a successful ship, so a failed forward retries.
    pub fn drain(&self, queue: &str) -> AppResult<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT secret FROM sync_queues WHERE queue_type = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![queue], |row| row.get::<_, String>(0))?;
        let mut secrets = Vec::new();
        for row in rows {
            secrets.push(row?);
        }
        Ok(secrets)
    }

    pub fn clear_queue(&self, queue: &str) -> AppResult<()> {
        self.lock().execute(
            "DELETE FROM sync_queues WHERE queue_type = ?1",
            params![queue],
        )?;
        Ok(())
    }

    pub fn health_check(&self) -> AppResult<()> {
        self.lock().query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

/// Processed queries are keyed by a real content hash of the query string.
fn query_key(query: &str) -> String {
    format!("{:x}", Sha256::digest(query.as_bytes()))
}

fn build_where_clause(filter: &KeyFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(source) = &filter.source {
        args.push(Box::new(source.clone()));
        conditions.push(format!("source = ?{}", args.len()));
    }
    if let Some(repo) = &filter.repo_name {
        args.push(Box::new(format!("%{}%", repo)));
        conditions.push(format!("repo_name LIKE ?{}", args.len()));
    }
    if let Some(from) = filter.date_from {
        args.push(Box::new(from));
        conditions.push(format!("created_at >= ?{}", args.len()));
    }
    if let Some(to) = filter.date_to {
        args.push(Box::new(to));
        conditions.push(format!("created_at <= ?{}", args.len()));
    }

    if conditions.is_empty() {
        (String::new(), args)
    } else {
        (format!("WHERE {}", conditions.join(" AND ")), args)
    }
}

fn build_order_clause(filter: &KeyFilter) -> String {
    // Column whitelist; the order field comes from the HTTP layer.
    let order_by = match filter.order_by.as_deref() {
        Some("repo_name") => "repo_name",
        Some("validated_at") => "validated_at",
        _ => "created_at",
    };
    let direction = if filter.descending { "DESC" } else { "ASC" };
    let limit = filter.limit.unwrap_or(100);
    let offset = filter.offset.unwrap_or(0);
    format!(
        "ORDER BY {} {} LIMIT {} OFFSET {}",
        order_by, direction, limit, offset
    )
}
