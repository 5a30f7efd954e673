//! SQLite-backed cache for validated judge comparison sets.
//!
//! Only comparison sets that passed validation are stored; neutral fallbacks
//! never reach the cache.

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::judge::{Comparison, Role};

#[derive(Debug, Clone)]
pub struct JudgementCacheKey {
    pub model: String,
    pub role: Role,
    pub rubric_version: String,
    pub template_hash: String,
    pub draft_hash: String,
    /// Hash over the ordered `(label, card)` pairs shown to the judge.
    pub anchors_hash: String,
    pub key_hash: String,
}

impl JudgementCacheKey {
    pub fn new(
        model: &str,
        role: Role,
        rubric_version: &str,
        template_hash: &str,
        draft_text: &str,
        anchors: &[(&str, String)],
    ) -> Self {
        let draft_hash = hash_text(draft_text);
        let anchor_fields: Vec<String> = anchors
            .iter()
            .map(|(label, text)| format!("{label}={}", hash_text(text)))
            .collect();
        let anchor_refs: Vec<&str> = anchor_fields.iter().map(String::as_str).collect();
        let anchors_hash = hash_fields(&anchor_refs);
        let key_hash = hash_fields(&[
            model,
            role.as_str(),
            rubric_version,
            template_hash,
            &draft_hash,
            &anchors_hash,
        ]);

        Self {
            model: model.to_string(),
            role,
            rubric_version: rubric_version.to_string(),
            template_hash: template_hash.to_string(),
            draft_hash,
            anchors_hash,
            key_hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedComparisons {
    pub comparisons: Vec<Comparison>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

#[async_trait]
pub trait JudgementCache: Send + Sync {
    async fn get(&self, key: &JudgementCacheKey) -> Result<Option<CachedComparisons>, CacheError>;
    async fn put(&self, key: &JudgementCacheKey, value: &CachedComparisons)
        -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct SqliteJudgementCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJudgementCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; \
             PRAGMA synchronous=NORMAL; \
             CREATE TABLE IF NOT EXISTS judgement_cache ( \
               key_hash TEXT PRIMARY KEY, \
               model TEXT NOT NULL, \
               role TEXT NOT NULL, \
               rubric_version TEXT NOT NULL, \
               template_hash TEXT NOT NULL, \
               draft_hash TEXT NOT NULL, \
               anchors_hash TEXT NOT NULL, \
               comparisons_json TEXT NOT NULL, \
               input_tokens INTEGER, \
               output_tokens INTEGER, \
               created_at INTEGER NOT NULL, \
               updated_at INTEGER NOT NULL, \
               hit_count INTEGER NOT NULL DEFAULT 0 \
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("CRITIC_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".critic_judgement_cache.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }
}

#[async_trait]
impl JudgementCache for SqliteJudgementCache {
    async fn get(&self, key: &JudgementCacheKey) -> Result<Option<CachedComparisons>, CacheError> {
        let key_hash = key.key_hash.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT comparisons_json, input_tokens, output_tokens \
                     FROM judgement_cache WHERE key_hash = ?1",
                )?;
                let mut rows = stmt.query(params![key_hash])?;
                let Some(row) = rows.next()? else {
                    return Ok(None);
                };
                let raw: String = row.get(0)?;
                let comparisons: Vec<Comparison> =
                    serde_json::from_str(&raw).map_err(|e| CacheError::Serde(e.to_string()))?;
                let entry = CachedComparisons {
                    comparisons,
                    input_tokens: row.get::<_, Option<i64>>(1)?.map(|v| v as u32),
                    output_tokens: row.get::<_, Option<i64>>(2)?.map(|v| v as u32),
                };
                conn.execute(
                    "UPDATE judgement_cache \
                     SET hit_count = hit_count + 1, updated_at = ?1 \
                     WHERE key_hash = ?2",
                    params![now_epoch(), key_hash],
                )?;
                Ok(Some(entry))
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn put(
        &self,
        key: &JudgementCacheKey,
        value: &CachedComparisons,
    ) -> Result<(), CacheError> {
        let key = key.clone();
        let comparisons_json = serde_json::to_string(&value.comparisons)
            .map_err(|e| CacheError::Serde(e.to_string()))?;
        let input_tokens = value.input_tokens;
        let output_tokens = value.output_tokens;
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let now = now_epoch();
                conn.execute(
                    "INSERT INTO judgement_cache ( \
                        key_hash, model, role, rubric_version, template_hash, \
                        draft_hash, anchors_hash, comparisons_json, \
                        input_tokens, output_tokens, created_at, updated_at \
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                     ON CONFLICT(key_hash) DO UPDATE SET \
                        comparisons_json = excluded.comparisons_json, \
                        input_tokens = excluded.input_tokens, \
                        output_tokens = excluded.output_tokens, \
                        updated_at = excluded.updated_at",
                    params![
                        key.key_hash,
                        key.model,
                        key.role.as_str(),
                        key.rubric_version,
                        key.template_hash,
                        key.draft_hash,
                        key.anchors_hash,
                        comparisons_json,
                        input_tokens.map(|v| v as i64),
                        output_tokens.map(|v| v as i64),
                        now,
                        now,
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

/// Exclusive advisory lock held during export and pruning.
#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

#[derive(Debug, Serialize)]
pub struct CacheExportRow {
    pub key_hash: String,
    pub model: String,
    pub role: String,
    pub rubric_version: String,
    pub template_hash: String,
    pub draft_hash: String,
    pub anchors_hash: String,
    pub comparisons: serde_json::Value,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub created_at: i64,
    pub updated_at: i64,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteJudgementCache {
    /// Write every row as one JSON line, most recently used first. Returns the row count.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
        let path = path.as_ref().to_path_buf();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key_hash, model, role, rubric_version, template_hash, \
                            draft_hash, anchors_hash, comparisons_json, \
                            input_tokens, output_tokens, created_at, updated_at, hit_count \
                     FROM judgement_cache ORDER BY updated_at DESC, key_hash ASC",
                )?;
                let mut rows = stmt.query([])?;
                let mut file = std::fs::File::create(path)?;
                let mut written = 0usize;
                while let Some(row) = rows.next()? {
                    let raw: String = row.get(7)?;
                    let record = CacheExportRow {
                        key_hash: row.get(0)?,
                        model: row.get(1)?,
                        role: row.get(2)?,
                        rubric_version: row.get(3)?,
                        template_hash: row.get(4)?,
                        draft_hash: row.get(5)?,
                        anchors_hash: row.get(6)?,
                        comparisons: serde_json::from_str(&raw)
                            .map_err(|e| CacheError::Serde(e.to_string()))?,
                        input_tokens: row.get::<_, Option<i64>>(8)?.map(|v| v as u32),
                        output_tokens: row.get::<_, Option<i64>>(9)?.map(|v| v as u32),
                        created_at: row.get(10)?,
                        updated_at: row.get(11)?,
                        hit_count: row.get(12)?,
                    };
                    let line = serde_json::to_string(&record)
                        .map_err(|e| CacheError::Serde(e.to_string()))?;
                    use std::io::Write;
                    writeln!(file, "{line}")?;
                    written += 1;
                }
                Ok(written)
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut deleted: usize = 0;
                if let Some(days) = max_age_days {
                    let cutoff = now_epoch().saturating_sub((days as i64).saturating_mul(86_400));
                    let removed = conn.execute(
                        "DELETE FROM judgement_cache WHERE updated_at < ?1",
                        params![cutoff],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }

                if let Some(max_rows) = max_rows {
                    let count: i64 =
                        conn.query_row("SELECT COUNT(*) FROM judgement_cache", [], |row| {
                            row.get(0)
                        })?;
                    let keep = max_rows as i64;
                    if count > keep {
                        let removed = conn.execute(
                            "DELETE FROM judgement_cache WHERE key_hash IN ( \
                                SELECT key_hash FROM judgement_cache \
                                ORDER BY updated_at DESC, key_hash ASC LIMIT -1 OFFSET ?1 \
                             )",
                            params![keep],
                        )?;
                        deleted = deleted.saturating_add(removed);
                    }
                }

                let remaining: i64 =
                    conn.query_row("SELECT COUNT(*) FROM judgement_cache", [], |row| row.get(0))?;
                Ok(CachePruneStats {
                    deleted,
                    remaining: remaining.max(0) as usize,
                })
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

pub(crate) fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
