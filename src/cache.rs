//! SQLite-backed cache for validated evaluator responses.
//!
//! Only responses that passed validation are stored, keyed by evaluator
//! model, judge template, rubric fingerprint, the rendered document prompt
//! (title and text) and the sampling parameters. A hit is re-parsed on
//! read, so a stale entry can never bypass validation.

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct JudgmentCacheKey {
    pub model: String,
    pub template_slug: String,
    pub template_hash: String,
    pub rubric_hash: String,
    pub subject_hash: String,
    /// `temperature=..;max_tokens=..`, empty when not set.
    pub sampling: String,
    pub key_hash: String,
}

impl JudgmentCacheKey {
    pub fn new(
        model: &str,
        template_slug: &str,
        template_hash: &str,
        rubric_hash: &str,
        subject_text: &str,
    ) -> Self {
        let mut key = Self {
            model: model.to_string(),
            template_slug: template_slug.to_string(),
            template_hash: template_hash.to_string(),
            rubric_hash: rubric_hash.to_string(),
            subject_hash: hash_text(subject_text),
            sampling: String::new(),
            key_hash: String::new(),
        };
        key.rehash();
        key
    }

    /// Fold the request's sampling parameters into the key.
    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.sampling = format!("temperature={temperature};max_tokens={max_tokens}");
        self.rehash();
        self
    }

    fn rehash(&mut self) {
        self.key_hash = hash_fields(&[
            self.model.as_str(),
            self.template_slug.as_str(),
            self.template_hash.as_str(),
            self.rubric_hash.as_str(),
            self.subject_hash.as_str(),
            self.sampling.as_str(),
        ]);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    /// Raw evaluator text that validated.
    pub raw: String,
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
pub trait JudgmentCache: Send + Sync {
    async fn get(&self, key: &JudgmentCacheKey) -> Result<Option<CachedResponse>, CacheError>;
    async fn put(&self, key: &JudgmentCacheKey, value: &CachedResponse) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct SqliteJudgmentCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJudgmentCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS judgment_cache (\
               key_hash TEXT PRIMARY KEY,\
               model TEXT NOT NULL,\
               template_slug TEXT NOT NULL,\
               template_hash TEXT NOT NULL,\
               rubric_hash TEXT NOT NULL,\
               subject_hash TEXT NOT NULL,\
               raw TEXT NOT NULL,\
               input_tokens INTEGER,\
               output_tokens INTEGER,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0\
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// `QUILL_CACHE_PATH`, else `.quill_judgment_cache.sqlite` in the
    /// working directory.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("QUILL_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".quill_judgment_cache.sqlite")
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
impl JudgmentCache for SqliteJudgmentCache {
    async fn get(&self, key: &JudgmentCacheKey) -> Result<Option<CachedResponse>, CacheError> {
        let key_hash = key.key_hash.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT raw, input_tokens, output_tokens FROM judgment_cache WHERE key_hash = ?1",
                )?;
                let mut rows = stmt.query(params![key_hash])?;
                if let Some(row) = rows.next()? {
                    let entry = CachedResponse {
                        raw: row.get(0)?,
                        input_tokens: row.get::<_, Option<i64>>(1)?.map(|v| v as u32),
                        output_tokens: row.get::<_, Option<i64>>(2)?.map(|v| v as u32),
                    };
                    conn.execute(
                        "UPDATE judgment_cache \
                         SET hit_count = hit_count + 1, updated_at = ?1 \
                         WHERE key_hash = ?2",
                        params![now_epoch(), key_hash],
                    )?;
                    Ok(Some(entry))
                } else {
                    Ok(None)
                }
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn put(&self, key: &JudgmentCacheKey, value: &CachedResponse) -> Result<(), CacheError> {
        let key = key.clone();
        let value = value.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let now = now_epoch();
                conn.execute(
                    "INSERT INTO judgment_cache (\
                        key_hash, model, template_slug, template_hash, rubric_hash, subject_hash,\
                        raw, input_tokens, output_tokens, created_at, updated_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                     ON CONFLICT(key_hash) DO UPDATE SET \
                        raw = excluded.raw,\
                        input_tokens = excluded.input_tokens,\
                        output_tokens = excluded.output_tokens,\
                        updated_at = excluded.updated_at",
                    params![
                        key.key_hash,
                        key.model,
                        key.template_slug,
                        key.template_hash,
                        key.rubric_hash,
                        key.subject_hash,
                        value.raw,
                        value.input_tokens.map(|v| v as i64),
                        value.output_tokens.map(|v| v as i64),
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

/// Advisory lock held next to the database file (`<db>.lock`).
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
    pub template_slug: String,
    pub template_hash: String,
    pub rubric_hash: String,
    pub subject_hash: String,
    pub raw: String,
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

impl SqliteJudgmentCache {
    /// Write every row as one JSON object per line, most recently used first.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
        let path = path.as_ref().to_path_buf();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key_hash, model, template_slug, template_hash, rubric_hash, subject_hash,\
                            raw, input_tokens, output_tokens, created_at, updated_at, hit_count \
                     FROM judgment_cache ORDER BY updated_at DESC",
                )?;
                let mut rows = stmt.query([])?;
                let mut file = std::fs::File::create(path)?;
                let mut written = 0usize;
                while let Some(row) = rows.next()? {
                    let record = CacheExportRow {
                        key_hash: row.get(0)?,
                        model: row.get(1)?,
                        template_slug: row.get(2)?,
                        template_hash: row.get(3)?,
                        rubric_hash: row.get(4)?,
                        subject_hash: row.get(5)?,
                        raw: row.get(6)?,
                        input_tokens: row.get::<_, Option<i64>>(7)?.map(|v| v as u32),
                        output_tokens: row.get::<_, Option<i64>>(8)?.map(|v| v as u32),
                        created_at: row.get(9)?,
                        updated_at: row.get(10)?,
                        hit_count: row.get(11)?,
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

    /// Delete rows idle for more than `max_age_days`, then keep only the
    /// `max_rows` most recently used.
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
                        "DELETE FROM judgment_cache WHERE updated_at < ?1",
                        params![cutoff],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }

                if let Some(max_rows) = max_rows {
                    let removed = conn.execute(
                        "DELETE FROM judgment_cache WHERE key_hash IN (\
                            SELECT key_hash FROM judgment_cache \
                            ORDER BY updated_at DESC LIMIT -1 OFFSET ?1\
                         )",
                        params![max_rows as i64],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }

                let remaining: i64 =
                    conn.query_row("SELECT COUNT(*) FROM judgment_cache", [], |row| row.get(0))?;
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

fn hash_text(text: &str) -> String {
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
