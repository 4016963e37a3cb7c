// Database Layer Module
// SQLite storage for credentials, remote jobs, downloads and the task list

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mediaflow_providers::{download_to_file, extract_job_id};
use mediaflow_types::{CredentialGrant, CredentialId, IncompleteJob, Task, TaskStatus};
use rand::seq::SliceRandom;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};

const TASK_LIST_KEY: &str = "list";
const BASE_URL_KEY: &str = "base_url";
const SYNTHESIZED_MODEL: &str = "sora2-unknown";
const SYNTHESIZED_MESSAGE: &str = "restored from database";
const PROMPT_PLACEHOLDER: &str = "(prompt unavailable)";

/// A stored credential as listed to operators. The token itself is never
/// returned from listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenRecord {
    pub id: CredentialId,
    pub is_active: bool,
    pub video_enabled: bool,
    /// `None` when no quota has been reported yet.
    pub videos_remaining: Option<i64>,
    pub remark: Option<String>,
    pub created_at: i64,
}

/// A finished download recorded for a remote job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadRecord {
    pub generation_id: String,
    pub remote_task_id: Option<String>,
    pub downloadable_url: String,
    pub local_path: PathBuf,
}

/// Database connection manager
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    downloads_dir: PathBuf,
}

impl SqliteStore {
    /// Open or create the database and apply schema migrations.
    pub async fn open(db_path: &Path, downloads_dir: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;

        // PRAGMA journal_mode returns a row, so query_row is used to ignore it
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
            downloads_dir: downloads_dir.to_path_buf(),
        };
        store.init_schema().await?;
        tracing::debug!(path = %store.db_path.display(), "sqlite store ready");
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                video_enabled INTEGER NOT NULL DEFAULT 1,
                status_json TEXT,
                remark TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS video_task_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT UNIQUE NOT NULL,
                token_id INTEGER NOT NULL,
                result_json TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS video_downloads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                generation_id TEXT UNIQUE NOT NULL,
                task_id TEXT,
                downloadable_url TEXT,
                local_path TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS task_list (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        // Columns added after the first schema; SQLite has no
        // ADD COLUMN IF NOT EXISTS, so inspect table_info instead.
        ensure_columns(
            &conn,
            "video_task_results",
            &[
                ("progress_pct", "REAL DEFAULT 0"),
                ("prompt", "TEXT DEFAULT ''"),
            ],
        )?;
        ensure_columns(&conn, "tokens", &[("remark", "TEXT")])?;
        Ok(())
    }

    // ========================================================================
    // Credentials
    // ========================================================================

    pub async fn add_token(&self, token: &str, remark: Option<&str>) -> StoreResult<CredentialId> {
        let token = token.trim();
        if token.is_empty() {
            return Err(StoreError::InvalidInput("token is empty".to_string()));
        }
        let now = now_ms();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tokens (token, remark, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![token, remark, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn list_tokens(&self) -> StoreResult<Vec<TokenRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, is_active, video_enabled, status_json, remark, created_at
             FROM tokens ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let status: Option<String> = row.get(3)?;
            Ok(TokenRecord {
                id: row.get(0)?,
                is_active: row.get::<_, i64>(1)? != 0,
                video_enabled: row.get::<_, i64>(2)? != 0,
                videos_remaining: status.as_deref().and_then(videos_remaining),
                remark: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn set_token_active(&self, id: CredentialId, active: bool) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE tokens SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
            params![active as i64, now_ms(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("token {id}")));
        }
        Ok(())
    }

    /// Picks uniformly among active, video-enabled tokens that still have
    /// quota. Tokens with no reported quota are eligible.
    pub async fn pick_credential(&self) -> StoreResult<CredentialGrant> {
        let candidates = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(
                "SELECT id, token, status_json FROM tokens WHERE is_active = 1 AND video_enabled = 1",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, CredentialId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            let mut candidates = Vec::new();
            for row in rows {
                let (id, token, status) = row?;
                if token.trim().is_empty() {
                    continue;
                }
                match status.as_deref().and_then(videos_remaining) {
                    Some(0) => continue,
                    _ => candidates.push(CredentialGrant {
                        credential_id: id,
                        bearer: token,
                    }),
                }
            }
            candidates
        };
        candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(StoreError::NoUsableCredential)
    }

    pub async fn bearer_by_id(&self, id: CredentialId) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().await;
        let token: Option<String> = conn
            .query_row("SELECT token FROM tokens WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(token.filter(|t| !t.trim().is_empty()))
    }

    // ========================================================================
    // Remote jobs
    // ========================================================================

    /// Records a freshly created remote job and folds the quota snapshot in
    /// its response into the issuing token's status.
    pub async fn record_job(
        &self,
        credential_id: CredentialId,
        raw: &Value,
        prompt: &str,
    ) -> StoreResult<String> {
        let remote_task_id = extract_job_id(raw)
            .ok_or_else(|| StoreError::InvalidInput("job result has no id".to_string()))?;
        let now = now_ms();
        let raw_json = serde_json::to_string(raw)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO video_task_results
                (task_id, token_id, result_json, progress_pct, prompt, created_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)",
            params![remote_task_id, credential_id, raw_json, prompt.trim(), now],
        )?;

        if let Some(rate) = raw
            .get("rate_limit_and_credit_balance")
            .filter(|v| v.is_object())
        {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT status_json FROM tokens WHERE id = ?1",
                    params![credential_id],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()?
                .flatten();
            let mut status = existing
                .as_deref()
                .and_then(|s| serde_json::from_str::<Value>(s).ok())
                .filter(|v| v.is_object())
                .unwrap_or_else(|| Value::Object(Default::default()));
            status["rate_limit_and_credit_balance"] = rate.clone();
            conn.execute(
                "UPDATE tokens SET status_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(&status)?, now, credential_id],
            )?;
        }
        Ok(remote_task_id)
    }

    pub async fn set_job_progress(&self, remote_task_id: &str, progress: f64) -> StoreResult<()> {
        let remote_task_id = remote_task_id.trim();
        if remote_task_id.is_empty() {
            return Err(StoreError::InvalidInput("remote task id is empty".to_string()));
        }
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE video_task_results SET progress_pct = ?1 WHERE task_id = ?2",
            params![progress, remote_task_id],
        )?;
        Ok(())
    }

    /// Jobs with recorded progress below 100, oldest first.
    pub async fn incomplete_jobs(&self) -> StoreResult<Vec<IncompleteJob>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT task_id, token_id FROM video_task_results
             WHERE progress_pct < 100 OR progress_pct IS NULL
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(IncompleteJob {
                remote_job_id: row.get(0)?,
                credential_id: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn credential_for_job(&self, remote_task_id: &str) -> StoreResult<Option<CredentialId>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT token_id FROM video_task_results WHERE task_id = ?1",
                params![remote_task_id.trim()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Drops the job and download rows of a remote task, optionally removing
    /// the downloaded file.
    pub async fn delete_task_data(&self, remote_task_id: &str, delete_file: bool) -> StoreResult<()> {
        let local_path: Option<String> = {
            let conn = self.conn.lock().await;
            let local_path = conn
                .query_row(
                    "SELECT local_path FROM video_downloads WHERE task_id = ?1",
                    params![remote_task_id],
                    |row| row.get(0),
                )
                .optional()?;
            conn.execute(
                "DELETE FROM video_downloads WHERE task_id = ?1",
                params![remote_task_id],
            )?;
            conn.execute(
                "DELETE FROM video_task_results WHERE task_id = ?1",
                params![remote_task_id],
            )?;
            local_path
        };
        if let (true, Some(path)) = (delete_file, local_path) {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path, "could not delete downloaded file: {}", err);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Downloads
    // ========================================================================

    /// Finds the result item for `remote_task_id`, downloads its media and
    /// records where it landed. `Ok(None)` when the results hold no usable
    /// item for the job.
    pub async fn download_result(
        &self,
        results: &Value,
        remote_task_id: &str,
    ) -> StoreResult<Option<DownloadRecord>> {
        let remote_task_id = remote_task_id.trim();
        if remote_task_id.is_empty() {
            return Ok(None);
        }
        let items = results
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let Some(item) = items.iter().find(|item| {
            item.get("task_id")
                .and_then(|v| v.as_str())
                .map(|id| id.trim() == remote_task_id)
                .unwrap_or(false)
        }) else {
            tracing::info!(remote_task_id, "no result item for finished job");
            return Ok(None);
        };

        let generation_id = ["generation_id", "id"]
            .iter()
            .filter_map(|key| item.get(*key).and_then(|v| v.as_str()))
            .map(str::trim)
            .find(|id| !id.is_empty());
        let url = item
            .get("downloadable_url")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|u| !u.is_empty());
        let (Some(generation_id), Some(url)) = (generation_id, url) else {
            tracing::info!(remote_task_id, "result item has nothing to download");
            return Ok(None);
        };

        if !is_plain_file_stem(generation_id) {
            tracing::warn!(remote_task_id, generation_id, "refusing unsafe generation id");
            return Ok(None);
        }

        let local_path = self.downloads_dir.join(format!("{generation_id}.mp4"));
        let bytes = download_to_file(url, &local_path)
            .await
            .map_err(|err| StoreError::Download(err.to_string()))?;

        let record = DownloadRecord {
            generation_id: generation_id.to_string(),
            remote_task_id: Some(remote_task_id.to_string()),
            downloadable_url: url.to_string(),
            local_path,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO video_downloads
                (generation_id, task_id, downloadable_url, local_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.generation_id,
                record.remote_task_id,
                record.downloadable_url,
                record.local_path.to_string_lossy(),
                now_ms()
            ],
        )?;
        tracing::info!(
            remote_task_id,
            bytes,
            path = %record.local_path.display(),
            "downloaded result"
        );
        Ok(Some(record))
    }

    /// Remote task id to local file path, for every recorded download.
    pub async fn downloads_by_task(&self) -> StoreResult<HashMap<String, String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT task_id, local_path FROM video_downloads WHERE task_id IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows.collect::<Result<HashMap<_, _>, _>>()?)
    }

    // ========================================================================
    // Task list
    // ========================================================================

    /// The stored task list with download paths merged in. Without a stored
    /// list, tasks are rebuilt from recorded remote jobs.
    pub async fn load_tasks(&self) -> StoreResult<Option<Vec<Task>>> {
        let downloads = self.downloads_by_task().await?;
        let stored: Option<String> = {
            let conn = self.conn.lock().await;
            conn.query_row(
                "SELECT value FROM task_list WHERE key = ?1",
                params![TASK_LIST_KEY],
                |row| row.get(0),
            )
            .optional()?
        };

        if let Some(value) = stored {
            let mut tasks: Vec<Task> = serde_json::from_str(&value)?;
            for task in &mut tasks {
                let key = task.remote_task_id.as_deref().unwrap_or(&task.id);
                if let Some(path) = downloads.get(key).filter(|p| !p.trim().is_empty()) {
                    task.local_path = Some(path.clone());
                }
            }
            return Ok(Some(tasks));
        }

        let tasks = self.tasks_from_jobs(&downloads).await?;
        if tasks.is_empty() {
            return Ok(None);
        }
        tracing::info!(count = tasks.len(), "rebuilt task list from recorded jobs");
        Ok(Some(tasks))
    }

    async fn tasks_from_jobs(&self, downloads: &HashMap<String, String>) -> StoreResult<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT task_id, token_id, result_json, progress_pct, prompt, created_at
             FROM video_task_results ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, CredentialId>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut tasks = Vec::new();
        for row in rows {
            let (remote_task_id, token_id, result, progress, prompt, created_at) = row?;
            let progress = progress.unwrap_or(0.0);
            let prompt = prompt
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| PROMPT_PLACEHOLDER.to_string());
            tasks.push(Task {
                id: remote_task_id.clone(),
                model: SYNTHESIZED_MODEL.to_string(),
                prompt,
                status: if progress >= 100.0 {
                    TaskStatus::Done
                } else {
                    TaskStatus::Running
                },
                progress: progress.clamp(0.0, 100.0),
                message: SYNTHESIZED_MESSAGE.to_string(),
                local_path: downloads.get(&remote_task_id).cloned(),
                remote_task_id: Some(remote_task_id),
                token_id_for_pending: Some(token_id),
                result,
                created_at,
                url: None,
                wm_stage: None,
                wm_attempt: None,
                file_name: None,
                file_data_url: None,
                file_path: None,
            });
        }
        Ok(tasks)
    }

    pub async fn save_tasks(&self, tasks: &[Task]) -> StoreResult<()> {
        let value = serde_json::to_string(tasks)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO task_list (key, value) VALUES (?1, ?2)",
            params![TASK_LIST_KEY, value],
        )?;
        Ok(())
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub async fn setting(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Stored base URL, if one was saved and is not blank.
    pub async fn base_url(&self) -> StoreResult<Option<String>> {
        Ok(self
            .setting(BASE_URL_KEY)
            .await?
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()))
    }

    pub async fn set_base_url(&self, url: &str) -> StoreResult<()> {
        let url = url.trim().trim_end_matches('/');
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(StoreError::InvalidInput(format!(
                "base url must start with http:// or https://: {url}"
            )));
        }
        self.set_setting(BASE_URL_KEY, url).await
    }
}

fn ensure_columns(conn: &Connection, table: &str, columns: &[(&str, &str)]) -> StoreResult<()> {
    let existing: HashSet<String> = {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
        rows.collect::<Result<HashSet<_>, _>>()?
    };
    for (name, ddl) in columns {
        if !existing.contains(*name) {
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {ddl}"), [])?;
            tracing::info!(table, column = name, "added column");
        }
    }
    Ok(())
}

/// Remaining video quota from a token's status JSON. Negative values mean
/// the upstream does not know.
fn videos_remaining(status_json: &str) -> Option<i64> {
    let status: Value = serde_json::from_str(status_json).ok()?;
    status
        .get("rate_limit_and_credit_balance")?
        .get("estimated_num_videos_remaining")?
        .as_i64()
        .filter(|n| *n >= 0)
}

/// True when `id` can name a file inside the downloads directory without
/// escaping it.
fn is_plain_file_stem(id: &str) -> bool {
    !id.contains(|c: char| c == '/' || c == '\\')
        && !id.contains("..")
        && Path::new(id).file_name() == Some(OsStr::new(id))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
