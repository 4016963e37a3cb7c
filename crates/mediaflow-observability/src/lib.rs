use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const OBS_TARGET: &str = "mediaflow.obs";

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// Long-lived process that keeps pollers alive.
    Engine,
    /// One-shot command that exits after printing.
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// A structured orchestration event. Everything but `event` and
/// `component` is optional and logged as an empty string when absent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub task_id: Option<&'a str>,
    pub remote_task_id: Option<&'a str>,
    pub poll_key: Option<&'a str>,
    pub model: Option<&'a str>,
    pub status: Option<&'a str>,
    pub detail: Option<&'a str>,
}

impl<'a> ObservabilityEvent<'a> {
    pub fn new(component: &'a str, event: &'a str) -> Self {
        Self {
            event,
            component,
            ..Self::default()
        }
    }
}

pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("[redacted len={} hash={}]", trimmed.len(), short_hash(trimmed))
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

macro_rules! obs_event {
    ($macro:ident, $process:expr, $event:expr) => {
        tracing::$macro!(
            target: OBS_TARGET,
            process = $process.as_str(),
            component = $event.component,
            event = $event.event,
            task_id = $event.task_id.unwrap_or(""),
            remote_task_id = $event.remote_task_id.unwrap_or(""),
            poll_key = $event.poll_key.unwrap_or(""),
            model = $event.model.unwrap_or(""),
            status = $event.status.unwrap_or(""),
            detail = $event.detail.unwrap_or(""),
            "orchestration_event"
        )
    };
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => obs_event!(error, process, event),
        Level::WARN => obs_event!(warn, process, event),
        Level::DEBUG | Level::TRACE => obs_event!(debug, process, event),
        _ => obs_event!(info, process, event),
    }
}

fn file_prefix(process: ProcessKind) -> String {
    format!("mediaflow.{}", process.as_str())
}

/// Installs the global subscriber: `RUST_LOG`-style filter (default
/// `info`), a compact console layer and a daily rolling JSONL file.
/// The returned guard must outlive the process's logging.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, process, retention_days, Utc::now())?;

    let prefix = file_prefix(process);
    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(prefix.clone())
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_writer(std::io::stderr);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix,
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

fn cleanup_old_jsonl(
    logs_dir: &Path,
    process: ProcessKind,
    retention_days: u64,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let cutoff = now - chrono::Duration::days(retention_days as i64);
    let prefix = format!("{}.", file_prefix(process));
    let mut removed = 0;

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(date_part) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".jsonl"))
        else {
            continue;
        };

        // mediaflow.<proc>.YYYY-MM-DD.jsonl
        let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };
        let Some(dt) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };
        if DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc) < cutoff
            && fs::remove_file(&path).is_ok()
        {
            removed += 1;
        }
    }

    Ok(removed)
}

pub fn canonical_logs_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_bearer() {
        let redacted = redact_text("eyJhbGciOi.secret-bearer");
        assert!(redacted.starts_with("[redacted len=24"));
        assert!(!redacted.contains("secret"));
        assert_eq!(redact_text("   "), "");
    }

    #[test]
    fn cleanup_only_removes_expired_files_for_this_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = DateTime::parse_from_rfc3339("2026-03-20T12:00:00Z")
            .expect("date")
            .with_timezone(&Utc);
        for name in [
            "mediaflow.engine.2026-01-01.jsonl",
            "mediaflow.engine.2026-03-19.jsonl",
            "mediaflow.cli.2026-01-01.jsonl",
            "mediaflow.engine.notes.jsonl",
        ] {
            fs::write(dir.path().join(name), "{}").expect("write");
        }

        let removed =
            cleanup_old_jsonl(dir.path(), ProcessKind::Engine, 14, now).expect("cleanup");
        assert_eq!(removed, 1);
        assert!(!dir.path().join("mediaflow.engine.2026-01-01.jsonl").exists());
        assert!(dir.path().join("mediaflow.engine.2026-03-19.jsonl").exists());
        assert!(dir.path().join("mediaflow.cli.2026-01-01.jsonl").exists());
        assert!(dir.path().join("mediaflow.engine.notes.jsonl").exists());
    }

    #[test]
    fn logs_live_under_state_dir() {
        let root = PathBuf::from("/tmp/mediaflow");
        assert_eq!(canonical_logs_dir(&root), root.join("logs"));
    }
}
