use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{OrchestratorError, Result};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub poll_interval_ms: u64,
    pub task_list_cap: usize,
    pub log_capacity: usize,
    pub video_model_prefix: String,
    /// Consecutive failed ticks after which a poller gives up. `None` polls
    /// until the job completes or the task is cancelled.
    pub max_consecutive_poll_errors: Option<u32>,
    pub state_dir: PathBuf,
    pub downloads_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            poll_interval_ms: 10_000,
            task_list_cap: 50,
            log_capacity: 200,
            video_model_prefix: "sora2-".to_string(),
            max_consecutive_poll_errors: None,
            state_dir: PathBuf::from(".mediaflow"),
            downloads_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.downloads_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("downloads"))
    }

    pub fn task_file_path(&self) -> PathBuf {
        self.state_dir.join("tasks.json")
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("mediaflow.db")
    }

    fn validate(self) -> Result<Self> {
        if self.base_url.trim().is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "base_url must not be empty".to_string(),
            ));
        }
        if self.task_list_cap == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "task_list_cap must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Configuration sources, lowest precedence first.
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    pub file: Value,
    pub settings: Value,
    pub env: Value,
    pub cli: Value,
}

impl ConfigLayers {
    /// Reads `config.json` (missing or unreadable files count as empty) and
    /// the `MEDIAFLOW_*` environment.
    pub async fn load(config_path: &Path, cli_overrides: Option<Value>) -> Self {
        let file = match tokio::fs::read_to_string(config_path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                tracing::warn!("ignoring malformed {}: {}", config_path.display(), err);
                empty_object()
            }),
            Err(_) => empty_object(),
        };
        Self {
            file,
            settings: empty_object(),
            env: env_layer(|key| std::env::var(key).ok()),
            cli: cli_overrides.unwrap_or_else(empty_object),
        }
    }

    /// Values the persistence layer stores (currently only `base_url`).
    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn effective_value(&self) -> Value {
        let mut merged = serde_json::to_value(EngineConfig::default()).unwrap_or_else(|_| empty_object());
        deep_merge(&mut merged, &self.file);
        deep_merge(&mut merged, &self.settings);
        deep_merge(&mut merged, &self.env);
        deep_merge(&mut merged, &self.cli);
        merged
    }

    pub fn resolve(&self) -> Result<EngineConfig> {
        let config: EngineConfig = serde_json::from_value(self.effective_value())?;
        config.validate()
    }
}

fn env_layer(read: impl Fn(&str) -> Option<String>) -> Value {
    let mut map = Map::new();
    let non_empty = |key: &str| read(key).filter(|v| !v.trim().is_empty());
    if let Some(url) = non_empty("MEDIAFLOW_BASE_URL") {
        map.insert("base_url".to_string(), json!(url));
    }
    if let Some(key) = non_empty("MEDIAFLOW_API_KEY") {
        map.insert("api_key".to_string(), json!(key));
    }
    if let Some(ms) = non_empty("MEDIAFLOW_POLL_INTERVAL_MS").and_then(|v| v.parse::<u64>().ok()) {
        map.insert("poll_interval_ms".to_string(), json!(ms));
    }
    if let Some(dir) = non_empty("MEDIAFLOW_DOWNLOADS_DIR") {
        map.insert("downloads_dir".to_string(), json!(dir));
    }
    Value::Object(map)
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
