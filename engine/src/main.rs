use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mediaflow_core::{ConfigLayers, EngineConfig, LocalTaskFile, Orchestrator, CONFIG_FILE_NAME};
use mediaflow_observability::{
    canonical_logs_dir, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use mediaflow_orchestrator::classify_text;
use mediaflow_store::SqliteStore;
use mediaflow_types::{AttachedRole, LogEntry, MediaAttachment, Task, TaskDraft};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::info;

const DEFAULT_STATE_DIR: &str = ".mediaflow";
const LOG_RETENTION_DAYS: u64 = 14;
const WAIT_TICK: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "mediaflow-engine")]
#[command(about = "Submit media generation tasks and follow them to completion")]
struct Cli {
    /// Directory holding the database, task file, downloads and logs.
    #[arg(long, global = true, env = "MEDIAFLOW_STATE_DIR")]
    state_dir: Option<PathBuf>,
    /// Config file; defaults to config.json inside the state dir.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    base_url: Option<String>,
    #[arg(long, global = true)]
    api_key: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a task, run it and wait for it to finish.
    Submit {
        #[arg(long)]
        model: String,
        #[arg(long)]
        prompt: String,
        /// Media file sent along with the prompt.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Role prompt prepended to the task prompt, as `name=prompt`.
        #[arg(long = "role", value_name = "NAME=PROMPT")]
        roles: Vec<String>,
        /// Return once the task is submitted instead of waiting.
        #[arg(long, default_value_t = false)]
        detach: bool,
    },
    /// Resume polling for unfinished remote jobs and wait until none remain.
    Resume,
    /// Print the stored task list.
    Tasks,
    /// Classify an upstream error message.
    Classify { text: String },
    /// Manage bearer tokens.
    Tokens {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Store the API base URL in the database settings.
    SetBaseUrl { url: String },
}

#[derive(Subcommand, Debug)]
enum TokenAction {
    Add {
        token: String,
        #[arg(long)]
        remark: Option<String>,
    },
    List,
    Enable {
        id: i64,
    },
    Disable {
        id: i64,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::Classify { text } = &cli.command {
        println!("{}", serde_json::to_string_pretty(&classify_text(text))?);
        return Ok(());
    }

    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
    let process = match cli.command {
        Command::Submit { detach: false, .. } | Command::Resume => ProcessKind::Engine,
        _ => ProcessKind::Cli,
    };
    let (_log_guard, log_info) =
        init_process_logging(process, &canonical_logs_dir(&state_dir), LOG_RETENTION_DAYS)?;
    emit_event(
        tracing::Level::INFO,
        process,
        ObservabilityEvent {
            status: Some("ok"),
            detail: Some("jsonl logging initialized"),
            ..ObservabilityEvent::new("engine.main", "logging.initialized")
        },
    );
    info!("logging initialized: {:?}", log_info);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| state_dir.join(CONFIG_FILE_NAME));
    let overrides = build_cli_overrides(&state_dir, cli.base_url.clone(), cli.api_key.clone());
    let layers = ConfigLayers::load(&config_path, Some(overrides)).await;
    let base_config = layers.resolve().context("invalid configuration")?;

    let store = Arc::new(
        SqliteStore::open(&base_config.database_path(), &base_config.downloads_dir())
            .await
            .with_context(|| {
                format!("opening database {}", base_config.database_path().display())
            })?,
    );
    let config = match store.base_url().await? {
        Some(url) => layers
            .with_settings(serde_json::json!({ "base_url": url }))
            .resolve()
            .context("invalid configuration")?,
        None => base_config,
    };
    info!(
        base_url = %config.base_url,
        state_dir = %config.state_dir.display(),
        "configuration resolved"
    );

    match cli.command {
        Command::Submit {
            model,
            prompt,
            file,
            roles,
            detach,
        } => {
            let orchestrator = build_orchestrator(config, &store);
            orchestrator.startup().await;
            for raw in &roles {
                orchestrator.attach_role(parse_role(raw)?).await;
            }
            let mut draft = TaskDraft::new(model, prompt);
            if let Some(path) = file {
                draft = draft.with_attachment(attachment_for(path)?);
            }
            let task = orchestrator.add_task(draft).await;
            let logs = orchestrator.subscribe_logs();
            let printer = tokio::spawn(print_logs(logs));

            orchestrator.run(&task.id).await?;
            if !detach {
                tokio::select! {
                    _ = wait_for_task(&orchestrator, &task.id) => {}
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("interrupted; unfinished jobs resume with `mediaflow-engine resume`");
                    }
                }
            }
            orchestrator.shutdown().await;
            printer.abort();
            let task = orchestrator
                .get_task(&task.id)
                .await
                .context("task disappeared")?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        Command::Resume => {
            let orchestrator = build_orchestrator(config, &store);
            let printer = tokio::spawn(print_logs(orchestrator.subscribe_logs()));
            let report = orchestrator.startup().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            tokio::select! {
                _ = wait_until_idle(&orchestrator) => {}
                _ = tokio::signal::ctrl_c() => eprintln!("interrupted"),
            }
            orchestrator.shutdown().await;
            printer.abort();
        }
        Command::Tasks => {
            let tasks = store.load_tasks().await?.unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }
        Command::Tokens { action } => match action {
            TokenAction::Add { token, remark } => {
                let id = store.add_token(&token, remark.as_deref()).await?;
                println!("{id}");
            }
            TokenAction::List => {
                println!("{}", serde_json::to_string_pretty(&store.list_tokens().await?)?);
            }
            TokenAction::Enable { id } => store.set_token_active(id, true).await?,
            TokenAction::Disable { id } => store.set_token_active(id, false).await?,
        },
        Command::SetBaseUrl { url } => {
            store.set_base_url(&url).await?;
            info!(url = %url, "base url stored");
        }
        Command::Classify { .. } => {}
    }

    Ok(())
}

fn build_orchestrator(config: EngineConfig, store: &Arc<SqliteStore>) -> Orchestrator {
    let task_file = LocalTaskFile::new(config.task_file_path());
    Orchestrator::builder(config)
        .persistence(store.clone())
        .credentials(store.clone())
        .local_task_file(task_file)
        .build()
}

fn build_cli_overrides(state_dir: &Path, base_url: Option<String>, api_key: Option<String>) -> Value {
    let mut root = Map::new();
    root.insert(
        "state_dir".to_string(),
        Value::String(state_dir.to_string_lossy().into_owned()),
    );
    if let Some(url) = base_url.filter(|u| !u.trim().is_empty()) {
        root.insert("base_url".to_string(), Value::String(url));
    }
    if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
        root.insert("api_key".to_string(), Value::String(key));
    }
    Value::Object(root)
}

fn parse_role(raw: &str) -> anyhow::Result<AttachedRole> {
    let Some((name, prompt)) = raw.split_once('=') else {
        anyhow::bail!("role must be NAME=PROMPT, got `{raw}`");
    };
    let (name, prompt) = (name.trim(), prompt.trim());
    if name.is_empty() || prompt.is_empty() {
        anyhow::bail!("role name and prompt cannot be empty: `{raw}`");
    }
    Ok(AttachedRole {
        name: name.to_string(),
        prompt: prompt.to_string(),
    })
}

fn attachment_for(path: PathBuf) -> anyhow::Result<MediaAttachment> {
    if !path.is_file() {
        anyhow::bail!("attachment {} is not a file", path.display());
    }
    Ok(MediaAttachment {
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned()),
        data_url: None,
        path: Some(path),
    })
}

async fn wait_for_task(orchestrator: &Orchestrator, id: &str) {
    loop {
        let finished = orchestrator
            .get_task(id)
            .await
            .map(|t: Task| t.is_terminal())
            .unwrap_or(true);
        if finished && !orchestrator.has_active_poller(id).await {
            return;
        }
        tokio::time::sleep(WAIT_TICK).await;
    }
}

async fn wait_until_idle(orchestrator: &Orchestrator) {
    while !orchestrator.is_idle().await {
        tokio::time::sleep(WAIT_TICK).await;
    }
}

async fn print_logs(mut logs: broadcast::Receiver<LogEntry>) {
    loop {
        match logs.recv().await {
            Ok(entry) => eprintln!(
                "[{}] {:<7} {}",
                entry.at.format("%H:%M:%S"),
                entry.level.as_str(),
                entry.message
            ),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
