use std::sync::Arc;

use mediaflow_providers::{GenerationApi, HttpGenerationClient};
use mediaflow_types::{AttachedRole, LogEntry, Task, TaskDraft, TaskPatch};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::context::OrchestratorContext;
use crate::credentials::CredentialResolver;
use crate::error::{OrchestratorError, Result};
use crate::event_log::EventLog;
use crate::poller::PendingPoller;
use crate::ports::{CredentialProvider, Persistence};
use crate::recovery::{OrphanRecovery, RecoveryReport};
use crate::registry::{PollKey, PollerRegistry, StreamRegistry};
use crate::roles::RoleBook;
use crate::runner::TaskRunner;
use crate::store::{LocalTaskFile, TaskMirror, TaskStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartupReport {
    /// Tasks loaded from the mirror, if it held a list.
    pub hydrated: Option<usize>,
    pub recovery: RecoveryReport,
}

pub struct OrchestratorBuilder {
    config: EngineConfig,
    api: Option<Arc<dyn GenerationApi>>,
    persistence: Option<Arc<dyn Persistence>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    local_task_file: Option<LocalTaskFile>,
}

impl OrchestratorBuilder {
    pub fn api(mut self, api: Arc<dyn GenerationApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn local_task_file(mut self, file: LocalTaskFile) -> Self {
        self.local_task_file = Some(file);
        self
    }

    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Orchestrator {
        let config = Arc::new(self.config);
        let api = self.api.unwrap_or_else(|| {
            Arc::new(HttpGenerationClient::new(
                &config.base_url,
                config.api_key.clone(),
            ))
        });
        let mirror = TaskMirror::select(self.persistence.clone(), self.local_task_file);
        let store = TaskStore::new(mirror, config.task_list_cap);
        tracing::info!(mirror = store.mirror_kind(), "task store ready");

        let ctx = OrchestratorContext {
            store,
            log: EventLog::new(config.log_capacity),
            api,
            persistence: self.persistence,
            credentials: CredentialResolver::new(self.credentials, config.api_key.clone()),
            pollers: PollerRegistry::new(),
            streams: StreamRegistry::new(),
            roles: RoleBook::new(),
            config,
        };
        let poller = PendingPoller::new(ctx.clone());
        Orchestrator {
            runner: TaskRunner::new(ctx.clone(), poller.clone()),
            recovery: OrphanRecovery::new(ctx.clone(), poller),
            ctx,
        }
    }
}

/// Entry point for callers: task CRUD, execution, cancellation, logs and the
/// startup hook.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: OrchestratorContext,
    runner: TaskRunner,
    recovery: OrphanRecovery,
}

impl Orchestrator {
    pub fn builder(config: EngineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            api: None,
            persistence: None,
            credentials: None,
            local_task_file: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// Hydrates the task list, then resumes pollers for incomplete jobs.
    pub async fn startup(&self) -> StartupReport {
        let hydrated = self.ctx.store.hydrate().await;
        if let Some(count) = hydrated {
            self.ctx.log.info(format!("Loaded {count} task(s)"));
        }
        let recovery = self.recovery.recover().await;
        StartupReport { hydrated, recovery }
    }

    pub async fn list_tasks(&self) -> Vec<Task> {
        self.ctx.store.list().await
    }

    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.ctx.store.get(id).await
    }

    pub async fn add_task(&self, draft: TaskDraft) -> Task {
        let task = self.ctx.store.add(Task::new(draft)).await;
        self.ctx
            .log
            .info(format!("Added task {} ({})", task.id, task.model));
        task
    }

    pub async fn update_task(&self, id: &str, patch: &TaskPatch) -> Result<Task> {
        self.ctx
            .store
            .update(id, patch)
            .await
            .ok_or_else(|| OrchestratorError::TaskNotFound(id.to_string()))
    }

    /// Removes a task after stopping anything still working on it.
    pub async fn remove_task(&self, id: &str) -> Result<Task> {
        self.ctx.streams.cancel(id).await;
        self.ctx.pollers.stop(&PollKey::Task(id.to_string())).await;
        self.ctx
            .store
            .remove(id)
            .await
            .ok_or_else(|| OrchestratorError::TaskNotFound(id.to_string()))
    }

    /// Drops every task. Orphan pollers keep running; they own no task.
    pub async fn clear_tasks(&self) {
        for task in self.ctx.store.list().await {
            self.ctx.streams.cancel(&task.id).await;
            self.ctx.pollers.stop(&PollKey::Task(task.id)).await;
        }
        self.ctx.store.clear().await;
        self.ctx.log.info("Cleared all tasks");
    }

    pub async fn run(&self, id: &str) -> Result<()> {
        self.runner.run(id).await
    }

    /// Runs a task in the background; errors are logged.
    pub fn spawn_run(&self, id: &str) -> JoinHandle<()> {
        let runner = self.runner.clone();
        let log = self.ctx.log.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(err) = runner.run(&id).await {
                log.error(format!("Task {id} could not start: {err}"));
            }
        })
    }

    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.runner.cancel(id).await
    }

    pub async fn attach_role(&self, role: AttachedRole) -> bool {
        self.ctx.roles.attach(role).await
    }

    pub async fn detach_role(&self, name: &str) -> bool {
        self.ctx.roles.detach(name).await
    }

    pub async fn roles(&self) -> Vec<AttachedRole> {
        self.ctx.roles.list().await
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEntry> {
        self.ctx.log.subscribe()
    }

    pub fn recent_logs(&self) -> Vec<LogEntry> {
        self.ctx.log.recent()
    }

    pub fn clear_logs(&self) {
        self.ctx.log.clear();
    }

    pub async fn active_pollers(&self) -> Vec<String> {
        let mut keys = self
            .ctx
            .pollers
            .keys()
            .await
            .into_iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub async fn has_active_poller(&self, id: &str) -> bool {
        self.ctx.pollers.contains(&PollKey::Task(id.to_string())).await
    }

    /// No pollers registered and no stream in flight.
    pub async fn is_idle(&self) -> bool {
        self.ctx.pollers.is_empty().await && self.ctx.streams.is_empty().await
    }

    pub async fn flush(&self) {
        self.ctx.store.flush().await;
    }

    pub async fn shutdown(&self) {
        self.ctx.streams.cancel_all().await;
        let stopped = self.ctx.pollers.stop_all().await;
        if stopped > 0 {
            tracing::info!(stopped, "stopped pollers on shutdown");
        }
        self.ctx.store.flush().await;
    }
}
