use mediaflow_observability::{emit_event, ObservabilityEvent, ProcessKind};
use mediaflow_orchestrator::{normalize_progress, TaskEvent};
use mediaflow_types::CredentialId;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::context::OrchestratorContext;
use crate::credentials::PollCredential;
use crate::registry::PollKey;

const COMPONENT: &str = "pending_poller";

/// What a poller watches: a remote job owned by a local task, or an orphan
/// job recovered from persistence with no local task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollTarget {
    Local {
        task_id: String,
        remote_job_id: String,
    },
    Orphan {
        remote_job_id: String,
        credential_id: Option<CredentialId>,
    },
}

impl PollTarget {
    pub fn key(&self) -> PollKey {
        match self {
            PollTarget::Local { task_id, .. } => PollKey::Task(task_id.clone()),
            PollTarget::Orphan { remote_job_id, .. } => PollKey::Remote(remote_job_id.clone()),
        }
    }

    pub fn remote_job_id(&self) -> &str {
        match self {
            PollTarget::Local { remote_job_id, .. } | PollTarget::Orphan { remote_job_id, .. } => {
                remote_job_id
            }
        }
    }

    fn task_id(&self) -> Option<&str> {
        match self {
            PollTarget::Local { task_id, .. } => Some(task_id),
            PollTarget::Orphan { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyActive,
    NoCredentialMechanism,
}

#[derive(Debug)]
enum TickOutcome {
    Progressed,
    Skipped,
    Stop(String),
    Complete { bearer: String },
}

/// Starts background pollers. Each poller ticks immediately, then once per
/// configured interval, until its job completes or it is stopped.
#[derive(Clone)]
pub struct PendingPoller {
    ctx: OrchestratorContext,
}

impl PendingPoller {
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self { ctx }
    }

    pub async fn start(&self, target: PollTarget) -> StartOutcome {
        let key = target.key();
        if !self.ctx.credentials.has_mechanism() {
            self.ctx.log.warn(format!(
                "No credential mechanism available, not polling {key}"
            ));
            return StartOutcome::NoCredentialMechanism;
        }

        let handle = match self.ctx.pollers.acquire(key.clone(), target.remote_job_id()).await {
            Ok(handle) => handle,
            Err(existing) => {
                tracing::debug!(
                    poll_key = %key,
                    generation = existing.generation,
                    "poller already active"
                );
                return StartOutcome::AlreadyActive;
            }
        };

        self.ctx.log.info(format!(
            "Polling pending for {} (remote {}) every {}s",
            key,
            target.remote_job_id(),
            self.ctx.config.poll_interval().as_secs_f64()
        ));
        let key_text = key.to_string();
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                task_id: target.task_id(),
                remote_task_id: Some(target.remote_job_id()),
                poll_key: Some(key_text.as_str()),
                status: Some("started"),
                ..ObservabilityEvent::new(COMPONENT, "poller.start")
            },
        );

        let pinned = match &target {
            PollTarget::Orphan { credential_id, .. } => *credential_id,
            PollTarget::Local { .. } => None,
        };
        let worker = PollWorker {
            ctx: self.ctx.clone(),
            key,
            target,
            generation: handle.generation,
            cancel: handle.cancel,
            pinned,
            consecutive_errors: 0,
        };
        tokio::spawn(worker.run());
        StartOutcome::Started
    }
}

struct PollWorker {
    ctx: OrchestratorContext,
    key: PollKey,
    target: PollTarget,
    generation: u64,
    cancel: CancellationToken,
    pinned: Option<CredentialId>,
    consecutive_errors: u32,
}

impl PollWorker {
    async fn run(mut self) {
        let interval = self.ctx.config.poll_interval();
        let cancel = self.cancel.clone();
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = self.tick() => outcome,
            };

            match outcome {
                Ok(TickOutcome::Progressed) => self.consecutive_errors = 0,
                Ok(TickOutcome::Skipped) => {}
                Ok(TickOutcome::Stop(reason)) => {
                    self.stop(&reason).await;
                    return;
                }
                Ok(TickOutcome::Complete { bearer }) => {
                    self.complete(&bearer).await;
                    return;
                }
                Err(err) => {
                    self.consecutive_errors = self.consecutive_errors.saturating_add(1);
                    self.ctx
                        .log
                        .warn(format!("Pending poll for {} failed: {}", self.key, err));
                    if let Some(limit) = self.ctx.config.max_consecutive_poll_errors {
                        if self.consecutive_errors >= limit {
                            self.give_up(limit).await;
                            return;
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn tick(&mut self) -> anyhow::Result<TickOutcome> {
        let remote_job_id = self.target.remote_job_id().to_string();

        let pinned = match &self.target {
            PollTarget::Local { task_id, .. } => {
                let Some(task) = self.ctx.store.get(task_id).await else {
                    return Ok(TickOutcome::Stop("task no longer exists".to_string()));
                };
                if task.is_terminal() {
                    return Ok(TickOutcome::Stop(format!("task is {}", task.status)));
                }
                task.token_id_for_pending.or(self.pinned)
            }
            PollTarget::Orphan { .. } => self.pinned,
        };

        let credential = match self
            .ctx
            .credentials
            .resolve_for_poll(pinned, &remote_job_id)
            .await?
        {
            PollCredential::Ready {
                credential,
                newly_pinned,
            } => {
                if let (true, Some(id)) = (newly_pinned, credential.credential_id) {
                    self.pin(id).await;
                }
                credential
            }
            PollCredential::Unavailable(reason) => {
                return Ok(match self.target {
                    PollTarget::Local { .. } => {
                        self.ctx.log.warn(format!(
                            "Skipping poll for {}: {}",
                            self.key, reason
                        ));
                        TickOutcome::Skipped
                    }
                    PollTarget::Orphan { .. } => TickOutcome::Stop(reason),
                });
            }
        };
        tracing::debug!(
            poll_key = %self.key,
            bearer = %mediaflow_observability::redact_text(&credential.bearer),
            "polling pending queue"
        );

        let pending = self.ctx.api.poll_pending(&credential.bearer).await?;
        let Some(first) = pending.first() else {
            return Ok(TickOutcome::Complete {
                bearer: credential.bearer,
            });
        };

        let percent = normalize_progress(first.progress_pct.unwrap_or(0.0));
        if percent >= 100.0 {
            return Ok(TickOutcome::Complete {
                bearer: credential.bearer,
            });
        }
        self.record_progress(&remote_job_id, percent).await;
        Ok(TickOutcome::Progressed)
    }

    async fn pin(&mut self, credential_id: CredentialId) {
        self.pinned = Some(credential_id);
        if let Some(task_id) = self.target.task_id() {
            self.ctx
                .store
                .apply(task_id, TaskEvent::CredentialPinned { credential_id })
                .await;
            self.ctx.log.info(format!(
                "Backfilled credential {credential_id} for task {task_id}"
            ));
        }
    }

    async fn record_progress(&self, remote_job_id: &str, percent: f64) {
        if let Some(task_id) = self.target.task_id() {
            self.ctx
                .store
                .apply(task_id, TaskEvent::Progress { percent })
                .await;
        }
        if let Some(persistence) = &self.ctx.persistence {
            if let Err(err) = persistence.update_job_progress(remote_job_id, percent).await {
                tracing::warn!(poll_key = %self.key, "progress write failed: {}", err);
            }
        }
    }

    // Deregisters before any terminal action so a concurrent stop wins and
    // retrieval runs at most once.
    async fn complete(&self, bearer: &str) {
        if self
            .ctx
            .pollers
            .finish_if_match(&self.key, self.generation)
            .await
            .is_none()
        {
            return;
        }
        let remote_job_id = self.target.remote_job_id();

        if let Some(task_id) = self.target.task_id() {
            self.ctx
                .store
                .apply(
                    task_id,
                    TaskEvent::Completed {
                        message: "completed".to_string(),
                    },
                )
                .await;
        }
        if let Some(persistence) = &self.ctx.persistence {
            if let Err(err) = persistence.update_job_progress(remote_job_id, 100.0).await {
                tracing::warn!(poll_key = %self.key, "progress write failed: {}", err);
            }
        }
        self.ctx
            .log
            .info(format!("Remote job {remote_job_id} finished ({})", self.key));
        let key_text = self.key.to_string();
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                task_id: self.target.task_id(),
                remote_task_id: Some(remote_job_id),
                poll_key: Some(key_text.as_str()),
                status: Some("completed"),
                ..ObservabilityEvent::new(COMPONENT, "poller.complete")
            },
        );

        self.retrieve(bearer).await;
    }

    async fn retrieve(&self, bearer: &str) {
        let remote_job_id = self.target.remote_job_id();
        let Some(persistence) = &self.ctx.persistence else {
            self.ctx.log.warn(format!(
                "No persistence attached, skipping result retrieval for {remote_job_id}"
            ));
            return;
        };
        let results = match self.ctx.api.fetch_retrievable_results(bearer).await {
            Ok(results) => results,
            Err(err) => {
                self.ctx
                    .log
                    .warn(format!("Fetching results for {remote_job_id} failed: {err}"));
                return;
            }
        };
        match persistence
            .save_results_and_download(&results, remote_job_id)
            .await
        {
            Ok(()) => self
                .ctx
                .log
                .info(format!("Saved results for remote job {remote_job_id}")),
            Err(err) => self
                .ctx
                .log
                .warn(format!("Saving results for {remote_job_id} failed: {err}")),
        }
    }

    async fn stop(&self, reason: &str) {
        if self
            .ctx
            .pollers
            .finish_if_match(&self.key, self.generation)
            .await
            .is_some()
        {
            self.ctx
                .log
                .info(format!("Stopped polling {}: {}", self.key, reason));
        }
    }

    async fn give_up(&self, limit: u32) {
        if self
            .ctx
            .pollers
            .finish_if_match(&self.key, self.generation)
            .await
            .is_none()
        {
            return;
        }
        let message = format!("polling gave up after {limit} consecutive errors");
        if let Some(task_id) = self.target.task_id() {
            self.ctx
                .store
                .apply(
                    task_id,
                    TaskEvent::Failed {
                        message: message.clone(),
                    },
                )
                .await;
        }
        self.ctx.log.error(format!("{}: {}", self.key, message));
    }
}
