use std::path::Path;

use base64::Engine as _;
use futures::StreamExt;
use mediaflow_observability::{emit_event, ObservabilityEvent, ProcessKind};
use mediaflow_orchestrator::{
    classify_text, events_from_stream_message, ExecutionPath, Orientation, RequestPayload,
    Severity, TaskEvent,
};
use mediaflow_providers::{extract_job_id, StreamFrame};
use mediaflow_types::{LogLevel, Task};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::context::OrchestratorContext;
use crate::error::{OrchestratorError, Result};
use crate::poller::{PendingPoller, PollTarget};
use crate::registry::PollKey;

const COMPONENT: &str = "task_runner";
pub const MANUAL_CANCEL_MESSAGE: &str = "Cancelled manually";
const STREAM_CANCEL_MESSAGE: &str = "Cancelled";

/// Executes tasks end to end. Async jobs return once submitted and handed
/// to a poller; streaming tasks return when the stream ends.
#[derive(Clone)]
pub struct TaskRunner {
    ctx: OrchestratorContext,
    poller: PendingPoller,
}

impl TaskRunner {
    pub fn new(ctx: OrchestratorContext, poller: PendingPoller) -> Self {
        Self { ctx, poller }
    }

    pub async fn run(&self, task_id: &str) -> Result<()> {
        let task = self
            .ctx
            .store
            .get(task_id)
            .await
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        if self.ctx.streams.contains(task_id).await
            || self
                .ctx
                .pollers
                .contains(&PollKey::Task(task_id.to_string()))
                .await
        {
            return Err(OrchestratorError::AlreadyRunning(task_id.to_string()));
        }
        if let Some(remote_task_id) = &task.remote_task_id {
            return Err(OrchestratorError::AlreadySubmitted {
                task_id: task_id.to_string(),
                remote_task_id: remote_task_id.clone(),
            });
        }

        self.ctx.store.apply(task_id, TaskEvent::Started).await;
        self.ctx.log.info(format!("Starting task {task_id}"));
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                task_id: Some(task_id),
                model: Some(task.model.as_str()),
                status: Some("running"),
                ..ObservabilityEvent::new(COMPONENT, "task.start")
            },
        );

        let data_url = match attachment_data_url(&task).await {
            Ok(data_url) => data_url,
            Err(err) => {
                self.fail(task_id, "Read file failed", LogLevel::Error).await;
                tracing::warn!(task_id, "attachment read failed: {}", err);
                return Ok(());
            }
        };
        let roles = self.ctx.roles.list().await;
        let payload = RequestPayload::build(
            &task.model,
            &task.prompt,
            &roles,
            data_url
                .as_deref()
                .map(|url| (url, task.file_name.as_deref())),
        );

        match ExecutionPath::from_model(&task.model, &self.ctx.config.video_model_prefix) {
            ExecutionPath::AsyncJob {
                orientation,
                frame_count,
            } => {
                self.submit_job(task_id, &payload, orientation, frame_count)
                    .await
            }
            ExecutionPath::Streaming => self.run_stream(task_id, &payload).await,
        }
        Ok(())
    }

    /// Aborts an in-flight stream, stops the task's poller and marks the
    /// task failed. Leaves already-terminal tasks untouched.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        // Mark first: a stream registering after this sees a terminal task.
        self.ctx
            .store
            .apply(
                task_id,
                TaskEvent::Cancelled {
                    message: MANUAL_CANCEL_MESSAGE.to_string(),
                },
            )
            .await
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        let stream_cancelled = self.ctx.streams.cancel(task_id).await;
        let poller_stopped = self
            .ctx
            .pollers
            .stop(&PollKey::Task(task_id.to_string()))
            .await
            .is_some();
        self.ctx.log.warn(format!(
            "Task {task_id} cancelled (stream: {stream_cancelled}, poller: {poller_stopped})"
        ));
        Ok(())
    }

    async fn submit_job(
        &self,
        task_id: &str,
        payload: &RequestPayload,
        orientation: Orientation,
        frame_count: u32,
    ) {
        let credential = match self.ctx.credentials.acquire_for_submission().await {
            Ok(credential) => credential,
            Err(reason) => {
                self.fail(task_id, &reason, LogLevel::Error).await;
                return;
            }
        };

        let raw = match self
            .ctx
            .api
            .create_job(
                &credential.bearer,
                &payload.prompt,
                orientation.as_str(),
                frame_count,
            )
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                self.fail_classified(task_id, &err.to_string()).await;
                return;
            }
        };

        let Some(remote_task_id) = extract_job_id(&raw) else {
            let reason = raw
                .get("error")
                .map(|e| match e {
                    Value::String(s) => s.clone(),
                    other => other
                        .get("message")
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| other.to_string()),
                })
                .unwrap_or_else(|| "no task_id returned".to_string());
            self.fail(task_id, &reason, LogLevel::Error).await;
            return;
        };

        let interval = self.ctx.config.poll_interval().as_secs_f64();
        self.ctx
            .store
            .apply(
                task_id,
                TaskEvent::Submitted {
                    remote_task_id: remote_task_id.clone(),
                    credential_id: credential.credential_id,
                    message: format!("submitted, polling pending every {interval}s"),
                },
            )
            .await;
        self.ctx.log.info(format!(
            "Task {task_id} submitted as remote job {remote_task_id}"
        ));

        if let (Some(credential_id), Some(persistence)) =
            (credential.credential_id, &self.ctx.persistence)
        {
            if let Err(err) = persistence
                .record_job_creation(credential_id, &raw, &payload.prompt)
                .await
            {
                self.ctx
                    .log
                    .warn(format!("Recording remote job {remote_task_id} failed: {err}"));
            }
        }

        self.poller
            .start(PollTarget::Local {
                task_id: task_id.to_string(),
                remote_job_id: remote_task_id,
            })
            .await;
    }

    async fn run_stream(&self, task_id: &str, payload: &RequestPayload) {
        let Some(cancel) = self.ctx.streams.register(task_id).await else {
            return;
        };
        let still_active = self
            .ctx
            .store
            .get(task_id)
            .await
            .map(|t| !t.is_terminal())
            .unwrap_or(false);
        if still_active {
            self.follow_stream(task_id, payload, cancel).await;
        }
        self.ctx.streams.finish(task_id).await;
    }

    async fn follow_stream(&self, task_id: &str, payload: &RequestPayload, cancel: CancellationToken) {
        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                self.mark_stream_cancelled(task_id).await;
                return;
            }
            opened = self.ctx.api.stream_completion(None, payload.to_stream_body(), cancel.clone()) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                self.fail_classified(task_id, &err.to_string()).await;
                return;
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.mark_stream_cancelled(task_id).await;
                    return;
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(StreamFrame::Message(msg))) => {
                    let mut current = None;
                    for event in events_from_stream_message(&msg) {
                        current = self.ctx.store.apply(task_id, event).await;
                    }
                    if current.map(|t| t.is_terminal()).unwrap_or(false) {
                        return;
                    }
                }
                Some(Ok(StreamFrame::Done { finish_reason })) if finish_reason == "cancelled" => {
                    self.mark_stream_cancelled(task_id).await;
                    return;
                }
                Some(Ok(StreamFrame::Done { .. })) | None => {
                    self.ctx.store.apply(task_id, TaskEvent::StreamFinished).await;
                    return;
                }
                Some(Err(err)) => {
                    if cancel.is_cancelled() {
                        self.mark_stream_cancelled(task_id).await;
                    } else {
                        self.fail_classified(task_id, &err.to_string()).await;
                    }
                    return;
                }
            }
        }
    }

    async fn mark_stream_cancelled(&self, task_id: &str) {
        let updated = self
            .ctx
            .store
            .apply(
                task_id,
                TaskEvent::Cancelled {
                    message: STREAM_CANCEL_MESSAGE.to_string(),
                },
            )
            .await;
        if updated.is_some() {
            self.ctx.log.warn(format!("Task {task_id} cancelled"));
        }
    }

    async fn fail_classified(&self, task_id: &str, raw: &str) {
        let classified = classify_text(raw);
        let level = match classified.severity {
            Severity::Warning => LogLevel::Warning,
            Severity::Error => LogLevel::Error,
        };
        tracing::debug!(task_id, title = %classified.title, "upstream error: {}", raw);
        self.fail(task_id, &classified.message, level).await;
    }

    async fn fail(&self, task_id: &str, message: &str, level: LogLevel) {
        self.ctx
            .store
            .apply(
                task_id,
                TaskEvent::Failed {
                    message: message.to_string(),
                },
            )
            .await;
        self.ctx.log.push(level, format!("Task {task_id}: {message}"));
        emit_event(
            Level::WARN,
            ProcessKind::Engine,
            ObservabilityEvent {
                task_id: Some(task_id),
                status: Some("failed"),
                detail: Some(message),
                ..ObservabilityEvent::new(COMPONENT, "task.failed")
            },
        );
    }
}

/// The task's attachment as a data URL, reading and encoding a local file
/// when only a path is known.
async fn attachment_data_url(task: &Task) -> std::io::Result<Option<String>> {
    if let Some(data_url) = task.file_data_url.as_ref().filter(|u| !u.is_empty()) {
        return Ok(Some(data_url.clone()));
    }
    let Some(path) = &task.file_path else {
        return Ok(None);
    };
    let bytes = tokio::fs::read(path).await?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(Some(format!("data:{};base64,{}", mime_for(path), encoded)))
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}
