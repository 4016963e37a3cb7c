use crate::TaskEvent;
use mediaflow_types::{Task, TaskStatus};
use serde_json::Value;

/// Progress a running task may report before it is actually done.
const MAX_RUNNING_PROGRESS: f64 = 99.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub task: Task,
    pub changed: bool,
}

/// Applies one event to a task and returns the next state.
///
/// Terminal tasks only react to `Started`. Progress never decreases while a
/// task is running and only reaches 100 together with `done`.
pub fn reduce(task: &Task, event: TaskEvent) -> Reduction {
    let mut next = task.clone();
    let mut changed = false;
    let terminal = task.is_terminal();

    match event {
        TaskEvent::Started => {
            next.status = TaskStatus::Running;
            next.progress = 0.0;
            next.message.clear();
            changed = true;
        }
        _ if terminal => {}
        TaskEvent::Submitted {
            remote_task_id,
            credential_id,
            message,
        } => {
            if next.remote_task_id.is_none() {
                next.remote_task_id = Some(remote_task_id);
            }
            if next.token_id_for_pending.is_none() {
                next.token_id_for_pending = credential_id;
            }
            next.message = message;
            changed = true;
        }
        TaskEvent::CredentialPinned { credential_id } => {
            if next.token_id_for_pending.is_none() {
                next.token_id_for_pending = Some(credential_id);
                changed = true;
            }
        }
        TaskEvent::Progress { percent } => {
            if next.status == TaskStatus::Running && percent.is_finite() {
                let clamped = percent.clamp(0.0, MAX_RUNNING_PROGRESS);
                if clamped > next.progress {
                    next.progress = clamped;
                    changed = true;
                }
            }
        }
        TaskEvent::WatermarkStage {
            stage,
            attempt,
            remote_task_id,
        } => {
            next.wm_stage = stage;
            next.wm_attempt = attempt;
            if next.remote_task_id.is_none() {
                next.remote_task_id = remote_task_id;
            }
            changed = true;
        }
        TaskEvent::StreamResult { url, raw } => {
            next.url = Some(url);
            next.result = Some(raw);
            mark_done(&mut next);
            changed = true;
        }
        TaskEvent::StreamFinished => {
            if next.url.is_some() {
                mark_done(&mut next);
            } else {
                next.status = TaskStatus::Failed;
                next.message = "Finished without URL".to_string();
            }
            changed = true;
        }
        TaskEvent::Completed { message } => {
            mark_done(&mut next);
            next.message = message;
            changed = true;
        }
        TaskEvent::Failed { message } | TaskEvent::Cancelled { message } => {
            next.status = TaskStatus::Failed;
            next.message = message;
            changed = true;
        }
    }

    Reduction {
        task: next,
        changed,
    }
}

fn mark_done(task: &mut Task) {
    task.status = TaskStatus::Done;
    task.progress = 100.0;
}

/// Upstreams report progress either as a fraction or as a percentage.
pub fn normalize_progress(raw: f64) -> f64 {
    if !raw.is_finite() || raw < 0.0 {
        return 0.0;
    }
    if raw <= 1.0 {
        raw * 100.0
    } else {
        raw.min(100.0)
    }
}

/// Translates one decoded SSE message into task events.
pub fn events_from_stream_message(msg: &Value) -> Vec<TaskEvent> {
    if let Some(error) = msg.get("error").filter(|v| !v.is_null()) {
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .or_else(|| error.as_str())
            .unwrap_or("Error")
            .to_string();
        return vec![TaskEvent::Failed { message }];
    }

    let mut events = Vec::new();
    let choice = msg.get("choices").and_then(|v| v.get(0));

    if let Some(progress) = msg.get("progress").and_then(|v| v.as_f64()) {
        if progress > 0.0 {
            events.push(TaskEvent::Progress { percent: progress });
        }
    }

    if let Some(wm) = choice
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("wm"))
        .filter(|v| v.is_object())
    {
        events.push(TaskEvent::WatermarkStage {
            stage: wm.get("stage").and_then(|v| v.as_str()).map(str::to_string),
            attempt: wm
                .get("attempt")
                .and_then(|v| v.as_u64())
                .map(|n| n as u32),
            remote_task_id: wm.get("task_id").and_then(|v| v.as_str()).map(str::to_string),
        });
    }

    if let Some(url) = result_url(msg, choice) {
        events.push(TaskEvent::StreamResult {
            url,
            raw: msg.to_string(),
        });
    }

    events
}

fn result_url(msg: &Value, choice: Option<&Value>) -> Option<String> {
    let candidates = [
        msg.get("url"),
        msg.get("video_url").and_then(|v| v.get("url")),
        msg.get("image_url").and_then(|v| v.get("url")),
        msg.get("output")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("url")),
        choice
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("url")),
    ];
    candidates
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str())
        .find(|s| !s.is_empty())
        .map(str::to_string)
}
