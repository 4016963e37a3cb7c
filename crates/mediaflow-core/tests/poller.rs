mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use mediaflow_core::context::OrchestratorContext;
use mediaflow_core::{
    CredentialResolver, EventLog, PendingPoller, PollKey, PollTarget, PollerRegistry, RoleBook,
    StartOutcome, StreamRegistry, TaskMirror, TaskStore,
};
use mediaflow_types::{Task, TaskDraft, TaskStatus};
use support::fakes::{test_config, wait_for, FakeApi, FakeCredentials, FakePersistence};

struct Rig {
    ctx: OrchestratorContext,
    poller: PendingPoller,
    api: Arc<FakeApi>,
    persistence: Arc<FakePersistence>,
    _dir: tempfile::TempDir,
}

fn rig(credentials: Arc<FakeCredentials>) -> Rig {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(test_config(dir.path()));
    let api = FakeApi::new();
    let persistence = FakePersistence::new(false);
    let ctx = OrchestratorContext {
        store: TaskStore::new(TaskMirror::Memory, config.task_list_cap),
        log: EventLog::new(config.log_capacity),
        api: api.clone(),
        persistence: Some(persistence.clone()),
        credentials: CredentialResolver::new(Some(credentials), None),
        pollers: PollerRegistry::new(),
        streams: StreamRegistry::new(),
        roles: RoleBook::new(),
        config,
    };
    Rig {
        poller: PendingPoller::new(ctx.clone()),
        ctx,
        api,
        persistence,
        _dir: dir,
    }
}

/// A running task that was submitted but never had its credential pinned.
async fn unpinned_task(rig: &Rig, remote_task_id: &str) -> Task {
    let mut task = Task::new(TaskDraft::new("sora2-landscape-10s", "tide pools"));
    task.status = TaskStatus::Running;
    task.remote_task_id = Some(remote_task_id.to_string());
    rig.ctx.store.add(task).await
}

#[tokio::test]
async fn missing_pin_is_recovered_through_the_remote_job() {
    let credentials = FakeCredentials::empty();
    credentials.add(12, "bearer-12");
    credentials.link_remote("task_remote_9", 12);
    let rig = rig(credentials);
    let task = unpinned_task(&rig, "task_remote_9").await;

    let outcome = rig
        .poller
        .start(PollTarget::Local {
            task_id: task.id.clone(),
            remote_job_id: "task_remote_9".to_string(),
        })
        .await;
    assert_eq!(outcome, StartOutcome::Started);

    let done = wait_for(|| async {
        rig.ctx
            .store
            .get(&task.id)
            .await
            .map(|t| t.status == TaskStatus::Done)
            .unwrap_or(false)
    })
    .await;
    assert!(done, "task never completed");
    assert!(wait_for(|| async { rig.api.fetches() == 1 }).await);

    let task = rig.ctx.store.get(&task.id).await.expect("task");
    assert_eq!(task.token_id_for_pending, Some(12));
    assert_eq!(task.progress, 100.0);
    assert_eq!(
        *rig.api.polled_bearers.lock().unwrap(),
        vec!["bearer-12".to_string()]
    );
    assert_eq!(
        *rig.persistence.saved_results.lock().unwrap(),
        vec!["task_remote_9".to_string()]
    );
    assert!(rig.ctx.pollers.is_empty().await);
}

#[tokio::test]
async fn unresolvable_credential_skips_ticks_and_keeps_polling() {
    let rig = rig(FakeCredentials::single());
    let task = unpinned_task(&rig, "task_unlinked").await;

    rig.poller
        .start(PollTarget::Local {
            task_id: task.id.clone(),
            remote_job_id: "task_unlinked".to_string(),
        })
        .await;

    // Several intervals pass without a usable bearer.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(rig.ctx.pollers.contains(&PollKey::Task(task.id.clone())).await);
    assert_eq!(rig.api.poll_calls.load(Ordering::SeqCst), 0);
    assert_eq!(rig.api.fetches(), 0);

    let task = rig.ctx.store.get(&task.id).await.expect("task");
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.token_id_for_pending, None);
    assert!(rig
        .ctx
        .log
        .recent()
        .iter()
        .any(|entry| entry.message.contains("Skipping poll")));

    rig.ctx.pollers.stop_all().await;
    assert!(rig.ctx.pollers.is_empty().await);
}
