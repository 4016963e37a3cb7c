mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use mediaflow_core::{Orchestrator, RecoveryReport};
use mediaflow_types::{Task, TaskDraft, TaskStatus};
use support::fakes::{pending, test_config, wait_for, FakeApi, FakeCredentials, FakePersistence};

fn submitted_task(remote_task_id: &str, status: TaskStatus) -> Task {
    let mut task = Task::new(TaskDraft::new("sora2-landscape-15s", "a lighthouse"));
    task.status = status;
    task.remote_task_id = Some(remote_task_id.to_string());
    task
}

fn build(
    persistence: Arc<FakePersistence>,
    credentials: Arc<FakeCredentials>,
) -> (Orchestrator, Arc<FakeApi>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let api = FakeApi::new();
    let orchestrator = Orchestrator::builder(test_config(dir.path()))
        .api(api.clone())
        .persistence(persistence)
        .credentials(credentials)
        .build();
    (orchestrator, api, dir)
}

#[tokio::test]
async fn startup_resumes_local_task_and_orphan() {
    let persistence = FakePersistence::new(true);
    let local = submitted_task("task_remote_1", TaskStatus::Running);
    *persistence.task_list.lock().unwrap() = Some(vec![local.clone()]);
    persistence.add_incomplete(Some("task_remote_1"), Some(7));
    persistence.add_incomplete(Some("task_orphan"), Some(7));
    let (orchestrator, api, _dir) = build(persistence.clone(), FakeCredentials::single());

    let report = orchestrator.startup().await;
    assert_eq!(report.hydrated, Some(1));
    assert_eq!(report.recovery.resumed_local, vec![local.id.clone()]);
    assert_eq!(
        report.recovery.resumed_orphans,
        vec!["remote:task_orphan".to_string()]
    );
    assert_eq!(report.recovery.skipped, 0);

    let done = wait_for(|| async {
        orchestrator
            .get_task(&local.id)
            .await
            .map(|t| t.status == TaskStatus::Done)
            .unwrap_or(false)
    })
    .await;
    assert!(done, "recovered task never completed");

    let task = orchestrator.get_task(&local.id).await.expect("task");
    assert_eq!(task.token_id_for_pending, Some(7));
    assert_eq!(task.progress, 100.0);

    assert!(wait_for(|| async { api.fetches() == 2 }).await);
    assert_eq!(persistence.progress_for("task_orphan"), vec![100.0]);
    assert!(orchestrator.is_idle().await);
}

#[tokio::test]
async fn stale_records_for_finished_tasks_are_skipped() {
    let persistence = FakePersistence::new(true);
    *persistence.task_list.lock().unwrap() =
        Some(vec![submitted_task("task_done", TaskStatus::Done)]);
    persistence.add_incomplete(Some("task_done"), Some(7));
    let (orchestrator, api, _dir) = build(persistence, FakeCredentials::single());

    let report = orchestrator.startup().await;
    assert_eq!(report.recovery.skipped, 1);
    assert!(report.recovery.resumed_local.is_empty());
    assert!(orchestrator.active_pollers().await.is_empty());
    assert_eq!(api.poll_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn records_without_ids_are_skipped() {
    let persistence = FakePersistence::new(false);
    persistence.add_incomplete(None, Some(7));
    persistence.add_incomplete(Some(""), Some(7));
    persistence.add_incomplete(Some("task_a"), None);
    let (orchestrator, _api, _dir) = build(persistence, FakeCredentials::single());

    let report = orchestrator.startup().await;
    assert_eq!(report.recovery.skipped, 3);
    assert!(orchestrator.is_idle().await);
}

#[tokio::test]
async fn duplicate_records_start_one_poller() {
    let persistence = FakePersistence::new(false);
    persistence.add_incomplete(Some("task_dup"), Some(7));
    persistence.add_incomplete(Some("task_dup"), Some(7));
    let (orchestrator, api, _dir) = build(persistence, FakeCredentials::single());
    api.set_pending_default(Ok(pending(0.5)));

    let report = orchestrator.startup().await;
    assert_eq!(report.recovery.resumed_orphans.len(), 1);
    assert_eq!(report.recovery.skipped, 1);
    assert_eq!(orchestrator.active_pollers().await, vec!["remote:task_dup"]);

    orchestrator.shutdown().await;
    assert!(orchestrator.is_idle().await);
}

#[tokio::test]
async fn job_already_polled_by_a_local_task_is_not_duplicated() {
    let persistence = FakePersistence::new(false);
    let (orchestrator, api, _dir) = build(persistence.clone(), FakeCredentials::single());
    api.set_pending_default(Ok(pending(0.5)));

    let task = orchestrator
        .add_task(TaskDraft::new("sora2-portrait-10s", "rain on glass"))
        .await;
    orchestrator.run(&task.id).await.expect("run");
    assert!(orchestrator.has_active_poller(&task.id).await);

    persistence.add_incomplete(Some("task_remote_1"), Some(7));
    let report = orchestrator.startup().await;
    assert_eq!(report.recovery.skipped, 1);
    assert!(report.recovery.resumed_orphans.is_empty());
    assert_eq!(orchestrator.active_pollers().await, vec![task.id.clone()]);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn orphan_without_bearer_stops_without_retrieving() {
    let persistence = FakePersistence::new(false);
    persistence.add_incomplete(Some("task_lost"), Some(99));
    let (orchestrator, api, _dir) = build(persistence.clone(), FakeCredentials::single());

    let report = orchestrator.startup().await;
    assert_eq!(report.recovery.resumed_orphans.len(), 1);

    assert!(wait_for(|| async { orchestrator.is_idle().await }).await);
    assert_eq!(api.poll_calls.load(Ordering::SeqCst), 0);
    assert_eq!(api.fetches(), 0);
    assert!(persistence.progress_for("task_lost").is_empty());
}

#[tokio::test]
async fn recovery_without_persistence_is_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let orchestrator = Orchestrator::builder(test_config(dir.path()))
        .api(FakeApi::new())
        .build();

    let report = orchestrator.startup().await;
    assert_eq!(report.hydrated, None);
    assert_eq!(report.recovery, RecoveryReport::default());
}
