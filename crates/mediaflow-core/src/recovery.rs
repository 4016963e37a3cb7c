use mediaflow_orchestrator::TaskEvent;
use serde::Serialize;

use crate::context::OrchestratorContext;
use crate::poller::{PendingPoller, PollTarget, StartOutcome};
use crate::registry::PollKey;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub resumed_local: Vec<String>,
    pub resumed_orphans: Vec<String>,
    pub skipped: usize,
}

/// Resumes polling for remote jobs that persistence still lists as
/// incomplete, after a restart.
#[derive(Clone)]
pub struct OrphanRecovery {
    ctx: OrchestratorContext,
    poller: PendingPoller,
}

impl OrphanRecovery {
    pub fn new(ctx: OrchestratorContext, poller: PendingPoller) -> Self {
        Self { ctx, poller }
    }

    pub async fn recover(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let Some(persistence) = &self.ctx.persistence else {
            return report;
        };
        let jobs = match persistence.get_incomplete_remote_jobs().await {
            Ok(jobs) => jobs,
            Err(err) => {
                self.ctx
                    .log
                    .warn(format!("Loading incomplete remote jobs failed: {err}"));
                return report;
            }
        };

        for job in jobs {
            let (Some(remote_job_id), Some(credential_id)) =
                (job.remote_job_id.filter(|id| !id.is_empty()), job.credential_id)
            else {
                tracing::warn!("skipping incomplete job record without ids");
                report.skipped += 1;
                continue;
            };

            if self.ctx.pollers.covers_remote(&remote_job_id).await
                || self
                    .ctx
                    .pollers
                    .contains(&PollKey::Remote(remote_job_id.clone()))
                    .await
            {
                report.skipped += 1;
                continue;
            }

            let target = match self.ctx.store.find_by_remote(&remote_job_id).await {
                Some(task) if task.is_terminal() => {
                    tracing::debug!(
                        task_id = %task.id,
                        remote_job_id = %remote_job_id,
                        "stale incomplete record for finished task"
                    );
                    report.skipped += 1;
                    continue;
                }
                Some(task) => {
                    if self
                        .ctx
                        .pollers
                        .contains(&PollKey::Task(task.id.clone()))
                        .await
                    {
                        report.skipped += 1;
                        continue;
                    }
                    if task.token_id_for_pending.is_none() {
                        self.ctx
                            .store
                            .apply(&task.id, TaskEvent::CredentialPinned { credential_id })
                            .await;
                    }
                    PollTarget::Local {
                        task_id: task.id,
                        remote_job_id,
                    }
                }
                None => PollTarget::Orphan {
                    remote_job_id,
                    credential_id: Some(credential_id),
                },
            };

            let label = target.key().to_string();
            let local = matches!(target, PollTarget::Local { .. });
            match self.poller.start(target).await {
                StartOutcome::Started if local => report.resumed_local.push(label),
                StartOutcome::Started => report.resumed_orphans.push(label),
                StartOutcome::AlreadyActive | StartOutcome::NoCredentialMechanism => {
                    report.skipped += 1
                }
            }
        }

        if !report.resumed_local.is_empty() || !report.resumed_orphans.is_empty() {
            self.ctx.log.info(format!(
                "Recovered {} task poller(s) and {} orphan poller(s)",
                report.resumed_local.len(),
                report.resumed_orphans.len()
            ));
        }
        report
    }
}
