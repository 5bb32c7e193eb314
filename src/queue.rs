//! Coordination layer between revision scopes and the background worker.
//!
//! Callers enqueue tasks and then poll at a fixed interval with a bounded
//! attempt budget. Exhausting the budget is not an error: the task stays
//! queued or active and the caller reports it as still pending. Transient
//! read errors during a poll are treated the same way, since the next
//! attempt may succeed.

use std::time::Duration;
use tracing::{debug, warn};

use crate::db::Db;
use crate::error::Result;
use crate::models::{NewTask, Task};

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const POLL_MAX_ATTEMPTS: u32 = 60;

/// Result of a bounded poll.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// The task reached the awaited condition within the attempt budget.
    Settled(Task),
    /// The budget ran out first; the task is in its last observed state.
    StillPending(Task),
}

impl PollOutcome {
    pub fn task(&self) -> &Task {
        match self {
            PollOutcome::Settled(task) | PollOutcome::StillPending(task) => task,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, PollOutcome::Settled(_))
    }
}

/// Enqueue and poll tasks against the relational store.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    db: Db,
    poll_interval: Duration,
    poll_max_attempts: u32,
}

impl TaskQueue {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            poll_interval: POLL_INTERVAL,
            poll_max_attempts: POLL_MAX_ATTEMPTS,
        }
    }

    /// Override the poll cadence. Tests use short budgets so exhausting
    /// them does not take wall-clock seconds.
    pub fn with_polling(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.poll_interval = interval;
        self.poll_max_attempts = max_attempts;
        self
    }

    /// Insert a task with status QUEUED.
    pub async fn enqueue(&self, new: NewTask) -> Result<Task> {
        self.db.enqueue_task(new).await
    }

    /// Poll until the task leaves QUEUED, i.e. a worker has picked it up.
    pub async fn poll_until_started(&self, task_id: i64) -> Result<PollOutcome> {
        self.poll(task_id, |task| {
            task.status != crate::models::TaskStatus::Queued
        })
        .await
    }

    /// Poll until the task reaches COMPLETED or FAILED.
    pub async fn poll_until_terminal(&self, task_id: i64) -> Result<PollOutcome> {
        self.poll(task_id, |task| task.status.is_terminal()).await
    }

    async fn poll<F>(&self, task_id: i64, condition: F) -> Result<PollOutcome>
    where
        F: Fn(&Task) -> bool,
    {
        let mut last_seen: Option<Task> = None;

        for attempt in 0..self.poll_max_attempts {
            match self.db.task(task_id).await {
                Ok(Some(task)) => {
                    if condition(&task) {
                        debug!(task_id, attempt, status = %task.status, "Poll settled");
                        return Ok(PollOutcome::Settled(task));
                    }
                    last_seen = Some(task);
                }
                Ok(None) => {
                    return Err(crate::error::AppError::not_found(format!(
                        "task {task_id} not found"
                    )));
                }
                Err(e) => {
                    // A transient read failure does not abandon the poll.
                    warn!(task_id, attempt, error = %e, "Poll read failed, retrying");
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        // Budget exhausted. Fetch once more for the freshest state.
        let task = match last_seen {
            Some(task) => task,
            None => self
                .db
                .task(task_id)
                .await?
                .ok_or_else(|| {
                    crate::error::AppError::not_found(format!("task {task_id} not found"))
                })?,
        };
        debug!(task_id, status = %task.status, "Poll budget exhausted");
        Ok(PollOutcome::StillPending(task))
    }

    /// Count tasks in QUEUED or ACTIVE for a release revision; `None` means
    /// the release's current latest revision.
    pub async fn tasks_ongoing(
        &self,
        project_name: &str,
        version_name: &str,
        revision_number: Option<i64>,
    ) -> Result<i64> {
        self.db
            .tasks_ongoing(project_name, version_name, revision_number)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReleasePhase, TaskStatus, TaskType};
    use serde_json::json;

    async fn queue_with_task() -> (TaskQueue, Db, Task) {
        let db = Db::in_memory().await.unwrap();
        let release = db
            .create_release("apple", "1.0", ReleasePhase::Draft)
            .await
            .unwrap();
        let task = db
            .enqueue_task(NewTask {
                task_type: TaskType::TargzIntegrity,
                task_args: json!({}),
                project_name: release.project_name.clone(),
                version_name: release.version_name.clone(),
                revision_number: Some(1),
                primary_rel_path: Some("apple-1.0.tar.gz".to_string()),
                created_by: "tester".to_string(),
            })
            .await
            .unwrap();
        (TaskQueue::new(db.clone()), db, task)
    }

    #[tokio::test]
    async fn test_poll_settles_when_task_finishes() {
        let (queue, db, task) = queue_with_task().await;

        let finisher = {
            let db = db.clone();
            let id = task.id;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                db.claim_next_task().await.unwrap();
                db.finish_task(id, TaskStatus::Completed, None, None)
                    .await
                    .unwrap();
            })
        };

        let outcome = queue.poll_until_terminal(task.id).await.unwrap();
        finisher.await.unwrap();
        assert!(outcome.is_settled());
        assert_eq!(outcome.task().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_poll_budget_exhausted_reports_pending() {
        let (queue, _db, task) = queue_with_task().await;
        let queue = queue.with_polling(Duration::from_millis(5), 3);

        // Nothing ever claims the task; the shortened budget runs out and
        // the poller reports the task in its last observed state.
        let outcome = queue.poll_until_terminal(task.id).await.unwrap();
        assert!(!outcome.is_settled());
        assert_eq!(outcome.task().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_poll_until_started_sees_active() {
        let (queue, db, task) = queue_with_task().await;
        db.claim_next_task().await.unwrap();

        let outcome = queue.poll_until_started(task.id).await.unwrap();
        assert!(outcome.is_settled());
        assert_eq!(outcome.task().status, TaskStatus::Active);
    }

    #[tokio::test]
    async fn test_poll_missing_task_is_not_found() {
        let (queue, _db, _task) = queue_with_task().await;
        let err = queue.poll_until_terminal(9999).await.unwrap_err();
        assert!(matches!(err, crate::error::AppError::NotFound(_)));
    }
}
