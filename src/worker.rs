//! Background worker: claims queued tasks and dispatches them to handlers.
//!
//! The claim is a single guarded UPDATE in [`crate::db::Db`], so any number
//! of workers can run against the same database without double-processing.
//! A handler failure marks the task FAILED with the error text; it never
//! takes the loop down. After a bounded number of processed tasks the loop
//! exits so a supervisor can restart the process fresh.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::db::Db;
use crate::error::Result;
use crate::models::{release_name, CheckOutcome, Task, TaskStatus, TaskType};

const IDLE_BACKOFF: Duration = Duration::from_millis(100);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const MAX_TASKS_PER_RUN: u32 = 10;

/// Appends check result rows on behalf of a running handler.
///
/// Bound to one (release, revision, checker, path) tuple so handlers only
/// ever supply the outcome, message and detail payload.
#[derive(Debug, Clone)]
pub struct CheckRecorder {
    db: Db,
    release_name: String,
    revision_number: i64,
    checker: String,
    primary_rel_path: String,
}

impl CheckRecorder {
    pub fn release_name(&self) -> &str {
        &self.release_name
    }

    pub fn revision_number(&self) -> i64 {
        self.revision_number
    }

    pub fn primary_rel_path(&self) -> &str {
        &self.primary_rel_path
    }

    pub async fn success(&self, message: &str, data: Value) -> Result<()> {
        self.record(CheckOutcome::Success, message, data).await
    }

    pub async fn warning(&self, message: &str, data: Value) -> Result<()> {
        self.record(CheckOutcome::Warning, message, data).await
    }

    pub async fn failure(&self, message: &str, data: Value) -> Result<()> {
        self.record(CheckOutcome::Failure, message, data).await
    }

    async fn record(&self, status: CheckOutcome, message: &str, data: Value) -> Result<()> {
        self.db
            .insert_check_result(
                &self.release_name,
                self.revision_number,
                &self.checker,
                &self.primary_rel_path,
                status,
                message,
                &data,
            )
            .await
    }
}

/// One task type's implementation.
///
/// The recorder is `None` for tasks that are not bound to a revision and a
/// primary path (for example an import that creates the revision itself).
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &Task, recorder: Option<&CheckRecorder>) -> Result<Option<Value>>;
}

/// Claims and dispatches tasks against a handler registry.
pub struct Worker {
    db: Db,
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl Worker {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for one task type, replacing any previous one.
    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(task_type, handler);
        self
    }

    /// Claim and process tasks until the queue is empty. Returns the number
    /// of tasks processed. Intended for tests and one-shot draining.
    pub async fn run_pending(&self) -> Result<u32> {
        let mut processed = 0;
        while let Some(task) = self.db.claim_next_task().await? {
            self.process(task).await;
            processed += 1;
        }
        Ok(processed)
    }

    /// The long-running loop: claim, process, back off when idle, and exit
    /// after a bounded number of tasks so the supervisor restarts us.
    pub async fn run(&self) -> Result<()> {
        let mut processed = 0u32;
        info!("Worker loop started");
        loop {
            match self.db.claim_next_task().await {
                Ok(Some(task)) => {
                    self.process(task).await;
                    processed += 1;
                    if processed >= MAX_TASKS_PER_RUN {
                        info!(processed, "Task budget reached, exiting for restart");
                        return Ok(());
                    }
                }
                Ok(None) => {
                    tokio::time::sleep(IDLE_BACKOFF).await;
                }
                Err(e) => {
                    error!(error = %e, "Worker claim failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    async fn process(&self, task: Task) {
        info!(task_id = task.id, task_type = %task.task_type, "Processing task");

        let handler = match self.handlers.get(&task.task_type) {
            Some(handler) => Arc::clone(handler),
            None => {
                let message = format!("no handler registered for {}", task.task_type);
                warn!(task_id = task.id, "{message}");
                self.finish(task.id, TaskStatus::Failed, Some(&message), None)
                    .await;
                return;
            }
        };

        let recorder = self.recorder_for(&task);
        match handler.run(&task, recorder.as_ref()).await {
            Ok(result) => {
                self.finish(task.id, TaskStatus::Completed, None, result.as_ref())
                    .await;
            }
            Err(e) => {
                let message = e.to_string();
                error!(task_id = task.id, error = %message, "Task failed");
                self.finish(task.id, TaskStatus::Failed, Some(&message), None)
                    .await;
            }
        }
    }

    fn recorder_for(&self, task: &Task) -> Option<CheckRecorder> {
        let revision_number = task.revision_number?;
        let primary_rel_path = task.primary_rel_path.clone()?;
        Some(CheckRecorder {
            db: self.db.clone(),
            release_name: release_name(&task.project_name, &task.version_name),
            revision_number,
            checker: task.task_type.as_str().to_string(),
            primary_rel_path,
        })
    }

    async fn finish(
        &self,
        task_id: i64,
        status: TaskStatus,
        error_text: Option<&str>,
        result: Option<&Value>,
    ) {
        // A status write failure leaves the row ACTIVE; the restart
        // supervisor has to handle such orphans, so only log here.
        if let Err(e) = self.db.finish_task(task_id, status, error_text, result).await {
            error!(task_id, error = %e, "Failed to record task status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewTask, ReleasePhase};
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn run(
            &self,
            task: &Task,
            recorder: Option<&CheckRecorder>,
        ) -> Result<Option<Value>> {
            if let Some(recorder) = recorder {
                recorder.success("echoed", json!({})).await?;
            }
            Ok(Some(task.task_args.clone()))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn run(&self, _: &Task, _: Option<&CheckRecorder>) -> Result<Option<Value>> {
            Err(crate::error::AppError::Task("deliberate failure".to_string()))
        }
    }

    async fn setup() -> (Db, Worker) {
        let db = Db::in_memory().await.unwrap();
        db.create_release("apple", "1.0", ReleasePhase::Draft)
            .await
            .unwrap();
        let worker = Worker::new(db.clone());
        (db, worker)
    }

    fn integrity_task(args: Value) -> NewTask {
        NewTask {
            task_type: TaskType::TargzIntegrity,
            task_args: args,
            project_name: "apple".to_string(),
            version_name: "1.0".to_string(),
            revision_number: Some(1),
            primary_rel_path: Some("apple-1.0.tar.gz".to_string()),
            created_by: "tester".to_string(),
        }
    }

    #[tokio::test]
    async fn test_run_pending_completes_and_stores_result() {
        let (db, mut worker) = setup().await;
        worker.register(TaskType::TargzIntegrity, Arc::new(EchoHandler));

        let args = json!({"key": "value"});
        let task = db.enqueue_task(integrity_task(args.clone())).await.unwrap();

        let processed = worker.run_pending().await.unwrap();
        assert_eq!(processed, 1);

        let finished = db.task(task.id).await.unwrap().unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);
        assert_eq!(finished.result, Some(args));

        // The recorder wrote a check row bound to the task's revision.
        let results = db.check_results("apple-1.0", 1, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].checker, "targz_integrity");
        assert_eq!(results[0].status, CheckOutcome::Success);
    }

    #[tokio::test]
    async fn test_handler_error_marks_failed() {
        let (db, mut worker) = setup().await;
        worker.register(TaskType::TargzIntegrity, Arc::new(FailingHandler));

        let task = db.enqueue_task(integrity_task(json!({}))).await.unwrap();
        worker.run_pending().await.unwrap();

        let finished = db.task(task.id).await.unwrap().unwrap();
        assert_eq!(finished.status, TaskStatus::Failed);
        assert!(finished.error.unwrap().contains("deliberate failure"));
    }

    #[tokio::test]
    async fn test_unregistered_type_marks_failed() {
        let (db, worker) = setup().await;
        let task = db.enqueue_task(integrity_task(json!({}))).await.unwrap();

        worker.run_pending().await.unwrap();

        let finished = db.task(task.id).await.unwrap().unwrap();
        assert_eq!(finished.status, TaskStatus::Failed);
        assert!(finished.error.unwrap().contains("no handler registered"));
    }
}
