//! Import of release files from a Subversion location.
//!
//! The import runs as a worker task, never inline. Inside a fresh revision
//! scope it exports the SVN location into a temporary directory within the
//! interim tree, then moves the exported entries into the requested target
//! subdirectory. The scope's all-or-nothing guarantee covers the whole
//! import: a failed export leaves the release untouched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Component, Path};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::Task;
use crate::revision::RevisionManager;
use crate::worker::{CheckRecorder, TaskHandler};

const EXPORT_TIMEOUT: Duration = Duration::from_secs(600);

/// Arguments carried by an `svn_import_files` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvnImportArgs {
    pub svn_url: String,
    /// SVN revision to export; `HEAD` when absent.
    #[serde(default)]
    pub revision: Option<String>,
    /// Subdirectory of the release tree to import into; the root when absent.
    #[serde(default)]
    pub target_subdirectory: Option<String>,
}

/// Reject target subdirectories that would escape the release tree.
pub fn validate_target_subdirectory(target: &str) -> Result<()> {
    let path = Path::new(target);
    if path.is_absolute() {
        return Err(AppError::validation(format!(
            "target subdirectory '{target}' must be relative"
        )));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(AppError::validation(format!(
            "target subdirectory '{target}' must not contain '..'"
        )));
    }
    Ok(())
}

/// Worker handler for SVN imports.
pub struct SvnImportHandler {
    manager: RevisionManager,
}

impl SvnImportHandler {
    pub fn new(manager: RevisionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl TaskHandler for SvnImportHandler {
    async fn run(&self, task: &Task, _recorder: Option<&CheckRecorder>) -> Result<Option<Value>> {
        let args: SvnImportArgs = serde_json::from_value(task.task_args.clone())
            .map_err(|e| AppError::Import(format!("invalid import arguments: {e}")))?;
        if let Some(target) = args.target_subdirectory.as_deref() {
            validate_target_subdirectory(target)?;
        }

        let description = format!("Imported files from {}", args.svn_url);
        let revision = self
            .manager
            .revise(
                &task.project_name,
                &task.version_name,
                &task.created_by,
                &description,
                |ctx| {
                    let args = args.clone();
                    let interim = ctx.interim_path().clone();
                    async move {
                        let destination = match args.target_subdirectory.as_deref() {
                            Some(target) => interim.join(target),
                            None => interim.clone(),
                        };
                        tokio::fs::create_dir_all(&destination).await?;

                        // Export into a hidden temp dir first so a partial
                        // export never mixes with real content.
                        let export_dir = interim.join(format!(".svn-export-{}", Uuid::new_v4()));
                        svn_export(
                            &args.svn_url,
                            args.revision.as_deref(),
                            export_dir.as_path(),
                        )
                        .await?;

                        let mut entries = tokio::fs::read_dir(&export_dir).await?;
                        while let Some(entry) = entries.next_entry().await? {
                            let target = destination.join(entry.file_name());
                            tokio::fs::rename(entry.path(), &target).await.map_err(|e| {
                                AppError::io_error(
                                    format!("cannot move exported entry: {e}"),
                                    Some(target),
                                )
                            })?;
                        }
                        tokio::fs::remove_dir(&export_dir).await?;
                        Ok(())
                    }
                },
            )
            .await?;

        info!(
            release = %revision.release_name,
            number = revision.number,
            url = %args.svn_url,
            "SVN import committed"
        );
        Ok(Some(json!({ "revision_number": revision.number })))
    }
}

async fn svn_export(url: &str, revision: Option<&str>, destination: &Path) -> Result<()> {
    let mut command = Command::new("svn");
    command.arg("export").arg("--non-interactive");
    if let Some(revision) = revision {
        command.arg("-r").arg(revision);
    }
    command
        .arg("--")
        .arg(url)
        .arg(destination)
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let output = tokio::time::timeout(EXPORT_TIMEOUT, command.output())
        .await
        .map_err(|_| {
            AppError::Timeout(format!(
                "svn export of {url} exceeded {}s",
                EXPORT_TIMEOUT.as_secs()
            ))
        })?
        .map_err(|e| AppError::Import(format!("cannot run svn: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Import(format!(
            "svn export of {url} failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_subdirectory_validation() {
        assert!(validate_target_subdirectory("binaries").is_ok());
        assert!(validate_target_subdirectory("a/b/c").is_ok());
        assert!(validate_target_subdirectory("/absolute").is_err());
        assert!(validate_target_subdirectory("../outside").is_err());
        assert!(validate_target_subdirectory("a/../../b").is_err());
    }

    #[test]
    fn test_args_parse_with_defaults() {
        let args: SvnImportArgs =
            serde_json::from_value(serde_json::json!({"svn_url": "https://svn.example.org/repo"}))
                .unwrap();
        assert_eq!(args.svn_url, "https://svn.example.org/repo");
        assert!(args.revision.is_none());
        assert!(args.target_subdirectory.is_none());
    }

    use crate::db::Db;
    use crate::models::{NewTask, ReleasePhase, TaskStatus, TaskType};
    use crate::worker::Worker;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn manager() -> (TempDir, RevisionManager) {
        let tmp = TempDir::new().unwrap();
        let settings = crate::config::Settings::rooted_at(tmp.path());
        let db = Db::in_memory().await.unwrap();
        db.create_release("apple", "1.0", ReleasePhase::Draft)
            .await
            .unwrap();
        (tmp, RevisionManager::new(db, settings.roots()))
    }

    fn import_args(target: Option<&str>) -> SvnImportArgs {
        SvnImportArgs {
            svn_url: "https://svn.example.org/dist/apple".to_string(),
            revision: Some("42".to_string()),
            target_subdirectory: target.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_import_enqueue_to_claim() {
        let (_tmp, mgr) = manager().await;
        let task = mgr
            .import_svn("apple", "1.0", "alice", import_args(Some("binaries")))
            .await
            .unwrap();

        assert_eq!(task.task_type, TaskType::SvnImportFiles);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.revision_number, None);
        let round_trip: SvnImportArgs = serde_json::from_value(task.task_args.clone()).unwrap();
        assert_eq!(round_trip.svn_url, "https://svn.example.org/dist/apple");
        assert_eq!(round_trip.target_subdirectory.as_deref(), Some("binaries"));

        let claimed = mgr.db().claim_next_task().await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);
        assert_eq!(claimed.status, TaskStatus::Active);
    }

    #[tokio::test]
    async fn test_import_enqueue_rejects_escaping_target() {
        let (_tmp, mgr) = manager().await;
        let err = mgr
            .import_svn("apple", "1.0", "alice", import_args(Some("../outside")))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(mgr.db().claim_next_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_import_enqueue_unknown_release() {
        let (_tmp, mgr) = manager().await;
        let err = mgr
            .import_svn("pear", "2.0", "alice", import_args(None))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_handler_dispatch_rejects_malformed_args() {
        let (_tmp, mgr) = manager().await;
        let db = mgr.db().clone();
        let task = db
            .enqueue_task(NewTask {
                task_type: TaskType::SvnImportFiles,
                task_args: serde_json::json!({"not_a_url": true}),
                project_name: "apple".to_string(),
                version_name: "1.0".to_string(),
                revision_number: None,
                primary_rel_path: None,
                created_by: "alice".to_string(),
            })
            .await
            .unwrap();

        let mut worker = Worker::new(db.clone());
        worker.register(
            TaskType::SvnImportFiles,
            Arc::new(SvnImportHandler::new(mgr.clone())),
        );
        worker.run_pending().await.unwrap();

        let finished = db.task(task.id).await.unwrap().unwrap();
        assert_eq!(finished.status, TaskStatus::Failed);
        assert!(finished
            .error
            .unwrap()
            .contains("invalid import arguments"));
    }
}
