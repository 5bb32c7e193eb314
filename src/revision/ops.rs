//! Mutations available inside a revision scope.
//!
//! Each operation works against the interim tree only. The scope's
//! all-or-nothing guarantee means none of these need their own rollback
//! logic: returning an error discards the whole interim.

use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::RevisionContext;
use crate::error::{AppError, Result};
use crate::models::{NewTask, Task, TaskType};
use crate::paths;
use crate::queue::PollOutcome;
use crate::store::{self, HashAlgorithm};

/// Result of an SBOM generation request inside a scope.
#[derive(Debug)]
pub enum SbomOutcome {
    /// The task completed and the sidecar exists in the interim tree.
    Generated(Task),
    /// The poll budget ran out; the task will finish against this revision
    /// after the scope commits.
    Pending(Task),
}

impl RevisionContext {
    /// Delete one file from the tree being built.
    ///
    /// When the target is an artifact its metadata siblings (any file in the
    /// same directory named `<target>.<anything>`) are deleted with it.
    /// Returns the number of siblings removed. A missing target is an error:
    /// the interim was linked from the latest revision, so absence means the
    /// caller's view of the release is stale.
    pub async fn delete_file(&self, rel_path: &str) -> Result<u64> {
        let target = self.resolve(rel_path)?;
        if !target.is_file() {
            return Err(AppError::not_found(format!(
                "file '{rel_path}' is not present in revision {} of {}",
                self.number, self.release.name
            )));
        }

        tokio::fs::remove_file(&target).await.map_err(|e| {
            AppError::io_error(format!("cannot delete file: {e}"), Some(target.clone()))
        })?;

        let mut siblings_removed = 0u64;
        if paths::is_artifact(Path::new(rel_path)) {
            let file_name = target
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| AppError::validation(format!("invalid path '{rel_path}'")))?
                .to_string();
            let prefix = format!("{file_name}.");
            let parent = target
                .parent()
                .ok_or_else(|| AppError::validation(format!("invalid path '{rel_path}'")))?;

            let mut entries = tokio::fs::read_dir(parent).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with(&prefix) && entry.file_type().await?.is_file() {
                    tokio::fs::remove_file(entry.path()).await?;
                    siblings_removed += 1;
                }
            }
        }

        info!(
            release = %self.release.name,
            number = self.number,
            path = %rel_path,
            siblings_removed,
            "Deleted file from revision"
        );
        Ok(siblings_removed)
    }

    /// Write a hash sidecar (`<rel_path>.sha256` or `.sha512`) next to the
    /// file. An existing sidecar is a conflict and is left untouched.
    pub async fn generate_hash(
        &self,
        rel_path: &str,
        algorithm: HashAlgorithm,
    ) -> Result<String> {
        let source = self.resolve(rel_path)?;
        if !source.is_file() {
            return Err(AppError::not_found(format!(
                "file '{rel_path}' is not present in revision {} of {}",
                self.number, self.release.name
            )));
        }

        let sidecar_rel = format!("{rel_path}.{}", algorithm.extension());
        let sidecar = self.interim.join(&sidecar_rel);
        if sidecar.exists() {
            return Err(AppError::conflict(format!(
                "hash file '{sidecar_rel}' already exists"
            )));
        }

        let digest = store::stream_hash(&source, algorithm).await?;
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AppError::validation(format!("invalid path '{rel_path}'")))?;
        tokio::fs::write(&sidecar, store::sidecar_line(&digest, file_name))
            .await
            .map_err(|e| {
                AppError::io_error(format!("cannot write hash file: {e}"), Some(sidecar.clone()))
            })?;

        debug!(
            release = %self.release.name,
            path = %sidecar_rel,
            "Wrote hash sidecar"
        );
        Ok(sidecar_rel)
    }

    /// Enqueue CycloneDX SBOM generation for a `.tar.gz` artifact and wait,
    /// within the poll budget, for the worker to finish it.
    ///
    /// The task is bound to this scope's (not yet committed) revision
    /// number and receives absolute interim paths, so a worker running
    /// during the poll writes the sidecar into the tree being built. The
    /// interim paths go stale once the scope commits; a worker claiming
    /// the task after that resolves the artifact through
    /// [`crate::checks::task_artifact_path`], which falls back to the
    /// release's visible directory. Running out of poll budget is not a
    /// failure; a failed task is.
    pub async fn generate_sbom(&self, rel_path: &str) -> Result<SbomOutcome> {
        if !(rel_path.ends_with(".tar.gz") || rel_path.ends_with(".tgz")) {
            return Err(AppError::validation(format!(
                "SBOM generation requires a .tar.gz or .tgz artifact, got '{rel_path}'"
            )));
        }
        let source = self.resolve(rel_path)?;
        if !source.is_file() {
            return Err(AppError::not_found(format!(
                "file '{rel_path}' is not present in revision {} of {}",
                self.number, self.release.name
            )));
        }

        let sidecar_rel = format!("{rel_path}.cdx.json");
        if self.interim.join(&sidecar_rel).exists() {
            return Err(AppError::conflict(format!(
                "SBOM file '{sidecar_rel}' already exists"
            )));
        }

        let task = self
            .queue
            .enqueue(NewTask {
                task_type: TaskType::SbomGenerateCycloneDx,
                task_args: json!({
                    "artifact_path": source,
                    "output_path": self.interim.join(&sidecar_rel),
                }),
                project_name: self.release.project_name.clone(),
                version_name: self.release.version_name.clone(),
                revision_number: Some(self.number),
                primary_rel_path: Some(rel_path.to_string()),
                created_by: self.created_by.clone(),
            })
            .await?;

        match self.queue.poll_until_terminal(task.id).await? {
            PollOutcome::Settled(task) => {
                if task.status == crate::models::TaskStatus::Failed {
                    return Err(AppError::Task(format!(
                        "SBOM generation failed: {}",
                        task.error.as_deref().unwrap_or("unknown error")
                    )));
                }
                Ok(SbomOutcome::Generated(task))
            }
            PollOutcome::StillPending(task) => {
                info!(
                    task_id = task.id,
                    path = %rel_path,
                    "SBOM generation still pending at end of poll budget"
                );
                Ok(SbomOutcome::Pending(task))
            }
        }
    }

    /// Resolve a caller-supplied relative path inside the interim tree,
    /// rejecting anything that would escape it.
    fn resolve(&self, rel_path: &str) -> Result<PathBuf> {
        let relative = Path::new(rel_path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(AppError::validation(format!(
                "path '{rel_path}' must be relative and stay inside the release"
            )));
        }
        Ok(self.interim.join(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::models::ReleasePhase;
    use crate::revision::RevisionManager;
    use tempfile::TempDir;

    async fn manager_with_artifact() -> (TempDir, RevisionManager) {
        let tmp = TempDir::new().unwrap();
        let settings = crate::config::Settings::rooted_at(tmp.path());
        let db = Db::in_memory().await.unwrap();
        db.create_release("apple", "1.0", ReleasePhase::Draft)
            .await
            .unwrap();
        let mgr = RevisionManager::new(db, settings.roots());
        mgr.revise("apple", "1.0", "tester", "seed", |ctx| {
            let dir = ctx.interim_path().clone();
            async move {
                tokio::fs::write(dir.join("apple-1.0.tar.gz"), b"archive").await?;
                tokio::fs::write(dir.join("apple-1.0.tar.gz.asc"), b"sig").await?;
                tokio::fs::write(dir.join("apple-1.0.tar.gz.sha512"), b"digest").await?;
                tokio::fs::write(dir.join("NOTICE.txt"), b"notice").await?;
                Ok(())
            }
        })
        .await
        .unwrap();
        (tmp, mgr)
    }

    #[tokio::test]
    async fn test_delete_artifact_takes_metadata_siblings() {
        let (_tmp, mgr) = manager_with_artifact().await;
        mgr.revise("apple", "1.0", "tester", "drop artifact", |ctx| async move {
            let removed = ctx.delete_file("apple-1.0.tar.gz").await?;
            assert_eq!(removed, 2);
            Ok(())
        })
        .await
        .unwrap();

        let release = mgr.db().release("apple", "1.0").await.unwrap().unwrap();
        let dir = mgr.roots().release_dir(&release);
        assert!(!dir.join("apple-1.0.tar.gz").exists());
        assert!(!dir.join("apple-1.0.tar.gz.asc").exists());
        assert!(!dir.join("apple-1.0.tar.gz.sha512").exists());
        assert!(dir.join("NOTICE.txt").is_file());
    }

    #[tokio::test]
    async fn test_delete_plain_file_leaves_others() {
        let (_tmp, mgr) = manager_with_artifact().await;
        mgr.revise("apple", "1.0", "tester", "drop notice", |ctx| async move {
            let removed = ctx.delete_file("NOTICE.txt").await?;
            assert_eq!(removed, 0);
            Ok(())
        })
        .await
        .unwrap();

        let release = mgr.db().release("apple", "1.0").await.unwrap().unwrap();
        let dir = mgr.roots().release_dir(&release);
        assert!(dir.join("apple-1.0.tar.gz").is_file());
        assert!(dir.join("apple-1.0.tar.gz.asc").is_file());
    }

    #[tokio::test]
    async fn test_delete_missing_file_aborts_scope() {
        let (_tmp, mgr) = manager_with_artifact().await;
        let err = mgr
            .revise("apple", "1.0", "tester", "bad delete", |ctx| async move {
                ctx.delete_file("absent.tar.gz").await?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let release = mgr.db().release("apple", "1.0").await.unwrap().unwrap();
        assert_eq!(release.latest_revision_number, Some(1));
    }

    #[tokio::test]
    async fn test_generate_hash_and_conflict_guard() {
        let (_tmp, mgr) = manager_with_artifact().await;
        mgr.revise("apple", "1.0", "tester", "hash", |ctx| async move {
            let rel = ctx
                .generate_hash("apple-1.0.tar.gz", HashAlgorithm::Sha256)
                .await?;
            assert_eq!(rel, "apple-1.0.tar.gz.sha256");
            Ok(())
        })
        .await
        .unwrap();

        let release = mgr.db().release("apple", "1.0").await.unwrap().unwrap();
        let sidecar = mgr
            .roots()
            .release_dir(&release)
            .join("apple-1.0.tar.gz.sha256");
        let content = std::fs::read_to_string(&sidecar).unwrap();
        assert!(content.ends_with("  apple-1.0.tar.gz\n"));
        assert_eq!(content.split_whitespace().next().unwrap().len(), 64);

        // A second run must refuse to overwrite the sidecar.
        let err = mgr
            .revise("apple", "1.0", "tester", "hash again", |ctx| async move {
                ctx.generate_hash("apple-1.0.tar.gz", HashAlgorithm::Sha256)
                    .await?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(std::fs::read_to_string(&sidecar).unwrap(), content);
    }

    #[tokio::test]
    async fn test_sbom_rejects_non_targz() {
        let (_tmp, mgr) = manager_with_artifact().await;
        let err = mgr
            .revise("apple", "1.0", "tester", "sbom", |ctx| async move {
                ctx.generate_sbom("NOTICE.txt").await?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_path_escape_is_rejected() {
        let (_tmp, mgr) = manager_with_artifact().await;
        let err = mgr
            .revise("apple", "1.0", "tester", "escape", |ctx| async move {
                ctx.delete_file("../outside.txt").await?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
