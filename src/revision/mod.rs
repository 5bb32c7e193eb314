//! Revision manager: all-or-nothing mutation of release file trees.
//!
//! Every mutation runs inside a scope. The scope materializes the current
//! latest tree into a hidden interim directory by hard links, hands the
//! interim to the caller's closure, and on success commits: the revision
//! row and latest pointer advance in one database transaction, then the
//! interim is promoted over the visible tree by rename. If the closure
//! returns an error the interim is removed and nothing else changes.
//!
//! A per-release async mutex serializes the whole read-latest, build,
//! commit sequence, so two concurrent scopes on the same release cannot
//! race each other to the same revision number.

mod ops;

pub use ops::SbomOutcome;

use dashmap::DashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{AppError, Result};
use crate::models::{release_name, NewTask, Release, Revision, Task, TaskType};
use crate::paths::ReleaseRoots;
use crate::queue::TaskQueue;
use crate::store;
use crate::svn::{self, SvnImportArgs};

/// Handle given to a mutation closure: the interim tree plus the identity
/// of the revision being built.
pub struct RevisionContext {
    release: Release,
    interim: PathBuf,
    number: i64,
    created_by: String,
    queue: TaskQueue,
}

impl RevisionContext {
    /// Absolute path of the interim tree being mutated.
    pub fn interim_path(&self) -> &PathBuf {
        &self.interim
    }

    /// The number this revision will carry once committed.
    pub fn number(&self) -> i64 {
        self.number
    }

    pub fn release(&self) -> &Release {
        &self.release
    }
}

/// Coordinates revision scopes for all releases.
#[derive(Clone)]
pub struct RevisionManager {
    db: Db,
    roots: ReleaseRoots,
    queue: TaskQueue,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl RevisionManager {
    pub fn new(db: Db, roots: ReleaseRoots) -> Self {
        let queue = TaskQueue::new(db.clone());
        Self {
            db,
            roots,
            queue,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Override the queue's poll cadence for scopes created by this
    /// manager. Tests use short budgets.
    pub fn with_polling(mut self, interval: std::time::Duration, max_attempts: u32) -> Self {
        self.queue = self.queue.with_polling(interval, max_attempts);
        self
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn roots(&self) -> &ReleaseRoots {
        &self.roots
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Run one all-or-nothing mutation of a release's file tree.
    ///
    /// The closure receives a [`RevisionContext`] whose interim directory
    /// starts as a hard-linked image of the current latest revision (empty
    /// for a release with no revisions yet). If the closure succeeds the
    /// revision is committed and returned; if it fails the interim is
    /// removed and the error is passed through unchanged.
    pub async fn revise<F, Fut>(
        &self,
        project_name: &str,
        version_name: &str,
        created_by: &str,
        description: &str,
        mutate: F,
    ) -> Result<Revision>
    where
        F: FnOnce(RevisionContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let name = release_name(project_name, version_name);
        let lock = self
            .locks
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let release = self
            .db
            .release(project_name, version_name)
            .await?
            .ok_or_else(|| AppError::not_found(format!("release '{name}' not found")))?;
        if release.phase.is_finished() {
            return Err(AppError::conflict(format!(
                "release {name} is in phase {} and can no longer be revised",
                release.phase
            )));
        }

        let parent = release.latest_revision_number;
        let number = parent.unwrap_or(0) + 1;

        let visible = self.roots.release_dir(&release);
        // Interim and aside names start with a dot so directory walks of the
        // project never see trees mid-promotion.
        let project_dir = self.roots.unfinished.join(&release.project_name);
        let interim = project_dir.join(format!(
            ".{}.interim-{}",
            release.version_name,
            Uuid::new_v4()
        ));

        store::link_tree(&visible, &interim).await?;

        let context = RevisionContext {
            release: release.clone(),
            interim: interim.clone(),
            number,
            created_by: created_by.to_string(),
            queue: self.queue.clone(),
        };

        if let Err(e) = mutate(context).await {
            if let Err(cleanup) = store::remove_tree(&interim).await {
                warn!(
                    interim = %interim.display(),
                    error = %cleanup,
                    "Failed to remove interim tree after aborted mutation"
                );
            }
            info!(release = %name, number, "Mutation aborted, revision discarded");
            return Err(e);
        }

        let revision = Revision {
            release_name: name.clone(),
            number,
            description: description.to_string(),
            created_by: created_by.to_string(),
            created: chrono::Utc::now(),
        };

        // Record first, promote second. If the record fails the visible
        // tree was never touched; only the interim needs removing.
        if let Err(e) = self.db.insert_revision_and_advance(&revision, parent).await {
            if let Err(cleanup) = store::remove_tree(&interim).await {
                warn!(
                    interim = %interim.display(),
                    error = %cleanup,
                    "Failed to remove interim tree after record failure"
                );
            }
            return Err(e);
        }

        self.promote(&visible, &interim, &project_dir, &release.version_name)
            .await?;

        info!(
            release = %name,
            number,
            created_by = %created_by,
            "Committed revision"
        );
        Ok(revision)
    }

    /// Enqueue an SVN import for a release.
    ///
    /// Unlike the scope operations, nothing is polled inline and the task
    /// is not bound to a revision number: the worker's import handler
    /// opens its own revision scope when it runs. Arguments are validated
    /// here so an impossible import is rejected at enqueue time rather
    /// than as a failed task.
    pub async fn import_svn(
        &self,
        project_name: &str,
        version_name: &str,
        created_by: &str,
        args: SvnImportArgs,
    ) -> Result<Task> {
        let name = release_name(project_name, version_name);
        let release = self
            .db
            .release(project_name, version_name)
            .await?
            .ok_or_else(|| AppError::not_found(format!("release '{name}' not found")))?;
        if release.phase.is_finished() {
            return Err(AppError::conflict(format!(
                "release {name} is in phase {} and can no longer be revised",
                release.phase
            )));
        }
        if let Some(target) = args.target_subdirectory.as_deref() {
            svn::validate_target_subdirectory(target)?;
        }

        self.queue
            .enqueue(NewTask {
                task_type: TaskType::SvnImportFiles,
                task_args: serde_json::to_value(&args)?,
                project_name: release.project_name,
                version_name: release.version_name,
                revision_number: None,
                primary_rel_path: None,
                created_by: created_by.to_string(),
            })
            .await
    }

    /// Commit an empty mutation, producing a new revision identical in
    /// content to its parent (or an empty tree for the first revision).
    pub async fn fresh(
        &self,
        project_name: &str,
        version_name: &str,
        created_by: &str,
        description: &str,
    ) -> Result<Revision> {
        self.revise(project_name, version_name, created_by, description, |_| async {
            Ok(())
        })
        .await
    }

    async fn promote(
        &self,
        visible: &PathBuf,
        interim: &PathBuf,
        project_dir: &PathBuf,
        version_name: &str,
    ) -> Result<()> {
        let aside = project_dir.join(format!(".{}.prev-{}", version_name, Uuid::new_v4()));
        let had_current = tokio::fs::metadata(visible).await.is_ok();

        if had_current {
            tokio::fs::rename(visible, &aside).await.map_err(|e| {
                AppError::io_error(
                    format!("cannot set aside current tree: {e}"),
                    Some(visible.clone()),
                )
            })?;
        }

        match tokio::fs::rename(interim, visible).await {
            Ok(()) => {
                if had_current {
                    if let Err(e) = store::remove_tree(&aside).await {
                        warn!(
                            aside = %aside.display(),
                            error = %e,
                            "Failed to remove superseded tree"
                        );
                    }
                }
                Ok(())
            }
            Err(e) => {
                if had_current {
                    if let Err(restore) = tokio::fs::rename(&aside, visible).await {
                        warn!(
                            aside = %aside.display(),
                            error = %restore,
                            "Failed to restore previous tree after promote failure"
                        );
                    }
                }
                Err(AppError::io_error(
                    format!("cannot promote interim tree: {e}"),
                    Some(interim.clone()),
                ))
            }
        }
    }
}
