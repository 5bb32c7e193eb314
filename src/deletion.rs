//! Release deletion: relational purge, download unlinking and tree removal.
//!
//! The relational purge is transactional and decides success. Filesystem
//! cleanup afterwards is best effort: a failure there produces a degraded
//! success carrying the error text, distinct from both full success and
//! full failure. Batch deletion isolates per-release failures so one bad
//! release never stops the rest.

use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::db::Db;
use crate::error::{AppError, Result};
use crate::models::ReleasePhase;
use crate::paths::ReleaseRoots;
use crate::store;

/// What one release deletion accomplished.
#[derive(Debug, Clone)]
pub struct DeletionReport {
    pub release_name: String,
    pub tasks_deleted: u64,
    pub check_results_deleted: u64,
    pub revisions_deleted: u64,
    pub downloads_unlinked: u64,
    /// Set when the relational purge succeeded but filesystem cleanup did
    /// not; the release is gone from the record either way.
    pub filesystem_error: Option<String>,
}

impl DeletionReport {
    pub fn is_degraded(&self) -> bool {
        self.filesystem_error.is_some()
    }
}

/// Labeled per-item results of a batch operation.
#[derive(Debug, Default)]
pub struct Outcomes<T> {
    entries: Vec<(String, Result<T>)>,
}

impl<T> Outcomes<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, label: impl Into<String>, outcome: Result<T>) {
        self.entries.push((label.into(), outcome));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn successes(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries
            .iter()
            .filter_map(|(label, outcome)| outcome.as_ref().ok().map(|v| (label.as_str(), v)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &AppError)> {
        self.entries
            .iter()
            .filter_map(|(label, outcome)| outcome.as_ref().err().map(|e| (label.as_str(), e)))
    }

    pub fn success_count(&self) -> usize {
        self.successes().count()
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }
}

/// Deletes releases on behalf of administrative callers.
#[derive(Clone)]
pub struct DeletionOrchestrator {
    db: Db,
    roots: ReleaseRoots,
}

impl DeletionOrchestrator {
    pub fn new(db: Db, roots: ReleaseRoots) -> Self {
        Self { db, roots }
    }

    /// Delete one release by canonical name.
    ///
    /// When `expected_phase` is given, a release in any other phase is
    /// treated as not found; callers listing drafts must not delete a
    /// release that was promoted since the listing. `include_downloads`
    /// additionally removes files in the downloads root that share an
    /// inode with files of this release.
    pub async fn delete_release(
        &self,
        name: &str,
        expected_phase: Option<ReleasePhase>,
        include_downloads: bool,
    ) -> Result<DeletionReport> {
        let release = self
            .db
            .release_by_name(name)
            .await?
            .ok_or_else(|| AppError::not_found(format!("release '{name}' not found")))?;
        if let Some(expected) = expected_phase {
            if release.phase != expected {
                return Err(AppError::not_found(format!(
                    "release '{name}' is not in phase {expected}"
                )));
            }
        }

        let release_dir = self.roots.release_dir(&release);
        let mut filesystem_error = None;

        // The transactional row purge decides success; until it commits,
        // the filesystem stays untouched.
        let purge = self.db.purge_release_rows(&release).await?;

        // Unlink downloads before the source tree disappears; matching is
        // by inode, so this works regardless of how links were named.
        let mut downloads_unlinked = 0;
        if include_downloads {
            match unlink_matching_inodes(&release_dir, &self.roots.downloads).await {
                Ok(count) => downloads_unlinked = count,
                Err(e) => {
                    warn!(release = %name, error = %e, "Downloads unlink failed");
                    filesystem_error = Some(format!("downloads unlink failed: {e}"));
                }
            }
        }

        if tokio::fs::metadata(&release_dir).await.is_ok() {
            if let Err(e) = store::remove_tree(&release_dir).await {
                warn!(release = %name, error = %e, "Release tree removal failed");
                filesystem_error
                    .get_or_insert_with(|| format!("tree removal failed: {e}"));
            }
        }

        let report = DeletionReport {
            release_name: release.name.clone(),
            tasks_deleted: purge.tasks,
            check_results_deleted: purge.check_results,
            revisions_deleted: purge.revisions,
            downloads_unlinked,
            filesystem_error,
        };
        info!(
            release = %name,
            degraded = report.is_degraded(),
            "Deleted release"
        );
        Ok(report)
    }

    /// Delete several releases, isolating failures per item.
    pub async fn delete_releases(
        &self,
        names: &[String],
        expected_phase: Option<ReleasePhase>,
        include_downloads: bool,
    ) -> Outcomes<DeletionReport> {
        let mut outcomes = Outcomes::new();
        for name in names {
            let outcome = self
                .delete_release(name, expected_phase, include_downloads)
                .await;
            outcomes.push(name.clone(), outcome);
        }
        info!(
            total = outcomes.len(),
            succeeded = outcomes.success_count(),
            failed = outcomes.failure_count(),
            "Batch deletion finished"
        );
        outcomes
    }
}

/// Remove every file under `downloads` sharing an inode with a file under
/// `source`. Returns the number of files removed.
async fn unlink_matching_inodes(source: &Path, downloads: &Path) -> Result<u64> {
    let source = source.to_path_buf();
    let downloads = downloads.to_path_buf();
    tokio::task::spawn_blocking(move || unlink_matching_inodes_blocking(&source, &downloads))
        .await
        .map_err(|e| AppError::Task(format!("unlink task panicked: {e}")))?
}

fn unlink_matching_inodes_blocking(source: &Path, downloads: &Path) -> Result<u64> {
    if !source.is_dir() || !downloads.is_dir() {
        return Ok(0);
    }

    let mut inodes: HashSet<(u64, u64)> = HashSet::new();
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| {
            AppError::io_error(format!("walk failed: {e}"), Some(source.to_path_buf()))
        })?;
        if entry.file_type().is_file() {
            let meta = entry.metadata().map_err(|e| {
                AppError::io_error(format!("stat failed: {e}"), Some(entry.path().to_path_buf()))
            })?;
            inodes.insert((meta.dev(), meta.ino()));
        }
    }

    let mut removed = 0u64;
    let mut empty_dirs: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(downloads).follow_links(false) {
        let entry = entry.map_err(|e| {
            AppError::io_error(format!("walk failed: {e}"), Some(downloads.to_path_buf()))
        })?;
        if entry.file_type().is_file() {
            let meta = entry.metadata().map_err(|e| {
                AppError::io_error(format!("stat failed: {e}"), Some(entry.path().to_path_buf()))
            })?;
            if inodes.contains(&(meta.dev(), meta.ino())) {
                std::fs::remove_file(entry.path()).map_err(|e| {
                    AppError::io_error(
                        format!("cannot unlink download: {e}"),
                        Some(entry.path().to_path_buf()),
                    )
                })?;
                removed += 1;
            }
        } else if entry.file_type().is_dir() && entry.path() != downloads {
            empty_dirs.push(entry.path().to_path_buf());
        }
    }

    // Deepest first so nested directories empty out before their parents.
    empty_dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for dir in empty_dirs {
        // Only remove directories the unlinking actually emptied.
        let _ = std::fs::remove_dir(&dir);
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> (tempfile::TempDir, Db, DeletionOrchestrator, ReleaseRoots) {
        let tmp = tempfile::TempDir::new().unwrap();
        let settings = crate::config::Settings::rooted_at(tmp.path());
        let db = Db::in_memory().await.unwrap();
        let roots = settings.roots();
        let orchestrator = DeletionOrchestrator::new(db.clone(), roots.clone());
        (tmp, db, orchestrator, roots)
    }

    async fn seed_release(db: &Db, roots: &ReleaseRoots, project: &str, version: &str) {
        let release = db
            .create_release(project, version, ReleasePhase::Draft)
            .await
            .unwrap();
        let dir = roots.release_dir(&release);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{project}-{version}.tar.gz")), b"bytes").unwrap();
    }

    #[tokio::test]
    async fn test_delete_release_full_success() {
        let (_tmp, db, orchestrator, roots) = fixture().await;
        seed_release(&db, &roots, "apple", "1.0").await;

        let report = orchestrator
            .delete_release("apple-1.0", None, false)
            .await
            .unwrap();
        assert!(!report.is_degraded());
        assert!(db.release_by_name("apple-1.0").await.unwrap().is_none());
        assert!(!roots.unfinished.join("apple/1.0").exists());
    }

    #[tokio::test]
    async fn test_phase_guard_treats_mismatch_as_not_found() {
        let (_tmp, db, orchestrator, roots) = fixture().await;
        seed_release(&db, &roots, "apple", "1.0").await;
        db.set_phase("apple-1.0", ReleasePhase::Candidate)
            .await
            .unwrap();
        std::fs::create_dir_all(&roots.downloads).unwrap();
        std::fs::hard_link(
            roots.unfinished.join("apple/1.0/apple-1.0.tar.gz"),
            roots.downloads.join("apple-1.0.tar.gz"),
        )
        .unwrap();

        let err = orchestrator
            .delete_release("apple-1.0", Some(ReleasePhase::Draft), true)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(db.release_by_name("apple-1.0").await.unwrap().is_some());
        // A refusal on the database side leaves the filesystem untouched,
        // download links included.
        assert!(roots.downloads.join("apple-1.0.tar.gz").exists());
        assert!(roots.unfinished.join("apple/1.0/apple-1.0.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_downloads_unlinked_by_inode() {
        let (_tmp, db, orchestrator, roots) = fixture().await;
        seed_release(&db, &roots, "apple", "1.0").await;

        let artifact = roots.unfinished.join("apple/1.0/apple-1.0.tar.gz");
        std::fs::create_dir_all(roots.downloads.join("apple")).unwrap();
        // A download link with a different name still matches by inode.
        std::fs::hard_link(&artifact, roots.downloads.join("apple/renamed.tar.gz")).unwrap();
        std::fs::write(roots.downloads.join("apple/other.tar.gz"), b"unrelated").unwrap();

        let report = orchestrator
            .delete_release("apple-1.0", None, true)
            .await
            .unwrap();
        assert_eq!(report.downloads_unlinked, 1);
        assert!(!roots.downloads.join("apple/renamed.tar.gz").exists());
        assert!(roots.downloads.join("apple/other.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_filesystem_failure_is_degraded_success() {
        let (_tmp, db, orchestrator, roots) = fixture().await;
        let release = db
            .create_release("apple", "1.0", ReleasePhase::Draft)
            .await
            .unwrap();
        // A plain file where the release directory should be makes the
        // recursive removal fail after the relational purge succeeds.
        std::fs::create_dir_all(roots.unfinished.join("apple")).unwrap();
        std::fs::write(roots.release_dir(&release), b"not a directory").unwrap();

        let report = orchestrator
            .delete_release("apple-1.0", None, false)
            .await
            .unwrap();
        assert!(report.is_degraded());
        assert!(db.release_by_name("apple-1.0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let (_tmp, db, orchestrator, roots) = fixture().await;
        seed_release(&db, &roots, "apple", "1.0").await;
        seed_release(&db, &roots, "pear", "2.0").await;

        let names = vec![
            "apple-1.0".to_string(),
            "missing-9.9".to_string(),
            "pear-2.0".to_string(),
        ];
        let outcomes = orchestrator.delete_releases(&names, None, false).await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes.success_count(), 2);
        assert_eq!(outcomes.failure_count(), 1);
        let (failed_label, failed_error) = outcomes.failures().next().unwrap();
        assert_eq!(failed_label, "missing-9.9");
        assert!(matches!(failed_error, AppError::NotFound(_)));

        assert!(db.release_by_name("apple-1.0").await.unwrap().is_none());
        assert!(db.release_by_name("pear-2.0").await.unwrap().is_none());
    }
}
