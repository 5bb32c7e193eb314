//! Verification checks for `.tar.gz` artifacts.
//!
//! Two checks ship built in: integrity (every entry of the archive can be
//! read, with totals reported) and structure (the archive unpacks into
//! exactly one root directory whose name matches the artifact filename).
//! A structural mismatch is a WARNING; an archive that cannot be read at
//! all is a FAILURE. Both run as worker tasks and report through the
//! recorder, never by failing the task itself.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::db::Db;
use crate::error::{AppError, Result};
use crate::models::Task;
use crate::paths::ReleaseRoots;
use crate::worker::{CheckRecorder, TaskHandler};

/// Why a root directory could not be determined.
#[derive(Debug)]
pub enum RootDirectoryError {
    /// More than one top-level name appears in the archive.
    MultipleRoots(Vec<String>),
    /// The archive contains no entries.
    Empty,
    /// The archive could not be read as gzipped tar.
    Unreadable(String),
}

/// Totals gathered by reading every entry of an archive.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveSummary {
    pub entry_count: u64,
    pub total_size: u64,
}

/// The root directory name an archive should unpack into, derived from its
/// filename. `None` when the name has no recognized archive suffix.
pub fn expected_root(file_name: &str) -> Option<String> {
    file_name
        .strip_suffix(".tar.gz")
        .or_else(|| file_name.strip_suffix(".tgz"))
        .map(str::to_string)
}

/// Determine the single root directory of a gzipped tar archive.
///
/// AppleDouble entries (basenames starting with `._`) are ignored; they
/// are packaging noise, not content.
pub fn root_directory(path: &Path) -> std::result::Result<String, RootDirectoryError> {
    let file = File::open(path)
        .map_err(|e| RootDirectoryError::Unreadable(format!("cannot open archive: {e}")))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    let mut roots: BTreeSet<String> = BTreeSet::new();
    let entries = archive
        .entries()
        .map_err(|e| RootDirectoryError::Unreadable(format!("cannot read archive: {e}")))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| RootDirectoryError::Unreadable(format!("corrupt entry: {e}")))?;
        let entry_path = entry
            .path()
            .map_err(|e| RootDirectoryError::Unreadable(format!("invalid entry path: {e}")))?;

        let basename = entry_path.file_name().and_then(|n| n.to_str());
        if basename.is_some_and(|n| n.starts_with("._")) {
            continue;
        }
        if let Some(std::path::Component::Normal(first)) = entry_path.components().next() {
            if let Some(first) = first.to_str() {
                roots.insert(first.to_string());
            }
        }
    }

    let mut roots: Vec<String> = roots.into_iter().collect();
    match roots.len() {
        0 => Err(RootDirectoryError::Empty),
        1 => Ok(roots.remove(0)),
        _ => Err(RootDirectoryError::MultipleRoots(roots)),
    }
}

/// Read every entry of a gzipped tar archive, accumulating totals.
pub fn archive_summary(path: &Path) -> Result<ArchiveSummary> {
    let file = File::open(path).map_err(|e| {
        AppError::archive_error(format!("cannot open archive: {e}"), Some(path.to_path_buf()))
    })?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    let mut entry_count = 0u64;
    let mut total_size = 0u64;
    let entries = archive.entries().map_err(|e| {
        AppError::archive_error(format!("cannot read archive: {e}"), Some(path.to_path_buf()))
    })?;
    for entry in entries {
        let mut entry = entry.map_err(|e| {
            AppError::archive_error(format!("corrupt entry: {e}"), Some(path.to_path_buf()))
        })?;
        // Drain the entry so decompression actually verifies the stream.
        let size = std::io::copy(&mut entry, &mut std::io::sink()).map_err(|e| {
            AppError::archive_error(
                format!("cannot read entry data: {e}"),
                Some(path.to_path_buf()),
            )
        })?;
        entry_count += 1;
        total_size += size;
    }

    debug!(
        path = %path.display(),
        entry_count,
        total_size,
        "Read archive"
    );
    Ok(ArchiveSummary {
        entry_count,
        total_size,
    })
}

/// Resolve the absolute path a task should read.
///
/// Tasks enqueued from inside a revision scope carry an absolute
/// `artifact_path` into the interim tree, which is only valid while the
/// scope is open: once the scope commits, the interim is renamed into
/// place and the old path disappears. A task claimed after that falls
/// back to the primary relative path under the release's visible
/// directory, where the committed revision now lives.
pub async fn task_artifact_path(db: &Db, roots: &ReleaseRoots, task: &Task) -> Result<PathBuf> {
    if let Some(path) = task.task_args.get("artifact_path").and_then(Value::as_str) {
        let path = PathBuf::from(path);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(path);
        }
    }
    let release = db
        .release(&task.project_name, &task.version_name)
        .await?
        .ok_or_else(|| {
            AppError::not_found(format!(
                "release '{}-{}' not found",
                task.project_name, task.version_name
            ))
        })?;
    let rel_path = task
        .primary_rel_path
        .as_deref()
        .ok_or_else(|| AppError::Task(format!("task {} has no primary path", task.id)))?;
    Ok(roots.release_dir(&release).join(rel_path))
}

fn recorder_required<'a>(task: &Task, recorder: Option<&'a CheckRecorder>) -> Result<&'a CheckRecorder> {
    recorder.ok_or_else(|| {
        AppError::Task(format!(
            "task {} is missing the revision binding required by checks",
            task.id
        ))
    })
}

/// Reads every archive entry and records totals, or a FAILURE when the
/// archive cannot be read.
pub struct TargzIntegrityHandler {
    db: Db,
    roots: ReleaseRoots,
}

impl TargzIntegrityHandler {
    pub fn new(db: Db, roots: ReleaseRoots) -> Self {
        Self { db, roots }
    }
}

#[async_trait]
impl TaskHandler for TargzIntegrityHandler {
    async fn run(&self, task: &Task, recorder: Option<&CheckRecorder>) -> Result<Option<Value>> {
        let recorder = recorder_required(task, recorder)?;
        let path = task_artifact_path(&self.db, &self.roots, task).await?;

        let summary = tokio::task::spawn_blocking(move || archive_summary(&path))
            .await
            .map_err(|e| AppError::Task(format!("integrity task panicked: {e}")))?;

        match summary {
            Ok(summary) => {
                let data = json!({
                    "entry_count": summary.entry_count,
                    "total_size": summary.total_size,
                });
                recorder.success("archive is readable", data.clone()).await?;
                Ok(Some(data))
            }
            Err(e) => {
                recorder
                    .failure(&format!("archive is not readable: {e}"), json!({}))
                    .await?;
                Ok(None)
            }
        }
    }
}

/// Verifies the single-root-directory convention, recording a WARNING on
/// mismatch or ambiguity and a FAILURE when the archive is unreadable.
pub struct TargzStructureHandler {
    db: Db,
    roots: ReleaseRoots,
}

impl TargzStructureHandler {
    pub fn new(db: Db, roots: ReleaseRoots) -> Self {
        Self { db, roots }
    }
}

#[async_trait]
impl TaskHandler for TargzStructureHandler {
    async fn run(&self, task: &Task, recorder: Option<&CheckRecorder>) -> Result<Option<Value>> {
        let recorder = recorder_required(task, recorder)?;
        let path = task_artifact_path(&self.db, &self.roots, task).await?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| AppError::Task(format!("task {} has an invalid path", task.id)))?;
        let Some(expected) = expected_root(&file_name) else {
            recorder
                .warning(
                    &format!("'{file_name}' is not a .tar.gz or .tgz archive"),
                    json!({}),
                )
                .await?;
            return Ok(None);
        };

        let found = tokio::task::spawn_blocking(move || root_directory(&path))
            .await
            .map_err(|e| AppError::Task(format!("structure task panicked: {e}")))?;

        match found {
            Ok(root) if root == expected => {
                recorder
                    .success(
                        &format!("archive unpacks into '{root}'"),
                        json!({"root": root}),
                    )
                    .await?;
            }
            Ok(root) => {
                recorder
                    .warning(
                        &format!("archive root '{root}' does not match expected '{expected}'"),
                        json!({"root": root, "expected": expected}),
                    )
                    .await?;
            }
            Err(RootDirectoryError::MultipleRoots(roots)) => {
                recorder
                    .warning(
                        "could not determine root directory: multiple top-level names",
                        json!({"roots": roots, "expected": expected}),
                    )
                    .await?;
            }
            Err(RootDirectoryError::Empty) => {
                recorder
                    .warning("archive contains no entries", json!({"expected": expected}))
                    .await?;
            }
            Err(RootDirectoryError::Unreadable(message)) => {
                recorder
                    .failure(&format!("archive is not readable: {message}"), json!({}))
                    .await?;
            }
        }
        Ok(None)
    }
}
