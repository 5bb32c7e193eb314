//! Read-only reconciliation of the relational record against the
//! filesystem roots.
//!
//! Each release row implies one directory (`unfinished/<project>/<version>`
//! or `finished/...` by phase); each two-level directory under the roots
//! implies one release. The checker pairs the two sets by exact string
//! match and reports what is left over on either side. It never repairs
//! anything.

use std::collections::BTreeSet;
use std::fmt::Write;
use std::path::Path;
use tracing::{info, warn};

use crate::db::Db;
use crate::error::{AppError, Result};
use crate::paths::ReleaseRoots;

/// Outcome of one consistency pass.
#[derive(Debug, Clone, Default)]
pub struct ConsistencyReport {
    /// Directories the database expects but the filesystem lacks.
    pub database_only: Vec<String>,
    /// Directories present on disk with no corresponding release row.
    pub filesystem_only: Vec<String>,
    /// Directories accounted for on both sides.
    pub paired: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.database_only.is_empty() && self.filesystem_only.is_empty()
    }

    /// Render the report as plain text for operators.
    pub fn render(&self) -> String {
        let mut out = String::new();

        if !self.is_consistent() {
            out.push_str("=== Broken ===\n\n");
            if !self.database_only.is_empty() {
                out.push_str("Database only:\n");
                for dir in &self.database_only {
                    let _ = writeln!(out, "  {dir}");
                }
                out.push('\n');
            }
            if !self.filesystem_only.is_empty() {
                out.push_str("Filesystem only:\n");
                for dir in &self.filesystem_only {
                    let _ = writeln!(out, "  {dir}");
                }
                out.push('\n');
            }
        }

        out.push_str("=== Okay ===\n\nPaired correctly:\n");
        for dir in &self.paired {
            let _ = writeln!(out, "  {dir}");
        }
        out
    }
}

/// Compare release rows against the directory trees under both roots.
///
/// Duplicate directories derived from the database are fatal: two rows
/// claiming the same directory cannot be reconciled automatically.
pub async fn check(db: &Db, roots: &ReleaseRoots) -> Result<ConsistencyReport> {
    let mut database_dirs: Vec<String> = Vec::new();
    for release in db.releases().await? {
        let label = if release.phase.is_finished() {
            "finished"
        } else {
            "unfinished"
        };
        database_dirs.push(format!(
            "{label}/{}/{}",
            release.project_name, release.version_name
        ));
    }

    let mut seen = BTreeSet::new();
    for dir in &database_dirs {
        if !seen.insert(dir.clone()) {
            return Err(AppError::consistency(format!(
                "duplicate release directory in database: {dir}"
            )));
        }
    }

    let mut filesystem_dirs: BTreeSet<String> = BTreeSet::new();
    collect_release_dirs(&roots.unfinished, "unfinished", &mut filesystem_dirs).await?;
    collect_release_dirs(&roots.finished, "finished", &mut filesystem_dirs).await?;

    // Greedy one-to-one pairing by exact string equality. Directory counts
    // are small enough that set lookups dominate anyway.
    let mut report = ConsistencyReport::default();
    for dir in database_dirs {
        if filesystem_dirs.remove(&dir) {
            report.paired.push(dir);
        } else {
            report.database_only.push(dir);
        }
    }
    report.filesystem_only = filesystem_dirs.into_iter().collect();
    report.database_only.sort();
    report.paired.sort();

    if report.is_consistent() {
        info!(paired = report.paired.len(), "Consistency check passed");
    } else {
        warn!(
            database_only = report.database_only.len(),
            filesystem_only = report.filesystem_only.len(),
            "Consistency check found mismatches"
        );
    }
    Ok(report)
}

/// Walk exactly two directory levels under `root`, skipping dot-prefixed
/// entries (interim trees mid-promotion) and stray files.
async fn collect_release_dirs(
    root: &Path,
    label: &str,
    out: &mut BTreeSet<String>,
) -> Result<()> {
    let mut projects = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(AppError::io_error(
                format!("cannot read root: {e}"),
                Some(root.to_path_buf()),
            ))
        }
    };

    while let Some(project) = projects.next_entry().await? {
        let project_name = project.file_name();
        let Some(project_name) = project_name.to_str() else {
            continue;
        };
        if project_name.starts_with('.') || !project.file_type().await?.is_dir() {
            continue;
        }

        let mut versions = tokio::fs::read_dir(project.path()).await?;
        while let Some(version) = versions.next_entry().await? {
            let version_name = version.file_name();
            let Some(version_name) = version_name.to_str() else {
                continue;
            };
            if version_name.starts_with('.') || !version.file_type().await?.is_dir() {
                continue;
            }
            out.insert(format!("{label}/{project_name}/{version_name}"));
        }
    }
    Ok(())
}
