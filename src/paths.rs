//! Release directory layout and path classification.
//!
//! Two parallel root trees, each organized as `root/<project>/<version>/`
//! holding the current revision's files directly. Entries whose name starts
//! with `.` are interim artifacts mid-promotion and are never part of the
//! visible tree.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{AppError, Result};
use crate::models::{Release, ReleasePhase};

/// Extensions that mark a file as a distributable artifact.
const ARTIFACT_SUFFIXES: &[&str] = &[".tar.gz", ".tgz", ".zip", ".tar.bz2"];

/// Extensions that mark a file as metadata attached to an artifact.
const METADATA_SUFFIXES: &[&str] = &[
    ".asc",
    ".sha256",
    ".sha512",
    ".md5",
    ".sha1",
    ".cdx.json",
];

/// The on-disk roots a deployment works against.
#[derive(Debug, Clone)]
pub struct ReleaseRoots {
    pub unfinished: PathBuf,
    pub finished: PathBuf,
    pub downloads: PathBuf,
}

impl ReleaseRoots {
    /// Canonical directory for a release, chosen by phase.
    pub fn release_dir(&self, release: &Release) -> PathBuf {
        self.phase_dir(&release.project_name, &release.version_name, release.phase)
    }

    /// Canonical directory for a (project, version) pair in a given phase.
    pub fn phase_dir(&self, project_name: &str, version_name: &str, phase: ReleasePhase) -> PathBuf {
        let root = if phase.is_finished() {
            &self.finished
        } else {
            &self.unfinished
        };
        root.join(project_name).join(version_name)
    }
}

/// Whether the path names a distributable artifact.
pub fn is_artifact(path: &Path) -> bool {
    has_any_suffix(path, ARTIFACT_SUFFIXES)
}

/// Whether the path names artifact metadata (signature, digest, SBOM).
pub fn is_metadata(path: &Path) -> bool {
    has_any_suffix(path, METADATA_SUFFIXES)
}

fn has_any_suffix(path: &Path, suffixes: &[&str]) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    suffixes.iter().any(|s| name.ends_with(s))
}

/// List every regular file under `base`, as sorted paths relative to `base`.
///
/// The walk runs on a blocking thread; an absent `base` yields an empty list.
pub async fn paths_recursive(base: &Path) -> Result<Vec<PathBuf>> {
    let base = base.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if !base.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in WalkDir::new(&base).follow_links(false) {
            let entry = entry.map_err(|e| {
                AppError::io_error(
                    format!("failed to walk {}: {e}", base.display()),
                    Some(base.clone()),
                )
            })?;
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&base) {
                    paths.push(rel.to_path_buf());
                }
            }
        }
        paths.sort();
        Ok(paths)
    })
    .await
    .map_err(|e| AppError::io_error(format!("path walk task panicked: {e}"), None))?
}
