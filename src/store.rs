//! Content store primitives for release trees.
//!
//! Artifacts live under per-release directories and revisions share file
//! content through hard links. Materializing an interim tree therefore
//! costs one inode link per file, not one copy; a copy is only made when
//! linking fails (typically crossing a filesystem boundary).
//!
//! Hashes are streamed in 8 KiB chunks so arbitrarily large artifacts
//! never occupy memory proportional to their size.

use sha2::{Digest, Sha256, Sha512};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{AppError, Result};

const HASH_CHUNK_SIZE: usize = 8 * 1024;

/// Digest algorithms used for hash sidecar files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// The sidecar extension, without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

/// Stream a file through the given digest, returning the lowercase hex form.
pub async fn stream_hash(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        AppError::io_error(format!("cannot open file for hashing: {e}"), Some(path.to_path_buf()))
    })?;

    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    let digest = match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            format!("{:x}", hasher.finalize())
        }
        HashAlgorithm::Sha512 => {
            let mut hasher = Sha512::new();
            loop {
                let n = file.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            format!("{:x}", hasher.finalize())
        }
    };

    debug!(path = %path.display(), algorithm = ?algorithm, "Hashed file");
    Ok(digest)
}

/// Render the sidecar line for a digest, in checksum-tool format:
/// the hex digest, two spaces, the bare filename, one trailing newline.
pub fn sidecar_line(digest: &str, file_name: &str) -> String {
    format!("{digest}  {file_name}\n")
}

/// Hard-link `source` to `destination`, copying when linking fails.
pub async fn link_or_copy(source: &Path, destination: &Path) -> Result<()> {
    match tokio::fs::hard_link(source, destination).await {
        Ok(()) => Ok(()),
        Err(link_err) => {
            warn!(
                source = %source.display(),
                destination = %destination.display(),
                error = %link_err,
                "Hard link failed, falling back to copy"
            );
            tokio::fs::copy(source, destination).await.map_err(|e| {
                AppError::io_error(format!("copy fallback failed: {e}"), Some(destination.to_path_buf()))
            })?;
            Ok(())
        }
    }
}

/// Materialize `source` into `destination` by hard-linking every file,
/// recreating the directory structure. Returns the number of files linked.
///
/// Runs on the blocking pool; the walk and the links are synchronous
/// syscalls. `destination` is created if absent. An absent `source` yields
/// an empty destination tree with zero links.
pub async fn link_tree(source: &Path, destination: &Path) -> Result<u64> {
    let source = source.to_path_buf();
    let destination = destination.to_path_buf();

    tokio::task::spawn_blocking(move || link_tree_blocking(&source, &destination))
        .await
        .map_err(|e| AppError::Task(format!("link task panicked: {e}")))?
}

fn link_tree_blocking(source: &Path, destination: &Path) -> Result<u64> {
    std::fs::create_dir_all(destination)
        .map_err(|e| AppError::io_error(format!("cannot create directory: {e}"), Some(destination.to_path_buf())))?;

    if !source.is_dir() {
        return Ok(0);
    }

    let mut linked = 0u64;
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| {
            AppError::io_error(format!("walk failed during link: {e}"), Some(source.to_path_buf()))
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| AppError::io_error(format!("path outside tree: {e}"), Some(entry.path().to_path_buf())))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = destination.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| {
                AppError::io_error(format!("cannot create directory: {e}"), Some(target.clone()))
            })?;
        } else if entry.file_type().is_file() {
            if let Err(link_err) = std::fs::hard_link(entry.path(), &target) {
                warn!(
                    source = %entry.path().display(),
                    destination = %target.display(),
                    error = %link_err,
                    "Hard link failed, falling back to copy"
                );
                std::fs::copy(entry.path(), &target).map_err(|e| {
                    AppError::io_error(format!("copy fallback failed: {e}"), Some(target.clone()))
                })?;
            }
            linked += 1;
        }
        // Symlinks and other special entries are not part of release trees.
    }

    debug!(
        source = %source.display(),
        destination = %destination.display(),
        linked,
        "Materialized tree"
    );
    Ok(linked)
}

/// Remove a directory tree on the blocking pool.
pub async fn remove_tree(path: &Path) -> Result<()> {
    let path_buf: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::remove_dir_all(&path_buf)
            .map_err(|e| AppError::io_error(format!("cannot remove tree: {e}"), Some(path_buf.clone())))
    })
    .await
    .map_err(|e| AppError::Task(format!("removal task panicked: {e}")))?
}
