//! relforge: revision management core for a release distribution platform.
//!
//! Projects prepare software releases as directories of artifacts and
//! metadata. Every mutation of a release's file tree goes through a
//! revision scope: an immutable, numbered snapshot is built in a hidden
//! interim directory (hard-linked from the previous snapshot), mutated,
//! and atomically promoted on success or discarded entirely on failure.
//!
//! Around that core sit the collaborators a deployment needs: a sqlite
//! record of releases, revisions, tasks and check results ([`db`]); a
//! background worker claiming queued tasks ([`worker`]); archive checks
//! ([`checks`]) and SVN imports ([`svn`]) running as those tasks;
//! read-only reconciliation of the record against the filesystem
//! ([`consistency`]); and administrative deletion with degraded-success
//! reporting ([`deletion`]).

pub mod checks;
pub mod config;
pub mod consistency;
pub mod db;
pub mod deletion;
pub mod error;
pub mod models;
pub mod paths;
pub mod queue;
pub mod report;
pub mod revision;
pub mod store;
pub mod svn;
pub mod worker;

pub use error::{AppError, Result};

/// Install a global tracing subscriber honoring `RUST_LOG`. Safe to call
/// more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
