//! Settings for the directory roots and database location.
//!
//! Layered like the rest of the stack expects: built-in defaults, then an
//! optional `relforge.toml`, then `RELFORGE_`-prefixed environment
//! variables. Tests construct `Settings` directly against a temp dir.

use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{AppError, Result};
use crate::paths::ReleaseRoots;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Base directory for all mutable state.
    pub state_dir: PathBuf,
    /// Root for drafts, candidates and previews in progress.
    pub unfinished_dir: PathBuf,
    /// Root for published releases.
    pub finished_dir: PathBuf,
    /// Public downloads mirror populated by hard links.
    pub downloads_dir: PathBuf,
    /// sqlx connection string for the sqlite database.
    pub database_url: String,
}

impl Settings {
    /// Load settings from defaults, `relforge.toml` if present, and the
    /// `RELFORGE_` environment.
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .set_default("state_dir", "./state")?
            .set_default("unfinished_dir", "./state/unfinished")?
            .set_default("finished_dir", "./state/finished")?
            .set_default("downloads_dir", "./state/downloads")?
            .set_default("database_url", "sqlite://./state/relforge.db")?
            .add_source(config::File::with_name("relforge").required(false))
            .add_source(config::Environment::with_prefix("RELFORGE"));

        builder
            .build()
            .map_err(|e| AppError::validation(format!("configuration error: {e}")))?
            .try_deserialize()
            .map_err(|e| AppError::validation(format!("configuration error: {e}")))
    }

    /// Settings rooted under a single directory, used by tests and tooling.
    pub fn rooted_at(base: &std::path::Path) -> Self {
        Settings {
            state_dir: base.to_path_buf(),
            unfinished_dir: base.join("unfinished"),
            finished_dir: base.join("finished"),
            downloads_dir: base.join("downloads"),
            database_url: "sqlite::memory:".to_string(),
        }
    }

    pub fn roots(&self) -> ReleaseRoots {
        ReleaseRoots {
            unfinished: self.unfinished_dir.clone(),
            finished: self.finished_dir.clone(),
            downloads: self.downloads_dir.clone(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Validation(format!("configuration error: {error}"))
    }
}
