//! Relational entities for the revision management core.
//!
//! These mirror the rows owned by [`crate::db::Db`]: a `Release` is keyed by
//! (project, version) and carries the latest-revision pointer; a `Revision`
//! is one immutable snapshot in that release's strictly increasing sequence;
//! a `Task` is one unit of background work bound to a revision; a
//! `CheckResult` records one verification outcome against one file path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Build the canonical release name from its identifying pair.
pub fn release_name(project_name: &str, version_name: &str) -> String {
    format!("{project_name}-{version_name}")
}

/// Lifecycle stage of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReleasePhase {
    Draft,
    Candidate,
    Preview,
    Release,
    Retired,
}

impl ReleasePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleasePhase::Draft => "DRAFT",
            ReleasePhase::Candidate => "CANDIDATE",
            ReleasePhase::Preview => "PREVIEW",
            ReleasePhase::Release => "RELEASE",
            ReleasePhase::Retired => "RETIRED",
        }
    }

    /// Whether files for this phase live under the finished root.
    pub fn is_finished(&self) -> bool {
        matches!(self, ReleasePhase::Release | ReleasePhase::Retired)
    }
}

impl fmt::Display for ReleasePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReleasePhase {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(ReleasePhase::Draft),
            "CANDIDATE" => Ok(ReleasePhase::Candidate),
            "PREVIEW" => Ok(ReleasePhase::Preview),
            "RELEASE" => Ok(ReleasePhase::Release),
            "RETIRED" => Ok(ReleasePhase::Retired),
            other => Err(AppError::validation(format!("unknown release phase: {other}"))),
        }
    }
}

/// One release of one project, identified by (project, version).
///
/// Invariant: `latest_revision_number` points at exactly one revision at any
/// time, and is `None` only before the first revision is committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub name: String,
    pub project_name: String,
    pub version_name: String,
    pub phase: ReleasePhase,
    pub latest_revision_number: Option<i64>,
    pub created: DateTime<Utc>,
}

/// An immutable, numbered snapshot of a release's file tree.
///
/// Numbers start at 1 and increase by exactly 1 per committed mutation;
/// they are never reused, even after an aborted mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    pub release_name: String,
    pub number: i64,
    pub description: String,
    pub created_by: String,
    pub created: DateTime<Utc>,
}

/// Status of a background task. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Active => "ACTIVE",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(TaskStatus::Queued),
            "ACTIVE" => Ok(TaskStatus::Active),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(AppError::validation(format!("unknown task status: {other}"))),
        }
    }
}

/// Kind of background work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    SbomGenerateCycloneDx,
    SvnImportFiles,
    TargzIntegrity,
    TargzStructure,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SbomGenerateCycloneDx => "sbom_generate_cyclonedx",
            TaskType::SvnImportFiles => "svn_import_files",
            TaskType::TargzIntegrity => "targz_integrity",
            TaskType::TargzStructure => "targz_structure",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sbom_generate_cyclonedx" => Ok(TaskType::SbomGenerateCycloneDx),
            "svn_import_files" => Ok(TaskType::SvnImportFiles),
            "targz_integrity" => Ok(TaskType::TargzIntegrity),
            "targz_structure" => Ok(TaskType::TargzStructure),
            other => Err(AppError::validation(format!("unknown task type: {other}"))),
        }
    }
}

/// One unit of background work, created by a caller mutating a revision and
/// consumed by the worker loop. Rows are never mutated directly by callers
/// after enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub task_type: TaskType,
    pub task_args: serde_json::Value,
    pub status: TaskStatus,
    pub project_name: String,
    pub version_name: String,
    pub revision_number: Option<i64>,
    pub primary_rel_path: Option<String>,
    pub created_by: String,
    pub added: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

/// Fields supplied by callers when enqueuing a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub task_args: serde_json::Value,
    pub project_name: String,
    pub version_name: String,
    pub revision_number: Option<i64>,
    pub primary_rel_path: Option<String>,
    pub created_by: String,
}

/// Outcome of one check against one file path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckOutcome {
    Success,
    Warning,
    Failure,
}

impl CheckOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckOutcome::Success => "SUCCESS",
            CheckOutcome::Warning => "WARNING",
            CheckOutcome::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckOutcome {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(CheckOutcome::Success),
            "WARNING" => Ok(CheckOutcome::Warning),
            "FAILURE" => Ok(CheckOutcome::Failure),
            other => Err(AppError::validation(format!("unknown check outcome: {other}"))),
        }
    }
}

/// Result of one verification against one file in one revision.
///
/// Many results may attach to one path; [`crate::report::path_info`]
/// aggregates them into per-path success/warning/error sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: i64,
    pub release_name: String,
    pub revision_number: i64,
    pub checker: String,
    pub primary_rel_path: String,
    pub status: CheckOutcome,
    pub message: String,
    pub data: serde_json::Value,
    pub created: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_name_format() {
        assert_eq!(release_name("apple", "1.0"), "apple-1.0");
    }

    #[test]
    fn test_phase_round_trip() {
        for phase in [
            ReleasePhase::Draft,
            ReleasePhase::Candidate,
            ReleasePhase::Preview,
            ReleasePhase::Release,
            ReleasePhase::Retired,
        ] {
            assert_eq!(phase.as_str().parse::<ReleasePhase>().unwrap(), phase);
        }
        assert!("SHIPPED".parse::<ReleasePhase>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Active.is_terminal());
    }

    #[test]
    fn test_finished_phases() {
        assert!(ReleasePhase::Release.is_finished());
        assert!(!ReleasePhase::Draft.is_finished());
        assert!(!ReleasePhase::Preview.is_finished());
    }
}
