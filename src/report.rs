//! Per-path aggregation of check results for a release's latest revision.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::db::Db;
use crate::error::Result;
use crate::models::{CheckOutcome, CheckResult, Release};
use crate::paths;

/// Classification and check outcomes for the files of one revision.
#[derive(Debug, Default)]
pub struct PathInfo {
    pub artifacts: BTreeSet<PathBuf>,
    pub metadata: BTreeSet<PathBuf>,
    pub successes: BTreeMap<PathBuf, Vec<CheckResult>>,
    pub warnings: BTreeMap<PathBuf, Vec<CheckResult>>,
    pub errors: BTreeMap<PathBuf, Vec<CheckResult>>,
}

/// Classify `rel_paths` and attach the latest revision's check results to
/// them. Returns `None` for a release with no committed revision yet.
pub async fn path_info(
    db: &Db,
    release: &Release,
    rel_paths: &[PathBuf],
) -> Result<Option<PathInfo>> {
    let Some(revision_number) = release.latest_revision_number else {
        return Ok(None);
    };

    let mut info = PathInfo::default();
    for path in rel_paths {
        if paths::is_artifact(path) {
            info.artifacts.insert(path.clone());
        } else if paths::is_metadata(path) {
            info.metadata.insert(path.clone());
        }
    }

    let known: BTreeSet<&Path> = rel_paths.iter().map(PathBuf::as_path).collect();
    for result in db.check_results(&release.name, revision_number, None).await? {
        let path = PathBuf::from(&result.primary_rel_path);
        if !known.contains(path.as_path()) {
            continue;
        }
        let bucket = match result.status {
            CheckOutcome::Success => &mut info.successes,
            CheckOutcome::Warning => &mut info.warnings,
            CheckOutcome::Failure => &mut info.errors,
        };
        bucket.entry(path).or_default().push(result);
    }

    Ok(Some(info))
}

/// Whether the release's latest revision has any FAILURE check results.
/// A release with no revisions has none.
pub async fn has_failing_checks(db: &Db, release: &Release) -> Result<bool> {
    match release.latest_revision_number {
        Some(revision_number) => Ok(db
            .failing_check_count(&release.name, revision_number)
            .await?
            > 0),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReleasePhase, Revision};
    use chrono::Utc;
    use serde_json::json;

    async fn seeded() -> (Db, Release) {
        let db = Db::in_memory().await.unwrap();
        let release = db
            .create_release("apple", "1.0", ReleasePhase::Draft)
            .await
            .unwrap();
        db.insert_revision_and_advance(
            &Revision {
                release_name: release.name.clone(),
                number: 1,
                description: "seed".to_string(),
                created_by: "tester".to_string(),
                created: Utc::now(),
            },
            None,
        )
        .await
        .unwrap();
        let release = db.release("apple", "1.0").await.unwrap().unwrap();
        (db, release)
    }

    #[tokio::test]
    async fn test_no_revision_yields_none() {
        let db = Db::in_memory().await.unwrap();
        let release = db
            .create_release("apple", "1.0", ReleasePhase::Draft)
            .await
            .unwrap();
        let info = path_info(&db, &release, &[PathBuf::from("apple-1.0.tar.gz")])
            .await
            .unwrap();
        assert!(info.is_none());
        assert!(!has_failing_checks(&db, &release).await.unwrap());
    }

    #[tokio::test]
    async fn test_classification_and_buckets() {
        let (db, release) = seeded().await;
        db.insert_check_result(
            &release.name,
            1,
            "targz_integrity",
            "apple-1.0.tar.gz",
            CheckOutcome::Success,
            "ok",
            &json!({}),
        )
        .await
        .unwrap();
        db.insert_check_result(
            &release.name,
            1,
            "targz_structure",
            "apple-1.0.tar.gz",
            CheckOutcome::Warning,
            "root mismatch",
            &json!({}),
        )
        .await
        .unwrap();

        let rel_paths = vec![
            PathBuf::from("apple-1.0.tar.gz"),
            PathBuf::from("apple-1.0.tar.gz.sha256"),
            PathBuf::from("README.txt"),
        ];
        let info = path_info(&db, &release, &rel_paths).await.unwrap().unwrap();

        assert!(info.artifacts.contains(Path::new("apple-1.0.tar.gz")));
        assert!(info.metadata.contains(Path::new("apple-1.0.tar.gz.sha256")));
        assert!(!info.artifacts.contains(Path::new("README.txt")));

        let artifact = PathBuf::from("apple-1.0.tar.gz");
        assert_eq!(info.successes.get(&artifact).unwrap().len(), 1);
        assert_eq!(info.warnings.get(&artifact).unwrap().len(), 1);
        assert!(info.errors.is_empty());
    }

    #[tokio::test]
    async fn test_results_for_unknown_paths_are_dropped() {
        let (db, release) = seeded().await;
        db.insert_check_result(
            &release.name,
            1,
            "targz_integrity",
            "vanished.tar.gz",
            CheckOutcome::Failure,
            "gone",
            &json!({}),
        )
        .await
        .unwrap();

        let info = path_info(&db, &release, &[PathBuf::from("apple-1.0.tar.gz")])
            .await
            .unwrap()
            .unwrap();
        assert!(info.errors.is_empty());
        // The failure still counts against the release as a whole.
        assert!(has_failing_checks(&db, &release).await.unwrap());
    }
}
