//! Relational store for releases, revisions, tasks and check results.
//!
//! Backed by sqlite through sqlx with WAL journaling and a pooled
//! connection. The schema is created idempotently on connect; tests run
//! against `sqlite::memory:`.
//!
//! Ownership rules enforced here: task rows are claimed atomically by the
//! worker (a guarded UPDATE, never a read-then-write), and the
//! multi-table purge for release deletion happens in one transaction.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::models::{
    release_name, CheckOutcome, CheckResult, NewTask, Release, ReleasePhase, Revision, Task,
    TaskStatus,
};

/// Row counts removed by a transactional release purge.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowPurge {
    pub tasks: u64,
    pub check_results: u64,
    pub revisions: u64,
}

/// Handle to the relational record.
#[derive(Debug, Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Open (and create if missing) the database at `url`, apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| AppError::database_error(format!("invalid database url {url}: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // In-memory databases exist per connection, so the pool must not
        // fan out across connections there.
        let max_connections = if url.contains(":memory:") { 1 } else { 10 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.create_schema().await?;
        info!(url = %url, "Opened relational store");
        Ok(db)
    }

    /// Convenience constructor for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS releases (
                name TEXT PRIMARY KEY,
                project_name TEXT NOT NULL,
                version_name TEXT NOT NULL,
                phase TEXT NOT NULL,
                latest_revision_number INTEGER,
                created INTEGER NOT NULL,
                UNIQUE(project_name, version_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS revisions (
                release_name TEXT NOT NULL,
                number INTEGER NOT NULL,
                description TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created INTEGER NOT NULL,
                PRIMARY KEY(release_name, number)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_type TEXT NOT NULL,
                task_args TEXT NOT NULL,
                status TEXT NOT NULL,
                project_name TEXT NOT NULL,
                version_name TEXT NOT NULL,
                revision_number INTEGER,
                primary_rel_path TEXT,
                created_by TEXT NOT NULL,
                added INTEGER NOT NULL,
                started INTEGER,
                completed INTEGER,
                error TEXT,
                result TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS check_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                release_name TEXT NOT NULL,
                revision_number INTEGER NOT NULL,
                checker TEXT NOT NULL,
                primary_rel_path TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT NOT NULL,
                data TEXT NOT NULL,
                created INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // Releases

    /// Insert a new release in the given phase, with no revisions yet.
    pub async fn create_release(
        &self,
        project_name: &str,
        version_name: &str,
        phase: ReleasePhase,
    ) -> Result<Release> {
        let name = release_name(project_name, version_name);
        let created = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO releases (name, project_name, version_name, phase, latest_revision_number, created)
            VALUES (?, ?, ?, ?, NULL, ?)
            "#,
        )
        .bind(&name)
        .bind(project_name)
        .bind(version_name)
        .bind(phase.as_str())
        .bind(created.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                AppError::conflict(format!("release {name} already exists"))
            }
            other => other.into(),
        })?;

        debug!(release = %name, phase = %phase, "Created release");
        Ok(Release {
            name,
            project_name: project_name.to_string(),
            version_name: version_name.to_string(),
            phase,
            latest_revision_number: None,
            created,
        })
    }

    /// Look up a release by its (project, version) pair.
    pub async fn release(&self, project_name: &str, version_name: &str) -> Result<Option<Release>> {
        let row = sqlx::query(
            "SELECT * FROM releases WHERE project_name = ? AND version_name = ?",
        )
        .bind(project_name)
        .bind(version_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| release_from_row(&r)).transpose()
    }

    /// Look up a release by its canonical name.
    pub async fn release_by_name(&self, name: &str) -> Result<Option<Release>> {
        let row = sqlx::query("SELECT * FROM releases WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| release_from_row(&r)).transpose()
    }

    /// All releases, ordered by name.
    pub async fn releases(&self) -> Result<Vec<Release>> {
        let rows = sqlx::query("SELECT * FROM releases ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(release_from_row).collect()
    }

    /// Releases of one project in one phase, most recent first.
    pub async fn releases_by_phase(
        &self,
        project_name: &str,
        phase: ReleasePhase,
    ) -> Result<Vec<Release>> {
        let rows = sqlx::query(
            "SELECT * FROM releases WHERE project_name = ? AND phase = ? ORDER BY created DESC",
        )
        .bind(project_name)
        .bind(phase.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(release_from_row).collect()
    }

    /// Move a release to a new phase.
    pub async fn set_phase(&self, name: &str, phase: ReleasePhase) -> Result<()> {
        let result = sqlx::query("UPDATE releases SET phase = ? WHERE name = ?")
            .bind(phase.as_str())
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("release '{name}' not found")));
        }
        info!(release = %name, phase = %phase, "Release phase updated");
        Ok(())
    }

    // Revisions

    /// The latest revision of a release, if any has been committed.
    pub async fn latest_revision(&self, release_name: &str) -> Result<Option<Revision>> {
        let row = sqlx::query(
            r#"
            SELECT r.* FROM revisions r
            JOIN releases rel ON rel.name = r.release_name
                AND rel.latest_revision_number = r.number
            WHERE r.release_name = ?
            "#,
        )
        .bind(release_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| revision_from_row(&r)).transpose()
    }

    /// All revisions of a release in sequence order.
    pub async fn revisions(&self, release_name: &str) -> Result<Vec<Revision>> {
        let rows = sqlx::query("SELECT * FROM revisions WHERE release_name = ? ORDER BY number")
            .bind(release_name)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(revision_from_row).collect()
    }

    /// Atomically record a committed revision and advance the latest pointer.
    ///
    /// The update is guarded on `expected_parent` so a stale writer fails
    /// with a conflict instead of silently overtaking a newer revision.
    pub async fn insert_revision_and_advance(
        &self,
        revision: &Revision,
        expected_parent: Option<i64>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO revisions (release_name, number, description, created_by, created)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&revision.release_name)
        .bind(revision.number)
        .bind(&revision.description)
        .bind(&revision.created_by)
        .bind(revision.created.timestamp())
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            r#"
            UPDATE releases SET latest_revision_number = ?
            WHERE name = ? AND latest_revision_number IS ?
            "#,
        )
        .bind(revision.number)
        .bind(&revision.release_name)
        .bind(expected_parent)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            // Another writer advanced the release while this revision was
            // being built; roll everything back.
            tx.rollback().await?;
            return Err(AppError::conflict(format!(
                "release {} advanced past revision {} concurrently",
                revision.release_name,
                expected_parent.unwrap_or(0)
            )));
        }

        tx.commit().await?;
        debug!(
            release = %revision.release_name,
            number = revision.number,
            "Recorded revision and advanced latest pointer"
        );
        Ok(())
    }

    // Tasks

    /// Insert a task with status QUEUED.
    pub async fn enqueue_task(&self, new: NewTask) -> Result<Task> {
        let added = Utc::now();
        let args_json = serde_json::to_string(&new.task_args)?;

        let row = sqlx::query(
            r#"
            INSERT INTO tasks (
                task_type, task_args, status, project_name, version_name,
                revision_number, primary_rel_path, created_by, added
            )
            VALUES (?, ?, 'QUEUED', ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(new.task_type.as_str())
        .bind(&args_json)
        .bind(&new.project_name)
        .bind(&new.version_name)
        .bind(new.revision_number)
        .bind(&new.primary_rel_path)
        .bind(&new.created_by)
        .bind(added.timestamp())
        .fetch_one(&self.pool)
        .await?;

        let task = task_from_row(&row)?;
        info!(
            task_id = task.id,
            task_type = %task.task_type,
            release = %release_name(&task.project_name, &task.version_name),
            "Enqueued task"
        );
        Ok(task)
    }

    /// Fetch one task by id.
    pub async fn task(&self, id: i64) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    /// Count tasks in QUEUED or ACTIVE for an exact revision number, or for
    /// the release's current latest when `revision_number` is `None`.
    pub async fn tasks_ongoing(
        &self,
        project_name: &str,
        version_name: &str,
        revision_number: Option<i64>,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS ongoing FROM tasks
            WHERE project_name = ? AND version_name = ?
              AND status IN ('QUEUED', 'ACTIVE')
              AND revision_number IS (
                  COALESCE(?, (SELECT latest_revision_number FROM releases
                               WHERE project_name = ? AND version_name = ?))
              )
            "#,
        )
        .bind(project_name)
        .bind(version_name)
        .bind(revision_number)
        .bind(project_name)
        .bind(version_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("ongoing"))
    }

    /// Atomically claim the oldest QUEUED task, transitioning it to ACTIVE.
    ///
    /// The guarded UPDATE ensures that two workers can never claim the same
    /// row; returns `None` when nothing is queued.
    pub async fn claim_next_task(&self) -> Result<Option<Task>> {
        let row = sqlx::query(
            r#"
            UPDATE tasks SET status = 'ACTIVE', started = ?
            WHERE id = (
                SELECT id FROM tasks WHERE status = 'QUEUED'
                ORDER BY added ASC, id ASC LIMIT 1
            ) AND status = 'QUEUED'
            RETURNING *
            "#,
        )
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await?;

        let task = row.map(|r| task_from_row(&r)).transpose()?;
        if let Some(ref t) = task {
            info!(task_id = t.id, task_type = %t.task_type, "Claimed task");
        }
        Ok(task)
    }

    /// Record a terminal status for a task, with optional error and result.
    pub async fn finish_task(
        &self,
        id: i64,
        status: TaskStatus,
        error: Option<&str>,
        result: Option<&serde_json::Value>,
    ) -> Result<()> {
        debug_assert!(status.is_terminal());
        let result_json = result.map(serde_json::to_string).transpose()?;
        sqlx::query(
            "UPDATE tasks SET status = ?, completed = ?, error = ?, result = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now().timestamp())
        .bind(error)
        .bind(result_json)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // Check results

    /// Append one check result row.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_check_result(
        &self,
        release_name: &str,
        revision_number: i64,
        checker: &str,
        primary_rel_path: &str,
        status: CheckOutcome,
        message: &str,
        data: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO check_results (
                release_name, revision_number, checker, primary_rel_path,
                status, message, data, created
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(release_name)
        .bind(revision_number)
        .bind(checker)
        .bind(primary_rel_path)
        .bind(status.as_str())
        .bind(message)
        .bind(serde_json::to_string(data)?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Check results for one revision, optionally filtered by status.
    pub async fn check_results(
        &self,
        release_name: &str,
        revision_number: i64,
        status: Option<CheckOutcome>,
    ) -> Result<Vec<CheckResult>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    r#"
                    SELECT * FROM check_results
                    WHERE release_name = ? AND revision_number = ? AND status = ?
                    ORDER BY id
                    "#,
                )
                .bind(release_name)
                .bind(revision_number)
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM check_results
                    WHERE release_name = ? AND revision_number = ?
                    ORDER BY id
                    "#,
                )
                .bind(release_name)
                .bind(revision_number)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(check_result_from_row).collect()
    }

    /// Count of FAILURE check results for one revision.
    pub async fn failing_check_count(
        &self,
        release_name: &str,
        revision_number: i64,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS failing FROM check_results
            WHERE release_name = ? AND revision_number = ? AND status = 'FAILURE'
            "#,
        )
        .bind(release_name)
        .bind(revision_number)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("failing"))
    }

    // Deletion

    /// Delete every row belonging to a release in one transaction.
    ///
    /// Cascade rules could cover the dependent rows, but deleting them
    /// explicitly makes each step's cost and success observable.
    pub async fn purge_release_rows(&self, release: &Release) -> Result<RowPurge> {
        let mut tx = self.pool.begin().await?;

        let tasks = sqlx::query("DELETE FROM tasks WHERE project_name = ? AND version_name = ?")
            .bind(&release.project_name)
            .bind(&release.version_name)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let check_results = sqlx::query("DELETE FROM check_results WHERE release_name = ?")
            .bind(&release.name)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let revisions = sqlx::query("DELETE FROM revisions WHERE release_name = ?")
            .bind(&release.name)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("DELETE FROM releases WHERE name = ?")
            .bind(&release.name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(
            release = %release.name,
            tasks,
            check_results,
            revisions,
            "Purged release rows"
        );
        Ok(RowPurge {
            tasks,
            check_results,
            revisions,
        })
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let secs = row.get::<i64, _>(column);
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AppError::database_error(format!("invalid timestamp in column {column}")))
}

fn optional_timestamp(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    row.get::<Option<i64>, _>(column)
        .map(|secs| {
            DateTime::from_timestamp(secs, 0).ok_or_else(|| {
                AppError::database_error(format!("invalid timestamp in column {column}"))
            })
        })
        .transpose()
}

fn release_from_row(row: &SqliteRow) -> Result<Release> {
    Ok(Release {
        name: row.get("name"),
        project_name: row.get("project_name"),
        version_name: row.get("version_name"),
        phase: row.get::<String, _>("phase").parse()?,
        latest_revision_number: row.get("latest_revision_number"),
        created: timestamp(row, "created")?,
    })
}

fn revision_from_row(row: &SqliteRow) -> Result<Revision> {
    Ok(Revision {
        release_name: row.get("release_name"),
        number: row.get("number"),
        description: row.get("description"),
        created_by: row.get("created_by"),
        created: timestamp(row, "created")?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let result = row
        .get::<Option<String>, _>("result")
        .map(|s| serde_json::from_str(&s))
        .transpose()?;
    Ok(Task {
        id: row.get("id"),
        task_type: row.get::<String, _>("task_type").parse()?,
        task_args: serde_json::from_str(&row.get::<String, _>("task_args"))?,
        status: row.get::<String, _>("status").parse()?,
        project_name: row.get("project_name"),
        version_name: row.get("version_name"),
        revision_number: row.get("revision_number"),
        primary_rel_path: row.get("primary_rel_path"),
        created_by: row.get("created_by"),
        added: timestamp(row, "added")?,
        started: optional_timestamp(row, "started")?,
        completed: optional_timestamp(row, "completed")?,
        error: row.get("error"),
        result,
    })
}

fn check_result_from_row(row: &SqliteRow) -> Result<CheckResult> {
    Ok(CheckResult {
        id: row.get("id"),
        release_name: row.get("release_name"),
        revision_number: row.get("revision_number"),
        checker: row.get("checker"),
        primary_rel_path: row.get("primary_rel_path"),
        status: row.get::<String, _>("status").parse()?,
        message: row.get("message"),
        data: serde_json::from_str(&row.get::<String, _>("data"))?,
        created: timestamp(row, "created")?,
    })
}
