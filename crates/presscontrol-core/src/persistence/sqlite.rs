//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::EngineError;
use crate::gateway::ProgramCatalog;
use crate::migrations;
use crate::program::ProgramSpec;

use super::{ExecutionRecord, NewExecution, Persistence, PressureSample};

const EXECUTION_COLUMNS: &str = r#"
    id, program_id, user_id, start_time, end_time, status,
    min_pressure_reached, max_pressure_exceeded, stopped_manually, notes
"#;

/// Raw `program_executions` row; status is still text here.
#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    id: i64,
    program_id: i64,
    user_id: i64,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    status: String,
    min_pressure_reached: bool,
    max_pressure_exceeded: bool,
    stopped_manually: bool,
    notes: Option<String>,
}

impl TryFrom<ExecutionRow> for ExecutionRecord {
    type Error = EngineError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            program_id: row.program_id,
            user_id: row.user_id,
            start_time: row.start_time,
            end_time: row.end_time,
            status: row.status.parse()?,
            min_pressure_reached: row.min_pressure_reached,
            max_pressure_exceeded: row.max_pressure_exceeded,
            stopped_manually: row.stopped_manually,
            notes: row.notes,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProgramRow {
    id: i64,
    name: String,
    min_pressure: f64,
    max_pressure: f64,
    time_to_min_pressure: i64,
    program_duration: i64,
}

impl From<ProgramRow> for ProgramSpec {
    fn from(row: ProgramRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            min_pressure: row.min_pressure,
            max_pressure: row.max_pressure,
            time_to_min_pressure: row.time_to_min_pressure,
            program_duration: row.program_duration,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SampleRow {
    id: i64,
    execution_id: i64,
    pressure_value: f64,
    timestamp: DateTime<Utc>,
}

fn into_records(rows: Vec<ExecutionRow>) -> Result<Vec<ExecutionRecord>, EngineError> {
    rows.into_iter().map(ExecutionRecord::try_from).collect()
}

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects to the database with sensible defaults
    /// - Runs all migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path("data/pressure_control.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::persistence(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| {
                EngineError::persistence(
                    "connect",
                    format!("Failed to connect to SQLite at {:?}: {}", path, e),
                )
            })?;

        migrations::run_sqlite(&pool).await.map_err(|e| {
            EngineError::persistence("migrate", format!("Failed to run migrations: {}", e))
        })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn create_execution(&self, new: &NewExecution) -> Result<ExecutionRecord, EngineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO program_executions (program_id, user_id, start_time, status)
            VALUES (?, ?, ?, 'running')
            "#,
        )
        .bind(new.program_id)
        .bind(new.user_id)
        .bind(new.start_time)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_execution(id).await?.ok_or_else(|| {
            EngineError::persistence(
                "create_execution",
                format!("execution {} missing after insert", id),
            )
        })
    }

    async fn update_execution(&self, record: &ExecutionRecord) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE program_executions
            SET end_time = ?, status = ?, min_pressure_reached = ?,
                max_pressure_exceeded = ?, stopped_manually = ?, notes = ?
            WHERE id = ?
            "#,
        )
        .bind(record.end_time)
        .bind(record.status.as_str())
        .bind(record.min_pressure_reached)
        .bind(record.max_pressure_exceeded)
        .bind(record.stopped_manually)
        .bind(&record.notes)
        .bind(record.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_execution(&self, id: i64) -> Result<Option<ExecutionRecord>, EngineError> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {} FROM program_executions WHERE id = ?",
            EXECUTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ExecutionRecord::try_from).transpose()
    }

    async fn append_sample(
        &self,
        execution_id: i64,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO pressure_readings (execution_id, pressure_value, timestamp)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(execution_id)
        .bind(value)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_running_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, EngineError> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {}
            FROM program_executions
            WHERE status = 'running'
              AND end_time IS NULL
              AND start_time < ?
            ORDER BY start_time ASC
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    async fn latest_running_started_after(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>, EngineError> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {}
            FROM program_executions
            WHERE status = 'running'
              AND end_time IS NULL
              AND start_time > ?
            ORDER BY start_time DESC, id DESC
            LIMIT 1
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ExecutionRecord::try_from).transpose()
    }

    async fn list_recent_executions(&self, limit: i64) -> Result<Vec<ExecutionRecord>, EngineError> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {}
            FROM program_executions
            ORDER BY start_time DESC, id DESC
            LIMIT ?
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    async fn list_executions_by_program(
        &self,
        program_id: i64,
    ) -> Result<Vec<ExecutionRecord>, EngineError> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {}
            FROM program_executions
            WHERE program_id = ?
            ORDER BY start_time DESC, id DESC
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(program_id)
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    async fn list_samples(&self, execution_id: i64) -> Result<Vec<PressureSample>, EngineError> {
        let rows = sqlx::query_as::<_, SampleRow>(
            r#"
            SELECT id, execution_id, pressure_value, timestamp
            FROM pressure_readings
            WHERE execution_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PressureSample {
                id: row.id,
                execution_id: row.execution_id,
                value: row.pressure_value,
                timestamp: row.timestamp,
            })
            .collect())
    }

    async fn health_check_db(&self) -> Result<bool, EngineError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

#[async_trait::async_trait]
impl ProgramCatalog for SqlitePersistence {
    async fn get_program(&self, id: i64) -> Result<Option<ProgramSpec>, EngineError> {
        let row = sqlx::query_as::<_, ProgramRow>(
            r#"
            SELECT id, name, min_pressure, max_pressure, time_to_min_pressure, program_duration
            FROM programs
            WHERE id = ? AND is_active = 1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ProgramSpec::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::ExecutionStatus;
    use chrono::{Duration, TimeZone};

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        migrations::SQLITE
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        pool
    }

    async fn insert_program(pool: &SqlitePool, name: &str) -> i64 {
        sqlx::query(
            r#"
            INSERT INTO programs (name, min_pressure, max_pressure, time_to_min_pressure, program_duration)
            VALUES (?, 20.0, 60.0, 5, 30)
            "#,
        )
        .bind(name)
        .execute(pool)
        .await
        .expect("Failed to insert program")
        .last_insert_rowid()
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 16, 12, 0, 0).unwrap()
    }

    async fn create(persistence: &SqlitePersistence, program_id: i64, start: DateTime<Utc>) -> ExecutionRecord {
        persistence
            .create_execution(&NewExecution {
                program_id,
                user_id: 1,
                start_time: start,
            })
            .await
            .expect("Failed to create execution")
    }

    #[tokio::test]
    async fn test_create_and_get_execution() {
        let pool = test_pool().await;
        let program_id = insert_program(&pool, "create").await;
        let persistence = SqlitePersistence::new(pool);

        let record = create(&persistence, program_id, base_time()).await;
        assert!(record.id > 0);
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.start_time, base_time());
        assert!(record.is_open());
        assert!(!record.min_pressure_reached);

        let fetched = persistence
            .get_execution(record.id)
            .await
            .unwrap()
            .expect("Execution should exist");
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn test_get_execution_not_found() {
        let pool = test_pool().await;
        let persistence = SqlitePersistence::new(pool);

        let result = persistence.get_execution(999).await.expect("Query should succeed");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_update_execution() {
        let pool = test_pool().await;
        let program_id = insert_program(&pool, "update").await;
        let persistence = SqlitePersistence::new(pool);

        let mut record = create(&persistence, program_id, base_time()).await;
        record.status = ExecutionStatus::Stopped;
        record.end_time = Some(base_time() + Duration::minutes(3));
        record.stopped_manually = true;
        record.min_pressure_reached = true;
        record.notes = Some("operator abort".to_string());

        assert!(persistence.update_execution(&record).await.unwrap());

        let fetched = persistence.get_execution(record.id).await.unwrap().unwrap();
        assert_eq!(fetched, record);
        assert!(!fetched.is_open());
    }

    #[tokio::test]
    async fn test_update_missing_execution_returns_false() {
        let pool = test_pool().await;
        let program_id = insert_program(&pool, "missing").await;
        let persistence = SqlitePersistence::new(pool);

        let mut record = create(&persistence, program_id, base_time()).await;
        record.id = 4242;
        assert!(!persistence.update_execution(&record).await.unwrap());
    }

    #[tokio::test]
    async fn test_samples_are_chronological() {
        let pool = test_pool().await;
        let program_id = insert_program(&pool, "samples").await;
        let persistence = SqlitePersistence::new(pool);

        let record = create(&persistence, program_id, base_time()).await;
        for (i, value) in [0.5, 1.0, 1.5].into_iter().enumerate() {
            persistence
                .append_sample(record.id, value, base_time() + Duration::seconds(i as i64 + 1))
                .await
                .unwrap();
        }

        let samples = persistence.list_samples(record.id).await.unwrap();
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![0.5, 1.0, 1.5]);
        assert_eq!(samples[2].timestamp, base_time() + Duration::seconds(3));
    }

    #[tokio::test]
    async fn test_running_window_queries() {
        let pool = test_pool().await;
        let program_id = insert_program(&pool, "windows").await;
        let persistence = SqlitePersistence::new(pool);

        let now = base_time();
        let old = create(&persistence, program_id, now - Duration::hours(25)).await;
        let gap = create(&persistence, program_id, now - Duration::hours(10)).await;
        let recent = create(&persistence, program_id, now - Duration::hours(1)).await;
        let newest = create(&persistence, program_id, now - Duration::minutes(30)).await;

        let mut done = create(&persistence, program_id, now - Duration::hours(30)).await;
        done.status = ExecutionStatus::Completed;
        done.end_time = Some(now - Duration::hours(29));
        persistence.update_execution(&done).await.unwrap();

        let stale = persistence
            .list_running_started_before(now - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(stale.iter().map(|r| r.id).collect::<Vec<_>>(), vec![old.id]);

        let latest = persistence
            .latest_running_started_after(now - Duration::hours(4))
            .await
            .unwrap()
            .expect("recent record");
        assert_eq!(latest.id, newest.id);
        assert_ne!(latest.id, recent.id);
        assert_ne!(latest.id, gap.id);
    }

    #[tokio::test]
    async fn test_window_cutoff_is_strict() {
        let pool = test_pool().await;
        let program_id = insert_program(&pool, "strict").await;
        let persistence = SqlitePersistence::new(pool);

        let cutoff = base_time();
        create(&persistence, program_id, cutoff).await;

        assert!(persistence.list_running_started_before(cutoff).await.unwrap().is_empty());
        assert!(persistence.latest_running_started_after(cutoff).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_queries() {
        let pool = test_pool().await;
        let a = insert_program(&pool, "history-a").await;
        let b = insert_program(&pool, "history-b").await;
        let persistence = SqlitePersistence::new(pool);

        let first = create(&persistence, a, base_time()).await;
        let second = create(&persistence, b, base_time() + Duration::minutes(1)).await;
        let third = create(&persistence, a, base_time() + Duration::minutes(2)).await;

        let recent = persistence.list_recent_executions(2).await.unwrap();
        assert_eq!(recent.iter().map(|r| r.id).collect::<Vec<_>>(), vec![third.id, second.id]);

        let by_program = persistence.list_executions_by_program(a).await.unwrap();
        assert_eq!(
            by_program.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![third.id, first.id]
        );
    }

    #[tokio::test]
    async fn test_catalog_skips_inactive_programs() {
        let pool = test_pool().await;
        let program_id = insert_program(&pool, "catalog").await;
        let persistence = SqlitePersistence::new(pool.clone());

        let program = persistence
            .get_program(program_id)
            .await
            .unwrap()
            .expect("program should resolve");
        assert_eq!(program.name, "catalog");
        assert_eq!(program.min_pressure, 20.0);
        assert_eq!(program.time_to_min_pressure, 5);

        sqlx::query("UPDATE programs SET is_active = 0 WHERE id = ?")
            .bind(program_id)
            .execute(&pool)
            .await
            .unwrap();

        assert!(persistence.get_program(program_id).await.unwrap().is_none());
        assert!(persistence.get_program(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_health_check_db() {
        let pool = test_pool().await;
        let persistence = SqlitePersistence::new(pool);
        assert!(persistence.health_check_db().await.unwrap());
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pressure_control.db");

        let persistence = SqlitePersistence::from_path(&path).await.unwrap();
        assert!(path.exists());
        assert!(persistence.health_check_db().await.unwrap());
    }
}
