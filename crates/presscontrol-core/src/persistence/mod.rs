//! Persistence interfaces and backends for presscontrol-core.
//!
//! This module defines the execution repository contract consumed by the
//! engine and the recovery manager, plus the SQLite backend.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Persisted execution status.
///
/// Stored as lowercase text; conversion happens only in the backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// The execution is (or claims to be) driven by an engine.
    Running,
    /// Finished by duration expiry.
    Completed,
    /// Stopped explicitly, or force-stopped by recovery.
    Stopped,
}

impl ExecutionStatus {
    /// Storage form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }

    /// True for completed and stopped.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "stopped" => Ok(Self::Stopped),
            other => Err(EngineError::persistence(
                "decode_status",
                format!("unknown execution status '{}'", other),
            )),
        }
    }
}

/// Execution record from the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    /// Database primary key.
    pub id: i64,
    /// Program being executed.
    pub program_id: i64,
    /// User who started the execution.
    pub user_id: i64,
    /// When the execution started.
    pub start_time: DateTime<Utc>,
    /// When the execution reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Current status.
    pub status: ExecutionStatus,
    /// Setup reached the minimum pressure. Never reset once set.
    pub min_pressure_reached: bool,
    /// Pressure reached or crossed the maximum while running.
    pub max_pressure_exceeded: bool,
    /// Terminated by an explicit stop.
    pub stopped_manually: bool,
    /// Free-form notes (recovery writes here).
    pub notes: Option<String>,
}

impl ExecutionRecord {
    /// Running and never terminated.
    pub fn is_open(&self) -> bool {
        self.status == ExecutionStatus::Running && self.end_time.is_none()
    }
}

/// Fields needed to create an execution record.
#[derive(Debug, Clone)]
pub struct NewExecution {
    /// Program being executed.
    pub program_id: i64,
    /// User starting it.
    pub user_id: i64,
    /// Start timestamp, taken from the engine clock.
    pub start_time: DateTime<Utc>,
}

/// One pressure reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PressureSample {
    /// Database primary key.
    pub id: i64,
    /// Execution the reading belongs to.
    pub execution_id: i64,
    /// Pressure value.
    pub value: f64,
    /// When the reading was taken.
    pub timestamp: DateTime<Utc>,
}

/// Execution repository used by the engine and the recovery manager.
///
/// Implementations own their synchronization; the engine only needs the
/// object to be shareable.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a new `running` record and return it with its id.
    async fn create_execution(&self, new: &NewExecution) -> Result<ExecutionRecord, EngineError>;

    /// Overwrite the mutable fields of a record.
    ///
    /// Returns `false` when no row matched.
    async fn update_execution(&self, record: &ExecutionRecord) -> Result<bool, EngineError>;

    /// Look up a record by id.
    async fn get_execution(&self, id: i64) -> Result<Option<ExecutionRecord>, EngineError>;

    /// Append one pressure sample.
    async fn append_sample(
        &self,
        execution_id: i64,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Open records (`running`, no end time) started strictly before `cutoff`.
    async fn list_running_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, EngineError>;

    /// Most recent open record started strictly after `cutoff`.
    async fn latest_running_started_after(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>, EngineError>;

    /// Newest executions first.
    async fn list_recent_executions(&self, limit: i64) -> Result<Vec<ExecutionRecord>, EngineError>;

    /// All executions of a program, newest first.
    async fn list_executions_by_program(
        &self,
        program_id: i64,
    ) -> Result<Vec<ExecutionRecord>, EngineError>;

    /// Samples of an execution in chronological order.
    async fn list_samples(&self, execution_id: i64) -> Result<Vec<PressureSample>, EngineError>;

    /// Cheap connectivity probe.
    async fn health_check_db(&self) -> Result<bool, EngineError>;
}
