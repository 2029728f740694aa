// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for presscontrol-core integration tests.
//!
//! Provides TestContext with an in-memory store, a manual clock and an
//! operator session, plus a persistence wrapper that can inject failures.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;

use presscontrol_core::engine::ExecutionEngine;
use presscontrol_core::error::EngineError;
use presscontrol_core::events::EngineEvent;
use presscontrol_core::gateway::{Clock, ManualClock, OperatorSession};
use presscontrol_core::migrations;
use presscontrol_core::persistence::{
    ExecutionRecord, NewExecution, Persistence, PressureSample, SqlitePersistence,
};
use presscontrol_core::recovery::RecoveryManager;

/// Operator used by the tests.
pub const OPERATOR_ID: i64 = 1;

/// Fixed start of the manual clock.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 16, 15, 35, 16).unwrap()
}

/// Test context with an in-memory store and a manual clock.
pub struct TestContext {
    pub store: Arc<SqlitePersistence>,
    pub clock: Arc<ManualClock>,
    pub session: Arc<OperatorSession>,
}

impl TestContext {
    /// Fresh migrated in-memory database, authenticated operator.
    pub async fn new() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        migrations::SQLITE
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        Self {
            store: Arc::new(SqlitePersistence::new(pool)),
            clock: Arc::new(ManualClock::new(epoch())),
            session: Arc::new(OperatorSession::authenticated(OPERATOR_ID)),
        }
    }

    /// Engine backed by the store.
    pub fn engine(&self) -> ExecutionEngine {
        self.engine_with(self.store.clone())
    }

    /// Engine backed by a custom repository; programs still come from the store.
    pub fn engine_with(&self, persistence: Arc<dyn Persistence>) -> ExecutionEngine {
        ExecutionEngine::new(
            persistence,
            self.store.clone(),
            self.session.clone(),
            self.clock.clone(),
        )
        .with_seed(42)
    }

    /// Recovery manager sharing the store and clock.
    pub fn recovery(&self) -> RecoveryManager {
        RecoveryManager::new(self.store.clone(), self.store.clone(), self.clock.clone())
    }

    /// Insert a program and return its id.
    pub async fn create_program(
        &self,
        name: &str,
        min_pressure: f64,
        max_pressure: f64,
        time_to_min_pressure: i64,
        program_duration: i64,
    ) -> i64 {
        sqlx::query(
            r#"
            INSERT INTO programs (name, min_pressure, max_pressure, time_to_min_pressure, program_duration, created_by)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(min_pressure)
        .bind(max_pressure)
        .bind(time_to_min_pressure)
        .bind(program_duration)
        .bind(OPERATOR_ID)
        .execute(self.store.pool())
        .await
        .expect("Failed to insert program")
        .last_insert_rowid()
    }

    /// Soft-delete a program.
    pub async fn deactivate_program(&self, program_id: i64) {
        sqlx::query("UPDATE programs SET is_active = 0 WHERE id = ?")
            .bind(program_id)
            .execute(self.store.pool())
            .await
            .expect("Failed to deactivate program");
    }

    /// Insert an open record that started `age` before the clock.
    pub async fn create_open_record(
        &self,
        program_id: i64,
        age: Duration,
        min_pressure_reached: bool,
    ) -> ExecutionRecord {
        let mut record = self
            .store
            .create_execution(&NewExecution {
                program_id,
                user_id: OPERATOR_ID,
                start_time: self.clock.now() - age,
            })
            .await
            .expect("Failed to create execution");
        if min_pressure_reached {
            record.min_pressure_reached = true;
            self.store
                .update_execution(&record)
                .await
                .expect("Failed to update execution");
        }
        record
    }

    /// Reload a record.
    pub async fn record(&self, id: i64) -> ExecutionRecord {
        self.store
            .get_execution(id)
            .await
            .expect("Failed to load execution")
            .expect("Execution should exist")
    }

    /// Current manual clock time.
    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Advance the clock one second and tick.
    pub async fn tick(&self, engine: &mut ExecutionEngine) -> Vec<EngineEvent> {
        self.clock.advance(Duration::seconds(1));
        engine.tick().await
    }
}

/// Repository wrapper whose writes can be made to fail.
pub struct FlakyPersistence {
    inner: Arc<SqlitePersistence>,
    pub fail_samples: AtomicBool,
    pub fail_updates: AtomicBool,
    pub fail_next_update: AtomicBool,
    pub fail_creates: AtomicBool,
}

impl FlakyPersistence {
    pub fn new(inner: Arc<SqlitePersistence>) -> Self {
        Self {
            inner,
            fail_samples: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
            fail_next_update: AtomicBool::new(false),
            fail_creates: AtomicBool::new(false),
        }
    }

    fn check(flag: &AtomicBool, operation: &str) -> Result<(), EngineError> {
        if flag.load(Ordering::SeqCst) {
            Err(EngineError::persistence(operation, "injected failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Persistence for FlakyPersistence {
    async fn create_execution(&self, new: &NewExecution) -> Result<ExecutionRecord, EngineError> {
        Self::check(&self.fail_creates, "create_execution")?;
        self.inner.create_execution(new).await
    }

    async fn update_execution(&self, record: &ExecutionRecord) -> Result<bool, EngineError> {
        Self::check(&self.fail_updates, "update_execution")?;
        if self.fail_next_update.swap(false, Ordering::SeqCst) {
            return Err(EngineError::persistence("update_execution", "injected failure"));
        }
        self.inner.update_execution(record).await
    }

    async fn get_execution(&self, id: i64) -> Result<Option<ExecutionRecord>, EngineError> {
        self.inner.get_execution(id).await
    }

    async fn append_sample(
        &self,
        execution_id: i64,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        Self::check(&self.fail_samples, "append_sample")?;
        self.inner.append_sample(execution_id, value, timestamp).await
    }

    async fn list_running_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, EngineError> {
        self.inner.list_running_started_before(cutoff).await
    }

    async fn latest_running_started_after(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<ExecutionRecord>, EngineError> {
        self.inner.latest_running_started_after(cutoff).await
    }

    async fn list_recent_executions(&self, limit: i64) -> Result<Vec<ExecutionRecord>, EngineError> {
        self.inner.list_recent_executions(limit).await
    }

    async fn list_executions_by_program(
        &self,
        program_id: i64,
    ) -> Result<Vec<ExecutionRecord>, EngineError> {
        self.inner.list_executions_by_program(program_id).await
    }

    async fn list_samples(&self, execution_id: i64) -> Result<Vec<PressureSample>, EngineError> {
        self.inner.list_samples(execution_id).await
    }

    async fn health_check_db(&self) -> Result<bool, EngineError> {
        self.inner.health_check_db().await
    }
}

/// Phases announced through `PhaseChanged`, in order.
pub fn phase_changes(events: &[EngineEvent]) -> Vec<presscontrol_core::events::Phase> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::PhaseChanged { phase } => Some(*phase),
            _ => None,
        })
        .collect()
}

/// Alarm messages, in order.
pub fn alarm_messages(events: &[EngineEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::AlarmTriggered(alarm) => Some(alarm.message.clone()),
            _ => None,
        })
        .collect()
}
