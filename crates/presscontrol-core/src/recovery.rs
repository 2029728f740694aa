// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Crash recovery and reconciliation.
//!
//! Runs once the operator is authenticated and again on demand:
//!
//! 1. Force-stop phantom records (`running` and older than the phantom age).
//! 2. Find the most recent `running` record inside the resume window.
//! 3. Rebuild an approximate [`EngineState`] for it. Samples are not replayed;
//!    pressure is estimated from the record and the program.
//!
//! Records older than the resume window but younger than the phantom age are
//! neither resumed nor cleaned. They stay `running` until the phantom sweep
//! eventually reaches them.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::engine::{EngineState, ExecutionEngine};
use crate::error::Result;
use crate::events::{EngineEvent, Phase};
use crate::gateway::{Clock, ProgramCatalog};
use crate::persistence::{ExecutionRecord, ExecutionStatus, Persistence};
use crate::program::ProgramSpec;

/// Note written on records closed by the phantom sweep.
pub const PHANTOM_CLEANUP_NOTE: &str = "automatic phantom cleanup";

/// Note written on resumable records whose program no longer validates.
pub const INVALID_PROGRAM_NOTE: &str = "stopped during recovery: invalid program parameters";

/// Fraction of the `[min, max]` range assumed for a resumed running execution.
pub const RESUME_PRESSURE_FRACTION: f64 = 0.6;

/// Age thresholds used by the recovery manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Records older than this are phantoms.
    pub phantom_age: Duration,
    /// Records younger than this may be resumed.
    pub resume_window: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            phantom_age: Duration::hours(24),
            resume_window: Duration::hours(4),
        }
    }
}

/// A record that can be re-attached to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumableExecution {
    /// The open record.
    pub record: ExecutionRecord,
    /// Its program, resolved from the catalog.
    pub program: ProgramSpec,
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// Nothing is active.
    Idle,
    /// Memory and store agree.
    Consistent,
    /// The backing record is gone; the engine was reset.
    RecordMissing {
        /// Execution the engine was driving.
        execution_id: i64,
    },
    /// The record was closed externally; the engine was reset.
    StatusChanged {
        /// Execution the engine was driving.
        execution_id: i64,
        /// Status found in the store.
        status: ExecutionStatus,
    },
    /// The program disappeared; the execution was stopped manually.
    ProgramMissing {
        /// Execution the engine was driving.
        execution_id: i64,
    },
}

/// Summary of a startup recovery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Phantom records force-stopped.
    pub phantoms_cleaned: u64,
    /// Execution re-attached to the engine, if any.
    pub resumed_execution_id: Option<i64>,
    /// Events produced by the resume.
    pub events: Vec<EngineEvent>,
}

/// Reconciles persisted execution records with the engine.
pub struct RecoveryManager {
    persistence: Arc<dyn Persistence>,
    catalog: Arc<dyn ProgramCatalog>,
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
}

impl RecoveryManager {
    /// Create a manager with the default thresholds.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        catalog: Arc<dyn ProgramCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            persistence,
            catalog,
            clock,
            config: RecoveryConfig::default(),
        }
    }

    /// Create a manager sharing the engine's collaborators.
    pub fn for_engine(engine: &ExecutionEngine) -> Self {
        Self::new(
            engine.persistence().clone(),
            engine.catalog().clone(),
            engine.clock().clone(),
        )
    }

    /// Override the thresholds.
    pub fn with_config(mut self, config: RecoveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Thresholds in use.
    pub fn config(&self) -> RecoveryConfig {
        self.config
    }

    /// Force-stop every open record older than the phantom age.
    ///
    /// Returns the number of records closed. A second run right after the
    /// first closes nothing.
    #[instrument(skip(self))]
    pub async fn clean_phantom_executions(&self) -> Result<u64> {
        let now = self.clock.now();
        let cutoff = now - self.config.phantom_age;
        let stale = self.persistence.list_running_started_before(cutoff).await?;

        let mut cleaned = 0;
        for record in stale {
            warn!(
                execution_id = record.id,
                started_at = %record.start_time,
                "Closing phantom execution"
            );
            if self.force_stop(record, now, PHANTOM_CLEANUP_NOTE).await? {
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            info!(cleaned, "Phantom cleanup finished");
        }
        Ok(cleaned)
    }

    /// Find an execution to resume after a restart.
    ///
    /// Runs the phantom sweep first. A recent record whose program no longer
    /// resolves or no longer validates is force-stopped and not returned.
    #[instrument(skip(self))]
    pub async fn check_for_incomplete_execution(&self) -> Result<Option<ResumableExecution>> {
        self.clean_phantom_executions().await?;
        self.latest_resumable().await
    }

    /// Approximate engine state for a resumable record.
    ///
    /// Running executions restart at [`RESUME_PRESSURE_FRACTION`] of the
    /// pressure range with the run assumed to have begun one setup budget
    /// after the record start. Setup executions resume on the linear ramp.
    pub fn reconstruct_state(&self, resumable: ResumableExecution) -> EngineState {
        let ResumableExecution { record, program } = resumable;
        let now = self.clock.now();
        let elapsed = (now - record.start_time).num_seconds().max(0);
        let budget = program.setup_budget_seconds();

        let mut state = EngineState::started(program, record);
        state.elapsed_ticks = elapsed;

        if state.record.min_pressure_reached {
            let program_start = state.record.start_time + Duration::seconds(budget);
            let (min, max) = (state.program.min_pressure, state.program.max_pressure);
            state.phase = Phase::Running;
            state.min_pressure_reached = true;
            state.program_start_time = Some(program_start);
            state.running_ticks = (now - program_start).num_seconds().max(0);
            state.current_pressure = min + RESUME_PRESSURE_FRACTION * (max - min);
        } else {
            let ratio = if budget > 0 {
                (elapsed as f64 / budget as f64).min(1.0)
            } else {
                1.0
            };
            state.current_pressure = state.program.min_pressure * ratio;
        }
        state
    }

    /// Re-attach a resumable execution to an idle engine.
    ///
    /// # Errors
    ///
    /// - `AlreadyRunning` when the engine is driving another execution
    /// - `InvalidProgramParameters` when the program fails validation
    #[instrument(skip(self, engine, resumable), fields(execution_id = resumable.record.id))]
    pub async fn resume_execution(
        &self,
        engine: &mut ExecutionEngine,
        resumable: ResumableExecution,
    ) -> Result<Vec<EngineEvent>> {
        resumable.program.validate()?;
        let state = self.reconstruct_state(resumable);
        info!(
            phase = %state.phase(),
            pressure = state.current_pressure(),
            "Resuming execution"
        );
        engine.attach(state)
    }

    /// Check the engine's active execution against the store.
    ///
    /// Resets the engine when the record vanished or was closed externally,
    /// and stops it manually when the program disappeared.
    #[instrument(skip(self, engine))]
    pub async fn validate_execution_state(
        &self,
        engine: &mut ExecutionEngine,
    ) -> Result<(ValidationOutcome, Vec<EngineEvent>)> {
        let Some(state) = engine.state() else {
            return Ok((ValidationOutcome::Idle, Vec::new()));
        };
        let execution_id = state.record().id;
        let program_id = state.program().id;

        let Some(record) = self.persistence.get_execution(execution_id).await? else {
            warn!(execution_id, "Active execution has no record, resetting");
            engine.reset();
            return Ok((
                ValidationOutcome::RecordMissing { execution_id },
                vec![EngineEvent::PhaseChanged { phase: Phase::Idle }],
            ));
        };

        if !record.is_open() {
            warn!(
                execution_id,
                status = %record.status,
                "Active execution was closed externally, resetting"
            );
            engine.reset();
            return Ok((
                ValidationOutcome::StatusChanged {
                    execution_id,
                    status: record.status,
                },
                vec![EngineEvent::PhaseChanged { phase: Phase::Idle }],
            ));
        }

        if self.catalog.get_program(program_id).await?.is_none() {
            warn!(execution_id, program_id, "Program vanished, stopping execution");
            let events = engine.stop(true).await?;
            return Ok((ValidationOutcome::ProgramMissing { execution_id }, events));
        }

        Ok((ValidationOutcome::Consistent, Vec::new()))
    }

    /// Phantom sweep plus resume, as run at startup.
    pub async fn recover(&self, engine: &mut ExecutionEngine) -> Result<RecoveryReport> {
        let phantoms_cleaned = self.clean_phantom_executions().await?;

        let mut report = RecoveryReport {
            phantoms_cleaned,
            ..Default::default()
        };
        if engine.is_running() {
            return Ok(report);
        }

        if let Some(resumable) = self.latest_resumable().await? {
            report.resumed_execution_id = Some(resumable.record.id);
            report.events = self.resume_execution(engine, resumable).await?;
        }
        Ok(report)
    }

    async fn latest_resumable(&self) -> Result<Option<ResumableExecution>> {
        let now = self.clock.now();
        let cutoff = now - self.config.resume_window;
        let Some(record) = self.persistence.latest_running_started_after(cutoff).await? else {
            debug!("No incomplete execution inside the resume window");
            return Ok(None);
        };

        match self.catalog.get_program(record.program_id).await? {
            Some(program) => {
                if let Err(e) = program.validate() {
                    warn!(
                        execution_id = record.id,
                        program_id = program.id,
                        error = %e,
                        "Resumable execution has an invalid program, closing it"
                    );
                    self.force_stop(record, now, INVALID_PROGRAM_NOTE).await?;
                    return Ok(None);
                }
                info!(
                    execution_id = record.id,
                    program_id = program.id,
                    "Found resumable execution"
                );
                Ok(Some(ResumableExecution { record, program }))
            }
            None => {
                let note = format!(
                    "stopped during recovery: program {} no longer exists",
                    record.program_id
                );
                warn!(execution_id = record.id, program_id = record.program_id, "{}", note);
                self.force_stop(record, now, &note).await?;
                Ok(None)
            }
        }
    }

    async fn force_stop(
        &self,
        mut record: ExecutionRecord,
        now: DateTime<Utc>,
        note: &str,
    ) -> Result<bool> {
        record.status = ExecutionStatus::Stopped;
        record.stopped_manually = true;
        record.end_time = Some(now);
        record.notes = Some(note.to_string());
        self.persistence.update_execution(&record).await
    }
}
