// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution state machine.
//!
//! Owns the state of the single active execution and advances it once per
//! tick. Every mutating call returns the events it produced; the host routes
//! them to presentation.
//!
//! ```text
//! Idle --start--> Setup --min reached--> Running --duration--> Completed
//!                   |                       |
//!                   +--------stop-----------+--------------->  Stopped
//! ```
//!
//! `Completed` and `Stopped` are reported through events only. The engine
//! itself drops back to `Idle` once the terminal status is persisted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, instrument, warn};

use crate::alarm::{AlarmMonitor, TickReading};
use crate::controller::{self, RUNNING_DRAW};
use crate::error::{EngineError, Result};
use crate::events::{ActiveSnapshot, Alarm, EngineEvent, EngineSnapshot, Phase};
use crate::gateway::{AuthGate, Clock, ProgramCatalog};
use crate::persistence::{ExecutionRecord, ExecutionStatus, NewExecution, Persistence};
use crate::program::ProgramSpec;

/// Default unit for status lines and alarm messages.
pub const DEFAULT_PRESSURE_UNIT: &str = "PSI";

/// In-memory state of the active execution.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub(crate) phase: Phase,
    pub(crate) program: ProgramSpec,
    pub(crate) record: ExecutionRecord,
    pub(crate) current_pressure: f64,
    pub(crate) target_pressure: f64,
    pub(crate) pressure_increment: f64,
    pub(crate) elapsed_ticks: i64,
    pub(crate) running_ticks: i64,
    pub(crate) min_pressure_reached: bool,
    pub(crate) max_pressure_exceeded: bool,
    pub(crate) program_start_time: Option<DateTime<Utc>>,
}

impl EngineState {
    /// Fresh state for a newly created record.
    pub(crate) fn started(program: ProgramSpec, record: ExecutionRecord) -> Self {
        Self {
            phase: Phase::Setup,
            current_pressure: 0.0,
            target_pressure: program.min_pressure,
            pressure_increment: program.pressure_increment(),
            elapsed_ticks: 0,
            running_ticks: 0,
            min_pressure_reached: false,
            max_pressure_exceeded: record.max_pressure_exceeded,
            program_start_time: None,
            program,
            record,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Program being executed.
    pub fn program(&self) -> &ProgramSpec {
        &self.program
    }

    /// Record backing this execution, as last written by the engine.
    pub fn record(&self) -> &ExecutionRecord {
        &self.record
    }

    /// Pressure after the last tick.
    pub fn current_pressure(&self) -> f64 {
        self.current_pressure
    }

    /// Per-tick setup increment.
    pub fn pressure_increment(&self) -> f64 {
        self.pressure_increment
    }

    /// Ticks since the execution started.
    pub fn elapsed_ticks(&self) -> i64 {
        self.elapsed_ticks
    }

    /// Ticks since entering `Running`.
    pub fn running_ticks(&self) -> i64 {
        self.running_ticks
    }

    /// Setup reached the minimum.
    pub fn min_pressure_reached(&self) -> bool {
        self.min_pressure_reached
    }

    /// Running pressure reached or crossed the maximum.
    pub fn max_pressure_exceeded(&self) -> bool {
        self.max_pressure_exceeded
    }

    /// When the timed run began.
    pub fn program_start_time(&self) -> Option<DateTime<Utc>> {
        self.program_start_time
    }

    fn program_elapsed(&self, now: DateTime<Utc>) -> i64 {
        self.program_start_time
            .map(|started| (now - started).num_seconds().max(0))
            .unwrap_or(0)
    }
}

/// The execution state machine.
///
/// All mutating calls take `&mut self`; exclusive access is the serialization
/// boundary around the state.
pub struct ExecutionEngine {
    persistence: Arc<dyn Persistence>,
    catalog: Arc<dyn ProgramCatalog>,
    auth: Arc<dyn AuthGate>,
    clock: Arc<dyn Clock>,
    rng: StdRng,
    monitor: AlarmMonitor,
    unit: String,
    state: Option<EngineState>,
}

impl ExecutionEngine {
    /// Create an idle engine with an entropy-seeded random walk.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        catalog: Arc<dyn ProgramCatalog>,
        auth: Arc<dyn AuthGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            persistence,
            catalog,
            auth,
            clock,
            rng: StdRng::from_entropy(),
            monitor: AlarmMonitor::new(DEFAULT_PRESSURE_UNIT),
            unit: DEFAULT_PRESSURE_UNIT.to_string(),
            state: None,
        }
    }

    /// Make the running-phase walk reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Unit used in status lines and alarm messages.
    pub fn with_pressure_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self.monitor = AlarmMonitor::new(self.unit.clone());
        self
    }

    /// Active state, if any.
    pub fn state(&self) -> Option<&EngineState> {
        self.state.as_ref()
    }

    /// Current phase (`Idle` when nothing is active).
    pub fn phase(&self) -> Phase {
        self.state.as_ref().map_or(Phase::Idle, |s| s.phase)
    }

    /// True while an execution is active.
    pub fn is_running(&self) -> bool {
        self.state.is_some()
    }

    pub(crate) fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub(crate) fn catalog(&self) -> &Arc<dyn ProgramCatalog> {
        &self.catalog
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Start executing `program_id` on behalf of the authenticated user.
    ///
    /// # Errors
    ///
    /// - `PermissionDenied` when the auth gate refuses
    /// - `AlreadyRunning` when an execution is active
    /// - `ProgramNotFound` when the id does not resolve
    /// - `InvalidProgramParameters` when the program fails validation
    /// - `PersistenceFailure` when the record cannot be created; the engine
    ///   stays idle
    #[instrument(skip(self))]
    pub async fn start(&mut self, program_id: i64) -> Result<Vec<EngineEvent>> {
        if !self.auth.can_execute_programs() {
            return Err(EngineError::PermissionDenied);
        }
        let user_id = self
            .auth
            .current_user_id()
            .ok_or(EngineError::PermissionDenied)?;

        if let Some(state) = &self.state {
            return Err(EngineError::AlreadyRunning {
                execution_id: state.record.id,
            });
        }

        let program = self
            .catalog
            .get_program(program_id)
            .await?
            .ok_or(EngineError::ProgramNotFound { program_id })?;
        program.validate()?;

        let record = self
            .persistence
            .create_execution(&NewExecution {
                program_id,
                user_id,
                start_time: self.clock.now(),
            })
            .await?;

        info!(
            execution_id = record.id,
            program_id,
            user_id,
            program = %program.name,
            increment = program.pressure_increment(),
            "Execution started"
        );

        let execution_id = record.id;
        let message = format!("Starting program: {}", program.name);
        self.state = Some(EngineState::started(program, record));

        Ok(vec![
            EngineEvent::Started { execution_id },
            EngineEvent::PhaseChanged {
                phase: Phase::Setup,
            },
            EngineEvent::StatusUpdated { message },
        ])
    }

    /// Advance the active execution by one tick.
    ///
    /// No-op when idle. Failed writes on the tick path are logged and
    /// tolerated; a failed completion stays in `Running` and is retried on the
    /// next tick. Any other fault is fatal to the execution: it is stopped
    /// manually, and if that fails too the engine is forced back to idle.
    pub async fn tick(&mut self) -> Vec<EngineEvent> {
        let Some(execution_id) = self.state.as_ref().map(|s| s.record.id) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        let Err(fault) = self.advance(&mut events).await else {
            return events;
        };

        error!(execution_id, error = %fault, "Tick fault, stopping execution");
        match self.stop(true).await {
            Ok(mut stopped) => events.append(&mut stopped),
            Err(stop_err) => {
                error!(
                    execution_id,
                    error = %stop_err,
                    "Failed to stop faulted execution, forcing idle"
                );
                self.state = None;
                events.push(EngineEvent::PhaseChanged { phase: Phase::Idle });
            }
        }
        events
    }

    async fn advance(&mut self, events: &mut Vec<EngineEvent>) -> Result<()> {
        let now = self.clock.now();
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };

        state.elapsed_ticks += 1;
        let mut entered_running = false;

        match state.phase {
            Phase::Setup => {
                let min = state.program.min_pressure;
                state.current_pressure =
                    controller::setup_step(state.current_pressure, state.pressure_increment, min);
                state.target_pressure = min;

                if state.current_pressure >= min {
                    state.min_pressure_reached = true;
                    state.record.min_pressure_reached = true;
                    // stop() persists the flag too
                    match self.persistence.update_execution(&state.record).await {
                        Ok(true) => {}
                        Ok(false) => warn!(
                            execution_id = state.record.id,
                            "Execution record vanished while marking minimum reached"
                        ),
                        Err(e) => warn!(
                            execution_id = state.record.id,
                            error = %e,
                            "Failed to record minimum reached"
                        ),
                    }
                    state.program_start_time = Some(now);
                    state.phase = Phase::Running;
                    state.running_ticks = 0;
                    entered_running = true;
                    info!(
                        execution_id = state.record.id,
                        ticks = state.elapsed_ticks,
                        pressure = state.current_pressure,
                        "Minimum pressure reached, entering running phase"
                    );
                }
            }
            Phase::Running => {
                state.running_ticks += 1;
                let draw = self.rng.gen_range(RUNNING_DRAW);
                state.current_pressure =
                    controller::running_step(state.current_pressure, draw, &state.program);
                if state.current_pressure >= state.program.max_pressure {
                    state.max_pressure_exceeded = true;
                    state.record.max_pressure_exceeded = true;
                }
            }
            Phase::Idle | Phase::Completed | Phase::Stopped => {
                return Err(EngineError::Internal {
                    reason: format!("tick in inactive phase {}", state.phase),
                });
            }
        }

        if !state.current_pressure.is_finite() {
            return Err(EngineError::Internal {
                reason: format!("non-finite pressure {}", state.current_pressure),
            });
        }

        if let Err(e) = self
            .persistence
            .append_sample(state.record.id, state.current_pressure, now)
            .await
        {
            warn!(
                execution_id = state.record.id,
                error = %e,
                "Failed to record pressure sample"
            );
        }

        events.push(EngineEvent::PressureUpdated {
            value: state.current_pressure,
        });
        if entered_running {
            events.push(EngineEvent::PhaseChanged {
                phase: Phase::Running,
            });
        }

        let alarms = self.monitor.evaluate(&TickReading {
            phase: state.phase,
            elapsed_ticks: state.elapsed_ticks,
            min_pressure_reached: state.min_pressure_reached,
            pressure: state.current_pressure,
            program: &state.program,
        });
        for alarm in alarms {
            warn!(execution_id = state.record.id, alarm = %alarm.message, "Alarm raised");
            events.push(EngineEvent::AlarmTriggered(alarm));
        }

        let (elapsed, remaining, pct) = progress(state, now);
        events.push(EngineEvent::ProgressUpdated {
            elapsed,
            remaining,
            pct,
        });
        events.push(EngineEvent::StatusUpdated {
            message: format!(
                "{}: {} / Remaining: {} / Pressure: {:.1} {}",
                state.phase,
                clock_face(elapsed),
                clock_face(remaining),
                state.current_pressure,
                self.unit
            ),
        });

        debug!(
            execution_id = state.record.id,
            phase = %state.phase,
            pressure = state.current_pressure,
            elapsed,
            remaining,
            "Tick"
        );

        if state.phase == Phase::Running && elapsed >= state.program.duration_seconds() {
            let execution_id = state.record.id;
            match self.stop(false).await {
                Ok(mut finished) => events.append(&mut finished),
                Err(e) => warn!(
                    execution_id,
                    error = %e,
                    "Failed to persist completion, retrying on next tick"
                ),
            }
        }

        Ok(())
    }

    /// Terminate the active execution.
    ///
    /// The terminal status is persisted before the state is cleared; when the
    /// write fails the engine keeps its current phase.
    ///
    /// # Errors
    ///
    /// - `NotRunning` when idle (no side effects)
    /// - `PersistenceFailure` when the record update fails
    #[instrument(skip(self))]
    pub async fn stop(&mut self, manual: bool) -> Result<Vec<EngineEvent>> {
        let state = self.state.as_ref().ok_or(EngineError::NotRunning)?;

        let status = if manual {
            ExecutionStatus::Stopped
        } else {
            ExecutionStatus::Completed
        };
        let mut record = state.record.clone();
        record.end_time = Some(self.clock.now());
        record.status = status;
        record.stopped_manually = manual;
        record.min_pressure_reached = state.min_pressure_reached;
        record.max_pressure_exceeded = state.max_pressure_exceeded;

        if !self.persistence.update_execution(&record).await? {
            warn!(execution_id = record.id, "Execution record missing at stop");
        }

        let program_name = state.program.name.clone();
        self.state = None;

        info!(
            execution_id = record.id,
            %status,
            max_pressure_exceeded = record.max_pressure_exceeded,
            "Execution finished"
        );

        let mut events = vec![EngineEvent::Finished {
            execution_id: record.id,
            status,
        }];
        if manual {
            events.push(EngineEvent::PhaseChanged {
                phase: Phase::Stopped,
            });
            events.push(EngineEvent::StatusUpdated {
                message: format!("Program {} stopped manually", program_name),
            });
        } else {
            let message = format!("Program {} completed", program_name);
            events.push(EngineEvent::AlarmTriggered(Alarm::completion(message.clone())));
            events.push(EngineEvent::PhaseChanged {
                phase: Phase::Completed,
            });
            events.push(EngineEvent::StatusUpdated { message });
        }
        Ok(events)
    }

    /// Read-only projection for presentation polling.
    pub fn snapshot(&self) -> EngineSnapshot {
        match &self.state {
            None => EngineSnapshot::NotRunning,
            Some(state) => EngineSnapshot::Active(ActiveSnapshot {
                execution_id: state.record.id,
                program_id: state.program.id,
                program_name: state.program.name.clone(),
                phase: state.phase,
                elapsed_seconds: state.elapsed_ticks,
                current_pressure: state.current_pressure,
                target_pressure: state.target_pressure,
                program_duration_seconds: state.program.duration_seconds(),
                min_pressure: state.program.min_pressure,
                max_pressure: state.program.max_pressure,
                min_pressure_reached: state.min_pressure_reached,
                max_pressure_exceeded: state.max_pressure_exceeded,
            }),
        }
    }

    /// Install a reconstructed state.
    pub(crate) fn attach(&mut self, state: EngineState) -> Result<Vec<EngineEvent>> {
        if let Some(active) = &self.state {
            return Err(EngineError::AlreadyRunning {
                execution_id: active.record.id,
            });
        }
        let events = vec![
            EngineEvent::Started {
                execution_id: state.record.id,
            },
            EngineEvent::PhaseChanged { phase: state.phase },
            EngineEvent::StatusUpdated {
                message: format!("Resuming program: {}", state.program.name),
            },
        ];
        self.state = Some(state);
        Ok(events)
    }

    /// Drop the active state without touching the store.
    pub(crate) fn reset(&mut self) -> Option<EngineState> {
        self.state.take()
    }
}

/// Elapsed, remaining and percentage for the current phase.
fn progress(state: &EngineState, now: DateTime<Utc>) -> (i64, i64, u8) {
    match state.phase {
        Phase::Setup => {
            let elapsed = state.elapsed_ticks;
            let remaining = (state.program.setup_budget_seconds() - elapsed).max(0);
            let min = state.program.min_pressure;
            let pct = if min > 0.0 {
                (state.current_pressure / min * 100.0).clamp(0.0, 100.0) as u8
            } else {
                100
            };
            (elapsed, remaining, pct)
        }
        _ => {
            let elapsed = state.program_elapsed(now);
            let duration = state.program.duration_seconds();
            let remaining = (duration - elapsed).max(0);
            let pct = if duration > 0 {
                (elapsed * 100 / duration).clamp(0, 100) as u8
            } else {
                100
            };
            (elapsed, remaining, pct)
        }
    }
}

/// `MM:SS`; minutes are not wrapped into hours.
fn clock_face(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}
