// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine events and the presentation snapshot.
//!
//! Every mutating engine call returns the events it produced, in order. The
//! host decides where they go (logs, UI, broadcast channel).

use std::fmt;

use serde::Serialize;

use crate::persistence::ExecutionStatus;

/// Lifecycle phase of the active execution.
///
/// Variants are declared in progression order, so `Ord` follows
/// `Idle < Setup < Running < {Completed, Stopped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No execution is active.
    Idle,
    /// Ramping pressure up to the program minimum.
    Setup,
    /// Timed program body.
    Running,
    /// Finished by duration expiry.
    Completed,
    /// Finished by an explicit stop.
    Stopped,
}

impl Phase {
    /// True while ticks drive the execution.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Setup | Self::Running)
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Setup => "setup",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Setup => "Setup",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Alarm classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmSeverity {
    /// Red alarm: a limit is violated.
    Warning,
    /// Green alarm: the program finished its duration.
    Completion,
}

/// An advisory alarm. Raising one never changes the phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alarm {
    /// Severity tag.
    pub severity: AlarmSeverity,
    /// Human-readable reason.
    pub message: String,
}

impl Alarm {
    /// Red alarm.
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: AlarmSeverity::Warning,
            message: message.into(),
        }
    }

    /// Green alarm.
    pub fn completion(message: impl Into<String>) -> Self {
        Self {
            severity: AlarmSeverity::Completion,
            message: message.into(),
        }
    }
}

/// Events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A new or resumed execution is now driven by the engine.
    Started {
        /// Execution record id.
        execution_id: i64,
    },
    /// Phase transition.
    PhaseChanged {
        /// The phase entered.
        phase: Phase,
    },
    /// New pressure value for this tick.
    PressureUpdated {
        /// Current pressure.
        value: f64,
    },
    /// Progress of the current phase, in seconds.
    ProgressUpdated {
        /// Seconds elapsed in the phase.
        elapsed: i64,
        /// Seconds remaining in the phase.
        remaining: i64,
        /// Percentage complete, capped at 100.
        pct: u8,
    },
    /// Alarm raised by the monitor or by completion.
    AlarmTriggered(Alarm),
    /// One-line status for displays.
    StatusUpdated {
        /// Formatted status line.
        message: String,
    },
    /// The execution reached a terminal status.
    Finished {
        /// Execution record id.
        execution_id: i64,
        /// Terminal status persisted on the record.
        status: ExecutionStatus,
    },
}

/// Read-only projection of the engine state for presentation polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineSnapshot {
    /// No execution is active.
    NotRunning,
    /// An execution is active.
    Active(ActiveSnapshot),
}

impl EngineSnapshot {
    /// True when an execution is active.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Active(_))
    }
}

/// Details of the active execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveSnapshot {
    /// Execution record id.
    pub execution_id: i64,
    /// Program id.
    pub program_id: i64,
    /// Program name.
    pub program_name: String,
    /// Current phase.
    pub phase: Phase,
    /// Seconds since the execution started.
    pub elapsed_seconds: i64,
    /// Current pressure.
    pub current_pressure: f64,
    /// Pressure the phase aims for.
    pub target_pressure: f64,
    /// Program duration in seconds.
    pub program_duration_seconds: i64,
    /// Program minimum.
    pub min_pressure: f64,
    /// Program maximum.
    pub max_pressure: f64,
    /// Minimum reached during setup.
    pub min_pressure_reached: bool,
    /// Maximum reached or crossed while running.
    pub max_pressure_exceeded: bool,
}
