// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Alarm monitor.
//!
//! Stateless per tick. Classifies the current pressure and timing into zero
//! or more alarms, ordered by precedence:
//!
//! 1. setup timeout exceeded
//! 2. pressure below minimum (running only)
//! 3. pressure above maximum (running only)
//!
//! Alarms are advisory. Only `stop()` changes the phase or the persisted status.

use crate::events::{Alarm, Phase};
use crate::program::ProgramSpec;

/// Inputs for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct TickReading<'a> {
    /// Phase after this tick's transition, if any.
    pub phase: Phase,
    /// Ticks since the execution started.
    pub elapsed_ticks: i64,
    /// Whether setup already reached the minimum.
    pub min_pressure_reached: bool,
    /// Pressure produced by this tick.
    pub pressure: f64,
    /// The program being executed.
    pub program: &'a ProgramSpec,
}

/// Out-of-band condition found in a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmCondition {
    /// Setup budget spent without reaching the minimum.
    SetupTimeout,
    /// Running pressure under the minimum.
    BelowMinimum,
    /// Running pressure at or over the maximum.
    AboveMaximum,
}

/// Evaluates alarm conditions once per tick.
#[derive(Debug, Clone, Default)]
pub struct AlarmMonitor {
    unit: String,
}

impl AlarmMonitor {
    /// Create a monitor that renders values with the given unit.
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }

    /// Conditions present in the reading, in precedence order.
    pub fn conditions(&self, reading: &TickReading<'_>) -> Vec<AlarmCondition> {
        let mut found = Vec::new();
        let program = reading.program;

        if reading.phase == Phase::Setup
            && !reading.min_pressure_reached
            && reading.elapsed_ticks >= program.setup_budget_seconds()
        {
            found.push(AlarmCondition::SetupTimeout);
        }

        if reading.phase == Phase::Running {
            if reading.pressure < program.min_pressure {
                found.push(AlarmCondition::BelowMinimum);
            }
            if reading.pressure >= program.max_pressure {
                found.push(AlarmCondition::AboveMaximum);
            }
        }

        found
    }

    /// Alarms for the reading, in precedence order.
    pub fn evaluate(&self, reading: &TickReading<'_>) -> Vec<Alarm> {
        self.conditions(reading)
            .into_iter()
            .map(|condition| self.render(condition, reading))
            .collect()
    }

    fn render(&self, condition: AlarmCondition, reading: &TickReading<'_>) -> Alarm {
        let program = reading.program;
        let message = match condition {
            AlarmCondition::SetupTimeout => format!(
                "Setup timeout: minimum pressure {:.1} {} not reached after {} min (current {:.1} {})",
                program.min_pressure,
                self.unit,
                program.time_to_min_pressure,
                reading.pressure,
                self.unit
            ),
            AlarmCondition::BelowMinimum => format!(
                "Pressure below minimum: {:.1} {} < {:.1} {}",
                reading.pressure, self.unit, program.min_pressure, self.unit
            ),
            AlarmCondition::AboveMaximum => format!(
                "Pressure above maximum: {:.1} {} >= {:.1} {}",
                reading.pressure, self.unit, program.max_pressure, self.unit
            ),
        };
        Alarm::warning(message)
    }
}
