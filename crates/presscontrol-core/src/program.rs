// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Program snapshot consumed by the engine.
//!
//! Programs are owned by the catalog. The engine holds a read-only copy for
//! the lifetime of one execution and re-checks the catalog constraints before
//! driving it.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Upper safety bound for `max_pressure`.
pub const MAX_PRESSURE_LIMIT: f64 = 200.0;

/// Upper bound for `program_duration`, in minutes (one day).
pub const MAX_PROGRAM_DURATION_MINUTES: i64 = 1440;

/// Increment used when the program has no setup time budget.
pub const FALLBACK_PRESSURE_INCREMENT: f64 = 1.0;

/// Immutable pressure program parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSpec {
    /// Catalog identifier.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Pressure to reach during setup and hold during the run.
    pub min_pressure: f64,
    /// Upper alarm bound.
    pub max_pressure: f64,
    /// Setup time budget in minutes.
    pub time_to_min_pressure: i64,
    /// Length of the timed run in minutes.
    pub program_duration: i64,
}

impl ProgramSpec {
    /// Setup budget in seconds (one tick per second).
    pub fn setup_budget_seconds(&self) -> i64 {
        self.time_to_min_pressure * 60
    }

    /// Timed run length in seconds.
    pub fn duration_seconds(&self) -> i64 {
        self.program_duration * 60
    }

    /// Per-tick increase during setup.
    ///
    /// A zero budget falls back to [`FALLBACK_PRESSURE_INCREMENT`].
    pub fn pressure_increment(&self) -> f64 {
        let budget = self.setup_budget_seconds();
        if budget > 0 {
            self.min_pressure / budget as f64
        } else {
            FALLBACK_PRESSURE_INCREMENT
        }
    }

    /// Re-check the catalog constraints.
    ///
    /// A zero `time_to_min_pressure` is tolerated so the fallback ramp can
    /// drive it; negative budgets are rejected.
    pub fn validate(&self) -> Result<()> {
        if !self.min_pressure.is_finite() || self.min_pressure < 0.0 {
            return Err(invalid("min_pressure", "must be a non-negative number"));
        }
        if !self.max_pressure.is_finite() || self.max_pressure <= self.min_pressure {
            return Err(invalid("max_pressure", "must be greater than min_pressure"));
        }
        if self.max_pressure > MAX_PRESSURE_LIMIT {
            return Err(invalid("max_pressure", "must not exceed 200"));
        }
        if self.time_to_min_pressure < 0 {
            return Err(invalid("time_to_min_pressure", "must not be negative"));
        }
        if self.program_duration < 1 || self.program_duration < self.time_to_min_pressure {
            return Err(invalid(
                "program_duration",
                "must be at least 1 and at least time_to_min_pressure",
            ));
        }
        if self.program_duration > MAX_PROGRAM_DURATION_MINUTES {
            return Err(invalid("program_duration", "must not exceed 1440 minutes"));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> EngineError {
    EngineError::InvalidProgramParameters {
        field: field.to_string(),
        message: message.to_string(),
    }
}
