// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pressure controller.
//!
//! Pure functions: no clock, no randomness, no persistence. The engine owns
//! the random source and passes the draw in.

use std::ops::Range;

use crate::program::ProgramSpec;

/// Range of the per-tick running-phase draw. Biased upward.
pub const RUNNING_DRAW: Range<f64> = -0.8..1.2;

/// Lower clamp of the running walk, as a fraction of `min_pressure`.
pub const RUNNING_FLOOR_FACTOR: f64 = 0.9;

/// Upper clamp of the running walk, as a fraction of `max_pressure`.
pub const RUNNING_CEILING_FACTOR: f64 = 1.1;

/// Relative distance under which the setup ramp snaps onto its target.
const SETUP_SNAP_EPSILON: f64 = 1e-9;

/// Next setup pressure: one increment toward `min_pressure`, never past it.
pub fn setup_step(current: f64, increment: f64, min_pressure: f64) -> f64 {
    let next = (current + increment).min(min_pressure);
    // accumulated float error must not cost an extra tick at the target
    if min_pressure - next <= SETUP_SNAP_EPSILON * min_pressure.max(1.0) {
        min_pressure
    } else {
        next
    }
}

/// Next running pressure for a given draw from [`RUNNING_DRAW`].
///
/// The clamp band is 10% wider than `[min, max]` so excursions can raise
/// alarms without being discarded.
pub fn running_step(current: f64, draw: f64, program: &ProgramSpec) -> f64 {
    let (floor, ceiling) = running_band(program);
    (current + draw).clamp(floor, ceiling)
}

/// Clamp band of the running walk.
pub fn running_band(program: &ProgramSpec) -> (f64, f64) {
    (
        program.min_pressure * RUNNING_FLOOR_FACTOR,
        program.max_pressure * RUNNING_CEILING_FACTOR,
    )
}
