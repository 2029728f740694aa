// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::DEFAULT_PRESSURE_UNIT;
use crate::recovery::RecoveryConfig;

/// Presscontrol engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file
    pub database_path: PathBuf,
    /// Ticker period
    pub tick_interval: Duration,
    /// Ticks between reconciliation passes
    pub validation_interval_ticks: u64,
    /// Age after which open records are phantoms
    pub phantom_age_hours: i64,
    /// Age under which open records may be resumed
    pub resume_window_hours: i64,
    /// Authenticated operator, if any
    pub operator_id: Option<i64>,
    /// Seed for a reproducible running-phase walk
    pub rng_seed: Option<u64>,
    /// Unit shown in status lines and alarms
    pub pressure_unit: String,
    /// Program started right after startup recovery
    pub start_program: Option<i64>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `PRESSCONTROL_DATABASE_PATH`: SQLite database file
    ///
    /// Optional (with defaults):
    /// - `PRESSCONTROL_TICK_INTERVAL_MS`: ticker period (default: 1000)
    /// - `PRESSCONTROL_VALIDATION_INTERVAL_TICKS`: ticks between reconciliation passes (default: 30)
    /// - `PRESSCONTROL_PHANTOM_AGE_HOURS`: phantom sweep age (default: 24)
    /// - `PRESSCONTROL_RESUME_WINDOW_HOURS`: resumable window (default: 4)
    /// - `PRESSCONTROL_OPERATOR_ID`: authenticated operator (default: none)
    /// - `PRESSCONTROL_RNG_SEED`: random walk seed (default: entropy)
    /// - `PRESSCONTROL_PRESSURE_UNIT`: display unit (default: PSI)
    /// - `PRESSCONTROL_START_PROGRAM`: program to start after recovery (default: none)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_path = std::env::var("PRESSCONTROL_DATABASE_PATH")
            .map_err(|_| ConfigError::Missing("PRESSCONTROL_DATABASE_PATH"))?;

        let tick_interval_ms: u64 = positive("PRESSCONTROL_TICK_INTERVAL_MS", 1000)?;
        let validation_interval_ticks: u64 =
            positive("PRESSCONTROL_VALIDATION_INTERVAL_TICKS", 30)?;
        let phantom_age_hours: i64 = positive("PRESSCONTROL_PHANTOM_AGE_HOURS", 24)?;
        let resume_window_hours: i64 = positive("PRESSCONTROL_RESUME_WINDOW_HOURS", 4)?;

        let operator_id = optional("PRESSCONTROL_OPERATOR_ID", "must be an integer user id")?;
        let rng_seed = optional("PRESSCONTROL_RNG_SEED", "must be an unsigned integer")?;
        let start_program =
            optional("PRESSCONTROL_START_PROGRAM", "must be an integer program id")?;

        let pressure_unit = std::env::var("PRESSCONTROL_PRESSURE_UNIT")
            .ok()
            .filter(|unit| !unit.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PRESSURE_UNIT.to_string());

        Ok(Self {
            database_path: PathBuf::from(database_path),
            tick_interval: Duration::from_millis(tick_interval_ms),
            validation_interval_ticks,
            phantom_age_hours,
            resume_window_hours,
            operator_id,
            rng_seed,
            pressure_unit,
            start_program,
        })
    }

    /// Recovery thresholds derived from this configuration.
    pub fn recovery(&self) -> RecoveryConfig {
        RecoveryConfig {
            phantom_age: chrono::Duration::hours(self.phantom_age_hours),
            resume_window: chrono::Duration::hours(self.resume_window_hours),
        }
    }
}

fn positive<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let value = match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(var, "must be a positive integer"))?,
        Err(_) => default,
    };
    if value <= T::default() {
        return Err(ConfigError::Invalid(var, "must be greater than zero"));
    }
    Ok(value)
}

fn optional<T: FromStr>(var: &'static str, reason: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(var, reason)),
        _ => Ok(None),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
