// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Presscontrol Core - Pressure Program Execution Engine
//!
//! This crate drives a pressure program through a setup ramp and a timed hold,
//! raises alarms when limits are violated, and survives process restarts by
//! reconciling in-memory state against persisted execution records.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐        events         ┌───────────────────┐
//! │  EngineRuntime (ticker)  │──────────────────────►│  subscribers/UI   │
//! └────────────┬─────────────┘                       └───────────────────┘
//!              │ tick() every interval
//!              ▼
//! ┌──────────────────────────┐   next pressure   ┌──────────────────────┐
//! │     ExecutionEngine      │──────────────────►│  controller (pure)   │
//! │   (phase state machine)  │   classify        ├──────────────────────┤
//! │                          │──────────────────►│  AlarmMonitor        │
//! └────────────┬─────────────┘                   └──────────────────────┘
//!              │ records / samples
//!              ▼
//! ┌──────────────────────────┐   startup + every N ticks
//! │  Persistence (SQLite)    │◄─────────── RecoveryManager
//! └──────────────────────────┘
//! ```
//!
//! # Phase State Machine
//!
//! ```text
//!        start                min reached              duration elapsed
//!  IDLE ───────► SETUP ─────────────────────► RUNNING ──────────────────► COMPLETED
//!                  │                             │
//!                  │            stop             │
//!                  └─────────────┬───────────────┘
//!                                ▼
//!                             STOPPED
//! ```
//!
//! Phases only move forward within one execution. Once the terminal status
//! is persisted the engine returns to idle and a new `start` creates a fresh
//! record.
//!
//! # Recovery
//!
//! | Record age | Action |
//! |------------|--------|
//! | younger than 4h | most recent one is resumed with an approximate state |
//! | 4h to 24h | left untouched |
//! | older than 24h | force-stopped as a phantom |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PRESSCONTROL_DATABASE_PATH` | Yes | - | SQLite database file |
//! | `PRESSCONTROL_TICK_INTERVAL_MS` | No | `1000` | Ticker period |
//! | `PRESSCONTROL_VALIDATION_INTERVAL_TICKS` | No | `30` | Ticks between reconciliation passes |
//! | `PRESSCONTROL_PHANTOM_AGE_HOURS` | No | `24` | Phantom sweep age |
//! | `PRESSCONTROL_RESUME_WINDOW_HOURS` | No | `4` | Resumable window |
//! | `PRESSCONTROL_OPERATOR_ID` | No | - | Authenticated operator user id |
//! | `PRESSCONTROL_RNG_SEED` | No | - | Seed for the running-phase walk |
//! | `PRESSCONTROL_PRESSURE_UNIT` | No | `PSI` | Display unit |
//! | `PRESSCONTROL_START_PROGRAM` | No | - | Program started after recovery (binary only) |
//!
//! # Modules
//!
//! - [`engine`]: the execution state machine
//! - [`controller`]: per-tick pressure computation
//! - [`alarm`]: threshold monitor
//! - [`recovery`]: phantom cleanup, resume and reconciliation
//! - [`persistence`]: execution repository contract and SQLite backend
//! - [`runtime`]: embeddable ticker host

#![deny(missing_docs)]

/// Threshold monitor evaluated once per tick.
pub mod alarm;

/// Configuration loaded from environment variables.
pub mod config;

/// Pure pressure computations for the setup ramp and the running walk.
pub mod controller;

/// The execution state machine.
pub mod engine;

/// Error types with stable error codes.
pub mod error;

/// Engine events, phases and the presentation snapshot.
pub mod events;

/// Collaborator contracts: auth gate, program catalog and clock.
pub mod gateway;

/// Embedded database migrations.
pub mod migrations;

/// Execution repository contract and the SQLite backend.
pub mod persistence;

/// Program parameters and their validation.
pub mod program;

/// Crash recovery and periodic reconciliation.
pub mod recovery;

/// Embeddable runtime hosting the engine behind an interval ticker.
pub mod runtime;

pub use engine::ExecutionEngine;
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EngineSnapshot, Phase};
pub use program::ProgramSpec;
pub use runtime::EngineRuntime;
