// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collaborator contracts consumed by the engine.
//!
//! Credential checks, the program catalog and wall-clock time live outside
//! the engine. These traits are the narrow surface it depends on.

use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::EngineError;
use crate::program::ProgramSpec;

/// Authorization gate consulted on `start()`.
pub trait AuthGate: Send + Sync {
    /// Whether the current caller may execute programs.
    fn can_execute_programs(&self) -> bool;

    /// Id of the authenticated user, if any.
    fn current_user_id(&self) -> Option<i64>;
}

/// Read-only program lookup.
#[async_trait]
pub trait ProgramCatalog: Send + Sync {
    /// Resolve an active program by id.
    async fn get_program(&self, id: i64) -> Result<Option<ProgramSpec>, EngineError>;
}

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used by tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Operator session of the host process.
///
/// Any authenticated user may execute programs.
#[derive(Debug, Default)]
pub struct OperatorSession {
    user_id: RwLock<Option<i64>>,
}

impl OperatorSession {
    /// Session with nobody logged in.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Session already authenticated as `user_id`.
    pub fn authenticated(user_id: i64) -> Self {
        Self {
            user_id: RwLock::new(Some(user_id)),
        }
    }

    /// Mark `user_id` as the authenticated operator.
    pub fn login(&self, user_id: i64) {
        *self.user_id.write().unwrap_or_else(|e| e.into_inner()) = Some(user_id);
    }

    /// Clear the session.
    pub fn logout(&self) {
        *self.user_id.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl AuthGate for OperatorSession {
    fn can_execute_programs(&self) -> bool {
        self.current_user_id().is_some()
    }

    fn current_user_id(&self) -> Option<i64> {
        *self.user_id.read().unwrap_or_else(|e| e.into_inner())
    }
}
