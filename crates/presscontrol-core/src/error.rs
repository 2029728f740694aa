// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for presscontrol-core.
//!
//! One error type covers every engine, recovery and persistence operation so
//! callers can map each failure kind to their own user-facing message.

use std::fmt;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by the execution engine and its collaborators.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum EngineError {
    /// The current caller is not allowed to execute programs.
    PermissionDenied,

    /// An execution is already active.
    AlreadyRunning {
        /// The execution currently driven by the engine.
        execution_id: i64,
    },

    /// No execution is active.
    NotRunning,

    /// The program id does not resolve to an active program.
    ProgramNotFound {
        /// The program ID that was not found.
        program_id: i64,
    },

    /// A repository operation failed.
    PersistenceFailure {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Program parameters violate the catalog constraints.
    InvalidProgramParameters {
        /// The offending field.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// An unexpected fault inside the tick path.
    Internal {
        /// What went wrong.
        reason: String,
    },
}

impl EngineError {
    /// Shorthand for a persistence failure tagged with the operation name.
    pub fn persistence(operation: &str, details: impl Into<String>) -> Self {
        Self::PersistenceFailure {
            operation: operation.to_string(),
            details: details.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::AlreadyRunning { .. } => "ALREADY_RUNNING",
            Self::NotRunning => "NOT_RUNNING",
            Self::ProgramNotFound { .. } => "PROGRAM_NOT_FOUND",
            Self::PersistenceFailure { .. } => "PERSISTENCE_FAILURE",
            Self::InvalidProgramParameters { .. } => "INVALID_PROGRAM_PARAMETERS",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// True for repository failures.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::PersistenceFailure { .. })
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "Not allowed to execute programs"),
            Self::AlreadyRunning { execution_id } => {
                write!(f, "Execution {} is already running", execution_id)
            }
            Self::NotRunning => write!(f, "No execution is running"),
            Self::ProgramNotFound { program_id } => {
                write!(f, "Program {} not found", program_id)
            }
            Self::PersistenceFailure { operation, details } => {
                write!(f, "Persistence error during '{}': {}", operation, details)
            }
            Self::InvalidProgramParameters { field, message } => {
                write!(f, "Invalid program parameter '{}': {}", field, message)
            }
            Self::Internal { reason } => write!(f, "Internal engine fault: {}", reason),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::persistence("query", err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngineError::persistence("migrate", err.to_string())
    }
}
