// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for presscontrol-core.
//!
//! Embedded migrations that hosts can run programmatically before handing a
//! pool to [`SqlitePersistence::new`](crate::persistence::SqlitePersistence::new).
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use presscontrol_core::migrations;
//!
//! let pool = SqlitePool::connect("sqlite:pressure_control.db?mode=rwc").await?;
//! migrations::run_sqlite(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with all migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
