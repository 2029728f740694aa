// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Presscontrol Core - Pressure Program Execution Engine
//!
//! Standalone host:
//! - opens (and migrates) the SQLite store
//! - runs startup recovery and drives the engine ticker
//! - logs every engine event
//!
//! Programs are started by embedding applications through
//! [`EngineRuntime::start_program`]; `PRESSCONTROL_START_PROGRAM` starts one
//! directly for unattended runs.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use presscontrol_core::config::Config;
use presscontrol_core::events::{AlarmSeverity, EngineEvent};
use presscontrol_core::gateway::OperatorSession;
use presscontrol_core::persistence::{Persistence, SqlitePersistence};
use presscontrol_core::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("presscontrol_core=info".parse()?),
        )
        .init();

    info!("Starting Presscontrol Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        database = %config.database_path.display(),
        tick_interval_ms = config.tick_interval.as_millis() as u64,
        validation_interval_ticks = config.validation_interval_ticks,
        operator_id = ?config.operator_id,
        "Configuration loaded"
    );

    // Open database (creates file and runs migrations)
    let store = Arc::new(SqlitePersistence::from_path(&config.database_path).await?);
    let healthy = store.health_check_db().await?;
    info!(healthy, "Database health check passed");

    let session = Arc::new(match config.operator_id {
        Some(user_id) => OperatorSession::authenticated(user_id),
        None => {
            warn!("No operator configured, program execution is disabled");
            OperatorSession::anonymous()
        }
    });

    let runtime = EngineRuntime::builder()
        .sqlite(store)
        .auth(session)
        .config(&config)
        .build()?
        .start()
        .await?;

    let report = runtime.recovery_report();
    info!(
        phantoms_cleaned = report.phantoms_cleaned,
        resumed = ?report.resumed_execution_id,
        "Presscontrol Core initialized successfully"
    );

    let mut events = runtime.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Some(program_id) = config.start_program {
        match runtime.start_program(program_id).await {
            Ok(execution_id) => info!(program_id, execution_id, "Program started"),
            Err(e) => error!(program_id, code = e.error_code(), "Failed to start program: {}", e),
        }
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    logger.abort();
    info!("Shutdown complete");

    Ok(())
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::AlarmTriggered(alarm) if alarm.severity == AlarmSeverity::Warning => {
            warn!(alarm = %alarm.message, "Alarm");
        }
        EngineEvent::AlarmTriggered(alarm) => info!(alarm = %alarm.message, "Alarm"),
        EngineEvent::StatusUpdated { message } => info!("{}", message),
        EngineEvent::PressureUpdated { .. } | EngineEvent::ProgressUpdated { .. } => {
            tracing::debug!(?event, "Engine event");
        }
        other => info!(event = ?other, "Engine event"),
    }
}
