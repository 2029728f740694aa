// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for presscontrol-core.
//!
//! [`EngineRuntime`] hosts one [`ExecutionEngine`] inside an existing tokio
//! application: it runs startup recovery, drives the engine from a fixed
//! interval ticker, reconciles it with the store periodically and fans the
//! engine events out on a broadcast channel.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use presscontrol_core::gateway::OperatorSession;
//! use presscontrol_core::persistence::SqlitePersistence;
//! use presscontrol_core::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqlitePersistence::from_path("data/pressure_control.db").await?);
//!
//!     let runtime = EngineRuntime::builder()
//!         .sqlite(store)
//!         .auth(Arc::new(OperatorSession::authenticated(1)))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let mut events = runtime.subscribe();
//!     runtime.start_program(1).await?;
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::{DEFAULT_PRESSURE_UNIT, ExecutionEngine};
use crate::error::EngineError;
use crate::events::{EngineEvent, EngineSnapshot};
use crate::gateway::{AuthGate, Clock, ProgramCatalog, SystemClock};
use crate::persistence::{Persistence, SqlitePersistence};
use crate::recovery::{RecoveryConfig, RecoveryManager, RecoveryReport, ValidationOutcome};

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_VALIDATION_INTERVAL_TICKS: u64 = 30;
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    catalog: Option<Arc<dyn ProgramCatalog>>,
    auth: Option<Arc<dyn AuthGate>>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    validation_interval_ticks: u64,
    recovery: RecoveryConfig,
    rng_seed: Option<u64>,
    pressure_unit: String,
    event_capacity: usize,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("catalog", &self.catalog.as_ref().map(|_| "..."))
            .field("auth", &self.auth.as_ref().map(|_| "..."))
            .field("tick_interval", &self.tick_interval)
            .field("validation_interval_ticks", &self.validation_interval_ticks)
            .field("recovery", &self.recovery)
            .field("rng_seed", &self.rng_seed)
            .field("pressure_unit", &self.pressure_unit)
            .finish()
    }
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            catalog: None,
            auth: None,
            clock: Arc::new(SystemClock),
            tick_interval: DEFAULT_TICK_INTERVAL,
            validation_interval_ticks: DEFAULT_VALIDATION_INTERVAL_TICKS,
            recovery: RecoveryConfig::default(),
            rng_seed: None,
            pressure_unit: DEFAULT_PRESSURE_UNIT.to_string(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the execution repository (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the program catalog (required).
    pub fn catalog(mut self, catalog: Arc<dyn ProgramCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Use one SQLite store as both repository and catalog.
    pub fn sqlite(self, store: Arc<SqlitePersistence>) -> Self {
        self.persistence(store.clone()).catalog(store)
    }

    /// Set the auth gate consulted on start (required).
    pub fn auth(mut self, auth: Arc<dyn AuthGate>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Replace the wall clock.
    ///
    /// Default: [`SystemClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the ticker period.
    ///
    /// Default: 1 second
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set how many ticks pass between reconciliation passes.
    ///
    /// Default: 30
    pub fn validation_interval_ticks(mut self, ticks: u64) -> Self {
        self.validation_interval_ticks = ticks;
        self
    }

    /// Set the recovery thresholds.
    pub fn recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    /// Seed the running-phase walk.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Set the display unit.
    ///
    /// Default: `PSI`
    pub fn pressure_unit(mut self, unit: impl Into<String>) -> Self {
        self.pressure_unit = unit.into();
        self
    }

    /// Set the broadcast channel capacity.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Apply the tunables from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.tick_interval = config.tick_interval;
        self.validation_interval_ticks = config.validation_interval_ticks;
        self.recovery = config.recovery();
        self.rng_seed = config.rng_seed;
        self.pressure_unit = config.pressure_unit.clone();
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or an interval is zero.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let catalog = self
            .catalog
            .ok_or_else(|| anyhow::anyhow!("catalog is required"))?;
        let auth = self
            .auth
            .ok_or_else(|| anyhow::anyhow!("auth gate is required"))?;

        if self.tick_interval.is_zero() {
            anyhow::bail!("tick interval must be greater than zero");
        }
        if self.validation_interval_ticks == 0 {
            anyhow::bail!("validation interval must be greater than zero");
        }
        if self.event_capacity == 0 {
            anyhow::bail!("event capacity must be greater than zero");
        }

        let mut engine = ExecutionEngine::new(persistence, catalog, auth, self.clock)
            .with_pressure_unit(self.pressure_unit);
        if let Some(seed) = self.rng_seed {
            engine = engine.with_seed(seed);
        }

        Ok(EngineRuntimeConfig {
            engine,
            tick_interval: self.tick_interval,
            validation_interval_ticks: self.validation_interval_ticks,
            recovery: self.recovery,
            event_capacity: self.event_capacity,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    engine: ExecutionEngine,
    tick_interval: Duration,
    validation_interval_ticks: u64,
    recovery: RecoveryConfig,
    event_capacity: usize,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("engine", &"...")
            .field("tick_interval", &self.tick_interval)
            .field("validation_interval_ticks", &self.validation_interval_ticks)
            .field("recovery", &self.recovery)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Run startup recovery, then spawn the ticker task.
    pub async fn start(self) -> Result<EngineRuntime> {
        let mut engine = self.engine;
        let recovery = RecoveryManager::for_engine(&engine).with_config(self.recovery);
        let report = recovery.recover(&mut engine).await?;

        info!(
            phantoms_cleaned = report.phantoms_cleaned,
            resumed_execution_id = ?report.resumed_execution_id,
            "Startup recovery finished"
        );

        let (events, _) = broadcast::channel(self.event_capacity);
        let shared = Arc::new(Shared {
            engine: Mutex::new(engine),
            recovery,
            events,
        });
        shared.publish(report.events.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ticker_handle = tokio::spawn(run_ticker(
            shared.clone(),
            self.tick_interval,
            self.validation_interval_ticks,
            shutdown_rx,
        ));

        info!(
            tick_interval_ms = self.tick_interval.as_millis() as u64,
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            ticker_handle,
            shutdown_tx,
            shared,
            recovery_report: report,
        })
    }
}

struct Shared {
    engine: Mutex<ExecutionEngine>,
    recovery: RecoveryManager,
    events: broadcast::Sender<EngineEvent>,
}

impl Shared {
    fn publish(&self, events: Vec<EngineEvent>) {
        for event in events {
            // no subscribers is fine
            let _ = self.events.send(event);
        }
    }
}

/// A running engine host that can be embedded in an application.
///
/// The runtime manages:
/// - the interval ticker driving the engine
/// - periodic reconciliation with the store
/// - event fan-out to subscribers
///
/// An execution that is active at shutdown keeps its `running` record and is
/// picked up by recovery on the next start. Call [`shutdown`](Self::shutdown)
/// for graceful termination.
pub struct EngineRuntime {
    ticker_handle: JoinHandle<Result<()>>,
    shutdown_tx: watch::Sender<bool>,
    shared: Arc<Shared>,
    recovery_report: RecoveryReport,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Receive engine events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// What startup recovery did.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery_report
    }

    /// Start a program. Returns the new execution id.
    pub async fn start_program(&self, program_id: i64) -> Result<i64, EngineError> {
        let mut engine = self.shared.engine.lock().await;
        let events = engine.start(program_id).await?;
        let execution_id = engine
            .state()
            .map(|state| state.record().id)
            .ok_or_else(|| EngineError::Internal {
                reason: "engine idle right after start".to_string(),
            })?;
        drop(engine);
        self.shared.publish(events);
        Ok(execution_id)
    }

    /// Stop the active execution manually.
    pub async fn stop_program(&self) -> Result<(), EngineError> {
        let events = self.shared.engine.lock().await.stop(true).await?;
        self.shared.publish(events);
        Ok(())
    }

    /// Current engine snapshot.
    pub async fn snapshot(&self) -> EngineSnapshot {
        self.shared.engine.lock().await.snapshot()
    }

    /// Reconcile the engine with the store now.
    pub async fn validate(&self) -> Result<ValidationOutcome, EngineError> {
        let mut engine = self.shared.engine.lock().await;
        let (outcome, events) = self
            .shared
            .recovery
            .validate_execution_state(&mut engine)
            .await?;
        drop(engine);
        self.shared.publish(events);
        Ok(outcome)
    }

    /// Run phantom cleanup and resume again.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut engine = self.shared.engine.lock().await;
        let report = self.shared.recovery.recover(&mut engine).await?;
        drop(engine);
        self.shared.publish(report.events.clone());
        Ok(report)
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the ticker to stop and waits for it to complete.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);

        match self.ticker_handle.await {
            Ok(Ok(())) => {
                info!("EngineRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("EngineRuntime ticker error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("EngineRuntime ticker task panicked: {}", e);
                Err(anyhow::anyhow!("ticker task panicked: {}", e))
            }
        }
    }

    /// Check if the ticker is still running.
    pub fn is_running(&self) -> bool {
        !self.ticker_handle.is_finished()
    }
}

/// Drive the engine until shutdown is signalled.
async fn run_ticker(
    shared: Arc<Shared>,
    tick_interval: Duration,
    validation_interval_ticks: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;

    let mut active_ticks: u64 = 0;

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Ticker received shutdown signal");
                    break;
                }
            }

            _ = interval.tick() => {
                let mut engine = shared.engine.lock().await;
                if !engine.is_running() {
                    continue;
                }

                let mut events = engine.tick().await;
                active_ticks += 1;

                if active_ticks % validation_interval_ticks == 0 && engine.is_running() {
                    match shared.recovery.validate_execution_state(&mut engine).await {
                        Ok((outcome, mut reconciled)) => {
                            debug!(?outcome, "Periodic validation");
                            events.append(&mut reconciled);
                        }
                        Err(e) => warn!(error = %e, "Periodic validation failed"),
                    }
                }

                let still_running = engine.is_running();
                drop(engine);
                shared.publish(events);

                if !still_running {
                    active_ticks = 0;
                }
            }
        }
    }

    let engine = shared.engine.lock().await;
    if let Some(state) = engine.state() {
        info!(
            execution_id = state.record().id,
            "Leaving active execution for recovery on next start"
        );
    }
    Ok(())
}
