// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for startup recovery and periodic reconciliation.

mod common;

use chrono::Duration;

use common::*;
use presscontrol_core::events::{EngineEvent, Phase};
use presscontrol_core::persistence::{ExecutionStatus, Persistence};
use presscontrol_core::recovery::{
    INVALID_PROGRAM_NOTE, PHANTOM_CLEANUP_NOTE, RecoveryConfig, ValidationOutcome,
};

#[tokio::test]
async fn test_phantom_record_is_force_stopped() {
    let ctx = TestContext::new().await;
    let program_id = ctx.create_program("Phantom", 20.0, 60.0, 5, 30).await;
    let phantom = ctx
        .create_open_record(program_id, Duration::hours(25), true)
        .await;

    let recovery = ctx.recovery();
    assert_eq!(recovery.clean_phantom_executions().await.unwrap(), 1);

    let record = ctx.record(phantom.id).await;
    assert_eq!(record.status, ExecutionStatus::Stopped);
    assert!(record.stopped_manually);
    assert_eq!(record.end_time, Some(ctx.clock_now()));
    assert_eq!(record.notes.as_deref(), Some(PHANTOM_CLEANUP_NOTE));
    // flags survive the cleanup
    assert!(record.min_pressure_reached);

    assert_eq!(recovery.clean_phantom_executions().await.unwrap(), 0);
}

#[tokio::test]
async fn test_phantom_cleanup_ignores_closed_and_young_records() {
    let ctx = TestContext::new().await;
    let program_id = ctx.create_program("Mixed", 20.0, 60.0, 5, 30).await;

    let mut closed = ctx
        .create_open_record(program_id, Duration::hours(48), false)
        .await;
    closed.status = ExecutionStatus::Completed;
    closed.end_time = Some(ctx.clock_now() - Duration::hours(47));
    ctx.store.update_execution(&closed).await.unwrap();

    let boundary = ctx
        .create_open_record(program_id, Duration::hours(24), false)
        .await;
    let young = ctx
        .create_open_record(program_id, Duration::hours(5), false)
        .await;

    assert_eq!(ctx.recovery().clean_phantom_executions().await.unwrap(), 0);

    assert_eq!(ctx.record(closed.id).await, closed);
    assert!(ctx.record(boundary.id).await.is_open());
    assert!(ctx.record(young.id).await.is_open());
}

#[tokio::test]
async fn test_resume_running_execution() {
    let ctx = TestContext::new().await;
    let program_id = ctx.create_program("Scenario E", 20.0, 60.0, 5, 30).await;
    let record = ctx
        .create_open_record(program_id, Duration::hours(1), true)
        .await;

    let mut engine = ctx.engine();
    let recovery = ctx.recovery();
    let resumable = recovery
        .check_for_incomplete_execution()
        .await
        .unwrap()
        .expect("recent record should be resumable");
    assert_eq!(resumable.record.id, record.id);

    let events = recovery.resume_execution(&mut engine, resumable).await.unwrap();
    assert_eq!(
        events[..2],
        [
            EngineEvent::Started {
                execution_id: record.id
            },
            EngineEvent::PhaseChanged {
                phase: Phase::Running
            },
        ]
    );

    let state = engine.state().unwrap();
    assert_eq!(state.phase(), Phase::Running);
    assert!((state.current_pressure() - (20.0 + 0.6 * 40.0)).abs() < 1e-9);
    assert_eq!(
        state.program_start_time(),
        Some(record.start_time + Duration::minutes(5))
    );
}

#[tokio::test]
async fn test_resumed_execution_completes_on_wall_clock() {
    let ctx = TestContext::new().await;
    // 5 min setup + 30 min run; the record is 40 minutes old
    let program_id = ctx.create_program("Overdue", 20.0, 60.0, 5, 30).await;
    let record = ctx
        .create_open_record(program_id, Duration::minutes(40), true)
        .await;

    let mut engine = ctx.engine();
    let report = ctx.recovery().recover(&mut engine).await.unwrap();
    assert_eq!(report.resumed_execution_id, Some(record.id));

    let events = ctx.tick(&mut engine).await;
    assert!(events.contains(&EngineEvent::Finished {
        execution_id: record.id,
        status: ExecutionStatus::Completed
    }));
    assert!(!engine.is_running());
    assert_eq!(ctx.record(record.id).await.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_resume_setup_execution_continues_ramp() {
    let ctx = TestContext::new().await;
    let program_id = ctx.create_program("Ramp", 20.0, 60.0, 5, 30).await;
    let record = ctx
        .create_open_record(program_id, Duration::seconds(240), false)
        .await;

    let mut engine = ctx.engine();
    ctx.recovery().recover(&mut engine).await.unwrap();

    let state = engine.state().unwrap();
    assert_eq!(state.phase(), Phase::Setup);
    assert!((state.current_pressure() - 16.0).abs() < 1e-9);
    assert_eq!(state.elapsed_ticks(), 240);

    // 4 PSI left at 1/15 PSI per tick
    let mut ticks = 0;
    while engine.phase() == Phase::Setup {
        ctx.tick(&mut engine).await;
        ticks += 1;
        assert!(ticks <= 61, "setup did not finish");
    }
    assert!(ctx.record(record.id).await.min_pressure_reached);
}

#[tokio::test]
async fn test_gap_record_is_neither_resumed_nor_cleaned() {
    let ctx = TestContext::new().await;
    let program_id = ctx.create_program("Gap", 20.0, 60.0, 5, 30).await;
    let gap = ctx
        .create_open_record(program_id, Duration::hours(6), true)
        .await;

    let mut engine = ctx.engine();
    let report = ctx.recovery().recover(&mut engine).await.unwrap();

    assert_eq!(report.phantoms_cleaned, 0);
    assert_eq!(report.resumed_execution_id, None);
    assert!(!engine.is_running());
    assert_eq!(ctx.record(gap.id).await, gap);

    // once it crosses the phantom age the sweep picks it up
    ctx.clock.advance(Duration::hours(19));
    assert_eq!(ctx.recovery().clean_phantom_executions().await.unwrap(), 1);
    assert_eq!(ctx.record(gap.id).await.status, ExecutionStatus::Stopped);
}

#[tokio::test]
async fn test_only_most_recent_record_is_resumed() {
    let ctx = TestContext::new().await;
    let program_id = ctx.create_program("Twice", 20.0, 60.0, 5, 30).await;
    let older = ctx
        .create_open_record(program_id, Duration::hours(2), true)
        .await;
    let newer = ctx
        .create_open_record(program_id, Duration::minutes(30), true)
        .await;

    let mut engine = ctx.engine();
    let report = ctx.recovery().recover(&mut engine).await.unwrap();

    assert_eq!(report.resumed_execution_id, Some(newer.id));
    // the older one is left for the phantom sweep
    assert!(ctx.record(older.id).await.is_open());

    // a second recovery pass while the engine is busy does not re-attach
    let again = ctx.recovery().recover(&mut engine).await.unwrap();
    assert_eq!(again.resumed_execution_id, None);
}

#[tokio::test]
async fn test_missing_program_closes_recent_record() {
    let ctx = TestContext::new().await;
    let program_id = ctx.create_program("Gone", 20.0, 60.0, 5, 30).await;
    let record = ctx
        .create_open_record(program_id, Duration::minutes(10), false)
        .await;
    ctx.deactivate_program(program_id).await;

    let mut engine = ctx.engine();
    let report = ctx.recovery().recover(&mut engine).await.unwrap();
    assert_eq!(report.resumed_execution_id, None);

    let closed = ctx.record(record.id).await;
    assert_eq!(closed.status, ExecutionStatus::Stopped);
    assert!(closed.stopped_manually);
    assert!(closed.notes.is_some());
}

#[tokio::test]
async fn test_invalid_program_closes_recent_record() {
    let ctx = TestContext::new().await;
    let program_id = ctx.create_program("Overrated", 20.0, 250.0, 5, 30).await;
    let record = ctx
        .create_open_record(program_id, Duration::hours(1), true)
        .await;

    let mut engine = ctx.engine();
    let report = ctx.recovery().recover(&mut engine).await.unwrap();
    assert_eq!(report.resumed_execution_id, None);
    assert!(!engine.is_running());

    let closed = ctx.record(record.id).await;
    assert_eq!(closed.status, ExecutionStatus::Stopped);
    assert!(closed.stopped_manually);
    assert_eq!(closed.end_time, Some(ctx.clock_now()));
    assert_eq!(closed.notes.as_deref(), Some(INVALID_PROGRAM_NOTE));

    // the next start comes up clean
    let again = ctx.recovery().recover(&mut engine).await.unwrap();
    assert_eq!(again.resumed_execution_id, None);
    assert_eq!(again.phantoms_cleaned, 0);
}

#[tokio::test]
async fn test_custom_windows() {
    let ctx = TestContext::new().await;
    let program_id = ctx.create_program("Windows", 20.0, 60.0, 5, 30).await;
    let record = ctx
        .create_open_record(program_id, Duration::hours(3), false)
        .await;

    let recovery = ctx.recovery().with_config(RecoveryConfig {
        phantom_age: Duration::hours(2),
        resume_window: Duration::hours(1),
    });
    assert_eq!(recovery.clean_phantom_executions().await.unwrap(), 1);
    assert!(!ctx.record(record.id).await.is_open());
}

#[tokio::test]
async fn test_validation_detects_deleted_record() {
    let ctx = TestContext::new().await;
    let program_id = ctx.create_program("Deleted", 20.0, 60.0, 5, 30).await;
    let mut engine = ctx.engine();
    engine.start(program_id).await.unwrap();
    let execution_id = engine.state().unwrap().record().id;

    sqlx::query("DELETE FROM program_executions WHERE id = ?")
        .bind(execution_id)
        .execute(ctx.store.pool())
        .await
        .unwrap();

    let (outcome, events) = ctx
        .recovery()
        .validate_execution_state(&mut engine)
        .await
        .unwrap();
    assert_eq!(outcome, ValidationOutcome::RecordMissing { execution_id });
    assert_eq!(phase_changes(&events), vec![Phase::Idle]);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_validation_is_quiet_when_consistent() {
    let ctx = TestContext::new().await;
    let program_id = ctx.create_program("Quiet", 20.0, 60.0, 5, 30).await;
    let mut engine = ctx.engine();
    engine.start(program_id).await.unwrap();

    for _ in 0..30 {
        ctx.tick(&mut engine).await;
    }
    let (outcome, events) = ctx
        .recovery()
        .validate_execution_state(&mut engine)
        .await
        .unwrap();
    assert_eq!(outcome, ValidationOutcome::Consistent);
    assert!(events.is_empty());
    assert_eq!(engine.phase(), Phase::Setup);
}
