//! Run lifecycle tests: dispatch bound, dependency ordering, pause,
//! resume, stop with cancellation, and failure semantics.

use lattice::core::{Readiness, TaskStatus};
use lattice::orchestration::{ExecutionOutcome, RunState, TaskUpdate};

use crate::fixtures::TestEngine;

#[tokio::test]
async fn dispatch_respects_concurrency_bound() {
    let engine = TestEngine::spawn(2);
    for i in 0..3 {
        engine
            .handle
            .create_task(&format!("t{}", i), None)
            .await
            .unwrap();
    }

    let status = engine.handle.start().await.unwrap();

    // Exactly 2 dispatched, the third still ready and queued.
    assert_eq!(status.state, RunState::Running);
    assert_eq!(engine.dispatched().len(), 2);
    assert_eq!(status.plan.ready_tasks().len(), 1);

    // A completion frees a slot; the queued task goes out next.
    let first = engine.dispatched()[0];
    engine.report(first, ExecutionOutcome::Completed).await;

    let dispatched = engine.dispatched();
    assert_eq!(dispatched.len(), 3);
    let queued = dispatched[2];
    assert!(!dispatched[..2].contains(&queued));
}

#[tokio::test]
async fn chain_executes_in_dependency_order() {
    let engine = TestEngine::spawn(4);
    let tasks = engine.create_chain(&["root", "middle", "leaf"]).await;

    engine.handle.start().await.unwrap();

    // Only the root is dispatchable at first.
    assert_eq!(engine.dispatched(), vec![tasks[0].id]);

    engine.report(tasks[0].id, ExecutionOutcome::Completed).await;
    assert_eq!(engine.dispatched(), vec![tasks[0].id, tasks[1].id]);

    engine.report(tasks[1].id, ExecutionOutcome::Completed).await;
    assert_eq!(
        engine.dispatched(),
        vec![tasks[0].id, tasks[1].id, tasks[2].id]
    );

    engine.report(tasks[2].id, ExecutionOutcome::Completed).await;

    let status = engine.handle.status().await.unwrap();
    assert_eq!(status.state, RunState::Idle);
    assert!(status.plan.all_settled());
}

#[tokio::test]
async fn externally_started_task_does_not_consume_budget() {
    let engine = TestEngine::spawn(1);
    let a = engine.handle.create_task("external", None).await.unwrap();
    engine.handle.create_task("scheduled", None).await.unwrap();

    // A user marks one task in-progress outside any run.
    engine
        .handle
        .update_task(
            a.id,
            TaskUpdate {
                status: Some(TaskStatus::InProgress),
                ..TaskUpdate::default()
            },
        )
        .await
        .unwrap();

    let status = engine.handle.start().await.unwrap();

    // The external task is reflected as in-progress but the whole budget
    // is still available for the orchestrator's own dispatch.
    assert_eq!(
        status.plan.readiness(a.id),
        Some(&Readiness::InProgress)
    );
    assert_eq!(engine.dispatched().len(), 1);
    assert_ne!(engine.dispatched()[0], a.id);
}

#[tokio::test]
async fn pause_holds_queue_resume_drains_it() {
    let engine = TestEngine::spawn(1);
    for i in 0..2 {
        engine
            .handle
            .create_task(&format!("t{}", i), None)
            .await
            .unwrap();
    }
    engine.handle.start().await.unwrap();
    assert_eq!(engine.dispatched().len(), 1);

    let status = engine.handle.pause().await.unwrap();
    assert_eq!(status.state, RunState::Paused);

    // Freed slot is not refilled while paused.
    let first = engine.dispatched()[0];
    engine.report(first, ExecutionOutcome::Completed).await;
    assert_eq!(engine.dispatched().len(), 1);

    let status = engine.handle.resume().await.unwrap();
    assert_eq!(status.state, RunState::Running);
    assert_eq!(engine.dispatched().len(), 2);
}

#[tokio::test]
async fn stop_cancels_in_flight_and_returns_to_idle() {
    let engine = TestEngine::spawn(2);
    engine.handle.create_task("a", None).await.unwrap();
    engine.handle.create_task("b", None).await.unwrap();
    engine.handle.start().await.unwrap();

    let dispatched = engine.dispatched();
    let tokens: Vec<_> = dispatched
        .iter()
        .map(|id| engine.token_for(*id).unwrap())
        .collect();

    // Stop resolves via acknowledgement from both tasks.
    let stopper = {
        let handle = engine.handle.clone();
        tokio::spawn(async move { handle.stop().await })
    };
    tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;

    // Cancellation was signalled to every in-flight task.
    assert!(tokens.iter().all(|t| t.is_cancelled()));

    for id in &dispatched {
        engine.report(*id, ExecutionOutcome::Cancelled).await;
    }

    let status = stopper.await.unwrap().unwrap();
    assert_eq!(status.state, RunState::Idle);

    // Abandoned work returned to todo: both tasks are ready again.
    let status = engine.handle.status().await.unwrap();
    assert_eq!(status.plan.ready_tasks().len(), 2);
}

#[tokio::test]
async fn stop_timeout_forces_idle_without_acknowledgement() {
    let engine = TestEngine::spawn(1);
    engine.handle.create_task("stuck", None).await.unwrap();
    engine.handle.start().await.unwrap();

    // No report ever arrives; the bounded timeout fires.
    let status = engine.handle.stop().await.unwrap();
    assert_eq!(status.state, RunState::Idle);
}

#[tokio::test]
async fn no_new_dispatch_while_stopping() {
    let engine = TestEngine::spawn(1);
    engine.handle.create_task("a", None).await.unwrap();
    engine.handle.create_task("b", None).await.unwrap();
    engine.handle.start().await.unwrap();

    let first = engine.dispatched()[0];
    let stopper = {
        let handle = engine.handle.clone();
        tokio::spawn(async move { handle.stop().await })
    };
    tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;

    // The slot frees while stopping, but nothing new is dispatched.
    engine.report(first, ExecutionOutcome::Cancelled).await;
    stopper.await.unwrap().unwrap();
    assert_eq!(engine.dispatched().len(), 1);
}

#[tokio::test]
async fn failed_task_keeps_status_and_is_not_retried() {
    let engine = TestEngine::spawn(2);
    let flaky = engine.handle.create_task("flaky", None).await.unwrap();
    engine.handle.create_task("steady", None).await.unwrap();
    engine.handle.start().await.unwrap();

    engine
        .report(
            flaky.id,
            ExecutionOutcome::Failed {
                error: "exit 1".to_string(),
            },
        )
        .await;

    // Status untouched: still in_progress until the caller decides.
    let status = engine.handle.status().await.unwrap();
    assert_eq!(
        status.plan.readiness(flaky.id),
        Some(&Readiness::InProgress)
    );

    // And no automatic retry happened.
    let count = engine
        .dispatched()
        .iter()
        .filter(|id| **id == flaky.id)
        .count();
    assert_eq!(count, 1);

    // The caller resets it to todo; it is ready again but this run has
    // already attempted it, so it stays queued until a fresh start.
    engine
        .handle
        .update_task(
            flaky.id,
            TaskUpdate {
                status: Some(TaskStatus::Todo),
                ..TaskUpdate::default()
            },
        )
        .await
        .unwrap();
    let count = engine
        .dispatched()
        .iter()
        .filter(|id| **id == flaky.id)
        .count();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn review_outcome_parks_task_and_frees_slot() {
    let engine = TestEngine::spawn(1);
    engine.handle.create_task("review-me", None).await.unwrap();
    engine.handle.create_task("next", None).await.unwrap();
    engine.handle.start().await.unwrap();

    let reviewed = engine.dispatched()[0];
    engine
        .report(reviewed, ExecutionOutcome::AwaitingReview)
        .await;

    let status = engine.handle.status().await.unwrap();
    // Parked in review with no unfinished dependencies: readiness is
    // ready, but the run does not re-dispatch it.
    assert_eq!(status.plan.readiness(reviewed), Some(&Readiness::Ready));
    assert_eq!(engine.dispatched().len(), 2);
    assert_eq!(
        engine
            .dispatched()
            .iter()
            .filter(|id| **id == reviewed)
            .count(),
        1
    );
}

#[tokio::test]
async fn rejected_edge_leaves_edge_set_unchanged() {
    let engine = TestEngine::spawn(2);
    let a = engine.handle.create_task("a", None).await.unwrap();
    let b = engine.handle.create_task("b", None).await.unwrap();
    let c = engine.handle.create_task("c", None).await.unwrap();

    // b depends on a, c depends on b.
    engine.handle.add_edge(b.id, a.id, None).await.unwrap();
    engine.handle.add_edge(c.id, b.id, None).await.unwrap();
    let before = engine.handle.edges().await.unwrap();

    // a depending on c would close the loop.
    let rejected = engine.handle.add_edge(a.id, c.id, None).await;
    assert!(rejected.unwrap_err().is_conflict());

    let after = engine.handle.edges().await.unwrap();
    assert_eq!(before.len(), 2);
    assert_eq!(
        before.iter().map(|e| e.id).collect::<Vec<_>>(),
        after.iter().map(|e| e.id).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn control_calls_reject_invalid_transitions() {
    let engine = TestEngine::spawn(1);
    engine.handle.create_task("t", None).await.unwrap();

    assert!(engine.handle.pause().await.is_err());
    assert!(engine.handle.resume().await.is_err());
    assert!(engine.handle.stop().await.is_err());

    engine.handle.start().await.unwrap();
    assert!(engine.handle.start().await.is_err());
    assert!(engine.handle.resume().await.is_err());
}
