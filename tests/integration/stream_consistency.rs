//! Change stream tests: a subscriber applying patches in arrival order
//! reconstructs canonical state at every step.

use lattice::core::TaskStatus;
use lattice::orchestration::orchestrator::EngineEvent;
use lattice::orchestration::{ExecutionOutcome, RunState, TaskUpdate};
use lattice::sync::stream::StreamPayload;

use crate::fixtures::TestEngine;

#[tokio::test]
async fn subscriber_mirror_tracks_mutations() {
    let engine = TestEngine::spawn(2);
    let mut client = engine.handle.subscribe().await.unwrap();
    assert!(client.snapshot().tasks.is_empty());

    let a = engine.handle.create_task("a", None).await.unwrap();
    let b = engine.handle.create_task("b", None).await.unwrap();
    let edge = engine.handle.add_edge(b.id, a.id, None).await.unwrap();

    // Drain every pending message (patch batches interleaved with
    // plan-update events).
    loop {
        match tokio::time::timeout(
            tokio::time::Duration::from_millis(100),
            client.sync(),
        )
        .await
        {
            Ok(msg) => {
                msg.unwrap();
            }
            Err(_) => break,
        }
    }

    let mirror = client.snapshot();
    assert_eq!(mirror.tasks.len(), 2);
    assert_eq!(mirror.edges.len(), 1);
    assert_eq!(mirror.edges[0].id, edge.id);
    assert_eq!(
        mirror.plan,
        engine.handle.status().await.unwrap().plan
    );
}

#[tokio::test]
async fn late_subscriber_gets_atomic_snapshot() {
    let engine = TestEngine::spawn(2);
    let a = engine.handle.create_task("a", None).await.unwrap();
    let b = engine.handle.create_task("b", None).await.unwrap();
    engine.handle.add_edge(b.id, a.id, None).await.unwrap();

    // Subscribing after the fact: the snapshot already holds everything.
    let client = engine.handle.subscribe().await.unwrap();
    let snapshot = client.snapshot();

    assert_eq!(snapshot.tasks.len(), 2);
    assert_eq!(snapshot.edges.len(), 1);
    assert_eq!(snapshot.run_state, RunState::Idle);
    assert_eq!(snapshot.plan.ready_tasks(), vec![a.id]);
}

#[tokio::test]
async fn mirror_equals_canonical_at_every_patch_point() {
    let engine = TestEngine::spawn(1);
    let mut client = engine.handle.subscribe().await.unwrap();

    let a = engine.handle.create_task("a", None).await.unwrap();
    let b = engine.handle.create_task("b", None).await.unwrap();
    engine.handle.add_edge(b.id, a.id, None).await.unwrap();
    engine
        .handle
        .update_task(
            a.id,
            TaskUpdate {
                status: Some(TaskStatus::Done),
                ..TaskUpdate::default()
            },
        )
        .await
        .unwrap();
    engine.handle.delete_task(b.id).await.unwrap();

    // After draining every pending message the mirror must equal the
    // coordinator's own snapshot (fetched as a fresh subscription).
    loop {
        match tokio::time::timeout(
            tokio::time::Duration::from_millis(100),
            client.sync(),
        )
        .await
        {
            Ok(msg) => {
                msg.unwrap();
            }
            Err(_) => break,
        }
    }

    let canonical = engine.handle.subscribe().await.unwrap();
    assert_eq!(client.snapshot().tasks, canonical.snapshot().tasks);
    assert_eq!(client.snapshot().edges, canonical.snapshot().edges);
    assert_eq!(client.snapshot().plan, canonical.snapshot().plan);
}

#[tokio::test]
async fn run_events_arrive_in_lifecycle_order() {
    let engine = TestEngine::spawn(1);
    engine.handle.create_task("only", None).await.unwrap();
    let mut client = engine.handle.subscribe().await.unwrap();

    engine.handle.start().await.unwrap();
    let dispatched = engine.dispatched()[0];
    engine.report(dispatched, ExecutionOutcome::Completed).await;

    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(
            tokio::time::Duration::from_millis(100),
            client.sync(),
        )
        .await
        {
            Ok(msg) => {
                if let StreamPayload::Event(event) = msg.unwrap().payload {
                    events.push(event);
                }
            }
            Err(_) => break,
        }
    }

    let position = |pred: &dyn Fn(&EngineEvent) -> bool| {
        events.iter().position(|e| pred(e)).expect("event present")
    };

    let started_run =
        position(&|e| matches!(e, EngineEvent::StateChanged { state: RunState::Running }));
    let task_started = position(&|e| matches!(e, EngineEvent::TaskStarted { .. }));
    let task_completed = position(&|e| matches!(e, EngineEvent::TaskCompleted { .. }));
    let idle_again =
        position(&|e| matches!(e, EngineEvent::StateChanged { state: RunState::Idle }));

    assert!(started_run < task_started);
    assert!(task_started < task_completed);
    assert!(task_completed < idle_again);
}

#[tokio::test]
async fn heartbeats_flow_on_quiet_stream() {
    // A dedicated engine with a fast heartbeat.
    use lattice::core::ProjectId;
    use lattice::orchestration::{InstantExecutor, ProjectCoordinator};
    use lattice::EngineConfig;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    let config = EngineConfig {
        heartbeat_interval_ms: 25,
        ..EngineConfig::default()
    };
    let (report_tx, report_rx) = mpsc::channel(8);
    let executor = Arc::new(InstantExecutor::new(report_tx));
    let (handle, _join) =
        ProjectCoordinator::spawn(ProjectId::new(), config, executor, report_rx, None);

    let mut client = handle.subscribe().await.unwrap();
    let msg = client
        .next_timeout(tokio::time::Duration::from_secs(2))
        .await
        .unwrap();
    assert!(matches!(msg.payload, StreamPayload::Heartbeat));
}
