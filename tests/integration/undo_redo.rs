//! Undo/redo round-trips through the live engine.

use lattice::core::TaskStatus;
use lattice::orchestration::TaskUpdate;
use lattice::Error;

use crate::fixtures::TestEngine;

/// Fetch a task's current record via a no-op update.
async fn current(engine: &TestEngine, id: lattice::core::TaskId) -> lattice::core::Task {
    engine
        .handle
        .update_task(id, TaskUpdate::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn create_undo_redo_is_equivalent_to_create() {
    let engine = TestEngine::spawn(2);
    let task = engine.handle.create_task("report", None).await.unwrap();

    engine.handle.undo().await.unwrap();
    assert!(matches!(
        engine.handle.update_task(task.id, TaskUpdate::default()).await,
        Err(Error::TaskNotFound(_))
    ));

    engine.handle.redo().await.unwrap();
    let restored = current(&engine, task.id).await;
    assert_eq!(restored.id, task.id);
    assert_eq!(restored.title, "report");
    assert_eq!(restored.status, TaskStatus::Todo);
}

#[tokio::test]
async fn update_undo_restores_prior_value() {
    let engine = TestEngine::spawn(2);
    let task = engine.handle.create_task("draft", None).await.unwrap();

    engine
        .handle
        .update_task(
            task.id,
            TaskUpdate {
                title: Some("final".to_string()),
                status: Some(TaskStatus::InReview),
                ..TaskUpdate::default()
            },
        )
        .await
        .unwrap();

    engine.handle.undo().await.unwrap();
    let restored = current(&engine, task.id).await;
    assert_eq!(restored.title, "draft");
    assert_eq!(restored.status, TaskStatus::Todo);

    engine.handle.redo().await.unwrap();
    let redone = current(&engine, task.id).await;
    assert_eq!(redone.title, "final");
    assert_eq!(redone.status, TaskStatus::InReview);
}

#[tokio::test]
async fn delete_undo_restores_task_and_edges() {
    let engine = TestEngine::spawn(2);
    let a = engine.handle.create_task("a", None).await.unwrap();
    let b = engine.handle.create_task("b", None).await.unwrap();
    engine.handle.add_edge(b.id, a.id, None).await.unwrap();

    engine.handle.delete_task(a.id).await.unwrap();

    // Cascade removed the edge; b is unblocked in the mirror of record.
    let snapshot = engine.handle.subscribe().await.unwrap();
    assert!(snapshot.snapshot().edges.is_empty());

    engine.handle.undo().await.unwrap();

    let snapshot = engine.handle.subscribe().await.unwrap();
    assert_eq!(snapshot.snapshot().tasks.len(), 2);
    assert_eq!(snapshot.snapshot().edges.len(), 1);
    assert_eq!(snapshot.snapshot().edges[0].task_id, b.id);
    assert_eq!(snapshot.snapshot().edges[0].depends_on_id, a.id);
}

#[tokio::test]
async fn edge_mutations_round_trip() {
    let engine = TestEngine::spawn(2);
    let a = engine.handle.create_task("a", None).await.unwrap();
    let b = engine.handle.create_task("b", None).await.unwrap();
    let edge = engine.handle.add_edge(b.id, a.id, None).await.unwrap();

    // Undo the edge creation.
    engine.handle.undo().await.unwrap();
    let snapshot = engine.handle.subscribe().await.unwrap();
    assert!(snapshot.snapshot().edges.is_empty());

    // Redo restores the identical record.
    engine.handle.redo().await.unwrap();
    let snapshot = engine.handle.subscribe().await.unwrap();
    assert_eq!(snapshot.snapshot().edges[0].id, edge.id);

    // Explicit removal and its undo.
    engine.handle.remove_edge(edge.id).await.unwrap();
    engine.handle.undo().await.unwrap();
    let snapshot = engine.handle.subscribe().await.unwrap();
    assert_eq!(snapshot.snapshot().edges.len(), 1);
}

#[tokio::test]
async fn new_action_clears_redo_history() {
    let engine = TestEngine::spawn(2);
    engine.handle.create_task("first", None).await.unwrap();

    engine.handle.undo().await.unwrap();
    engine.handle.create_task("second", None).await.unwrap();

    // The redo of "first" was invalidated by the new action.
    assert!(matches!(
        engine.handle.redo().await,
        Err(Error::NothingToRedo)
    ));
}

#[tokio::test]
async fn undo_chain_walks_back_in_reverse_order() {
    let engine = TestEngine::spawn(2);
    let a = engine.handle.create_task("a", None).await.unwrap();
    let b = engine.handle.create_task("b", None).await.unwrap();
    engine.handle.add_edge(b.id, a.id, None).await.unwrap();

    // Three undos unwind edge, then b, then a.
    engine.handle.undo().await.unwrap();
    engine.handle.undo().await.unwrap();
    engine.handle.undo().await.unwrap();

    let snapshot = engine.handle.subscribe().await.unwrap();
    assert!(snapshot.snapshot().tasks.is_empty());
    assert!(snapshot.snapshot().edges.is_empty());

    assert!(matches!(
        engine.handle.undo().await,
        Err(Error::NothingToUndo)
    ));

    // Three redos rebuild everything.
    engine.handle.redo().await.unwrap();
    engine.handle.redo().await.unwrap();
    engine.handle.redo().await.unwrap();

    let snapshot = engine.handle.subscribe().await.unwrap();
    assert_eq!(snapshot.snapshot().tasks.len(), 2);
    assert_eq!(snapshot.snapshot().edges.len(), 1);
}

#[tokio::test]
async fn orchestrator_transitions_are_not_undoable() {
    use lattice::orchestration::ExecutionOutcome;

    let engine = TestEngine::spawn(1);
    let task = engine.handle.create_task("work", None).await.unwrap();
    engine.handle.start().await.unwrap();
    engine.report(task.id, ExecutionOutcome::Completed).await;

    let done = current(&engine, task.id).await;
    assert_eq!(done.status, TaskStatus::Done);

    // The only recorded user actions are the create and the probe update
    // above; undoing never resurrects the in-progress/done transitions.
    engine.handle.undo().await.unwrap(); // probe update
    engine.handle.undo().await.unwrap(); // create
    assert!(matches!(
        engine.handle.undo().await,
        Err(Error::NothingToUndo)
    ));
}
