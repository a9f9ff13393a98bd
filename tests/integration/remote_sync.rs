//! Remote synchronization: forwarding local mutations and reconciling
//! inbound record updates under each strategy.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use lattice::core::ProjectId;
use lattice::orchestration::{InstantExecutor, ProjectCoordinator, TaskUpdate};
use lattice::sync::resolver::{ConflictStrategy, RemoteForwarder, RemoteMutation, RemoteSync};
use lattice::EngineConfig;

/// Remote store stub that records every delivered mutation.
struct RecordingRemote {
    seen: Mutex<Vec<RemoteMutation>>,
}

impl RemoteSync for RecordingRemote {
    fn forward(&self, mutation: &RemoteMutation) -> Result<(), String> {
        self.seen.lock().unwrap().push(mutation.clone());
        Ok(())
    }
}

fn spawn_with_remote(
    strategy: ConflictStrategy,
) -> (lattice::EngineHandle, Arc<RecordingRemote>) {
    let config = EngineConfig {
        conflict_strategy: strategy,
        heartbeat_interval_ms: 60_000,
        ..EngineConfig::default()
    };
    let remote = Arc::new(RecordingRemote {
        seen: Mutex::new(Vec::new()),
    });
    let (mutation_tx, mutation_rx) = mpsc::channel(64);
    let _forwarder = RemoteForwarder::spawn(Arc::clone(&remote) as Arc<dyn RemoteSync>, mutation_rx);

    let (report_tx, report_rx) = mpsc::channel(8);
    let executor = Arc::new(InstantExecutor::new(report_tx));
    let (handle, _join) = ProjectCoordinator::spawn(
        ProjectId::new(),
        config,
        executor,
        report_rx,
        Some(mutation_tx),
    );
    (handle, remote)
}

#[tokio::test]
async fn local_mutations_are_forwarded_in_order() {
    let (handle, remote) = spawn_with_remote(ConflictStrategy::LastWriterWins);

    let a = handle.create_task("a", None).await.unwrap();
    let b = handle.create_task("b", None).await.unwrap();
    let edge = handle.add_edge(b.id, a.id, None).await.unwrap();
    handle.remove_edge(edge.id).await.unwrap();

    // The forwarder drains asynchronously.
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

    let seen = remote.seen.lock().unwrap();
    assert_eq!(seen.len(), 4);
    assert!(matches!(&seen[0], RemoteMutation::UpsertTask { task } if task.id == a.id));
    assert!(matches!(&seen[1], RemoteMutation::UpsertTask { task } if task.id == b.id));
    assert!(matches!(&seen[2], RemoteMutation::UpsertEdge { edge: e } if e.id == edge.id));
    assert!(matches!(&seen[3], RemoteMutation::DeleteEdge { edge_id } if *edge_id == edge.id));
}

#[tokio::test]
async fn accept_remote_takes_even_older_records() {
    let (handle, _remote) = spawn_with_remote(ConflictStrategy::AcceptRemote);
    let local = handle.create_task("local", None).await.unwrap();

    let mut inbound = local.clone();
    inbound.title = "remote".to_string();
    inbound.updated_at = local.updated_at - chrono::Duration::days(1);

    handle.apply_remote_update(inbound).await.unwrap();

    let current = handle
        .update_task(local.id, TaskUpdate::default())
        .await
        .unwrap();
    assert_eq!(current.title, "remote");
}

#[tokio::test]
async fn keep_local_ignores_newer_remote_records() {
    let (handle, _remote) = spawn_with_remote(ConflictStrategy::KeepLocal);
    let local = handle.create_task("local", None).await.unwrap();

    let mut inbound = local.clone();
    inbound.title = "remote".to_string();
    inbound.updated_at = local.updated_at + chrono::Duration::days(1);

    handle.apply_remote_update(inbound).await.unwrap();

    let current = handle
        .update_task(local.id, TaskUpdate::default())
        .await
        .unwrap();
    assert_eq!(current.title, "local");
}

#[tokio::test]
async fn unknown_remote_record_is_inserted() {
    let (handle, _remote) = spawn_with_remote(ConflictStrategy::LastWriterWins);
    // Seed one task so the project exists meaningfully.
    handle.create_task("existing", None).await.unwrap();

    let mut foreign = handle.create_task("template", None).await.unwrap();
    handle.delete_task(foreign.id).await.unwrap();
    foreign.title = "imported".to_string();

    handle.apply_remote_update(foreign.clone()).await.unwrap();

    let current = handle
        .update_task(foreign.id, TaskUpdate::default())
        .await
        .unwrap();
    assert_eq!(current.title, "imported");
}
