use anyhow::Result;

use async_rsm::Applied;
use async_rsm::CommandEntry;
use async_rsm::Entry;
use async_rsm::Runtime;
use memapp::ClientResponse;
use memapp::MemApp;

mod fixtures;

fn write(index: u64, request: u64, key: &str, value: &str) -> Entry<memapp::ClientRequest> {
    Entry::command(index, CommandEntry {
        session: 1,
        request,
        response_ack: 0,
        timestamp: 1_000,
        data: fixtures::set(key, value),
    })
}

/// Snapshot & restore reproduce the full replicated state.
///
/// What does this test do?
///
/// - builds state on runtime A, snapshots it, restores into a fresh
///   runtime B.
/// - asserts B observes the same applied index, session set & response
///   caches, byte for byte.
/// - applies an identical log suffix to both and asserts they stay
///   identical; a replayed request is answered from B's restored cache.
///
/// RUST_LOG=async_rsm,memapp,snapshot_restore=trace cargo test -p async-rsm --test snapshot_restore
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_restore_roundtrip() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config();
    let app_a = MemApp::new();
    let (a, _events_a) = Runtime::new(config.clone(), app_a.clone());

    tracing::info!("--- build state on runtime A");
    a.apply(Entry::register(1, 1_000, Some("client-a".into()))).await?;
    a.apply(write(2, 1, "x", "1")).await?;
    a.apply(write(3, 2, "y", "2")).await?;

    let snapshot = a.snapshot().await?;
    assert_eq!(snapshot.last_applied, 3);
    assert_eq!(snapshot.sessions.len(), 1);

    tracing::info!("--- restore into a fresh runtime B");
    let app_b = MemApp::new();
    let (b, _events_b) = Runtime::new(config, app_b.clone());
    b.restore(snapshot.clone()).await?;

    assert_eq!(b.metrics().borrow().last_applied, 3);
    assert_eq!(b.snapshot().await?, snapshot);
    assert_eq!(app_a.state().await, app_b.state().await);

    tracing::info!("--- both runtimes apply the same suffix & stay identical");
    let ra = a.apply(write(4, 3, "z", "3")).await?;
    let rb = b.apply(write(4, 3, "z", "3")).await?;
    assert_eq!(ra, rb);
    assert_eq!(a.snapshot().await?, b.snapshot().await?);
    assert_eq!(app_a.state().await, app_b.state().await);

    tracing::info!("--- a replayed request is answered from the restored cache");
    let before = app_b.state().await.applies;
    let replayed = b.apply(write(5, 2, "y", "999")).await?;
    assert_eq!(replayed, Applied::Response(ClientResponse(None)));
    assert_eq!(app_b.state().await.applies, before);
    assert_eq!(app_b.state().await.kv.get("y"), Some(&"2".to_string()));

    Ok(())
}
