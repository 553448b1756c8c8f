use anyhow::Result;

use async_rsm::Applied;
use async_rsm::ApplyError;
use async_rsm::CommandEntry;
use async_rsm::Entry;
use async_rsm::Runtime;
use async_rsm::RuntimeError;
use memapp::ClientRequest;
use memapp::ClientResponse;
use memapp::MemApp;

mod fixtures;

/// Exactly-once command semantics.
///
/// What does this test do?
///
/// - registers a session at log index 1.
/// - applies a command, then replays it (same session & request number) at
///   a later index with a *different* payload.
/// - asserts the replay is answered byte-for-byte from the response cache,
///   without the state machine ever seeing it.
/// - asserts the ack watermark trims the response cache.
///
/// RUST_LOG=async_rsm,memapp,command_dedup=trace cargo test -p async-rsm --test command_dedup
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn command_dedup() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config();
    let app = MemApp::new();
    let (runtime, _events) = Runtime::new(config, app.clone());

    tracing::info!("--- register a session at log index 1");
    let applied = runtime.apply(Entry::register(1, 1_000, None)).await?;
    assert_eq!(applied.registered_session(), Some(1));

    tracing::info!("--- apply a command at log index 2");
    let entry = Entry::command(2, CommandEntry {
        session: 1,
        request: 1,
        response_ack: 0,
        timestamp: 1_000,
        data: fixtures::set("x", "5"),
    });
    let applied = runtime.apply(entry).await?;
    assert_eq!(applied, Applied::Response(ClientResponse(None)));
    assert_eq!(runtime.metrics().borrow().last_applied, 2);

    tracing::info!("--- replay the same request number at log index 3");
    let replay = Entry::command(3, CommandEntry {
        session: 1,
        request: 1,
        response_ack: 0,
        timestamp: 1_000,
        // A different payload: if the machine ever saw this, state would
        // diverge and the response would differ.
        data: fixtures::set("x", "999"),
    });
    let applied = runtime.apply(replay).await?;
    assert_eq!(applied, Applied::Response(ClientResponse(None)));

    let state = app.state().await;
    assert_eq!(state.applies, 1, "the machine must apply the command at most once");
    assert_eq!(state.kv.get("x"), Some(&"5".to_string()));

    tracing::info!("--- the ack watermark trims the response cache");
    let entry = Entry::command(4, CommandEntry {
        session: 1,
        request: 2,
        response_ack: 1,
        timestamp: 1_000,
        data: fixtures::set("y", "1"),
    });
    runtime.apply(entry).await?;

    let snapshot = runtime.snapshot().await?;
    assert_eq!(snapshot.sessions.len(), 1);
    let session = &snapshot.sessions[0];
    assert_eq!(session.responses.len(), 1);
    assert!(session.responses.contains_key(&2), "only the unacknowledged response survives");

    Ok(())
}

/// An error raised inside the state machine propagates to the caller and
/// leaves the session open; failed commands are not cached.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn user_error_leaves_session_open() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config();
    let app = MemApp::new();
    let (runtime, _events) = Runtime::new(config, app.clone());

    runtime.apply(Entry::register(1, 1_000, None)).await?;

    tracing::info!("--- the machine rejects a command");
    let res = runtime
        .apply(Entry::command(2, CommandEntry {
            session: 1,
            request: 1,
            response_ack: 0,
            timestamp: 1_000,
            data: ClientRequest::Reject { message: "nope".into() },
        }))
        .await;
    match res {
        Err(ApplyError::User(msg)) => assert!(msg.contains("nope")),
        other => panic!("expected a user error, got {:?}", other),
    }

    tracing::info!("--- the session is still open and accepts further commands");
    let applied = runtime
        .apply(Entry::command(3, CommandEntry {
            session: 1,
            request: 2,
            response_ack: 0,
            timestamp: 1_000,
            data: fixtures::set("y", "2"),
        }))
        .await?;
    assert_eq!(applied, Applied::Response(ClientResponse(None)));

    let snapshot = runtime.snapshot().await?;
    assert!(
        !snapshot.sessions[0].responses.contains_key(&1),
        "failed commands must not enter the response cache"
    );

    Ok(())
}

/// An entry which does not advance `last_applied` is a protocol violation
/// from the log layer and shuts the runtime down.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn regressive_entry_is_fatal() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config();
    let (runtime, _events) = Runtime::new(config, MemApp::new());

    runtime.apply(Entry::<ClientRequest>::no_op(1, 1_000)).await?;

    let res = runtime.apply(Entry::<ClientRequest>::no_op(1, 1_000)).await;
    match res {
        Err(ApplyError::Runtime(RuntimeError::ProtocolViolation(_))) => {}
        Err(ApplyError::Runtime(RuntimeError::ShuttingDown)) => {}
        other => panic!("expected a protocol violation, got {:?}", other),
    }

    // The core is gone; later calls observe the shutdown.
    let res = runtime.apply(Entry::<ClientRequest>::no_op(2, 1_000)).await;
    assert!(matches!(res, Err(ApplyError::Runtime(RuntimeError::ShuttingDown))));

    Ok(())
}
