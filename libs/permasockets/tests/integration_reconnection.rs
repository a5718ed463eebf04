//! Reconnection behavior: abnormal closes redial at a fixed delay, normal
//! closes are terminal, and explicit disconnect halts an active retry loop.

mod common;

use std::time::Duration;

use common::{wait_until, Behavior, MockWsServer, RecordingEvents};
use permasockets::{
    Connection, ConnectionConfig, ConnectionState, ReconnectPolicy, TerminationReason,
};

fn quick_reconnect(url: String) -> ConnectionConfig {
    ConnectionConfig::new(url).with_reconnect(ReconnectPolicy::fixed(Duration::from_millis(50)))
}

#[tokio::test]
async fn abnormal_close_triggers_reconnect_exactly_once_per_cycle() {
    let server = MockWsServer::start_with(Behavior::AbnormalThenEcho { drops: 1 }).await;
    let conn = Connection::new(quick_reconnect(server.ws_url()));
    let events = RecordingEvents::new();

    conn.connect(events.clone()).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || conn.is_connected()
            && events.reconnect_count() == 1)
            .await,
        "connection never recovered"
    );
    assert_eq!(server.accepted(), 2);

    // One abnormal close, one recovery: the observer must not fire again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(events.reconnect_count(), 1);
    assert_eq!(conn.metrics().reconnect_count, 1);

    // The recovered transport actually works.
    conn.send("post-recovery").await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            events.frames().contains(&"post-recovery".to_string())
        })
        .await
    );

    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn redials_keep_coming_until_server_returns() {
    let server = MockWsServer::start_with(Behavior::AbnormalThenEcho { drops: 3 }).await;
    let conn = Connection::new(quick_reconnect(server.ws_url()));
    let events = RecordingEvents::new();

    conn.connect(events.clone()).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || conn.is_connected()
            && server.accepted() == 4)
            .await,
        "expected three failed cycles then success"
    );
    assert_eq!(events.reconnect_count(), 3);

    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn normal_close_is_terminal_even_with_reconnect_enabled() {
    let server = MockWsServer::start_with(Behavior::NormalClose).await;
    let conn = Connection::new(quick_reconnect(server.ws_url()));
    let events = RecordingEvents::new();

    conn.connect(events.clone()).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || !events.terminations().is_empty()).await,
        "termination never observed"
    );
    match &events.terminations()[0] {
        TerminationReason::RemoteClose { code, .. } => assert_eq!(*code, 1000),
        other => panic!("expected remote close, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.accepted(), 1, "normal close must not redial");
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(events.reconnect_count(), 0);
}

#[tokio::test]
async fn abnormal_close_with_reconnect_disabled_terminates() {
    let server = MockWsServer::start_with(Behavior::AbnormalThenEcho { drops: 10 }).await;
    let conn = Connection::new(
        ConnectionConfig::new(server.ws_url()).with_reconnect(ReconnectPolicy::disabled()),
    );
    let events = RecordingEvents::new();

    conn.connect(events.clone()).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || !events.terminations().is_empty()).await
    );
    match &events.terminations()[0] {
        TerminationReason::Failed { .. } => {}
        other => panic!("expected failed termination, got {:?}", other),
    }
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn disconnect_halts_an_active_retry_loop() {
    let server = MockWsServer::start().await;
    let conn = Connection::new(quick_reconnect(server.ws_url()));
    let events = RecordingEvents::new();

    conn.connect(events.clone()).await.unwrap();

    // Kill the server: the open connection drops without a close frame and
    // every redial hits a dead port.
    server.shutdown();
    assert!(
        wait_until(Duration::from_secs(2), || {
            conn.state() == ConnectionState::Connecting
        })
        .await,
        "retry loop never started"
    );

    conn.disconnect().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(
        events.terminations(),
        vec![TerminationReason::LocalDisconnect]
    );

    // No further redial activity after disconnect resolved.
    let accepted = server.accepted();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.accepted(), accepted);
}
