//! Integration tests for the connection actor over the in-process transport.
//!
//! Time is paused in every test: tokio jumps the clock forward whenever all
//! tasks are idle, so ping periods and reconnect backoffs run instantly and
//! deterministically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tandem_connection::{
    Connection, ConnectionActivity, ConnectionConfig, ConnectionError, ConnectionEvent,
    ConnectionState, Delivery,
};
use tandem_transport::memory::{self, MemorySocket};
use tandem_transport::{Connector, Frame, Listener, Socket, SocketId, TransportError};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

// =========================================================================
// Helpers
// =========================================================================

const WAIT: Duration = Duration::from_secs(600);

fn config() -> ConnectionConfig {
    ConnectionConfig::new("mem://peer")
}

/// Waits for the first event matching `pred`, returning it together with
/// every event seen before it.
async fn wait_for(
    events: &mut UnboundedReceiver<ConnectionEvent>,
    pred: impl Fn(&ConnectionEvent) -> bool,
) -> (ConnectionEvent, Vec<ConnectionEvent>) {
    let mut seen = Vec::new();
    let found = tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
            seen.push(event);
        }
    })
    .await
    .expect("timed out waiting for event");
    (found, seen)
}

async fn wait_for_state(conn: &Connection, state: ConnectionState) {
    let mut status = conn.watch_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| s.state == state))
        .await
        .expect("timed out waiting for state")
        .expect("connection actor stopped");
}

async fn recv_text(socket: &MemorySocket) -> String {
    match tokio::time::timeout(WAIT, socket.recv()).await {
        Ok(Ok(Frame::Text(text))) => text,
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// A dialed connection that is already open, with its server side.
///
/// A token is always set so secure configs can dial too.
async fn open_connection(
    config: ConnectionConfig,
) -> (
    Connection,
    memory::MemoryConnector,
    memory::MemoryListener,
    MemorySocket,
    UnboundedReceiver<ConnectionEvent>,
) {
    let (connector, mut listener) = memory::listener();
    let conn = Connection::dial(connector.clone(), config);
    let mut events = conn.subscribe().await.unwrap();
    conn.set_token(Some("t".into())).await.unwrap();
    conn.connect().await.unwrap();
    let server = listener.accept().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ConnectionEvent::Opened)).await;
    (conn, connector, listener, server, events)
}

/// Switchable faults shared by a [`FaultyConnector`] and its sockets.
#[derive(Clone, Default)]
struct Faults {
    fail_sends: Arc<AtomicBool>,
    reset_on_terminate: Arc<AtomicBool>,
}

impl Faults {
    fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Release);
    }
}

/// A memory connector whose sockets fail on demand.
struct FaultyConnector {
    inner: memory::MemoryConnector,
    faults: Faults,
}

impl Connector for FaultyConnector {
    type Socket = FaultySocket;

    async fn open(&self, uri: &str) -> Result<FaultySocket, TransportError> {
        let inner = self.inner.open(uri).await?;
        Ok(FaultySocket {
            inner,
            faults: self.faults.clone(),
            terminated: AtomicBool::new(false),
        })
    }
}

struct FaultySocket {
    inner: MemorySocket,
    faults: Faults,
    terminated: AtomicBool,
}

impl Socket for FaultySocket {
    async fn send(&self, text: &str) -> Result<(), TransportError> {
        if self.faults.fail_sends.load(Ordering::Acquire) {
            return Err(TransportError::Closed("send refused".into()));
        }
        self.inner.send(text).await
    }

    async fn recv(&self) -> Result<Frame, TransportError> {
        let frame = self.inner.recv().await?;
        if self.terminated.load(Ordering::Acquire)
            && self.faults.reset_on_terminate.load(Ordering::Acquire)
        {
            return Err(TransportError::Closed("connection reset".into()));
        }
        Ok(frame)
    }

    async fn close(&self, code: u16) -> Result<(), TransportError> {
        self.inner.close(code).await
    }

    async fn terminate(&self) -> Result<(), TransportError> {
        self.terminated.store(true, Ordering::Release);
        self.inner.terminate().await
    }

    fn id(&self) -> SocketId {
        self.inner.id()
    }
}

fn faulty() -> (FaultyConnector, memory::MemoryListener, Faults) {
    let (inner, listener) = memory::listener();
    let faults = Faults::default();
    let connector = FaultyConnector {
        inner,
        faults: faults.clone(),
    };
    (connector, listener, faults)
}

fn state_changes(events: &[ConnectionEvent]) -> Vec<(ConnectionState, ConnectionState)> {
    events
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::StateChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

// =========================================================================
// Opening
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_dial_opens_and_reaches_connected() {
    let (conn, connector, _listener, _server, _events) = open_connection(config()).await;

    let status = conn.status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.activity, ConnectionActivity::Idle);
    assert_eq!(status.attempts, 0);
    assert_eq!(connector.dialed(), vec!["mem://peer".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_secure_open_escalates_to_authorized() {
    let (connector, mut listener) = memory::listener();
    let conn = Connection::dial(
        connector.clone(),
        ConnectionConfig {
            secure: true,
            ..config()
        },
    );
    conn.set_token(Some("abc".into())).await.unwrap();
    conn.connect().await.unwrap();
    let _server = listener.accept().await.unwrap();

    wait_for_state(&conn, ConnectionState::Authorized).await;
    assert_eq!(connector.dialed(), vec!["mem://peer?token=abc".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_secure_without_token_defers_dial() {
    let (connector, mut listener) = memory::listener();
    let conn = Connection::dial(
        connector.clone(),
        ConnectionConfig {
            secure: true,
            ..config()
        },
    );

    conn.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(connector.dial_count(), 0, "no socket without a token");
    assert_eq!(conn.status().state, ConnectionState::NotConnected);

    // The pending reconnect picks up the token once it is set.
    conn.set_token(Some("late".into())).await.unwrap();
    let _server = listener.accept().await.unwrap();
    wait_for_state(&conn, ConnectionState::Authorized).await;
    assert_eq!(connector.dialed(), vec!["mem://peer?token=late".to_string()]);
}

// =========================================================================
// Sending and history
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_send_while_disconnected_queues_and_flushes_in_order() {
    let (connector, mut listener) = memory::listener();
    let conn = Connection::dial(connector, config());
    let mut events = conn.subscribe().await.unwrap();

    for n in 0..3 {
        let delivery = conn.send(json!({ "n": n }), false).await.unwrap();
        assert_eq!(delivery, Delivery::Queued);
        let (event, _) = wait_for(&mut events, |e| matches!(e, ConnectionEvent::NotSent(_))).await;
        assert_eq!(event, ConnectionEvent::NotSent(json!({ "n": n })));
    }

    conn.connect().await.unwrap();
    let server = listener.accept().await.unwrap();
    for n in 0..3 {
        assert_eq!(recv_text(&server).await, json!({ "n": n }).to_string());
    }

    let delivery = conn.send(json!("live"), false).await.unwrap();
    assert_eq!(delivery, Delivery::Sent);
    assert_eq!(recv_text(&server).await, "\"live\"");
}

#[tokio::test(start_paused = true)]
async fn test_failed_replay_is_reported_and_not_requeued() {
    let (connector, mut listener, faults) = faulty();
    let conn = Connection::dial(connector, config());
    let mut events = conn.subscribe().await.unwrap();

    conn.send(json!("first"), false).await.unwrap();
    conn.send(json!("second"), false).await.unwrap();

    faults.fail_sends(true);
    conn.connect().await.unwrap();
    let _server = listener.accept().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ConnectionEvent::Opened)).await;
    for _ in 0..2 {
        let (event, _) = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Error(_))).await;
        let ConnectionEvent::Error(message) = event else { unreachable!() };
        assert!(message.starts_with("history replay failed"), "{message}");
    }
    faults.fail_sends(false);

    // A fresh socket gets only what is sent from now on.
    conn.disconnect().await.unwrap();
    let server = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    wait_for(&mut events, |e| matches!(e, ConnectionEvent::Opened)).await;
    assert_eq!(conn.send(json!("live"), false).await.unwrap(), Delivery::Sent);
    assert_eq!(recv_text(&server).await, "\"live\"");
}

#[tokio::test(start_paused = true)]
async fn test_history_overflow_keeps_newest() {
    let (connector, mut listener) = memory::listener();
    let conn = Connection::dial(
        connector,
        ConnectionConfig {
            history_capacity: 2,
            ..config()
        },
    );

    for n in 0..3 {
        conn.send(json!(n), false).await.unwrap();
    }
    conn.connect().await.unwrap();
    let server = listener.accept().await.unwrap();

    assert_eq!(recv_text(&server).await, "1");
    assert_eq!(recv_text(&server).await, "2");
    conn.send(json!("marker"), false).await.unwrap();
    assert_eq!(recv_text(&server).await, "\"marker\"");
}

#[tokio::test(start_paused = true)]
async fn test_update_token_bypasses_authorization_gate() {
    let (conn, _connector, _listener, server, _events) = open_connection(ConnectionConfig {
        secure: true,
        ..config()
    })
    .await;
    conn.deauthorize().await.unwrap();
    assert_eq!(conn.status().state, ConnectionState::Connected);

    let update = json!({"type": "service", "name": "updateToken", "payload": {"token": "t2"}});
    assert_eq!(conn.send(update.clone(), true).await.unwrap(), Delivery::Sent);
    assert_eq!(recv_text(&server).await, update.to_string());

    assert_eq!(conn.send(json!({"n": 1}), true).await.unwrap(), Delivery::Queued);

    conn.authorize().await.unwrap();
    assert_eq!(conn.status().state, ConnectionState::Authorized);
    assert_eq!(recv_text(&server).await, json!({"n": 1}).to_string());
}

#[tokio::test(start_paused = true)]
async fn test_authorize_without_socket_fails() {
    let (connector, _listener) = memory::listener();
    let conn = Connection::dial(connector, config());
    let result = conn.authorize().await;
    assert!(matches!(result, Err(ConnectionError::NotOpen)));
    assert_eq!(conn.status().state, ConnectionState::NotConnected);
}

// =========================================================================
// Inbound messages
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_ping_is_answered_with_pong() {
    let (_conn, _connector, _listener, server, _events) = open_connection(config()).await;
    server.send("ping").await.unwrap();
    assert_eq!(recv_text(&server).await, "pong");
}

#[tokio::test(start_paused = true)]
async fn test_json_message_is_emitted() {
    let (_conn, _connector, _listener, server, mut events) = open_connection(config()).await;
    server.send(r#"{"a":1}"#).await.unwrap();
    let (event, _) = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Message(_))).await;
    assert_eq!(event, ConnectionEvent::Message(json!({"a": 1})));
}

#[tokio::test(start_paused = true)]
async fn test_unparsable_message_is_reported_and_dropped() {
    let (conn, _connector, _listener, server, mut events) = open_connection(config()).await;
    server.send("{oops").await.unwrap();
    let (event, seen) =
        wait_for(&mut events, |e| matches!(e, ConnectionEvent::Error(_))).await;
    assert!(matches!(event, ConnectionEvent::Error(msg) if msg.contains("unparsable")));
    assert!(!seen.iter().any(|e| matches!(e, ConnectionEvent::Message(_))));
    assert_eq!(conn.status().state, ConnectionState::Connected);
}

// =========================================================================
// Liveness
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_answered_pings_keep_connection_alive() {
    let (conn, connector, _listener, server, _events) = open_connection(config()).await;
    tokio::spawn(async move {
        while let Ok(Frame::Text(text)) = server.recv().await {
            if text == "ping" {
                let _ = server.send("pong").await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(conn.status().state, ConnectionState::Connected);
    assert_eq!(connector.dial_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_ping_forces_disconnect_then_reconnects() {
    let (conn, connector, mut listener, server, mut events) = open_connection(config()).await;
    let start = Instant::now();

    wait_for(&mut events, |e| matches!(e, ConnectionEvent::NoPing)).await;
    assert!(start.elapsed() >= Duration::from_secs(20));
    assert_eq!(conn.status().state, ConnectionState::NoPing);

    let (closed, _) = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Closed { .. })).await;
    assert_eq!(
        closed,
        ConnectionEvent::Closed {
            code: 1006,
            reason: "Abnormal Closure".into()
        }
    );
    wait_for(&mut events, |e| {
        *e == ConnectionEvent::StateChanged {
            from: ConnectionState::NoPing,
            to: ConnectionState::NotConnected,
        }
    })
    .await;

    // The abandoned socket saw one ping and then the termination.
    assert_eq!(recv_text(&server).await, "ping");
    assert_eq!(server.recv().await.unwrap(), Frame::Close(Some(1006)));

    let _second = listener.accept().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ConnectionEvent::Opened)).await;
    assert_eq!(connector.dial_count(), 2);
}

// =========================================================================
// Closing and reconnection
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_peer_drop_reports_reason_and_backs_off() {
    let (conn, connector, mut listener, server, mut events) = open_connection(config()).await;

    server.terminate().await.unwrap();
    let (closed, _) = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Closed { .. })).await;
    match closed {
        ConnectionEvent::Closed { code, reason } => {
            assert_eq!(code, 1006);
            assert!(reason.contains("Abnormal Closure"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    let (_, seen) = wait_for(&mut events, |e| {
        *e == ConnectionEvent::StateChanged {
            from: ConnectionState::Errored,
            to: ConnectionState::NotConnected,
        }
    })
    .await;
    assert!(seen.contains(&ConnectionEvent::StateChanged {
        from: ConnectionState::Connected,
        to: ConnectionState::Errored,
    }));

    let dropped_at = Instant::now();
    let _second = listener.accept().await.unwrap();
    assert!(dropped_at.elapsed() >= Duration::from_secs(1));
    wait_for_state(&conn, ConnectionState::Connected).await;
    assert_eq!(connector.dial_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_of_live_socket_reconnects_immediately() {
    let (conn, connector, mut listener, server, mut events) = open_connection(config()).await;
    let start = Instant::now();

    conn.disconnect().await.unwrap();
    assert_eq!(server.recv().await.unwrap(), Frame::Close(Some(1000)));
    let _second = listener.accept().await.unwrap();
    let (_, seen) = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Opened)).await;

    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(seen.contains(&ConnectionEvent::Closed {
        code: 1000,
        reason: "Normal Closure".into()
    }));
    assert!(!seen.iter().any(|e| matches!(
        e,
        ConnectionEvent::StateChanged {
            to: ConnectionState::Errored,
            ..
        }
    )));
    assert_eq!(connector.dial_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_switches_to_long_interval_at_threshold() {
    let (connector, _listener) = memory::listener();
    connector.set_available(false);
    let conn = Connection::dial(
        connector.clone(),
        ConnectionConfig {
            reconnect_threshold: 2,
            ..config()
        },
    );

    let start = Instant::now();
    conn.connect().await.unwrap();
    while connector.dial_count() < 3 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let elapsed = start.elapsed();

    // Dials at 0s and 1s (short interval), then 30s later (long interval).
    assert!(elapsed >= Duration::from_secs(31), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(32), "elapsed {elapsed:?}");
    assert_eq!(conn.status().state, ConnectionState::NotConnected);
    assert!(conn.status().last_error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_failed_dial_is_reported_not_raised() {
    let (connector, _listener) = memory::listener();
    connector.set_available(false);
    let conn = Connection::dial(connector, config());
    let mut events = conn.subscribe().await.unwrap();

    conn.connect().await.unwrap();
    let (event, _) = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Error(_))).await;
    assert!(matches!(event, ConnectionEvent::Error(msg) if msg.contains("refused")));
}

#[tokio::test(start_paused = true)]
async fn test_slave_connection_never_reconnects() {
    let (client_side, server_side) = memory::pair();
    let conn = Connection::accept(server_side, config());
    wait_for_state(&conn, ConnectionState::Connected).await;
    let mut events = conn.subscribe().await.unwrap();

    client_side.close(1000).await.unwrap();
    let (closed, _) = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Closed { .. })).await;
    assert!(matches!(closed, ConnectionEvent::Closed { code: 1000, .. }));

    tokio::time::sleep(Duration::from_secs(120)).await;
    let status = conn.status();
    assert_eq!(status.state, ConnectionState::NotConnected);
    assert_eq!(status.attempts, 0);

    // Still usable as a sink: sends are queued.
    assert_eq!(conn.send(json!(1), false).await.unwrap(), Delivery::Queued);
}

#[tokio::test(start_paused = true)]
async fn test_accept_with_events_sees_initial_open() {
    let (_client_side, server_side) = memory::pair();
    let (conn, mut events) = Connection::accept_with_events(server_side, config());

    let (opened, _) = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Opened)).await;
    assert!(matches!(opened, ConnectionEvent::Opened));
    assert!(conn.status().state.is_open());
}

// =========================================================================
// Termination
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_terminate_drops_socket_without_handshake() {
    let (conn, _connector, _listener, server, mut events) = open_connection(config()).await;

    conn.terminate().await.unwrap();
    assert_eq!(server.recv().await.unwrap(), Frame::Close(Some(1006)));

    let (closed, seen) = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Closed { .. })).await;
    assert_eq!(
        closed,
        ConnectionEvent::Closed {
            code: 1006,
            reason: "Abnormal Closure".into()
        }
    );
    assert!(seen.contains(&ConnectionEvent::ActivityChanged {
        from: ConnectionActivity::Idle,
        to: ConnectionActivity::Terminating,
    }));
    wait_for_state(&conn, ConnectionState::NotConnected).await;
    assert_eq!(conn.status().activity, ConnectionActivity::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_socket_error_while_terminating_skips_errored() {
    let (connector, mut listener, faults) = faulty();
    faults.reset_on_terminate.store(true, Ordering::Release);
    let conn = Connection::dial(connector, config());
    let mut events = conn.subscribe().await.unwrap();
    conn.connect().await.unwrap();
    let _server = listener.accept().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ConnectionEvent::Opened)).await;

    conn.terminate().await.unwrap();

    let (closed, mut seen) = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Closed { .. })).await;
    assert!(matches!(closed, ConnectionEvent::Closed { code: 1006, .. }));
    assert!(seen.contains(&ConnectionEvent::Error("socket closed: connection reset".into())));

    let (not_connected, rest) = wait_for(&mut events, |e| {
        matches!(
            e,
            ConnectionEvent::StateChanged {
                to: ConnectionState::NotConnected,
                ..
            }
        )
    })
    .await;
    seen.extend(rest);
    seen.push(not_connected);
    assert_eq!(
        state_changes(&seen),
        vec![(ConnectionState::Connected, ConnectionState::NotConnected)]
    );
}

// =========================================================================
// Teardown
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_destroy_closes_socket_and_disables_handle() {
    let (conn, _connector, _listener, server, mut events) = open_connection(config()).await;

    conn.destroy().await;
    assert_eq!(server.recv().await.unwrap(), Frame::Close(Some(1000)));

    // Subscribers are dropped: the stream ends after whatever was buffered.
    tokio::time::timeout(WAIT, async { while events.recv().await.is_some() {} })
        .await
        .expect("event stream should end");

    assert!(matches!(conn.connect().await, Err(ConnectionError::Destroyed)));
    assert!(conn.is_destroyed());
    conn.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_dropping_last_handle_shuts_down() {
    let (conn, _connector, _listener, server, _events) = open_connection(config()).await;
    drop(conn);
    assert_eq!(server.recv().await.unwrap(), Frame::Close(Some(1000)));
}
