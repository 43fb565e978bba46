use std::sync::atomic::{AtomicUsize, Ordering};

use shared::domain::UserId;

use super::*;
use crate::test_support::{credential, eventually, manager_with, DialStep, ScriptedDialer};

fn online_users(ids: &[&str]) -> TransportEvent {
    TransportEvent::GetOnlineUsers(ids.iter().map(|id| UserId::new(*id)).collect())
}

#[tokio::test]
async fn connect_reaches_connected_and_sends_the_credential_in_the_handshake() {
    let dialer = ScriptedDialer::new();
    let manager = manager_with(Arc::clone(&dialer));

    let connection = manager.connect(credential("tok-a"));
    assert_eq!(manager.state(), ConnectionState::Connecting);

    let connected = manager
        .wait_for_connect(Duration::from_secs(1))
        .await
        .expect("connected");
    assert_eq!(connected.generation(), connection.generation());
    assert!(connection.is_connected());
    assert_eq!(dialer.tokens(), vec!["tok-a".to_string()]);
    assert!(!manager.endpoint().as_str().contains("tok-a"));
}

#[tokio::test]
async fn connect_with_the_same_credential_is_idempotent() {
    let dialer = ScriptedDialer::new();
    let manager = manager_with(Arc::clone(&dialer));

    let first = manager.connect(credential("tok-a"));
    manager
        .wait_for_connect(Duration::from_secs(1))
        .await
        .expect("connected");
    let second = manager.connect(credential("tok-a"));

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &manager.current().expect("current")));
    assert_eq!(dialer.dial_count(), 1);
}

#[tokio::test]
async fn connect_with_a_new_credential_tears_down_the_previous_transport() {
    let dialer = ScriptedDialer::new();
    let manager = manager_with(Arc::clone(&dialer));

    let first = manager.connect(credential("tok-a"));
    manager
        .wait_for_connect(Duration::from_secs(1))
        .await
        .expect("first connected");
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    first
        .on(EventKind::GetOnlineUsers, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("listen");

    let second = manager.connect(credential("tok-b"));
    assert!(first.is_closed());
    assert_eq!(first.state(), ConnectionState::Disconnected);
    assert_eq!(first.listener_count(EventKind::GetOnlineUsers), 0);
    manager
        .wait_for_connect(Duration::from_secs(1))
        .await
        .expect("second connected");

    assert!(dialer.emit(online_users(&["x"])));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(second.is_connected());
    assert_eq!(dialer.tokens(), vec!["tok-a".to_string(), "tok-b".to_string()]);
}

#[tokio::test]
async fn network_drop_moves_to_reconnecting_then_back_to_connected() {
    let dialer = ScriptedDialer::new();
    let manager = manager_with(Arc::clone(&dialer));
    let connection = manager.connect(credential("tok-a"));
    manager
        .wait_for_connect(Duration::from_secs(1))
        .await
        .expect("connected");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    connection
        .on(EventKind::Disconnect, move |event| {
            if let TransportEvent::Disconnect { reason } = event {
                sink.lock().push(reason.clone());
            }
        })
        .expect("listen");

    // Hold the redial so the intermediate state is observable.
    dialer.push(DialStep::Reject(ClientError::NetworkUnreachable("down".into())));
    let mut states = manager.watch_state();
    dialer.drop_link();

    states
        .wait_for(|state| *state == ConnectionState::Reconnecting)
        .await
        .expect("reconnecting");
    states
        .wait_for(|state| *state == ConnectionState::Connected)
        .await
        .expect("reconnected");

    assert_eq!(seen.lock().as_slice(), ["transport close".to_string()]);
    assert!(Arc::ptr_eq(&connection, &manager.current().expect("current")));
    assert_eq!(dialer.dial_count(), 3);
}

#[tokio::test]
async fn server_disconnect_event_also_triggers_reconnect() {
    let dialer = ScriptedDialer::new();
    let manager = manager_with(Arc::clone(&dialer));
    manager.connect(credential("tok-a"));
    manager
        .wait_for_connect(Duration::from_secs(1))
        .await
        .expect("connected");

    assert!(dialer.emit(TransportEvent::Disconnect {
        reason: "ping timeout".into()
    }));
    eventually("second dial", || dialer.dial_count() == 2).await;
    eventually("connected again", || {
        manager.state() == ConnectionState::Connected
    })
    .await;
}

#[tokio::test]
async fn listeners_survive_reconnects_of_the_same_connection() {
    let dialer = ScriptedDialer::new();
    let manager = manager_with(Arc::clone(&dialer));
    let connection = manager.connect(credential("tok-a"));
    manager
        .wait_for_connect(Duration::from_secs(1))
        .await
        .expect("connected");
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    connection
        .on(EventKind::GetOnlineUsers, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("listen");

    dialer.drop_link();
    eventually("redialed", || dialer.dial_count() == 2).await;
    eventually("connected", || manager.state() == ConnectionState::Connected).await;

    assert!(dialer.emit(online_users(&["a"])));
    eventually("delivered once", || hits.load(Ordering::SeqCst) == 1).await;
    assert_eq!(connection.listener_count(EventKind::GetOnlineUsers), 1);
}

#[tokio::test]
async fn handshake_rejection_fails_the_wait_then_retries_in_the_background() {
    let dialer = ScriptedDialer::new();
    dialer.push(DialStep::Reject(ClientError::Handshake("bad gateway".into())));
    let manager = manager_with(Arc::clone(&dialer));
    manager.connect(credential("tok-a"));

    let err = manager
        .wait_for_connect(Duration::from_secs(1))
        .await
        .expect_err("first attempt fails");
    assert_eq!(err, ClientError::Handshake("bad gateway".into()));

    eventually("retried", || dialer.dial_count() == 2).await;
    manager
        .wait_for_connect(Duration::from_secs(1))
        .await
        .expect("second attempt connects");
}

#[tokio::test]
async fn waiting_until_connected_rides_out_retried_failures() {
    let dialer = ScriptedDialer::new();
    dialer.push(DialStep::Reject(ClientError::Handshake("busy".into())));
    dialer.push(DialStep::Reject(ClientError::Handshake("busy".into())));
    let manager = manager_with(Arc::clone(&dialer));
    let connection = manager.connect(credential("tok-a"));

    let connected = manager
        .wait_until_connected(Duration::from_secs(1))
        .await
        .expect("connected after retries");
    assert_eq!(connected.generation(), connection.generation());
    assert_eq!(dialer.dial_count(), 3);
}

#[tokio::test]
async fn waiting_until_connected_stops_at_a_rejected_credential() {
    let dialer = ScriptedDialer::new();
    dialer.push(DialStep::Reject(ClientError::Unauthorized));
    let manager = manager_with(Arc::clone(&dialer));
    manager.connect(credential("revoked"));

    let err = manager
        .wait_until_connected(Duration::from_secs(5))
        .await
        .expect_err("rejected");
    assert_eq!(err, ClientError::Unauthorized);
}

#[tokio::test]
async fn waiting_until_connected_gives_up_at_the_deadline() {
    let dialer = ScriptedDialer::new();
    for _ in 0..100 {
        dialer.push(DialStep::Reject(ClientError::Handshake("busy".into())));
    }
    let manager = manager_with(Arc::clone(&dialer));
    manager.connect(credential("tok-a"));

    let err = manager
        .wait_until_connected(Duration::from_millis(150))
        .await
        .expect_err("deadline");
    assert_eq!(err, ClientError::ConnectTimeout { timeout_ms: 150 });
    assert!(dialer.dial_count() > 1);
}

#[tokio::test]
async fn handshake_timeout_is_reported_as_connect_timeout() {
    let dialer = ScriptedDialer::new();
    dialer.push(DialStep::Hang);
    let manager = manager_with(Arc::clone(&dialer));
    manager.connect(credential("tok-a"));

    let err = manager
        .wait_for_connect(Duration::from_secs(2))
        .await
        .expect_err("times out");
    assert!(matches!(err, ClientError::ConnectTimeout { timeout_ms: 200 }));
}

#[tokio::test]
async fn wait_for_connect_times_out_without_leaving_receivers_behind() {
    let dialer = ScriptedDialer::new();
    dialer.push(DialStep::Hang);
    let manager = manager_with(Arc::clone(&dialer));
    manager.connect(credential("tok-a"));
    let baseline = manager.cell.tx.receiver_count();

    let err = manager
        .wait_for_connect(Duration::from_millis(50))
        .await
        .expect_err("times out");
    assert!(matches!(err, ClientError::ConnectTimeout { timeout_ms: 50 }));
    assert_eq!(manager.cell.tx.receiver_count(), baseline);
}

#[tokio::test]
async fn unauthorized_event_stops_the_connection_and_signals() {
    let dialer = ScriptedDialer::new();
    let manager = manager_with(Arc::clone(&dialer));
    let mut signals = manager.subscribe_signals();
    let connection = manager.connect(credential("tok-a"));
    manager
        .wait_for_connect(Duration::from_secs(1))
        .await
        .expect("connected");

    assert!(dialer.emit(TransportEvent::Unauthorized { message: None }));
    let signal = tokio::time::timeout(Duration::from_secs(1), signals.recv())
        .await
        .expect("signal in time")
        .expect("signal");
    assert_eq!(
        signal,
        ConnectionSignal::Unauthorized {
            generation: connection.generation()
        }
    );
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.current().is_none());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(dialer.dial_count(), 1, "unauthorized must not redial");
}

#[tokio::test]
async fn unauthorized_handshake_is_not_retried() {
    let dialer = ScriptedDialer::new();
    dialer.push(DialStep::Reject(ClientError::Unauthorized));
    let manager = manager_with(Arc::clone(&dialer));
    let mut signals = manager.subscribe_signals();
    manager.connect(credential("revoked"));

    let err = manager
        .wait_for_connect(Duration::from_secs(1))
        .await
        .expect_err("rejected");
    assert_eq!(err, ClientError::Unauthorized);
    assert!(signals.recv().await.is_ok());
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(dialer.dial_count(), 1);
}

#[tokio::test]
async fn disconnect_is_terminal_and_idempotent() {
    let dialer = ScriptedDialer::new();
    let manager = manager_with(Arc::clone(&dialer));
    let connection = manager.connect(credential("tok-a"));
    manager
        .wait_for_connect(Duration::from_secs(1))
        .await
        .expect("connected");

    manager.disconnect();
    manager.disconnect();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(connection.is_closed());
    assert!(manager.current().is_none());
    assert!(matches!(
        connection.on(EventKind::NewMessage, |_| {}),
        Err(ClientError::TransportClosed)
    ));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(dialer.dial_count(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn detaching_a_handle_removes_only_that_binding() {
    let dialer = ScriptedDialer::new();
    let manager = manager_with(Arc::clone(&dialer));
    let connection = manager.connect(credential("tok-a"));
    manager
        .wait_for_connect(Duration::from_secs(1))
        .await
        .expect("connected");

    let first = connection.on(EventKind::NewMessage, |_| {}).expect("first");
    let _second = connection.on(EventKind::NewMessage, |_| {}).expect("second");
    assert_eq!(connection.listener_count(EventKind::NewMessage), 2);

    first.detach().expect("detach");
    assert_eq!(connection.listener_count(EventKind::NewMessage), 1);
}

#[tokio::test]
async fn detaching_after_teardown_reports_transport_closed() {
    let dialer = ScriptedDialer::new();
    let manager = manager_with(Arc::clone(&dialer));
    let connection = manager.connect(credential("tok-a"));
    let handle = connection.on(EventKind::NewMessage, |_| {}).expect("listen");

    manager.disconnect();
    assert_eq!(handle.detach(), Err(ClientError::TransportClosed));
}

#[tokio::test]
async fn retry_redials_a_failed_connection_immediately() {
    let dialer = ScriptedDialer::new();
    dialer.push(DialStep::Reject(ClientError::Handshake("nope".into())));
    let manager = Arc::new(ConnectionManager::new(
        dialer.clone(),
        crate::test_support::test_endpoint(),
        ReconnectPolicy {
            connect_timeout: Duration::from_millis(200),
            delay_min: Duration::from_secs(30),
            delay_max: Duration::from_secs(30),
        },
    ));
    manager.connect(credential("tok-a"));
    let _ = manager.wait_for_connect(Duration::from_secs(1)).await;
    assert_eq!(manager.state(), ConnectionState::Failed);

    manager.retry().expect("connection");
    manager
        .wait_for_connect(Duration::from_secs(1))
        .await
        .expect("connected after manual retry");
    assert_eq!(dialer.dial_count(), 2);
}
