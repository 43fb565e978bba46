use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message as ServerFrame, WebSocket, WebSocketUpgrade},
        State,
    },
    http::Uri,
    response::Response,
    routing::get,
    Router,
};
use parking_lot::Mutex;
use shared::domain::UserId;
use tokio::net::TcpListener;

use super::*;
use crate::test_support::message_json;

#[derive(Clone, Default)]
struct HandshakeLog {
    tokens: Arc<Mutex<Vec<String>>>,
    queries: Arc<Mutex<Vec<Option<String>>>>,
}

async fn chat_socket(
    State(log): State<HandshakeLog>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    log.queries.lock().push(uri.query().map(str::to_string));
    ws.on_upgrade(move |socket| serve_socket(socket, log))
}

async fn send_event(socket: &mut WebSocket, event: TransportEvent) {
    let frame = event.to_frame().expect("frame");
    let _ = socket.send(ServerFrame::Text(frame)).await;
}

async fn serve_socket(mut socket: WebSocket, log: HandshakeLog) {
    let Some(Ok(ServerFrame::Text(text))) = socket.recv().await else {
        return;
    };
    let Ok(handshake) = serde_json::from_str::<HandshakeFrame>(&text) else {
        return;
    };
    log.tokens.lock().push(handshake.auth.token.clone());

    match handshake.auth.token.as_str() {
        "good" => {
            send_event(
                &mut socket,
                TransportEvent::Connect {
                    sid: Some("s-1".into()),
                },
            )
            .await;
            let _ = socket
                .send(ServerFrame::Text(r#"{"event":"typing","data":{}}"#.into()))
                .await;
            let _ = socket.send(ServerFrame::Text("not json".into())).await;
            let message = serde_json::from_value(message_json("m1", "u2", "u1", "hello"))
                .expect("message");
            send_event(&mut socket, TransportEvent::NewMessage(message)).await;
            send_event(
                &mut socket,
                TransportEvent::GetOnlineUsers(vec![UserId::new("u2")]),
            )
            .await;
            let _ = socket.send(ServerFrame::Close(None)).await;
        }
        "revoked" => {
            send_event(&mut socket, TransportEvent::Unauthorized { message: None }).await;
        }
        _ => {
            send_event(
                &mut socket,
                TransportEvent::ConnectError {
                    message: "invalid token".into(),
                },
            )
            .await;
        }
    }
}

async fn spawn_socket_server() -> (SocketAddr, HandshakeLog) {
    let log = HandshakeLog::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/chat", get(chat_socket))
        .with_state(log.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, log)
}

fn endpoint(addr: SocketAddr) -> Url {
    Url::parse(&format!("ws://{addr}/chat")).expect("endpoint")
}

fn credential(token: &str) -> Credential {
    Credential::new(token).expect("credential")
}

#[tokio::test]
async fn credential_travels_in_the_handshake_frame_only() {
    let (addr, log) = spawn_socket_server().await;

    let mut link = WsDialer
        .dial(&endpoint(addr), &credential("good"))
        .await
        .expect("acknowledged");

    match link.recv().await {
        Some(Ok(TransportEvent::NewMessage(message))) => {
            assert_eq!(message.id.as_str(), "m1");
            assert_eq!(message.text.as_deref(), Some("hello"));
        }
        other => panic!("expected newMessage, got {other:?}"),
    }
    assert_eq!(
        link.recv().await,
        Some(Ok(TransportEvent::GetOnlineUsers(vec![UserId::new("u2")])))
    );
    assert!(link.recv().await.is_none());

    assert_eq!(log.tokens.lock().clone(), vec!["good".to_string()]);
    assert_eq!(log.queries.lock().clone(), vec![None]);
}

#[tokio::test]
async fn connect_error_during_handshake_is_a_handshake_failure() {
    let (addr, _) = spawn_socket_server().await;

    let err = WsDialer
        .dial(&endpoint(addr), &credential("wrong"))
        .await
        .err()
        .expect("rejected");
    assert_eq!(err, ClientError::Handshake("invalid token".into()));
}

#[tokio::test]
async fn unauthorized_during_handshake_maps_to_unauthorized() {
    let (addr, _) = spawn_socket_server().await;

    let err = WsDialer
        .dial(&endpoint(addr), &credential("revoked"))
        .await
        .err()
        .expect("rejected");
    assert_eq!(err, ClientError::Unauthorized);
}

#[tokio::test]
async fn nothing_listening_is_a_handshake_failure() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = WsDialer
        .dial(&endpoint(addr), &credential("good"))
        .await
        .err()
        .expect("refused");
    assert!(matches!(err, ClientError::Handshake(_)));
}

#[test]
fn backoff_is_bounded_and_resets() {
    let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_millis(2_000));
    assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
    assert_eq!(backoff.attempts(), 2);
    for _ in 0..40 {
        assert!(backoff.next_delay() <= Duration::from_millis(2_000));
    }
    backoff.reset();
    assert_eq!(backoff.attempts(), 0);
    assert_eq!(backoff.next_delay(), Duration::from_millis(500));
}

#[test]
fn inverted_bounds_never_exceed_the_floor() {
    let mut backoff = Backoff::new(Duration::from_millis(800), Duration::from_millis(100));
    assert_eq!(backoff.next_delay(), Duration::from_millis(800));
    assert_eq!(backoff.next_delay(), Duration::from_millis(800));
}
