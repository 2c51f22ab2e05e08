use std::{collections::HashMap, time::Duration};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use shared::{domain::ConnectionId, protocol::ServerEvent};
use tokio::net::TcpListener;

use super::*;

#[derive(Debug, Clone, PartialEq)]
struct Handshake {
    authorization: Option<String>,
    user_id: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(handshakes): State<mpsc::UnboundedSender<Handshake>>,
) -> Response {
    let _ = handshakes.send(Handshake {
        authorization: headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned),
        user_id: query.get("user_id").cloned(),
    });
    ws.on_upgrade(echo)
}

async fn echo(mut socket: WebSocket) {
    let hello = serde_json::to_string(&ServerEvent::HealthCheck {
        connection_id: ConnectionId::new("srv-1"),
    })
    .expect("encode hello");
    if socket.send(WsMessage::Text(hello)).await.is_err() {
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            WsMessage::Text(text) => {
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    return;
                }
            }
            WsMessage::Close(_) => return,
            _ => {}
        }
    }
}

async fn spawn_ws_server() -> (String, mpsc::UnboundedReceiver<Handshake>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().route("/ws", get(ws_handler)).with_state(tx);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), rx)
}

async fn next_event(connection: &mut TransportConnection) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), connection.events.recv())
        .await
        .expect("event in time")
        .expect("event channel open")
}

#[test]
fn ws_url_switches_scheme_and_appends_endpoint() {
    assert_eq!(
        ws_url_for("http://localhost:8443", UserId(7))
            .expect("url")
            .as_str(),
        "ws://localhost:8443/ws?user_id=7"
    );
    assert_eq!(
        ws_url_for("https://chat.example.com/api/", UserId(1))
            .expect("url")
            .as_str(),
        "wss://chat.example.com/api/ws?user_id=1"
    );
    assert!(matches!(
        ws_url_for("ftp://example.com", UserId(1)),
        Err(TransportError::InvalidUrl(_))
    ));
}

#[tokio::test]
async fn websocket_transport_round_trips_frames_and_headers() {
    let (server_url, mut handshakes) = spawn_ws_server().await;
    let url = ws_url_for(&server_url, UserId(42)).expect("url");

    let mut connection = WebSocketTransport
        .open(ConnectRequest {
            url,
            headers: vec![("Authorization".into(), "Bearer secret".into())],
        })
        .await
        .expect("open");

    let handshake = handshakes.recv().await.expect("handshake");
    assert_eq!(
        handshake,
        Handshake {
            authorization: Some("Bearer secret".into()),
            user_id: Some("42".into()),
        }
    );

    let TransportEvent::Data(hello) = next_event(&mut connection).await else {
        panic!("expected hello frame");
    };
    let hello: ServerEvent = serde_json::from_slice(&hello).expect("decode hello");
    assert_eq!(hello.kind(), "health_check");

    connection
        .commands
        .send(TransportCommand::Send(b"{\"ping\":1}".to_vec()))
        .expect("send");
    assert_eq!(
        next_event(&mut connection).await,
        TransportEvent::Data(b"{\"ping\":1}".to_vec())
    );

    connection
        .commands
        .send(TransportCommand::Close)
        .expect("close");
    loop {
        match next_event(&mut connection).await {
            TransportEvent::Closed(_) | TransportEvent::Error(_) => break,
            TransportEvent::Data(_) => continue,
        }
    }
}

#[tokio::test]
async fn open_fails_when_nothing_listens() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let result = WebSocketTransport
        .open(ConnectRequest {
            url: ws_url_for(&format!("http://{addr}"), UserId(1)).expect("url"),
            headers: Vec::new(),
        })
        .await;

    assert!(matches!(result, Err(TransportError::Connect(_))));
}
