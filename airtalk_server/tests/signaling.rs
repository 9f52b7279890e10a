//! End-to-end tests driving the real router with WebSocket clients

use airtalk_protocol::{ClientMessage, ServerMessage, UserId};
use airtalk_server::{ServerConfig, ServerState, serve};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: ServerState,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = ServerState::new(config);
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn({
            let state = state.clone();
            async move {
                serve(listener, state, async move {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
            }
        });
        Self {
            addr,
            state,
            stop: Some(stop),
            task,
        }
    }

    async fn connect(&self) -> Client {
        connect_async(format!("ws://{}/", self.addr)).await.unwrap().0
    }
}

fn quick_config() -> ServerConfig {
    ServerConfig {
        allowed_origins: vec!["*".to_string()],
        ..ServerConfig::default()
    }
}

async fn send(client: &mut Client, message: ClientMessage) {
    client
        .send(Message::text(message.to_string()))
        .await
        .unwrap();
}

async fn find(client: &mut Client, id: &str) {
    send(
        client,
        ClientMessage::Find {
            id: Some(UserId::from(id)),
            country: Some(format!("flag-{id}")),
        },
    )
    .await;
}

async fn recv(client: &mut Client) -> ServerMessage {
    timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return text.as_str().parse().unwrap(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a server message")
}

async fn expect_closed(client: &mut Client) {
    timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("connection was not closed");
}

async fn pair(server: &TestServer) -> (Client, Client) {
    let mut a = server.connect().await;
    let mut b = server.connect().await;
    find(&mut a, "a").await;
    assert_eq!(recv(&mut a).await, ServerMessage::Searching);
    find(&mut b, "b").await;
    recv(&mut a).await;
    recv(&mut b).await;
    (a, b)
}

#[tokio::test]
async fn second_find_matches_both_with_waiting_user_initiating() {
    let server = TestServer::start(quick_config()).await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    find(&mut a, "a").await;
    assert_eq!(recv(&mut a).await, ServerMessage::Searching);

    find(&mut b, "b").await;
    assert_eq!(
        recv(&mut a).await,
        ServerMessage::Match {
            country: "flag-b".to_string(),
            partner_id: UserId::from("b"),
            initiator: Some(true),
        }
    );
    assert_eq!(
        recv(&mut b).await,
        ServerMessage::Match {
            country: "flag-a".to_string(),
            partner_id: UserId::from("a"),
            initiator: Some(false),
        }
    );
}

#[tokio::test]
async fn signals_are_relayed_verbatim_and_in_order() {
    let server = TestServer::start(quick_config()).await;
    let (mut a, mut b) = pair(&server).await;

    let envelopes = vec![
        json!({"sdp": {"type": "offer", "sdp": "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n"}}),
        json!({"candidate": {"candidate": "candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host", "sdpMid": "0"}}),
        json!({"candidate": {"candidate": "candidate:2 1 udp 1686052607 1.2.3.4 5001 typ srflx", "sdpMid": "0"}}),
    ];
    for data in &envelopes {
        send(&mut a, ClientMessage::Signal { data: data.clone() }).await;
    }
    for data in envelopes {
        assert_eq!(recv(&mut b).await, ServerMessage::Signal { data });
    }
}

#[tokio::test]
async fn signal_while_unmatched_is_silently_dropped() {
    let server = TestServer::start(quick_config()).await;
    let mut a = server.connect().await;

    send(
        &mut a,
        ClientMessage::Signal {
            data: json!({"sdp": {"type": "offer", "sdp": "v=0"}}),
        },
    )
    .await;
    send(&mut a, ClientMessage::Ping).await;
    assert!(matches!(recv(&mut a).await, ServerMessage::Pong { .. }));
}

#[tokio::test]
async fn unknown_types_are_ignored_but_garbage_tears_down() {
    let server = TestServer::start(quick_config()).await;
    let (mut a, mut b) = pair(&server).await;

    a.send(Message::text(r#"{"type":"dance"}"#)).await.unwrap();
    send(&mut a, ClientMessage::Ping).await;
    assert!(matches!(recv(&mut a).await, ServerMessage::Pong { .. }));

    a.send(Message::text("this is not json")).await.unwrap();
    expect_closed(&mut a).await;
    assert_eq!(recv(&mut b).await, ServerMessage::PartnerDisconnected);
    assert_eq!(recv(&mut b).await, ServerMessage::Searching);
}

#[tokio::test]
async fn partner_disconnect_requeues_survivor() {
    let server = TestServer::start(quick_config()).await;
    let (mut a, mut b) = pair(&server).await;

    a.close(None).await.unwrap();
    assert_eq!(recv(&mut b).await, ServerMessage::PartnerDisconnected);
    assert_eq!(recv(&mut b).await, ServerMessage::Searching);

    let mut c = server.connect().await;
    find(&mut c, "c").await;
    assert!(matches!(
        recv(&mut b).await,
        ServerMessage::Match { partner_id, initiator: Some(true), .. } if partner_id.as_str() == "c"
    ));
    assert!(matches!(recv(&mut c).await, ServerMessage::Match { .. }));
}

#[tokio::test]
async fn reconnect_request_leaves_match_and_rejoins() {
    let server = TestServer::start(quick_config()).await;
    let (mut a, mut b) = pair(&server).await;

    send(&mut a, ClientMessage::Reconnect).await;
    assert_eq!(recv(&mut b).await, ServerMessage::PartnerDisconnected);
    assert_eq!(recv(&mut b).await, ServerMessage::Searching);
    assert!(matches!(recv(&mut b).await, ServerMessage::Match { .. }));
    assert!(matches!(
        recv(&mut a).await,
        ServerMessage::Match { partner_id, .. } if partner_id.as_str() == "b"
    ));
}

#[tokio::test]
async fn stale_waiter_receives_timeout() {
    let server = TestServer::start(ServerConfig {
        max_waiting_time_ms: 200,
        stale_sweep_interval_ms: 50,
        ..quick_config()
    })
    .await;
    let mut a = server.connect().await;
    find(&mut a, "a").await;
    assert_eq!(recv(&mut a).await, ServerMessage::Searching);
    assert_eq!(recv(&mut a).await, ServerMessage::Timeout);
    assert_eq!(server.state.registry.lock().status().waiting_users, 0);

    // the evicted user is never matched afterwards
    let mut b = server.connect().await;
    find(&mut b, "b").await;
    assert_eq!(recv(&mut b).await, ServerMessage::Searching);
}

#[tokio::test]
async fn half_open_connection_is_reclaimed_by_heartbeat() {
    let server = TestServer::start(ServerConfig {
        heartbeat_interval_ms: 300,
        heartbeat_timeout_ms: 1_000,
        ..quick_config()
    })
    .await;
    let (a, mut b) = pair(&server).await;

    // `a` is never polled again, so it never answers a probe
    assert_eq!(recv(&mut b).await, ServerMessage::PartnerDisconnected);
    assert_eq!(recv(&mut b).await, ServerMessage::Searching);
    assert_eq!(server.state.registry.lock().status().active_connections, 1);
    drop(a);
}

#[tokio::test]
async fn disallowed_origin_is_refused() {
    let server = TestServer::start(ServerConfig::default()).await;
    let mut request = format!("ws://{}/", server.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("origin", "https://evil.example".parse().unwrap());
    assert!(connect_async(request).await.is_err());

    let mut request = format!("ws://{}/", server.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("origin", "http://localhost:5173".parse().unwrap());
    assert!(connect_async(request).await.is_ok());
}

#[tokio::test]
async fn shutdown_broadcasts_notice_before_closing() {
    let mut server = TestServer::start(quick_config()).await;
    let (mut a, mut b) = pair(&server).await;

    server.stop.take().unwrap().send(()).unwrap();
    assert_eq!(recv(&mut a).await, ServerMessage::ServerShutdown);
    assert_eq!(recv(&mut b).await, ServerMessage::ServerShutdown);
    expect_closed(&mut a).await;
    expect_closed(&mut b).await;
    timeout(Duration::from_secs(5), server.task).await.unwrap().unwrap();
}
