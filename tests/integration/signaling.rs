// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! End-to-end signaling tests against an in-process relay.
//!
//! Each test starts a server on `127.0.0.1:0`, connects real WebSocket
//! clients, and checks what each client receives. The relay state is shared
//! with the test so it can wait for membership changes before sending,
//! because joins from different connections are not ordered relative to
//! each other.
//!
//! Verification command: `cargo test --test signaling`

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rendezvous_relay::relay::{RelayState, start_server_with_state};
use tokio_tungstenite::tungstenite;

// =============================================================================
// Type aliases and helpers
// =============================================================================

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// How long a client waits before concluding nothing was delivered.
const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// Starts a relay on a random port, returning its address and shared state.
async fn start_relay() -> (std::net::SocketAddr, Arc<RelayState>) {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start test relay");
    (addr, state)
}

/// Connects a WebSocket client to the given path.
async fn connect(addr: std::net::SocketAddr, path: &str) -> WsStream {
    let url = format!("ws://{addr}{path}");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

/// Sends a raw text frame.
async fn send_text(ws: &mut WsStream, raw: &str) {
    ws.send(tungstenite::Message::text(raw)).await.unwrap();
}

/// Sends a join and waits until the relay has applied it.
async fn join(ws: &mut WsStream, state: &RelayState, room_id: &str, expected_members: usize) {
    send_text(ws, &format!(r#"{{"type":"join","roomId":"{room_id}"}}"#)).await;
    wait_for_members(state, room_id, expected_members).await;
}

/// Polls the registry until `room_id` has `count` members.
async fn wait_for_members(state: &RelayState, room_id: &str, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.registry().members(room_id).len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("room {room_id} never reached {count} members"));
}

/// Receives the next text frame, failing after a timeout.
async fn recv_text(ws: &mut WsStream) -> String {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("recv timed out")
        .unwrap()
        .unwrap();
    msg.to_text().unwrap().to_string()
}

/// Asserts that no frame arrives within [`QUIET_PERIOD`].
async fn assert_silent(ws: &mut WsStream) {
    let result = tokio::time::timeout(QUIET_PERIOD, ws.next()).await;
    assert!(result.is_err(), "expected no delivery, got {result:?}");
}

// =============================================================================
// Forwarding
// =============================================================================

/// X and Y join "abc"; X's offer reaches Y unmodified and never echoes to X.
#[tokio::test]
async fn offer_forwarded_verbatim() {
    let (addr, state) = start_relay().await;
    let mut ws_x = connect(addr, "/").await;
    let mut ws_y = connect(addr, "/").await;
    join(&mut ws_x, &state, "abc", 1).await;
    join(&mut ws_y, &state, "abc", 2).await;

    let offer = r#"{"type":"offer","roomId":"abc","sdp":"v=0..."}"#;
    send_text(&mut ws_x, offer).await;

    assert_eq!(recv_text(&mut ws_y).await, offer);
    assert_silent(&mut ws_x).await;
}

/// Extra fields and formatting survive forwarding byte for byte.
#[tokio::test]
async fn answer_and_candidate_preserve_extra_fields() {
    let (addr, state) = start_relay().await;
    let mut ws_x = connect(addr, "/ws").await;
    let mut ws_y = connect(addr, "/ws").await;
    join(&mut ws_x, &state, "room", 1).await;
    join(&mut ws_y, &state, "room", 2).await;

    let answer = r#"{ "type": "answer", "roomId": "room", "sdp": "v=0", "meta": {"seq": 1} }"#;
    let candidate = r#"{"type":"ice-candidate","roomId":"room","candidate":{"sdpMid":"0","sdpMLineIndex":0}}"#;
    send_text(&mut ws_y, answer).await;
    send_text(&mut ws_y, candidate).await;

    // Per-connection order is preserved.
    assert_eq!(recv_text(&mut ws_x).await, answer);
    assert_eq!(recv_text(&mut ws_x).await, candidate);
}

/// A candidate sent while alone in the room goes nowhere and closes nothing.
#[tokio::test]
async fn lone_candidate_is_not_delivered() {
    let (addr, state) = start_relay().await;
    let mut ws_x = connect(addr, "/").await;
    join(&mut ws_x, &state, "abc", 1).await;

    send_text(
        &mut ws_x,
        r#"{"type":"ice-candidate","roomId":"abc","candidate":"candidate:0 1 UDP"}"#,
    )
    .await;

    assert_silent(&mut ws_x).await;
    assert_eq!(state.registry().members("abc").len(), 1);
}

/// Three members: the sender's message reaches both others exactly once.
#[tokio::test]
async fn broadcast_reaches_every_other_member_once() {
    let (addr, state) = start_relay().await;
    let mut ws_a = connect(addr, "/").await;
    let mut ws_b = connect(addr, "/").await;
    let mut ws_c = connect(addr, "/").await;
    join(&mut ws_a, &state, "trio", 1).await;
    join(&mut ws_b, &state, "trio", 2).await;
    join(&mut ws_c, &state, "trio", 3).await;

    let offer = r#"{"type":"offer","roomId":"trio","sdp":"x"}"#;
    send_text(&mut ws_a, offer).await;

    assert_eq!(recv_text(&mut ws_b).await, offer);
    assert_eq!(recv_text(&mut ws_c).await, offer);
    assert_silent(&mut ws_b).await;
    assert_silent(&mut ws_c).await;
    assert_silent(&mut ws_a).await;
}

// =============================================================================
// Membership lifecycle
// =============================================================================

/// Y's transport terminates; X's later broadcast reaches nobody and the
/// room contains only X.
#[tokio::test]
async fn terminated_peer_leaves_room() {
    let (addr, state) = start_relay().await;
    let mut ws_x = connect(addr, "/").await;
    let mut ws_y = connect(addr, "/").await;
    join(&mut ws_x, &state, "r1", 1).await;
    join(&mut ws_y, &state, "r1", 2).await;

    ws_y.close(None).await.unwrap();
    wait_for_members(&state, "r1", 1).await;

    send_text(&mut ws_x, r#"{"type":"offer","roomId":"r1"}"#).await;
    assert_silent(&mut ws_x).await;

    let members = state.registry().members("r1");
    assert_eq!(members.len(), 1);

    // Once X goes too, the room is gone.
    ws_x.close(None).await.unwrap();
    wait_for_members(&state, "r1", 0).await;
    assert!(!state.registry().contains_room("r1"));
}

/// Dropping the TCP stream without a close frame also runs the leave path.
#[tokio::test]
async fn abrupt_disconnect_leaves_room() {
    let (addr, state) = start_relay().await;
    let mut ws_x = connect(addr, "/").await;
    let mut ws_y = connect(addr, "/").await;
    join(&mut ws_x, &state, "r2", 1).await;
    join(&mut ws_y, &state, "r2", 2).await;

    drop(ws_y);
    wait_for_members(&state, "r2", 1).await;
    drop(ws_x);
    wait_for_members(&state, "r2", 0).await;
    assert_eq!(state.registry().room_count(), 0);
}

/// Re-joining moves the connection; the old room stops receiving from it.
#[tokio::test]
async fn rejoin_moves_connection() {
    let (addr, state) = start_relay().await;
    let mut ws_x = connect(addr, "/").await;
    let mut ws_y = connect(addr, "/").await;
    join(&mut ws_x, &state, "a", 1).await;
    join(&mut ws_y, &state, "a", 2).await;

    join(&mut ws_x, &state, "b", 1).await;
    wait_for_members(&state, "a", 1).await;

    // Y's broadcast to "a" no longer reaches X.
    send_text(&mut ws_y, r#"{"type":"offer","roomId":"a"}"#).await;
    assert_silent(&mut ws_x).await;

    // Y follows X into "b"; "a" is destroyed.
    join(&mut ws_y, &state, "b", 2).await;
    assert!(!state.registry().contains_room("a"));

    let offer = r#"{"type":"offer","roomId":"b"}"#;
    send_text(&mut ws_y, offer).await;
    assert_eq!(recv_text(&mut ws_x).await, offer);
}

/// Joining the same room twice keeps a single membership.
#[tokio::test]
async fn double_join_is_idempotent() {
    let (addr, state) = start_relay().await;
    let mut ws_x = connect(addr, "/").await;
    let mut ws_y = connect(addr, "/").await;
    join(&mut ws_x, &state, "same", 1).await;
    join(&mut ws_y, &state, "same", 2).await;
    send_text(&mut ws_x, r#"{"type":"join","roomId":"same"}"#).await;

    let offer = r#"{"type":"offer","roomId":"same"}"#;
    send_text(&mut ws_y, offer).await;
    assert_eq!(recv_text(&mut ws_x).await, offer);
    assert_silent(&mut ws_x).await;
    assert_eq!(state.registry().members("same").len(), 2);
}

// =============================================================================
// Ignored and malformed input
// =============================================================================

/// Unknown types, malformed JSON and missing fields are dropped without
/// closing the connection or touching the registry.
#[tokio::test]
async fn bad_input_is_dropped_and_connection_survives() {
    let (addr, state) = start_relay().await;
    let mut ws_x = connect(addr, "/").await;
    let mut ws_y = connect(addr, "/").await;
    join(&mut ws_y, &state, "r1", 1).await;

    for raw in [
        r#"{"type":"bogus","roomId":"r1"}"#,
        "{not json",
        r#"{"roomId":"r1"}"#,
        r#"{"type":"offer"}"#,
        r#"{"type":"join"}"#,
        "[]",
    ] {
        send_text(&mut ws_x, raw).await;
    }
    ws_x.send(tungstenite::Message::binary(vec![0xFF, 0x00, 0xFE]))
        .await
        .unwrap();

    assert_silent(&mut ws_y).await;
    assert_silent(&mut ws_x).await;
    assert_eq!(state.registry().room_count(), 1);

    // X is still connected and can join normally.
    join(&mut ws_x, &state, "r1", 2).await;
}

/// JSON in a binary frame is routed like text and forwarded as text.
#[tokio::test]
async fn binary_json_is_forwarded_as_text() {
    let (addr, state) = start_relay().await;
    let mut ws_x = connect(addr, "/").await;
    let mut ws_y = connect(addr, "/").await;
    join(&mut ws_x, &state, "bin", 1).await;
    join(&mut ws_y, &state, "bin", 2).await;

    let offer = r#"{"type":"offer","roomId":"bin","sdp":"v=0"}"#;
    ws_x.send(tungstenite::Message::binary(offer.as_bytes().to_vec()))
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), ws_y.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(msg.is_text());
    assert_eq!(msg.to_text().unwrap(), offer);
}

// =============================================================================
// Server-side shutdown
// =============================================================================

/// `close_all_connections` closes every socket and empties the registry.
#[tokio::test]
async fn close_all_connections_cleans_up() {
    let (addr, state) = start_relay().await;
    let mut ws_x = connect(addr, "/").await;
    let mut ws_y = connect(addr, "/").await;
    join(&mut ws_x, &state, "bye", 1).await;
    join(&mut ws_y, &state, "bye", 2).await;

    state.close_all_connections().await;

    for ws in [&mut ws_x, &mut ws_y] {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(msg.is_close(), "expected close frame, got {msg:?}");
    }

    wait_for_members(&state, "bye", 0).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.connection_count().await != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

/// Joins still queued in the socket when the relay closes a connection are
/// never applied after its leave, so no room outlives its connections.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_all_during_join_flood_leaves_no_rooms() {
    const CLIENTS: usize = 4;
    const JOINS_PER_CLIENT: usize = 2000;

    for round in 0..3 {
        let (addr, state) = start_relay().await;
        let mut clients = Vec::with_capacity(CLIENTS);
        for _ in 0..CLIENTS {
            clients.push(connect(addr, "/").await);
        }

        for (i, ws) in clients.iter_mut().enumerate() {
            for n in 0..JOINS_PER_CLIENT {
                let room = format!("flood-{round}-{i}-{}", n % 2);
                let raw = format!(r#"{{"type":"join","roomId":"{room}"}}"#);
                ws.feed(tungstenite::Message::text(raw)).await.unwrap();
            }
            ws.flush().await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while state.registry().connection_count() != CLIENTS {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        state.close_all_connections().await;

        tokio::time::timeout(Duration::from_secs(10), async {
            while state.connection_count().await != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(QUIET_PERIOD).await;

        assert_eq!(state.registry().room_count(), 0, "round {round} leaked a room");
        assert_eq!(state.registry().connection_count(), 0);
        drop(clients);
    }
}
