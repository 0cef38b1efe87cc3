//! Integration tests for the realtime layer
//!
//! Each test spins up an in-process daemon on an ephemeral port, connects
//! real WebSocket clients through the full token handshake, and drives
//! mutations through the service while asserting what each connection
//! observes on the wire.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use therein_engine::model::User;
use therein_engine::realtime::connection::{handle_connection, SocketConfig};
use therein_engine::realtime::dispatcher::EventDispatcher;
use therein_engine::realtime::protocol::{Envelope, Event};
use therein_engine::realtime::registry::ConnectionRegistry;
use therein_engine::service::{FeedService, PostInput};
use therein_engine::store::{LikeTarget, Store};

struct Daemon {
    addr: SocketAddr,
    store: Arc<Store>,
    registry: Arc<ConnectionRegistry>,
    service: FeedService,
}

async fn spawn_daemon() -> Daemon {
    let store = Arc::new(Store::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&registry)));
    let service = FeedService::new(Arc::clone(&store), Arc::clone(&dispatcher));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = SocketConfig { heartbeat_interval: Duration::from_secs(30) };

    let accept_store = Arc::clone(&store);
    let accept_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let store = Arc::clone(&accept_store);
            let registry = Arc::clone(&accept_registry);
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                handle_connection(stream, store, registry, dispatcher, config).await;
            });
        }
    });

    Daemon { addr, store, registry, service }
}

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(daemon: &Daemon, token: &str) -> ClientSocket {
    let url = format!("ws://{}/?token={}", daemon.addr, token);
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn connect_user(daemon: &Daemon, username: &str, name: &str) -> (User, ClientSocket) {
    let user = daemon.store.create_user(username, name).unwrap();
    let token = daemon.store.issue_token(&user.id).unwrap();
    let mut ws = connect(daemon, &token).await;
    let established = wait_for(&mut ws, "connection_established").await;
    assert!(matches!(established.event, Event::ConnectionEstablished { .. }));
    (user, ws)
}

/// Read frames until an event with the given discriminator arrives,
/// skipping everything else. Panics after two seconds.
async fn wait_for(ws: &mut ClientSocket, name: &str) -> Envelope {
    let deadline = Duration::from_secs(2);
    tokio::time::timeout(deadline, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let envelope: Envelope = serde_json::from_str(&text)
                        .unwrap_or_else(|e| panic!("bad frame {text}: {e}"));
                    if envelope.event.name() == name {
                        return envelope;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("socket ended while waiting for {name}: {other:?}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
}

/// Assert that no event with the given discriminator arrives within a
/// short observation window.
async fn assert_never(ws: &mut ClientSocket, name: &str) {
    let window = Duration::from_millis(300);
    let result = tokio::time::timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let envelope: Envelope = serde_json::from_str(&text).unwrap();
                    if envelope.event.name() == name {
                        panic!("unexpectedly received {name}: {text}");
                    }
                }
                Some(Ok(_)) => {}
                _ => return,
            }
        }
    })
    .await;
    // Timing out is the success path: nothing matching arrived.
    let _ = result;
}

fn post_input() -> PostInput {
    PostInput {
        title: "Mapping cortical columns".into(),
        content: "Preliminary results.".into(),
        category: "Neuroscience".into(),
        tags: vec!["cortex".into()],
    }
}

#[tokio::test]
async fn test_handshake_without_token_is_rejected() {
    let daemon = spawn_daemon().await;
    let (mut ws, _) = connect_async(format!("ws://{}/", daemon.addr)).await.unwrap();

    match ws.next().await {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(frame.reason, "Authentication required");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
    assert_eq!(daemon.registry.count(), 0);
}

#[tokio::test]
async fn test_handshake_with_invalid_token_is_rejected() {
    let daemon = spawn_daemon().await;
    let mut ws = connect(&daemon, "not-a-real-token").await;

    match ws.next().await {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(frame.reason, "Authentication failed");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_post_like_unlike_scenario() {
    let daemon = spawn_daemon().await;
    let (ada, mut ws_ada) = connect_user(&daemon, "ada", "Ada Lovelace").await;
    let (grace, mut ws_grace) = connect_user(&daemon, "grace", "Grace Hopper").await;

    // Ada creates a post: Grace sees exactly one new_post with Ada's
    // populated identity, Ada gets no echo.
    let post = daemon.service.create_post(&ada.id, post_input()).unwrap();
    let envelope = wait_for(&mut ws_grace, "new_post").await;
    match envelope.event {
        Event::NewPost { post: view } => {
            assert_eq!(view.id, post.id);
            assert_eq!(view.author.username, "ada");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_never(&mut ws_ada, "new_post").await;

    // Grace likes: both connections get the authoritative count, Ada also
    // gets a notification.
    let target = LikeTarget::Post { post_id: post.id.clone() };
    daemon.service.toggle_like(&grace.id, target.clone()).unwrap();

    for ws in [&mut ws_ada, &mut ws_grace] {
        let envelope = wait_for(ws, "post_like_updated").await;
        match envelope.event {
            Event::PostLikeUpdated { user_id, liked, like_count, .. } => {
                assert_eq!(user_id, grace.id);
                assert!(liked);
                assert_eq!(like_count, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    let envelope = wait_for(&mut ws_ada, "new_notification").await;
    match envelope.event {
        Event::NewNotification { notification } => {
            assert_eq!(notification.from_user.unwrap().username, "grace");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Grace unlikes: counts drop to zero everywhere, no second notification.
    daemon.service.toggle_like(&grace.id, target).unwrap();
    for ws in [&mut ws_ada, &mut ws_grace] {
        let envelope = wait_for(ws, "post_like_updated").await;
        match envelope.event {
            Event::PostLikeUpdated { liked, like_count, .. } => {
                assert!(!liked);
                assert_eq!(like_count, 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_never(&mut ws_ada, "new_notification").await;
    assert_eq!(daemon.store.notifications(&ada.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_follow_unfollow_scenario() {
    let daemon = spawn_daemon().await;
    let (ada, mut ws_ada) = connect_user(&daemon, "ada", "Ada Lovelace").await;
    let (grace, mut ws_grace) = connect_user(&daemon, "grace", "Grace Hopper").await;

    daemon.service.toggle_follow(&ada.id, &grace.id).unwrap();

    let envelope = wait_for(&mut ws_grace, "follow_updated").await;
    match envelope.event {
        Event::FollowUpdated { follower_id, following } => {
            assert_eq!(follower_id, ada.id);
            assert!(following);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    let envelope = wait_for(&mut ws_grace, "new_notification").await;
    match envelope.event {
        Event::NewNotification { notification } => {
            assert_eq!(notification.message, "Ada Lovelace started following you");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    let envelope = wait_for(&mut ws_ada, "follow_status_updated").await;
    match envelope.event {
        Event::FollowStatusUpdated { target_user_id, following } => {
            assert_eq!(target_user_id, grace.id);
            assert!(following);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Unfollow: symmetric events, no notification.
    daemon.service.toggle_follow(&ada.id, &grace.id).unwrap();
    let envelope = wait_for(&mut ws_grace, "follow_updated").await;
    assert!(matches!(envelope.event, Event::FollowUpdated { following: false, .. }));
    let envelope = wait_for(&mut ws_ada, "follow_status_updated").await;
    assert!(matches!(envelope.event, Event::FollowStatusUpdated { following: false, .. }));
    assert_never(&mut ws_grace, "new_notification").await;
}

#[tokio::test]
async fn test_typing_indicator_broadcast_excludes_actor() {
    let daemon = spawn_daemon().await;
    let (_ada, mut ws_ada) = connect_user(&daemon, "ada", "Ada Lovelace").await;
    let (_grace, mut ws_grace) = connect_user(&daemon, "grace", "Grace Hopper").await;

    ws_ada
        .send(Message::Text(r#"{"type":"typing_start","postId":"p1"}"#.into()))
        .await
        .unwrap();

    let envelope = wait_for(&mut ws_grace, "user_typing").await;
    match envelope.event {
        Event::UserTyping { post_id, display_name, typing, .. } => {
            assert_eq!(post_id, "p1");
            assert_eq!(display_name, "Ada Lovelace");
            assert!(typing);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_never(&mut ws_ada, "user_typing").await;
}

#[tokio::test]
async fn test_unrecognized_message_gets_error_reply() {
    let daemon = spawn_daemon().await;
    let (_ada, mut ws_ada) = connect_user(&daemon, "ada", "Ada Lovelace").await;

    ws_ada
        .send(Message::Text(r#"{"type":"subscribe_posts"}"#.into()))
        .await
        .unwrap();

    let envelope = wait_for(&mut ws_ada, "error").await;
    assert!(matches!(envelope.event, Event::Error { .. }));
}

#[tokio::test]
async fn test_client_ping_gets_pong() {
    let daemon = spawn_daemon().await;
    let (_ada, mut ws_ada) = connect_user(&daemon, "ada", "Ada Lovelace").await;

    ws_ada
        .send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    wait_for(&mut ws_ada, "pong").await;
}

#[tokio::test]
async fn test_duplicate_login_closes_superseded_connection() {
    let daemon = spawn_daemon().await;
    let ada = daemon.store.create_user("ada", "Ada Lovelace").unwrap();
    let token = daemon.store.issue_token(&ada.id).unwrap();

    let mut first = connect(&daemon, &token).await;
    wait_for(&mut first, "connection_established").await;

    let mut second = connect(&daemon, &token).await;
    wait_for(&mut second, "connection_established").await;

    // The displaced socket receives an explicit close instead of leaking.
    let deadline = Duration::from_secs(2);
    let closed = tokio::time::timeout(deadline, async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => {}
                Some(Err(_)) => return true,
            }
        }
    })
    .await
    .expect("superseded connection was not closed");
    assert!(closed);
    assert_eq!(daemon.registry.count(), 1);
}

#[tokio::test]
async fn test_disconnect_reaps_registry_entry() {
    let daemon = spawn_daemon().await;
    let (_ada, ws_ada) = connect_user(&daemon, "ada", "Ada Lovelace").await;
    let (_grace, mut ws_grace) = connect_user(&daemon, "grace", "Grace Hopper").await;
    assert_eq!(daemon.registry.count(), 2);

    drop(ws_ada);

    // Grace observes the offline broadcast once the server reaps the entry.
    let envelope = wait_for(&mut ws_grace, "user_online_status").await;
    match envelope.event {
        Event::UserOnlineStatus { online, .. } => assert!(!online),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(daemon.registry.count(), 1);
}
