//! WebSocket connection handler
//!
//! Drives a single client connection through its three states:
//!
//! - **Connecting**: the socket is accepted and must present a bearer token
//!   as a `token` query parameter. A missing, invalid or unresolvable
//!   credential closes the connection with a policy close frame; there is no
//!   partial admission and no retry.
//! - **Authenticated**: the connection is registered (last-connect-wins,
//!   with an explicit close pushed to any superseded socket), a confirmation
//!   event is sent, and an unconditional heartbeat ping runs on a fixed
//!   interval regardless of traffic.
//! - **Closed**: on client close, socket error, or heartbeat send failure
//!   the loop ends, the registry entry is removed (guarded so a superseded
//!   socket cannot clobber its successor), and the user's offline status is
//!   broadcast.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::FeedError;
use crate::model::User;
use crate::realtime::dispatcher::{Audience, EventDispatcher};
use crate::realtime::protocol::{ClientMessage, Envelope, Event};
use crate::realtime::registry::{ConnectionRegistry, LiveConnection, OutboundFrame};
use crate::store::Store;

/// Tunables for the connection lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct SocketConfig {
    /// Interval of the unconditional keepalive ping.
    pub heartbeat_interval: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self { heartbeat_interval: Duration::from_secs(30) }
    }
}

/// Pull the bearer token out of the upgrade request's query string.
fn extract_token(query: Option<&str>) -> Option<String> {
    let query = query?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token" && !value.is_empty()).then(|| value.to_string())
    })
}

async fn reject(mut ws: WebSocketStream<TcpStream>, reason: &'static str) {
    let frame = CloseFrame { code: CloseCode::Policy, reason: reason.into() };
    if let Err(e) = ws.close(Some(frame)).await {
        tracing::debug!("Error closing rejected connection: {}", e);
    }
}

/// Accept, authenticate and run a single WebSocket connection.
pub async fn handle_connection(
    stream: TcpStream,
    store: Arc<Store>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<EventDispatcher>,
    config: SocketConfig,
) {
    let addr = stream.peer_addr().ok();
    tracing::info!("New connection attempt from {:?}", addr);

    let mut query: Option<String> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        query = req.uri().query().map(str::to_string);
        Ok(resp)
    };
    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::error!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let token = match extract_token(query.as_deref()) {
        Some(token) => token,
        None => {
            tracing::info!("Connection from {:?} rejected: no credential", addr);
            reject(ws, "Authentication required").await;
            return;
        }
    };

    let user = match store.resolve_token(&token) {
        Ok(user) => user,
        Err(FeedError::NotFound { .. }) => {
            tracing::info!("Connection from {:?} rejected: user not found", addr);
            reject(ws, "User not found").await;
            return;
        }
        Err(e) => {
            tracing::info!("Connection from {:?} rejected: {}", addr, e);
            reject(ws, "Authentication failed").await;
            return;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let conn = LiveConnection::new(user.id.clone(), user.username.clone(), user.name.clone(), tx);
    let connection_id = conn.connection_id;

    // Last-connect-wins: push an explicit close to any displaced socket so
    // it does not linger until its heartbeat fails.
    if let Some(superseded) = registry.register(conn) {
        let _ = superseded
            .sender
            .send(OutboundFrame::Close { reason: "Signed in from another connection" });
    }

    tracing::info!("WebSocket connected for user: {}", user.username);
    tracing::info!("Total connected clients: {}", registry.count());

    let mut actor = ConnectionActor {
        ws,
        user,
        connection_id,
        outbound_rx: rx,
        registry,
        dispatcher,
        config,
    };
    actor.run().await;

    tracing::info!("Connection closed from {:?}", addr);
}

struct ConnectionActor {
    ws: WebSocketStream<TcpStream>,
    user: User,
    connection_id: uuid::Uuid,
    outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<EventDispatcher>,
    config: SocketConfig,
}

impl ConnectionActor {
    async fn run(&mut self) {
        let established = self
            .send_event(Event::ConnectionEstablished {
                message: "Real-time connection established".into(),
            })
            .await;
        if !established {
            self.cleanup();
            return;
        }

        self.dispatcher.dispatch(
            Audience::AllExcept(self.user.id.clone()),
            Event::UserOnlineStatus { user_id: self.user.id.clone(), online: true },
        );

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );

        loop {
            tokio::select! {
                // Unconditional keepalive, independent of traffic. A failed
                // send means a half-open socket: tear down.
                _ = heartbeat.tick() => {
                    if !self.send_event(Event::Ping).await {
                        tracing::info!("Heartbeat failed for {}, closing", self.user.username);
                        break;
                    }
                }

                // Events routed to this user by the dispatcher.
                frame = self.outbound_rx.recv() => {
                    match frame {
                        Some(OutboundFrame::Event(json)) => {
                            if self.ws.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        Some(OutboundFrame::Close { reason }) => {
                            let frame = CloseFrame { code: CloseCode::Policy, reason: reason.into() };
                            let _ = self.ws.send(Message::Close(Some(frame))).await;
                            break;
                        }
                        None => break,
                    }
                }

                // Messages from the client.
                msg = self.ws.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if !self.handle_message(&text).await {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!("Client {} requested close", self.user.username);
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = self.ws.send(Message::Pong(data)).await;
                        }
                        Some(Err(e)) => {
                            tracing::error!("WebSocket error: {}", e);
                            break;
                        }
                        None => break,
                        _ => {}
                    }
                }
            }
        }

        self.cleanup();
    }

    /// Handle one inbound text frame. Returns false when the socket failed
    /// while replying and the loop should stop.
    async fn handle_message(&mut self, text: &str) -> bool {
        let reply = match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::TypingStart { post_id }) => {
                self.broadcast_typing(post_id, true);
                None
            }
            Ok(ClientMessage::TypingStop { post_id }) => {
                self.broadcast_typing(post_id, false);
                None
            }
            Ok(ClientMessage::Ping) => Some(Event::Pong),
            Ok(ClientMessage::Pong { .. }) => {
                self.registry.touch(&self.user.id);
                None
            }
            Err(_) => {
                tracing::debug!("Unrecognized message from {}: {}", self.user.username, text);
                Some(Event::Error { message: "Unrecognized or malformed message".into() })
            }
        };

        match reply {
            Some(event) => self.send_event(event).await,
            None => true,
        }
    }

    fn broadcast_typing(&self, post_id: String, typing: bool) {
        // Transient, never persisted; the actor is excluded since its own UI
        // already reflects the local state.
        self.dispatcher.dispatch(
            Audience::AllExcept(self.user.id.clone()),
            Event::UserTyping {
                post_id,
                user_id: self.user.id.clone(),
                display_name: self.user.name.clone(),
                typing,
            },
        );
    }

    async fn send_event(&mut self, event: Event) -> bool {
        let json = Envelope::new(event).to_json();
        self.ws.send(Message::Text(json)).await.is_ok()
    }

    fn cleanup(&mut self) {
        // Guarded: a superseded socket arriving here cannot remove its
        // successor's entry. Running twice is safe.
        let removed = self.registry.unregister(&self.user.id, self.connection_id);
        if removed {
            self.dispatcher.dispatch(
                Audience::AllExcept(self.user.id.clone()),
                Event::UserOnlineStatus { user_id: self.user.id.clone(), online: false },
            );
            tracing::info!("WebSocket disconnected for user: {}", self.user.username);
            tracing::info!("Remaining clients: {}", self.registry.count());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_token() {
        assert_eq!(extract_token(Some("token=abc")), Some("abc".into()));
        assert_eq!(
            extract_token(Some("foo=1&token=abc&bar=2")),
            Some("abc".into())
        );
        assert_eq!(extract_token(Some("token=")), None);
        assert_eq!(extract_token(Some("foo=1")), None);
        assert_eq!(extract_token(None), None);
    }
}
