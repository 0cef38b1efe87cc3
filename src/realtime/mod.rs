//! ThereIn realtime layer
//!
//! A thin real-time layer that broadcasts feed state changes to connected
//! clients over WebSocket.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                    THEREIN DAEMON (therein-daemon)                │
//! │              Single process, one socket per user                  │
//! ├───────────────────────────────────────────────────────────────────┤
//! │                                                                   │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │              ConnectionRegistry (RwLock map)                │  │
//! │  │                                                             │  │
//! │  │  user_id ──► LiveConnection { connection_id, sender,        │  │
//! │  │                               connected_at, last_heartbeat }│  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! │                          ▲                                        │
//! │  FeedService ──► EventDispatcher ── resolves audience,            │
//! │   (mutations)          pushes enveloped events per connection     │
//! │                                                                   │
//! │  WebSocket handshake ──► token auth ──► register ──► heartbeat    │
//! │                                                                   │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol
//!
//! All messages are JSON over WebSocket:
//!
//! ```json
//! // Client -> Server
//! {"type": "typing_start", "postId": "..."}
//! {"type": "pong", "timestamp": 1700000000000}
//!
//! // Server -> Client
//! {"type": "connection_established", "message": "...", "timestamp": "..."}
//! {"type": "post_like_updated", "postId": "...", "userId": "...",
//!  "liked": true, "likeCount": 3, "timestamp": "..."}
//! ```
//!
//! Delivery is best-effort and at-most-once per connection: the audience is
//! resolved at dispatch time and nothing is queued for offline users.

pub mod connection;
pub mod dispatcher;
pub mod protocol;
pub mod registry;

pub use connection::{handle_connection, SocketConfig};
pub use dispatcher::{Audience, EventDispatcher};
pub use protocol::{ClientMessage, Envelope, Event};
pub use registry::{ActiveClient, ConnectionRegistry, LiveConnection, OutboundFrame};
