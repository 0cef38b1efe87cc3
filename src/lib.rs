//! Real-time core of the ThereIn research feed.
//!
//! Users post short articles, comment, reply, like, follow each other and
//! receive notifications; this crate is the subsystem that pushes those
//! state changes to connected clients as they happen and keeps client-side
//! state reconciled with the server's.
//!
//!
//!
//! # Components
//!
//! - [`store`] — in-process document store exposing the atomic conditional
//!   set operations the write path relies on
//! - [`service`] — write operations (likes, comments, replies, follows,
//!   post CRUD) with conflict avoidance and exactly one dispatch per commit
//! - [`realtime`] — connection registry, event dispatcher, wire protocol
//!   and WebSocket connection lifecycle
//! - [`client`] — consumer-side view-model store: optimistic mutations
//!   reconciled against server-confirmed events
//!
//! Data flows one way: a write hits [`service::FeedService`], commits
//! against [`store::Store`], then the resulting canonical state fans out
//! through [`realtime::EventDispatcher`] to every live connection in the
//! resolved audience, where [`client::FeedModel`] folds it into local state.
//!
//!
//!
//! # Delivery semantics
//!
//! Best-effort, at-most-once per connection. Nothing is queued for offline
//! users; a client that missed events re-fetches authoritative state on
//! reconnect. Every count-bearing event carries the post-mutation count, so
//! last-event-wins is a sufficient ordering discipline.
//!
//!
//!
//! # Running the daemon
//!
//! ```sh
//! therein-daemon --port 9870 --demo
//! ```

pub mod client;
pub mod error;
pub mod model;
pub mod realtime;
pub mod service;
pub mod store;

pub use error::{FeedError, Result};
