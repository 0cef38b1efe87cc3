//! Realtime wire protocol
//!
//! Defines the JSON message format pushed to and received from connected
//! clients. Every server-to-client frame is an [`Event`] wrapped in an
//! [`Envelope`] that stamps the `type` discriminator alongside a
//! server-generated RFC 3339 `timestamp`. Count-bearing events always carry
//! the authoritative post-mutation count; clients treat them as
//! replacements, never as deltas.

use serde::{Deserialize, Serialize};

use crate::model::{CommentView, Notification, PostView, ReplyView, UserProfile};
use crate::store::now_rfc3339;

/// Client-to-server message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// First keystroke in a comment/reply box
    TypingStart { post_id: String },
    /// Idle window elapsed, blur, or submit
    TypingStop { post_id: String },
    /// Client-side liveness probe
    Ping,
    /// Answer to a server heartbeat; the echoed timestamp is opaque
    Pong {
        #[serde(default)]
        timestamp: Option<serde_json::Value>,
    },
}

/// Server-to-client event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Event {
    /// Initial confirmation after a successful handshake
    ConnectionEstablished { message: String },
    NewPost { post: PostView },
    PostUpdated { post: PostView },
    PostDeleted { post_id: String },
    PostLikeUpdated {
        post_id: String,
        user_id: String,
        liked: bool,
        like_count: usize,
    },
    PostSaveUpdated {
        post_id: String,
        user_id: String,
        saved: bool,
        save_count: usize,
    },
    NewComment { post_id: String, comment: CommentView },
    CommentUpdated { post_id: String, comment: CommentView },
    CommentLikeUpdated {
        post_id: String,
        comment_id: String,
        user_id: String,
        liked: bool,
        like_count: usize,
    },
    CommentDeleted { post_id: String, comment_id: String },
    ReplyAdded {
        post_id: String,
        comment_id: String,
        reply: ReplyView,
    },
    ReplyUpdated {
        post_id: String,
        comment_id: String,
        reply: ReplyView,
    },
    ReplyLikeUpdated {
        post_id: String,
        comment_id: String,
        reply_id: String,
        user_id: String,
        liked: bool,
        like_count: usize,
    },
    ReplyDeleted {
        post_id: String,
        comment_id: String,
        reply_id: String,
    },
    NewNotification { notification: Notification },
    FollowUpdated { follower_id: String, following: bool },
    FollowStatusUpdated {
        target_user_id: String,
        following: bool,
    },
    UserTyping {
        post_id: String,
        user_id: String,
        display_name: String,
        typing: bool,
    },
    UserUpdated { user: UserProfile },
    UserOnlineStatus { user_id: String, online: bool },
    /// Server heartbeat; the envelope timestamp is the payload
    Ping,
    /// Answer to a client ping
    Pong,
    /// Reply to an unrecognized or malformed client message
    Error { message: String },
}

impl Event {
    /// Wire discriminator, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::NewPost { .. } => "new_post",
            Self::PostUpdated { .. } => "post_updated",
            Self::PostDeleted { .. } => "post_deleted",
            Self::PostLikeUpdated { .. } => "post_like_updated",
            Self::PostSaveUpdated { .. } => "post_save_updated",
            Self::NewComment { .. } => "new_comment",
            Self::CommentUpdated { .. } => "comment_updated",
            Self::CommentLikeUpdated { .. } => "comment_like_updated",
            Self::CommentDeleted { .. } => "comment_deleted",
            Self::ReplyAdded { .. } => "reply_added",
            Self::ReplyUpdated { .. } => "reply_updated",
            Self::ReplyLikeUpdated { .. } => "reply_like_updated",
            Self::ReplyDeleted { .. } => "reply_deleted",
            Self::NewNotification { .. } => "new_notification",
            Self::FollowUpdated { .. } => "follow_updated",
            Self::FollowStatusUpdated { .. } => "follow_status_updated",
            Self::UserTyping { .. } => "user_typing",
            Self::UserUpdated { .. } => "user_updated",
            Self::UserOnlineStatus { .. } => "user_online_status",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }
}

/// Outbound frame: event plus server-generated timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: Event,
    pub timestamp: String,
}

impl Envelope {
    pub fn new(event: Event) -> Self {
        Self { event, timestamp: now_rfc3339() }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!("Failed to serialize {} event: {}", self.event.name(), e);
            format!(r#"{{"type":"error","message":"serialization failure","timestamp":"{}"}}"#, self.timestamp)
        })
    }
}
