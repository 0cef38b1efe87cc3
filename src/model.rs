//! Entity model for the ThereIn feed
//!
//! Documents mirror what the store persists; the `*View` types are the
//! "populated" shapes that go on the wire, with author identity joined in
//! and every count recomputed from the backing array at build time. A count
//! is never stored independently of its set, so it cannot drift.

use serde::{Deserialize, Serialize};

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_POST_LEN: usize = 10_000;
pub const MAX_COMMENT_LEN: usize = 1_000;
pub const MAX_REPLY_LEN: usize = 500;

/// Research categories a post can be filed under.
pub const CATEGORIES: [&str; 9] = [
    "Neuroscience",
    "Climate Science",
    "Computer Science",
    "Biology",
    "Physics",
    "Medicine",
    "Psychology",
    "Economics",
    "Other",
];

/// Public identity attached to populated payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: String,
    pub username: String,
    pub name: String,
}

/// A registered user document.
///
/// The realtime core treats identity fields as immutable and only mutates
/// the membership sets and the notification list, always through the store's
/// conditional operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub bio: String,
    pub followers: Vec<String>,
    pub following: Vec<String>,
    pub saved_posts: Vec<String>,
    pub notifications: Vec<Notification>,
    pub created_at: String,
}

impl User {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            username: self.username.clone(),
            name: self.name.clone(),
        }
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id.clone(),
            username: self.username.clone(),
            name: self.name.clone(),
            bio: self.bio.clone(),
        }
    }
}

/// Public profile fields broadcast after a profile change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub name: String,
    pub bio: String,
}

/// A post document. Comments are embedded, mirroring a document database
/// layout where a post and its thread live in one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub tags: Vec<String>,
    pub author: String,
    pub likes: Vec<String>,
    pub comments: Vec<Comment>,
    pub saved_by: Vec<String>,
    pub is_repost: bool,
    pub original_post: Option<String>,
    pub repost_count: u64,
    pub created_at: String,
    pub updated_at: String,
}

/// A comment under a post. Replies are embedded one level down and a reply
/// carries no child collection, so reply-to-reply nesting cannot be
/// expressed at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub content: String,
    pub likes: Vec<String>,
    pub replies: Vec<Reply>,
    pub created_at: String,
    pub updated_at: String,
}

/// A reply to a comment. Leaf node of the thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: String,
    pub author: String,
    pub content: String,
    pub likes: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Notification kinds, matching the recipient-side inbox filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Follow,
    Like,
    Comment,
    Reply,
    Mention,
    System,
}

/// An inbox entry, inserted at the head of the recipient's list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub from_user: Option<UserSummary>,
    pub post: Option<String>,
    pub comment: Option<String>,
    pub reply: Option<String>,
    pub message: String,
    pub read: bool,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Populated wire views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostView {
    pub id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub tags: Vec<String>,
    pub author: UserSummary,
    pub likes: Vec<String>,
    pub like_count: usize,
    pub comments: Vec<CommentView>,
    pub comment_count: usize,
    pub save_count: usize,
    pub is_repost: bool,
    pub original_post: Option<String>,
    pub repost_count: u64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentView {
    pub id: String,
    pub author: UserSummary,
    pub content: String,
    pub likes: Vec<String>,
    pub like_count: usize,
    pub replies: Vec<ReplyView>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyView {
    pub id: String,
    pub author: UserSummary,
    pub content: String,
    pub likes: Vec<String>,
    pub like_count: usize,
    pub created_at: String,
    pub updated_at: String,
}
