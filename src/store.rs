//! In-process document store
//!
//! Persistence boundary for the feed. Every operation the realtime core
//! relies on is expressed here as a single atomic step under one lock
//! section: conditional set-add / set-remove on nested like arrays
//! (returning the post-update length), integer increments, and head-insert
//! for notification lists. Two concurrent like toggles can therefore never
//! both observe-then-clobber the same array, which is the invariant the
//! original's array-filter updates existed to protect.
//!
//! Counts are never stored; callers recompute them from array lengths via
//! the returned values or the populated views.

use ahash::AHashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{FeedError, Result};
use crate::model::{
    Comment, CommentView, Notification, Post, PostView, Reply, ReplyView, User, UserSummary,
};

/// Current time in the RFC 3339 form used for document and wire timestamps.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Generate an opaque document id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Addresses a like set at any nesting level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LikeTarget {
    Post { post_id: String },
    Comment { post_id: String, comment_id: String },
    Reply { post_id: String, comment_id: String, reply_id: String },
}

impl LikeTarget {
    pub fn post_id(&self) -> &str {
        match self {
            Self::Post { post_id }
            | Self::Comment { post_id, .. }
            | Self::Reply { post_id, .. } => post_id,
        }
    }
}

/// Membership sets on a user document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSet {
    Followers,
    Following,
    SavedPosts,
}

pub struct Store {
    users: RwLock<AHashMap<String, User>>,
    posts: RwLock<AHashMap<String, Post>>,
    /// Bearer token -> user id
    sessions: RwLock<AHashMap<String, String>>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(AHashMap::new()),
            posts: RwLock::new(AHashMap::new()),
            sessions: RwLock::new(AHashMap::new()),
        }
    }

    // -- users ---------------------------------------------------------------

    pub fn create_user(&self, username: &str, name: &str) -> Result<User> {
        let username = username.trim().to_lowercase();
        let name = name.trim().to_string();
        if username.is_empty() || name.is_empty() {
            return Err(FeedError::ValidationFailed {
                message: "username and name are required".into(),
            });
        }
        let mut users = self.users.write();
        if users.values().any(|u| u.username == username) {
            return Err(FeedError::ValidationFailed {
                message: format!("username '{username}' is taken"),
            });
        }
        let user = User {
            id: new_id(),
            username,
            name,
            bio: String::new(),
            followers: Vec::new(),
            following: Vec::new(),
            saved_posts: Vec::new(),
            notifications: Vec::new(),
            created_at: now_rfc3339(),
        };
        users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    pub fn get_user(&self, id: &str) -> Result<User> {
        self.users
            .read()
            .get(id)
            .cloned()
            .ok_or(FeedError::NotFound { entity: "user" })
    }

    pub fn user_summary(&self, id: &str) -> Result<UserSummary> {
        Ok(self.get_user(id)?.summary())
    }

    pub fn update_user_profile(&self, id: &str, name: &str, bio: &str) -> Result<User> {
        let name = name.trim();
        if name.is_empty() {
            return Err(FeedError::ValidationFailed {
                message: "name is required".into(),
            });
        }
        let mut users = self.users.write();
        let user = users.get_mut(id).ok_or(FeedError::NotFound { entity: "user" })?;
        user.name = name.to_string();
        user.bio = bio.trim().to_string();
        Ok(user.clone())
    }

    // -- sessions ------------------------------------------------------------

    /// Issue a bearer token for an existing user.
    pub fn issue_token(&self, user_id: &str) -> Result<String> {
        self.get_user(user_id)?;
        let token = new_id();
        self.sessions.write().insert(token.clone(), user_id.to_string());
        Ok(token)
    }

    /// Resolve a connection credential to a user identity.
    ///
    /// An unknown token is an authentication failure; a token whose user has
    /// since disappeared resolves but finds nobody.
    pub fn resolve_token(&self, token: &str) -> Result<User> {
        let user_id = self
            .sessions
            .read()
            .get(token)
            .cloned()
            .ok_or(FeedError::AuthFailed { reason: "invalid or expired token".into() })?;
        self.get_user(&user_id)
    }

    pub fn revoke_token(&self, token: &str) {
        self.sessions.write().remove(token);
    }

    // -- posts ---------------------------------------------------------------

    pub fn insert_post(&self, post: Post) {
        self.posts.write().insert(post.id.clone(), post);
    }

    pub fn get_post(&self, id: &str) -> Result<Post> {
        self.posts
            .read()
            .get(id)
            .cloned()
            .ok_or(FeedError::NotFound { entity: "post" })
    }

    pub fn set_post_content(
        &self,
        id: &str,
        title: &str,
        content: &str,
        category: &str,
        tags: Vec<String>,
    ) -> Result<Post> {
        let mut posts = self.posts.write();
        let post = posts.get_mut(id).ok_or(FeedError::NotFound { entity: "post" })?;
        post.title = title.to_string();
        post.content = content.to_string();
        post.category = category.to_string();
        post.tags = tags;
        post.updated_at = now_rfc3339();
        Ok(post.clone())
    }

    pub fn remove_post(&self, id: &str) -> Result<Post> {
        self.posts
            .write()
            .remove(id)
            .ok_or(FeedError::NotFound { entity: "post" })
    }

    /// Atomic increment, returns the post-update count.
    pub fn increment_repost_count(&self, id: &str) -> Result<u64> {
        let mut posts = self.posts.write();
        let post = posts.get_mut(id).ok_or(FeedError::NotFound { entity: "post" })?;
        post.repost_count += 1;
        Ok(post.repost_count)
    }

    // -- likes ---------------------------------------------------------------

    fn with_likes_mut<R>(
        &self,
        target: &LikeTarget,
        f: impl FnOnce(&mut Vec<String>) -> R,
    ) -> Result<R> {
        let mut posts = self.posts.write();
        match target {
            LikeTarget::Post { post_id } => {
                let post = posts
                    .get_mut(post_id)
                    .ok_or(FeedError::NotFound { entity: "post" })?;
                Ok(f(&mut post.likes))
            }
            LikeTarget::Comment { post_id, comment_id } => {
                let post = posts
                    .get_mut(post_id)
                    .ok_or(FeedError::NotFound { entity: "post" })?;
                let comment = post
                    .comments
                    .iter_mut()
                    .find(|c| c.id == *comment_id)
                    .ok_or(FeedError::NotFound { entity: "comment" })?;
                Ok(f(&mut comment.likes))
            }
            LikeTarget::Reply { post_id, comment_id, reply_id } => {
                let post = posts
                    .get_mut(post_id)
                    .ok_or(FeedError::NotFound { entity: "post" })?;
                let comment = post
                    .comments
                    .iter_mut()
                    .find(|c| c.id == *comment_id)
                    .ok_or(FeedError::NotFound { entity: "comment" })?;
                let reply = comment
                    .replies
                    .iter_mut()
                    .find(|r| r.id == *reply_id)
                    .ok_or(FeedError::NotFound { entity: "reply" })?;
                Ok(f(&mut reply.likes))
            }
        }
    }

    pub fn like_contains(&self, target: &LikeTarget, user_id: &str) -> Result<bool> {
        // Read path goes through the same resolution as the write path.
        self.with_likes_mut(target, |likes| likes.iter().any(|u| u == user_id))
    }

    /// Add-if-absent. Returns the post-update set size.
    pub fn like_add(&self, target: &LikeTarget, user_id: &str) -> Result<usize> {
        self.with_likes_mut(target, |likes| {
            if !likes.iter().any(|u| u == user_id) {
                likes.push(user_id.to_string());
            }
            likes.len()
        })
    }

    /// Remove-if-present. Returns the post-update set size.
    pub fn like_remove(&self, target: &LikeTarget, user_id: &str) -> Result<usize> {
        self.with_likes_mut(target, |likes| {
            likes.retain(|u| u != user_id);
            likes.len()
        })
    }

    /// Author of the liked entity, for notification routing.
    pub fn like_target_author(&self, target: &LikeTarget) -> Result<String> {
        let posts = self.posts.read();
        match target {
            LikeTarget::Post { post_id } => {
                let post = posts.get(post_id).ok_or(FeedError::NotFound { entity: "post" })?;
                Ok(post.author.clone())
            }
            LikeTarget::Comment { post_id, comment_id } => {
                let post = posts.get(post_id).ok_or(FeedError::NotFound { entity: "post" })?;
                let comment = post
                    .comments
                    .iter()
                    .find(|c| c.id == *comment_id)
                    .ok_or(FeedError::NotFound { entity: "comment" })?;
                Ok(comment.author.clone())
            }
            LikeTarget::Reply { post_id, comment_id, reply_id } => {
                let post = posts.get(post_id).ok_or(FeedError::NotFound { entity: "post" })?;
                let comment = post
                    .comments
                    .iter()
                    .find(|c| c.id == *comment_id)
                    .ok_or(FeedError::NotFound { entity: "comment" })?;
                let reply = comment
                    .replies
                    .iter()
                    .find(|r| r.id == *reply_id)
                    .ok_or(FeedError::NotFound { entity: "reply" })?;
                Ok(reply.author.clone())
            }
        }
    }

    // -- comments and replies ------------------------------------------------

    pub fn append_comment(&self, post_id: &str, comment: Comment) -> Result<()> {
        let mut posts = self.posts.write();
        let post = posts
            .get_mut(post_id)
            .ok_or(FeedError::NotFound { entity: "post" })?;
        post.comments.push(comment);
        Ok(())
    }

    pub fn set_comment_content(&self, post_id: &str, comment_id: &str, content: &str) -> Result<()> {
        let mut posts = self.posts.write();
        let post = posts
            .get_mut(post_id)
            .ok_or(FeedError::NotFound { entity: "post" })?;
        let comment = post
            .comments
            .iter_mut()
            .find(|c| c.id == comment_id)
            .ok_or(FeedError::NotFound { entity: "comment" })?;
        comment.content = content.to_string();
        comment.updated_at = now_rfc3339();
        Ok(())
    }

    /// Remove a comment by identity. Siblings and their replies are untouched.
    pub fn remove_comment(&self, post_id: &str, comment_id: &str) -> Result<Comment> {
        let mut posts = self.posts.write();
        let post = posts
            .get_mut(post_id)
            .ok_or(FeedError::NotFound { entity: "post" })?;
        let idx = post
            .comments
            .iter()
            .position(|c| c.id == comment_id)
            .ok_or(FeedError::NotFound { entity: "comment" })?;
        Ok(post.comments.remove(idx))
    }

    pub fn append_reply(&self, post_id: &str, comment_id: &str, reply: Reply) -> Result<()> {
        let mut posts = self.posts.write();
        let post = posts
            .get_mut(post_id)
            .ok_or(FeedError::NotFound { entity: "post" })?;
        let comment = post
            .comments
            .iter_mut()
            .find(|c| c.id == comment_id)
            .ok_or(FeedError::NotFound { entity: "comment" })?;
        comment.replies.push(reply);
        Ok(())
    }

    pub fn set_reply_content(
        &self,
        post_id: &str,
        comment_id: &str,
        reply_id: &str,
        content: &str,
    ) -> Result<()> {
        let mut posts = self.posts.write();
        let post = posts
            .get_mut(post_id)
            .ok_or(FeedError::NotFound { entity: "post" })?;
        let comment = post
            .comments
            .iter_mut()
            .find(|c| c.id == comment_id)
            .ok_or(FeedError::NotFound { entity: "comment" })?;
        let reply = comment
            .replies
            .iter_mut()
            .find(|r| r.id == reply_id)
            .ok_or(FeedError::NotFound { entity: "reply" })?;
        reply.content = content.to_string();
        reply.updated_at = now_rfc3339();
        Ok(())
    }

    pub fn remove_reply(&self, post_id: &str, comment_id: &str, reply_id: &str) -> Result<Reply> {
        let mut posts = self.posts.write();
        let post = posts
            .get_mut(post_id)
            .ok_or(FeedError::NotFound { entity: "post" })?;
        let comment = post
            .comments
            .iter_mut()
            .find(|c| c.id == comment_id)
            .ok_or(FeedError::NotFound { entity: "comment" })?;
        let idx = comment
            .replies
            .iter()
            .position(|r| r.id == reply_id)
            .ok_or(FeedError::NotFound { entity: "reply" })?;
        Ok(comment.replies.remove(idx))
    }

    // -- user membership sets ------------------------------------------------

    fn with_user_set_mut<R>(
        &self,
        user_id: &str,
        set: UserSet,
        f: impl FnOnce(&mut Vec<String>) -> R,
    ) -> Result<R> {
        let mut users = self.users.write();
        let user = users
            .get_mut(user_id)
            .ok_or(FeedError::NotFound { entity: "user" })?;
        let target = match set {
            UserSet::Followers => &mut user.followers,
            UserSet::Following => &mut user.following,
            UserSet::SavedPosts => &mut user.saved_posts,
        };
        Ok(f(target))
    }

    pub fn user_set_contains(&self, user_id: &str, set: UserSet, value: &str) -> Result<bool> {
        self.with_user_set_mut(user_id, set, |s| s.iter().any(|v| v == value))
    }

    pub fn user_set_add(&self, user_id: &str, set: UserSet, value: &str) -> Result<usize> {
        self.with_user_set_mut(user_id, set, |s| {
            if !s.iter().any(|v| v == value) {
                s.push(value.to_string());
            }
            s.len()
        })
    }

    pub fn user_set_remove(&self, user_id: &str, set: UserSet, value: &str) -> Result<usize> {
        self.with_user_set_mut(user_id, set, |s| {
            s.retain(|v| v != value);
            s.len()
        })
    }

    pub fn post_save_add(&self, post_id: &str, user_id: &str) -> Result<usize> {
        let mut posts = self.posts.write();
        let post = posts
            .get_mut(post_id)
            .ok_or(FeedError::NotFound { entity: "post" })?;
        if !post.saved_by.iter().any(|u| u == user_id) {
            post.saved_by.push(user_id.to_string());
        }
        Ok(post.saved_by.len())
    }

    pub fn post_save_remove(&self, post_id: &str, user_id: &str) -> Result<usize> {
        let mut posts = self.posts.write();
        let post = posts
            .get_mut(post_id)
            .ok_or(FeedError::NotFound { entity: "post" })?;
        post.saved_by.retain(|u| u != user_id);
        Ok(post.saved_by.len())
    }

    // -- notifications -------------------------------------------------------

    /// Insert at the head of the recipient's list (most-recent-first).
    pub fn push_notification(&self, recipient: &str, notification: Notification) -> Result<()> {
        let mut users = self.users.write();
        let user = users
            .get_mut(recipient)
            .ok_or(FeedError::NotFound { entity: "user" })?;
        user.notifications.insert(0, notification);
        Ok(())
    }

    pub fn notifications(&self, user_id: &str) -> Result<Vec<Notification>> {
        Ok(self.get_user(user_id)?.notifications)
    }

    pub fn mark_notification_read(&self, user_id: &str, notification_id: &str) -> Result<()> {
        let mut users = self.users.write();
        let user = users
            .get_mut(user_id)
            .ok_or(FeedError::NotFound { entity: "user" })?;
        let n = user
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id)
            .ok_or(FeedError::NotFound { entity: "notification" })?;
        n.read = true;
        Ok(())
    }

    pub fn remove_notification(&self, user_id: &str, notification_id: &str) -> Result<()> {
        let mut users = self.users.write();
        let user = users
            .get_mut(user_id)
            .ok_or(FeedError::NotFound { entity: "user" })?;
        let before = user.notifications.len();
        user.notifications.retain(|n| n.id != notification_id);
        if user.notifications.len() == before {
            return Err(FeedError::NotFound { entity: "notification" });
        }
        Ok(())
    }

    pub fn clear_notifications(&self, user_id: &str) -> Result<()> {
        let mut users = self.users.write();
        let user = users
            .get_mut(user_id)
            .ok_or(FeedError::NotFound { entity: "user" })?;
        user.notifications.clear();
        Ok(())
    }

    // -- populated views -----------------------------------------------------

    fn summary_of(users: &AHashMap<String, User>, id: &str) -> Result<UserSummary> {
        users
            .get(id)
            .map(User::summary)
            .ok_or(FeedError::NotFound { entity: "user" })
    }

    pub fn post_view(&self, post: &Post) -> Result<PostView> {
        let users = self.users.read();
        let comments = post
            .comments
            .iter()
            .map(|c| Self::comment_view_inner(&users, c))
            .collect::<Result<Vec<_>>>()?;
        Ok(PostView {
            id: post.id.clone(),
            title: post.title.clone(),
            content: post.content.clone(),
            category: post.category.clone(),
            tags: post.tags.clone(),
            author: Self::summary_of(&users, &post.author)?,
            like_count: post.likes.len(),
            likes: post.likes.clone(),
            comment_count: post.comments.len(),
            comments,
            save_count: post.saved_by.len(),
            is_repost: post.is_repost,
            original_post: post.original_post.clone(),
            repost_count: post.repost_count,
            created_at: post.created_at.clone(),
            updated_at: post.updated_at.clone(),
        })
    }

    fn comment_view_inner(users: &AHashMap<String, User>, comment: &Comment) -> Result<CommentView> {
        let replies = comment
            .replies
            .iter()
            .map(|r| Self::reply_view_inner(users, r))
            .collect::<Result<Vec<_>>>()?;
        Ok(CommentView {
            id: comment.id.clone(),
            author: Self::summary_of(users, &comment.author)?,
            content: comment.content.clone(),
            like_count: comment.likes.len(),
            likes: comment.likes.clone(),
            replies,
            created_at: comment.created_at.clone(),
            updated_at: comment.updated_at.clone(),
        })
    }

    fn reply_view_inner(users: &AHashMap<String, User>, reply: &Reply) -> Result<ReplyView> {
        Ok(ReplyView {
            id: reply.id.clone(),
            author: Self::summary_of(users, &reply.author)?,
            content: reply.content.clone(),
            like_count: reply.likes.len(),
            likes: reply.likes.clone(),
            created_at: reply.created_at.clone(),
            updated_at: reply.updated_at.clone(),
        })
    }

    /// Re-fetch a comment with its author identity populated.
    pub fn populated_comment(&self, post_id: &str, comment_id: &str) -> Result<CommentView> {
        let post = self.get_post(post_id)?;
        let comment = post
            .comments
            .iter()
            .find(|c| c.id == comment_id)
            .ok_or(FeedError::NotFound { entity: "comment" })?;
        let users = self.users.read();
        Self::comment_view_inner(&users, comment)
    }

    /// Re-fetch a reply with its author identity populated.
    pub fn populated_reply(
        &self,
        post_id: &str,
        comment_id: &str,
        reply_id: &str,
    ) -> Result<ReplyView> {
        let post = self.get_post(post_id)?;
        let comment = post
            .comments
            .iter()
            .find(|c| c.id == comment_id)
            .ok_or(FeedError::NotFound { entity: "comment" })?;
        let reply = comment
            .replies
            .iter()
            .find(|r| r.id == reply_id)
            .ok_or(FeedError::NotFound { entity: "reply" })?;
        let users = self.users.read();
        Self::reply_view_inner(&users, reply)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_post() -> (Store, User, Post) {
        let store = Store::new();
        let author = store.create_user("ada", "Ada Lovelace").unwrap();
        let post = Post {
            id: new_id(),
            title: "On analytical engines".into(),
            content: "Notes".into(),
            category: "Computer Science".into(),
            tags: vec![],
            author: author.id.clone(),
            likes: vec![],
            comments: vec![],
            saved_by: vec![],
            is_repost: false,
            original_post: None,
            repost_count: 0,
            created_at: now_rfc3339(),
            updated_at: now_rfc3339(),
        };
        store.insert_post(post.clone());
        (store, author, post)
    }

    #[test]
    fn test_like_add_is_idempotent() {
        let (store, _, post) = store_with_post();
        let liker = store.create_user("grace", "Grace Hopper").unwrap();
        let target = LikeTarget::Post { post_id: post.id.clone() };

        assert_eq!(store.like_add(&target, &liker.id).unwrap(), 1);
        // Second add-if-absent is a no-op on the set.
        assert_eq!(store.like_add(&target, &liker.id).unwrap(), 1);
        assert_eq!(store.like_remove(&target, &liker.id).unwrap(), 0);
        assert_eq!(store.like_remove(&target, &liker.id).unwrap(), 0);
    }

    #[test]
    fn test_concurrent_like_adds_insert_once() {
        use std::sync::Arc;

        let (store, _, post) = store_with_post();
        let liker = store.create_user("grace", "Grace Hopper").unwrap();
        let store = Arc::new(store);
        let target = LikeTarget::Post { post_id: post.id.clone() };

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let target = target.clone();
                let liker = liker.id.clone();
                std::thread::spawn(move || store.like_add(&target, &liker).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(store.like_contains(&target, &liker.id).unwrap());
        assert_eq!(store.get_post(&post.id).unwrap().likes.len(), 1);
    }

    #[test]
    fn test_remove_comment_leaves_siblings_intact() {
        let (store, author, post) = store_with_post();
        let mk = |content: &str| Comment {
            id: new_id(),
            author: author.id.clone(),
            content: content.into(),
            likes: vec![],
            replies: vec![Reply {
                id: new_id(),
                author: author.id.clone(),
                content: "r".into(),
                likes: vec![],
                created_at: now_rfc3339(),
                updated_at: now_rfc3339(),
            }],
            created_at: now_rfc3339(),
            updated_at: now_rfc3339(),
        };
        let first = mk("first");
        let second = mk("second");
        store.append_comment(&post.id, first.clone()).unwrap();
        store.append_comment(&post.id, second.clone()).unwrap();

        store.remove_comment(&post.id, &first.id).unwrap();

        let remaining = store.get_post(&post.id).unwrap().comments;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, second.id);
        assert_eq!(remaining[0].replies.len(), 1);
    }

    #[test]
    fn test_notifications_insert_at_head() {
        let (store, author, _) = store_with_post();
        let other = store.create_user("grace", "Grace Hopper").unwrap();
        for i in 0..3 {
            store
                .push_notification(
                    &author.id,
                    Notification {
                        id: format!("n{i}"),
                        kind: crate::model::NotificationKind::System,
                        from_user: Some(other.summary()),
                        post: None,
                        comment: None,
                        reply: None,
                        message: format!("m{i}"),
                        read: false,
                        created_at: now_rfc3339(),
                    },
                )
                .unwrap();
        }
        let list = store.notifications(&author.id).unwrap();
        assert_eq!(list[0].id, "n2");
        assert_eq!(list[2].id, "n0");
    }

    #[test]
    fn test_resolve_token_paths() {
        let (store, author, _) = store_with_post();
        let token = store.issue_token(&author.id).unwrap();
        assert_eq!(store.resolve_token(&token).unwrap().id, author.id);

        match store.resolve_token("bogus") {
            Err(FeedError::AuthFailed { .. }) => {}
            other => panic!("expected AuthFailed, got {other:?}"),
        }

        store.revoke_token(&token);
        assert!(store.resolve_token(&token).is_err());
    }

    #[test]
    fn test_duplicate_username_rejected() {
        let store = Store::new();
        store.create_user("ada", "Ada").unwrap();
        match store.create_user("Ada", "Other Ada") {
            Err(FeedError::ValidationFailed { .. }) => {}
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
    }
}
