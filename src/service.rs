//! Feed write operations and their fan-out hooks
//!
//! Every mutation here follows the same discipline: perform the state
//! change against the store using its atomic conditional operations, then
//! trigger exactly one dispatch describing the resulting canonical state.
//! Dispatch failures never surface to the caller; the write has already
//! committed by the time delivery is attempted. A mutation that fails
//! validation or authorization dispatches nothing.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{FeedError, Result};
use crate::model::{
    Comment, CommentView, Notification, NotificationKind, Post, PostView, Reply, ReplyView,
    UserProfile, CATEGORIES, MAX_COMMENT_LEN, MAX_POST_LEN, MAX_REPLY_LEN, MAX_TITLE_LEN,
};
use crate::realtime::dispatcher::{Audience, EventDispatcher};
use crate::realtime::protocol::Event;
use crate::store::{new_id, now_rfc3339, LikeTarget, Store, UserSet};

/// Fields accepted when creating or editing a post.
#[derive(Debug, Clone)]
pub struct PostInput {
    pub title: String,
    pub content: String,
    pub category: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeOutcome {
    pub liked: bool,
    pub like_count: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowOutcome {
    pub following: bool,
    pub follower_count: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub saved: bool,
    pub save_count: usize,
}

pub struct FeedService {
    store: Arc<Store>,
    dispatcher: Arc<EventDispatcher>,
}

fn validated(field: &'static str, value: &str, max: usize) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(FeedError::ValidationFailed { message: format!("{field} is required") });
    }
    if trimmed.chars().count() > max {
        return Err(FeedError::ValidationFailed {
            message: format!("{field} cannot be more than {max} characters"),
        });
    }
    Ok(trimmed.to_string())
}

fn validated_category(category: &str) -> Result<String> {
    let category = category.trim();
    if CATEGORIES.contains(&category) {
        Ok(category.to_string())
    } else {
        Err(FeedError::ValidationFailed { message: format!("invalid category '{category}'") })
    }
}

fn normalized_tags(tags: Vec<String>) -> Vec<String> {
    tags.into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

impl FeedService {
    pub fn new(store: Arc<Store>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // -- posts ---------------------------------------------------------------

    pub fn create_post(&self, actor: &str, input: PostInput) -> Result<PostView> {
        let author = self.store.get_user(actor)?;
        let now = now_rfc3339();
        let post = Post {
            id: new_id(),
            title: validated("title", &input.title, MAX_TITLE_LEN)?,
            content: validated("content", &input.content, MAX_POST_LEN)?,
            category: validated_category(&input.category)?,
            tags: normalized_tags(input.tags),
            author: author.id.clone(),
            likes: Vec::new(),
            comments: Vec::new(),
            saved_by: Vec::new(),
            is_repost: false,
            original_post: None,
            repost_count: 0,
            created_at: now.clone(),
            updated_at: now,
        };
        self.store.insert_post(post.clone());
        let view = self.store.post_view(&post)?;

        // The actor already has optimistic local state; everyone else learns
        // about the post here.
        self.dispatcher
            .dispatch(Audience::AllExcept(actor.to_string()), Event::NewPost { post: view.clone() });
        Ok(view)
    }

    /// A repost is a new post referencing the original; the original's
    /// repost counter is bumped atomically.
    pub fn repost(&self, actor: &str, original_post_id: &str) -> Result<PostView> {
        let author = self.store.get_user(actor)?;
        let original = self.store.get_post(original_post_id)?;
        let now = now_rfc3339();
        let repost = Post {
            id: new_id(),
            title: original.title.clone(),
            content: original.content.clone(),
            category: original.category.clone(),
            tags: original.tags.clone(),
            author: author.id.clone(),
            likes: Vec::new(),
            comments: Vec::new(),
            saved_by: Vec::new(),
            is_repost: true,
            original_post: Some(original.id.clone()),
            repost_count: 0,
            created_at: now.clone(),
            updated_at: now,
        };
        self.store.insert_post(repost.clone());
        self.store.increment_repost_count(&original.id)?;

        let view = self.store.post_view(&repost)?;
        self.dispatcher
            .dispatch(Audience::AllExcept(actor.to_string()), Event::NewPost { post: view.clone() });
        Ok(view)
    }

    pub fn update_post(&self, actor: &str, post_id: &str, input: PostInput) -> Result<PostView> {
        let post = self.store.get_post(post_id)?;
        if post.author != actor {
            return Err(FeedError::Forbidden { action: "edit this post" });
        }
        let updated = self.store.set_post_content(
            post_id,
            &validated("title", &input.title, MAX_TITLE_LEN)?,
            &validated("content", &input.content, MAX_POST_LEN)?,
            &validated_category(&input.category)?,
            normalized_tags(input.tags),
        )?;
        let view = self.store.post_view(&updated)?;
        self.dispatcher
            .dispatch(Audience::All, Event::PostUpdated { post: view.clone() });
        Ok(view)
    }

    /// Deleting a post drops its embedded comments and likes with it.
    pub fn delete_post(&self, actor: &str, post_id: &str) -> Result<()> {
        let post = self.store.get_post(post_id)?;
        if post.author != actor {
            return Err(FeedError::Forbidden { action: "delete this post" });
        }
        self.store.remove_post(post_id)?;
        self.dispatcher
            .dispatch(Audience::All, Event::PostDeleted { post_id: post_id.to_string() });
        Ok(())
    }

    // -- likes ---------------------------------------------------------------

    /// Toggle the actor's membership in the target's like set. Applies
    /// identically to post, comment and reply likes.
    ///
    /// The add/remove is a single conditional store operation (never a
    /// load-mutate-save of the whole document), and the broadcast count is
    /// the post-update set size returned by that operation, never a
    /// pre-mutation count plus or minus one.
    pub fn toggle_like(&self, actor: &str, target: LikeTarget) -> Result<LikeOutcome> {
        let actor_user = self.store.get_user(actor)?;
        let target_author = self.store.like_target_author(&target)?;

        let is_liking = !self.store.like_contains(&target, actor)?;
        let like_count = if is_liking {
            self.store.like_add(&target, actor)?
        } else {
            self.store.like_remove(&target, actor)?
        };

        if is_liking {
            let (noun, comment_id, reply_id) = match &target {
                LikeTarget::Post { .. } => ("post", None, None),
                LikeTarget::Comment { comment_id, .. } => {
                    ("comment", Some(comment_id.clone()), None)
                }
                LikeTarget::Reply { comment_id, reply_id, .. } => {
                    ("reply", Some(comment_id.clone()), Some(reply_id.clone()))
                }
            };
            self.notify(
                &target_author,
                NotificationKind::Like,
                actor,
                Some(target.post_id().to_string()),
                comment_id,
                reply_id,
                format!("{} liked your {noun}", actor_user.name),
            )?;
        }

        let event = match &target {
            LikeTarget::Post { post_id } => Event::PostLikeUpdated {
                post_id: post_id.clone(),
                user_id: actor.to_string(),
                liked: is_liking,
                like_count,
            },
            LikeTarget::Comment { post_id, comment_id } => Event::CommentLikeUpdated {
                post_id: post_id.clone(),
                comment_id: comment_id.clone(),
                user_id: actor.to_string(),
                liked: is_liking,
                like_count,
            },
            LikeTarget::Reply { post_id, comment_id, reply_id } => Event::ReplyLikeUpdated {
                post_id: post_id.clone(),
                comment_id: comment_id.clone(),
                reply_id: reply_id.clone(),
                user_id: actor.to_string(),
                liked: is_liking,
                like_count,
            },
        };
        self.dispatcher.dispatch(Audience::All, event);

        Ok(LikeOutcome { liked: is_liking, like_count })
    }

    // -- comments and replies ------------------------------------------------

    pub fn add_comment(&self, actor: &str, post_id: &str, content: &str) -> Result<CommentView> {
        let actor_user = self.store.get_user(actor)?;
        let content = validated("comment content", content, MAX_COMMENT_LEN)?;
        let post = self.store.get_post(post_id)?;

        let now = now_rfc3339();
        let comment = Comment {
            id: new_id(),
            author: actor.to_string(),
            content,
            likes: Vec::new(),
            replies: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        };
        self.store.append_comment(post_id, comment.clone())?;

        self.notify(
            &post.author,
            NotificationKind::Comment,
            actor,
            Some(post_id.to_string()),
            None,
            None,
            format!("{} commented on your post", actor_user.name),
        )?;

        // Re-fetch with author identity populated so the broadcast payload
        // carries more than a bare id.
        let view = self.store.populated_comment(post_id, &comment.id)?;
        self.dispatcher.dispatch(
            Audience::All,
            Event::NewComment { post_id: post_id.to_string(), comment: view.clone() },
        );
        Ok(view)
    }

    pub fn edit_comment(
        &self,
        actor: &str,
        post_id: &str,
        comment_id: &str,
        content: &str,
    ) -> Result<CommentView> {
        let content = validated("comment content", content, MAX_COMMENT_LEN)?;
        let post = self.store.get_post(post_id)?;
        let comment = post
            .comments
            .iter()
            .find(|c| c.id == comment_id)
            .ok_or(FeedError::NotFound { entity: "comment" })?;
        if comment.author != actor {
            return Err(FeedError::Forbidden { action: "edit this comment" });
        }
        self.store.set_comment_content(post_id, comment_id, &content)?;

        let view = self.store.populated_comment(post_id, comment_id)?;
        self.dispatcher.dispatch(
            Audience::All,
            Event::CommentUpdated { post_id: post_id.to_string(), comment: view.clone() },
        );
        Ok(view)
    }

    /// Comment delete is permitted for the comment author or, as moderation,
    /// the post author.
    pub fn delete_comment(&self, actor: &str, post_id: &str, comment_id: &str) -> Result<()> {
        let post = self.store.get_post(post_id)?;
        let comment = post
            .comments
            .iter()
            .find(|c| c.id == comment_id)
            .ok_or(FeedError::NotFound { entity: "comment" })?;
        if comment.author != actor && post.author != actor {
            return Err(FeedError::Forbidden { action: "delete this comment" });
        }
        self.store.remove_comment(post_id, comment_id)?;

        // Clients remove the rendered element locally; only ids go out.
        self.dispatcher.dispatch(
            Audience::All,
            Event::CommentDeleted {
                post_id: post_id.to_string(),
                comment_id: comment_id.to_string(),
            },
        );
        Ok(())
    }

    pub fn add_reply(
        &self,
        actor: &str,
        post_id: &str,
        comment_id: &str,
        content: &str,
    ) -> Result<ReplyView> {
        let actor_user = self.store.get_user(actor)?;
        let content = validated("reply content", content, MAX_REPLY_LEN)?;
        let post = self.store.get_post(post_id)?;
        let comment = post
            .comments
            .iter()
            .find(|c| c.id == comment_id)
            .ok_or(FeedError::NotFound { entity: "comment" })?;

        let now = now_rfc3339();
        let reply = Reply {
            id: new_id(),
            author: actor.to_string(),
            content,
            likes: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        };
        self.store.append_reply(post_id, comment_id, reply.clone())?;

        self.notify(
            &comment.author,
            NotificationKind::Reply,
            actor,
            Some(post_id.to_string()),
            Some(comment_id.to_string()),
            None,
            format!("{} replied to your comment", actor_user.name),
        )?;

        let view = self.store.populated_reply(post_id, comment_id, &reply.id)?;
        self.dispatcher.dispatch(
            Audience::All,
            Event::ReplyAdded {
                post_id: post_id.to_string(),
                comment_id: comment_id.to_string(),
                reply: view.clone(),
            },
        );
        Ok(view)
    }

    pub fn edit_reply(
        &self,
        actor: &str,
        post_id: &str,
        comment_id: &str,
        reply_id: &str,
        content: &str,
    ) -> Result<ReplyView> {
        let content = validated("reply content", content, MAX_REPLY_LEN)?;
        let view = self.store.populated_reply(post_id, comment_id, reply_id)?;
        if view.author.id != actor {
            return Err(FeedError::Forbidden { action: "edit this reply" });
        }
        self.store.set_reply_content(post_id, comment_id, reply_id, &content)?;

        let view = self.store.populated_reply(post_id, comment_id, reply_id)?;
        self.dispatcher.dispatch(
            Audience::All,
            Event::ReplyUpdated {
                post_id: post_id.to_string(),
                comment_id: comment_id.to_string(),
                reply: view.clone(),
            },
        );
        Ok(view)
    }

    /// Reply delete is permitted only for the reply author.
    pub fn delete_reply(
        &self,
        actor: &str,
        post_id: &str,
        comment_id: &str,
        reply_id: &str,
    ) -> Result<()> {
        let view = self.store.populated_reply(post_id, comment_id, reply_id)?;
        if view.author.id != actor {
            return Err(FeedError::Forbidden { action: "delete this reply" });
        }
        self.store.remove_reply(post_id, comment_id, reply_id)?;

        self.dispatcher.dispatch(
            Audience::All,
            Event::ReplyDeleted {
                post_id: post_id.to_string(),
                comment_id: comment_id.to_string(),
                reply_id: reply_id.to_string(),
            },
        );
        Ok(())
    }

    // -- follow --------------------------------------------------------------

    /// Toggle follow state between actor and target. The two membership
    /// updates are independent atomic operations, not one transaction; the
    /// window between them is an accepted scope reduction.
    pub fn toggle_follow(&self, actor: &str, target_id: &str) -> Result<FollowOutcome> {
        if actor == target_id {
            return Err(FeedError::ValidationFailed {
                message: "you cannot follow yourself".into(),
            });
        }
        let actor_user = self.store.get_user(actor)?;
        self.store.get_user(target_id)?;

        let is_following = self
            .store
            .user_set_contains(actor, UserSet::Following, target_id)?;

        let follower_count = if is_following {
            self.store.user_set_remove(actor, UserSet::Following, target_id)?;
            self.store.user_set_remove(target_id, UserSet::Followers, actor)?
        } else {
            self.store.user_set_add(actor, UserSet::Following, target_id)?;
            self.store.user_set_add(target_id, UserSet::Followers, actor)?
        };
        let following = !is_following;

        // Only a follow generates a notification, never an unfollow.
        if following {
            self.notify(
                target_id,
                NotificationKind::Follow,
                actor,
                None,
                None,
                None,
                format!("{} started following you", actor_user.name),
            )?;
        }

        // Two single-audience sends so each side updates its own UI.
        self.dispatcher.dispatch(
            Audience::Single(target_id.to_string()),
            Event::FollowUpdated { follower_id: actor.to_string(), following },
        );
        self.dispatcher.dispatch(
            Audience::Single(actor.to_string()),
            Event::FollowStatusUpdated { target_user_id: target_id.to_string(), following },
        );

        Ok(FollowOutcome { following, follower_count })
    }

    // -- saves ---------------------------------------------------------------

    pub fn toggle_save(&self, actor: &str, post_id: &str) -> Result<SaveOutcome> {
        self.store.get_user(actor)?;
        self.store.get_post(post_id)?;

        let is_saved = self
            .store
            .user_set_contains(actor, UserSet::SavedPosts, post_id)?;

        let save_count = if is_saved {
            self.store.user_set_remove(actor, UserSet::SavedPosts, post_id)?;
            self.store.post_save_remove(post_id, actor)?
        } else {
            self.store.user_set_add(actor, UserSet::SavedPosts, post_id)?;
            self.store.post_save_add(post_id, actor)?
        };
        let saved = !is_saved;

        self.dispatcher.dispatch(
            Audience::All,
            Event::PostSaveUpdated {
                post_id: post_id.to_string(),
                user_id: actor.to_string(),
                saved,
                save_count,
            },
        );
        Ok(SaveOutcome { saved, save_count })
    }

    // -- profile -------------------------------------------------------------

    pub fn update_profile(&self, actor: &str, name: &str, bio: &str) -> Result<UserProfile> {
        let user = self.store.update_user_profile(actor, name, bio)?;
        let profile = user.profile();
        self.dispatcher
            .dispatch(Audience::All, Event::UserUpdated { user: profile.clone() });
        Ok(profile)
    }

    // -- notifications -------------------------------------------------------

    /// Create, persist and deliver a notification. A would-be notification
    /// where the actor is also the recipient is skipped entirely.
    #[allow(clippy::too_many_arguments)]
    fn notify(
        &self,
        recipient: &str,
        kind: NotificationKind,
        from_user: &str,
        post: Option<String>,
        comment: Option<String>,
        reply: Option<String>,
        message: String,
    ) -> Result<()> {
        if recipient == from_user {
            return Ok(());
        }
        let notification = Notification {
            id: new_id(),
            kind,
            from_user: Some(self.store.user_summary(from_user)?),
            post,
            comment,
            reply,
            message,
            read: false,
            created_at: now_rfc3339(),
        };
        self.store.push_notification(recipient, notification.clone())?;
        self.dispatcher.dispatch(
            Audience::Single(recipient.to_string()),
            Event::NewNotification { notification },
        );
        Ok(())
    }
}
