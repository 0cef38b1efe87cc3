//! Client-side reconciliation model
//!
//! The consumer-side contract for the realtime protocol: a local view-model
//! store that applies optimistic mutations immediately and reconciles them
//! against server-confirmed events through one typed handler, matching the
//! event catalogue one-to-one.
//!
//! The model holds one canonical copy per entity id; a UI that renders the
//! same entity in several places (feed and detail view at once) renders all
//! of them from this copy, so every instance updates together.
//!
//! Count-bearing events replace local state, they never adjust it: an older
//! event arriving after a newer one overwrites with stale data until the
//! next event corrects it, which is the accepted ordering discipline when
//! every event carries the authoritative post-mutation state.

use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::model::{CommentView, Notification, PostView, UserSummary};
use crate::realtime::protocol::Event;
use crate::store::LikeTarget;

/// Idle window after the last keystroke before typing_stop is emitted.
pub const TYPING_IDLE: Duration = Duration::from_secs(2);
/// Receiver-side expiry of a typing indicator, against a missed stop event.
pub const TYPING_TTL: Duration = Duration::from_secs(3);

/// Per-likeable-entity local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeState {
    pub liked: bool,
    pub like_count: usize,
    /// A write is outstanding; the control is disabled until it completes.
    pub in_flight: bool,
}

#[derive(Debug, Clone)]
struct TypingEntry {
    display_name: String,
    expires_at: Instant,
}

/// Local view-model store for one signed-in user.
pub struct FeedModel {
    me: String,
    posts: AHashMap<String, PostView>,
    likes: AHashMap<LikeTarget, LikeState>,
    /// (post id, typing user id) -> indicator
    typing: AHashMap<(String, String), TypingEntry>,
    notifications: Vec<Notification>,
    /// Users I follow, as last confirmed by the server.
    following: AHashMap<String, bool>,
    online: AHashMap<String, bool>,
}

impl FeedModel {
    pub fn new(me: impl Into<String>) -> Self {
        Self {
            me: me.into(),
            posts: AHashMap::new(),
            likes: AHashMap::new(),
            typing: AHashMap::new(),
            notifications: Vec::new(),
            following: AHashMap::new(),
            online: AHashMap::new(),
        }
    }

    pub fn post(&self, post_id: &str) -> Option<&PostView> {
        self.posts.get(post_id)
    }

    pub fn like_state(&self, target: &LikeTarget) -> Option<LikeState> {
        self.likes.get(target).copied()
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn is_following(&self, user_id: &str) -> bool {
        self.following.get(user_id).copied().unwrap_or(false)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.get(user_id).copied().unwrap_or(false)
    }

    /// Start tracking a post fetched over the normal read path.
    pub fn track_post(&mut self, post: PostView) {
        self.seed_like_states(&post);
        self.posts.insert(post.id.clone(), post);
    }

    fn seed_like_states(&mut self, post: &PostView) {
        let me = self.me.clone();
        self.likes.insert(
            LikeTarget::Post { post_id: post.id.clone() },
            LikeState {
                liked: post.likes.iter().any(|u| u == &me),
                like_count: post.likes.len(),
                in_flight: false,
            },
        );
        for comment in &post.comments {
            self.seed_comment_like(&post.id, comment);
        }
    }

    fn seed_comment_like(&mut self, post_id: &str, comment: &CommentView) {
        let me = self.me.clone();
        self.likes.insert(
            LikeTarget::Comment { post_id: post_id.to_string(), comment_id: comment.id.clone() },
            LikeState {
                liked: comment.likes.iter().any(|u| u == &me),
                like_count: comment.likes.len(),
                in_flight: false,
            },
        );
        for reply in &comment.replies {
            self.likes.insert(
                LikeTarget::Reply {
                    post_id: post_id.to_string(),
                    comment_id: comment.id.clone(),
                    reply_id: reply.id.clone(),
                },
                LikeState {
                    liked: reply.likes.iter().any(|u| u == &me),
                    like_count: reply.likes.len(),
                    in_flight: false,
                },
            );
        }
    }

    // -- optimistic like flow ------------------------------------------------

    /// User tapped a like control. Flips the local state immediately and
    /// latches the control; returns the new local `liked` value so the
    /// caller can issue the write, or `None` while a write is already
    /// outstanding or the entity is unknown.
    pub fn like_pressed(&mut self, target: &LikeTarget) -> Option<bool> {
        let state = self.likes.get_mut(target)?;
        if state.in_flight {
            return None;
        }
        state.in_flight = true;
        state.liked = !state.liked;
        if state.liked {
            state.like_count += 1;
        } else {
            state.like_count = state.like_count.saturating_sub(1);
        }
        Some(state.liked)
    }

    /// The write succeeded. No local change beyond re-enabling the control;
    /// the authoritative `*_like_updated` event supplies the final truth.
    pub fn like_request_succeeded(&mut self, target: &LikeTarget) {
        if let Some(state) = self.likes.get_mut(target) {
            state.in_flight = false;
        }
    }

    /// The write failed: revert the optimistic change.
    pub fn like_request_failed(&mut self, target: &LikeTarget) {
        if let Some(state) = self.likes.get_mut(target) {
            state.in_flight = false;
            state.liked = !state.liked;
            if state.liked {
                state.like_count += 1;
            } else {
                state.like_count = state.like_count.saturating_sub(1);
            }
        }
    }

    // -- server event reconciliation -----------------------------------------

    /// Apply one server event to the local store. Events referring to
    /// entities not currently tracked are silent no-ops.
    pub fn apply(&mut self, event: &Event, now: Instant) {
        match event {
            Event::NewPost { post } | Event::PostUpdated { post } => {
                // New content is tracked; an update to an untracked post is
                // also just tracked wholesale, the payload is complete.
                self.track_post(post.clone());
            }
            Event::PostDeleted { post_id } => {
                self.posts.remove(post_id);
                self.likes.retain(|k, _| k.post_id() != post_id);
                self.typing.retain(|(p, _), _| p != post_id);
            }
            Event::PostLikeUpdated { post_id, user_id, liked, like_count } => {
                let target = LikeTarget::Post { post_id: post_id.clone() };
                self.reconcile_like(&target, user_id, *liked, *like_count);
                if let Some(post) = self.posts.get_mut(post_id) {
                    set_membership(&mut post.likes, user_id, *liked);
                    post.like_count = *like_count;
                }
            }
            Event::PostSaveUpdated { post_id, save_count, .. } => {
                if let Some(post) = self.posts.get_mut(post_id) {
                    post.save_count = *save_count;
                }
            }
            Event::NewComment { post_id, comment }
            | Event::CommentUpdated { post_id, comment } => {
                self.seed_comment_like(post_id, comment);
                if let Some(post) = self.posts.get_mut(post_id) {
                    match post.comments.iter_mut().find(|c| c.id == comment.id) {
                        Some(existing) => *existing = comment.clone(),
                        None => post.comments.push(comment.clone()),
                    }
                    post.comment_count = post.comments.len();
                }
            }
            Event::CommentLikeUpdated { post_id, comment_id, user_id, liked, like_count } => {
                let target = LikeTarget::Comment {
                    post_id: post_id.clone(),
                    comment_id: comment_id.clone(),
                };
                self.reconcile_like(&target, user_id, *liked, *like_count);
                if let Some(comment) = self.comment_mut(post_id, comment_id) {
                    set_membership(&mut comment.likes, user_id, *liked);
                    comment.like_count = *like_count;
                }
            }
            Event::CommentDeleted { post_id, comment_id } => {
                if let Some(post) = self.posts.get_mut(post_id) {
                    post.comments.retain(|c| c.id != *comment_id);
                    post.comment_count = post.comments.len();
                }
                self.likes.retain(|k, _| match k {
                    LikeTarget::Comment { post_id: p, comment_id: c }
                    | LikeTarget::Reply { post_id: p, comment_id: c, .. } => {
                        !(p == post_id && c == comment_id)
                    }
                    _ => true,
                });
            }
            Event::ReplyAdded { post_id, comment_id, reply }
            | Event::ReplyUpdated { post_id, comment_id, reply } => {
                let target = LikeTarget::Reply {
                    post_id: post_id.clone(),
                    comment_id: comment_id.clone(),
                    reply_id: reply.id.clone(),
                };
                let me = &self.me;
                let state = LikeState {
                    liked: reply.likes.iter().any(|u| u == me),
                    like_count: reply.likes.len(),
                    in_flight: false,
                };
                self.likes.insert(target, state);
                if let Some(comment) = self.comment_mut(post_id, comment_id) {
                    match comment.replies.iter_mut().find(|r| r.id == reply.id) {
                        Some(existing) => *existing = reply.clone(),
                        None => comment.replies.push(reply.clone()),
                    }
                }
            }
            Event::ReplyLikeUpdated {
                post_id,
                comment_id,
                reply_id,
                user_id,
                liked,
                like_count,
            } => {
                let target = LikeTarget::Reply {
                    post_id: post_id.clone(),
                    comment_id: comment_id.clone(),
                    reply_id: reply_id.clone(),
                };
                self.reconcile_like(&target, user_id, *liked, *like_count);
                if let Some(comment) = self.comment_mut(post_id, comment_id) {
                    if let Some(reply) = comment.replies.iter_mut().find(|r| r.id == *reply_id) {
                        set_membership(&mut reply.likes, user_id, *liked);
                        reply.like_count = *like_count;
                    }
                }
            }
            Event::ReplyDeleted { post_id, comment_id, reply_id } => {
                if let Some(comment) = self.comment_mut(post_id, comment_id) {
                    comment.replies.retain(|r| r.id != *reply_id);
                }
                self.likes.retain(|k, _| {
                    !matches!(k, LikeTarget::Reply { post_id: p, comment_id: c, reply_id: r }
                        if p == post_id && c == comment_id && r == reply_id)
                });
            }
            Event::NewNotification { notification } => {
                self.notifications.insert(0, notification.clone());
            }
            Event::FollowUpdated { .. } => {
                // My follower list is not part of the rendered feed model;
                // a counter badge would re-fetch on this signal.
            }
            Event::FollowStatusUpdated { target_user_id, following } => {
                self.following.insert(target_user_id.clone(), *following);
            }
            Event::UserTyping { post_id, user_id, display_name, typing } => {
                let key = (post_id.clone(), user_id.clone());
                if *typing {
                    self.typing.insert(
                        key,
                        TypingEntry {
                            display_name: display_name.clone(),
                            expires_at: now + TYPING_TTL,
                        },
                    );
                } else {
                    self.typing.remove(&key);
                }
            }
            Event::UserUpdated { user } => {
                let summary = UserSummary {
                    id: user.id.clone(),
                    username: user.username.clone(),
                    name: user.name.clone(),
                };
                for post in self.posts.values_mut() {
                    if post.author.id == summary.id {
                        post.author = summary.clone();
                    }
                    for comment in &mut post.comments {
                        if comment.author.id == summary.id {
                            comment.author = summary.clone();
                        }
                        for reply in &mut comment.replies {
                            if reply.author.id == summary.id {
                                reply.author = summary.clone();
                            }
                        }
                    }
                }
            }
            Event::UserOnlineStatus { user_id, online } => {
                self.online.insert(user_id.clone(), *online);
            }
            Event::ConnectionEstablished { .. }
            | Event::Ping
            | Event::Pong
            | Event::Error { .. } => {}
        }
    }

    /// Replacement, not delta: both the flag and the count come from the
    /// event. The liked flag describes the acting user, so it only replaces
    /// ours when we are the actor; that also completes our in-flight write.
    fn reconcile_like(&mut self, target: &LikeTarget, actor: &str, liked: bool, like_count: usize) {
        if let Some(state) = self.likes.get_mut(target) {
            state.like_count = like_count;
            if actor == self.me {
                state.liked = liked;
                state.in_flight = false;
            }
        }
    }

    fn comment_mut(&mut self, post_id: &str, comment_id: &str) -> Option<&mut CommentView> {
        self.posts
            .get_mut(post_id)?
            .comments
            .iter_mut()
            .find(|c| c.id == comment_id)
    }

    /// Who is currently typing under a post. Prunes indicators past their
    /// TTL, so a missed stop event self-expires.
    pub fn typing_users(&mut self, post_id: &str, now: Instant) -> Vec<String> {
        self.typing.retain(|_, entry| entry.expires_at > now);
        self.typing
            .iter()
            .filter(|((p, _), _)| p == post_id)
            .map(|(_, entry)| entry.display_name.clone())
            .collect()
    }
}

// Keep a membership vector consistent with a liked/unliked transition.
fn set_membership(members: &mut Vec<String>, user_id: &str, present: bool) {
    if present {
        if !members.iter().any(|u| u == user_id) {
            members.push(user_id.to_string());
        }
    } else {
        members.retain(|u| u != user_id);
    }
}

/// Sender-side typing state for one comment/reply box.
///
/// Emits a start on the first keystroke and a stop after the idle window,
/// on blur, or on submit; the receiving side additionally expires the
/// indicator on its own after [`TYPING_TTL`].
#[derive(Debug, Default)]
pub struct TypingTracker {
    active: bool,
    last_keystroke: Option<Instant>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when a typing_start should be emitted.
    pub fn on_keystroke(&mut self, now: Instant) -> bool {
        self.last_keystroke = Some(now);
        if self.active {
            false
        } else {
            self.active = true;
            true
        }
    }

    /// When the pending typing_stop is due, if any.
    pub fn idle_deadline(&self) -> Option<Instant> {
        if !self.active {
            return None;
        }
        self.last_keystroke.map(|t| t + TYPING_IDLE)
    }

    /// Timer fired. Returns true when the idle window elapsed and a
    /// typing_stop should be emitted.
    pub fn on_idle_check(&mut self, now: Instant) -> bool {
        match self.idle_deadline() {
            Some(deadline) if now >= deadline => {
                self.active = false;
                true
            }
            _ => false,
        }
    }

    /// Blur or successful submission. Returns true when a typing_stop
    /// should be emitted.
    pub fn on_stop(&mut self) -> bool {
        let was_active = self.active;
        self.active = false;
        self.last_keystroke = None;
        was_active
    }
}

/// Bounded exponential backoff for reconnecting a dropped realtime
/// connection. After the attempt budget is spent the caller falls back to
/// manual reconnection.
#[derive(Debug)]
pub struct ReconnectBackoff {
    attempt: u32,
    base: Duration,
    max_attempts: u32,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self { attempt: 0, base: Duration::from_secs(1), max_attempts: 5 }
    }

    /// Delay before the next attempt, doubling each time, or `None` once
    /// the attempt budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.base * 2u32.pow(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// A connection was established; start over on the next drop.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UserSummary;

    fn author(id: &str) -> UserSummary {
        UserSummary { id: id.into(), username: format!("u_{id}"), name: format!("User {id}") }
    }

    fn post_view(id: &str, author_id: &str) -> PostView {
        PostView {
            id: id.into(),
            title: "t".into(),
            content: "c".into(),
            category: "Other".into(),
            tags: vec![],
            author: author(author_id),
            likes: vec![],
            like_count: 0,
            comments: vec![],
            comment_count: 0,
            save_count: 0,
            is_repost: false,
            original_post: None,
            repost_count: 0,
            created_at: "t0".into(),
            updated_at: "t0".into(),
        }
    }

    fn comment_view(id: &str, author_id: &str) -> CommentView {
        CommentView {
            id: id.into(),
            author: author(author_id),
            content: "c".into(),
            likes: vec![],
            like_count: 0,
            replies: vec![],
            created_at: "t0".into(),
            updated_at: "t0".into(),
        }
    }

    #[test]
    fn test_optimistic_like_and_confirmation() {
        let mut model = FeedModel::new("me");
        model.track_post(post_view("p1", "other"));
        let target = LikeTarget::Post { post_id: "p1".into() };

        assert_eq!(model.like_pressed(&target), Some(true));
        let state = model.like_state(&target).unwrap();
        assert!(state.liked && state.in_flight);
        assert_eq!(state.like_count, 1);

        // Control is latched while the write is outstanding.
        assert_eq!(model.like_pressed(&target), None);

        // Authoritative echo replaces flag and count and completes the write.
        model.apply(
            &Event::PostLikeUpdated {
                post_id: "p1".into(),
                user_id: "me".into(),
                liked: true,
                like_count: 3,
            },
            Instant::now(),
        );
        let state = model.like_state(&target).unwrap();
        assert!(state.liked && !state.in_flight);
        assert_eq!(state.like_count, 3);
    }

    #[test]
    fn test_failed_like_reverts() {
        let mut model = FeedModel::new("me");
        model.track_post(post_view("p1", "other"));
        let target = LikeTarget::Post { post_id: "p1".into() };

        model.like_pressed(&target);
        model.like_request_failed(&target);
        let state = model.like_state(&target).unwrap();
        assert!(!state.liked && !state.in_flight);
        assert_eq!(state.like_count, 0);
    }

    #[test]
    fn test_foreign_like_updates_count_not_flag() {
        let mut model = FeedModel::new("me");
        model.track_post(post_view("p1", "other"));
        let target = LikeTarget::Post { post_id: "p1".into() };
        model.like_pressed(&target);

        // Someone else's like arrives before my confirmation: my flag and
        // my in-flight latch are untouched, the count is replaced.
        model.apply(
            &Event::PostLikeUpdated {
                post_id: "p1".into(),
                user_id: "someone".into(),
                liked: true,
                like_count: 7,
            },
            Instant::now(),
        );
        let state = model.like_state(&target).unwrap();
        assert!(state.liked && state.in_flight);
        assert_eq!(state.like_count, 7);
    }

    #[test]
    fn test_event_for_unrendered_entity_is_noop() {
        let mut model = FeedModel::new("me");
        model.apply(
            &Event::PostLikeUpdated {
                post_id: "ghost".into(),
                user_id: "me".into(),
                liked: true,
                like_count: 1,
            },
            Instant::now(),
        );
        assert!(model.post("ghost").is_none());
        assert!(model
            .like_state(&LikeTarget::Post { post_id: "ghost".into() })
            .is_none());
    }

    #[test]
    fn test_comment_delete_removes_exactly_one() {
        let mut model = FeedModel::new("me");
        let mut post = post_view("p1", "other");
        post.comments = vec![comment_view("c1", "a"), comment_view("c2", "b")];
        post.comment_count = 2;
        model.track_post(post);

        model.apply(
            &Event::CommentDeleted { post_id: "p1".into(), comment_id: "c1".into() },
            Instant::now(),
        );
        let post = model.post("p1").unwrap();
        assert_eq!(post.comments.len(), 1);
        assert_eq!(post.comments[0].id, "c2");
        assert!(model
            .like_state(&LikeTarget::Comment { post_id: "p1".into(), comment_id: "c1".into() })
            .is_none());
    }

    #[test]
    fn test_post_delete_clears_dependents() {
        let mut model = FeedModel::new("me");
        let mut post = post_view("p1", "other");
        post.comments = vec![comment_view("c1", "a")];
        model.track_post(post);

        model.apply(&Event::PostDeleted { post_id: "p1".into() }, Instant::now());
        assert!(model.post("p1").is_none());
        assert!(model
            .like_state(&LikeTarget::Comment { post_id: "p1".into(), comment_id: "c1".into() })
            .is_none());
    }

    #[test]
    fn test_typing_indicator_expires_without_stop() {
        let mut model = FeedModel::new("me");
        let t0 = Instant::now();
        model.apply(
            &Event::UserTyping {
                post_id: "p1".into(),
                user_id: "u2".into(),
                display_name: "Grace".into(),
                typing: true,
            },
            t0,
        );
        assert_eq!(model.typing_users("p1", t0), vec!["Grace".to_string()]);
        // The stop event was missed; the indicator self-expires.
        assert!(model.typing_users("p1", t0 + TYPING_TTL).is_empty());
    }

    #[test]
    fn test_typing_tracker_emits_start_once_and_stop_after_idle() {
        let mut tracker = TypingTracker::new();
        let t0 = Instant::now();
        assert!(tracker.on_keystroke(t0));
        assert!(!tracker.on_keystroke(t0 + Duration::from_millis(300)));

        // Keystrokes keep pushing the deadline.
        assert!(!tracker.on_idle_check(t0 + Duration::from_millis(1500)));
        assert!(tracker.on_idle_check(t0 + Duration::from_millis(300) + TYPING_IDLE));

        // Next keystroke starts a fresh indicator.
        assert!(tracker.on_keystroke(t0 + Duration::from_secs(10)));
        assert!(tracker.on_stop());
        assert!(!tracker.on_stop());
    }

    #[test]
    fn test_backoff_doubles_then_gives_up() {
        let mut backoff = ReconnectBackoff::new();
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ]
        );
        assert!(backoff.next_delay().is_none());

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_notifications_prepend() {
        let mut model = FeedModel::new("me");
        for i in 0..2 {
            model.apply(
                &Event::NewNotification {
                    notification: Notification {
                        id: format!("n{i}"),
                        kind: crate::model::NotificationKind::Like,
                        from_user: Some(author("u2")),
                        post: None,
                        comment: None,
                        reply: None,
                        message: "m".into(),
                        read: false,
                        created_at: "t".into(),
                    },
                },
                Instant::now(),
            );
        }
        assert_eq!(model.notifications()[0].id, "n1");
    }
}
