//! Event dispatcher
//!
//! Pushes typed events to a resolved audience with best-effort,
//! at-most-once-per-connection semantics. There is no queueing or replay for
//! offline users: the audience is resolved against the registry at the
//! moment of dispatch, and a disconnected client re-fetches authoritative
//! state when it reconnects.
//!
//! A send failure to one recipient never affects delivery to the others and
//! never surfaces to the mutation that triggered the event; the dead entry
//! is reaped from the registry instead.

use std::sync::Arc;

use crate::realtime::protocol::{Envelope, Event};
use crate::realtime::registry::{ConnectionRegistry, LiveConnection, OutboundFrame};

/// The set of live connections an event should be pushed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Exactly one recipient user.
    Single(String),
    /// An explicit list of recipient users.
    Multiple(Vec<String>),
    /// Every currently registered connection.
    All,
    /// Every currently registered connection except one user, so an actor
    /// does not receive an echo of its own optimistic action.
    AllExcept(String),
}

pub struct EventDispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl EventDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    fn resolve(&self, audience: &Audience) -> Vec<LiveConnection> {
        match audience {
            Audience::Single(user_id) => self.registry.lookup(user_id).into_iter().collect(),
            Audience::Multiple(user_ids) => user_ids
                .iter()
                .filter_map(|id| self.registry.lookup(id))
                .collect(),
            Audience::All => self.registry.snapshot(),
            Audience::AllExcept(excluded) => self
                .registry
                .snapshot()
                .into_iter()
                .filter(|c| c.user_id != *excluded)
                .collect(),
        }
    }

    /// Serialize `event` once and push it to every resolved recipient.
    /// Returns the number of delivery attempts, for operational logging.
    pub fn dispatch(&self, audience: Audience, event: Event) -> usize {
        let name = event.name();
        let json = Envelope::new(event).to_json();
        let recipients = self.resolve(&audience);
        let attempted = recipients.len();

        for recipient in recipients {
            if recipient
                .sender
                .send(OutboundFrame::Event(json.clone()))
                .is_err()
            {
                // Receiver gone: the connection task died without
                // unregistering. Treat as an implicit disconnect.
                tracing::debug!(
                    user_id = %recipient.user_id,
                    event = name,
                    "Dropping dead connection during dispatch"
                );
                self.registry
                    .unregister(&recipient.user_id, recipient.connection_id);
            }
        }

        tracing::debug!(event = name, recipients = attempted, "Dispatched event");
        attempted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn register_user(
        registry: &ConnectionRegistry,
        user_id: &str,
    ) -> mpsc::UnboundedReceiver<OutboundFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(crate::realtime::registry::LiveConnection::new(
            user_id.into(),
            format!("u_{user_id}"),
            "User".into(),
            tx,
        ));
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let OutboundFrame::Event(json) = frame {
                frames.push(json);
            }
        }
        frames
    }

    #[test]
    fn test_broadcast_except_excludes_actor() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = EventDispatcher::new(Arc::clone(&registry));
        let mut a = register_user(&registry, "a");
        let mut b = register_user(&registry, "b");

        let sent = dispatcher.dispatch(
            Audience::AllExcept("a".into()),
            Event::PostDeleted { post_id: "p1".into() },
        );
        assert_eq!(sent, 1);
        assert!(drain(&mut a).is_empty());
        let frames = drain(&mut b);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("\"post_deleted\""));
    }

    #[test]
    fn test_single_reaches_only_target() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = EventDispatcher::new(Arc::clone(&registry));
        let mut a = register_user(&registry, "a");
        let mut b = register_user(&registry, "b");

        dispatcher.dispatch(
            Audience::Single("b".into()),
            Event::FollowUpdated { follower_id: "a".into(), following: true },
        );
        assert!(drain(&mut a).is_empty());
        assert_eq!(drain(&mut b).len(), 1);
    }

    #[test]
    fn test_single_to_offline_user_is_noop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = EventDispatcher::new(Arc::clone(&registry));
        let sent = dispatcher.dispatch(
            Audience::Single("ghost".into()),
            Event::Pong,
        );
        assert_eq!(sent, 0);
    }

    #[test]
    fn test_dead_channel_is_reaped_and_others_still_delivered() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = EventDispatcher::new(Arc::clone(&registry));
        let dead = register_user(&registry, "dead");
        drop(dead);
        let mut live = register_user(&registry, "live");

        dispatcher.dispatch(Audience::All, Event::PostDeleted { post_id: "p1".into() });

        assert_eq!(drain(&mut live).len(), 1);
        assert_eq!(registry.count(), 1);
        assert!(registry.lookup("dead").is_none());
    }

    #[test]
    fn test_multiple_resolves_each_live_recipient() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = EventDispatcher::new(Arc::clone(&registry));
        let mut a = register_user(&registry, "a");
        let _b = register_user(&registry, "b");

        let sent = dispatcher.dispatch(
            Audience::Multiple(vec!["a".into(), "offline".into()]),
            Event::Pong,
        );
        assert_eq!(sent, 1);
        assert_eq!(drain(&mut a).len(), 1);
    }
}
