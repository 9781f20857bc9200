use std::sync::Arc;

use tokio::sync::RwLock;

use crate::api::{Gateway, SessionDescriptor};
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::poller::PollTuning;
use crate::session::{ConversationSession, Message};

/// How much history a fork inherits from its source.
pub const FORK_SEED_LEN: usize = 6;

/// The seed for a forked conversation: the last [`FORK_SEED_LEN`] messages
/// when the log is at least that long, otherwise all of them. Original order.
pub fn fork_seed(messages: &[Message]) -> Vec<Message> {
    let start = messages.len().saturating_sub(FORK_SEED_LEN);
    messages[start..].to_vec()
}

/// Creates forked sessions and keeps the registry of known sessions.
///
/// One fork per conversation is server-authoritative: the coordinator does
/// not pre-validate locally, and `has_been_forked` is only set after the
/// request resolves, so a failed fork leaves nothing to roll back.
pub struct ForkCoordinator {
    gateway: Arc<dyn Gateway>,
    events: flume::Sender<EngineEvent>,
    tuning: PollTuning,
    sessions: RwLock<Vec<Arc<ConversationSession>>>,
}

impl ForkCoordinator {
    pub fn new(gateway: Arc<dyn Gateway>, events: flume::Sender<EngineEvent>) -> Self {
        Self::with_tuning(gateway, events, PollTuning::default())
    }

    pub fn with_tuning(
        gateway: Arc<dyn Gateway>,
        events: flume::Sender<EngineEvent>,
        tuning: PollTuning,
    ) -> Self {
        Self {
            gateway,
            events,
            tuning,
            sessions: RwLock::new(Vec::new()),
        }
    }

    /// Registers a session started outside the coordinator (the external
    /// "start conversation" path).
    pub async fn adopt(&self, descriptor: SessionDescriptor) -> Arc<ConversationSession> {
        let session = ConversationSession::from_descriptor(
            descriptor,
            self.gateway.clone(),
            self.events.clone(),
            self.tuning,
        );
        self.sessions.write().await.push(session.clone());
        session
    }

    /// Snapshot of every session the coordinator knows about.
    pub async fn sessions(&self) -> Vec<Arc<ConversationSession>> {
        self.sessions.read().await.clone()
    }

    /// Forks `source` into a new session seeded from its recent history.
    ///
    /// Returns the child session for caller-driven navigation. A `Conflict`
    /// error means a racing client forked first; a `Transport` error is safe
    /// to retry.
    pub async fn fork(
        &self,
        source: &Arc<ConversationSession>,
        description: Option<&str>,
    ) -> Result<Arc<ConversationSession>, EngineError> {
        let seed = fork_seed(&source.messages().await);

        let mut descriptor = self
            .gateway
            .fork_conversation(source.id(), description)
            .await?;

        // Only after the request resolved: the source (and every registry
        // entry sharing its id) is now forked.
        source.mark_forked().await;
        for session in self.sessions.read().await.iter() {
            if session.id() == source.id() && !Arc::ptr_eq(session, source) {
                session.mark_forked().await;
            }
        }

        if descriptor.messages.is_empty() {
            descriptor.messages = seed;
        }
        for message in &mut descriptor.messages {
            message.conversation_id = descriptor.id.clone();
        }

        tracing::info!(
            "Forked conversation {} into {} ({} seed messages)",
            source.id(),
            descriptor.id,
            descriptor.messages.len()
        );

        let child = ConversationSession::from_descriptor(
            descriptor.clone(),
            self.gateway.clone(),
            self.events.clone(),
            self.tuning,
        );
        self.sessions.write().await.push(child.clone());

        let _ = self.events.send(EngineEvent::Forked {
            parent_id: source.id().to_string(),
            descriptor,
        });

        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MockGateway;
    use crate::events::event_channel;
    use crate::session::testing::descriptor;

    fn child_descriptor(parent_id: &str) -> SessionDescriptor {
        SessionDescriptor {
            id: "child-1".to_string(),
            scenario_id: "scn-1".to_string(),
            title: "Forked conversation".to_string(),
            messages: Vec::new(),
            is_root: false,
            has_been_forked: false,
            parent_id: Some(parent_id.to_string()),
            fork_depth: 1,
        }
    }

    #[test]
    fn seed_takes_the_last_six_messages_in_order() {
        let long = descriptor("c1", 8).messages;
        let seed = fork_seed(&long);
        assert_eq!(seed.len(), 6);
        let ids: Vec<&str> = seed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m4", "m5", "m6", "m7"]);

        let short = descriptor("c1", 3).messages;
        let seed = fork_seed(&short);
        assert_eq!(seed.len(), 3);
        assert_eq!(seed[0].id, "m0");
    }

    #[tokio::test]
    async fn fork_seeds_the_child_and_marks_the_source() {
        let gateway = Arc::new(MockGateway::default());
        gateway
            .fork_results
            .lock()
            .unwrap()
            .push_back(Ok(child_descriptor("c1")));
        let (tx, rx) = event_channel();
        let coordinator = ForkCoordinator::new(gateway.clone(), tx);

        let source = coordinator.adopt(descriptor("c1", 8)).await;
        let child = coordinator
            .fork(&source, Some("What if she said no?"))
            .await
            .expect("fork succeeds");

        assert_eq!(child.id(), "child-1");
        assert_eq!(child.parent_id(), Some("c1"));
        assert_eq!(child.fork_depth(), 1);
        assert!(!child.is_root());

        // Exactly the last six messages, original order, re-homed.
        let messages = child.messages().await;
        assert_eq!(messages.len(), 6);
        assert_eq!(messages[0].id, "m2");
        assert_eq!(messages[5].id, "m7");
        assert!(messages.iter().all(|m| m.conversation_id == "child-1"));

        assert!(source.has_been_forked().await);
        assert_eq!(coordinator.sessions().await.len(), 2);

        let calls = gateway.fork_calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![("c1".to_string(), Some("What if she said no?".to_string()))]
        );

        let events: Vec<EngineEvent> = rx.drain().collect();
        assert!(events.iter().any(|event| matches!(
            event,
            EngineEvent::Forked { parent_id, descriptor }
                if parent_id == "c1" && descriptor.id == "child-1"
        )));
    }

    #[tokio::test]
    async fn short_histories_are_copied_whole() {
        let gateway = Arc::new(MockGateway::default());
        gateway
            .fork_results
            .lock()
            .unwrap()
            .push_back(Ok(child_descriptor("c1")));
        let (tx, _rx) = event_channel();
        let coordinator = ForkCoordinator::new(gateway, tx);

        let source = coordinator.adopt(descriptor("c1", 3)).await;
        let child = coordinator.fork(&source, None).await.expect("fork succeeds");

        let messages = child.messages().await;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].id, "m0");
    }

    #[tokio::test]
    async fn server_provided_seed_wins_over_the_local_copy() {
        let gateway = Arc::new(MockGateway::default());
        let mut served = child_descriptor("c1");
        served.messages = descriptor("child-1", 2).messages;
        gateway.fork_results.lock().unwrap().push_back(Ok(served));
        let (tx, _rx) = event_channel();
        let coordinator = ForkCoordinator::new(gateway, tx);

        let source = coordinator.adopt(descriptor("c1", 8)).await;
        let child = coordinator.fork(&source, None).await.expect("fork succeeds");

        assert_eq!(child.messages().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_fork_leaves_no_trace() {
        let gateway = Arc::new(MockGateway::default());
        gateway
            .fork_results
            .lock()
            .unwrap()
            .push_back(Err(EngineError::Conflict("already forked".into())));
        let (tx, rx) = event_channel();
        let coordinator = ForkCoordinator::new(gateway, tx);

        let source = coordinator.adopt(descriptor("c1", 8)).await;
        let error = coordinator.fork(&source, None).await.unwrap_err();

        // Conflict surfaces distinctly from a retryable transport failure.
        assert_eq!(error, EngineError::Conflict("already forked".into()));
        assert!(!error.is_retryable());

        // The flag was never set pre-resolution, so nothing rolls back.
        assert!(!source.has_been_forked().await);
        assert_eq!(coordinator.sessions().await.len(), 1);
        assert!(rx.drain().next().is_none());
    }

    #[tokio::test]
    async fn duplicate_in_memory_references_are_marked_too() {
        let gateway = Arc::new(MockGateway::default());
        gateway
            .fork_results
            .lock()
            .unwrap()
            .push_back(Ok(child_descriptor("c1")));
        let (tx, _rx) = event_channel();
        let coordinator = ForkCoordinator::new(gateway, tx);

        // Two independent in-memory copies of the same conversation, as a UI
        // with a list view and a detail view would hold.
        let list_copy = coordinator.adopt(descriptor("c1", 4)).await;
        let detail_copy = coordinator.adopt(descriptor("c1", 4)).await;

        coordinator
            .fork(&detail_copy, None)
            .await
            .expect("fork succeeds");

        assert!(detail_copy.has_been_forked().await);
        assert!(list_copy.has_been_forked().await);
    }
}
