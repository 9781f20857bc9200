use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::api::{PollResponse, PollStatus};
use crate::events::EngineEvent;
use crate::session::{ConversationSession, Message, MessageRole, PollingState};

/// Shown in place of the reply when the transport retry budget is spent.
pub const CONNECTION_LOST_TEXT: &str = "Connection lost. Click to retry.";

/// Shown when the backend reports a failed generation without a reason.
pub const REPLY_FAILED_TEXT: &str = "The character could not reply. Please try again later.";

#[derive(Debug, Clone, Copy)]
pub struct PollTuning {
    /// Fixed delay between polls while the reply is queued or processing.
    pub interval: Duration,
    /// Consecutive transport failures tolerated before giving up.
    pub max_transport_retries: u32,
}

impl Default for PollTuning {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_transport_retries: 3,
        }
    }
}

/// Exponential backoff before transport retry N (1-based): 1s, 2s, 4s.
pub(crate) fn backoff_delay(retry: u32) -> Duration {
    Duration::from_secs(1u64 << retry.saturating_sub(1).min(2))
}

/// Discovers the AI reply for the most recent submission by repeatedly
/// querying the poll endpoint until a terminal outcome.
///
/// Only transport failures count toward exhaustion; `queued`/`processing`
/// responses reset the retry counter. A `failed` status is authoritative and
/// never retried automatically.
pub(crate) struct ResponsePoller {
    session: Arc<ConversationSession>,
    retries: u32,
}

impl ResponsePoller {
    /// Appends the empty assistant placeholder and spawns the poll loop.
    /// Precondition: the user message was just durably submitted.
    pub(crate) async fn start(session: Arc<ConversationSession>) {
        {
            let mut state = session.state().write().await;
            let placeholder = Message::local(session.id(), MessageRole::Assistant, "");
            state.messages.push(placeholder.clone());
            session.emit(EngineEvent::MessageAppended {
                conversation_id: session.id().to_string(),
                message: placeholder,
            });
        }
        Self::spawn(session);
    }

    /// Re-enters the loop after a user-triggered retry. The placeholder from
    /// the original cycle is reused; the retry budget starts fresh.
    pub(crate) fn resume(session: Arc<ConversationSession>) {
        Self::spawn(session);
    }

    fn spawn(session: Arc<ConversationSession>) {
        let poller = Self {
            session,
            retries: 0,
        };
        tokio::spawn(poller.run());
    }

    async fn run(mut self) {
        loop {
            let outcome = self
                .session
                .gateway()
                .poll_response(self.session.id())
                .await;

            match outcome {
                Ok(response) => match response.status {
                    PollStatus::Queued | PollStatus::Processing => {
                        if let Some(partial) = response.content {
                            self.reveal(partial).await;
                        }
                        // Legitimate in-progress states never count toward
                        // the transport retry budget.
                        self.retries = 0;
                        if !self.pause(self.session.tuning().interval).await {
                            return;
                        }
                    }
                    PollStatus::Completed => {
                        self.complete(response).await;
                        return;
                    }
                    PollStatus::Failed => {
                        self.fail_semantic(response.error).await;
                        return;
                    }
                    PollStatus::NotFound | PollStatus::Unknown => {
                        tracing::warn!(
                            "Poll for conversation {} returned {:?}; treating as transport anomaly",
                            self.session.id(),
                            response.status
                        );
                        if !self.transport_failure().await {
                            return;
                        }
                    }
                },
                Err(error) => {
                    tracing::warn!(
                        "Poll for conversation {} failed: {}",
                        self.session.id(),
                        error
                    );
                    if !self.transport_failure().await {
                        return;
                    }
                }
            }
        }
    }

    /// Progressive reveal: overwrite the placeholder with partial content.
    async fn reveal(&self, partial: String) {
        if let Some(message) = self.write_placeholder(partial, None).await {
            self.session.emit(EngineEvent::AssistantContentUpdated {
                conversation_id: self.session.id().to_string(),
                message_id: message.id,
                content: message.content,
            });
        }
    }

    async fn complete(&self, response: PollResponse) {
        let content = response.content.unwrap_or_default();
        let finalized = {
            let mut state = self.session.state().write().await;
            let finalized = match state.messages.last_mut() {
                Some(message) if message.role == MessageRole::Assistant => {
                    message.content = content;
                    if let Some(server_id) = response.message_id {
                        message.id = server_id;
                    }
                    Some(message.clone())
                }
                _ => None,
            };
            state.polling = PollingState::Idle;
            state.last_error = None;
            finalized
        };

        if let Some(message) = finalized {
            self.session.emit(EngineEvent::MessageCompleted {
                conversation_id: self.session.id().to_string(),
                message,
            });
        }
        self.session.emit(EngineEvent::PollingStateChanged {
            conversation_id: self.session.id().to_string(),
            state: PollingState::Idle,
        });
        tracing::debug!("Reply completed for conversation {}", self.session.id());
    }

    /// The backend gave up on this reply. Terminal; retrying would resubmit
    /// against a generation the backend already rejected.
    async fn fail_semantic(&self, reason: Option<String>) {
        let reason = reason
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| REPLY_FAILED_TEXT.to_string());
        self.enter_error(reason).await;
    }

    /// Counts a transport failure against the retry budget. Returns false
    /// when the loop must stop (budget spent or session cancelled).
    async fn transport_failure(&mut self) -> bool {
        self.retries += 1;
        let budget = self.session.tuning().max_transport_retries;
        if self.retries >= budget {
            tracing::warn!(
                "Giving up on conversation {} after {} transport failures",
                self.session.id(),
                self.retries
            );
            self.enter_error(CONNECTION_LOST_TEXT.to_string()).await;
            return false;
        }
        self.pause(backoff_delay(self.retries)).await
    }

    /// Failures surface inside the conversation itself: the placeholder's
    /// content becomes the error text, since the chat log is the only error
    /// channel the conversational UI has.
    async fn enter_error(&self, reason: String) {
        let updated = self.write_placeholder(reason.clone(), None).await;
        {
            let mut state = self.session.state().write().await;
            state.polling = PollingState::Error;
            state.last_error = Some(reason.clone());
        }

        if let Some(message) = updated {
            self.session.emit(EngineEvent::AssistantContentUpdated {
                conversation_id: self.session.id().to_string(),
                message_id: message.id,
                content: message.content,
            });
        }
        self.session.emit(EngineEvent::PollingStateChanged {
            conversation_id: self.session.id().to_string(),
            state: PollingState::Error,
        });
        self.session.emit(EngineEvent::PollingFailed {
            conversation_id: self.session.id().to_string(),
            reason,
        });
    }

    async fn write_placeholder(
        &self,
        content: String,
        server_id: Option<String>,
    ) -> Option<Message> {
        let mut state = self.session.state().write().await;
        match state.messages.last_mut() {
            Some(message) if message.role == MessageRole::Assistant => {
                message.content = content;
                if let Some(id) = server_id {
                    message.id = id;
                }
                Some(message.clone())
            }
            _ => None,
        }
    }

    /// Sleeps unless the session scope is cancelled first. Returns false on
    /// cancellation; the loop stops without touching session state.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.session.scope().cancelled() => false,
            _ = sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{
        poll_completed, poll_failed, poll_in_progress, poll_with_status, MockGateway,
    };
    use crate::error::EngineError;
    use crate::session::testing::session_with;

    async fn wait_for_state(session: &Arc<ConversationSession>, target: PollingState) {
        for _ in 0..5000 {
            if session.polling_state().await == target {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached {:?}", target);
    }

    #[test]
    fn backoff_schedule_is_one_two_four_seconds() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        // The schedule caps; it never grows past the third step.
        assert_eq!(backoff_delay(4), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn progressive_reveal_converges_on_final_content() {
        let gateway = Arc::new(MockGateway::default());
        {
            let mut polls = gateway.poll_results.lock().unwrap();
            polls.push_back(Ok(poll_in_progress("Once upon")));
            polls.push_back(Ok(poll_completed("Once upon a time.", Some("srv-7"))));
        }
        let (session, rx) = session_with(gateway, 0);

        session.send_message("Tell me a story").await.expect("send");
        wait_for_state(&session, PollingState::Idle).await;

        let messages = session.messages().await;
        assert_eq!(messages.len(), 2);
        let reply = &messages[1];
        assert_eq!(reply.content, "Once upon a time.");
        assert_eq!(reply.id, "srv-7");
        assert!(!reply.is_local());

        // The partial was surfaced on the way to the terminal content.
        let events: Vec<EngineEvent> = rx.drain().collect();
        assert!(events.iter().any(|event| matches!(
            event,
            EngineEvent::AssistantContentUpdated { content, .. } if content == "Once upon"
        )));
        assert!(events.iter().any(|event| matches!(
            event,
            EngineEvent::MessageCompleted { message, .. } if message.content == "Once upon a time."
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_exhaustion_follows_the_backoff_schedule() {
        let gateway = Arc::new(MockGateway::default());
        {
            let mut polls = gateway.poll_results.lock().unwrap();
            for _ in 0..3 {
                polls.push_back(Err(EngineError::Transport("connection reset".into())));
            }
        }
        let (session, _rx) = session_with(gateway.clone(), 0);

        session.send_message("Hello?").await.expect("send");
        wait_for_state(&session, PollingState::Error).await;

        let instants = gateway.poll_instants.lock().unwrap().clone();
        assert_eq!(instants.len(), 3);
        assert_eq!(instants[1] - instants[0], Duration::from_secs(1));
        assert_eq!(instants[2] - instants[1], Duration::from_secs(2));

        let messages = session.messages().await;
        assert_eq!(messages.last().unwrap().content, CONNECTION_LOST_TEXT);
        assert_eq!(session.last_error().await.as_deref(), Some(CONNECTION_LOST_TEXT));

        // No further attempt is ever scheduled.
        sleep(Duration::from_secs(30)).await;
        assert_eq!(gateway.poll_instants.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn in_progress_statuses_reset_the_retry_counter() {
        let gateway = Arc::new(MockGateway::default());
        {
            let mut polls = gateway.poll_results.lock().unwrap();
            // Two transport failures, then the backend catches up; the two
            // failures after that start a fresh budget instead of exhausting.
            polls.push_back(Err(EngineError::Transport("blip".into())));
            polls.push_back(Err(EngineError::Transport("blip".into())));
            polls.push_back(Ok(poll_with_status(PollStatus::Processing)));
            polls.push_back(Err(EngineError::Transport("blip".into())));
            polls.push_back(Err(EngineError::Transport("blip".into())));
            polls.push_back(Ok(poll_completed("Done.", None)));
        }
        let (session, _rx) = session_with(gateway.clone(), 0);

        session.send_message("Still there?").await.expect("send");
        wait_for_state(&session, PollingState::Idle).await;

        assert_eq!(gateway.poll_instants.lock().unwrap().len(), 6);
        assert_eq!(session.messages().await.last().unwrap().content, "Done.");
    }

    #[tokio::test(start_paused = true)]
    async fn semantic_failure_is_terminal_and_surfaces_the_reason() {
        let gateway = Arc::new(MockGateway::default());
        gateway
            .poll_results
            .lock()
            .unwrap()
            .push_back(Ok(poll_failed(Some("scenario archived"))));
        let (session, _rx) = session_with(gateway.clone(), 0);

        session.send_message("Anyone home?").await.expect("send");
        wait_for_state(&session, PollingState::Error).await;

        assert_eq!(
            session.messages().await.last().unwrap().content,
            "scenario archived"
        );

        // Semantic failures are never auto-retried.
        sleep(Duration::from_secs(30)).await;
        assert_eq!(gateway.poll_instants.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_retried_like_a_transport_anomaly() {
        let gateway = Arc::new(MockGateway::default());
        {
            let mut polls = gateway.poll_results.lock().unwrap();
            for _ in 0..3 {
                polls.push_back(Ok(poll_with_status(PollStatus::NotFound)));
            }
        }
        let (session, _rx) = session_with(gateway.clone(), 0);

        session.send_message("Hello?").await.expect("send");
        wait_for_state(&session, PollingState::Error).await;

        assert_eq!(gateway.poll_instants.lock().unwrap().len(), 3);
        assert_eq!(session.messages().await.last().unwrap().content, CONNECTION_LOST_TEXT);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognized_status_is_retried_like_a_transport_anomaly() {
        let gateway = Arc::new(MockGateway::default());
        {
            // Decoded from the wire, so a status this client has never heard
            // of really does land in the catch-all variant.
            let response: PollResponse =
                serde_json::from_value(serde_json::json!({ "status": "rate_limited" }))
                    .expect("decode unrecognized status");
            assert_eq!(response.status, PollStatus::Unknown);

            let mut polls = gateway.poll_results.lock().unwrap();
            for _ in 0..3 {
                polls.push_back(Ok(response.clone()));
            }
        }
        let (session, _rx) = session_with(gateway.clone(), 0);

        session.send_message("Hello?").await.expect("send");
        wait_for_state(&session, PollingState::Error).await;

        assert_eq!(gateway.poll_instants.lock().unwrap().len(), 3);
        assert_eq!(session.messages().await.last().unwrap().content, CONNECTION_LOST_TEXT);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_polling_starts_a_fresh_cycle_against_the_same_placeholder() {
        let gateway = Arc::new(MockGateway::default());
        {
            let mut polls = gateway.poll_results.lock().unwrap();
            for _ in 0..3 {
                polls.push_back(Err(EngineError::Transport("offline".into())));
            }
        }
        let (session, _rx) = session_with(gateway.clone(), 0);

        session.send_message("Hi").await.expect("send");
        wait_for_state(&session, PollingState::Error).await;
        assert_eq!(session.messages().await.len(), 2);

        gateway
            .poll_results
            .lock()
            .unwrap()
            .push_back(Ok(poll_completed("Back online.", Some("srv-1"))));
        session.retry_polling().await.expect("retry accepted");
        wait_for_state(&session, PollingState::Idle).await;

        // Same placeholder, no extra message.
        let messages = session.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Back online.");
        assert_eq!(messages[1].id, "srv-1");
        assert!(session.last_error().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn closing_the_session_stops_scheduled_polls() {
        let gateway = Arc::new(MockGateway::default());
        {
            let mut polls = gateway.poll_results.lock().unwrap();
            for _ in 0..20 {
                polls.push_back(Ok(poll_with_status(PollStatus::Queued)));
            }
        }
        let (session, _rx) = session_with(gateway.clone(), 0);

        session.send_message("Hi").await.expect("send");
        sleep(Duration::from_millis(2500)).await;
        let before = gateway.poll_instants.lock().unwrap().len();
        assert!(before >= 2);

        session.close();
        sleep(Duration::from_secs(30)).await;
        assert_eq!(gateway.poll_instants.lock().unwrap().len(), before);
    }
}
