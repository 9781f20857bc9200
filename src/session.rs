use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::api::{Gateway, SessionDescriptor};
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::poller::{PollTuning, ResponsePoller};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One entry in a conversation log. Minted locally with a temporary id on
/// submission; the trailing assistant placeholder adopts the server id when
/// polling completes. Everything else is append-only and immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub(crate) fn local(conversation_id: &str, role: MessageRole, content: &str) -> Self {
        Self {
            id: format!("local-{}", uuid::Uuid::new_v4()),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.id.starts_with("local-")
    }
}

/// Lifecycle of the reply this session is (or is not) waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollingState {
    #[default]
    Idle,
    Polling,
    Error,
}

#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) messages: Vec<Message>,
    pub(crate) polling: PollingState,
    pub(crate) last_error: Option<String>,
    pub(crate) has_been_forked: bool,
}

/// A conversation with one AI character: the ordered message log, the
/// polling state machine for the pending reply, and fork bookkeeping.
///
/// At most one poll cycle runs per session; `send_message` enforces the
/// single-flight invariant rather than trusting the UI to disable a button.
pub struct ConversationSession {
    id: String,
    scenario_id: String,
    title: String,
    is_root: bool,
    parent_id: Option<String>,
    fork_depth: u32,
    state: Arc<RwLock<SessionState>>,
    gateway: Arc<dyn Gateway>,
    events: flume::Sender<EngineEvent>,
    tuning: PollTuning,
    scope: CancellationToken,
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("id", &self.id)
            .field("scenario_id", &self.scenario_id)
            .field("title", &self.title)
            .field("is_root", &self.is_root)
            .field("parent_id", &self.parent_id)
            .field("fork_depth", &self.fork_depth)
            .finish_non_exhaustive()
    }
}

impl ConversationSession {
    pub fn from_descriptor(
        descriptor: SessionDescriptor,
        gateway: Arc<dyn Gateway>,
        events: flume::Sender<EngineEvent>,
        tuning: PollTuning,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: descriptor.id,
            scenario_id: descriptor.scenario_id,
            title: descriptor.title,
            is_root: descriptor.is_root,
            parent_id: descriptor.parent_id,
            fork_depth: descriptor.fork_depth,
            state: Arc::new(RwLock::new(SessionState {
                messages: descriptor.messages,
                polling: PollingState::Idle,
                last_error: None,
                has_been_forked: descriptor.has_been_forked,
            })),
            gateway,
            events,
            tuning,
            scope: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scenario_id(&self) -> &str {
        &self.scenario_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn fork_depth(&self) -> u32 {
        self.fork_depth
    }

    /// Snapshot of the message log in append order.
    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }

    pub async fn polling_state(&self) -> PollingState {
        self.state.read().await.polling
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.read().await.last_error.clone()
    }

    pub async fn has_been_forked(&self) -> bool {
        self.state.read().await.has_been_forked
    }

    /// Cancels any outstanding poll timers. Called when the consumer discards
    /// the session; stray cycles stop at their next suspension point.
    pub fn close(&self) {
        self.scope.cancel();
    }

    /// Submits a user message and starts polling for the reply.
    ///
    /// The user message is appended optimistically before the network call
    /// and is never rolled back: a delivery failure does not invalidate the
    /// user's intent, and resubmission stays available (the in-flight guard
    /// only blocks while a reply is actually pending).
    pub async fn send_message(self: &Arc<Self>, content: &str) -> Result<(), EngineError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(EngineError::InvalidInput(
                "message content must not be empty".into(),
            ));
        }

        {
            let mut state = self.state.write().await;
            if state.polling == PollingState::Polling {
                return Err(EngineError::SubmissionInFlight);
            }

            let message = Message::local(&self.id, MessageRole::User, trimmed);
            state.messages.push(message.clone());
            state.polling = PollingState::Polling;
            state.last_error = None;

            self.emit(EngineEvent::MessageAppended {
                conversation_id: self.id.clone(),
                message,
            });
            self.emit(EngineEvent::PollingStateChanged {
                conversation_id: self.id.clone(),
                state: PollingState::Polling,
            });
        }

        match self.gateway.submit_message(&self.id, trimmed).await {
            Ok(()) => {
                ResponsePoller::start(self.clone()).await;
                Ok(())
            }
            Err(error) => {
                tracing::warn!(
                    "Message submission failed for conversation {}: {}",
                    self.id,
                    error
                );
                let mut state = self.state.write().await;
                state.polling = PollingState::Error;
                state.last_error = Some(error.to_string());
                self.emit(EngineEvent::PollingStateChanged {
                    conversation_id: self.id.clone(),
                    state: PollingState::Error,
                });
                self.emit(EngineEvent::PollingFailed {
                    conversation_id: self.id.clone(),
                    reason: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// User-triggered recovery after transport exhaustion: resets the retry
    /// budget and re-enters the poll loop against the existing placeholder.
    pub async fn retry_polling(self: &Arc<Self>) -> Result<(), EngineError> {
        {
            let mut state = self.state.write().await;
            match state.polling {
                PollingState::Polling => return Err(EngineError::SubmissionInFlight),
                PollingState::Idle => {
                    return Err(EngineError::InvalidInput(
                        "no failed response to retry".into(),
                    ))
                }
                PollingState::Error => {}
            }

            let has_placeholder = state
                .messages
                .last()
                .map(|message| message.role == MessageRole::Assistant)
                .unwrap_or(false);
            if !has_placeholder {
                // The error came from submission, not polling; the caller
                // should resubmit via send_message instead.
                return Err(EngineError::InvalidInput(
                    "no pending reply to poll for; resubmit the message".into(),
                ));
            }

            state.polling = PollingState::Polling;
            state.last_error = None;
        }

        self.emit(EngineEvent::PollingStateChanged {
            conversation_id: self.id.clone(),
            state: PollingState::Polling,
        });
        ResponsePoller::resume(self.clone());
        Ok(())
    }

    /// Fork bookkeeping: false -> true at most once, applied only after the
    /// fork request resolved successfully.
    pub(crate) async fn mark_forked(&self) -> bool {
        let mut state = self.state.write().await;
        if state.has_been_forked {
            return false;
        }
        state.has_been_forked = true;
        true
    }

    pub(crate) fn state(&self) -> &Arc<RwLock<SessionState>> {
        &self.state
    }

    pub(crate) fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    pub(crate) fn tuning(&self) -> PollTuning {
        self.tuning
    }

    pub(crate) fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}
