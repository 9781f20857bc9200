use crate::api::SessionDescriptor;
use crate::session::{Message, PollingState};
use crate::social::EngagementState;

/// What a like/follow control is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngagementTarget {
    ConversationLike { conversation_id: String },
    UserFollow { user_id: String },
}

/// State-change notifications the engine emits for rendering collaborators.
///
/// Settled engagement and fork events always carry server-confirmed values;
/// the only speculative payload is an `EngagementChanged` with
/// `in_flight: true`.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    MessageAppended {
        conversation_id: String,
        message: Message,
    },
    /// Progressive reveal: the trailing assistant placeholder's content
    /// was overwritten while polling.
    AssistantContentUpdated {
        conversation_id: String,
        message_id: String,
        content: String,
    },
    /// The assistant reply reached its terminal content.
    MessageCompleted {
        conversation_id: String,
        message: Message,
    },
    PollingStateChanged {
        conversation_id: String,
        state: PollingState,
    },
    PollingFailed {
        conversation_id: String,
        reason: String,
    },
    Forked {
        parent_id: String,
        descriptor: SessionDescriptor,
    },
    EngagementChanged {
        target: EngagementTarget,
        in_flight: bool,
        state: EngagementState,
    },
}

/// Build the engine -> UI event bus. The sender side is injected into every
/// engine component at construction; the receiver belongs to the consumer.
pub fn event_channel() -> (flume::Sender<EngineEvent>, flume::Receiver<EngineEvent>) {
    flume::unbounded()
}
