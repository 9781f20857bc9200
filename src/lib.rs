//! Fabler: the conversation and optimistic-synchronization engine behind an
//! AI character chat frontend.
//!
//! The backend is asynchronous and unreliable: a submitted message has no
//! synchronous reply, so the engine polls for completion with bounded
//! retry/backoff, and every social action (like, follow, fork) is applied
//! optimistically and reconciled or rolled back against the server's answer.
//! Rendering, routing, validation UI, and credential storage are the host
//! application's problem; it injects an [`ActorIdentity`], consumes
//! [`EngineEvent`]s from the injected channel, and renders whatever state the
//! engine settles on.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod fork;
pub mod poller;
pub mod session;
pub mod social;

pub use api::{ActorIdentity, Gateway, HttpGateway, PollResponse, PollStatus, SessionDescriptor};
pub use config::EngineConfig;
pub use error::EngineError;
pub use events::{event_channel, EngagementTarget, EngineEvent};
pub use fork::{fork_seed, ForkCoordinator, FORK_SEED_LEN};
pub use poller::{PollTuning, CONNECTION_LOST_TEXT, REPLY_FAILED_TEXT};
pub use session::{ConversationSession, Message, MessageRole, PollingState};
pub use social::{
    follow_toggle, like_toggle, EngagementState, FollowRelation, LikeRelation,
    OptimisticActionState, OptimisticToggle, RemoteToggle,
};
