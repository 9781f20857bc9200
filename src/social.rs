use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::api::Gateway;
use crate::error::EngineError;
use crate::events::{EngagementTarget, EngineEvent};

/// A boolean relationship with its shared counter: liked + like count, or
/// following + follower count. The counter is server-owned; other actors
/// mutate it concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngagementState {
    pub active: bool,
    pub count: i64,
    /// Follow-specific: whether the relationship is reciprocal. Always
    /// `None` for likes.
    pub mutual: Option<bool>,
}

impl EngagementState {
    pub fn new(active: bool, count: i64) -> Self {
        Self {
            active,
            count,
            mutual: None,
        }
    }
}

/// Per-control state. `committed` is only ever replaced by a server-returned
/// value, which is what makes rollback exact: dropping `pending` restores the
/// pre-action state bit for bit.
#[derive(Debug, Clone, Copy)]
pub struct OptimisticActionState {
    pub committed: EngagementState,
    pub pending: Option<EngagementState>,
    pub in_flight: bool,
}

impl OptimisticActionState {
    /// What the UI should render right now: the optimistic projection while
    /// a request is in flight, the committed value otherwise.
    pub fn displayed(&self) -> EngagementState {
        self.pending.unwrap_or(self.committed)
    }
}

/// The remote half of a toggle: push the desired boolean, get back the
/// authoritative state.
#[async_trait]
pub trait RemoteToggle: Send + Sync {
    async fn push(&self, desired: bool) -> Result<EngagementState, EngineError>;
}

/// Optimistic toggle-with-counter: publish the projected state before the
/// network call, then reconcile with the server's answer or roll back.
///
/// Concurrent invocations are not blocked here (the UI is expected to disable
/// the control), but resolutions are sequenced by request-issue order: a slow
/// early response can never clobber the state owned by a newer request.
pub struct OptimisticToggle<R> {
    remote: R,
    target: EngagementTarget,
    state: Arc<RwLock<OptimisticActionState>>,
    issued: AtomicU64,
    events: flume::Sender<EngineEvent>,
}

impl<R: RemoteToggle> OptimisticToggle<R> {
    pub fn new(
        remote: R,
        target: EngagementTarget,
        initial: EngagementState,
        events: flume::Sender<EngineEvent>,
    ) -> Self {
        Self {
            remote,
            target,
            state: Arc::new(RwLock::new(OptimisticActionState {
                committed: initial,
                pending: None,
                in_flight: false,
            })),
            issued: AtomicU64::new(0),
            events,
        }
    }

    pub async fn state(&self) -> OptimisticActionState {
        *self.state.read().await
    }

    /// Applies the toggle toward `desired`. Returns the settled state this
    /// particular request resolved to; the control's displayed state may
    /// already belong to a newer request by then.
    ///
    /// The projection is computed from the currently displayed state, not the
    /// committed one, so a double-toggle while the first request is in flight
    /// steps the visible counter back to where it started instead of
    /// undershooting it until reconciliation.
    pub async fn apply(&self, desired: bool) -> Result<EngagementState, EngineError> {
        let seq = self.issued.fetch_add(1, Ordering::SeqCst) + 1;

        let projected = {
            let mut state = self.state.write().await;
            let base = state.displayed();
            let projected = EngagementState {
                active: desired,
                count: base.count + if desired { 1 } else { -1 },
                mutual: base.mutual,
            };
            state.pending = Some(projected);
            state.in_flight = true;
            projected
        };
        // Observers see the projection before the request leaves: perceived
        // latency is zero.
        self.emit(true, projected);

        let result = self.remote.push(desired).await;

        let mut state = self.state.write().await;
        if seq != self.issued.load(Ordering::SeqCst) {
            tracing::debug!(
                "Discarding stale resolution for {:?} (request {} superseded)",
                self.target,
                seq
            );
            return result;
        }

        match result {
            Ok(server) => {
                // Adopt the server's counter, not our arithmetic; other
                // actors may have raced us.
                state.committed = server;
                state.pending = None;
                state.in_flight = false;
                drop(state);
                self.emit(false, server);
                Ok(server)
            }
            Err(error) => {
                let restored = state.committed;
                state.pending = None;
                state.in_flight = false;
                drop(state);
                tracing::warn!(
                    "Optimistic action on {:?} failed, rolled back: {}",
                    self.target,
                    error
                );
                self.emit(false, restored);
                Err(error)
            }
        }
    }

    fn emit(&self, in_flight: bool, state: EngagementState) {
        let _ = self.events.send(EngineEvent::EngagementChanged {
            target: self.target.clone(),
            in_flight,
            state,
        });
    }
}

/// Like/unlike against a conversation's shared like counter.
pub struct LikeRelation {
    gateway: Arc<dyn Gateway>,
    conversation_id: String,
}

#[async_trait]
impl RemoteToggle for LikeRelation {
    async fn push(&self, desired: bool) -> Result<EngagementState, EngineError> {
        self.gateway.set_like(&self.conversation_id, desired).await
    }
}

/// Follow/unfollow against a user's shared follower counter.
pub struct FollowRelation {
    gateway: Arc<dyn Gateway>,
    user_id: String,
}

#[async_trait]
impl RemoteToggle for FollowRelation {
    async fn push(&self, desired: bool) -> Result<EngagementState, EngineError> {
        self.gateway.set_follow(&self.user_id, desired).await
    }
}

pub fn like_toggle(
    gateway: Arc<dyn Gateway>,
    conversation_id: &str,
    initial: EngagementState,
    events: flume::Sender<EngineEvent>,
) -> Result<OptimisticToggle<LikeRelation>, EngineError> {
    if conversation_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("conversation id is empty".into()));
    }
    Ok(OptimisticToggle::new(
        LikeRelation {
            gateway,
            conversation_id: conversation_id.to_string(),
        },
        EngagementTarget::ConversationLike {
            conversation_id: conversation_id.to_string(),
        },
        initial,
        events,
    ))
}

/// `actor_id` is the signed-in user; following yourself is rejected before
/// any network call.
pub fn follow_toggle(
    gateway: Arc<dyn Gateway>,
    user_id: &str,
    actor_id: &str,
    initial: EngagementState,
    events: flume::Sender<EngineEvent>,
) -> Result<OptimisticToggle<FollowRelation>, EngineError> {
    if user_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("user id is empty".into()));
    }
    if user_id == actor_id {
        return Err(EngineError::InvalidInput("cannot follow yourself".into()));
    }
    Ok(OptimisticToggle::new(
        FollowRelation {
            gateway,
            user_id: user_id.to_string(),
        },
        EngagementTarget::UserFollow {
            user_id: user_id.to_string(),
        },
        initial,
        events,
    ))
}
