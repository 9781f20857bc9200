use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::session::Message;
use crate::social::EngagementState;

/// The signed-in user on whose behalf every request is made. Supplied by the
/// authentication collaborator; the engine only forwards it.
#[derive(Debug, Clone)]
pub struct ActorIdentity {
    pub user_id: String,
    pub token: Option<String>,
}

/// Lifecycle of a submitted message as reported by the poll endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    NotFound,
    /// Any status string this client does not recognize. Never silently
    /// ignored; the poller treats it like a transport anomaly.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub status: PollStatus,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Server-side description of a conversation session, returned by fork
/// creation and consumed when adopting an externally started conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub id: String,
    pub scenario_id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub is_root: bool,
    #[serde(default)]
    pub has_been_forked: bool,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub fork_depth: u32,
}

#[derive(Debug, Serialize)]
struct SubmitMessageRequest<'a> {
    content: &'a str,
    role: &'a str,
}

#[derive(Debug, Serialize)]
struct ForkRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LikeResponse {
    is_liked: bool,
    like_count: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FollowResponse {
    is_following: bool,
    #[serde(default)]
    is_mutual: Option<bool>,
    follower_count: i64,
}

/// Everything the engine needs from the backend. One implementation speaks
/// HTTP; tests substitute a scripted in-memory gateway.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn submit_message(&self, conversation_id: &str, content: &str)
        -> Result<(), EngineError>;

    async fn poll_response(&self, conversation_id: &str) -> Result<PollResponse, EngineError>;

    async fn fork_conversation(
        &self,
        conversation_id: &str,
        description: Option<&str>,
    ) -> Result<SessionDescriptor, EngineError>;

    /// `desired = true` likes, `false` unlikes. Returns the authoritative
    /// post-action state.
    async fn set_like(
        &self,
        conversation_id: &str,
        desired: bool,
    ) -> Result<EngagementState, EngineError>;

    /// `desired = true` follows, `false` unfollows.
    async fn set_follow(&self, user_id: &str, desired: bool)
        -> Result<EngagementState, EngineError>;
}

pub struct HttpGateway {
    http: reqwest::Client,
    base_url: String,
    identity: ActorIdentity,
}

impl HttpGateway {
    pub fn new(base_url: String, identity: ActorIdentity, request_timeout: Duration) -> Self {
        Self {
            http: build_http_client(request_timeout),
            base_url: normalize_base_url(&base_url),
            identity,
        }
    }

    pub fn from_config(config: &crate::config::EngineConfig) -> Self {
        Self::new(
            config.backend_url.clone(),
            ActorIdentity {
                user_id: config.actor_id.clone(),
                token: config.auth_token.clone(),
            },
            config.request_timeout(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self
            .http
            .request(method, url)
            .header("X-Actor-Id", &self.identity.user_id);
        if let Some(token) = self.identity.token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn submit_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<(), EngineError> {
        let response = self
            .request(
                Method::POST,
                &format!("/conversations/{}/messages", conversation_id),
            )
            .json(&SubmitMessageRequest {
                content,
                role: "user",
            })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn poll_response(&self, conversation_id: &str) -> Result<PollResponse, EngineError> {
        let response = self
            .request(
                Method::GET,
                &format!("/conversations/{}/messages/poll", conversation_id),
            )
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json::<PollResponse>().await?)
    }

    async fn fork_conversation(
        &self,
        conversation_id: &str,
        description: Option<&str>,
    ) -> Result<SessionDescriptor, EngineError> {
        let response = self
            .request(Method::POST, &format!("/conversations/{}/fork", conversation_id))
            .json(&ForkRequest { description })
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json::<SessionDescriptor>().await?)
    }

    async fn set_like(
        &self,
        conversation_id: &str,
        desired: bool,
    ) -> Result<EngagementState, EngineError> {
        let (method, action) = if desired {
            (Method::POST, "like")
        } else {
            (Method::DELETE, "unlike")
        };
        let response = self
            .request(method, &format!("/conversations/{}/{}", conversation_id, action))
            .send()
            .await?;
        let response = check_status(response).await?;
        let body = response.json::<LikeResponse>().await?;
        Ok(EngagementState::new(body.is_liked, body.like_count))
    }

    async fn set_follow(
        &self,
        user_id: &str,
        desired: bool,
    ) -> Result<EngagementState, EngineError> {
        let (method, action) = if desired {
            (Method::POST, "follow")
        } else {
            (Method::DELETE, "unfollow")
        };
        let response = self
            .request(method, &format!("/users/{}/{}", user_id, action))
            .send()
            .await?;
        let response = check_status(response).await?;
        let body = response.json::<FollowResponse>().await?;
        Ok(EngagementState {
            active: body.is_following,
            count: body.follower_count,
            mutual: body.is_mutual,
        })
    }
}

/// Requests bypass system proxy discovery unless `FABLER_ENABLE_SYSTEM_PROXY`
/// opts in; a misconfigured proxy environment otherwise breaks every poll.
fn build_http_client(timeout: Duration) -> reqwest::Client {
    let allow_system_proxy = std::env::var("FABLER_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let mut builder = reqwest::Client::builder().timeout(timeout);
    if !allow_system_proxy {
        builder = builder.no_proxy();
    }
    builder.build().unwrap_or_else(|error| {
        tracing::warn!(
            "Failed to build configured HTTP client ({}); falling back to defaults",
            error
        );
        reqwest::Client::new()
    })
}

/// Maps non-success responses onto the engine's failure taxonomy.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(map_error_status(status, &body))
}

fn map_error_status(status: StatusCode, body: &str) -> EngineError {
    let reason = error_reason(body, status);
    if status == StatusCode::CONFLICT {
        EngineError::Conflict(reason)
    } else if status.is_client_error() {
        EngineError::Rejected(reason)
    } else {
        EngineError::Transport(reason)
    }
}

/// Prefers the backend's `{"error": "..."}` field, falls back to the raw
/// body, then to the status line.
fn error_reason(body: &str, status: StatusCode) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(reason) = value.get("error").and_then(serde_json::Value::as_str) {
            return reason.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status)
    } else {
        trimmed.chars().take(500).collect()
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "http://127.0.0.1:8787".to_string()
    } else {
        trimmed.to_string()
    }
}
