//! Core request and reply types shared by the orchestrator and the workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ── Conversation history ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// ── Generation request ──

/// A user message on its way to becoming a generation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default = "new_request_id")]
    pub request_id: String,
    pub personality: String,
    pub user_id: String,
    pub persona_id: String,
    #[serde(default)]
    pub channel_id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub auth_scope: String,
    pub content: String,
    /// Prior turns, oldest first. Loaded by the adapter; the core only filters them.
    #[serde(default)]
    pub history: Vec<ConversationMessage>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Canonical form of a personality name. Config layers, memory owners,
/// context epochs and request signatures all key on this.
pub fn personality_key(name: &str) -> String {
    name.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Sent,
    Succeeded,
    Failed,
    RateLimited,
    Retried,
}

impl RequestStatus {
    /// Terminal status a request ends in when it settles with `err`.
    pub fn from_error(err: &CoreError) -> Self {
        match err {
            CoreError::Blackout { .. } => RequestStatus::RateLimited,
            CoreError::Timeout { .. } => RequestStatus::Retried,
            _ => RequestStatus::Failed,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Sent => write!(f, "sent"),
            RequestStatus::Succeeded => write!(f, "succeeded"),
            RequestStatus::Failed => write!(f, "failed"),
            RequestStatus::RateLimited => write!(f, "rate_limited"),
            RequestStatus::Retried => write!(f, "retried"),
        }
    }
}

/// What the caller of the orchestrator gets back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationReply {
    pub request_id: String,
    pub job_id: String,
    pub status: RequestStatus,
    pub content: String,
    /// True when this caller joined an identical in-flight request.
    #[serde(default)]
    pub shared: bool,
}

/// Everything a worker needs to run one generation, carried as the job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationPayload {
    pub request_id: String,
    pub personality: String,
    pub user_id: String,
    pub channel_id: String,
    pub content: String,
    #[serde(default)]
    pub history: Vec<ConversationMessage>,
    /// Retrieved memory texts, best first.
    #[serde(default)]
    pub memories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Upper bound on image attachments the adapter may forward.
    #[serde(default)]
    pub max_images: u32,
    /// None lets the worker decide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_context: Option<bool>,
    #[serde(default)]
    pub show_thinking: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_from_json() {
        let req: GenerationRequest = serde_json::from_str(
            r#"{"personality":"Nova","user_id":"u1","persona_id":"p1",
                "conversation_id":"c1","content":"hello"}"#,
        )
        .unwrap();
        assert_eq!(req.personality, "Nova");
        assert!(req.history.is_empty());
        assert!(!req.request_id.is_empty());
        assert_eq!(req.auth_scope, "");
    }

    #[test]
    fn test_status_from_error() {
        let blackout = CoreError::Blackout {
            retry_after: std::time::Duration::from_secs(1),
        };
        assert_eq!(RequestStatus::from_error(&blackout), RequestStatus::RateLimited);
        let timeout = CoreError::Timeout { job_id: "j".into() };
        assert_eq!(RequestStatus::from_error(&timeout), RequestStatus::Retried);
        assert_eq!(RequestStatus::RateLimited.to_string(), "rate_limited");
    }

    #[test]
    fn test_payload_omits_unset_overrides() {
        let payload = GenerationPayload {
            request_id: "r1".into(),
            personality: "Nova".into(),
            user_id: "u1".into(),
            channel_id: "c1".into(),
            content: "hello".into(),
            history: Vec::new(),
            memories: vec!["likes tea".into()],
            model: None,
            vision_model: None,
            temperature: Some(0.5),
            top_p: None,
            max_tokens: None,
            max_images: 4,
            extended_context: Some(true),
            show_thinking: false,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("model").is_none());
        assert!(value.get("vision_model").is_none());
        assert_eq!(value["temperature"], 0.5);
        assert_eq!(value["extended_context"], true);
        let back: GenerationPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_personality_key_normalizes() {
        assert_eq!(personality_key("  Nova "), "nova");
        assert_eq!(personality_key("nova"), personality_key("NOVA"));
    }
}
