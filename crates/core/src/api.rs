//! Collaborator API Contract
//!
//! Request/response types and the `PacoApi` trait for the backend's REST
//! surface: research-ID validation, disclaimer acknowledgment, login,
//! conversation history, and message persistence. The client crate provides
//! the HTTP implementation; tests substitute a mock.

use crate::message::{Message, Role, timestamp};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failures reported by any collaborator call.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("backend returned {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("could not decode response: {0}")]
    Decode(String),
}

#[derive(Serialize, Debug, Clone)]
pub struct ResearchIdRequest {
    pub research_id: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ResearchIdValidation {
    pub valid: bool,
    pub research_id: String,
    pub message: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct DisclaimerRequest {
    pub research_id: String,
    pub acknowledged: bool,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct DisclaimerAcknowledgment {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, deserialize_with = "timestamp::optional")]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub research_id: String,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub expires_at: DateTime<Utc>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl AccessToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct HistoryRequest {
    pub research_id: String,
    pub conversation_id: String,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Deserialize, Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub total: u64,
    pub research_id: String,
}

/// Which conversational platform produced a mirrored message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    #[serde(rename = "elevenlabs")]
    ElevenLabs,
    #[serde(rename = "openai")]
    OpenAi,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SaveMessageRequest {
    pub research_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub provider: Provider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevenlabs_conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevenlabs_message_id: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SaveMessageAck {
    pub success: bool,
    pub message_id: i64,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub timestamp: DateTime<Utc>,
}

/// The backend REST surface the chat client depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PacoApi: Send + Sync {
    async fn validate_research_id(&self, research_id: &str)
    -> Result<ResearchIdValidation, ApiError>;

    async fn acknowledge_disclaimer(
        &self,
        research_id: &str,
    ) -> Result<DisclaimerAcknowledgment, ApiError>;

    async fn login(&self, research_id: &str) -> Result<AccessToken, ApiError>;

    async fn get_history(
        &self,
        token: &str,
        request: HistoryRequest,
    ) -> Result<HistoryPage, ApiError>;

    async fn save_message(
        &self,
        token: &str,
        request: SaveMessageRequest,
    ) -> Result<SaveMessageAck, ApiError>;
}
