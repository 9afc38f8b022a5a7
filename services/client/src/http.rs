//! `PacoApi` over HTTP.

use async_trait::async_trait;
use paco_core::api::{
    AccessToken, ApiError, DisclaimerAcknowledgment, DisclaimerRequest, HistoryPage,
    HistoryRequest, PacoApi, ResearchIdRequest, ResearchIdValidation, SaveMessageAck,
    SaveMessageRequest,
};
use reqwest::Client;
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct HttpPacoApi {
    client: Client,
    base_url: String,
}

impl HttpPacoApi {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post<B, R>(&self, path: &str, body: &B, token: Option<&str>) -> Result<R, ApiError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = self.url(path);
        debug!(%url, "POST");
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                detail: error_detail(&body)
                    .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string()),
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Pulls the human-readable reason out of an error body. The backend answers
/// with `{"detail": "..."}`, or a list of field errors for bad requests.
fn error_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => {
            let body = body.trim();
            return (!body.is_empty()).then(|| body.to_string());
        }
    };
    match value.get("detail")? {
        serde_json::Value::String(detail) => Some(detail.clone()),
        serde_json::Value::Array(items) => {
            let messages: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                .collect();
            (!messages.is_empty()).then(|| messages.join("; "))
        }
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl PacoApi for HttpPacoApi {
    async fn validate_research_id(
        &self,
        research_id: &str,
    ) -> Result<ResearchIdValidation, ApiError> {
        let body = ResearchIdRequest {
            research_id: research_id.to_string(),
        };
        self.post("auth/validate-research-id", &body, None).await
    }

    async fn acknowledge_disclaimer(
        &self,
        research_id: &str,
    ) -> Result<DisclaimerAcknowledgment, ApiError> {
        let body = DisclaimerRequest {
            research_id: research_id.to_string(),
            acknowledged: true,
        };
        self.post("auth/acknowledge-disclaimer", &body, None).await
    }

    async fn login(&self, research_id: &str) -> Result<AccessToken, ApiError> {
        let body = ResearchIdRequest {
            research_id: research_id.to_string(),
        };
        self.post("auth/login", &body, None).await
    }

    async fn get_history(
        &self,
        token: &str,
        request: HistoryRequest,
    ) -> Result<HistoryPage, ApiError> {
        self.post("chat/history", &request, Some(token)).await
    }

    async fn save_message(
        &self,
        token: &str,
        request: SaveMessageRequest,
    ) -> Result<SaveMessageAck, ApiError> {
        self.post("chat/save-message", &request, Some(token)).await
    }
}
