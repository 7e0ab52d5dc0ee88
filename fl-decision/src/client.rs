use crate::error::{DecisionError, Result};
use crate::types::{Decision, DecisionContext};
use async_trait::async_trait;

/// Opaque decision engine: conversation context plus the customer's
/// message in, intent and reply out.
#[async_trait]
pub trait DecisionEngine: Send + Sync {
    async fn decide(&self, context: &DecisionContext, message: &str) -> Result<Decision>;
}

#[derive(Clone)]
pub struct DecisionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl DecisionClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(DecisionError::InvalidInput(
                "decision engine base_url is required".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(ToOwned::to_owned);
        self
    }
}

#[async_trait]
impl DecisionEngine for DecisionClient {
    #[tracing::instrument(level = "info", skip_all)]
    async fn decide(&self, context: &DecisionContext, message: &str) -> Result<Decision> {
        let message = message.trim();
        if message.is_empty() {
            return Err(DecisionError::InvalidInput(
                "message text is empty".to_string(),
            ));
        }

        let payload = serde_json::json!({
            "context": context,
            "message": message,
        });
        let mut request = self
            .http
            .post(format!("{}/v1/decide", self.base_url))
            .json(&payload);
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(DecisionError::Http(format!(
                "decide failed: status={status} body={body}"
            )));
        }

        let decision: Decision = serde_json::from_str(&body)?;
        if decision.reply_text.trim().is_empty() {
            return Err(DecisionError::ResponseFormat(
                "decision carried an empty reply_text".to_string(),
            ));
        }
        Ok(decision)
    }
}
