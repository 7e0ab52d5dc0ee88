use crate::traits::MessageGateway;
use crate::types::{GatewayEnvelope, MessageId};
use anyhow::{Result, anyhow};
use reqwest::Url;
use std::time::Duration;

/// HTTP client for a hosted messaging gateway.
///
/// The gateway multiplexes accounts behind named sessions; every call is
/// scoped to the session this client was built for.
#[derive(Clone)]
pub struct HttpGateway {
    http: reqwest::Client,
    gateway_id: String,
    base_url: String,
    session_id: String,
    api_token: Option<String>,
}

impl HttpGateway {
    pub fn new(base_url: &str, session_id: &str) -> Result<Self> {
        let base_url = normalize_gateway_base_url(base_url)?;
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(anyhow!("gateway session id is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            gateway_id: "chatwire".to_string(),
            base_url,
            session_id: session_id.to_string(),
            api_token: None,
        })
    }

    pub fn with_gateway_id(mut self, gateway_id: &str) -> Self {
        let gateway_id = gateway_id.trim();
        if !gateway_id.is_empty() {
            self.gateway_id = gateway_id.to_ascii_lowercase();
        }
        self
    }

    pub fn with_api_token(mut self, api_token: Option<String>) -> Self {
        self.api_token = api_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        Url::parse(&format!(
            "{}/api/v1/sessions/{}{}",
            self.base_url, self.session_id, path
        ))
        .map_err(|e| anyhow!("invalid gateway API URL path {path:?}: {e}"))
    }

    fn authorized_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait::async_trait]
impl MessageGateway for HttpGateway {
    fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    async fn fetch_new_messages(&self, limit: usize) -> Result<Vec<GatewayEnvelope>> {
        let url = self.api_url("/messages")?;
        let response = self
            .authorized_request(self.http.get(url))
            .query(&[("limit", limit.to_string())])
            .send()
            .await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "gateway fetch failed: status={} body={}",
                status,
                body
            ));
        }
        Ok(extract_fetch_payload(body))
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<()> {
        let to = to.trim();
        if to.is_empty() {
            return Err(anyhow!("recipient address is required"));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(anyhow!("message text is empty"));
        }

        let url = self.api_url("/send")?;
        let payload = serde_json::json!({
            "to": to,
            "text": text,
        });
        let response = self
            .authorized_request(self.http.post(url))
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "gateway send failed: status={} body={}",
                status,
                body
            ));
        }
        Ok(())
    }

    async fn mark_read(&self, chat_id: &str, message_ids: &[MessageId]) -> Result<()> {
        let chat_id = chat_id.trim();
        if chat_id.is_empty() {
            return Err(anyhow!("chat id is required"));
        }

        let url = self.api_url("/read")?;
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "message_ids": message_ids,
        });
        let response = self
            .authorized_request(self.http.post(url))
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "gateway mark-read failed: status={} body={}",
                status,
                body
            ));
        }
        Ok(())
    }
}

fn normalize_gateway_base_url(raw: &str) -> Result<String> {
    let normalized = raw.trim().trim_end_matches('/').to_string();
    if normalized.is_empty() {
        return Err(anyhow!("gateway base_url is required"));
    }
    let parsed =
        Url::parse(&normalized).map_err(|e| anyhow!("invalid gateway base_url: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(normalized),
        other => Err(anyhow!(
            "invalid gateway base_url scheme: {other} (expected http or https)"
        )),
    }
}

fn extract_fetch_payload(body: serde_json::Value) -> Vec<GatewayEnvelope> {
    match body {
        serde_json::Value::Array(values) => values
            .into_iter()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect(),
        serde_json::Value::Object(mut map) => {
            if let Some(messages) = map
                .remove("messages")
                .and_then(|value| value.as_array().cloned())
            {
                return messages
                    .into_iter()
                    .filter_map(|value| serde_json::from_value(value).ok())
                    .collect();
            }
            serde_json::from_value(serde_json::Value::Object(map))
                .ok()
                .into_iter()
                .collect()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::{extract_fetch_payload, normalize_gateway_base_url};

    #[test]
    fn normalize_gateway_base_url_requires_http_or_https() {
        assert_eq!(
            normalize_gateway_base_url("https://gateway.example.com/")
                .expect("https URL should normalize"),
            "https://gateway.example.com"
        );
        assert!(normalize_gateway_base_url("ftp://gateway.example.com").is_err());
        assert!(normalize_gateway_base_url("   ").is_err());
    }

    #[test]
    fn extract_fetch_payload_supports_array_and_messages_wrapper() {
        let array_payload = serde_json::json!([
            {
                "id": "m1",
                "from": "15551234567@c.gw",
                "body": "hello",
                "timestamp_ms": 100
            }
        ]);
        let wrapped_payload = serde_json::json!({
            "messages": [
                {
                    "id": "m2",
                    "from": "15559876543@c.gw",
                    "body": "world",
                    "timestamp_ms": 101
                }
            ]
        });

        let from_array = extract_fetch_payload(array_payload);
        let from_wrapper = extract_fetch_payload(wrapped_payload);
        assert_eq!(from_array.len(), 1);
        assert_eq!(from_wrapper.len(), 1);
        assert_eq!(from_array[0].id.as_deref(), Some("m1"));
        assert_eq!(from_wrapper[0].id.as_deref(), Some("m2"));
    }
}
