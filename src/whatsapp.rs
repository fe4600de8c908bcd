//! WhatsApp messaging through a WAHA (WhatsApp HTTP API) server.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gateway returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to read media file: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound side of the chat gateway.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), GatewayError>;
    /// Send a local video file inline.
    async fn send_media(&self, chat_id: &str, path: &Path) -> Result<(), GatewayError>;
    async fn is_reachable(&self) -> bool;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendTextRequest<'a> {
    chat_id: String,
    text: &'a str,
    session: &'a str,
}

#[derive(Serialize)]
struct FilePayload {
    mimetype: &'static str,
    filename: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendFileRequest<'a> {
    chat_id: String,
    file: FilePayload,
    session: &'a str,
}

/// WAHA API client.
pub struct WahaClient {
    base_url: String,
    session: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl WahaClient {
    pub fn new(base_url: String, session: String, api_key: Option<String>) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
            api_key,
            http,
        })
    }

    fn post(&self, endpoint: &str) -> reqwest::RequestBuilder {
        let request = self.http.post(format!("{}{}", self.base_url, endpoint));
        match &self.api_key {
            Some(key) => request.header("X-Api-Key", key),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<(), GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::Status { status: status.as_u16(), body })
    }
}

/// WAHA addresses personal chats as `<number>@c.us`.
pub fn normalize_chat_id(chat_id: &str) -> String {
    if chat_id.contains('@') {
        chat_id.to_string()
    } else {
        format!("{chat_id}@c.us")
    }
}

#[async_trait]
impl Messenger for WahaClient {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), GatewayError> {
        let request = SendTextRequest {
            chat_id: normalize_chat_id(chat_id),
            text,
            session: &self.session,
        };
        let response = self.post("/api/sendText").json(&request).send().await?;
        Self::check(response).await.inspect_err(|e| warn!("Failed to send text to {chat_id}: {e}"))?;
        debug!("Sent text to {}", chat_id);
        Ok(())
    }

    async fn send_media(&self, chat_id: &str, path: &Path) -> Result<(), GatewayError> {
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video.mp4".to_string());
        info!("📤 Sending {} ({} bytes) to {}", filename, bytes.len(), chat_id);

        let request = SendFileRequest {
            chat_id: normalize_chat_id(chat_id),
            file: FilePayload {
                mimetype: "video/mp4",
                filename,
                data: base64::engine::general_purpose::STANDARD.encode(&bytes),
            },
            session: &self.session,
        };
        let response = self.post("/api/sendFile").json(&request).send().await?;
        Self::check(response).await.inspect_err(|e| warn!("Failed to send file to {chat_id}: {e}"))
    }

    async fn is_reachable(&self) -> bool {
        let mut request = self
            .http
            .get(format!("{}/ping", self.base_url))
            .timeout(Duration::from_secs(5));
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("WAHA health check failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_chat_id() {
        assert_eq!(normalize_chat_id("15551234567"), "15551234567@c.us");
        assert_eq!(normalize_chat_id("15551234567@c.us"), "15551234567@c.us");
        assert_eq!(normalize_chat_id("123-456@g.us"), "123-456@g.us");
    }

    #[test]
    fn test_send_text_request_shape() {
        let request = SendTextRequest {
            chat_id: normalize_chat_id("1555"),
            text: "hi",
            session: "default",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json, serde_json::json!({"chatId": "1555@c.us", "text": "hi", "session": "default"}));
    }

    #[test]
    fn test_send_file_request_shape() {
        let request = SendFileRequest {
            chat_id: "1555@c.us".to_string(),
            file: FilePayload {
                mimetype: "video/mp4",
                filename: "clip.mp4".to_string(),
                data: "AAAA".to_string(),
            },
            session: "default",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["chatId"], "1555@c.us");
        assert_eq!(json["file"]["mimetype"], "video/mp4");
        assert_eq!(json["file"]["filename"], "clip.mp4");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = WahaClient::new("http://localhost:3000/".into(), "default".into(), None).unwrap();
        assert_eq!(client.base_url, "http://localhost:3000");
    }
}
