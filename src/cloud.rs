//! Cloudinary object storage for shareable video links.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CloudinaryCredentials;

const API_BASE: &str = "https://api.cloudinary.com/v1_1";

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("cloud storage is not configured")]
    NotConfigured,
    #[error("cloud request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cloud returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("cloud rejected the request: {0}")]
    Rejected(String),
    #[error("failed to read upload file: {0}")]
    Io(#[from] std::io::Error),
}

/// A freshly uploaded object.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedAsset {
    pub url: String,
    pub id: String,
}

/// An object already in the store, as seen by the sweeper.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAsset {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait CloudStore: Send + Sync {
    async fn upload(&self, path: &Path) -> Result<UploadedAsset, CloudError>;
    async fn list_objects(&self, prefix: &str) -> Result<Vec<RemoteAsset>, CloudError>;
    async fn delete(&self, id: &str) -> Result<(), CloudError>;
}

#[derive(Deserialize)]
struct UploadResponse {
    secure_url: String,
    public_id: String,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    resources: Vec<Resource>,
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct Resource {
    public_id: String,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct DestroyResponse {
    result: String,
}

/// Cloudinary API client. Without credentials every call fails with `NotConfigured`.
pub struct CloudinaryClient {
    credentials: Option<CloudinaryCredentials>,
    folder: String,
    api_base: String,
    http: reqwest::Client,
}

impl CloudinaryClient {
    pub fn new(credentials: Option<CloudinaryCredentials>, folder: String) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        if credentials.is_none() {
            warn!("☁️ Cloudinary not configured, uploads will be skipped");
        }
        Ok(Self {
            credentials,
            folder,
            api_base: API_BASE.to_string(),
            http,
        })
    }

    fn credentials(&self) -> Result<&CloudinaryCredentials, CloudError> {
        self.credentials.as_ref().ok_or(CloudError::NotConfigured)
    }

    fn endpoint(&self, creds: &CloudinaryCredentials, path: &str) -> String {
        format!("{}/{}/{}", self.api_base, creds.cloud_name, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, CloudError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CloudError::Status { status: status.as_u16(), body })
    }
}

/// Sign request parameters: sorted `key=value` pairs joined by `&`, secret appended, SHA-256 hex.
pub fn sign_params(params: &[(&str, String)], api_secret: &str) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let to_sign = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let mut hasher = Sha256::new();
    hasher.update(to_sign.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl CloudStore for CloudinaryClient {
    async fn upload(&self, path: &Path) -> Result<UploadedAsset, CloudError> {
        let creds = self.credentials()?;
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video.mp4".to_string());
        info!("☁️ Uploading {} ({:.2} MB)", filename, bytes.len() as f64 / 1_048_576.0);

        let timestamp = Utc::now().timestamp().to_string();
        let params = [
            ("folder", self.folder.clone()),
            ("overwrite", "false".to_string()),
            ("timestamp", timestamp.clone()),
        ];
        let signature = sign_params(&params, &creds.api_secret);

        let file_part = Part::bytes(bytes)
            .file_name(filename)
            .mime_str("video/mp4")?;
        let form = Form::new()
            .part("file", file_part)
            .text("api_key", creds.api_key.clone())
            .text("folder", self.folder.clone())
            .text("overwrite", "false")
            .text("timestamp", timestamp)
            .text("signature", signature)
            .text("signature_algorithm", "sha256");

        let response = self
            .http
            .post(self.endpoint(creds, "video/upload"))
            .timeout(Duration::from_secs(300))
            .multipart(form)
            .send()
            .await?;
        let uploaded: UploadResponse = Self::check(response).await?.json().await?;
        info!("✅ Uploaded to {}", uploaded.secure_url);

        Ok(UploadedAsset {
            url: uploaded.secure_url,
            id: uploaded.public_id,
        })
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<RemoteAsset>, CloudError> {
        let creds = self.credentials()?;
        let mut assets = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![
                ("type", "upload".to_string()),
                ("prefix", prefix.to_string()),
                ("max_results", "500".to_string()),
            ];
            if let Some(c) = &cursor {
                query.push(("next_cursor", c.clone()));
            }

            let response = self
                .http
                .get(self.endpoint(creds, "resources/video"))
                .basic_auth(&creds.api_key, Some(&creds.api_secret))
                .query(&query)
                .send()
                .await?;
            let page: ListResponse = Self::check(response).await?.json().await?;

            assets.extend(page.resources.into_iter().map(|r| RemoteAsset {
                id: r.public_id,
                created_at: r.created_at,
            }));

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!("Listed {} remote assets under {}", assets.len(), prefix);
        Ok(assets)
    }

    async fn delete(&self, id: &str) -> Result<(), CloudError> {
        let creds = self.credentials()?;
        let timestamp = Utc::now().timestamp().to_string();
        let params = [("public_id", id.to_string()), ("timestamp", timestamp.clone())];
        let signature = sign_params(&params, &creds.api_secret);

        let form = [
            ("public_id", id.to_string()),
            ("timestamp", timestamp),
            ("api_key", creds.api_key.clone()),
            ("signature", signature),
            ("signature_algorithm", "sha256".to_string()),
        ];
        let response = self
            .http
            .post(self.endpoint(creds, "video/destroy"))
            .form(&form)
            .send()
            .await?;
        let destroyed: DestroyResponse = Self::check(response).await?.json().await?;

        // "not found" means someone else already removed it
        match destroyed.result.as_str() {
            "ok" | "not found" => Ok(()),
            other => Err(CloudError::Rejected(other.to_string())),
        }
    }
}
