//! Inline vs. cloud-link delivery.
//!
//! Small files go both ways: inline for convenience and to the cloud for a
//! durable link. Files at or above the threshold skip the inline attempt and
//! their local copy is dropped as soon as the upload lands.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cloud::CloudStore;
use crate::pipeline::fetcher::Media;
use crate::whatsapp::Messenger;

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub inline_sent: bool,
    pub cloud_url: Option<String>,
    /// The local file was deleted here after a large-file upload.
    pub local_removed: bool,
    /// The one chat message that explains what happened.
    pub message: String,
}

impl DeliveryOutcome {
    pub fn is_total_failure(&self) -> bool {
        !self.inline_sent && self.cloud_url.is_none()
    }
}

pub struct DeliveryStrategist {
    messenger: Arc<dyn Messenger>,
    cloud: Arc<dyn CloudStore>,
    link_ttl_hours: u64,
}

impl DeliveryStrategist {
    pub fn new(messenger: Arc<dyn Messenger>, cloud: Arc<dyn CloudStore>, link_ttl_hours: u64) -> Self {
        Self {
            messenger,
            cloud,
            link_ttl_hours,
        }
    }

    pub async fn deliver(&self, chat_id: &str, media: &Media, threshold_mb: u64) -> DeliveryOutcome {
        let size_mb = media.size_mb();
        let inline_attempted = size_mb < threshold_mb as f64;

        let inline_sent = if inline_attempted {
            match self.messenger.send_media(chat_id, &media.local_path).await {
                Ok(()) => {
                    info!("✅ Sent {:.2} MB inline to {}", size_mb, chat_id);
                    true
                }
                Err(e) => {
                    warn!("Inline send of {:.2} MB failed: {e}", size_mb);
                    false
                }
            }
        } else {
            info!("📦 {:.2} MB is over the {} MB inline limit, cloud only", size_mb, threshold_mb);
            false
        };

        let cloud_url = match self.cloud.upload(&media.local_path).await {
            Ok(asset) => Some(asset.url),
            Err(e) => {
                warn!("Cloud upload failed: {e}");
                None
            }
        };

        let mut local_removed = false;
        if !inline_attempted && cloud_url.is_some() {
            match tokio::fs::remove_file(&media.local_path).await {
                Ok(()) => local_removed = true,
                Err(e) => warn!("Failed to remove {:?} after upload: {e}", media.local_path),
            }
        }

        let message = compose_message(
            inline_attempted,
            inline_sent,
            cloud_url.as_deref(),
            media,
            self.link_ttl_hours,
        );

        DeliveryOutcome {
            inline_sent,
            cloud_url,
            local_removed,
            message,
        }
    }
}

fn compose_message(
    inline_attempted: bool,
    inline_sent: bool,
    cloud_url: Option<&str>,
    media: &Media,
    link_ttl_hours: u64,
) -> String {
    let size_mb = media.size_mb();
    let heading = media
        .title
        .as_deref()
        .map(|t| format!("🎬 {t}\n\n"))
        .unwrap_or_default();

    match (inline_sent, cloud_url) {
        (true, Some(url)) => format!(
            "{heading}✅ Video sent to chat!\n\n☁️ Cloud link ({size_mb:.2} MB):\n{url}\n\n⏳ Link expires in {link_ttl_hours} hours."
        ),
        (true, None) => format!(
            "{heading}✅ Video sent to chat! (Cloud upload failed, no shareable link available)"
        ),
        (false, Some(url)) => {
            let note = if inline_attempted {
                "Video could not be sent directly in chat."
            } else {
                "Video was too large to send directly in chat."
            };
            format!(
                "{heading}☁️ Cloud link ({size_mb:.2} MB):\n{url}\n\n⏳ Link expires in {link_ttl_hours} hours.\n\nNote: {note}"
            )
        }
        (false, None) => format!(
            "❌ Error: Could not deliver the video ({size_mb:.2} MB). Please try again later."
        ),
    }
}
