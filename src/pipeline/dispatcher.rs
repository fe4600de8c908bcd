//! Per-message orchestration: dedup, classify, fetch, deliver, record, clean up.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::classifier::{Classification, MediaUrl, classify};
use crate::ledger::{Ledger, NewDownload};
use crate::pipeline::dedup::DedupCache;
use crate::pipeline::delivery::{DeliveryOutcome, DeliveryStrategist};
use crate::pipeline::fetcher::{Fetch, FetchError, Media};
use crate::pipeline::webhook::InboundEvent;
use crate::whatsapp::{GatewayError, Messenger};

pub const HELP_TEXT: &str = "👋 Welcome to the WhatsApp video downloader!\n\n\
Send me a YouTube or Facebook video link and I'll send the video back.\n\n\
Supported:\n\
• YouTube (youtube.com, youtu.be)\n\
• Facebook (facebook.com, fb.watch, share links)\n\n\
Examples:\n\
https://www.youtube.com/watch?v=...\n\
https://youtu.be/...\n\
https://www.facebook.com/...";

pub const UNSUPPORTED_TEXT: &str = "❌ Please send a valid YouTube or Facebook video URL";

pub const PROGRESS_TEXT: &str = "📥 Downloading video...";

pub const CHECKPOINT_TEXT: &str = "❌ Facebook security checkpoint detected. This video requires authentication.\n\n\
Please try:\n\
• Making sure the video is public\n\
• Using a direct video link\n\
• Checking if the video is still available";

pub const GENERIC_ERROR_TEXT: &str = "❌ Something went wrong while processing your request. Please try again later.";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to reply: {0}")]
    Reply(#[from] GatewayError),
}

/// User-facing text for a failed fetch.
pub fn fetch_failure_text(error: &FetchError) -> String {
    match error {
        FetchError::Checkpoint => CHECKPOINT_TEXT.to_string(),
        other => format!("❌ Could not download video: {other}"),
    }
}

pub struct Dispatcher {
    dedup: DedupCache,
    fetcher: Arc<dyn Fetch>,
    messenger: Arc<dyn Messenger>,
    strategist: DeliveryStrategist,
    ledger: Ledger,
    threshold_mb: u64,
}

impl Dispatcher {
    pub fn new(
        dedup: DedupCache,
        fetcher: Arc<dyn Fetch>,
        messenger: Arc<dyn Messenger>,
        strategist: DeliveryStrategist,
        ledger: Ledger,
        threshold_mb: u64,
    ) -> Self {
        Self {
            dedup,
            fetcher,
            messenger,
            strategist,
            ledger,
            threshold_mb,
        }
    }

    /// Dedup gate. Events without an id are always admitted.
    pub fn admit(&self, event: &InboundEvent, now: Instant) -> bool {
        if event.message_id.is_empty() {
            return true;
        }
        if !self.dedup.should_process(&event.message_id, now) {
            debug!("Duplicate message {} ignored", event.message_id);
            return false;
        }
        self.dedup.sweep(now);
        true
    }

    /// Admit and process. Returns false for duplicates.
    pub async fn handle(&self, event: InboundEvent) -> bool {
        if !self.admit(&event, Instant::now()) {
            return false;
        }
        self.process(event).await;
        true
    }

    /// Run the pipeline for an admitted event. Never fails: errors and panics end here.
    pub async fn process(&self, event: InboundEvent) {
        let chat_id = event.chat_id.clone();
        let message_id = event.message_id.clone();

        let failure = match AssertUnwindSafe(self.run(&event)).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "panic while processing message".to_string(),
        };

        error!("❌ Message {} from {} failed: {}", message_id, chat_id, failure);
        if let Err(e) = self.messenger.send_text(&chat_id, GENERIC_ERROR_TEXT).await {
            warn!("Could not report failure to {}: {e}", chat_id);
        }
    }

    async fn run(&self, event: &InboundEvent) -> Result<(), DispatchError> {
        match classify(&event.body_text) {
            Classification::Help => {
                info!("💬 Help requested by {}", event.chat_id);
                self.reply(&event.chat_id, HELP_TEXT).await
            }
            Classification::Unsupported => {
                info!("🚫 Unsupported link from {}", event.chat_id);
                self.reply(&event.chat_id, UNSUPPORTED_TEXT).await
            }
            Classification::Valid(media_url) => self.fetch_and_deliver(event, media_url).await,
        }
    }

    async fn reply(&self, chat_id: &str, text: &str) -> Result<(), DispatchError> {
        self.messenger.send_text(chat_id, text).await?;
        Ok(())
    }

    async fn fetch_and_deliver(&self, event: &InboundEvent, media_url: MediaUrl) -> Result<(), DispatchError> {
        info!("🎬 {} requested {} ({})", event.chat_id, media_url.url, media_url.provider.name());

        if let Err(e) = self.messenger.send_text(&event.chat_id, PROGRESS_TEXT).await {
            warn!("Failed to send progress notice: {e}");
        }

        let media = match self.fetcher.fetch(&media_url.url).await {
            Ok(media) => media,
            Err(e) => {
                warn!("Fetch of {} failed: {e}", media_url.url);
                return self.reply(&event.chat_id, &fetch_failure_text(&e)).await;
            }
        };

        let download_id = self.record(&event.chat_id, &media_url.url, &media).await;

        let outcome = self.strategist.deliver(&event.chat_id, &media, self.threshold_mb).await;
        if outcome.is_total_failure() {
            warn!("Delivery of {:?} failed on both legs", media.local_path);
        }

        let replied = self.reply(&event.chat_id, &outcome.message).await;
        self.clean_up(&media, &outcome, download_id).await;
        replied
    }

    /// Ledger failures are logged and never block delivery.
    async fn record(&self, chat_id: &str, url: &str, media: &Media) -> Option<i64> {
        let user_id = match self.ledger.get_or_create_user(chat_id).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Ledger: could not resolve user {}: {e}", chat_id);
                return None;
            }
        };
        let download = NewDownload {
            user_id,
            source_url: url.to_string(),
            title: media.title.clone(),
            size_mb: media.size_mb(),
            file_path: Some(media.local_path.to_string_lossy().into_owned()),
        };
        match self.ledger.record_download(download).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Ledger: could not record download for {}: {e}", chat_id);
                None
            }
        }
    }

    /// The local copy is kept only when it went out inline; the sweeper reclaims it later.
    async fn clean_up(&self, media: &Media, outcome: &DeliveryOutcome, download_id: Option<i64>) {
        let removed = if outcome.local_removed {
            true
        } else if outcome.inline_sent {
            debug!("Keeping {:?} until retention expires", media.local_path);
            false
        } else {
            match tokio::fs::remove_file(&media.local_path).await {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
                Err(e) => {
                    warn!("Failed to remove {:?}: {e}", media.local_path);
                    false
                }
            }
        };

        let Some(id) = download_id.filter(|_| removed) else {
            return;
        };
        if let Err(e) = self.ledger.mark_deleted(id).await {
            warn!("Ledger: could not mark download {} deleted: {e}", id);
        }
    }
}
