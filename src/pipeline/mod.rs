//! Message pipeline - turns inbound chat messages into delivered videos.

pub mod dedup;
pub mod delivery;
pub mod dispatcher;
pub mod fetcher;
pub mod share;
pub mod sweeper;
pub mod webhook;
pub mod ytdlp;


pub use dedup::DedupCache;
pub use delivery::{DeliveryOutcome, DeliveryStrategist};
pub use dispatcher::Dispatcher;
pub use fetcher::{Fetch, FetchError, Media, MediaFetcher, MediaResult};
pub use share::ShareResolver;
pub use sweeper::RetentionSweeper;
pub use webhook::{InboundEvent, WebhookPayload};
pub use ytdlp::YtDlp;
