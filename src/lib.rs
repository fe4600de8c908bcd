//! WhatsApp video downloader: webhook in, video (or a cloud link) out.

pub mod classifier;
pub mod cloud;
pub mod config;
pub mod ledger;
pub mod pipeline;
pub mod server;
pub mod whatsapp;
