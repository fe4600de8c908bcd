//! Classifies inbound chat text into a supported media URL, a help request, or a rejection.

/// Upstream video provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    YouTube,
    Facebook,
}

impl Provider {
    /// Detect the provider from a URL's host, independent of the allow-list.
    pub fn detect(url: &str) -> Option<Self> {
        let lower = url.to_lowercase();
        if lower.contains("youtube.com") || lower.contains("youtu.be") {
            Some(Provider::YouTube)
        } else if lower.contains("facebook.com") || lower.contains("fb.watch") {
            Some(Provider::Facebook)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::YouTube => "youtube",
            Provider::Facebook => "facebook",
        }
    }
}

/// A validated media URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUrl {
    pub url: String,
    pub provider: Provider,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// No URL at all; the sender gets usage instructions.
    Help,
    /// Looks like a URL but not one we can fetch.
    Unsupported,
    Valid(MediaUrl),
}

const ALLOWED_PREFIXES: &[(&str, Provider)] = &[
    ("https://www.youtube.com", Provider::YouTube),
    ("https://youtube.com", Provider::YouTube),
    ("https://youtu.be", Provider::YouTube),
    ("https://www.facebook.com", Provider::Facebook),
    ("https://facebook.com", Provider::Facebook),
    ("https://fb.watch", Provider::Facebook),
];

const SHARE_PREFIXES: &[&str] = &[
    "https://www.facebook.com/share",
    "https://facebook.com/share",
    "https://m.facebook.com/share",
];

pub fn classify(text: &str) -> Classification {
    if !text.to_lowercase().contains("http") {
        return Classification::Help;
    }

    let url = text.trim();

    if is_share_link(url) {
        return Classification::Valid(MediaUrl {
            url: url.to_string(),
            provider: Provider::Facebook,
        });
    }

    match ALLOWED_PREFIXES.iter().find(|(prefix, _)| url.starts_with(prefix)) {
        Some((_, provider)) => Classification::Valid(MediaUrl {
            url: url.to_string(),
            provider: *provider,
        }),
        None => Classification::Unsupported,
    }
}

/// True when the URL matches the Facebook share pattern.
pub fn is_share_link(url: &str) -> bool {
    SHARE_PREFIXES.iter().any(|p| url.trim().starts_with(p))
}
