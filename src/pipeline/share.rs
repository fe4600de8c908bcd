//! Share-link expansion.
//!
//! Facebook share URLs only redirect to the real video when requested like a
//! browser would. Bot challenges show up either as a redirect to a login or
//! checkpoint page, or as a challenge page body.

use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::pipeline::fetcher::FetchError;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
];

const URL_MARKERS: &[&str] = &["checkpoint", "login", "security"];
const BODY_MARKERS: &[&str] = &["checkpoint", "security check", "captcha", "not a robot"];

pub struct ShareResolver {
    http: reqwest::Client,
    /// Jitter before the request, in milliseconds.
    delay_ms: RangeInclusive<u64>,
}

impl ShareResolver {
    pub fn new(delay_ms: RangeInclusive<u64>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { http, delay_ms })
    }

    /// Follow redirects and return the final URL, or `Checkpoint` if a challenge was hit.
    pub async fn resolve(&self, url: &str, cookies: Option<&Path>) -> Result<String, FetchError> {
        let (user_agent, delay) = {
            let mut rng = rand::thread_rng();
            let ua = USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0]);
            (ua, rng.gen_range(self.delay_ms.clone()))
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;

        let mut request = self
            .http
            .get(url)
            .header("User-Agent", user_agent)
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8")
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("DNT", "1")
            .header("Sec-Fetch-Dest", "document")
            .header("Sec-Fetch-Mode", "navigate")
            .header("Sec-Fetch-Site", "none")
            .header("Cache-Control", "max-age=0");

        if let Some(path) = cookies {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    let header = cookie_header(&content);
                    if !header.is_empty() {
                        request = request.header("Cookie", header);
                    }
                }
                Err(e) => warn!("Failed to read cookies from {:?}: {e}", path),
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Unknown(format!("Failed to resolve share link: {e}")))?;
        let final_url = response.url().to_string();
        debug!("Share link {} -> {}", url, final_url);

        let lower_url = final_url.to_lowercase();
        if URL_MARKERS.iter().any(|m| lower_url.contains(m)) {
            warn!("🚧 Share link redirected to a challenge page: {}", final_url);
            return Err(FetchError::Checkpoint);
        }

        let body = response.text().await.unwrap_or_default().to_lowercase();
        if BODY_MARKERS.iter().any(|m| body.contains(m)) {
            warn!("🚧 Share link returned a challenge page");
            return Err(FetchError::Checkpoint);
        }

        Ok(final_url)
    }
}

/// Build a `Cookie` header value from a Netscape cookie file.
pub fn cookie_header(content: &str) -> String {
    content
        .lines()
        .filter_map(|line| {
            let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
            if line.trim().is_empty() || line.starts_with('#') {
                return None;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 7 {
                return None;
            }
            Some(format!("{}={}", fields[5], fields[6].trim_end()))
        })
        .collect::<Vec<_>>()
        .join("; ")
}
