//! Media fetcher: picks credentials, expands share links, runs the extractor
//! and normalizes what it leaves on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classifier::{Provider, is_share_link};
use crate::config::Credentials;
use crate::pipeline::share::ShareResolver;

/// Why a fetch failed. Only `Unknown` carries upstream text.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("Facebook security checkpoint detected")]
    Checkpoint,
    #[error("The downloaded file is empty")]
    EmptyFile,
    #[error("Video format not available - might be private or deleted")]
    FormatUnavailable,
    #[error("Video is private")]
    Private,
    #[error("Video requires authentication")]
    AuthRequired,
    #[error("{0}")]
    Unknown(String),
}

/// A fetched file ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Media {
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub title: Option<String>,
    pub duration_seconds: Option<f64>,
}

impl Media {
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / 1_048_576.0
    }
}

pub type MediaResult = Result<Media, FetchError>;

#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str) -> MediaResult;
}

pub const FORMAT_PREFERENCE: &str = "best[ext=mp4]/bestvideo[ext=mp4]+bestaudio[ext=m4a]/best";

pub const DESKTOP_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Everything the extractor needs for one download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    /// yt-dlp output template, e.g. `downloads/original_%(id)s.%(ext)s`.
    pub output_template: String,
    pub format: String,
    pub cookies: Option<PathBuf>,
    pub user_agent: String,
    pub timeout: Duration,
}

/// What the extractor produced.
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub path: PathBuf,
    pub title: Option<String>,
    pub duration_seconds: Option<f64>,
}

/// The external extractor.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, request: &DownloadRequest) -> Result<Downloaded, FetchError>;
}

pub struct MediaFetcher {
    backend: Arc<dyn Downloader>,
    resolver: ShareResolver,
    credentials: Credentials,
    download_dir: PathBuf,
    download_timeout: Duration,
}

impl MediaFetcher {
    pub fn new(
        backend: Arc<dyn Downloader>,
        resolver: ShareResolver,
        credentials: Credentials,
        download_dir: PathBuf,
        download_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            resolver,
            credentials,
            download_dir,
            download_timeout,
        }
    }

    fn cookies_for(&self, provider: Option<Provider>) -> Option<PathBuf> {
        match provider {
            Some(Provider::YouTube) => self.credentials.youtube_cookies.clone(),
            Some(Provider::Facebook) => self.credentials.facebook_cookies.clone(),
            None => None,
        }
    }
}

#[async_trait]
impl Fetch for MediaFetcher {
    async fn fetch(&self, url: &str) -> MediaResult {
        let provider = Provider::detect(url);
        let cookies = self.cookies_for(provider);

        let target = if is_share_link(url) {
            info!("🔗 Resolving share link {}", url);
            let resolved = self.resolver.resolve(url, cookies.as_deref()).await?;
            info!("🔗 Resolved to {}", resolved);
            resolved
        } else {
            url.to_string()
        };

        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| FetchError::Unknown(format!("cannot create download directory: {e}")))?;

        let request = DownloadRequest {
            url: target,
            output_template: self
                .download_dir
                .join("original_%(id)s.%(ext)s")
                .to_string_lossy()
                .into_owned(),
            format: FORMAT_PREFERENCE.to_string(),
            cookies,
            user_agent: DESKTOP_USER_AGENT.to_string(),
            timeout: self.download_timeout,
        };

        info!("📥 Downloading {} (cookies: {})", request.url, request.cookies.is_some());
        let downloaded = self.backend.download(&request).await?;

        let path = match &downloaded.title {
            Some(title) => normalize_path(&downloaded.path, &self.download_dir, title).await,
            None => downloaded.path.clone(),
        };

        let size_bytes = validate(&path).await?;
        stamp_download_time(&path).await;
        info!("✅ Downloaded {:?} ({} bytes)", path, size_bytes);

        Ok(Media {
            local_path: path,
            size_bytes,
            title: downloaded.title,
            duration_seconds: downloaded.duration_seconds,
        })
    }
}

static UNSAFE_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s-]").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

const MAX_TITLE_CHARS: usize = 50;

/// Make a title safe to use in a filename.
pub fn sanitize_title(title: &str) -> String {
    let stripped = UNSAFE_CHARS.replace_all(title, "");
    let collapsed = WHITESPACE.replace_all(stripped.trim(), " ").into_owned();

    let sanitized = if collapsed.chars().count() > MAX_TITLE_CHARS {
        let head: String = collapsed.chars().take(MAX_TITLE_CHARS - 3).collect();
        format!("{}...", head.trim_end())
    } else {
        collapsed
    };

    if sanitized.is_empty() { "video".to_string() } else { sanitized }
}

/// Move the extractor's output to a stable, human-readable name.
///
/// Falls back to copy+delete when rename fails, and to the original path if both fail.
async fn normalize_path(original: &Path, download_dir: &Path, title: &str) -> PathBuf {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let target = download_dir.join(format!("original_{}_{}.mp4", sanitize_title(title), timestamp));

    if target == original {
        return target;
    }

    match tokio::fs::rename(original, &target).await {
        Ok(()) => {
            debug!("Renamed {:?} -> {:?}", original, target);
            return target;
        }
        Err(e) => warn!("Rename failed ({e}), trying copy"),
    }

    match tokio::fs::copy(original, &target).await {
        Ok(_) => {
            if let Err(e) = tokio::fs::remove_file(original).await {
                warn!("Failed to remove {:?} after copy: {e}", original);
            }
            target
        }
        Err(e) => {
            warn!("Copy failed ({e}), keeping {:?}", original);
            original.to_path_buf()
        }
    }
}

/// Local retention ages files by mtime, which must be the download time.
async fn stamp_download_time(path: &Path) {
    let target = path.to_path_buf();
    let stamped = tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .write(true)
            .open(&target)?
            .set_modified(SystemTime::now())
    })
    .await;
    match stamped {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Could not set mtime on {:?}: {e}", path),
        Err(e) => warn!("mtime task failed for {:?}: {e}", path),
    }
}

/// The file must exist and be non-empty; empty files are deleted.
async fn validate(path: &Path) -> Result<u64, FetchError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| FetchError::Unknown("Downloaded file not found".to_string()))?;

    if metadata.len() == 0 {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("Failed to remove empty file {:?}: {e}", path);
        }
        return Err(FetchError::EmptyFile);
    }

    Ok(metadata.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Writes `content` where the template says and reports `title`.
    struct StubDownloader {
        content: Vec<u8>,
        title: Option<String>,
        error: Option<FetchError>,
        /// Upstream Last-Modified, as yt-dlp applies with `--mtime`.
        mtime: Option<SystemTime>,
        requests: Mutex<Vec<DownloadRequest>>,
    }

    impl StubDownloader {
        fn writing(content: &[u8], title: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                content: content.to_vec(),
                title: title.map(String::from),
                error: None,
                mtime: None,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn writing_backdated(content: &[u8], mtime: SystemTime) -> Arc<Self> {
            Arc::new(Self {
                content: content.to_vec(),
                title: Some("Old upload".to_string()),
                error: None,
                mtime: Some(mtime),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn failing(error: FetchError) -> Arc<Self> {
            Arc::new(Self {
                content: Vec::new(),
                title: None,
                error: Some(error),
                mtime: None,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Downloader for StubDownloader {
        async fn download(&self, request: &DownloadRequest) -> Result<Downloaded, FetchError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(e) = &self.error {
                return Err(e.clone());
            }
            let path = PathBuf::from(request.output_template.replace("%(id)s.%(ext)s", "abc123.mp4"));
            tokio::fs::write(&path, &self.content).await.unwrap();
            if let Some(mtime) = self.mtime {
                std::fs::File::options()
                    .write(true)
                    .open(&path)
                    .unwrap()
                    .set_modified(mtime)
                    .unwrap();
            }
            Ok(Downloaded {
                path,
                title: self.title.clone(),
                duration_seconds: Some(12.5),
            })
        }
    }

    fn fetcher(backend: Arc<StubDownloader>, dir: &Path, credentials: Credentials) -> MediaFetcher {
        MediaFetcher::new(
            backend,
            ShareResolver::new(0..=0).unwrap(),
            credentials,
            dir.to_path_buf(),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn test_sanitize_title() {
        assert_eq!(sanitize_title("Hello, World!"), "Hello World");
        assert_eq!(sanitize_title("  a   b\tc  "), "a b c");
        assert_eq!(sanitize_title("keep-dashes_and_underscores"), "keep-dashes_and_underscores");
        assert_eq!(sanitize_title("🎉🎉"), "video");
        assert_eq!(sanitize_title("../../etc/passwd"), "etcpasswd");
    }

    #[test]
    fn test_sanitize_title_truncates() {
        let long = "a".repeat(80);
        let sanitized = sanitize_title(&long);
        assert_eq!(sanitized.chars().count(), 50);
        assert!(sanitized.ends_with("..."));
        assert_eq!(sanitize_title(&"b".repeat(50)), "b".repeat(50));
    }

    #[tokio::test]
    async fn test_fetch_normalizes_filename() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StubDownloader::writing(b"video bytes", Some("My Cool: Video!"));
        let media = fetcher(backend.clone(), dir.path(), Credentials::default())
            .fetch("https://youtu.be/abc123")
            .await
            .unwrap();

        let name = media.local_path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("original_My Cool Video_"), "{name}");
        assert!(name.ends_with(".mp4"));
        assert!(media.local_path.exists());
        assert!(!dir.path().join("original_abc123.mp4").exists());
        assert_eq!(media.size_bytes, 11);
        assert_eq!(media.title.as_deref(), Some("My Cool: Video!"));
        assert_eq!(media.duration_seconds, Some(12.5));

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[0].format, FORMAT_PREFERENCE);
        assert!(requests[0].output_template.ends_with("original_%(id)s.%(ext)s"));
    }

    #[tokio::test]
    async fn test_fetched_file_survives_local_retention_sweep() {
        use crate::ledger::Ledger;
        use crate::pipeline::sweeper::RetentionSweeper;
        use crate::pipeline::tests::MockCloud;

        let dir = tempfile::tempdir().unwrap();
        let three_years = Duration::from_secs(3 * 365 * 24 * 3600);
        let backend = StubDownloader::writing_backdated(b"video bytes", SystemTime::now() - three_years);
        let media = fetcher(backend, dir.path(), Credentials::default())
            .fetch("https://youtu.be/abc123")
            .await
            .unwrap();

        let modified = std::fs::metadata(&media.local_path).unwrap().modified().unwrap();
        assert!(modified.elapsed().unwrap() < Duration::from_secs(60));

        let report = RetentionSweeper::new(
            MockCloud::new(),
            Ledger::in_memory().unwrap(),
            "wa-downloads".into(),
            dir.path().to_path_buf(),
            24,
            24,
            Duration::from_secs(3600),
        )
        .run_cycle(Utc::now())
        .await;
        assert_eq!(report.local_deleted, 0);
        assert!(media.local_path.exists());
    }

    #[tokio::test]
    async fn test_fetch_without_title_keeps_path() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StubDownloader::writing(b"x", None);
        let media = fetcher(backend, dir.path(), Credentials::default())
            .fetch("https://youtu.be/abc123")
            .await
            .unwrap();
        assert_eq!(media.local_path, dir.path().join("original_abc123.mp4"));
    }

    #[tokio::test]
    async fn test_empty_file_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StubDownloader::writing(b"", Some("empty"));
        let result = fetcher(backend, dir.path(), Credentials::default())
            .fetch("https://youtu.be/abc123")
            .await;
        assert_eq!(result, Err(FetchError::EmptyFile));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_backend_error_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let backend = StubDownloader::failing(FetchError::Private);
        let result = fetcher(backend, dir.path(), Credentials::default())
            .fetch("https://www.youtube.com/watch?v=x")
            .await;
        assert_eq!(result, Err(FetchError::Private));
    }

    #[tokio::test]
    async fn test_cookies_selected_by_provider() {
        let dir = tempfile::tempdir().unwrap();
        let credentials = Credentials {
            youtube_cookies: Some(PathBuf::from("/cookies/yt.txt")),
            facebook_cookies: Some(PathBuf::from("/cookies/fb.txt")),
        };
        let backend = StubDownloader::writing(b"x", None);
        let f = fetcher(backend.clone(), dir.path(), credentials);

        f.fetch("https://youtu.be/a").await.unwrap();
        f.fetch("https://www.facebook.com/watch/?v=1").await.unwrap();

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[0].cookies, Some(PathBuf::from("/cookies/yt.txt")));
        assert_eq!(requests[1].cookies, Some(PathBuf::from("/cookies/fb.txt")));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(FetchError::EmptyFile.to_string(), "The downloaded file is empty");
        assert_eq!(FetchError::AuthRequired.to_string(), "Video requires authentication");
        assert_eq!(FetchError::Unknown("boom".into()).to_string(), "boom");
    }
}
