//! yt-dlp subprocess backend.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::pipeline::fetcher::{DownloadRequest, Downloaded, Downloader, FetchError};

pub struct YtDlp {
    binary: String,
}

impl YtDlp {
    pub fn new(binary: String) -> Self {
        Self { binary }
    }

    fn command(&self, request: &DownloadRequest) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--no-simulate")
            .arg("--dump-single-json")
            .arg("--no-progress")
            .arg("--no-playlist")
            // Local retention ages files by mtime, so keep the download time.
            .arg("--no-mtime")
            .arg("-f")
            .arg(&request.format)
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("-o")
            .arg(&request.output_template)
            .arg("--user-agent")
            .arg(&request.user_agent);
        if let Some(cookies) = &request.cookies {
            cmd.arg("--cookies").arg(cookies);
        }
        cmd.arg(&request.url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[derive(Deserialize)]
struct InfoJson {
    title: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    requested_downloads: Vec<RequestedDownload>,
    #[serde(rename = "_filename")]
    filename: Option<String>,
}

#[derive(Deserialize)]
struct RequestedDownload {
    filepath: Option<String>,
}

#[async_trait]
impl Downloader for YtDlp {
    async fn download(&self, request: &DownloadRequest) -> Result<Downloaded, FetchError> {
        let mut cmd = self.command(request);
        let output = match tokio::time::timeout(request.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(FetchError::Unknown(format!("Failed to run yt-dlp: {e}"))),
            Err(_) => {
                warn!("yt-dlp timed out after {:?}", request.timeout);
                return Err(FetchError::Unknown(format!(
                    "Download timed out after {} seconds",
                    request.timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp failed ({}): {}", output.status, stderr.trim());
            return Err(classify_stderr(&stderr));
        }

        parse_info(&output.stdout)
    }
}

fn parse_info(stdout: &[u8]) -> Result<Downloaded, FetchError> {
    let info: InfoJson = serde_json::from_slice(stdout)
        .map_err(|e| FetchError::Unknown(format!("Unreadable yt-dlp output: {e}")))?;

    let path = info
        .requested_downloads
        .iter()
        .find_map(|d| d.filepath.clone())
        .or(info.filename)
        .ok_or_else(|| FetchError::Unknown("yt-dlp did not report an output file".to_string()))?;
    debug!("yt-dlp wrote {}", path);

    Ok(Downloaded {
        path: PathBuf::from(path),
        title: info.title,
        duration_seconds: info.duration,
    })
}

/// Map extractor stderr to a failure kind.
pub fn classify_stderr(stderr: &str) -> FetchError {
    let lower = stderr.to_lowercase();
    if lower.contains("requested format is not available") || lower.contains("requested format not available") {
        FetchError::FormatUnavailable
    } else if lower.contains("private video") || lower.contains("video is private") {
        FetchError::Private
    } else if lower.contains("sign in to") {
        FetchError::AuthRequired
    } else {
        let message = stderr
            .lines()
            .rev()
            .find(|l| l.starts_with("ERROR:"))
            .map(|l| l.trim_start_matches("ERROR:").trim())
            .or_else(|| stderr.lines().rev().find(|l| !l.trim().is_empty()).map(str::trim))
            .unwrap_or("yt-dlp failed");
        FetchError::Unknown(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_classify_stderr() {
        assert_eq!(
            classify_stderr("ERROR: [youtube] abc: Requested format is not available. Use --list-formats"),
            FetchError::FormatUnavailable
        );
        assert_eq!(classify_stderr("ERROR: [youtube] abc: Private video. Sign in if you've been granted access"), FetchError::Private);
        assert_eq!(
            classify_stderr("ERROR: [youtube] abc: Sign in to confirm your age"),
            FetchError::AuthRequired
        );
        assert_eq!(
            classify_stderr("WARNING: something\nERROR: Unable to extract video data\n"),
            FetchError::Unknown("Unable to extract video data".to_string())
        );
        assert_eq!(classify_stderr(""), FetchError::Unknown("yt-dlp failed".to_string()));
    }

    #[test]
    fn test_parse_info_prefers_final_filepath() {
        let json = br#"{
            "title": "Clip",
            "duration": 42.0,
            "_filename": "downloads/original_x.webm",
            "requested_downloads": [{"filepath": "downloads/original_x.mp4"}]
        }"#;
        let downloaded = parse_info(json).unwrap();
        assert_eq!(downloaded.path, PathBuf::from("downloads/original_x.mp4"));
        assert_eq!(downloaded.title.as_deref(), Some("Clip"));
        assert_eq!(downloaded.duration_seconds, Some(42.0));
    }

    #[test]
    fn test_parse_info_falls_back_to_filename() {
        let downloaded = parse_info(br#"{"_filename": "downloads/original_y.mp4"}"#).unwrap();
        assert_eq!(downloaded.path, PathBuf::from("downloads/original_y.mp4"));
        assert!(downloaded.title.is_none());
    }

    #[test]
    fn test_parse_info_garbage() {
        assert!(matches!(parse_info(b"not json"), Err(FetchError::Unknown(_))));
        assert!(matches!(parse_info(b"{}"), Err(FetchError::Unknown(_))));
    }

    fn request() -> DownloadRequest {
        DownloadRequest {
            url: "https://youtu.be/x".to_string(),
            output_template: "/tmp/original_%(id)s.%(ext)s".to_string(),
            format: "best".to_string(),
            cookies: None,
            user_agent: "test".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std().get_args().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn test_command_keeps_download_mtime() {
        let args = args(&YtDlp::new("yt-dlp".to_string()).command(&request()));
        assert!(args.iter().any(|a| a == "--no-mtime"), "{args:?}");
        assert!(!args.iter().any(|a| a == "--mtime"));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/x"));
    }

    #[test]
    fn test_command_passes_cookies() {
        let mut req = request();
        assert!(!args(&YtDlp::new("yt-dlp".to_string()).command(&req)).contains(&"--cookies".to_string()));

        req.cookies = Some(PathBuf::from("/tmp/yt_cookies.txt"));
        let args = args(&YtDlp::new("yt-dlp".to_string()).command(&req));
        let at = args.iter().position(|a| a == "--cookies").expect("cookies flag");
        assert_eq!(args[at + 1], "/tmp/yt_cookies.txt");
    }

    #[tokio::test]
    async fn test_missing_binary_is_unknown() {
        let backend = YtDlp::new("/nonexistent/yt-dlp-binary".to_string());
        let err = backend.download(&request()).await.unwrap_err();
        assert!(matches!(err, FetchError::Unknown(ref m) if m.starts_with("Failed to run yt-dlp")));
    }
}
