//! Audio extraction through an external `yt-dlp` process.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    time::{Duration, timeout},
};
use tracing::{debug, warn};

use crate::config::{
    Config, DEFAULT_EXTRACTION_TIMEOUT_SECONDS, DEFAULT_METADATA_TIMEOUT_SECONDS,
    DEFAULT_YT_DLP_BIN,
};

/// Combined stdout + stderr ceiling for a single invocation.
pub const MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ACCEPT_LANGUAGE: &str = "Accept-Language:en-US,en;q=0.9";
const ACCEPT: &str = "Accept:text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("YouTube blocked the request (403 Forbidden)")]
    Blocked(String),
    #[error("Video not found or private")]
    Unavailable(String),
    #[error("Video requires age verification")]
    AgeRestricted(String),
    #[error("Processing timed out")]
    Timeout(String),
    #[error("Network error while contacting YouTube")]
    Network(String),
    #[error("Failed to process YouTube video")]
    Failed(String),
}

impl ExtractionError {
    /// Raw diagnostic text behind the user-facing message.
    pub fn detail(&self) -> &str {
        match self {
            Self::Blocked(detail)
            | Self::Unavailable(detail)
            | Self::AgeRestricted(detail)
            | Self::Timeout(detail)
            | Self::Network(detail)
            | Self::Failed(detail) => detail,
        }
    }

    /// Maps extractor diagnostics onto the error taxonomy. Age checks come
    /// before the generic "sign in to confirm" bot wall.
    pub fn classify(stderr: &str) -> Self {
        let detail = last_meaningful_line(stderr)
            .unwrap_or("yt-dlp exited without a diagnostic")
            .to_string();
        let lower = stderr.to_ascii_lowercase();

        if lower.contains("confirm your age")
            || lower.contains("age-restricted")
            || lower.contains("age restricted")
            || lower.contains("inappropriate for some users")
        {
            Self::AgeRestricted(detail)
        } else if lower.contains("403")
            || lower.contains("forbidden")
            || lower.contains("not a bot")
            || lower.contains("sign in to confirm")
        {
            Self::Blocked(detail)
        } else if lower.contains("video unavailable")
            || lower.contains("private video")
            || lower.contains("404")
            || lower.contains("not available")
            || lower.contains("has been removed")
        {
            Self::Unavailable(detail)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout(detail)
        } else if lower.contains("unable to download webpage")
            || lower.contains("connection")
            || lower.contains("network")
            || lower.contains("name resolution")
            || lower.contains("temporary failure")
        {
            Self::Network(detail)
        } else {
            Self::Failed(detail)
        }
    }
}

/// Display metadata; both fields are optional upstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoMetadata {
    pub title: Option<String>,
    pub duration_seconds: Option<u64>,
    pub channel: Option<String>,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Writes `{output_stem}.mp3` and returns the verified path.
    async fn extract_audio(&self, url: &str, output_stem: &Path)
    -> Result<PathBuf, ExtractionError>;

    async fn fetch_metadata(&self, url: &str) -> Result<VideoMetadata, ExtractionError>;
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    duration: Option<f64>,
    channel: Option<String>,
    uploader: Option<String>,
}

#[derive(Debug, Clone)]
pub struct YtDlpExtractor {
    binary: String,
    extraction_timeout: Duration,
    metadata_timeout: Duration,
    max_output_bytes: usize,
}

impl Default for YtDlpExtractor {
    fn default() -> Self {
        Self {
            binary: DEFAULT_YT_DLP_BIN.to_string(),
            extraction_timeout: Duration::from_secs(DEFAULT_EXTRACTION_TIMEOUT_SECONDS),
            metadata_timeout: Duration::from_secs(DEFAULT_METADATA_TIMEOUT_SECONDS),
            max_output_bytes: MAX_OUTPUT_BYTES,
        }
    }
}

impl YtDlpExtractor {
    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: config.yt_dlp_bin.clone(),
            extraction_timeout: config.extraction_timeout,
            metadata_timeout: config.metadata_timeout,
            max_output_bytes: MAX_OUTPUT_BYTES,
        }
    }

    /// `yt-dlp --version`, used as a startup check.
    pub async fn version(&self) -> Result<String, ExtractionError> {
        let output = self
            .run(vec!["--version".to_string()], self.metadata_timeout)
            .await?;
        if !output.status.success() {
            return Err(ExtractionError::classify(&String::from_utf8_lossy(
                &output.stderr,
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn audio_args(url: &str, output_stem: &Path) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--no-progress".to_string(),
            "-f".to_string(),
            "bestaudio/best".to_string(),
            "-x".to_string(),
            "--audio-format".to_string(),
            "mp3".to_string(),
            "--audio-quality".to_string(),
            "0".to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "-o".to_string(),
            format!("{}.%(ext)s", output_stem.to_string_lossy()),
        ];
        args.extend(request_header_args());
        args.push(url.to_string());
        args
    }

    fn metadata_args(url: &str) -> Vec<String> {
        let mut args = vec![
            "--dump-single-json".to_string(),
            "--skip-download".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
        ];
        args.extend(request_header_args());
        args.push(url.to_string());
        args
    }

    async fn run(
        &self,
        args: Vec<String>,
        limit: Duration,
    ) -> Result<ProcessOutput, ExtractionError> {
        debug!("Running {} {:?}", self.binary, args);

        let mut command = Command::new(&self.binary);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own group, so ffmpeg started for post-processing dies with yt-dlp.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ExtractionError::Failed(format!(
                    "{} is not installed or not on PATH",
                    self.binary
                ))
            } else {
                ExtractionError::Failed(format!("Could not start {}: {error}", self.binary))
            }
        })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let budget = OutputBudget::new(self.max_output_bytes);

        let collect = async {
            let (stdout, stderr) =
                tokio::try_join!(budget.read(stdout), budget.read(stderr))?;
            let status = child.wait().await.map_err(|error| {
                ExtractionError::Failed(format!("Could not wait for {}: {error}", self.binary))
            })?;
            Ok::<_, ExtractionError>(ProcessOutput {
                status,
                stdout,
                stderr,
            })
        };

        let result = match timeout(limit, collect).await {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::Timeout(format!(
                "{} did not finish within {} seconds",
                self.binary,
                limit.as_secs()
            ))),
        };
        if result.is_err() {
            kill_process_group(pid).await;
        }
        // Dropping the child kills yt-dlp itself if it is still running.
        result
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    async fn extract_audio(
        &self,
        url: &str,
        output_stem: &Path,
    ) -> Result<PathBuf, ExtractionError> {
        let output = self
            .run(Self::audio_args(url, output_stem), self.extraction_timeout)
            .await?;

        if !output.status.success() {
            return Err(ExtractionError::classify(&String::from_utf8_lossy(
                &output.stderr,
            )));
        }

        // The store addresses artifacts by the reserved stem, so the printed
        // path is only used as a diagnostic.
        let path = PathBuf::from(format!("{}.mp3", output_stem.to_string_lossy()));
        if let Some(printed) = last_meaningful_line(&String::from_utf8_lossy(&output.stdout))
            && Path::new(printed) != path
        {
            warn!("yt-dlp printed {:?}, expected {:?}", printed, path);
        }

        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(path),
            Ok(_) => Err(ExtractionError::Failed(format!(
                "Extractor output {:?} is not a regular file",
                path
            ))),
            Err(error) => {
                warn!("yt-dlp reported success but {:?} is missing: {error}", path);
                Err(ExtractionError::Failed(
                    "yt-dlp finished without producing an MP3 file".to_string(),
                ))
            }
        }
    }

    async fn fetch_metadata(&self, url: &str) -> Result<VideoMetadata, ExtractionError> {
        let output = self
            .run(Self::metadata_args(url), self.metadata_timeout)
            .await?;

        if !output.status.success() {
            return Err(ExtractionError::classify(&String::from_utf8_lossy(
                &output.stderr,
            )));
        }

        let info: YtDlpVideoInfo = serde_json::from_slice(&output.stdout).map_err(|error| {
            ExtractionError::Failed(format!("Could not parse yt-dlp metadata: {error}"))
        })?;

        Ok(VideoMetadata {
            title: info.title.filter(|value| !value.trim().is_empty()),
            duration_seconds: info
                .duration
                .filter(|value| value.is_finite() && *value >= 0.0)
                .map(|value| value.round() as u64),
            channel: info.channel.or(info.uploader),
        })
    }
}

#[derive(Debug)]
struct ProcessOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

fn request_header_args() -> Vec<String> {
    vec![
        "--user-agent".to_string(),
        BROWSER_USER_AGENT.to_string(),
        "--add-header".to_string(),
        ACCEPT_LANGUAGE.to_string(),
        "--add-header".to_string(),
        ACCEPT.to_string(),
    ]
}

/// Byte allowance shared by every pipe of one invocation.
struct OutputBudget {
    cap: usize,
    used: AtomicUsize,
}

impl OutputBudget {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            used: AtomicUsize::new(0),
        }
    }

    /// Reads `pipe` to the end, failing as soon as all pipes together have
    /// produced more than `cap` bytes.
    async fn read<R>(&self, pipe: Option<R>) -> Result<Vec<u8>, ExtractionError>
    where
        R: AsyncRead + Unpin,
    {
        let Some(mut pipe) = pipe else {
            return Ok(Vec::new());
        };

        let mut buffer = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let read = pipe.read(&mut chunk).await.map_err(|error| {
                ExtractionError::Failed(format!("Could not read yt-dlp output: {error}"))
            })?;
            if read == 0 {
                return Ok(buffer);
            }
            if self.used.fetch_add(read, Ordering::Relaxed) + read > self.cap {
                return Err(output_limit_error(self.cap));
            }
            buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

#[cfg(unix)]
async fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };

    let status = Command::new("kill")
        .args(["-KILL", "--", &format!("-{pid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => debug!("Killed process group {pid}"),
        Ok(status) => debug!("Process group {pid} already gone ({status})"),
        Err(error) => warn!("Could not kill process group {pid}: {error}"),
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: Option<u32>) {}

fn output_limit_error(cap: usize) -> ExtractionError {
    ExtractionError::Failed(format!(
        "yt-dlp output exceeded {} MB",
        cap / (1024 * 1024)
    ))
}

fn last_meaningful_line(text: &str) -> Option<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
}
