use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::{FetchedMedia, MediaFetcher};
use crate::utils::check_dependencies;
use crate::{PipelineError, Result};

/// Prefer 480p MP4 so downstream vision calls stay cheap
const FORMAT_SELECTOR: &str = "bestvideo[height=480][ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best";

/// Downloader backed by yt-dlp, audio extraction by ffmpeg
pub struct YtDlpFetcher {
    yt_dlp_path: String,
    ffmpeg_path: String,
    cookies: Option<PathBuf>,
}

impl YtDlpFetcher {
    pub fn new(cookies: Option<PathBuf>) -> Self {
        Self {
            yt_dlp_path: "yt-dlp".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            cookies: cookies.filter(|path| path.exists()),
        }
    }

    fn yt_dlp(&self) -> Command {
        let mut command = Command::new(&self.yt_dlp_path);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(cookies) = &self.cookies {
            command.arg("--cookies").arg(cookies);
        }
        command
    }

    async fn run_json(&self, command: &mut Command, what: &str) -> Result<Value> {
        let output = command.output().await?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("yt-dlp {} failed: {}", what, error.trim());
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }

    /// Get video information without downloading
    async fn get_video_info(&self, url: &str) -> Result<Value> {
        tracing::debug!("Extracting video info for: {}", url);
        let mut command = self.yt_dlp();
        command.args(["--dump-json", "--no-playlist", "--no-warnings", url]);
        self.run_json(&mut command, "info extraction").await
    }
}

/// Video URLs of a flat playlist listing, or `None` if `info` is a single video
fn playlist_entries(info: &Value) -> Option<Vec<String>> {
    if info["_type"].as_str() != Some("playlist") {
        return None;
    }

    let entries = info["entries"].as_array()?;
    Some(
        entries
            .iter()
            .filter_map(|entry| entry["url"].as_str().or_else(|| entry["webpage_url"].as_str()))
            .map(str::to_string)
            .collect(),
    )
}

fn resolution_of(info: &Value) -> String {
    match (info["width"].as_u64(), info["height"].as_u64()) {
        (Some(width), Some(height)) => format!("{}x{}", width, height),
        _ => "N/A".to_string(),
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn ensure_available(&self) -> Result<()> {
        let missing = check_dependencies(&[self.yt_dlp_path.as_str(), self.ffmpeg_path.as_str()]).await;
        if !missing.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "required tool(s) not found: {}",
                missing.join(", ")
            ))
            .into());
        }
        Ok(())
    }

    async fn expand(&self, url: &str) -> Result<Vec<String>> {
        let mut command = self.yt_dlp();
        command.args(["--flat-playlist", "--dump-single-json", "--no-warnings", url]);
        let info = self.run_json(&mut command, "playlist inspection").await?;

        match playlist_entries(&info) {
            Some(entries) => {
                tracing::info!(
                    "Found playlist '{}' with {} video(s)",
                    info["title"].as_str().unwrap_or("Unknown Playlist"),
                    entries.len()
                );
                Ok(entries)
            }
            None => Ok(vec![url.to_string()]),
        }
    }

    async fn fetch(&self, url: &str, videos_dir: &Path) -> Result<FetchedMedia> {
        let info = self.get_video_info(url).await?;

        let title = info["title"].as_str().unwrap_or("Unknown Title").to_string();
        let channel = info["uploader"].as_str().unwrap_or("Unknown Channel").to_string();
        let duration_seconds = info["duration"].as_f64();
        let resolution = resolution_of(&info);

        tracing::info!("Downloading '{}' from channel {}", title, channel);

        let template = videos_dir.join("%(title)s.%(ext)s");
        let output = self
            .yt_dlp()
            .args([
                "--format",
                FORMAT_SELECTOR,
                "--merge-output-format",
                "mp4",
                "--no-playlist",
                "--retries",
                "5",
                "--fragment-retries",
                "5",
                "--no-warnings",
                "--no-simulate",
                "--print",
                "after_move:filepath",
                "--output",
            ])
            .arg(&template)
            .arg(url)
            .output()
            .await?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to download video: {}", error.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let video_path = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("yt-dlp did not report the downloaded file"))?;

        if !video_path.exists() {
            anyhow::bail!(
                "Download reported success but file not found at '{}'",
                video_path.display()
            );
        }

        Ok(FetchedMedia {
            video_path,
            title,
            channel,
            duration_seconds,
            resolution,
        })
    }

    async fn extract_audio(&self, video: &Path, audio_dir: &Path) -> Result<PathBuf> {
        if !video.exists() {
            anyhow::bail!("Video file not found at {}", video.display());
        }

        let stem = video
            .file_stem()
            .ok_or_else(|| anyhow::anyhow!("Video path has no file name: {}", video.display()))?;
        let audio_path = audio_dir.join(format!("{}.wav", stem.to_string_lossy()));

        tracing::debug!("Extracting audio: {} -> {}", video.display(), audio_path.display());

        let output = Command::new(&self.ffmpeg_path)
            .arg("-i")
            .arg(video)
            .args(["-vn", "-acodec", "pcm_s16le", "-ar", "16000", "-ac", "1", "-y"])
            .arg(&audio_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffmpeg failed to extract audio: {}", error.trim());
        }

        Ok(audio_path)
    }
}
