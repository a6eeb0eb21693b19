use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod chat;
pub mod gemini;
pub mod whisper;
pub mod ytdlp;

use crate::Result;

/// A downloaded video and what the downloader knows about it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedMedia {
    /// Local path of the downloaded video
    pub video_path: PathBuf,

    /// Title of the media
    pub title: String,

    /// Uploader / channel name
    pub channel: String,

    /// Duration in seconds if known
    pub duration_seconds: Option<f64>,

    /// `WIDTHxHEIGHT`, or `N/A`
    pub resolution: String,
}

/// One timed piece of a transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// A part of a multimodal prompt
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    /// Media the model fetches itself (e.g. a video URL)
    FileUri(String),
}

/// Downloads media and extracts its audio track
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Fail when the external tools this fetcher drives are missing
    async fn ensure_available(&self) -> Result<()> {
        Ok(())
    }

    /// Expand a playlist URL into its video URLs; single videos come back as-is
    async fn expand(&self, url: &str) -> Result<Vec<String>>;

    /// Download one video into `videos_dir`
    async fn fetch(&self, url: &str, videos_dir: &Path) -> Result<FetchedMedia>;

    /// Extract a 16 kHz mono WAV next to the other audio files; returns its path
    async fn extract_audio(&self, video: &Path, audio_dir: &Path) -> Result<PathBuf>;
}

/// Speech-to-text engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn ensure_available(&self) -> Result<()> {
        Ok(())
    }

    async fn transcribe(&self, audio: &Path) -> Result<Vec<Segment>>;
}

/// Text-only chat completion endpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Raw assistant message for a system + user prompt
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// Multimodal model answering in JSON
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Raw JSON text produced by `model` for `parts`
    async fn generate_json(&self, model: &str, parts: &[Part]) -> Result<String>;
}
