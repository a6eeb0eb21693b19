use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::PipelineError;

const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Working directories, one per kind of artifact
    pub directories: Directories,

    /// Input lists, ledgers, tables and aggregates
    pub files: Files,

    pub download: DownloadConfig,
    pub whisper: WhisperConfig,
    pub refiner: RefinerConfig,
    pub gemini: GeminiConfig,

    /// Timeout for a single HTTP request to a model endpoint
    pub http_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Directories {
    pub videos: PathBuf,
    pub audio: PathBuf,
    pub transcripts: PathBuf,
    pub refined_transcripts: PathBuf,
    pub vlm_dataset: PathBuf,
    pub adverse_events: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Files {
    /// One URL per line; `#` starts a comment
    pub video_links: PathBuf,

    /// Netscape cookie jar handed to yt-dlp when present
    pub cookies: PathBuf,

    pub metadata_csv: PathBuf,
    pub download_log: PathBuf,
    pub cleaning_log: PathBuf,
    pub transcription_log: PathBuf,
    pub refinement_log: PathBuf,
    pub dataset_summary: PathBuf,
    pub vlm_log: PathBuf,
    pub vlm_aggregate: PathBuf,
    pub adverse_log: PathBuf,
    pub adverse_aggregate: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Videos longer than this are removed by the clean stage
    pub max_duration_seconds: f64,
    pub delay_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    pub command: String,
    pub model_size: String,

    /// `cpu`, `cuda`, ...; whisper picks one when unset
    pub device: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinerConfig {
    /// OpenAI-compatible API root
    pub base_url: String,
    pub model: String,

    /// Name of the environment variable holding the API key
    pub api_key_env: String,

    pub api_call_delay_seconds: f64,
    pub retry_backoff_seconds: f64,
    pub max_files_per_run: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub gatekeeper_model: String,
    pub generator_model: String,
    pub safety_model: String,
    pub vlm_delay_seconds: f64,
    pub safety_delay_seconds: f64,
    pub max_items_per_run: Option<usize>,

    /// Transcript characters shown to the gatekeeper
    pub gatekeeper_char_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directories: Directories::default(),
            files: Files::default(),
            download: DownloadConfig::default(),
            whisper: WhisperConfig::default(),
            refiner: RefinerConfig::default(),
            gemini: GeminiConfig::default(),
            http_timeout_seconds: 300,
        }
    }
}

impl Default for Directories {
    fn default() -> Self {
        Self {
            videos: "videos".into(),
            audio: "audio".into(),
            transcripts: "transcripts".into(),
            refined_transcripts: "refined_transcripts".into(),
            vlm_dataset: "vlm_dataset".into(),
            adverse_events: "adverse_events".into(),
        }
    }
}

impl Default for Files {
    fn default() -> Self {
        Self {
            video_links: "video_links.txt".into(),
            cookies: "cookies.txt".into(),
            metadata_csv: "videos/video_metadata.csv".into(),
            download_log: "videos/download_log.csv".into(),
            cleaning_log: "videos/cleaning_log.csv".into(),
            transcription_log: "transcripts/transcription_log.csv".into(),
            refinement_log: "refined_transcripts/refinement_log.csv".into(),
            dataset_summary: "dataset_summary.csv".into(),
            vlm_log: "vlm_dataset/vlm_log.csv".into(),
            vlm_aggregate: "vlm_dataset/vlm_dataset_all.jsonl".into(),
            adverse_log: "adverse_events/adverse_log.csv".into(),
            adverse_aggregate: "adverse_events/adverse_events_all.jsonl".into(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_duration_seconds: 1200.0,
            delay_seconds: 1.0,
        }
    }
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            command: "whisper".to_string(),
            model_size: "large".to_string(),
            device: None,
        }
    }
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.cerebras.ai/v1".to_string(),
            model: "qwen-3-235b-a22b-thinking-2507".to_string(),
            api_key_env: "CEREBRAS_API_KEY".to_string(),
            api_call_delay_seconds: 5.0,
            retry_backoff_seconds: 10.0,
            max_files_per_run: Some(50),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            gatekeeper_model: "gemini-2.5-flash".to_string(),
            generator_model: "gemini-2.5-pro".to_string(),
            safety_model: "gemini-2.5-flash".to_string(),
            vlm_delay_seconds: 60.0,
            safety_delay_seconds: 30.0,
            max_items_per_run: None,
            gatekeeper_char_limit: 25_000,
        }
    }
}

impl Config {
    /// Load configuration from `explicit`, the working directory or the user
    /// config directory; writes a default file there when none exists.
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(PipelineError::Configuration(format!(
                    "config file not found: {}",
                    path.display()
                ))
                .into());
            }
            return Self::load_from(path);
        }

        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Self::default();
            config.save(&config_path).await?;
            tracing::info!("Wrote default configuration to {}", config_path.display());
            Ok(config)
        }
    }

    /// Parse and validate one config file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs_err::read_to_string(path).context("Failed to read config file")?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs_err::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        fs_err::write(path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Get configuration file path
    pub fn config_path() -> Result<PathBuf> {
        // A config in the working directory wins
        let local_config = PathBuf::from(CONFIG_FILE);
        if local_config.exists() {
            return Ok(local_config);
        }

        let config_dir = dirs::config_dir().context("Could not determine config directory")?;

        Ok(config_dir.join("video-curation-pipeline").join(CONFIG_FILE))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let delays = [
            ("download.delay_seconds", self.download.delay_seconds),
            ("download.max_duration_seconds", self.download.max_duration_seconds),
            ("refiner.api_call_delay_seconds", self.refiner.api_call_delay_seconds),
            ("refiner.retry_backoff_seconds", self.refiner.retry_backoff_seconds),
            ("gemini.vlm_delay_seconds", self.gemini.vlm_delay_seconds),
            ("gemini.safety_delay_seconds", self.gemini.safety_delay_seconds),
        ];
        for (name, value) in delays {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(format!("{} must be a non-negative number", name)));
            }
        }

        let models = [
            ("refiner.model", &self.refiner.model),
            ("gemini.gatekeeper_model", &self.gemini.gatekeeper_model),
            ("gemini.generator_model", &self.gemini.generator_model),
            ("gemini.safety_model", &self.gemini.safety_model),
            ("whisper.model_size", &self.whisper.model_size),
        ];
        for (name, value) in models {
            if value.trim().is_empty() {
                return Err(invalid(format!("{} must not be empty", name)));
            }
        }

        if self.http_timeout_seconds == 0 {
            return Err(invalid("http_timeout_seconds must be positive".to_string()));
        }
        if self.gemini.gatekeeper_char_limit == 0 {
            return Err(invalid("gemini.gatekeeper_char_limit must be positive".to_string()));
        }

        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    /// Display current configuration
    pub fn display(&self) {
        println!("Current Configuration:");
        println!("  Videos: {}", self.directories.videos.display());
        println!("  Audio: {}", self.directories.audio.display());
        println!("  Transcripts: {}", self.directories.transcripts.display());
        println!("  Refined: {}", self.directories.refined_transcripts.display());
        println!("  VLM dataset: {}", self.directories.vlm_dataset.display());
        println!("  Adverse events: {}", self.directories.adverse_events.display());
        println!("  Links file: {}", self.files.video_links.display());
        println!("  Max duration: {}s", self.download.max_duration_seconds);
        println!("  Whisper: {} ({})", self.whisper.command, self.whisper.model_size);
        println!("  Refiner: {} @ {}", self.refiner.model, self.refiner.base_url);
        println!(
            "  Gemini: gatekeeper={} generator={} safety={}",
            self.gemini.gatekeeper_model, self.gemini.generator_model, self.gemini.safety_model
        );
    }
}

/// Read an API key from the environment variable `name`
pub fn api_key(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(PipelineError::Configuration(format!("environment variable {} is not set", name)).into()),
    }
}

/// Convert a seconds setting into a `Duration`
pub fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

fn invalid(message: String) -> anyhow::Error {
    PipelineError::Configuration(message).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.gemini.gatekeeper_char_limit, 25_000);
        assert_eq!(config.refiner.retry_backoff_seconds, 10.0);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs_err::write(
            &path,
            "http_timeout_seconds: 30\nrefiner:\n  model: llama-4\ndownload:\n  max_duration_seconds: 600\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.refiner.model, "llama-4");
        assert_eq!(config.refiner.api_key_env, "CEREBRAS_API_KEY");
        assert_eq!(config.download.max_duration_seconds, 600.0);
        assert_eq!(config.download.delay_seconds, 1.0);
        assert_eq!(config.directories.videos, PathBuf::from("videos"));
    }

    #[test]
    fn test_validation_rejects_negative_delay() {
        let mut config = Config::default();
        config.gemini.vlm_delay_seconds = -1.0;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_validation_rejects_empty_model() {
        let mut config = Config::default();
        config.gemini.generator_model = "  ".into();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_explicit_path_must_exist() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(Config::load(Some(&missing)).await.is_err());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = Config::default();
        config.gemini.max_items_per_run = Some(3);
        config.save(&path).await.unwrap();

        let loaded = Config::load(Some(&path)).await.unwrap();
        assert_eq!(loaded.gemini.max_items_per_run, Some(3));
    }

    #[test]
    fn test_missing_api_key_is_configuration_error() {
        let err = api_key("VIDEO_CURATION_TEST_UNSET_KEY").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Configuration(_))
        ));
    }
}
