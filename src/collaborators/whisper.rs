use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tempfile::TempDir;
use tokio::process::Command;

use super::{Segment, SpeechToText};
use crate::{PipelineError, Result};

/// Whisper JSON output format
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    start: f64,
    end: f64,
    text: String,
}

/// Speech-to-text through the `whisper` command line tool
pub struct WhisperCli {
    command: String,
    model_size: String,
    device: Option<String>,
}

impl WhisperCli {
    pub fn new(command: impl Into<String>, model_size: impl Into<String>, device: Option<String>) -> Self {
        Self {
            command: command.into(),
            model_size: model_size.into(),
            device,
        }
    }
}

/// Round to one decimal place, as stored in transcript files
fn round_tenth(seconds: f64) -> f64 {
    (seconds * 10.0).round() / 10.0
}

fn parse_output(json: &str) -> Result<Vec<Segment>> {
    let output: WhisperOutput =
        serde_json::from_str(json).context("Failed to parse whisper JSON output")?;

    Ok(output
        .segments
        .into_iter()
        .map(|seg| Segment {
            start: round_tenth(seg.start),
            end: round_tenth(seg.end),
            text: seg.text.trim().to_string(),
        })
        .collect())
}

#[async_trait]
impl SpeechToText for WhisperCli {
    async fn ensure_available(&self) -> Result<()> {
        let available = Command::new(&self.command)
            .arg("--help")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false);

        if !available {
            return Err(PipelineError::Configuration(format!("{} not found on PATH", self.command)).into());
        }
        Ok(())
    }

    async fn transcribe(&self, audio: &Path) -> Result<Vec<Segment>> {
        let work_dir = TempDir::new().context("Failed to create temporary directory")?;

        let mut command = Command::new(&self.command);
        command
            .arg(audio)
            .args(["--model", &self.model_size, "--output_format", "json", "--verbose", "False"])
            .arg("--output_dir")
            .arg(work_dir.path())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        if let Some(device) = &self.device {
            command.args(["--device", device]);
            if device == "cpu" {
                command.args(["--fp16", "False"]);
            }
        }

        tracing::debug!("Running {} on {}", self.command, audio.display());
        let output = command.output().await?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("whisper failed: {}", error.trim());
        }

        let stem = audio
            .file_stem()
            .ok_or_else(|| anyhow::anyhow!("Audio path has no file name: {}", audio.display()))?;
        let json_path = work_dir.path().join(format!("{}.json", stem.to_string_lossy()));
        let json = fs_err::read_to_string(&json_path)?;

        parse_output(&json)
    }
}
