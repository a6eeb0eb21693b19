use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::collaborators::{Segment, SpeechToText};
use crate::engine::{
    Completion, LedgerStatus, Metrics, Outcome, Stage, StageSettings, StatusVocabulary, WorkItem,
};
use crate::{PipelineError, Result};

pub fn vocabulary() -> StatusVocabulary {
    StatusVocabulary::new(LedgerStatus::Success, LedgerStatus::Error)
}

/// Turns every `.wav` in the audio directory into a JSON segment list
pub struct TranscribeStage {
    settings: StageSettings,
    audio_dir: PathBuf,
    engine: Arc<dyn SpeechToText>,
}

impl TranscribeStage {
    pub fn new(settings: StageSettings, audio_dir: PathBuf, engine: Arc<dyn SpeechToText>) -> Self {
        Self {
            settings,
            audio_dir,
            engine,
        }
    }
}

/// A stage input directory that must exist before the stage can run
pub(crate) fn require_dir(dir: &std::path::Path, what: &str) -> Result<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(PipelineError::Configuration(format!("{} not found: {}", what, dir.display())).into())
    }
}

/// File names in `dir` ending in `.ext`, sorted
pub(crate) fn files_with_extension(dir: &std::path::Path, ext: &str) -> Result<Vec<String>> {
    require_dir(dir, "input directory")?;

    let mut names: Vec<String> = fs_err::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(ext))
        .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    names.sort();
    Ok(names)
}

#[async_trait]
impl Stage for TranscribeStage {
    type Input = PathBuf;
    type Output = Vec<Segment>;

    fn settings(&self) -> &StageSettings {
        &self.settings
    }

    fn metric_columns(&self) -> &'static [&'static str] {
        &["segment_count", "audio_seconds"]
    }

    async fn prepare(&self) -> Result<()> {
        self.engine.ensure_available().await?;
        require_dir(&self.audio_dir, "audio directory")
    }

    async fn candidates(&self) -> Result<Vec<WorkItem>> {
        Ok(files_with_extension(&self.audio_dir, "wav")?
            .into_iter()
            .map(WorkItem::new)
            .collect())
    }

    async fn load_input(&self, item: &WorkItem) -> Result<PathBuf> {
        let path = self.audio_dir.join(&item.raw_name);
        fs_err::metadata(&path).context("Audio file disappeared")?;
        Ok(path)
    }

    async fn call(&self, _item: &WorkItem, audio: &PathBuf) -> Outcome<Vec<Segment>> {
        self.engine.transcribe(audio).await.into()
    }

    async fn complete(&self, _item: &WorkItem, segments: Vec<Segment>) -> Result<Completion> {
        let audio_seconds = segments.last().map(|s| s.end).unwrap_or(0.0);
        let json = serde_json::to_string_pretty(&segments)?;

        let metrics = Metrics::from([
            ("segment_count".to_string(), segments.len().to_string()),
            ("audio_seconds".to_string(), format!("{:.1}", audio_seconds)),
        ]);

        Ok(Completion::new(LedgerStatus::Success)
            .with_metrics(metrics)
            .with_artifact(json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MockSpeechToText;
    use crate::engine::{read_entries, ExecutionContext, ManualClock, RetryPolicy, StageExecutor};
    use std::time::Duration;
    use tempfile::TempDir;

    fn settings(root: &std::path::Path) -> StageSettings {
        StageSettings {
            name: "transcribe",
            ledger_path: root.join("transcripts/transcription_log.csv"),
            output_dir: root.join("transcripts"),
            artifact_extension: Some("json"),
            aggregate_file: None,
            delay: Duration::ZERO,
            retry: RetryPolicy::SingleAttempt,
            max_items: None,
            vocabulary: vocabulary(),
        }
    }

    #[tokio::test]
    async fn test_transcripts_are_written_per_audio_file() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs_err::create_dir_all(root.join("audio")).unwrap();
        fs_err::write(root.join("audio/a.wav"), "").unwrap();
        fs_err::write(root.join("audio/b.wav"), "").unwrap();
        fs_err::write(root.join("audio/readme.txt"), "").unwrap();

        let mut engine = MockSpeechToText::new();
        engine.expect_ensure_available().returning(|| Ok(()));
        engine.expect_transcribe().times(2).returning(|audio| {
            if audio.ends_with("b.wav") {
                anyhow::bail!("whisper crashed")
            }
            Ok(vec![
                Segment { start: 0.0, end: 2.5, text: "Incision.".into() },
                Segment { start: 2.5, end: 7.1, text: "Capsulorhexis.".into() },
            ])
        });

        let stage = TranscribeStage::new(settings(root), root.join("audio"), Arc::new(engine));
        let context = ExecutionContext::new(Arc::new(ManualClock::new()));
        let report = StageExecutor::new(&stage, &context).run().await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.errored, 1);

        let written: Vec<Segment> =
            serde_json::from_str(&fs_err::read_to_string(root.join("transcripts/a.json")).unwrap()).unwrap();
        assert_eq!(written.len(), 2);
        assert!(!root.join("transcripts/b.json").exists());

        let entries = read_entries(&root.join("transcripts/transcription_log.csv")).unwrap();
        assert_eq!(entries[0].item_id, "a");
        assert_eq!(entries[0].metrics["segment_count"], "2");
        assert_eq!(entries[0].metrics["audio_seconds"], "7.1");
        assert_eq!(entries[1].status, LedgerStatus::Error);
    }

    #[tokio::test]
    async fn test_missing_whisper_aborts_stage() {
        let dir = TempDir::new().unwrap();
        let mut engine = MockSpeechToText::new();
        engine
            .expect_ensure_available()
            .returning(|| Err(crate::PipelineError::Configuration("whisper not found".into()).into()));
        engine.expect_transcribe().never();

        let stage = TranscribeStage::new(settings(dir.path()), dir.path().join("audio"), Arc::new(engine));
        let context = ExecutionContext::new(Arc::new(ManualClock::new()));
        assert!(StageExecutor::new(&stage, &context).run().await.is_err());
    }

    #[tokio::test]
    async fn test_missing_audio_directory_is_a_setup_problem() {
        let dir = TempDir::new().unwrap();
        let mut engine = MockSpeechToText::new();
        engine.expect_ensure_available().returning(|| Ok(()));
        engine.expect_transcribe().never();

        let stage = TranscribeStage::new(settings(dir.path()), dir.path().join("audio"), Arc::new(engine));
        let context = ExecutionContext::new(Arc::new(ManualClock::new()));
        let err = StageExecutor::new(&stage, &context).run().await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Configuration(reason)) if reason.contains("audio directory")
        ));
        assert!(!dir.path().join("transcripts/transcription_log.csv").exists());
    }
}
