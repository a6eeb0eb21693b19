use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use super::prompts;
use super::transcribe::{files_with_extension, require_dir};
use crate::collaborators::{ChatModel, Segment};
use crate::engine::{
    write_atomic, Completion, LedgerStatus, Metrics, Outcome, Stage, StageSettings,
    StatusVocabulary, WorkItem,
};
use crate::utils::{find_matching_video, format_mm_ss};
use crate::{PipelineError, Result};

const THINK_END: &str = "</think>";

pub fn vocabulary() -> StatusVocabulary {
    StatusVocabulary::new(LedgerStatus::Success, LedgerStatus::Error)
}

/// Corrects raw transcripts with a chat model and renders them as timed text
pub struct RefineStage {
    settings: StageSettings,
    transcripts_dir: PathBuf,
    videos_dir: PathBuf,
    model: Arc<dyn ChatModel>,
}

/// Serialized transcript sent to the model
pub struct RefineInput {
    payload: String,
}

impl RefineStage {
    pub fn new(
        settings: StageSettings,
        transcripts_dir: PathBuf,
        videos_dir: PathBuf,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            settings,
            transcripts_dir,
            videos_dir,
            model,
        }
    }

    fn full_responses_dir(&self) -> PathBuf {
        self.settings.output_dir.join("full_responses")
    }

    fn archive_response(&self, item: &WorkItem, raw: &str) {
        let path = self
            .full_responses_dir()
            .join(format!("{}_full_response.txt", item.stable_id));
        if let Err(e) = write_atomic(&path, raw) {
            tracing::warn!("{}: could not archive raw response: {:#}", item.stable_id, e);
        }
    }
}

/// Cut reasoning and chatter from a model reply, keeping the outermost `[...]`
pub fn extract_json_array(raw: &str) -> &str {
    let after_think = match raw.split_once(THINK_END) {
        Some((_, rest)) => rest,
        None => raw,
    }
    .trim();

    match (after_think.find('['), after_think.rfind(']')) {
        (Some(start), Some(end)) if end > start => &after_think[start..=end],
        _ => after_think,
    }
}

/// Parse the refined segment list; entries missing a field are dropped
pub fn parse_segments(raw: &str) -> Result<Vec<Segment>> {
    let values: Vec<Value> = serde_json::from_str(extract_json_array(raw))
        .context("Response is not a JSON array")?;

    Ok(values
        .iter()
        .filter_map(|value| {
            Some(Segment {
                start: value.get("start")?.as_f64()?,
                end: value.get("end")?.as_f64()?,
                text: value.get("text")?.as_str()?.trim().to_string(),
            })
        })
        .collect())
}

/// `[MM:SS - MM:SS]: text`, one line per segment
pub fn format_segments(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| format!("[{} - {}]: {}", format_mm_ss(s.start), format_mm_ss(s.end), s.text))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Stage for RefineStage {
    type Input = RefineInput;
    type Output = Vec<Segment>;

    fn settings(&self) -> &StageSettings {
        &self.settings
    }

    fn metric_columns(&self) -> &'static [&'static str] {
        &[
            "video_name",
            "transcript_name",
            "total_characters",
            "total_words",
            "video_found",
        ]
    }

    async fn prepare(&self) -> Result<()> {
        require_dir(&self.transcripts_dir, "transcripts directory")?;
        fs_err::create_dir_all(self.full_responses_dir())?;
        Ok(())
    }

    async fn candidates(&self) -> Result<Vec<WorkItem>> {
        Ok(files_with_extension(&self.transcripts_dir, "json")?
            .into_iter()
            .map(WorkItem::new)
            .collect())
    }

    async fn load_input(&self, item: &WorkItem) -> Result<RefineInput> {
        let path = self.transcripts_dir.join(&item.raw_name);
        let content = fs_err::read_to_string(&path)?;
        let segments: Vec<Segment> = serde_json::from_str(&content)
            .map_err(|e| PipelineError::DataIntegrity(format!("{}: {}", path.display(), e)))?;

        if segments.is_empty() {
            return Err(PipelineError::DataIntegrity(format!(
                "{} has no segments",
                path.display()
            ))
            .into());
        }

        Ok(RefineInput {
            payload: serde_json::to_string_pretty(&segments)?,
        })
    }

    fn fingerprint(&self, input: &RefineInput) -> Option<String> {
        Some(Uuid::new_v5(&Uuid::NAMESPACE_OID, input.payload.as_bytes()).to_string())
    }

    async fn call(&self, item: &WorkItem, input: &RefineInput) -> Outcome<Vec<Segment>> {
        let raw = match self.model.complete(prompts::TRANSCRIPT_EDITOR, &input.payload).await {
            Ok(raw) => raw,
            Err(e) => return Outcome::from_error(&e),
        };

        self.archive_response(item, &raw);

        match parse_segments(&raw) {
            Ok(segments) => Outcome::Success(segments),
            Err(e) => Outcome::malformed(format!("{:#}", e)),
        }
    }

    async fn complete(&self, _item: &WorkItem, segments: Vec<Segment>) -> Result<Completion> {
        let text = format_segments(&segments);
        let total_words: usize = segments.iter().map(|s| s.text.split_whitespace().count()).sum();

        let metrics = Metrics::from([
            ("total_characters".to_string(), text.chars().count().to_string()),
            ("total_words".to_string(), total_words.to_string()),
        ]);

        Ok(Completion::new(LedgerStatus::Success)
            .with_metrics(metrics)
            .with_artifact(text))
    }

    fn item_metrics(&self, item: &WorkItem) -> Metrics {
        let video = find_matching_video(&self.videos_dir, &item.stable_id);

        Metrics::from([
            (
                "video_name".to_string(),
                video.clone().unwrap_or_else(|| "NOT_FOUND".to_string()),
            ),
            ("transcript_name".to_string(), format!("{}.txt", item.stable_id)),
            ("video_found".to_string(), video.is_some().to_string()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MockChatModel;
    use crate::engine::{read_entries, ExecutionContext, ManualClock, RetryPolicy, StageExecutor};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_extract_json_array_drops_reasoning() {
        let raw = "<think>maybe [this]?</think>\nHere you go: [{\"a\": 1}] thanks";
        assert_eq!(extract_json_array(raw), "[{\"a\": 1}]");
        assert_eq!(extract_json_array("no brackets"), "no brackets");
    }

    #[test]
    fn test_parse_segments_skips_incomplete_entries() {
        let raw = r#"[{"start": 0.0, "end": 4.2, "text": " Main incision. "}, {"start": 5.0, "text": "lost"}]"#;
        assert_eq!(
            parse_segments(raw).unwrap(),
            vec![Segment { start: 0.0, end: 4.2, text: "Main incision.".into() }]
        );
        assert!(parse_segments("I cannot help with that").is_err());
    }

    #[test]
    fn test_format_segments() {
        let segments = vec![
            Segment { start: 0.0, end: 4.2, text: "Main incision.".into() },
            Segment { start: 65.0, end: 70.9, text: "Rhexis.".into() },
        ];
        assert_eq!(
            format_segments(&segments),
            "[00:00 - 00:04]: Main incision.\n[01:05 - 01:10]: Rhexis."
        );
    }

    fn setup(root: &Path) -> StageSettings {
        fs_err::create_dir_all(root.join("transcripts")).unwrap();
        fs_err::create_dir_all(root.join("videos")).unwrap();
        StageSettings {
            name: "refine",
            ledger_path: root.join("refined/refinement_log.csv"),
            output_dir: root.join("refined"),
            artifact_extension: Some("txt"),
            aggregate_file: None,
            delay: Duration::from_secs(2),
            retry: RetryPolicy::BlockUntilResolved {
                backoff: Duration::from_secs(10),
            },
            max_items: None,
            vocabulary: vocabulary(),
        }
    }

    #[tokio::test]
    async fn test_refine_writes_text_and_ledger_metrics() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let settings = setup(root);
        fs_err::write(
            root.join("transcripts/case1.json"),
            r#"[{"start": 0.0, "end": 3.0, "text": "insision made"}]"#,
        )
        .unwrap();
        fs_err::write(root.join("videos/Case1.mp4"), "").unwrap();

        let mut model = MockChatModel::new();
        model.expect_complete().times(1).returning(|_, _| {
            Ok("<think>fix spelling</think>[{\"start\": 0.0, \"end\": 3.0, \"text\": \"Incision made.\"}]".into())
        });

        let stage = RefineStage::new(settings, root.join("transcripts"), root.join("videos"), Arc::new(model));
        let context = ExecutionContext::new(Arc::new(ManualClock::new()));
        let report = StageExecutor::new(&stage, &context).run().await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(
            fs_err::read_to_string(root.join("refined/case1.txt")).unwrap(),
            "[00:00 - 00:03]: Incision made."
        );
        assert!(root.join("refined/full_responses/case1_full_response.txt").exists());

        let entries = read_entries(&root.join("refined/refinement_log.csv")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].metrics["video_name"], "Case1.mp4");
        assert_eq!(entries[0].metrics["video_found"], "true");
        assert_eq!(entries[0].metrics["transcript_name"], "case1.txt");
        assert_eq!(entries[0].metrics["total_words"], "2");
    }

    #[tokio::test]
    async fn test_oversized_transcript_is_not_resubmitted() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let settings = setup(root);
        fs_err::write(
            root.join("transcripts/long.json"),
            r#"[{"start": 0.0, "end": 3.0, "text": "very long"}]"#,
        )
        .unwrap();

        let mut model = MockChatModel::new();
        model
            .expect_complete()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("HTTP 400: context_length_exceeded")));

        let stage = RefineStage::new(settings, root.join("transcripts"), root.join("videos"), Arc::new(model));
        let context = ExecutionContext::new(Arc::new(ManualClock::new()));

        let first = StageExecutor::new(&stage, &context).run().await.unwrap();
        assert_eq!(first.errored, 1);
        let second = StageExecutor::new(&stage, &context).run().await.unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(second.calls, 0);

        let entries = read_entries(&root.join("refined/refinement_log.csv")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, LedgerStatus::InputTooLarge);
        assert_eq!(entries[0].metrics["video_name"], "NOT_FOUND");
        assert!(entries[0].input_fingerprint.is_some());
    }

    #[tokio::test]
    async fn test_empty_transcript_is_recorded_without_a_call() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let settings = setup(root);
        fs_err::write(root.join("transcripts/silent.json"), "[]").unwrap();

        let mut model = MockChatModel::new();
        model.expect_complete().never();

        let stage = RefineStage::new(settings, root.join("transcripts"), root.join("videos"), Arc::new(model));
        let context = ExecutionContext::new(Arc::new(ManualClock::new()));
        let report = StageExecutor::new(&stage, &context).run().await.unwrap();

        assert_eq!(report.errored, 1);
        let entries = read_entries(&root.join("refined/refinement_log.csv")).unwrap();
        assert_eq!(entries[0].status, LedgerStatus::Error);
        assert!(entries[0].detail.contains("no segments"));
    }

    #[tokio::test]
    async fn test_missing_transcripts_directory_is_a_setup_problem() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let mut model = MockChatModel::new();
        model.expect_complete().never();

        let settings = setup(root);
        fs_err::remove_dir(root.join("transcripts")).unwrap();

        let stage = RefineStage::new(settings, root.join("transcripts"), root.join("videos"), Arc::new(model));
        let context = ExecutionContext::new(Arc::new(ManualClock::new()));
        let err = StageExecutor::new(&stage, &context).run().await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Configuration(reason)) if reason.contains("transcripts directory")
        ));
        assert!(!root.join("refined/refinement_log.csv").exists());
    }
}
