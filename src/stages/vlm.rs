use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::prompts;
use crate::collaborators::{GenerativeModel, Part};
use crate::engine::{
    Completion, LedgerStatus, Metrics, Outcome, Stage, StageSettings, StatusVocabulary, Table,
    WorkItem,
};
use crate::{PipelineError, Result};

pub fn vocabulary() -> StatusVocabulary {
    StatusVocabulary::new(LedgerStatus::Accepted, LedgerStatus::ErrorGeneration)
}

/// Screens refined transcripts and annotates the accepted videos step by step
pub struct VlmStage {
    settings: StageSettings,
    summary_file: PathBuf,
    refined_dir: PathBuf,
    model: Arc<dyn GenerativeModel>,
    gatekeeper_model: String,
    generator_model: String,
    char_limit: usize,
}

/// Gatekeeper answer; missing fields fall back to a rejection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityVerdict {
    #[serde(default = "default_decision")]
    pub decision: String,

    #[serde(default)]
    pub confidence_score: Value,

    #[serde(default)]
    pub reasoning: String,
}

fn default_decision() -> String {
    "NO".to_string()
}

impl QualityVerdict {
    pub fn accepted(&self) -> bool {
        self.decision.trim().eq_ignore_ascii_case("YES")
    }

    fn metrics(&self) -> Metrics {
        Metrics::from([
            ("decision".to_string(), self.decision.trim().to_uppercase()),
            ("confidence".to_string(), scalar(&self.confidence_score)),
        ])
    }
}

/// A gate verdict plus the annotations of the accepted video
pub struct Annotated {
    verdict: QualityVerdict,
    annotations: Value,
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// First `limit` characters of `text`
fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

impl VlmStage {
    pub fn new(
        settings: StageSettings,
        summary_file: PathBuf,
        refined_dir: PathBuf,
        model: Arc<dyn GenerativeModel>,
        gatekeeper_model: impl Into<String>,
        generator_model: impl Into<String>,
        char_limit: usize,
    ) -> Self {
        Self {
            settings,
            summary_file,
            refined_dir,
            model,
            gatekeeper_model: gatekeeper_model.into(),
            generator_model: generator_model.into(),
            char_limit,
        }
    }

    /// The transcript as named in the summary, with `.txt`, or by stable id
    fn locate_transcript(&self, item: &WorkItem) -> Option<PathBuf> {
        let named = item.meta("transcript_name").trim();
        let mut options = Vec::new();

        if !named.is_empty() {
            options.push(self.refined_dir.join(named));
            if let Some(stem) = Path::new(named).file_stem() {
                options.push(self.refined_dir.join(format!("{}.txt", stem.to_string_lossy())));
            }
        }
        options.push(self.refined_dir.join(format!("{}.txt", item.stable_id)));

        options.into_iter().find(|path| path.is_file())
    }

    async fn check_quality(&self, transcript: &str) -> Outcome<QualityVerdict> {
        let prompt = prompts::with_transcript(
            prompts::GATEKEEPER,
            truncate_chars(transcript, self.char_limit),
        );

        let raw = match self
            .model
            .generate_json(&self.gatekeeper_model, &[Part::Text(prompt)])
            .await
        {
            Ok(raw) => raw,
            Err(e) => return Outcome::from_error(&e),
        };

        match serde_json::from_str::<QualityVerdict>(&raw) {
            Ok(verdict) => Outcome::Success(verdict),
            Err(e) => Outcome::malformed(format!("gatekeeper answer is not a verdict: {}", e)),
        }
    }

    async fn annotate(&self, url: &str, transcript: &str) -> Outcome<Value> {
        let parts = [
            Part::FileUri(url.to_string()),
            Part::Text(prompts::with_transcript(prompts::STEP_ANNOTATOR, transcript)),
        ];

        let raw = match self.model.generate_json(&self.generator_model, &parts).await {
            Ok(raw) => raw,
            Err(e) => return Outcome::from_error(&e),
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(steps @ Value::Array(_)) => Outcome::Success(steps),
            Ok(_) => Outcome::malformed("annotations are not a JSON array"),
            Err(e) => Outcome::malformed(format!("annotations are not valid JSON: {}", e)),
        }
    }
}

#[async_trait]
impl Stage for VlmStage {
    type Input = String;
    type Output = Annotated;

    fn settings(&self) -> &StageSettings {
        &self.settings
    }

    fn metric_columns(&self) -> &'static [&'static str] {
        &[
            "original_filename",
            "decision",
            "confidence",
            "video_title",
            "url",
            "download_date",
        ]
    }

    async fn prepare(&self) -> Result<()> {
        if !self.summary_file.exists() {
            return Err(PipelineError::Configuration(format!(
                "dataset summary not found: {}",
                self.summary_file.display()
            ))
            .into());
        }
        Ok(())
    }

    async fn candidates(&self) -> Result<Vec<WorkItem>> {
        let summary = Table::from_csv(&self.summary_file)?;

        Ok(summary
            .rows
            .iter()
            .filter(|row| {
                let present = |c: &str| row.get(c).map(|v| !v.trim().is_empty()).unwrap_or(false);
                present("video_name") && present("url")
            })
            .map(|row| {
                let mut item = WorkItem::new(row["video_name"].trim());
                for column in ["url", "title", "download_date", "transcript_name"] {
                    if let Some(value) = row.get(column) {
                        item.metadata.insert(column.to_string(), value.trim().to_string());
                    }
                }
                item
            })
            .collect())
    }

    async fn load_input(&self, item: &WorkItem) -> Result<String> {
        let path = self.locate_transcript(item).ok_or_else(|| {
            PipelineError::DataIntegrity(format!("no refined transcript for {}", item.stable_id))
        })?;
        Ok(fs_err::read_to_string(path)?)
    }

    async fn call(&self, item: &WorkItem, transcript: &String) -> Outcome<Annotated> {
        let verdict = match self.check_quality(transcript).await {
            Outcome::Success(verdict) => verdict,
            Outcome::TransientFailure(reason) => return Outcome::TransientFailure(reason),
            Outcome::PermanentFailure(failure) => return Outcome::PermanentFailure(failure),
        };

        if !verdict.accepted() {
            let reason = if verdict.reasoning.is_empty() {
                "gatekeeper declined".to_string()
            } else {
                verdict.reasoning.clone()
            };
            return Outcome::rejected(reason, verdict.metrics());
        }

        tracing::info!("{}: annotating '{}'", item.stable_id, item.meta("title"));
        self.annotate(item.meta("url"), transcript)
            .await
            .map(|annotations| Annotated { verdict, annotations })
    }

    async fn complete(&self, item: &WorkItem, output: Annotated) -> Result<Completion> {
        let Annotated { verdict, annotations } = output;

        let record = json!({
            "video_id": item.stable_id,
            "original_filename": item.raw_name,
            "status": "SUCCESS",
            "video_url": item.meta("url"),
            "video_title": item.meta("title"),
            "download_date": item.meta("download_date"),
            "transcript_quality_check": verdict,
            "vlm_annotations": annotations,
        });

        Ok(Completion::new(LedgerStatus::Accepted)
            .with_metrics(verdict.metrics())
            .with_detail(verdict.reasoning.clone())
            .with_artifact(serde_json::to_string(&record)?))
    }

    fn item_metrics(&self, item: &WorkItem) -> Metrics {
        Metrics::from([
            ("original_filename".to_string(), item.raw_name.clone()),
            ("video_title".to_string(), item.meta("title").to_string()),
            ("url".to_string(), item.meta("url").to_string()),
            ("download_date".to_string(), item.meta("download_date").to_string()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MockGenerativeModel;
    use crate::engine::{read_entries, ExecutionContext, ManualClock, RetryPolicy, StageExecutor};
    use std::time::Duration;
    use tempfile::TempDir;

    const SUMMARY: &str = "title,video_name,transcript_name,audio_name,duration_seconds,word_count,channel_name,url,download_name,download_date\n\
        Good case,good.mp4,good.txt,good.wav,300,50,Eye,https://y/good,good.mp4,2024-01-01\n\
        Chatter,chat.mp4,chat.txt,chat.wav,200,10,Eye,https://y/chat,chat.mp4,2024-01-02\n\
        No url,nourl.mp4,nourl.txt,nourl.wav,100,5,Eye,,nourl.mp4,2024-01-03\n";

    fn stage(root: &Path, model: MockGenerativeModel) -> VlmStage {
        VlmStage::new(
            StageSettings {
                name: "vlm",
                ledger_path: root.join("vlm/vlm_log.csv"),
                output_dir: root.join("vlm"),
                artifact_extension: Some("jsonl"),
                aggregate_file: Some(root.join("vlm/vlm_dataset_all.jsonl")),
                delay: Duration::from_secs(60),
                retry: RetryPolicy::SingleAttempt,
                max_items: None,
                vocabulary: vocabulary(),
            },
            root.join("summary.csv"),
            root.join("refined"),
            Arc::new(model),
            "gate",
            "gen",
            40,
        )
    }

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("ééééé", 2), "éé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_verdict_defaults_to_rejection() {
        let verdict: QualityVerdict = serde_json::from_str("{}").unwrap();
        assert!(!verdict.accepted());
        let verdict: QualityVerdict = serde_json::from_str(r#"{"decision": "yes"}"#).unwrap();
        assert!(verdict.accepted());
    }

    #[tokio::test]
    async fn test_gatekeeper_and_generator() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs_err::write(root.join("summary.csv"), SUMMARY).unwrap();
        fs_err::create_dir_all(root.join("refined")).unwrap();
        fs_err::write(root.join("refined/good.txt"), "[00:00 - 00:05]: Clear corneal incision with keratome.").unwrap();
        fs_err::write(root.join("refined/chat.txt"), "[00:00 - 00:05]: What's for lunch?").unwrap();

        let mut model = MockGenerativeModel::new();
        model
            .expect_generate_json()
            .withf(|model, _| model == "gate")
            .times(2)
            .returning(|_, parts| {
                let Part::Text(prompt) = &parts[0] else { unreachable!() };
                if prompt.contains("Clear corn") && !prompt.contains("with keratome") {
                    Ok(r#"{"decision": "YES", "confidence_score": 0.9, "reasoning": "surgical narration"}"#.into())
                } else {
                    Ok(r#"{"decision": "NO", "confidence_score": 0.8, "reasoning": "small talk"}"#.into())
                }
            });
        model
            .expect_generate_json()
            .withf(|model, parts| model == "gen" && parts[0] == Part::FileUri("https://y/good".into()))
            .times(1)
            .returning(|_, _| Ok(r#"[{"step_number": 1, "timestamp_start": "00:00", "timestamp_end": "00:05", "visual_description": "incision"}]"#.into()));

        let stage = stage(root, model);
        let clock = Arc::new(ManualClock::new());
        let context = ExecutionContext::new(clock.clone());
        let report = StageExecutor::new(&stage, &context).run().await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(60)]);

        let record: Value =
            serde_json::from_str(&fs_err::read_to_string(root.join("vlm/good.jsonl")).unwrap()).unwrap();
        assert_eq!(record["video_id"], "good");
        assert_eq!(record["original_filename"], "good.mp4");
        assert_eq!(record["status"], "SUCCESS");
        assert_eq!(record["video_url"], "https://y/good");
        assert_eq!(record["transcript_quality_check"]["decision"], "YES");
        assert_eq!(record["vlm_annotations"][0]["step_number"], 1);
        assert!(!root.join("vlm/chat.jsonl").exists());

        let aggregate = fs_err::read_to_string(root.join("vlm/vlm_dataset_all.jsonl")).unwrap();
        assert_eq!(aggregate.lines().count(), 1);

        let entries = read_entries(&root.join("vlm/vlm_log.csv")).unwrap();
        let chat = entries.iter().find(|e| e.item_id == "chat").unwrap();
        assert_eq!(chat.status, LedgerStatus::Rejected);
        assert_eq!(chat.metrics["decision"], "NO");
        assert_eq!(chat.metrics["confidence"], "0.8");
        assert_eq!(chat.detail, "small talk");
        let good = entries.iter().find(|e| e.item_id == "good").unwrap();
        assert_eq!(good.status, LedgerStatus::Accepted);
        assert_eq!(good.metrics["video_title"], "Good case");
    }

    #[tokio::test]
    async fn test_generator_failure_is_retried_next_run() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs_err::write(root.join("summary.csv"), SUMMARY.lines().take(2).collect::<Vec<_>>().join("\n")).unwrap();
        fs_err::create_dir_all(root.join("refined")).unwrap();
        fs_err::write(root.join("refined/good.txt"), "[00:00 - 00:05]: Incision.").unwrap();

        let mut model = MockGenerativeModel::new();
        model
            .expect_generate_json()
            .withf(|model, _| model == "gate")
            .returning(|_, _| Ok(r#"{"decision": "YES", "confidence_score": 0.9, "reasoning": "ok"}"#.into()));
        model
            .expect_generate_json()
            .withf(|model, _| model == "gen")
            .times(1)
            .returning(|_, _| Ok(r#"{"steps": []}"#.into()));

        let stage = stage(root, model);
        let context = ExecutionContext::new(Arc::new(ManualClock::new()));
        let report = StageExecutor::new(&stage, &context).run().await.unwrap();
        assert_eq!(report.errored, 1);

        let entries = read_entries(&root.join("vlm/vlm_log.csv")).unwrap();
        assert_eq!(entries[0].status, LedgerStatus::ErrorGeneration);
        assert!(!root.join("vlm/good.jsonl").exists());
    }

    #[tokio::test]
    async fn test_missing_transcript_never_calls_the_model() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs_err::write(root.join("summary.csv"), SUMMARY.lines().take(2).collect::<Vec<_>>().join("\n")).unwrap();

        let mut model = MockGenerativeModel::new();
        model.expect_generate_json().never();

        let stage = stage(root, model);
        let context = ExecutionContext::new(Arc::new(ManualClock::new()));
        let report = StageExecutor::new(&stage, &context).run().await.unwrap();
        assert_eq!(report.errored, 1);
        assert_eq!(report.calls, 0);
    }
}
