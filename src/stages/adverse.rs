use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

use super::prompts;
use crate::collaborators::{GenerativeModel, Part};
use crate::engine::{
    list_ids, Completion, LedgerStatus, Metrics, Outcome, Stage, StageSettings, StatusVocabulary,
    WorkItem,
};
use crate::{PipelineError, Result};

pub fn vocabulary() -> StatusVocabulary {
    StatusVocabulary::new(LedgerStatus::Detected, LedgerStatus::Error)
        .with_terminal(LedgerStatus::NoEvent)
}

/// Reviews annotated surgeries for intraoperative adverse events
pub struct AdverseEventStage {
    settings: StageSettings,
    vlm_dir: PathBuf,
    vlm_aggregate: PathBuf,
    model: Arc<dyn GenerativeModel>,
    safety_model: String,
}

/// An annotated record and its rendered step timeline
pub struct Surgery {
    record: Value,
    timeline: String,
}

impl Surgery {
    fn field(&self, key: &str) -> String {
        self.record
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

/// The annotated surgery paired with the events the model reported
pub struct Review {
    surgery_fields: Value,
    events: Vec<Value>,
}

/// `[start - end]: description` per annotated step
pub fn render_timeline(annotations: &[Value]) -> String {
    let text = |step: &Value, key: &str| -> String {
        match step.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    };

    let mut timeline = String::from("Surgical Steps Timeline:\n");
    for step in annotations {
        timeline.push_str(&format!(
            "[{} - {}]: {}\n",
            text(step, "timestamp_start"),
            text(step, "timestamp_end"),
            text(step, "visual_description"),
        ));
    }
    timeline
}

impl AdverseEventStage {
    pub fn new(
        settings: StageSettings,
        vlm_dir: PathBuf,
        vlm_aggregate: PathBuf,
        model: Arc<dyn GenerativeModel>,
        safety_model: impl Into<String>,
    ) -> Self {
        Self {
            settings,
            vlm_dir,
            vlm_aggregate,
            model,
            safety_model: safety_model.into(),
        }
    }
}

#[async_trait]
impl Stage for AdverseEventStage {
    type Input = Surgery;
    type Output = Review;

    fn settings(&self) -> &StageSettings {
        &self.settings
    }

    fn metric_columns(&self) -> &'static [&'static str] {
        &["event_count"]
    }

    async fn candidates(&self) -> Result<Vec<WorkItem>> {
        let mut ids: Vec<String> = list_ids(&self.vlm_dir, "jsonl", Some(&self.vlm_aggregate))?
            .into_iter()
            .collect();
        ids.sort();

        Ok(ids
            .into_iter()
            .map(|id| WorkItem::new(format!("{}.jsonl", id)))
            .collect())
    }

    async fn load_input(&self, item: &WorkItem) -> Result<Surgery> {
        let path = self.vlm_dir.join(&item.raw_name);
        let content = fs_err::read_to_string(&path)?;
        let first_line = content.lines().find(|line| !line.trim().is_empty()).unwrap_or("");

        let record: Value = serde_json::from_str(first_line)
            .map_err(|e| PipelineError::DataIntegrity(format!("{}: {}", path.display(), e)))?;

        let steps = record
            .get("vlm_annotations")
            .and_then(Value::as_array)
            .filter(|steps| !steps.is_empty())
            .ok_or_else(|| {
                PipelineError::DataIntegrity(format!("{} has no annotated steps", path.display()))
            })?;

        let timeline = render_timeline(steps);
        Ok(Surgery { record, timeline })
    }

    async fn call(&self, _item: &WorkItem, surgery: &Surgery) -> Outcome<Review> {
        let parts = [
            Part::Text(prompts::SAFETY_REVIEW.to_string()),
            Part::Text(format!("\nAnalyze this surgery:\n{}", surgery.timeline)),
        ];

        let raw = match self.model.generate_json(&self.safety_model, &parts).await {
            Ok(raw) => raw,
            Err(e) => return Outcome::from_error(&e),
        };

        let reply: Value = match serde_json::from_str(&raw) {
            Ok(reply) => reply,
            Err(e) => return Outcome::malformed(format!("safety review is not valid JSON: {}", e)),
        };

        let Some(events) = reply.get("adverse_events").and_then(Value::as_array) else {
            return Outcome::malformed("safety review has no adverse_events list");
        };

        Outcome::Success(Review {
            surgery_fields: json!({
                "video_id": surgery.field("video_id"),
                "original_filename": surgery.field("original_filename"),
                "video_url": surgery.field("video_url"),
                "video_title": surgery.field("video_title"),
                "download_date": surgery.field("download_date"),
            }),
            events: events.clone(),
        })
    }

    async fn complete(&self, item: &WorkItem, review: Review) -> Result<Completion> {
        let count = Metrics::from([("event_count".to_string(), review.events.len().to_string())]);

        if review.events.is_empty() {
            return Ok(Completion::new(LedgerStatus::NoEvent).with_metrics(count));
        }

        let field = |key: &str| review.surgery_fields.get(key).cloned().unwrap_or(Value::Null);
        let video_id = match field("video_id") {
            Value::String(id) if !id.is_empty() => id,
            _ => item.stable_id.clone(),
        };

        let record = json!({
            "video_id": video_id,
            "original_filename": field("original_filename"),
            "status": "DETECTED",
            "video_url": field("video_url"),
            "video_title": field("video_title"),
            "download_date": field("download_date"),
            "adverse_events": review.events,
        });

        Ok(Completion::new(LedgerStatus::Detected)
            .with_metrics(count)
            .with_artifact(serde_json::to_string(&record)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MockGenerativeModel;
    use crate::engine::{read_entries, ExecutionContext, ManualClock, RetryPolicy, StageExecutor};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn annotated(id: &str) -> String {
        json!({
            "video_id": id,
            "original_filename": format!("{}.mp4", id),
            "status": "SUCCESS",
            "video_url": format!("https://y/{}", id),
            "video_title": format!("Case {}", id),
            "download_date": "2024-01-01",
            "vlm_annotations": [
                {"step_number": 1, "timestamp_start": "00:00", "timestamp_end": "00:40", "visual_description": "Capsulorhexis"},
                {"step_number": 2, "timestamp_start": "00:40", "timestamp_end": "02:10", "visual_description": "Phaco with capsule tear"}
            ]
        })
        .to_string()
    }

    fn stage(root: &Path, model: MockGenerativeModel) -> AdverseEventStage {
        AdverseEventStage::new(
            StageSettings {
                name: "adverse-events",
                ledger_path: root.join("adverse/adverse_log.csv"),
                output_dir: root.join("adverse"),
                artifact_extension: Some("jsonl"),
                aggregate_file: Some(root.join("adverse/adverse_events_all.jsonl")),
                delay: Duration::from_secs(30),
                retry: RetryPolicy::SingleAttempt,
                max_items: None,
                vocabulary: vocabulary(),
            },
            root.join("vlm"),
            root.join("vlm/vlm_dataset_all.jsonl"),
            Arc::new(model),
            "safety",
        )
    }

    #[test]
    fn test_render_timeline() {
        let steps = vec![json!({"timestamp_start": "00:00", "timestamp_end": "00:40", "visual_description": "Incision"})];
        assert_eq!(render_timeline(&steps), "Surgical Steps Timeline:\n[00:00 - 00:40]: Incision\n");
    }

    #[tokio::test]
    async fn test_events_and_clean_cases() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs_err::create_dir_all(root.join("vlm")).unwrap();
        fs_err::write(root.join("vlm/a.jsonl"), annotated("a")).unwrap();
        fs_err::write(root.join("vlm/b.jsonl"), annotated("b")).unwrap();
        fs_err::write(root.join("vlm/vlm_dataset_all.jsonl"), annotated("a")).unwrap();

        let mut model = MockGenerativeModel::new();
        let mut calls = 0;
        model
            .expect_generate_json()
            .withf(|model, parts| {
                model == "safety"
                    && matches!(&parts[1], Part::Text(t) if t.contains("[00:40 - 02:10]: Phaco with capsule tear"))
            })
            .times(2)
            .returning(move |_, _| {
                calls += 1;
                if calls == 1 {
                    Ok(r#"{"adverse_events": [{"event_name": "Posterior capsule rupture", "timestamp_start": "01:30", "timestamp_end": "01:45", "reason": "vitreous visible behind the bag"}]}"#.into())
                } else {
                    Ok(r#"{"adverse_events": []}"#.into())
                }
            });

        let stage = stage(root, model);
        let context = ExecutionContext::new(Arc::new(ManualClock::new()));
        let report = StageExecutor::new(&stage, &context).run().await.unwrap();
        assert_eq!(report.succeeded, 2);

        let record: Value =
            serde_json::from_str(&fs_err::read_to_string(root.join("adverse/a.jsonl")).unwrap()).unwrap();
        assert_eq!(record["status"], "DETECTED");
        assert_eq!(record["video_url"], "https://y/a");
        assert_eq!(record["adverse_events"][0]["event_name"], "Posterior capsule rupture");
        assert!(!root.join("adverse/b.jsonl").exists());

        let entries = read_entries(&root.join("adverse/adverse_log.csv")).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, LedgerStatus::Detected);
        assert_eq!(entries[0].metrics["event_count"], "1");
        assert_eq!(entries[1].status, LedgerStatus::NoEvent);

        let rerun = StageExecutor::new(&stage, &context).run().await.unwrap();
        assert_eq!(rerun.skipped, 2);
        assert_eq!(rerun.calls, 0);
    }

    #[tokio::test]
    async fn test_record_without_steps_is_not_sent() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs_err::create_dir_all(root.join("vlm")).unwrap();
        fs_err::write(root.join("vlm/empty.jsonl"), r#"{"video_id": "empty", "vlm_annotations": []}"#).unwrap();

        let mut model = MockGenerativeModel::new();
        model.expect_generate_json().never();

        let stage = stage(root, model);
        let context = ExecutionContext::new(Arc::new(ManualClock::new()));
        let report = StageExecutor::new(&stage, &context).run().await.unwrap();
        assert_eq!(report.errored, 1);

        let entries = read_entries(&root.join("adverse/adverse_log.csv")).unwrap();
        assert_eq!(entries[0].status, LedgerStatus::Error);
        assert!(entries[0].detail.contains("no annotated steps"));
    }

    #[tokio::test]
    async fn test_reply_without_event_list_is_malformed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs_err::create_dir_all(root.join("vlm")).unwrap();
        fs_err::write(root.join("vlm/a.jsonl"), annotated("a")).unwrap();

        let mut model = MockGenerativeModel::new();
        model
            .expect_generate_json()
            .times(1)
            .returning(|_, _| Ok(r#"{"events": "none"}"#.into()));

        let stage = stage(root, model);
        let context = ExecutionContext::new(Arc::new(ManualClock::new()));
        let report = StageExecutor::new(&stage, &context).run().await.unwrap();
        assert_eq!(report.errored, 1);
        assert!(!root.join("adverse/a.jsonl").exists());
    }
}
