use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::engine::{
    Completion, LedgerStatus, Metrics, Outcome, Stage, StageSettings, StatusVocabulary, Table,
    WorkItem,
};
use crate::{PipelineError, Result};

/// File-name cells that never point at a real file
const PLACEHOLDER_NAMES: &[&str] = &["", "N/A", "FAILED", "SKIPPED_DURATION"];

pub fn vocabulary() -> StatusVocabulary {
    StatusVocabulary::new(LedgerStatus::Accepted, LedgerStatus::Error)
}

/// Removes videos longer than the configured limit.
///
/// The metadata table is left as it is; a `REJECTED` row in this stage's
/// ledger is what keeps an item out of the dataset summary.
pub struct CleanStage {
    settings: StageSettings,
    metadata_file: PathBuf,
    videos_dir: PathBuf,
    audio_dir: PathBuf,
    max_duration_seconds: f64,
}

/// Verdict for one metadata row
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Keep { duration: f64 },
    Remove { duration: f64 },
}

impl CleanStage {
    pub fn new(
        settings: StageSettings,
        metadata_file: PathBuf,
        videos_dir: PathBuf,
        audio_dir: PathBuf,
        max_duration_seconds: f64,
    ) -> Self {
        Self {
            settings,
            metadata_file,
            videos_dir,
            audio_dir,
            max_duration_seconds,
        }
    }
}

/// Non-numeric or missing durations count as zero
pub fn parse_duration(raw: &str) -> f64 {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite())
        .unwrap_or(0.0)
}

fn remove_if_present(dir: &Path, name: &str) -> Result<usize> {
    if PLACEHOLDER_NAMES.contains(&name.trim()) {
        return Ok(0);
    }

    let path = dir.join(name.trim());
    if !path.is_file() {
        tracing::debug!("Nothing to remove at {}", path.display());
        return Ok(0);
    }

    fs_err::remove_file(&path)?;
    tracing::info!("Removed {}", path.display());
    Ok(1)
}

#[async_trait]
impl Stage for CleanStage {
    type Input = ();
    type Output = Verdict;

    fn settings(&self) -> &StageSettings {
        &self.settings
    }

    fn metric_columns(&self) -> &'static [&'static str] {
        &["duration_seconds", "files_removed"]
    }

    async fn prepare(&self) -> Result<()> {
        if !self.metadata_file.exists() {
            return Err(PipelineError::Configuration(format!(
                "metadata table not found: {}",
                self.metadata_file.display()
            ))
            .into());
        }
        Ok(())
    }

    async fn candidates(&self) -> Result<Vec<WorkItem>> {
        let table = Table::from_csv(&self.metadata_file)?;

        Ok(table
            .rows
            .into_iter()
            .filter(|row| row.get("filename").map(|f| !f.trim().is_empty()).unwrap_or(false))
            .map(|row| {
                let filename = row.get("filename").cloned().unwrap_or_default();
                let mut item = WorkItem::new(filename);
                item.metadata = row;
                item
            })
            .collect())
    }

    async fn load_input(&self, _item: &WorkItem) -> Result<()> {
        Ok(())
    }

    async fn call(&self, item: &WorkItem, _input: &()) -> Outcome<Verdict> {
        let duration = parse_duration(item.meta("duration_seconds"));

        if duration > self.max_duration_seconds {
            Outcome::Success(Verdict::Remove { duration })
        } else {
            Outcome::Success(Verdict::Keep { duration })
        }
    }

    async fn complete(&self, item: &WorkItem, verdict: Verdict) -> Result<Completion> {
        match verdict {
            Verdict::Keep { duration } => Ok(Completion::new(LedgerStatus::Accepted)
                .with_metrics(metrics(duration, 0))),
            Verdict::Remove { duration } => {
                tracing::info!(
                    "{}: {}s exceeds the {}s limit, removing files",
                    item.stable_id,
                    duration,
                    self.max_duration_seconds
                );
                let removed = remove_if_present(&self.videos_dir, item.meta("filename"))?
                    + remove_if_present(&self.audio_dir, item.meta("audio_filename"))?;

                Ok(Completion::new(LedgerStatus::Rejected)
                    .with_metrics(metrics(duration, removed))
                    .with_detail(format!("longer than {}s", self.max_duration_seconds)))
            }
        }
    }
}

fn metrics(duration: f64, files_removed: usize) -> Metrics {
    Metrics::from([
        ("duration_seconds".to_string(), duration.to_string()),
        ("files_removed".to_string(), files_removed.to_string()),
    ])
}
