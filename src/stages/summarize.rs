use std::collections::HashSet;
use std::path::PathBuf;

use crate::engine::ledger::{load_completed, ITEM_ID, STATUS};
use crate::engine::join::normalize_key;
use crate::engine::{join_with, resolve, JoinedRow, LedgerStatus, Row, StageReport, Table};
use crate::{PipelineError, Result};

/// Columns of the dataset summary, in file order
pub const SUMMARY_COLUMNS: &[&str] = &[
    "title",
    "video_name",
    "transcript_name",
    "audio_name",
    "duration_seconds",
    "word_count",
    "channel_name",
    "url",
    "download_name",
    "download_date",
];

/// Joins refinement results with the video metadata into the dataset summary
pub struct Summarizer {
    pub refinement_log: PathBuf,
    pub metadata_file: PathBuf,
    pub cleaning_log: PathBuf,
    pub output: PathBuf,
}

fn non_empty<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

fn summary_row(joined: &JoinedRow) -> Row {
    let filename = joined.secondary("filename");
    let fallback_transcript = format!("{}.txt", joined.key);

    let values = [
        ("title", joined.secondary("title")),
        ("video_name", non_empty(joined.primary("video_name"), filename)),
        (
            "transcript_name",
            non_empty(joined.primary("transcript_name"), &fallback_transcript),
        ),
        ("audio_name", joined.secondary("audio_filename")),
        ("duration_seconds", joined.secondary("duration_seconds")),
        ("word_count", joined.primary("total_words")),
        ("channel_name", joined.secondary("channel_name")),
        ("url", joined.secondary("url")),
        ("download_name", filename),
        ("download_date", joined.secondary("download_date")),
    ];

    values
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Summarizer {
    /// Rebuild the summary; returns the report with `succeeded` set to the row count
    pub fn run(&self) -> Result<StageReport> {
        let span = tracing::info_span!("stage", name = "summarize", run_id = %uuid::Uuid::new_v4());
        let _guard = span.enter();

        for input in [&self.refinement_log, &self.metadata_file] {
            if !input.exists() {
                return Err(PipelineError::Configuration(format!(
                    "summary input not found: {}",
                    input.display()
                ))
                .into());
            }
        }

        let refined = Table::from_csv(&self.refinement_log)?
            .filtered(|row| row.get(STATUS).map(|s| LedgerStatus::from_label(s)) == Some(LedgerStatus::Success));
        let metadata = Table::from_csv(&self.metadata_file)?;

        let removed: HashSet<String> = if self.cleaning_log.exists() {
            load_completed(&self.cleaning_log, &[LedgerStatus::Rejected])
                .iter()
                .filter_map(|id| normalize_key(id))
                .collect()
        } else {
            HashSet::new()
        };

        let matched = join_with(
            &refined,
            &metadata,
            |row: &Row| row.get(ITEM_ID).cloned(),
            |row: &Row| row.get("filename").map(|f| resolve(f)),
        );
        let matched_count = matched.len();
        let joined: Vec<JoinedRow> = matched
            .into_iter()
            .filter(|row| !removed.contains(&row.key))
            .collect();

        let mut report = StageReport {
            stage: "summarize".to_string(),
            skipped: matched_count - joined.len(),
            ..Default::default()
        };

        if joined.is_empty() {
            tracing::warn!(
                "Summary is empty: no refined transcript matches a metadata row; {} left untouched",
                self.output.display()
            );
            return Ok(report);
        }

        let mut seen = HashSet::new();
        let mut summary = Table::new(SUMMARY_COLUMNS);
        for row in joined.iter().filter(|row| seen.insert(row.key.clone())) {
            summary.push(summary_row(row));
        }

        summary.write_csv(&self.output)?;
        tracing::info!("Wrote {} summary row(s) to {}", summary.len(), self.output.display());

        report.succeeded = summary.len();
        Ok(report)
    }
}
