use anyhow::{Context, Result};
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use super::adapter::{CallAdapter, Outcome, PermanentFailure, RetryPolicy};
use super::clock::{Clock, RateLimiter, SystemClock};
use super::identity::WorkItem;
use super::ledger::{ledger_header, Ledger, LedgerEntry, LedgerState, LedgerStatus, Metrics};
use super::planner;
use crate::PipelineError;

/// Static configuration of a stage, built fresh for every run
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub name: &'static str,
    pub ledger_path: PathBuf,
    pub output_dir: PathBuf,

    /// Extension of per-item artifacts in `output_dir` (`None`: the stage writes none)
    pub artifact_extension: Option<&'static str>,

    /// Append-only file mirroring every artifact, one record per line
    pub aggregate_file: Option<PathBuf>,

    /// Minimum spacing between two collaborator calls
    pub delay: Duration,
    pub retry: RetryPolicy,

    /// Per-run budget of attempted items
    pub max_items: Option<usize>,

    pub vocabulary: StatusVocabulary,
}

/// The statuses a stage writes and which of them end processing for good
#[derive(Debug, Clone)]
pub struct StatusVocabulary {
    /// Written when an artifact is found without a ledger row
    pub success: LedgerStatus,
    pub rejected: LedgerStatus,
    pub error: LedgerStatus,
    pub terminal: Vec<LedgerStatus>,
}

impl StatusVocabulary {
    pub fn new(success: LedgerStatus, error: LedgerStatus) -> Self {
        Self {
            terminal: vec![success.clone(), LedgerStatus::Rejected],
            success,
            rejected: LedgerStatus::Rejected,
            error,
        }
    }

    pub fn with_terminal(mut self, status: LedgerStatus) -> Self {
        if !self.terminal.contains(&status) {
            self.terminal.push(status);
        }
        self
    }
}

/// What a successful item leaves behind
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: LedgerStatus,
    pub metrics: Metrics,
    pub detail: String,

    /// Per-item artifact contents, written as `<stable_id>.<ext>`
    pub artifact: Option<String>,
}

impl Completion {
    pub fn new(status: LedgerStatus) -> Self {
        Self {
            status,
            metrics: Metrics::new(),
            detail: String::new(),
            artifact: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics.extend(metrics);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_artifact(mut self, contents: impl Into<String>) -> Self {
        self.artifact = Some(contents.into());
        self
    }
}

/// One pipeline stage: the strategy the generic executor is parameterised by
#[async_trait]
pub trait Stage: Send + Sync {
    /// Upstream data an item needs before its call
    type Input: Send + Sync;

    /// Payload of a successful call
    type Output: Send;

    fn settings(&self) -> &StageSettings;

    /// Stage-specific ledger columns, between `status` and `detail`
    fn metric_columns(&self) -> &'static [&'static str];

    /// Stage-level checks (credentials, required inputs); errors abort only this stage
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Every item this stage could process, in a deterministic order
    async fn candidates(&self) -> Result<Vec<WorkItem>>;

    /// Ids whose artifact already exists
    async fn existing_artifacts(&self) -> Result<HashSet<String>> {
        let settings = self.settings();
        match settings.artifact_extension {
            Some(ext) => list_ids(&settings.output_dir, ext, settings.aggregate_file.as_deref()),
            None => Ok(HashSet::new()),
        }
    }

    async fn load_input(&self, item: &WorkItem) -> Result<Self::Input>;

    /// Identity of an input, used to avoid resubmitting an oversized one unchanged
    fn fingerprint(&self, _input: &Self::Input) -> Option<String> {
        None
    }

    async fn call(&self, item: &WorkItem, input: &Self::Input) -> Outcome<Self::Output>;

    /// Turn a successful payload into ledger fields and an optional artifact.
    ///
    /// Side effects that act as the stage's artifact must happen here, before
    /// the ledger row is written.
    async fn complete(&self, item: &WorkItem, output: Self::Output) -> Result<Completion>;

    /// Metrics carried on every row for this item (failures included)
    fn item_metrics(&self, _item: &WorkItem) -> Metrics {
        Metrics::new()
    }
}

/// Ambient services shared by every stage in a run
#[derive(Clone)]
pub struct ExecutionContext {
    pub clock: Arc<dyn Clock>,
    pub show_progress: bool,
}

impl ExecutionContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock::new())).with_progress(true)
    }
}

/// Per-run counts for one stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub stage: String,
    pub succeeded: usize,
    pub rejected: usize,
    pub errored: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub backfilled: usize,
    pub calls: usize,
}

impl StageReport {
    fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            ..Default::default()
        }
    }
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} succeeded, {} rejected, {} errored, {} skipped",
            self.stage, self.succeeded, self.rejected, self.errored, self.skipped
        )?;
        if self.deferred > 0 {
            write!(f, ", {} deferred", self.deferred)?;
        }
        if self.backfilled > 0 {
            write!(f, ", {} backfilled", self.backfilled)?;
        }
        Ok(())
    }
}

/// Runs one stage to completion: plan, call, persist
pub struct StageExecutor<'a, S: Stage> {
    stage: &'a S,
    context: &'a ExecutionContext,
}

impl<'a, S: Stage> StageExecutor<'a, S> {
    pub fn new(stage: &'a S, context: &'a ExecutionContext) -> Self {
        Self { stage, context }
    }

    /// Run the stage. Per-item failures are recorded, never returned; an `Err`
    /// means the stage could not be set up or its ledger could not be written.
    pub async fn run(&self) -> Result<StageReport> {
        let settings = self.stage.settings();
        let span = tracing::info_span!(
            "stage",
            name = settings.name,
            run_id = %uuid::Uuid::new_v4()
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<StageReport> {
        let settings = self.stage.settings();
        let mut report = StageReport::new(settings.name);

        self.stage.prepare().await?;

        fs_err::create_dir_all(&settings.output_dir)?;
        let ledger = Ledger::open_or_create(
            &settings.ledger_path,
            &ledger_header(self.stage.metric_columns()),
        )
        .map_err(|e| match e.downcast::<PipelineError>() {
            Ok(ledger_error) => ledger_error,
            Err(e) => PipelineError::Ledger(format!("{:#}", e)),
        })?;

        let candidates = self
            .stage
            .candidates()
            .await
            .with_context(|| format!("Failed to enumerate candidates for {}", settings.name))?;
        let state = ledger.load_state(&settings.vocabulary.terminal);
        let artifacts = self.stage.existing_artifacts().await.unwrap_or_else(|e| {
            tracing::warn!("Could not list existing artifacts: {:#}", e);
            HashSet::new()
        });

        tracing::info!(
            "{} candidate(s), {} completed in ledger, {} artifact(s) on disk",
            candidates.len(),
            state.completed.len(),
            artifacts.len()
        );

        let plan = planner::plan(candidates, &state.completed, &artifacts, settings.max_items);
        report.skipped = plan.already_done;
        report.deferred = plan.deferred;

        for id in &plan.backfill {
            tracing::info!("Backfilling ledger row for {} from existing artifact", id);
            ledger.append(
                &LedgerEntry::new(id.as_str(), settings.vocabulary.success.clone())
                    .with_detail("backfilled from artifact")
                    .at(self.context.clock.wall_time()),
            )?;
            report.backfilled += 1;
        }

        if plan.work.is_empty() {
            tracing::info!("Nothing to do");
            return Ok(report);
        }

        tracing::info!("Processing {} item(s)", plan.work.len());
        let progress = self.progress_bar(plan.work.len() as u64);
        let clock = self.context.clock.as_ref();
        let adapter = CallAdapter::new(settings.retry, clock);
        let mut limiter = RateLimiter::new(settings.delay);

        for item in &plan.work {
            progress.set_message(item.stable_id.clone());
            self.process_item(item, &ledger, &state, &adapter, &mut limiter, &mut report)
                .await?;
            progress.inc(1);
        }

        progress.finish_with_message(format!("{} done", settings.name));
        Ok(report)
    }

    async fn process_item(
        &self,
        item: &WorkItem,
        ledger: &Ledger,
        state: &LedgerState,
        adapter: &CallAdapter<'_>,
        limiter: &mut RateLimiter,
        report: &mut StageReport,
    ) -> Result<()> {
        let vocabulary = &self.stage.settings().vocabulary;
        let clock = self.context.clock.as_ref();

        let input = match self.stage.load_input(item).await {
            Ok(input) => input,
            Err(e) => {
                tracing::error!("{}: missing or unreadable input: {:#}", item.stable_id, e);
                self.record(
                    ledger,
                    item,
                    vocabulary.error.clone(),
                    format!("input unavailable: {:#}", e),
                    Metrics::new(),
                    None,
                )?;
                report.errored += 1;
                return Ok(());
            }
        };

        let fingerprint = self.stage.fingerprint(&input);
        if let (Some(current), Some(previous)) = (&fingerprint, state.oversized.get(&item.stable_id)) {
            if current == previous {
                tracing::info!("{}: input unchanged since it was rejected as too large, skipping", item.stable_id);
                report.skipped += 1;
                return Ok(());
            }
        }

        limiter.acquire(clock).await;
        let invocation = adapter
            .invoke(&item.stable_id, || self.stage.call(item, &input))
            .await;
        limiter.release(clock);
        report.calls += invocation.attempts as usize;

        match invocation.outcome {
            Outcome::Success(output) => match self.commit(ledger, item, output).await {
                Ok(status) => {
                    tracing::info!("{}: {}", item.stable_id, status);
                    if status == vocabulary.rejected {
                        report.rejected += 1;
                    } else {
                        report.succeeded += 1;
                    }
                }
                Err(e) => {
                    tracing::error!("{}: failed to persist result: {:#}", item.stable_id, e);
                    self.record(
                        ledger,
                        item,
                        vocabulary.error.clone(),
                        format!("persist failed: {:#}", e),
                        Metrics::new(),
                        None,
                    )?;
                    report.errored += 1;
                }
            },
            Outcome::PermanentFailure(PermanentFailure::Rejected { reason, metrics }) => {
                tracing::info!("{}: rejected ({})", item.stable_id, reason);
                self.record(ledger, item, vocabulary.rejected.clone(), reason, metrics, None)?;
                report.rejected += 1;
            }
            Outcome::PermanentFailure(PermanentFailure::InputTooLarge(reason)) => {
                tracing::warn!("{}: input too large: {}", item.stable_id, reason);
                self.record(
                    ledger,
                    item,
                    LedgerStatus::InputTooLarge,
                    reason,
                    Metrics::new(),
                    fingerprint,
                )?;
                report.errored += 1;
            }
            Outcome::PermanentFailure(PermanentFailure::MalformedOutput(reason)) => {
                tracing::warn!("{}: malformed response: {}", item.stable_id, reason);
                self.record(ledger, item, vocabulary.error.clone(), reason, Metrics::new(), None)?;
                report.errored += 1;
            }
            Outcome::TransientFailure(reason) => {
                tracing::warn!("{}: call failed, will retry next run: {}", item.stable_id, reason);
                self.record(ledger, item, vocabulary.error.clone(), reason, Metrics::new(), None)?;
                report.errored += 1;
            }
        }

        Ok(())
    }

    /// Artifact first, then aggregate, then the terminal ledger row
    async fn commit(&self, ledger: &Ledger, item: &WorkItem, output: S::Output) -> Result<LedgerStatus> {
        let settings = self.stage.settings();
        let completion = self.stage.complete(item, output).await?;

        if let Some(contents) = &completion.artifact {
            if let Some(ext) = settings.artifact_extension {
                let path = settings.output_dir.join(format!("{}.{}", item.stable_id, ext));
                write_atomic(&path, contents)?;
            }
            if let Some(aggregate) = &settings.aggregate_file {
                append_line(aggregate, contents)?;
            }
        }

        let mut metrics = self.stage.item_metrics(item);
        metrics.extend(completion.metrics);
        ledger.append(
            &LedgerEntry::new(item.stable_id.as_str(), completion.status.clone())
                .with_metrics(metrics)
                .with_detail(completion.detail)
                .at(self.context.clock.wall_time()),
        )?;

        Ok(completion.status)
    }

    fn record(
        &self,
        ledger: &Ledger,
        item: &WorkItem,
        status: LedgerStatus,
        detail: String,
        extra: Metrics,
        fingerprint: Option<String>,
    ) -> Result<()> {
        let mut metrics = self.stage.item_metrics(item);
        metrics.extend(extra);
        ledger.append(
            &LedgerEntry::new(item.stable_id.as_str(), status)
                .with_metrics(metrics)
                .with_detail(detail)
                .with_fingerprint(fingerprint)
                .at(self.context.clock.wall_time()),
        )
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.context.show_progress {
            return ProgressBar::hidden();
        }

        let progress = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            progress.set_style(style);
        }
        progress
    }
}

/// Stable ids of files in `dir` with extension `ext`, ignoring `exclude`
pub fn list_ids(dir: &Path, ext: &str, exclude: Option<&Path>) -> Result<HashSet<String>> {
    if !dir.is_dir() {
        return Ok(HashSet::new());
    }

    let excluded_name = exclude.and_then(|p| p.file_name()).map(|n| n.to_os_string());
    let mut ids = HashSet::new();

    for entry in fs_err::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(ext) {
            continue;
        }
        if excluded_name.as_deref() == path.file_name() {
            continue;
        }
        if let Some(stem) = path.file_stem() {
            ids.insert(stem.to_string_lossy().into_owned());
        }
    }

    Ok(ids)
}

/// Write `contents` to `path` via a temporary sibling so readers never see a partial file
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs_err::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to move artifact into place: {}", path.display()))?;

    Ok(())
}

/// Append one line to an aggregate file, creating it if needed
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs_err::create_dir_all(parent)?;
    }
    let mut file = fs_err::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", line.trim_end())?;
    file.flush()?;
    Ok(())
}
