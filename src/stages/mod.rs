//! The seven pipeline stages and the runner that wires them to configuration.

pub mod adverse;
pub mod clean;
pub mod download;
pub mod prompts;
pub mod refine;
pub mod summarize;
pub mod transcribe;
pub mod vlm;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::StageSelector;
use crate::collaborators::chat::ChatClient;
use crate::collaborators::gemini::GeminiClient;
use crate::collaborators::whisper::WhisperCli;
use crate::collaborators::ytdlp::YtDlpFetcher;
use crate::collaborators::GenerativeModel;
use crate::config::{api_key, seconds, Config};
use crate::engine::{
    read_entries, ExecutionContext, RetryPolicy, Stage, StageExecutor, StageReport, StageSettings,
    StatusVocabulary, Table,
};
use crate::{PipelineError, Result};

use adverse::AdverseEventStage;
use clean::CleanStage;
use download::DownloadStage;
use refine::RefineStage;
use summarize::Summarizer;
use transcribe::TranscribeStage;
use vlm::VlmStage;

/// How one stage of a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    Completed(StageReport),
    /// Not runnable (missing credential, tool or input)
    Skipped(String),
    Failed(String),
}

impl StageResult {
    fn from_run(result: Result<StageReport>) -> Self {
        match result {
            Ok(report) => StageResult::Completed(report),
            Err(e) => match e.downcast_ref::<PipelineError>() {
                Some(PipelineError::Configuration(reason)) => StageResult::Skipped(reason.clone()),
                _ => StageResult::Failed(format!("{:#}", e)),
            },
        }
    }
}

/// Runs the selected stages in pipeline order
pub struct PipelineRunner {
    config: Config,
    context: ExecutionContext,
    max_items: Option<usize>,
}

impl PipelineRunner {
    pub fn new(config: Config, context: ExecutionContext) -> Self {
        Self {
            config,
            context,
            max_items: None,
        }
    }

    /// Cap every stage at `max_items` attempts, overriding configured caps
    pub fn with_max_items(mut self, max_items: Option<usize>) -> Self {
        self.max_items = max_items;
        self
    }

    /// Run the selected stages; a failed stage never stops the ones after it
    pub async fn run(&self, selector: StageSelector) -> Vec<(&'static str, StageResult)> {
        let mut results = Vec::new();

        for &stage in StageSelector::ORDER {
            if !selector.includes(stage) {
                continue;
            }

            let name = stage.name();
            tracing::info!("=== Stage: {} ===", name);
            let result = StageResult::from_run(self.run_stage(stage).await);

            match &result {
                StageResult::Completed(report) => tracing::info!("{}", report),
                StageResult::Skipped(reason) => tracing::warn!("{} skipped: {}", name, reason),
                StageResult::Failed(reason) => tracing::error!("{} failed: {}", name, reason),
            }
            results.push((name, result));
        }

        results
    }

    async fn run_stage(&self, stage: StageSelector) -> Result<StageReport> {
        match stage {
            StageSelector::Download => {
                let stage = self.download_stage();
                let report = self.execute(&stage).await?;
                let (extracted, failed) = stage.repair_audio().await?;
                if extracted + failed > 0 {
                    tracing::info!("Audio repair: {} extracted, {} failed", extracted, failed);
                }
                Ok(report)
            }
            StageSelector::Clean => self.execute(&self.clean_stage()).await,
            StageSelector::Transcribe => self.execute(&self.transcribe_stage()).await,
            StageSelector::Refine => self.execute(&self.refine_stage()?).await,
            StageSelector::Summarize => self.summarizer().run(),
            StageSelector::Vlm => self.execute(&self.vlm_stage()?).await,
            StageSelector::AdverseEvents => self.execute(&self.adverse_stage()?).await,
            StageSelector::All => Ok(StageReport::default()),
        }
    }

    async fn execute<S: Stage>(&self, stage: &S) -> Result<StageReport> {
        StageExecutor::new(stage, &self.context).run().await
    }

    fn settings(
        &self,
        name: &'static str,
        ledger_path: PathBuf,
        output_dir: PathBuf,
        vocabulary: StatusVocabulary,
    ) -> StageSettings {
        StageSettings {
            name,
            ledger_path,
            output_dir,
            artifact_extension: None,
            aggregate_file: None,
            delay: Duration::ZERO,
            retry: RetryPolicy::SingleAttempt,
            max_items: self.max_items,
            vocabulary,
        }
    }

    fn gemini(&self) -> Result<Arc<dyn GenerativeModel>> {
        let key = api_key(&self.config.gemini.api_key_env)?;
        let client = GeminiClient::new(&self.config.gemini.base_url, key, self.config.http_timeout())?;
        Ok(Arc::new(client))
    }

    pub fn download_stage(&self) -> DownloadStage {
        let config = &self.config;
        let mut settings = self.settings(
            "download",
            config.files.download_log.clone(),
            config.directories.videos.clone(),
            download::vocabulary(),
        );
        settings.delay = seconds(config.download.delay_seconds);

        DownloadStage::new(
            settings,
            config.files.video_links.clone(),
            config.files.metadata_csv.clone(),
            config.directories.audio.clone(),
            Arc::new(YtDlpFetcher::new(Some(config.files.cookies.clone()))),
        )
    }

    pub fn clean_stage(&self) -> CleanStage {
        let config = &self.config;
        let settings = self.settings(
            "clean",
            config.files.cleaning_log.clone(),
            config.directories.videos.clone(),
            clean::vocabulary(),
        );

        CleanStage::new(
            settings,
            config.files.metadata_csv.clone(),
            config.directories.videos.clone(),
            config.directories.audio.clone(),
            config.download.max_duration_seconds,
        )
    }

    pub fn transcribe_stage(&self) -> TranscribeStage {
        let config = &self.config;
        let mut settings = self.settings(
            "transcribe",
            config.files.transcription_log.clone(),
            config.directories.transcripts.clone(),
            transcribe::vocabulary(),
        );
        settings.artifact_extension = Some("json");

        let whisper = WhisperCli::new(
            &config.whisper.command,
            &config.whisper.model_size,
            config.whisper.device.clone(),
        );
        TranscribeStage::new(settings, config.directories.audio.clone(), Arc::new(whisper))
    }

    pub fn refine_stage(&self) -> Result<RefineStage> {
        let config = &self.config;
        let refiner = &config.refiner;
        let key = api_key(&refiner.api_key_env)?;
        let client = ChatClient::new(&refiner.base_url, key, &refiner.model, config.http_timeout())?;

        let mut settings = self.settings(
            "refine",
            config.files.refinement_log.clone(),
            config.directories.refined_transcripts.clone(),
            refine::vocabulary(),
        );
        settings.artifact_extension = Some("txt");
        settings.delay = seconds(refiner.api_call_delay_seconds);
        settings.retry = RetryPolicy::BlockUntilResolved {
            backoff: seconds(refiner.retry_backoff_seconds),
        };
        settings.max_items = self.max_items.or(refiner.max_files_per_run);

        Ok(RefineStage::new(
            settings,
            config.directories.transcripts.clone(),
            config.directories.videos.clone(),
            Arc::new(client),
        ))
    }

    pub fn summarizer(&self) -> Summarizer {
        let files = &self.config.files;
        Summarizer {
            refinement_log: files.refinement_log.clone(),
            metadata_file: files.metadata_csv.clone(),
            cleaning_log: files.cleaning_log.clone(),
            output: files.dataset_summary.clone(),
        }
    }

    pub fn vlm_stage(&self) -> Result<VlmStage> {
        let config = &self.config;
        let gemini = &config.gemini;

        let mut settings = self.settings(
            "vlm",
            config.files.vlm_log.clone(),
            config.directories.vlm_dataset.clone(),
            vlm::vocabulary(),
        );
        settings.artifact_extension = Some("jsonl");
        settings.aggregate_file = Some(config.files.vlm_aggregate.clone());
        settings.delay = seconds(gemini.vlm_delay_seconds);
        settings.max_items = self.max_items.or(gemini.max_items_per_run);

        Ok(VlmStage::new(
            settings,
            config.files.dataset_summary.clone(),
            config.directories.refined_transcripts.clone(),
            self.gemini()?,
            &gemini.gatekeeper_model,
            &gemini.generator_model,
            gemini.gatekeeper_char_limit,
        ))
    }

    pub fn adverse_stage(&self) -> Result<AdverseEventStage> {
        let config = &self.config;
        let gemini = &config.gemini;

        let mut settings = self.settings(
            "adverse-events",
            config.files.adverse_log.clone(),
            config.directories.adverse_events.clone(),
            adverse::vocabulary(),
        );
        settings.artifact_extension = Some("jsonl");
        settings.aggregate_file = Some(config.files.adverse_aggregate.clone());
        settings.delay = seconds(gemini.safety_delay_seconds);
        settings.max_items = self.max_items.or(gemini.max_items_per_run);

        Ok(AdverseEventStage::new(
            settings,
            config.directories.vlm_dataset.clone(),
            config.files.vlm_aggregate.clone(),
            self.gemini()?,
            &gemini.safety_model,
        ))
    }
}

/// Row counts of one stage ledger
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerDigest {
    pub stage: &'static str,
    pub path: PathBuf,
    pub exists: bool,
    pub rows: usize,
    /// Distinct ids with a terminal row
    pub completed: usize,
    pub by_status: BTreeMap<String, usize>,
    /// Why the ledger could not be read, if it could not
    pub unreadable: Option<String>,
}

/// Summarise every stage ledger without touching any of them
pub fn status_digest(config: &Config) -> Vec<LedgerDigest> {
    let files = &config.files;
    let ledgers = [
        ("download", &files.download_log, download::vocabulary()),
        ("clean", &files.cleaning_log, clean::vocabulary()),
        ("transcribe", &files.transcription_log, transcribe::vocabulary()),
        ("refine", &files.refinement_log, refine::vocabulary()),
        ("vlm", &files.vlm_log, vlm::vocabulary()),
        ("adverse-events", &files.adverse_log, adverse::vocabulary()),
    ];

    let mut digests = Vec::new();
    for (stage, path, vocabulary) in ledgers {
        let mut digest = LedgerDigest {
            stage,
            path: path.clone(),
            exists: path.exists(),
            rows: 0,
            completed: 0,
            by_status: BTreeMap::new(),
            unreadable: None,
        };

        if digest.exists {
            match read_entries(path) {
                Ok(entries) => {
                    let mut completed = HashSet::new();
                    for entry in &entries {
                        *digest.by_status.entry(entry.status.to_string()).or_default() += 1;
                        if vocabulary.terminal.contains(&entry.status) {
                            completed.insert(entry.item_id.as_str());
                        }
                    }
                    digest.rows = entries.len();
                    digest.completed = completed.len();
                }
                Err(e) => {
                    tracing::warn!("Ledger {} unreadable: {:#}", path.display(), e);
                    digest.unreadable = Some(format!("{:#}", e));
                }
            }
        }

        digests.push(digest);
    }

    digests
}

/// Create the working directories, an empty metadata table and a links file.
///
/// Existing files are left alone; returns what was created.
pub fn init_workspace(config: &Config) -> Result<Vec<PathBuf>> {
    let dirs = &config.directories;
    let mut created = Vec::new();

    for dir in [
        &dirs.videos,
        &dirs.audio,
        &dirs.transcripts,
        &dirs.refined_transcripts,
        &dirs.vlm_dataset,
        &dirs.adverse_events,
    ] {
        if !dir.exists() {
            fs_err::create_dir_all(dir)?;
            created.push(dir.clone());
        }
    }

    let metadata = &config.files.metadata_csv;
    if !metadata.exists() {
        Table::new(download::METADATA_COLUMNS).write_csv(metadata)?;
        created.push(metadata.clone());
    }

    let links = &config.files.video_links;
    if !links.exists() {
        if let Some(parent) = links.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs_err::create_dir_all(parent)?;
        }
        fs_err::write(links, "# One video or playlist URL per line\n")?;
        created.push(links.clone());
    }

    Ok(created)
}
