use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "curate",
    about = "Video Curation Pipeline - build surgical video datasets from public videos",
    version,
    long_about = "Downloads surgical videos, filters them by duration, transcribes them with Whisper, refines the transcripts with an LLM and annotates the accepted videos with a vision-language model. Every stage is resumable: rerunning picks up where the last run stopped."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to ./config.yaml, then the user config directory)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable progress indicators
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one stage, or the whole pipeline in order
    Run {
        /// Stage to run
        #[arg(short, long, value_enum, default_value = "all")]
        stage: StageSelector,

        /// Attempt at most this many items per stage (overrides configured caps)
        #[arg(long, value_name = "COUNT")]
        max_items: Option<usize>,
    },

    /// Show per-stage ledger counts
    Status,

    /// Create the working directories, metadata table and links file
    Init,

    /// Show or write the configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },

    /// List pipeline stages in execution order
    Stages,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageSelector {
    /// Every stage, in order
    All,
    /// Fetch listed videos and extract their audio
    Download,
    /// Remove videos longer than the duration limit
    Clean,
    /// Speech-to-text with Whisper
    Transcribe,
    /// LLM correction of raw transcripts
    Refine,
    /// Join refined transcripts with video metadata
    Summarize,
    /// Gatekeeper screening and step annotation
    Vlm,
    /// Intraoperative adverse event review
    AdverseEvents,
}

impl StageSelector {
    /// Runnable stages in pipeline order
    pub const ORDER: &'static [StageSelector] = &[
        StageSelector::Download,
        StageSelector::Clean,
        StageSelector::Transcribe,
        StageSelector::Refine,
        StageSelector::Summarize,
        StageSelector::Vlm,
        StageSelector::AdverseEvents,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageSelector::All => "all",
            StageSelector::Download => "download",
            StageSelector::Clean => "clean",
            StageSelector::Transcribe => "transcribe",
            StageSelector::Refine => "refine",
            StageSelector::Summarize => "summarize",
            StageSelector::Vlm => "vlm",
            StageSelector::AdverseEvents => "adverse-events",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StageSelector::All => "every stage, in order",
            StageSelector::Download => "fetch listed videos and extract 16 kHz mono audio",
            StageSelector::Clean => "drop videos longer than the duration limit",
            StageSelector::Transcribe => "transcribe audio with Whisper",
            StageSelector::Refine => "correct transcripts with an LLM",
            StageSelector::Summarize => "join refined transcripts with video metadata",
            StageSelector::Vlm => "screen transcripts and annotate surgical steps",
            StageSelector::AdverseEvents => "review annotated surgeries for adverse events",
        }
    }

    /// Whether running `self` runs `stage`
    pub fn includes(&self, stage: StageSelector) -> bool {
        *self == StageSelector::All || *self == stage
    }
}

impl std::fmt::Display for StageSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
