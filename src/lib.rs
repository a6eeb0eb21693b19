//! Video Curation Pipeline - a resumable batch pipeline for surgical video datasets
//!
//! Videos are downloaded, filtered by duration, transcribed with Whisper,
//! refined by an LLM, joined into a dataset summary, annotated by a
//! vision-language model and screened for adverse events. Every stage keeps an
//! append-only ledger so an interrupted run picks up where it stopped.

pub mod cli;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod output;
pub mod stages;
pub mod utils;

pub use cli::{Cli, Commands, StageSelector};
pub use config::Config;
pub use engine::{ExecutionContext, Stage, StageExecutor, StageReport};
pub use stages::PipelineRunner;

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;

/// Error types specific to the pipeline
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// Missing credentials, tools or required inputs; aborts one stage
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An upstream artifact exists but cannot be used
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    /// An external tool or service answered with an error
    #[error("Collaborator error: {0}")]
    Collaborator(String),
}
