use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::PipelineError;

pub const ITEM_ID: &str = "item_id";
pub const STATUS: &str = "status";
pub const DETAIL: &str = "detail";
pub const INPUT_FINGERPRINT: &str = "input_fingerprint";
pub const TIMESTAMP: &str = "timestamp";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Stage-specific numeric/text columns of a ledger row
pub type Metrics = BTreeMap<String, String>;

/// Status vocabulary shared by all stage ledgers.
///
/// Whether a status is terminal is decided per stage; anything unrecognised
/// parses to `Other` and is never terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LedgerStatus {
    Success,
    Accepted,
    Rejected,
    Detected,
    NoEvent,
    Error,
    ErrorGeneration,
    InputTooLarge,
    Other(String),
}

impl LedgerStatus {
    pub fn as_str(&self) -> &str {
        match self {
            LedgerStatus::Success => "SUCCESS",
            LedgerStatus::Accepted => "ACCEPTED",
            LedgerStatus::Rejected => "REJECTED",
            LedgerStatus::Detected => "DETECTED",
            LedgerStatus::NoEvent => "NO_EVENT",
            LedgerStatus::Error => "ERROR",
            LedgerStatus::ErrorGeneration => "ERROR_GENERATION",
            LedgerStatus::InputTooLarge => "INPUT_TOO_LARGE",
            LedgerStatus::Other(raw) => raw,
        }
    }

    /// Parse a ledger cell; never fails, unknown labels become `Other`
    pub fn from_label(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "SUCCESS" => LedgerStatus::Success,
            "ACCEPTED" => LedgerStatus::Accepted,
            "REJECTED" => LedgerStatus::Rejected,
            "DETECTED" => LedgerStatus::Detected,
            "NO_EVENT" => LedgerStatus::NoEvent,
            "ERROR" => LedgerStatus::Error,
            "ERROR_GENERATION" => LedgerStatus::ErrorGeneration,
            "INPUT_TOO_LARGE" => LedgerStatus::InputTooLarge,
            _ => LedgerStatus::Other(s.trim().to_string()),
        }
    }
}

impl FromStr for LedgerStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_label(s))
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger row
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub item_id: String,
    pub status: LedgerStatus,
    pub metrics: Metrics,
    pub detail: String,
    pub input_fingerprint: Option<String>,
    pub timestamp: String,
}

impl LedgerEntry {
    /// A row with no timestamp yet; see [`LedgerEntry::at`]
    pub fn new(item_id: impl Into<String>, status: LedgerStatus) -> Self {
        Self {
            item_id: item_id.into(),
            status,
            metrics: Metrics::new(),
            detail: String::new(),
            input_fingerprint: None,
            timestamp: String::new(),
        }
    }

    pub fn at(mut self, time: NaiveDateTime) -> Self {
        self.timestamp = time.format(TIMESTAMP_FORMAT).to_string();
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics.extend(metrics);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.input_fingerprint = fingerprint;
        self
    }

    fn value_for(&self, column: &str) -> String {
        match column {
            ITEM_ID => self.item_id.clone(),
            STATUS => self.status.to_string(),
            DETAIL => self.detail.clone(),
            INPUT_FINGERPRINT => self.input_fingerprint.clone().unwrap_or_default(),
            TIMESTAMP => self.timestamp.clone(),
            other => self.metrics.get(other).cloned().unwrap_or_default(),
        }
    }
}

/// Build the full header for a stage ledger from its metric columns
pub fn ledger_header(metric_columns: &[&str]) -> Vec<String> {
    let mut header = vec![ITEM_ID.to_string(), STATUS.to_string()];
    header.extend(metric_columns.iter().map(|c| c.to_string()));
    header.extend([DETAIL, INPUT_FINGERPRINT, TIMESTAMP].map(String::from));
    header
}

/// What a stage needs to know from its ledger before planning a run
#[derive(Debug, Default, Clone)]
pub struct LedgerState {
    /// Ids with at least one terminal row
    pub completed: HashSet<String>,

    /// Ids whose latest row is `INPUT_TOO_LARGE`, with the fingerprint of that input
    pub oversized: HashMap<String, String>,
}

/// Append-only CSV ledger owned by a single stage
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    header: Vec<String>,
}

impl Ledger {
    /// Create the ledger with `header` if absent; existing rows are never touched.
    ///
    /// When the file already exists its own header wins, so rows keep lining up
    /// with whatever an earlier version of the stage wrote. A header without
    /// `item_id` or `status` is a `PipelineError::Ledger`.
    pub fn open_or_create(path: impl Into<PathBuf>, header: &[String]) -> Result<Self> {
        let path = path.into();

        let is_empty = match fs_err::metadata(&path) {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };

        if is_empty {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs_err::create_dir_all(parent)?;
            }
            let file = fs_err::File::create(&path)?;
            let mut writer = csv::Writer::from_writer(file);
            writer
                .write_record(header)
                .with_context(|| format!("Failed to write ledger header: {}", path.display()))?;
            writer.flush()?;
            tracing::debug!("Created ledger {}", path.display());

            return Ok(Self {
                path,
                header: header.to_vec(),
            });
        }

        let existing = read_header(&path).map_err(|e| {
            PipelineError::Ledger(format!("cannot read header of {}: {:#}", path.display(), e))
        })?;

        for required in [ITEM_ID, STATUS] {
            if !existing.iter().any(|c| c == required) {
                return Err(PipelineError::Ledger(format!(
                    "{} has no {} column; refusing to append",
                    path.display(),
                    required
                ))
                .into());
            }
        }

        if existing != header {
            tracing::warn!(
                "Ledger {} has a different header than expected; appending by column name",
                path.display()
            );
        }

        Ok(Self {
            path,
            header: existing,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Append one row and flush it to disk before returning
    pub fn append(&self, entry: &LedgerEntry) -> Result<()> {
        let record: Vec<String> = self.header.iter().map(|c| entry.value_for(c)).collect();

        let file = fs_err::OpenOptions::new()
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        writer
            .write_record(&record)
            .with_context(|| format!("Failed to append to ledger {}", self.path.display()))?;
        writer.flush()?;
        writer.get_ref().sync_data()?;

        Ok(())
    }

    /// Every row in file order
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        read_entries(&self.path)
    }

    /// Fail-soft read of completion state; an unreadable ledger means nothing is done
    pub fn load_state(&self, terminal: &[LedgerStatus]) -> LedgerState {
        match self.entries() {
            Ok(entries) => state_from_entries(&entries, terminal),
            Err(e) => {
                tracing::warn!(
                    "Ledger {} unreadable, treating every item as pending: {:#}",
                    self.path.display(),
                    e
                );
                LedgerState::default()
            }
        }
    }

    pub fn load_completed(&self, terminal: &[LedgerStatus]) -> HashSet<String> {
        self.load_state(terminal).completed
    }
}

/// Completed ids of the ledger at `path` without opening it for writing
pub fn load_completed(path: &Path, terminal: &[LedgerStatus]) -> HashSet<String> {
    match read_entries(path) {
        Ok(entries) => state_from_entries(&entries, terminal).completed,
        Err(e) => {
            tracing::warn!("Ledger {} unreadable: {:#}", path.display(), e);
            HashSet::new()
        }
    }
}

fn state_from_entries(entries: &[LedgerEntry], terminal: &[LedgerStatus]) -> LedgerState {
    let mut state = LedgerState::default();

    for entry in entries {
        if terminal.contains(&entry.status) {
            state.completed.insert(entry.item_id.clone());
        }

        match (&entry.status, &entry.input_fingerprint) {
            (LedgerStatus::InputTooLarge, Some(fingerprint)) => {
                state
                    .oversized
                    .insert(entry.item_id.clone(), fingerprint.clone());
            }
            _ => {
                state.oversized.remove(&entry.item_id);
            }
        }
    }

    state
}

fn read_header(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open ledger {}", path.display()))?;
    Ok(reader.headers()?.iter().map(str::to_string).collect())
}

/// Every row of the ledger at `path`, in file order
pub fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open ledger {}", path.display()))?;

    let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let position = |name: &str| header.iter().position(|c| c == name);

    let id_col = position(ITEM_ID)
        .with_context(|| format!("Ledger {} has no {} column", path.display(), ITEM_ID))?;
    let status_col = position(STATUS)
        .with_context(|| format!("Ledger {} has no {} column", path.display(), STATUS))?;

    let mut entries = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("Malformed row in {}", path.display()))?;
        let field = |idx: usize| record.get(idx).unwrap_or("").to_string();

        let mut metrics = Metrics::new();
        let mut detail = String::new();
        let mut input_fingerprint = None;
        let mut timestamp = String::new();

        for (idx, column) in header.iter().enumerate() {
            if idx == id_col || idx == status_col {
                continue;
            }
            let value = field(idx);
            match column.as_str() {
                DETAIL => detail = value,
                INPUT_FINGERPRINT => input_fingerprint = Some(value).filter(|v| !v.is_empty()),
                TIMESTAMP => timestamp = value,
                _ => {
                    metrics.insert(column.clone(), value);
                }
            }
        }

        entries.push(LedgerEntry {
            item_id: field(id_col),
            status: LedgerStatus::from_label(&field(status_col)),
            metrics,
            detail,
            input_fingerprint,
            timestamp,
        });
    }

    Ok(entries)
}
