use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Free-form fields carried forward from earlier stages (title, url, ...)
pub type Metadata = BTreeMap<String, String>;

/// Derive the stable identifier of a work item.
///
/// HTTP(S) URLs are kept verbatim. Anything else is treated as a file name:
/// directories are dropped and the last extension is stripped, so
/// `videos/Case 12.mp4`, `Case 12.wav` and `Case 12.json` all resolve to `Case 12`.
pub fn resolve(raw: &str) -> String {
    let trimmed = raw.trim();

    if is_url(trimmed) {
        return trimmed.to_string();
    }

    let path = Path::new(trimmed);
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| trimmed.to_string())
}

fn is_url(raw: &str) -> bool {
    url::Url::parse(raw)
        .map(|parsed| matches!(parsed.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// A unit of processing for one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Extension-stripped identity shared across stages
    pub stable_id: String,

    /// Name as the stage sees it (file name or URL)
    pub raw_name: String,

    pub metadata: Metadata,
}

impl WorkItem {
    pub fn new(raw_name: impl Into<String>) -> Self {
        let raw_name = raw_name.into();
        Self {
            stable_id: resolve(&raw_name),
            raw_name,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Metadata value, or an empty string when absent
    pub fn meta(&self, key: &str) -> &str {
        self.metadata.get(key).map(String::as_str).unwrap_or("")
    }
}
