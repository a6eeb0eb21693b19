use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::collaborators::{FetchedMedia, MediaFetcher};
use crate::engine::{
    list_ids, Completion, LedgerStatus, Metrics, Outcome, Row, Stage, StageSettings,
    StatusVocabulary, Table, WorkItem,
};
use crate::utils::{is_video_file, load_video_links};
use crate::{PipelineError, Result};

/// Columns of the video metadata table, in file order
pub const METADATA_COLUMNS: &[&str] = &[
    "title",
    "channel_name",
    "url",
    "filename",
    "download_date",
    "duration_seconds",
    "resolution",
    "audio_filename",
];

pub fn vocabulary() -> StatusVocabulary {
    StatusVocabulary::new(LedgerStatus::Success, LedgerStatus::Error)
}

/// Downloads every listed video once and extracts its audio
pub struct DownloadStage {
    settings: StageSettings,
    links_file: PathBuf,
    metadata_file: PathBuf,
    audio_dir: PathBuf,
    fetcher: Arc<dyn MediaFetcher>,
}

/// A finished download
pub struct Downloaded {
    media: FetchedMedia,
    audio_filename: Option<String>,
}

impl DownloadStage {
    pub fn new(
        settings: StageSettings,
        links_file: PathBuf,
        metadata_file: PathBuf,
        audio_dir: PathBuf,
        fetcher: Arc<dyn MediaFetcher>,
    ) -> Self {
        Self {
            settings,
            links_file,
            metadata_file,
            audio_dir,
            fetcher,
        }
    }

    /// Extract audio for every video that has no `.wav` yet; returns (extracted, failed)
    pub async fn repair_audio(&self) -> Result<(usize, usize)> {
        let videos_dir = &self.settings.output_dir;
        if !videos_dir.is_dir() {
            return Ok((0, 0));
        }
        fs_err::create_dir_all(&self.audio_dir)?;

        let existing: HashSet<String> = list_ids(&self.audio_dir, "wav", None)?;

        let mut missing: Vec<PathBuf> = fs_err::read_dir(videos_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_video_file(path))
            .filter(|path| {
                path.file_stem()
                    .map(|stem| !existing.contains(stem.to_string_lossy().as_ref()))
                    .unwrap_or(false)
            })
            .collect();
        missing.sort();

        if missing.is_empty() {
            tracing::info!("All videos have corresponding audio files");
            return Ok((0, 0));
        }

        tracing::warn!("{} video(s) missing audio, extracting", missing.len());
        let (mut extracted, mut failed) = (0, 0);
        for video in &missing {
            match self.fetcher.extract_audio(video, &self.audio_dir).await {
                Ok(path) => {
                    tracing::info!("Extracted audio: {}", path.display());
                    extracted += 1;
                }
                Err(e) => {
                    tracing::error!("Audio extraction failed for {}: {:#}", video.display(), e);
                    failed += 1;
                }
            }
        }

        Ok((extracted, failed))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Append one row to the metadata table, writing the header if the file is new
pub fn append_metadata_row(path: &Path, row: &Row) -> Result<()> {
    let is_new = fs_err::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs_err::create_dir_all(parent)?;
    }

    let file = fs_err::OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);

    if is_new {
        writer.write_record(METADATA_COLUMNS)?;
    }
    writer.write_record(
        METADATA_COLUMNS
            .iter()
            .map(|c| row.get(*c).map(String::as_str).unwrap_or("")),
    )?;
    writer.flush()?;
    Ok(())
}

#[async_trait]
impl Stage for DownloadStage {
    type Input = ();
    type Output = Downloaded;

    fn settings(&self) -> &StageSettings {
        &self.settings
    }

    fn metric_columns(&self) -> &'static [&'static str] {
        &["title", "filename", "duration_seconds", "audio_filename"]
    }

    async fn prepare(&self) -> Result<()> {
        if !self.links_file.exists() {
            return Err(PipelineError::Configuration(format!(
                "video links file not found: {}",
                self.links_file.display()
            ))
            .into());
        }
        self.fetcher.ensure_available().await?;
        fs_err::create_dir_all(&self.audio_dir)?;
        Ok(())
    }

    async fn candidates(&self) -> Result<Vec<WorkItem>> {
        let links = load_video_links(&self.links_file)?;
        let mut items = Vec::new();

        for link in links {
            match self.fetcher.expand(&link).await {
                Ok(urls) => items.extend(urls.into_iter().map(WorkItem::new)),
                Err(e) => {
                    tracing::warn!("Could not inspect {}, treating it as a single video: {:#}", link, e);
                    items.push(WorkItem::new(link));
                }
            }
        }

        Ok(items)
    }

    /// A URL already in the metadata table has been downloaded
    async fn existing_artifacts(&self) -> Result<HashSet<String>> {
        if !self.metadata_file.exists() {
            return Ok(HashSet::new());
        }
        let table = Table::from_csv(&self.metadata_file)?;
        Ok(table
            .rows
            .iter()
            .filter_map(|row| row.get("url"))
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect())
    }

    async fn load_input(&self, _item: &WorkItem) -> Result<()> {
        Ok(())
    }

    async fn call(&self, item: &WorkItem, _input: &()) -> Outcome<Downloaded> {
        let media = match self.fetcher.fetch(&item.raw_name, &self.settings.output_dir).await {
            Ok(media) => media,
            Err(e) => return Outcome::from_error(&e),
        };

        // A missing track is left to the audio repair pass
        let audio_filename = match self.fetcher.extract_audio(&media.video_path, &self.audio_dir).await {
            Ok(path) => Some(file_name(&path)),
            Err(e) => {
                tracing::warn!("{}: audio extraction failed: {:#}", item.stable_id, e);
                None
            }
        };

        Outcome::Success(Downloaded { media, audio_filename })
    }

    async fn complete(&self, item: &WorkItem, output: Downloaded) -> Result<Completion> {
        let Downloaded { media, audio_filename } = output;

        let filename = file_name(&media.video_path);
        let duration = media
            .duration_seconds
            .map(|d| d.to_string())
            .unwrap_or_default();
        let audio_filename = audio_filename.unwrap_or_else(|| "N/A".to_string());

        let row: Row = [
            ("title", media.title.clone()),
            ("channel_name", media.channel.clone()),
            ("url", item.stable_id.clone()),
            ("filename", filename.clone()),
            (
                "download_date",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            ),
            ("duration_seconds", duration.clone()),
            ("resolution", media.resolution.clone()),
            ("audio_filename", audio_filename.clone()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        append_metadata_row(&self.metadata_file, &row)?;

        let metrics: Metrics = [
            ("title", media.title),
            ("filename", filename),
            ("duration_seconds", duration),
            ("audio_filename", audio_filename),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Ok(Completion::new(LedgerStatus::Success).with_metrics(metrics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ExecutionContext, ManualClock, RetryPolicy, StageExecutor};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Writes a fake video and audio file instead of calling yt-dlp
    struct FakeFetcher {
        fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MediaFetcher for FakeFetcher {
        async fn expand(&self, url: &str) -> Result<Vec<String>> {
            if url.contains("playlist") {
                Ok(vec![
                    "https://www.youtube.com/watch?v=p1".into(),
                    "https://www.youtube.com/watch?v=p2".into(),
                ])
            } else {
                Ok(vec![url.to_string()])
            }
        }

        async fn fetch(&self, url: &str, videos_dir: &Path) -> Result<FetchedMedia> {
            self.fetched.lock().unwrap().push(url.to_string());
            let id = url.rsplit('=').next().unwrap_or("video");
            let video_path = videos_dir.join(format!("{}.mp4", id));
            fs_err::write(&video_path, "video")?;
            Ok(FetchedMedia {
                video_path,
                title: format!("Case {}", id),
                channel: "Eye Channel".into(),
                duration_seconds: Some(300.0),
                resolution: "854x480".into(),
            })
        }

        async fn extract_audio(&self, video: &Path, audio_dir: &Path) -> Result<PathBuf> {
            let stem = video.file_stem().unwrap().to_string_lossy().into_owned();
            let path = audio_dir.join(format!("{}.wav", stem));
            fs_err::write(&path, "audio")?;
            Ok(path)
        }
    }

    fn stage(dir: &Path, fetcher: Arc<FakeFetcher>) -> DownloadStage {
        DownloadStage::new(
            StageSettings {
                name: "download",
                ledger_path: dir.join("videos/download_log.csv"),
                output_dir: dir.join("videos"),
                artifact_extension: None,
                aggregate_file: None,
                delay: Duration::from_secs(1),
                retry: RetryPolicy::SingleAttempt,
                max_items: None,
                vocabulary: vocabulary(),
            },
            dir.join("links.txt"),
            dir.join("videos/video_metadata.csv"),
            dir.join("audio"),
            fetcher,
        )
    }

    #[tokio::test]
    async fn test_download_expands_playlists_and_records_metadata() {
        let dir = TempDir::new().unwrap();
        fs_err::write(
            dir.path().join("links.txt"),
            "# list\nhttps://www.youtube.com/playlist?list=x\nhttps://www.youtube.com/watch?v=p1\n",
        )
        .unwrap();
        let fetcher = Arc::new(FakeFetcher { fetched: Mutex::new(Vec::new()) });
        let stage = stage(dir.path(), fetcher.clone());
        let context = ExecutionContext::new(Arc::new(ManualClock::new()));

        let report = StageExecutor::new(&stage, &context).run().await.unwrap();
        assert_eq!(report.succeeded, 2);

        let table = Table::from_csv(&dir.path().join("videos/video_metadata.csv")).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0]["filename"], "p1.mp4");
        assert_eq!(table.rows[0]["audio_filename"], "p1.wav");
        assert_eq!(table.rows[1]["url"], "https://www.youtube.com/watch?v=p2");

        let again = StageExecutor::new(&stage, &context).run().await.unwrap();
        assert_eq!(again.succeeded, 0);
        assert_eq!(again.skipped, 2);
        assert_eq!(fetcher.fetched.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_links_file_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let stage = stage(dir.path(), Arc::new(FakeFetcher { fetched: Mutex::new(Vec::new()) }));
        let context = ExecutionContext::new(Arc::new(ManualClock::new()));

        let err = StageExecutor::new(&stage, &context).run().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_repair_audio_extracts_missing_tracks() {
        let dir = TempDir::new().unwrap();
        fs_err::create_dir_all(dir.path().join("videos")).unwrap();
        fs_err::create_dir_all(dir.path().join("audio")).unwrap();
        fs_err::write(dir.path().join("videos/a.mp4"), "").unwrap();
        fs_err::write(dir.path().join("videos/b.webm"), "").unwrap();
        fs_err::write(dir.path().join("videos/notes.txt"), "").unwrap();
        fs_err::write(dir.path().join("audio/a.wav"), "").unwrap();

        let stage = stage(dir.path(), Arc::new(FakeFetcher { fetched: Mutex::new(Vec::new()) }));
        assert_eq!(stage.repair_audio().await.unwrap(), (1, 0));
        assert!(dir.path().join("audio/b.wav").exists());
        assert_eq!(stage.repair_audio().await.unwrap(), (0, 0));
    }
}
