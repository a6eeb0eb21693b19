use anyhow::{Context, Result};
use std::path::Path;
use url::Url;

/// Video container extensions recognised when matching files by stem
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "avi", "mkv", "webm", "flv", "m4v", "wmv", "mpeg", "mpg",
];

/// Validate a URL and return normalized version
pub fn validate_and_normalize_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|_| anyhow::anyhow!("Invalid URL format: {}", url))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("URL must use HTTP or HTTPS protocol");
    }

    Ok(parsed.to_string())
}

/// Read the links file: one URL per line, blank lines and `#` comments skipped.
///
/// Lines are kept verbatim since they double as stable ids; lines that are
/// not HTTP(S) URLs are dropped with a warning.
pub fn load_video_links(path: &Path) -> Result<Vec<String>> {
    let content = fs_err::read_to_string(path)
        .with_context(|| format!("Failed to read video links from {}", path.display()))?;

    let mut links = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match validate_and_normalize_url(line) {
            Ok(_) => links.push(line.to_string()),
            Err(e) => tracing::warn!("Skipping link '{}': {}", line, e),
        }
    }

    tracing::info!("Loaded {} URL(s) from {}", links.len(), path.display());
    Ok(links)
}

/// Format duration in human-readable format
pub fn format_duration(seconds: f64) -> String {
    let total_seconds = seconds as u64;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let secs = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// `MM:SS` with minutes allowed past 59, as used in refined transcripts
pub fn format_mm_ss(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// Whether `path` has one of the known video extensions (case-insensitive)
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Video file in `videos_dir` whose stem equals `stem`, ignoring case
pub fn find_matching_video(videos_dir: &Path, stem: &str) -> Option<String> {
    let target = stem.to_lowercase();
    let entries = fs_err::read_dir(videos_dir).ok()?;

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_video_file(path))
        .filter(|path| {
            path.file_stem()
                .map(|s| s.to_string_lossy().to_lowercase() == target)
                .unwrap_or(false)
        })
        .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();

    names.sort();
    names.into_iter().next()
}

/// Returns the tools from `commands` that cannot be run
pub async fn check_dependencies(commands: &[&str]) -> Vec<String> {
    let mut missing = Vec::new();

    for command in commands {
        if !check_command_available(command).await {
            missing.push(command.to_string());
        }
    }

    missing
}

/// Check if a command is available in PATH
async fn check_command_available(command: &str) -> bool {
    use tokio::process::Command;

    // ffmpeg only understands the single-dash form
    let flag = if command == "ffmpeg" { "-version" } else { "--version" };

    Command::new(command)
        .arg(flag)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.0), "30s");
        assert_eq!(format_duration(90.0), "1m 30s");
        assert_eq!(format_duration(3661.0), "1h 1m 1s");
    }

    #[test]
    fn test_format_mm_ss() {
        assert_eq!(format_mm_ss(0.0), "00:00");
        assert_eq!(format_mm_ss(65.9), "01:05");
        assert_eq!(format_mm_ss(3725.0), "62:05");
    }

    #[test]
    fn test_validate_and_normalize_url() {
        assert!(validate_and_normalize_url("https://example.com").is_ok());
        assert!(validate_and_normalize_url("http://example.com").is_ok());
        assert!(validate_and_normalize_url("ftp://example.com").is_err());
        assert!(validate_and_normalize_url("not-a-url").is_err());
    }

    #[test]
    fn test_load_video_links_skips_comments_and_blanks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("links.txt");
        fs_err::write(
            &path,
            "# cataract playlist\nhttps://www.youtube.com/watch?v=a\n\n  https://youtu.be/b  \nnot a url\n",
        )
        .unwrap();

        let links = load_video_links(&path).unwrap();
        assert_eq!(links, vec!["https://www.youtube.com/watch?v=a", "https://youtu.be/b"]);
    }

    #[test]
    fn test_load_video_links_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(load_video_links(&dir.path().join("missing.txt")).is_err());
    }

    #[test]
    fn test_find_matching_video_ignores_case_and_non_videos() {
        let dir = TempDir::new().unwrap();
        fs_err::write(dir.path().join("Case 12.MP4"), "").unwrap();
        fs_err::write(dir.path().join("case 13.txt"), "").unwrap();

        assert_eq!(find_matching_video(dir.path(), "case 12"), Some("Case 12.MP4".to_string()));
        assert_eq!(find_matching_video(dir.path(), "case 13"), None);
        assert_eq!(find_matching_video(&dir.path().join("missing"), "x"), None);
    }

    #[tokio::test]
    async fn test_check_dependencies_reports_missing_tool() {
        let missing = check_dependencies(&["definitely-not-an-installed-tool-xyz"]).await;
        assert_eq!(missing, vec!["definitely-not-an-installed-tool-xyz".to_string()]);
    }
}
