use console::style;

use crate::cli::StageSelector;
use crate::stages::{LedgerDigest, StageResult};
use crate::utils::format_duration;

/// One line per stage of a finished run
pub fn format_run_summary(results: &[(&str, StageResult)]) -> String {
    let mut lines = Vec::new();

    for (name, result) in results {
        let line = match result {
            StageResult::Completed(report) => {
                let mut parts = vec![
                    format!("{} ok", report.succeeded),
                    format!("{} rejected", report.rejected),
                    format!("{} errored", report.errored),
                    format!("{} skipped", report.skipped),
                ];
                if report.deferred > 0 {
                    parts.push(format!("{} deferred", report.deferred));
                }
                if report.backfilled > 0 {
                    parts.push(format!("{} backfilled", report.backfilled));
                }
                format!("{} {:<15} {}", style("✓").green(), name, parts.join(", "))
            }
            StageResult::Skipped(reason) => {
                format!("{} {:<15} skipped: {}", style("-").yellow(), name, reason)
            }
            StageResult::Failed(reason) => {
                format!("{} {:<15} failed: {}", style("✗").red(), name, reason)
            }
        };
        lines.push(line);
    }

    lines.join("\n")
}

/// Ledger counts as a small table
pub fn format_status(digests: &[LedgerDigest]) -> String {
    let mut lines = vec![format!(
        "{:<15} {:>6} {:>6}  {}",
        style("stage").bold(),
        style("rows").bold(),
        style("done").bold(),
        style("statuses").bold()
    )];

    for digest in digests {
        if !digest.exists {
            lines.push(format!(
                "{:<15} {:>6} {:>6}  {}",
                digest.stage,
                "-",
                "-",
                style("no ledger yet").dim()
            ));
            continue;
        }

        if let Some(reason) = &digest.unreadable {
            lines.push(format!(
                "{:<15} {:>6} {:>6}  {}",
                digest.stage,
                "?",
                "?",
                style(format!("unreadable: {}", reason)).red()
            ));
            continue;
        }

        let statuses = digest
            .by_status
            .iter()
            .map(|(status, count)| format!("{}={}", status, count))
            .collect::<Vec<_>>()
            .join(" ");
        lines.push(format!(
            "{:<15} {:>6} {:>6}  {}",
            digest.stage, digest.rows, digest.completed, statuses
        ));
    }

    lines.join("\n")
}

pub fn print_run_summary(results: &[(&str, StageResult)], elapsed_seconds: f64) {
    println!("\n{}", style("Run summary").bold());
    println!("{}", format_run_summary(results));
    println!("Finished in {}", format_duration(elapsed_seconds));
}

pub fn print_status(digests: &[LedgerDigest]) {
    println!("{}", format_status(digests));
}

pub fn print_stages() {
    println!("Pipeline stages (in order):");
    for stage in StageSelector::ORDER {
        println!("  • {:<15} {}", stage.name(), stage.description());
    }
}
