//! Terminal reporting for reconciliation runs

use colored::Colorize;

use reconcile::{HostReport, RunReport, RunSummary};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print the per-host results and the run total.
pub fn print_report(report: &RunReport, dry_run: bool) {
    println!();
    for host in &report.hosts {
        print_host(host);
    }

    let total = report.summary();
    println!();
    if dry_run {
        println!("{} {}", "dry run".yellow().bold(), summary_line(&total));
    } else if report.is_success() {
        println!("{} {}", "✓".green().bold(), summary_line(&total));
    } else {
        println!("{} {}", "✗".red().bold(), summary_line(&total));
    }
}

fn print_host(host: &HostReport) {
    let marker = if host.is_success() {
        "✓".green()
    } else {
        "✗".red()
    };
    println!("{marker} {} {}", host.host.bold(), summary_line(&host.summary).dimmed());
    if let Some(error) = &host.error {
        println!("  {}", error.red());
    }
}

/// One line of counts, omitting zero buckets so a quiet run stays quiet.
fn summary_line(summary: &RunSummary) -> String {
    let mut parts = Vec::new();
    for (count, label) in [
        (summary.created, "created"),
        (summary.replaced, "replaced"),
        (summary.unchanged, "unchanged"),
        (summary.removed, "removed"),
        (summary.failed, "failed"),
        (summary.skipped, "skipped"),
    ] {
        if count > 0 {
            parts.push(format!("{count} {label}"));
        }
    }
    if parts.is_empty() {
        "nothing to do".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::ApplyOutcome;

    #[test]
    fn summary_line_omits_zero_buckets() {
        let mut summary = RunSummary::default();
        summary.record(&ApplyOutcome::Created);
        summary.record(&ApplyOutcome::Created);
        summary.record(&ApplyOutcome::Failed {
            error: "boom".to_string(),
        });
        assert_eq!(summary_line(&summary), "2 created, 1 failed");
    }

    #[test]
    fn empty_summary_reads_as_nothing_to_do() {
        assert_eq!(summary_line(&RunSummary::default()), "nothing to do");
    }
}
