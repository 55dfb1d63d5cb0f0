use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::ledger::FailureRecord;
use crate::orchestrator::{PhaseResult, PhaseStatus, RunObserver, RunSummary};
use crate::phase::Phase;
use crate::ui::icons::{CHECK, CLOCK, CROSS, RUNNING, SKIP, SPARKLE, STOP};

/// Terminal UI for a scan run, rendered via `indicatif` progress bars.
///
/// Two bars are stacked vertically:
/// - Phase bar, tracking how many phases have finished
/// - Spinner, showing the phase currently executing
pub struct RunUI {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    spinner: ProgressBar,
    verbose: bool,
}

impl RunUI {
    pub fn new(total_phases: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let phase_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let phase_bar = multi.add(ProgressBar::new(total_phases));
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("Phases");

        let spinner_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg} {elapsed:.dim}")
            .expect("progress bar template is a valid static string");
        let spinner = multi.add(ProgressBar::new_spinner());
        spinner.set_style(spinner_style);
        spinner.set_prefix("   Now");

        Self {
            multi,
            phase_bar,
            spinner,
            verbose,
        }
    }

    /// Hidden UI for non-interactive output (JSON logs, tests).
    pub fn hidden() -> Self {
        let ui = Self::new(0, false);
        ui.multi
            .set_draw_target(indicatif::ProgressDrawTarget::hidden());
        ui
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` if the rich UI fails.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn print_header(&self, target: &str, resume: bool, policy: &str) {
        self.print_line(format!("{}", style("═".repeat(70)).cyan()));
        self.print_line(format!(
            "{} Scanning {} {}",
            SPARKLE,
            style(target).bold(),
            style(format!(
                "({}{})",
                policy,
                if resume { ", resumed" } else { "" }
            ))
            .dim()
        ));
        self.print_line(format!("{}", style("═".repeat(70)).cyan()));
    }

    pub fn interrupted(&self, signal: &str) {
        self.print_line(format!(
            "\n{} {} received, stopping tools...",
            STOP,
            style(signal).yellow().bold()
        ));
    }

    /// Stop all bars and clear the spinner.
    pub fn finish(&self) {
        self.spinner.finish_and_clear();
        self.phase_bar.finish();
    }

    /// Print the end-of-run summary: completed, failed and skipped phases.
    pub fn print_summary(&self, summary: &RunSummary, failures: &[FailureRecord]) {
        self.finish();
        println!();
        println!("{}", style("Run summary").bold().underlined());
        for result in &summary.results {
            println!("  {}", format_result(result));
        }
        println!(
            "\n  {} completed, {} failed, {} skipped",
            style(summary.completed().len()).green(),
            style(summary.failed().len()).red(),
            style(summary.skipped().len()).dim()
        );
        if summary.halted {
            println!("  {} halted after first failure (fail-fast)", STOP);
        }
        if summary.interrupted {
            println!("  {} interrupted", STOP);
        }
        if !failures.is_empty() {
            println!("\n  {}", style("Failures:").red().bold());
            for failure in failures {
                println!(
                    "    {} [{}] {}",
                    style(&failure.phase).red(),
                    failure.group,
                    failure.reason
                );
            }
        }
    }
}

impl RunObserver for RunUI {
    fn phase_started(&self, phase: &Phase) {
        self.spinner.set_message(format!(
            "{} {}",
            style(&phase.id).yellow(),
            style(&phase.name).dim()
        ));
        self.spinner.enable_steady_tick(Duration::from_millis(100));
        self.phase_bar
            .set_message(format!("{}", style(&phase.id).yellow()));
        if self.verbose {
            self.print_line(format!("{}{}", RUNNING, style(&phase.id).bold()));
        }
    }

    fn phase_finished(&self, _phase: &Phase, result: &PhaseResult) {
        self.phase_bar.inc(1);
        self.spinner.set_message(String::new());
        let skipped = matches!(result.status, PhaseStatus::Skipped(_));
        if !skipped || self.verbose {
            self.print_line(format!("  {}", format_result(result)));
        }
    }
}

fn format_result(result: &PhaseResult) -> String {
    match result.status {
        PhaseStatus::Completed => format!(
            "{}{} {} {}",
            CHECK,
            style(&result.phase).green().bold(),
            result.summary.as_deref().unwrap_or_default(),
            style(format!("{}{}", CLOCK, format_duration(result.duration))).dim()
        ),
        PhaseStatus::Failed => format!(
            "{}{} {}",
            CROSS,
            style(&result.phase).red().bold(),
            result.error.as_deref().unwrap_or_default()
        ),
        PhaseStatus::Skipped(reason) => format!(
            "{}{} {}",
            SKIP,
            style(&result.phase).dim(),
            style(format!("skipped ({})", reason)).dim()
        ),
    }
}

/// Formats as `Xs` or `Xm Ys` when >= 60 seconds.
fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::SkipReason;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
    }

    #[test]
    fn test_format_result_mentions_reason() {
        console::set_colors_enabled(false);
        let failed = format_result(&PhaseResult::failed("dns", "boom", Duration::ZERO));
        assert!(failed.contains("dns"));
        assert!(failed.contains("boom"));

        let skipped = format_result(&PhaseResult::skipped("web", SkipReason::AlreadyCompleted));
        assert!(skipped.contains("already completed"));
    }
}
