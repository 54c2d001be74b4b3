//! Timing report, time-saved arithmetic and the machine-readable summary.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::console::Console;
use crate::scheduler::{JobTiming, ReportUrl, RunResult, APP_PHASE};

const BAR_WIDTH: usize = 40;

/// How timing lines are drawn. Both styles carry the same numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportStyle {
    /// Aligned seconds followed by a horizontal bar.
    #[default]
    Bars,
    /// `label: Ns`
    Plain,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportLine {
    pub label: String,
    pub duration: Duration,
}

impl ReportLine {
    fn new(label: impl Into<String>, duration: Duration) -> Self {
        Self {
            label: label.into(),
            duration,
        }
    }
}

/// Everything the aggregator worked out about a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub wall_clock: Duration,
    /// Sum of every non-zero job duration; what a serial run would cost.
    pub system_time: Duration,
    /// `system_time - wall_clock`. Negative when parallelism did not pay off.
    pub time_saved: TimeDelta,
    pub lines: Vec<ReportLine>,
    /// Report artifacts in phase order, null entries dropped.
    pub artifacts: Vec<ReportUrl>,
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

pub fn delta_secs(d: TimeDelta) -> f64 {
    match d.num_nanoseconds() {
        Some(nanos) => nanos as f64 / 1e9,
        None => d.num_seconds() as f64,
    }
}

/// Collate per-phase timings into a [`RunReport`].
///
/// `phase_order` decides the listing order. `_app` entries are listed at the
/// top under `runem` and never count towards the system time.
pub fn aggregate(phase_order: &[String], run_result: &RunResult, wall_clock: Duration) -> RunReport {
    let mut lines = vec![ReportLine::new("runem", wall_clock)];
    if let Some(app) = run_result.get(APP_PHASE) {
        for metadata in app {
            lines.push(ReportLine::new(
                format!("├runem.{}", metadata.timing.label),
                metadata.timing.duration,
            ));
        }
    }

    let mut system_time = Duration::ZERO;
    for (idx, phase) in phase_order.iter().enumerate() {
        let last_phase = idx + 1 == phase_order.len();
        let (phase_marker, phase_group) = if last_phase { ("└", " ") } else { ("├", "│") };

        let timings: Vec<&JobTiming> = run_result
            .get(phase)
            .map(|metas| metas.iter().map(|m| &m.timing).collect())
            .unwrap_or_default();
        let (phase_total, job_lines) = job_lines(phase, phase_group, &timings);

        lines.push(ReportLine::new(
            format!("{}{} (total)", phase_marker, phase),
            phase_total,
        ));
        lines.extend(job_lines);
        system_time += phase_total;
    }

    let artifacts = phase_order
        .iter()
        .filter_map(|phase| run_result.get(phase))
        .flatten()
        .filter_map(|m| m.report.as_ref())
        .flat_map(|r| r.report_urls.iter().flatten().cloned())
        .collect();

    RunReport {
        wall_clock,
        system_time,
        time_saved: to_delta(system_time) - to_delta(wall_clock),
        lines,
        artifacts,
    }
}

fn job_lines(phase: &str, phase_group: &str, timings: &[&JobTiming]) -> (Duration, Vec<ReportLine>) {
    let ran: Vec<&&JobTiming> = timings.iter().filter(|t| !t.duration.is_zero()).collect();
    let mut total = Duration::ZERO;
    let mut lines = Vec::new();

    for (idx, timing) in ran.iter().enumerate() {
        let last_job = idx + 1 == ran.len();
        let (job_marker, sub_group) = if last_job { ("└", " ") } else { ("├", "│") };
        lines.push(ReportLine::new(
            format!("{}{}{}.{}", phase_group, job_marker, phase, timing.label),
            timing.duration,
        ));
        total += timing.duration;

        // a single sub-command adds nothing over the job line
        if timing.commands.len() <= 1 {
            continue;
        }
        for (sub_idx, (sub_label, sub_duration)) in timing.commands.iter().enumerate() {
            let sub_marker = if sub_idx + 1 == timing.commands.len() { "└" } else { "├" };
            lines.push(ReportLine::new(
                format!(
                    "{}{}{}{}.{}.{}",
                    phase_group, sub_group, sub_marker, phase, timing.label, sub_label
                ),
                *sub_duration,
            ));
        }
    }
    (total, lines)
}

impl RunReport {
    pub fn render(&self, style: ReportStyle) -> Vec<String> {
        match style {
            ReportStyle::Plain => self
                .lines
                .iter()
                .map(|l| format!("{}: {:.3}s", l.label, l.duration.as_secs_f64()))
                .collect(),
            ReportStyle::Bars => self.render_bars(),
        }
    }

    fn render_bars(&self) -> Vec<String> {
        let label_width = self
            .lines
            .iter()
            .map(|l| l.label.chars().count())
            .max()
            .unwrap_or(0);
        let secs: Vec<String> = self
            .lines
            .iter()
            .map(|l| format!("{:.3}", l.duration.as_secs_f64()))
            .collect();
        let secs_width = secs.iter().map(String::len).max().unwrap_or(0);
        let longest = self
            .lines
            .iter()
            .map(|l| l.duration)
            .max()
            .unwrap_or_default();

        self.lines
            .iter()
            .zip(&secs)
            .map(|(line, secs)| {
                let bar = if longest.is_zero() {
                    0
                } else {
                    (line.duration.as_secs_f64() / longest.as_secs_f64() * BAR_WIDTH as f64)
                        .round() as usize
                };
                let pad = label_width - line.label.chars().count();
                format!(
                    "{}{}  [{:>w$}]  {}",
                    line.label,
                    " ".repeat(pad),
                    secs,
                    "▇".repeat(bar),
                    w = secs_width
                )
                .trim_end()
                .to_string()
            })
            .collect()
    }

    pub fn artifact_lines(&self) -> Vec<String> {
        self.artifacts
            .iter()
            .map(|a| format!("report: {}: {}", a.description, a.url))
            .collect()
    }

    /// Print the timing listing then the artifacts.
    pub fn print(&self, console: &Console, style: ReportStyle) {
        console.log("reports:");
        for line in self.render(style) {
            match style {
                // bars are aligned from column zero
                ReportStyle::Bars => console.write_raw(&format!("{}\n", line)),
                ReportStyle::Plain => console.log(line),
            }
        }
        for line in self.artifact_lines() {
            console.log(line);
        }
    }

    /// `DONE: runem took: 1.5s, saving you 3.2s` or the failure variant.
    pub fn summary_line(&self, failed: bool) -> String {
        let verb = if failed { "FAILED" } else { "DONE" };
        format!(
            "{}: runem took: {:.3}s, saving you {:.3}s",
            verb,
            self.wall_clock.as_secs_f64(),
            delta_secs(self.time_saved)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandSummary {
    pub label: String,
    pub seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub label: String,
    pub seconds: f64,
    pub commands: Vec<CommandSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSummary {
    pub name: String,
    pub state: String,
    pub jobs: Vec<JobSummary>,
}

/// Final metrics of a run. Written by `--report-json` and handed to on-exit
/// hooks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub wall_clock_secs: f64,
    pub system_time_secs: f64,
    pub time_saved_secs: f64,
    pub phases: Vec<PhaseSummary>,
    pub reports: Vec<ReportUrl>,
}

impl RunSummary {
    /// `phases` is `(name, state)` in run order.
    pub fn new(
        started_at: DateTime<Utc>,
        report: &RunReport,
        phases: &[(String, String)],
        run_result: &RunResult,
        error: Option<String>,
    ) -> Self {
        let phases = phases
            .iter()
            .map(|(name, state)| PhaseSummary {
                name: name.clone(),
                state: state.clone(),
                jobs: run_result
                    .get(name)
                    .map(|metas| {
                        metas
                            .iter()
                            .map(|m| JobSummary {
                                label: m.timing.label.clone(),
                                seconds: m.timing.duration.as_secs_f64(),
                                commands: m
                                    .timing
                                    .commands
                                    .iter()
                                    .map(|(label, d)| CommandSummary {
                                        label: label.clone(),
                                        seconds: d.as_secs_f64(),
                                    })
                                    .collect(),
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect();

        Self {
            started_at,
            success: error.is_none(),
            error,
            wall_clock_secs: report.wall_clock.as_secs_f64(),
            system_time_secs: report.system_time.as_secs_f64(),
            time_saved_secs: delta_secs(report.time_saved),
            phases,
            reports: report.artifacts.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
