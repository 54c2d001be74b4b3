//! Live progress for a running phase.
//!
//! The monitor samples the [`RunningJobs`] registry on a short interval and
//! renders `"{phase}: {completed}/{total} ({workers}): {running}"` on a
//! spinner until the phase executor cancels it.

use std::collections::BTreeSet;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::console::Console;
use crate::scheduler::{RunningJobs, RunningSnapshot};

pub const SAMPLE_PERIOD: Duration = Duration::from_millis(100);

/// What the monitor has inferred about a phase so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressState {
    phase: String,
    total: usize,
    workers: usize,
    seen_jobs: BTreeSet<String>,
    completed_jobs: BTreeSet<String>,
    last_running: BTreeSet<String>,
}

impl ProgressState {
    pub fn new(phase: impl Into<String>, total: usize, workers: usize) -> Self {
        Self {
            phase: phase.into(),
            total,
            workers,
            ..Self::default()
        }
    }

    /// Fold one registry sample into the state and return the display line.
    pub fn observe(&mut self, snapshot: &RunningSnapshot) -> String {
        let running = &snapshot.running;

        let mut done: BTreeSet<String> = self.last_running.difference(running).cloned().collect();

        // Once the pool is retiring, a job can start and finish between two
        // samples. Anything seen earlier and no longer running is done.
        let remaining = self.total.saturating_sub(self.completed_jobs.len());
        if remaining <= self.workers {
            done.extend(self.seen_jobs.difference(running).cloned());
        }

        // Jobs publish themselves on deregistration, which covers the rest.
        done.extend(snapshot.finished.iter().cloned());

        self.completed_jobs.extend(done);
        self.seen_jobs.extend(running.iter().cloned());
        self.last_running = running.clone();
        self.message()
    }

    pub fn message(&self) -> String {
        let running: Vec<&str> = self.last_running.iter().map(String::as_str).collect();
        format!(
            "{}: {}/{} ({}): {}",
            self.phase,
            self.completed(),
            self.total,
            self.workers,
            running.join(", ")
        )
    }

    pub fn completed(&self) -> usize {
        self.completed_jobs.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn seen(&self) -> usize {
        self.seen_jobs.len()
    }
}

/// Concurrent observer for one phase's pool.
pub struct ProgressMonitor {
    state: ProgressState,
    registry: RunningJobs,
    bar: ProgressBar,
    period: Duration,
    console: Option<Console>,
}

impl ProgressMonitor {
    /// A monitor that draws a spinner. Use [`ProgressMonitor::hidden`] when
    /// there is no terminal to draw on.
    pub fn new(phase: &str, total: usize, workers: usize, registry: RunningJobs) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        Self::with_bar(phase, total, workers, registry, bar)
    }

    pub fn hidden(phase: &str, total: usize, workers: usize, registry: RunningJobs) -> Self {
        Self::with_bar(phase, total, workers, registry, ProgressBar::hidden())
    }

    fn with_bar(
        phase: &str,
        total: usize,
        workers: usize,
        registry: RunningJobs,
        bar: ProgressBar,
    ) -> Self {
        Self {
            state: ProgressState::new(phase, total, workers),
            registry,
            bar,
            period: SAMPLE_PERIOD,
            console: None,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Keep `console` output from tearing the spinner while it is drawn.
    pub fn attached_to(mut self, console: Console) -> Self {
        self.console = Some(console);
        self
    }

    /// Start sampling until `running` is cancelled. The handle resolves to
    /// the final state and must be awaited before the next phase starts.
    pub fn spawn(self, running: CancellationToken) -> JoinHandle<ProgressState> {
        tokio::spawn(self.run(running))
    }

    async fn run(mut self, running: CancellationToken) -> ProgressState {
        if let Some(console) = &self.console {
            console.attach_progress(self.bar.clone());
        }
        let mut interval = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = running.cancelled() => break,
                _ = interval.tick() => {
                    let msg = self.state.observe(&self.registry.snapshot());
                    self.bar.set_message(msg);
                }
            }
        }
        // One last sample so the final count covers jobs that finished
        // after the previous tick.
        self.state.observe(&self.registry.snapshot());
        if let Some(console) = &self.console {
            console.detach_progress();
        }
        self.bar.finish_and_clear();
        tracing::debug!(
            phase = %self.state.phase,
            completed = self.state.completed(),
            total = self.state.total(),
            "Progress monitor stopped"
        );
        self.state
    }
}
