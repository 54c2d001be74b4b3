//! One complete run: discover files, select jobs, execute phases in order,
//! report, then fire on-exit hooks.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigMetadata, HookName, Options};
use crate::console::Console;
use crate::error::{Result, RunemError};
use crate::files::{self, FileListLookup};
use crate::registry::{JobContext, JobRegistry};
use crate::report::{aggregate, ReportStyle, RunReport, RunSummary};
use crate::scheduler::filter::printable_set;
use crate::scheduler::{filter_jobs, Job, JobRunMetadata, JobSelection, JobTiming, RunResult, APP_PHASE};
use crate::worker::pool::{ExecutorSettings, PhaseExecutor, PhaseState};
use crate::worker::progress::ProgressState;

/// Job, tag, phase and option choices as given on the command line.
///
/// `None` for `jobs`, `tags` or `phases` means "everything the config has".
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub jobs: Option<Vec<String>>,
    pub not_jobs: Vec<String>,
    pub tags: Option<Vec<String>>,
    pub not_tags: Vec<String>,
    pub phases: Option<Vec<String>>,
    pub not_phases: Vec<String>,
    pub options_on: Vec<String>,
    pub options_off: Vec<String>,
    pub verbose: bool,
}

fn check_choices(kind: &str, values: &[String], choices: &BTreeSet<String>) -> Result<()> {
    for value in values {
        if !choices.contains(value) {
            return Err(RunemError::InvalidFilter {
                kind: kind.to_string(),
                value: value.clone(),
                choices: printable_set(choices),
            });
        }
    }
    Ok(())
}

impl RunRequest {
    /// Validate against `config` and turn into a [`JobSelection`].
    ///
    /// Phases keep the order given with `--phases`, minus `--not-phases`.
    pub fn selection(&self, config: &ConfigMetadata) -> Result<JobSelection> {
        let all_phases: BTreeSet<String> = config.phases.iter().cloned().collect();
        let jobs = self
            .jobs
            .clone()
            .unwrap_or_else(|| config.all_job_names.iter().cloned().collect());
        let tags = self
            .tags
            .clone()
            .unwrap_or_else(|| config.all_job_tags.iter().cloned().collect());
        let phases = self.phases.clone().unwrap_or_else(|| config.phases.clone());

        check_choices("only-job-name", &jobs, &config.all_job_names)?;
        check_choices("exclude-job-name", &self.not_jobs, &config.all_job_names)?;
        check_choices("only-tag", &tags, &config.all_job_tags)?;
        check_choices("exclude-tag", &self.not_tags, &config.all_job_tags)?;
        check_choices("only-phase", &phases, &all_phases)?;
        check_choices("exclude-phase", &self.not_phases, &all_phases)?;

        let not_jobs: BTreeSet<&String> = self.not_jobs.iter().collect();
        let not_tags: BTreeSet<&String> = self.not_tags.iter().collect();
        let mut phases_to_run: Vec<String> = Vec::new();
        for phase in phases {
            if !self.not_phases.contains(&phase) && !phases_to_run.contains(&phase) {
                phases_to_run.push(phase);
            }
        }

        Ok(JobSelection {
            jobs_to_run: jobs.into_iter().filter(|j| !not_jobs.contains(j)).collect(),
            phases_to_run,
            tags_to_run: tags.into_iter().filter(|t| !not_tags.contains(t)).collect(),
            tags_to_avoid: self.not_tags.iter().cloned().collect(),
            verbose: self.verbose,
        })
    }

    /// Config defaults with the `--<option>` / `--no-<option>` switches
    /// applied; "off" wins when both are given.
    pub fn options(&self, config: &ConfigMetadata) -> Options {
        let mut options = config.default_options();
        for name in &self.options_on {
            options.insert(name.clone(), true);
        }
        for name in &self.options_off {
            options.insert(name.clone(), false);
        }
        options
    }
}

/// Per-run settings.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub selection: JobSelection,
    pub options: Options,
    pub procs: i64,
    pub root: PathBuf,
    pub verbose: bool,
    pub show_progress: bool,
    pub report_style: ReportStyle,
    pub report_json: Option<PathBuf>,
    /// When the run began, for the wall-clock and `pre-build` timings.
    pub started: Instant,
    pub started_at: DateTime<Utc>,
}

impl RunSettings {
    pub fn new(selection: JobSelection, options: Options, root: impl Into<PathBuf>) -> Self {
        Self {
            verbose: selection.verbose,
            selection,
            options,
            procs: -1,
            root: root.into(),
            show_progress: false,
            report_style: ReportStyle::default(),
            report_json: None,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Time the run from an earlier point, e.g. before the config was loaded.
    pub fn timed_from(mut self, started: Instant, started_at: DateTime<Utc>) -> Self {
        self.started = started;
        self.started_at = started_at;
        self
    }
}

/// What happened during a run.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_result: RunResult,
    /// Every declared phase with what happened to it, in run order; phases
    /// left out of the selection come last.
    pub phase_states: Vec<(String, PhaseState)>,
    pub progress: Vec<ProgressState>,
    pub report: RunReport,
    pub summary: Arc<RunSummary>,
    /// The run's terminal error, surfaced only after the report was printed.
    pub error: Option<RunemError>,
}

impl RunOutcome {
    pub fn state_of(&self, phase: &str) -> Option<PhaseState> {
        self.phase_states
            .iter()
            .find(|(name, _)| name == phase)
            .map(|(_, state)| *state)
    }

    pub fn into_result(self) -> Result<Arc<RunSummary>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.summary),
        }
    }
}

pub struct Runner {
    config: ConfigMetadata,
    registry: Arc<JobRegistry>,
    console: Console,
    shutdown: CancellationToken,
}

impl Runner {
    pub fn new(config: ConfigMetadata, registry: JobRegistry, console: Console) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            console,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &ConfigMetadata {
        &self.config
    }

    /// Discover files with git, then run.
    pub async fn run(&self, settings: &RunSettings) -> Result<RunOutcome> {
        let files = files::find_files(&settings.root, &self.config.file_filters).await?;
        self.console.log(files::summary_line(&files));
        Ok(self.run_with_files(settings, files).await)
    }

    /// Run against an already built file lookup.
    pub async fn run_with_files(&self, settings: &RunSettings, files: FileListLookup) -> RunOutcome {
        let mut run_result = RunResult::new();
        let filtered = filter_jobs(&self.config.jobs, &settings.selection, &self.console);

        run_result.insert(
            APP_PHASE.to_string(),
            vec![app_timing("pre-build", settings.started.elapsed())],
        );

        let mut executor_settings = ExecutorSettings::new(settings.root.clone(), settings.procs);
        executor_settings.verbose = settings.verbose;
        executor_settings.show_progress = settings.show_progress && !settings.verbose;
        let executor = PhaseExecutor::new(
            self.registry.clone(),
            Arc::new(settings.options.clone()),
            Arc::new(files),
            executor_settings,
            self.console.clone(),
        )
        .with_shutdown(self.shutdown.clone());

        let run_order: Vec<String> = settings
            .selection
            .phases_to_run
            .iter()
            .filter(|p| self.config.phases.contains(p))
            .cloned()
            .collect();

        let phases_start = Instant::now();
        let mut error: Option<RunemError> = None;
        let mut phase_states = Vec::new();
        let mut progress = Vec::new();

        for phase in &run_order {
            if error.is_some() {
                phase_states.push((phase.clone(), PhaseState::Pending));
                continue;
            }
            if self.shutdown.is_cancelled() {
                error = Some(RunemError::Interrupted(phase.clone()));
                phase_states.push((phase.clone(), PhaseState::Pending));
                continue;
            }
            let jobs = filtered.jobs(phase).unwrap_or_default();
            if jobs.is_empty() {
                // already reported by the filter
                phase_states.push((phase.clone(), PhaseState::Empty));
                continue;
            }
            if settings.verbose {
                self.console.log(format!("Running Phase {}", phase));
            }

            let outcome = executor.run_phase(phase, jobs).await;
            run_result.insert(phase.clone(), outcome.metadata);
            phase_states.push((phase.clone(), outcome.state));
            progress.extend(outcome.progress);
            if let Some(e) = outcome.error {
                error = Some(e);
            }
        }
        for phase in &self.config.phases {
            if !run_order.contains(phase) {
                phase_states.push((phase.clone(), PhaseState::Skipped));
            }
        }

        if let Some(app) = run_result.get_mut(APP_PHASE) {
            app.push(app_timing("run-phases", phases_start.elapsed()));
        }

        let report = aggregate(&run_order, &run_result, settings.started.elapsed());
        report.print(&self.console, settings.report_style);
        if let Some(e) = &error {
            self.console.log(format!("ERROR: {}", e));
        }
        self.console.log(report.summary_line(error.is_some()));

        let states: Vec<(String, String)> = phase_states
            .iter()
            .map(|(phase, state)| (phase.clone(), state.to_string()))
            .collect();
        let summary = Arc::new(RunSummary::new(
            settings.started_at,
            &report,
            &states,
            &run_result,
            error.as_ref().map(|e| e.to_string()),
        ));

        if let Some(path) = &settings.report_json {
            if let Err(e) = write_summary(path, &summary).await {
                tracing::error!(path = %path.display(), error = %e, "Failed to write JSON report");
                self.console
                    .log(format!("WARNING: could not write {}: {}", path.display(), e));
                if error.is_none() {
                    error = Some(e);
                }
            }
        }

        self.run_exit_hooks(settings, &summary).await;

        RunOutcome {
            run_result,
            phase_states,
            progress,
            report,
            summary,
            error,
        }
    }

    /// Hook failures are reported but never change the run's result.
    async fn run_exit_hooks(&self, settings: &RunSettings, summary: &Arc<RunSummary>) {
        for hook in self.config.hooks_named(HookName::OnExit) {
            let label = format!("on-exit: {}", hook.invocation);
            let body = match self.registry.resolve(&hook.invocation) {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(hook = %label, error = %e, "Hook not runnable");
                    continue;
                }
            };
            let job = Arc::new(Job::new(label.clone(), APP_PHASE, hook.invocation.clone()));
            let ctx = JobContext::new(
                Arc::new(settings.options.clone()),
                Vec::new(),
                settings.procs,
                settings.root.clone(),
                settings.verbose,
                job,
                self.console.clone(),
            )
            .with_run_summary(summary.clone());

            tracing::debug!(hook = %label, "Running hook");
            if let Err(e) = body.run(&ctx).await {
                tracing::warn!(hook = %label, error = %e, "Hook failed");
                self.console
                    .log(format!("WARNING: hook '{}' failed: {}", label, e));
            }
        }
    }
}

fn app_timing(label: &str, duration: std::time::Duration) -> JobRunMetadata {
    JobRunMetadata {
        timing: JobTiming::new(label, duration),
        report: None,
    }
}

async fn write_summary(path: &std::path::Path, summary: &RunSummary) -> Result<()> {
    let json = summary.to_json()?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_config, parse_entries};

    fn config() -> ConfigMetadata {
        let content = r#"
- config:
    phases: [edit, analysis, test]
    options:
      - option: {name: fix, default: true}
      - option: {name: coverage, default: false}
- job: {label: black, command: "true", when: {phase: edit, tags: [py]}}
- job: {label: eslint, command: "true", when: {phase: analysis, tags: [js]}}
- job: {label: pytest, command: "true", when: {phase: test, tags: [py, slow]}}
"#;
        let path = PathBuf::from("/repo/.runem.yml");
        let entries = parse_entries(&path, content).unwrap();
        parse_config(&entries, &path, &JobRegistry::new()).unwrap()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_request_selects_everything() {
        let cfg = config();
        let selection = RunRequest::default().selection(&cfg).unwrap();
        assert_eq!(selection.phases_to_run, strings(&["edit", "analysis", "test"]));
        assert_eq!(selection.jobs_to_run.len(), 3);
        assert_eq!(selection.tags_to_run.len(), 3);
        assert!(selection.tags_to_avoid.is_empty());
    }

    #[test]
    fn exclusions_are_subtracted() {
        let cfg = config();
        let request = RunRequest {
            not_jobs: strings(&["eslint"]),
            not_tags: strings(&["slow"]),
            not_phases: strings(&["analysis"]),
            ..RunRequest::default()
        };
        let selection = request.selection(&cfg).unwrap();
        assert!(!selection.jobs_to_run.contains("eslint"));
        assert!(!selection.tags_to_run.contains("slow"));
        assert!(selection.tags_to_avoid.contains("slow"));
        assert_eq!(selection.phases_to_run, strings(&["edit", "test"]));
    }

    #[test]
    fn phases_keep_the_requested_order() {
        let cfg = config();
        let request = RunRequest {
            phases: Some(strings(&["test", "edit"])),
            ..RunRequest::default()
        };
        let selection = request.selection(&cfg).unwrap();
        assert_eq!(selection.phases_to_run, strings(&["test", "edit"]));
    }

    #[test]
    fn unknown_names_are_rejected_with_choices() {
        let cfg = config();
        let request = RunRequest {
            tags: Some(strings(&["rust"])),
            ..RunRequest::default()
        };
        let err = request.selection(&cfg).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid only-tag 'rust', choose from one of 'js', 'py', 'slow'"
        );

        let request = RunRequest {
            not_phases: strings(&["deploy"]),
            ..RunRequest::default()
        };
        assert!(matches!(
            request.selection(&cfg),
            Err(RunemError::InvalidFilter { ref kind, .. }) if kind == "exclude-phase"
        ));
    }

    #[test]
    fn option_switches_override_defaults() {
        let cfg = config();
        let request = RunRequest {
            options_on: strings(&["coverage"]),
            options_off: strings(&["fix"]),
            ..RunRequest::default()
        };
        let options = request.options(&cfg);
        assert_eq!(options.get("coverage"), Some(&true));
        assert_eq!(options.get("fix"), Some(&false));
    }
}
