use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Options;
use crate::console::Console;
use crate::error::{JobError, RunemError};
use crate::registry::{JobContext, JobRegistry};
use crate::scheduler::{FileListLookup, Job, JobRunMetadata, JobTiming, RunningJobs};
use crate::worker::progress::{ProgressMonitor, ProgressState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Pending,
    Skipped,
    Empty,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseState::Pending => write!(f, "pending"),
            PhaseState::Skipped => write!(f, "skipped"),
            PhaseState::Empty => write!(f, "empty"),
            PhaseState::Running => write!(f, "running"),
            PhaseState::Completed => write!(f, "completed"),
            PhaseState::Failed => write!(f, "failed"),
        }
    }
}

/// Resolve a `--procs` value to a worker count; `-1` (or any value below
/// one) means every available core.
pub fn resolve_max_workers(procs: i64) -> usize {
    if procs >= 1 {
        procs as usize
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Settings shared by every phase of a run.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Process-count hint passed through to jobs, `-1` for all cores.
    pub procs: i64,
    pub max_workers: usize,
    pub root_path: PathBuf,
    pub verbose: bool,
    pub show_progress: bool,
}

impl ExecutorSettings {
    pub fn new(root_path: impl Into<PathBuf>, procs: i64) -> Self {
        Self {
            procs,
            max_workers: resolve_max_workers(procs),
            root_path: root_path.into(),
            verbose: false,
            show_progress: false,
        }
    }
}

/// Result of running a single phase.
#[derive(Debug)]
pub struct PhaseOutcome {
    pub phase: String,
    pub state: PhaseState,
    pub workers: usize,
    /// Timing and reports of every job that ran, in dispatch order.
    pub metadata: Vec<JobRunMetadata>,
    pub error: Option<RunemError>,
    pub progress: Option<ProgressState>,
}

/// Runs one phase at a time on a bounded pool of tasks.
pub struct PhaseExecutor {
    registry: Arc<JobRegistry>,
    options: Arc<Options>,
    files: Arc<FileListLookup>,
    settings: ExecutorSettings,
    console: Console,
    shutdown: CancellationToken,
}

impl PhaseExecutor {
    pub fn new(
        registry: Arc<JobRegistry>,
        options: Arc<Options>,
        files: Arc<FileListLookup>,
        settings: ExecutorSettings,
        console: Console,
    ) -> Self {
        Self {
            registry,
            options,
            files,
            settings,
            console,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop dispatching once `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Run every job of `phase` and wait for all of them.
    ///
    /// Returns only once the pool has drained, so no job of a later phase can
    /// overlap with this one. Every job is dispatched exactly once, even after
    /// a sibling failed; the first failure is returned in
    /// [`PhaseOutcome::error`] and failed jobs keep a `": failed"` timing.
    /// Only an interrupt stops dispatch early.
    pub async fn run_phase(&self, phase: &str, jobs: &[Arc<Job>]) -> PhaseOutcome {
        if jobs.is_empty() {
            return PhaseOutcome {
                phase: phase.to_string(),
                state: PhaseState::Empty,
                workers: 0,
                metadata: Vec::new(),
                error: None,
                progress: None,
            };
        }

        let workers = self.settings.max_workers.min(jobs.len()).max(1);
        self.console.log(format!(
            "Running '{}' with {} workers processing {} jobs",
            phase,
            workers,
            jobs.len()
        ));
        tracing::info!(phase, workers, jobs = jobs.len(), "Phase started");

        let running = RunningJobs::new();
        let still_running = CancellationToken::new();
        let monitor = if self.settings.show_progress {
            Some(
                ProgressMonitor::new(phase, jobs.len(), workers, running.clone())
                    .attached_to(self.console.clone())
                    .spawn(still_running.clone()),
            )
        } else {
            None
        };

        let permits = Arc::new(Semaphore::new(workers));
        let mut pool = JoinSet::new();
        let mut dispatched = 0;

        for (index, job) in jobs.iter().enumerate() {
            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if self.shutdown.is_cancelled() {
                tracing::warn!(phase, label = %job.label, "Not dispatching job after interrupt");
                break;
            }

            let ctx = JobContext::new(
                self.options.clone(),
                Vec::new(),
                self.settings.procs,
                self.settings.root_path.clone(),
                self.settings.verbose,
                job.clone(),
                self.console.clone(),
            );
            let files = self.files.clone();
            let registry = self.registry.clone();
            let running = running.clone();
            let label = job.label.clone();

            pool.spawn(async move {
                let _permit = permit;
                let start = Instant::now();
                // A nested task turns a panicking body into an error that
                // still knows which job it came from.
                let result = match tokio::spawn(execute_job(ctx, files, registry, running)).await {
                    Ok(result) => result,
                    Err(e) => Err(JobFailure {
                        source: JobError::Panicked(e.to_string()),
                        timing: Some(JobTiming::failed(&label, start.elapsed())),
                    }),
                };
                (index, result)
            });
            dispatched += 1;
        }

        let mut finished: Vec<(usize, JobRunMetadata)> = Vec::with_capacity(dispatched);
        let mut error: Option<RunemError> = None;
        while let Some(joined) = pool.join_next().await {
            let (index, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!(phase, error = %e, "Pool task was lost");
                    continue;
                }
            };
            match result {
                Ok(metadata) => finished.push((index, metadata)),
                Err(JobFailure { source, timing }) => {
                    if let Some(timing) = timing {
                        finished.push((index, JobRunMetadata { timing, report: None }));
                    }
                    let label = jobs[index].label.clone();
                    tracing::error!(phase, label = %label, error = %source, "Job failed");
                    if error.is_none() {
                        error = Some(RunemError::JobFailed {
                            phase: phase.to_string(),
                            label,
                            source,
                        });
                    }
                }
            }
        }

        still_running.cancel();
        let progress = match monitor {
            Some(handle) => match handle.await {
                Ok(state) => Some(state),
                Err(e) => {
                    tracing::warn!(phase, error = %e, "Progress monitor did not stop cleanly");
                    None
                }
            },
            None => None,
        };

        finished.sort_by_key(|(index, _)| *index);
        let state = if error.is_some() {
            PhaseState::Failed
        } else {
            PhaseState::Completed
        };
        tracing::info!(phase, state = %state, dispatched, "Phase finished");

        PhaseOutcome {
            phase: phase.to_string(),
            state,
            workers,
            metadata: finished.into_iter().map(|(_, m)| m).collect(),
            error,
            progress,
        }
    }
}

/// A job that did not succeed, with its timing if its body got to run.
struct JobFailure {
    source: JobError,
    timing: Option<JobTiming>,
}

impl From<JobError> for JobFailure {
    fn from(source: JobError) -> Self {
        Self {
            source,
            timing: None,
        }
    }
}

/// Body of one pool task: gather files, run the job, time it.
async fn execute_job(
    mut ctx: JobContext,
    files: Arc<FileListLookup>,
    registry: Arc<JobRegistry>,
    running: RunningJobs,
) -> Result<JobRunMetadata, JobFailure> {
    let label = ctx.label.clone();
    if ctx.verbose {
        ctx.console.log(format!("START: {}", label));
    }
    // Registered before anything can return, so every job is published as
    // finished when the guard drops.
    let guard = running.register(&label);

    ctx.file_list = ctx.job.files(&files);
    if ctx.file_list.is_empty() {
        ctx.console
            .log(format!("WARNING: skipping job '{}', no files for job", label));
        return Ok(JobRunMetadata {
            timing: JobTiming::no_files(&label),
            report: None,
        });
    }

    let body = registry
        .resolve(&ctx.job.invocation)
        .map_err(|e| JobError::Failed(e.to_string()))?;

    if ctx.verbose {
        ctx.console.log(format!("job: running {}", label));
    }
    let start = Instant::now();
    let result = body.run(&ctx).await;
    let duration = start.elapsed();
    drop(guard);

    let report = match result {
        Ok(report) => report,
        Err(source) => {
            let mut timing = JobTiming::failed(&label, duration);
            timing.commands = ctx.sub_job_times();
            return Err(JobFailure {
                source,
                timing: Some(timing),
            });
        }
    };
    if ctx.verbose {
        ctx.console.log(format!("DONE: {}: {:?}", label, duration));
    }
    tracing::debug!(label = %label, duration = ?duration, "Job done");

    Ok(JobRunMetadata {
        timing: JobTiming {
            label,
            duration,
            commands: ctx.sub_job_times(),
        },
        report,
    })
}
