//! Job bodies and the table they are looked up in.
//!
//! A job's `addr` in the config names a function registered here under
//! `file::function`. Inline `command` jobs need no registration and resolve
//! to a [`ShellJob`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Options;
use crate::console::Console;
use crate::error::{JobError, RunemError};
use crate::report::RunSummary;
use crate::scheduler::{Invocation, Job, JobReport};
use crate::worker::command::ShellJob;

pub type JobResult = std::result::Result<Option<JobReport>, JobError>;

/// Everything a job body is called with.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub options: Arc<Options>,
    pub file_list: Vec<String>,
    /// Requested process count, `-1` for "all cores".
    pub procs: i64,
    pub root_path: PathBuf,
    /// Resolved working directory; pass it to every process the job starts.
    pub cwd: PathBuf,
    pub verbose: bool,
    pub label: String,
    pub job: Arc<Job>,
    pub console: Console,
    /// Final metrics of the run; only set for on-exit hooks.
    pub run_summary: Option<Arc<RunSummary>>,
    sub_commands: Arc<Mutex<Vec<(String, Duration)>>>,
}

impl JobContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: Arc<Options>,
        file_list: Vec<String>,
        procs: i64,
        root_path: PathBuf,
        verbose: bool,
        job: Arc<Job>,
        console: Console,
    ) -> Self {
        let cwd = job.working_dir(&root_path);
        Self {
            options,
            file_list,
            procs,
            cwd,
            root_path,
            verbose,
            label: job.label.clone(),
            job,
            console,
            run_summary: None,
            sub_commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_run_summary(mut self, summary: Arc<RunSummary>) -> Self {
        self.run_summary = Some(summary);
        self
    }

    pub fn option(&self, name: &str) -> bool {
        self.options.get(name).copied().unwrap_or(false)
    }

    /// Record the time an external tool took, for the timing report.
    pub fn record_sub_job_time(&self, label: impl Into<String>, duration: Duration) {
        let mut commands = match self.sub_commands.lock() {
            Ok(commands) => commands,
            Err(poisoned) => poisoned.into_inner(),
        };
        commands.push((label.into(), duration));
    }

    pub fn sub_job_times(&self) -> Vec<(String, Duration)> {
        match self.sub_commands.lock() {
            Ok(commands) => commands.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// A unit of work the phase executor can invoke.
///
/// Failure is signalled by returning an error; the executor lets sibling
/// jobs finish and then stops the run.
#[async_trait]
pub trait JobFunction: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> JobResult;
}

/// Adapts a blocking closure into a [`JobFunction`]. The closure runs on
/// tokio's blocking pool so CPU-heavy bodies do not stall the scheduler.
pub struct BlockingJob<F> {
    body: Arc<F>,
}

impl<F> BlockingJob<F>
where
    F: Fn(&JobContext) -> JobResult + Send + Sync + 'static,
{
    pub fn new(body: F) -> Self {
        Self {
            body: Arc::new(body),
        }
    }
}

#[async_trait]
impl<F> JobFunction for BlockingJob<F>
where
    F: Fn(&JobContext) -> JobResult + Send + Sync + 'static,
{
    async fn run(&self, ctx: &JobContext) -> JobResult {
        let body = self.body.clone();
        let ctx = ctx.clone();
        match tokio::task::spawn_blocking(move || body(&ctx)).await {
            Ok(result) => result,
            Err(e) => Err(JobError::Panicked(e.to_string())),
        }
    }
}

/// Job functions keyed by `file::function`.
#[derive(Clone, Default)]
pub struct JobRegistry {
    functions: HashMap<String, Arc<dyn JobFunction>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.functions.keys().collect();
        keys.sort();
        f.debug_struct("JobRegistry").field("functions", &keys).finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, file: &str, function: &str, body: impl JobFunction + 'static) {
        self.functions
            .insert(format!("{}::{}", file, function), Arc::new(body));
    }

    pub fn register_blocking<F>(&mut self, file: &str, function: &str, body: F)
    where
        F: Fn(&JobContext) -> JobResult + Send + Sync + 'static,
    {
        self.register(file, function, BlockingJob::new(body));
    }

    pub fn contains(&self, invocation: &Invocation) -> bool {
        match invocation.registry_key() {
            Some(key) => self.functions.contains_key(&key),
            None => true,
        }
    }

    /// Find the body for `invocation`.
    pub fn resolve(&self, invocation: &Invocation) -> Result<Arc<dyn JobFunction>, RunemError> {
        match invocation {
            Invocation::Command(command) => Ok(Arc::new(ShellJob::new(command.clone()))),
            Invocation::Address { .. } => {
                let key = invocation.registry_key().unwrap_or_default();
                self.functions
                    .get(&key)
                    .cloned()
                    .ok_or(RunemError::UnknownJobFunction(key))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
