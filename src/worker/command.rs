use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::JobError;
use crate::registry::{JobContext, JobFunction, JobResult};

/// One external tool invocation made from inside a job.
///
/// The process runs in the job's working directory and its duration is
/// recorded as a sub-command timing on the job.
#[derive(Debug, Clone)]
pub struct RunCommand {
    label: String,
    cmd: Vec<String>,
    env: Vec<(String, String)>,
    valid_exit_ids: Vec<i32>,
    ignore_fails: bool,
}

impl RunCommand {
    pub fn new<I, S>(label: impl Into<String>, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            cmd: cmd.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            valid_exit_ids: vec![0],
            ignore_fails: false,
        }
    }

    /// Exit codes treated as success. Some linters exit non-zero on success.
    pub fn valid_exit_ids(mut self, ids: impl IntoIterator<Item = i32>) -> Self {
        self.valid_exit_ids = ids.into_iter().collect();
        self
    }

    /// Return empty output instead of failing on a bad exit code.
    pub fn ignore_fails(mut self, ignore: bool) -> Self {
        self.ignore_fails = ignore;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn display_cmd(&self) -> String {
        self.cmd.join(" ")
    }

    /// Run the command and return its combined stdout and stderr.
    pub async fn run(&self, ctx: &JobContext) -> Result<String, JobError> {
        let shown = self.display_cmd();
        let Some((program, args)) = self.cmd.split_first() else {
            return Err(JobError::Failed(format!("'{}' has an empty command", self.label)));
        };

        if ctx.verbose {
            ctx.console
                .log(format!("running: start: {}: {}", self.label, shown));
        }
        tracing::debug!(label = %self.label, cwd = %ctx.cwd.display(), command = %shown, "Running command");

        let start = Instant::now();
        let result = Command::new(program)
            .args(args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&ctx.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;
        ctx.record_sub_job_time(self.label.clone(), start.elapsed());

        let output = match result {
            Ok(output) => output,
            Err(source) => {
                tracing::error!(label = %self.label, error = %source, "Command failed to start");
                return Err(JobError::Spawn {
                    label: self.label.clone(),
                    command: shown,
                    source,
                });
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let exit_code = output.status.code();
        let ok = exit_code.is_some_and(|code| self.valid_exit_ids.contains(&code));

        if ctx.verbose {
            for line in text.lines() {
                ctx.console.log(format!("{}: {}", self.label, line));
            }
        }

        if !ok {
            tracing::debug!(label = %self.label, exit_code = ?exit_code, "Command exited with bad code");
            if self.ignore_fails {
                return Ok(String::new());
            }
            return Err(JobError::BadExitCode {
                label: self.label.clone(),
                command: shown,
                exit_code,
                output: text,
            });
        }

        if ctx.verbose {
            ctx.console
                .log(format!("running: done: {}: {}", self.label, shown));
        }
        Ok(text)
    }
}

/// Shorthand for running `cmd` with default settings.
pub async fn run_command<I, S>(ctx: &JobContext, label: &str, cmd: I) -> Result<String, JobError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    RunCommand::new(label, cmd).run(ctx).await
}

/// Body for jobs declared with an inline `command:`.
#[derive(Debug, Clone)]
pub struct ShellJob {
    command: String,
}

impl ShellJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl JobFunction for ShellJob {
    async fn run(&self, ctx: &JobContext) -> JobResult {
        let mut cmd = RunCommand::new(ctx.label.clone(), ["sh", "-c", self.command.as_str()]);
        if let Some(summary) = &ctx.run_summary {
            cmd = cmd
                .env("RUNEM_SUCCESS", summary.success.to_string())
                .env("RUNEM_WALL_CLOCK_SECS", format!("{:.3}", summary.wall_clock_secs))
                .env("RUNEM_TIME_SAVED_SECS", format!("{:.3}", summary.time_saved_secs));
        }
        cmd.run(ctx).await?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::config::Options;
    use crate::console::{Console, SharedBuffer};
    use crate::scheduler::{Invocation, Job};

    fn context(cwd: Option<&str>, verbose: bool) -> (JobContext, SharedBuffer) {
        let mut job = Job::new("sh", "check", Invocation::Command("true".into()));
        if let Some(cwd) = cwd {
            job = job.with_cwd(cwd);
        }
        let (console, buf) = Console::buffered();
        let ctx = JobContext::new(
            Arc::new(Options::new()),
            vec![],
            1,
            std::env::temp_dir(),
            verbose,
            Arc::new(job),
            console,
        );
        (ctx, buf)
    }

    #[tokio::test]
    async fn captures_output_and_records_timing() {
        let (ctx, _) = context(None, false);
        let out = run_command(&ctx, "echo", ["echo", "hello"]).await.unwrap();
        assert_eq!(out, "hello\n");
        let times = ctx.sub_job_times();
        assert_eq!(times.len(), 1);
        assert_eq!(times[0].0, "echo");
    }

    #[tokio::test]
    async fn bad_exit_code_is_an_error_with_output() {
        let (ctx, _) = context(None, false);
        let err = RunCommand::new("fail", ["sh", "-c", "echo broken >&2; exit 2"])
            .run(&ctx)
            .await
            .unwrap_err();
        match err {
            JobError::BadExitCode {
                exit_code, output, ..
            } => {
                assert_eq!(exit_code, Some(2));
                assert!(output.contains("broken"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        // failing commands are still timed
        assert_eq!(ctx.sub_job_times().len(), 1);
    }

    #[tokio::test]
    async fn valid_exit_ids_accept_non_zero() {
        let (ctx, _) = context(None, false);
        let out = RunCommand::new("three", ["sh", "-c", "echo ok; exit 3"])
            .valid_exit_ids([0, 3])
            .run(&ctx)
            .await
            .unwrap();
        assert_eq!(out, "ok\n");
    }

    #[tokio::test]
    async fn ignore_fails_returns_empty_output() {
        let (ctx, _) = context(None, false);
        let out = RunCommand::new("fail", ["sh", "-c", "echo nope; exit 1"])
            .ignore_fails(true)
            .run(&ctx)
            .await
            .unwrap();
        assert_eq!(out, "");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let (ctx, _) = context(None, false);
        let err = run_command(&ctx, "nope", ["nonexistent_command_12345"])
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Spawn { .. }));
    }

    #[tokio::test]
    async fn runs_in_the_job_working_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("web")).unwrap();
        let (console, _) = Console::buffered();
        let job = Arc::new(
            Job::new("pwd", "check", Invocation::Command("pwd".into())).with_cwd("web"),
        );
        let ctx = JobContext::new(
            Arc::new(Options::new()),
            vec![],
            1,
            dir.path().to_path_buf(),
            false,
            job,
            console,
        );
        let out = run_command(&ctx, "pwd", ["pwd"]).await.unwrap();
        let reported = PathBuf::from(out.trim()).canonicalize().unwrap();
        assert_eq!(reported, dir.path().join("web").canonicalize().unwrap());
    }

    #[tokio::test]
    async fn verbose_mode_traces_the_command() {
        let (ctx, buf) = context(None, true);
        run_command(&ctx, "greet", ["echo", "hi"]).await.unwrap();
        assert_eq!(
            buf.lines(),
            vec![
                "runem: running: start: greet: echo hi",
                "runem: greet: hi",
                "runem: running: done: greet: echo hi",
            ]
        );
    }

    #[tokio::test]
    async fn env_is_passed_through() {
        let (ctx, _) = context(None, false);
        let out = RunCommand::new("env", ["sh", "-c", "echo $RUNEM_TEST_VALUE"])
            .env("RUNEM_TEST_VALUE", "42")
            .run(&ctx)
            .await
            .unwrap();
        assert_eq!(out, "42\n");
    }

    #[tokio::test]
    async fn shell_job_fails_on_non_zero_exit() {
        let (ctx, _) = context(None, false);
        assert!(ShellJob::new("true").run(&ctx).await.unwrap().is_none());
        assert!(ShellJob::new("exit 1").run(&ctx).await.is_err());
    }
}
