use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Pseudo-phase holding framework overhead timings (pre-build, run-phases).
pub const APP_PHASE: &str = "_app";

pub type PhaseName = String;
pub type JobTag = String;

/// How a job's body is located.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invocation {
    /// A function registered in the [`JobRegistry`](crate::registry::JobRegistry)
    /// under `file::function`.
    Address { file: String, function: String },
    /// A shell command line run through `sh -c`.
    Command(String),
}

impl Invocation {
    /// Key used to look the body up in the job registry.
    pub fn registry_key(&self) -> Option<String> {
        match self {
            Invocation::Address { file, function } => Some(format!("{}::{}", file, function)),
            Invocation::Command(_) => None,
        }
    }
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Invocation::Address { file, function } => write!(f, "{}::{}", file, function),
            Invocation::Command(cmd) => write!(f, "`{}`", cmd),
        }
    }
}

/// Static description of a job. Built once at configuration-load time and
/// shared read-only by every worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub label: String,
    /// Kept in declaration order; that order decides how a job's file list
    /// is concatenated.
    pub tags: Vec<JobTag>,
    pub phase: PhaseName,
    pub invocation: Invocation,
    /// Relative to the configuration root.
    pub cwd: Option<PathBuf>,
}

impl Job {
    pub fn new(label: impl Into<String>, phase: impl Into<String>, invocation: Invocation) -> Self {
        Self {
            label: label.into(),
            tags: Vec::new(),
            phase: phase.into(),
            invocation,
            cwd: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            let tag = tag.into();
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn tag_set(&self) -> BTreeSet<&str> {
        self.tags.iter().map(String::as_str).collect()
    }

    /// Effective working directory for this job under `root`.
    pub fn working_dir(&self, root: &std::path::Path) -> PathBuf {
        match &self.cwd {
            Some(cwd) if !cwd.as_os_str().is_empty() => root.join(cwd),
            _ => root.to_path_buf(),
        }
    }

    /// Concatenate the file lists of every tag on this job.
    ///
    /// Files matched by more than one of the job's tags appear once per tag.
    pub fn files(&self, lookup: &FileListLookup) -> Vec<String> {
        let mut files = Vec::new();
        for tag in &self.tags {
            if let Some(tagged) = lookup.get(tag) {
                files.extend(tagged.iter().cloned());
            }
        }
        files
    }
}

/// Tag → sorted file paths, as produced by file discovery.
pub type FileListLookup = HashMap<JobTag, Vec<String>>;

/// An artifact a job points the user at, e.g. a coverage report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportUrl {
    pub description: String,
    pub url: String,
}

impl ReportUrl {
    pub fn new(description: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    #[serde(rename = "reportUrls")]
    pub report_urls: Vec<Option<ReportUrl>>,
}

impl JobReport {
    pub fn with_url(mut self, description: impl Into<String>, url: impl Into<String>) -> Self {
        self.report_urls.push(Some(ReportUrl::new(description, url)));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTiming {
    pub label: String,
    pub duration: Duration,
    /// Named timings of the external tools the job ran, in run order.
    pub commands: Vec<(String, Duration)>,
}

impl JobTiming {
    pub fn new(label: impl Into<String>, duration: Duration) -> Self {
        Self {
            label: label.into(),
            duration,
            commands: Vec::new(),
        }
    }

    pub fn no_files(label: &str) -> Self {
        Self::new(format!("{}: no files!", label), Duration::ZERO)
    }

    pub fn failed(label: &str, duration: Duration) -> Self {
        Self::new(format!("{}: failed", label), duration)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRunMetadata {
    pub timing: JobTiming,
    pub report: Option<JobReport>,
}

/// Phase name (or [`APP_PHASE`]) → metadata of every job that ran in it.
pub type RunResult = HashMap<PhaseName, Vec<JobRunMetadata>>;
