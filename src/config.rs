//! `.runem.yml` loading and validation.
//!
//! The file is a YAML list. Exactly one entry is a `config` node declaring
//! phases, file filters and options; every other entry is a `job` or a
//! `hook`:
//!
//! ```yaml
//! - config:
//!     phases: [edit, analysis]
//!     files:
//!       - filter: {tag: py, regex: ".*\\.py$"}
//!     options:
//!       - option: {name: fix, default: true, desc: "apply fixes", aliases: [f]}
//! - job:
//!     label: black
//!     command: black .
//!     when: {phase: edit, tags: [py]}
//! - hook:
//!     hook_name: on-exit
//!     command: echo done
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunemError};
use crate::registry::JobRegistry;
use crate::scheduler::{Invocation, Job, PhaseGroupedJobs};

pub const CONFIG_FILE_NAME: &str = ".runem.yml";

/// Option name → value, handed read-only to every job.
pub type Options = BTreeMap<String, bool>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigEntry {
    #[serde(default)]
    pub config: Option<GlobalConfig>,
    #[serde(default)]
    pub job: Option<JobConfig>,
    #[serde(default)]
    pub hook: Option<HookConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Run order. Jobs that edit files go in earlier phases than jobs that
    /// analyse them, so reported line numbers stay valid.
    pub phases: Vec<String>,
    #[serde(default)]
    pub files: Vec<FileFilterEntry>,
    #[serde(default)]
    pub options: Vec<OptionEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFilterEntry {
    pub filter: TagFileFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFileFilter {
    pub tag: String,
    pub regex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionEntry {
    pub option: OptionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionConfig {
    pub name: String,
    pub default: bool,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAddress {
    pub file: String,
    pub function: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCtx {
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobWhen {
    pub phase: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub addr: Option<JobAddress>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub ctx: Option<JobCtx>,
    pub when: JobWhen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookName {
    #[serde(rename = "on-exit")]
    OnExit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    pub hook_name: HookName,
    #[serde(default)]
    pub addr: Option<JobAddress>,
    #[serde(default)]
    pub command: Option<String>,
}

/// A lifecycle hook, run after the report with the run's final metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hook {
    pub name: HookName,
    pub invocation: Invocation,
}

/// Everything the config says can be run.
#[derive(Debug, Clone)]
pub struct ConfigMetadata {
    pub cfg_filepath: PathBuf,
    pub phases: Vec<String>,
    pub options_config: Vec<OptionConfig>,
    /// Tag → compiled file regex.
    pub file_filters: BTreeMap<String, Regex>,
    pub jobs: PhaseGroupedJobs,
    pub all_job_names: BTreeSet<String>,
    pub all_job_phases: BTreeSet<String>,
    pub all_job_tags: BTreeSet<String>,
    pub hooks: Vec<Hook>,
}

impl ConfigMetadata {
    /// Directory holding the config file; jobs run relative to it.
    pub fn root_dir(&self) -> PathBuf {
        self.cfg_filepath
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn default_options(&self) -> Options {
        self.options_config
            .iter()
            .map(|o| (o.name.clone(), o.default))
            .collect()
    }

    pub fn hooks_named(&self, name: HookName) -> impl Iterator<Item = &Hook> {
        self.hooks.iter().filter(move |h| h.name == name)
    }
}

fn invalid(path: &Path, reason: impl Into<String>) -> RunemError {
    RunemError::InvalidConfig {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn invocation_of(
    path: &Path,
    what: &str,
    addr: &Option<JobAddress>,
    command: &Option<String>,
) -> Result<Invocation> {
    match (addr, command) {
        (Some(addr), None) => Ok(Invocation::Address {
            file: addr.file.clone(),
            function: addr.function.clone(),
        }),
        (None, Some(command)) => Ok(Invocation::Command(command.clone())),
        (Some(_), Some(_)) => Err(invalid(
            path,
            format!("{} has both 'addr' and 'command', use one", what),
        )),
        (None, None) => Err(invalid(path, format!("{} needs an 'addr' or a 'command'", what))),
    }
}

/// Walk up from `start_dir` looking for `.runem.yml`.
pub fn find_config(start_dir: &Path) -> Result<PathBuf> {
    let mut dir = Some(start_dir);
    while let Some(candidate_dir) = dir {
        let candidate = candidate_dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        dir = candidate_dir.parent();
    }
    Err(RunemError::ConfigNotFound(start_dir.to_path_buf()))
}

pub fn parse_entries(path: &Path, content: &str) -> Result<Vec<ConfigEntry>> {
    serde_yaml::from_str(content).map_err(|e| invalid(path, e.to_string()))
}

/// Find, read and validate the config above `start_dir`.
pub fn load_config(start_dir: &Path, registry: &JobRegistry) -> Result<ConfigMetadata> {
    let path = find_config(start_dir)?;
    let content = std::fs::read_to_string(&path)?;
    let entries = parse_entries(&path, &content)?;
    let metadata = parse_config(&entries, &path, registry)?;
    tracing::debug!(
        path = %path.display(),
        phases = metadata.phases.len(),
        jobs = metadata.jobs.job_count(),
        "Loaded config"
    );
    Ok(metadata)
}

/// Validate raw entries into [`ConfigMetadata`].
///
/// Rejects a missing or repeated `config` node, duplicate phases, duplicate
/// job labels, jobs in undeclared phases, bad file regexes and job addresses
/// that are not in `registry`.
pub fn parse_config(
    entries: &[ConfigEntry],
    cfg_filepath: &Path,
    registry: &JobRegistry,
) -> Result<ConfigMetadata> {
    let mut global: Option<&GlobalConfig> = None;
    let mut job_configs = Vec::new();
    let mut hooks = Vec::new();

    for (idx, entry) in entries.iter().enumerate() {
        match (&entry.config, &entry.job, &entry.hook) {
            (Some(config), None, None) => {
                if global.is_some() {
                    return Err(invalid(cfg_filepath, "found more than one 'config' entry"));
                }
                global = Some(config);
            }
            (None, Some(job), None) => job_configs.push(job),
            (None, None, Some(hook)) => {
                let invocation = invocation_of(cfg_filepath, "hook", &hook.addr, &hook.command)?;
                if !registry.contains(&invocation) {
                    return Err(RunemError::UnknownJobFunction(invocation.to_string()));
                }
                hooks.push(Hook {
                    name: hook.hook_name,
                    invocation,
                });
            }
            _ => {
                return Err(invalid(
                    cfg_filepath,
                    format!(
                        "entry {} must hold exactly one of 'config', 'job' or 'hook'",
                        idx
                    ),
                ))
            }
        }
    }

    let global = global.ok_or_else(|| invalid(cfg_filepath, "missing the 'config' entry"))?;

    let mut phases: Vec<String> = Vec::new();
    for phase in &global.phases {
        if phases.contains(phase) {
            return Err(invalid(cfg_filepath, format!("phase '{}' declared twice", phase)));
        }
        phases.push(phase.clone());
    }

    let mut file_filters = BTreeMap::new();
    for entry in &global.files {
        let regex = Regex::new(&entry.filter.regex).map_err(|e| {
            invalid(
                cfg_filepath,
                format!("bad regex for tag '{}': {}", entry.filter.tag, e),
            )
        })?;
        file_filters.insert(entry.filter.tag.clone(), regex);
    }

    let mut option_names = BTreeSet::new();
    let mut options_config = Vec::new();
    for entry in &global.options {
        if !option_names.insert(entry.option.name.clone()) {
            return Err(invalid(
                cfg_filepath,
                format!("option '{}' declared twice", entry.option.name),
            ));
        }
        options_config.push(entry.option.clone());
    }

    let mut jobs = PhaseGroupedJobs::with_phases(phases.iter().cloned());
    let mut all_job_names = BTreeSet::new();
    let mut all_job_phases = BTreeSet::new();
    let mut all_job_tags = BTreeSet::new();

    for job_config in job_configs {
        let invocation = invocation_of(cfg_filepath, "job", &job_config.addr, &job_config.command)?;
        let label = match (&job_config.label, &invocation) {
            (Some(label), _) => label.clone(),
            (None, Invocation::Address { function, .. }) => function.clone(),
            (None, Invocation::Command(command)) => command.clone(),
        };
        if !all_job_names.insert(label.clone()) {
            return Err(invalid(cfg_filepath, format!("duplicate job label '{}'", label)));
        }
        if !registry.contains(&invocation) {
            return Err(RunemError::UnknownJobFunction(invocation.to_string()));
        }

        let phase = job_config.when.phase.clone();
        let mut job = Job::new(label.clone(), phase.clone(), invocation)
            .with_tags(job_config.when.tags.iter().cloned());
        if let Some(cwd) = job_config.ctx.as_ref().and_then(|c| c.cwd.clone()) {
            job = job.with_cwd(cwd);
        }
        all_job_tags.extend(job.tags.iter().cloned());
        if !jobs.add_job(Arc::new(job)) {
            return Err(invalid(
                cfg_filepath,
                format!(
                    "job '{}' is in phase '{}' which is not one of {:?}",
                    label, phase, phases
                ),
            ));
        }
        all_job_phases.insert(phase);
    }

    Ok(ConfigMetadata {
        cfg_filepath: cfg_filepath.to_path_buf(),
        phases,
        options_config,
        file_filters,
        jobs,
        all_job_names,
        all_job_phases,
        all_job_tags,
        hooks,
    })
}
