//! Reduces the configured jobs to the ones selected on the command line.

use std::collections::BTreeSet;

use crate::console::Console;
use crate::scheduler::job::Job;
use crate::scheduler::phases::PhaseGroupedJobs;

/// The name, phase and tag criteria for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSelection {
    pub jobs_to_run: BTreeSet<String>,
    /// Phases to run, in the order they should run.
    pub phases_to_run: Vec<String>,
    pub tags_to_run: BTreeSet<String>,
    pub tags_to_avoid: BTreeSet<String>,
    pub verbose: bool,
}

impl JobSelection {
    pub fn runs_phase(&self, phase: &str) -> bool {
        self.phases_to_run.iter().any(|p| p == phase)
    }
}

/// Why a job was left out of a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    NoMatchingTags,
    NotInJobNames,
    HasAvoidedTags(BTreeSet<String>),
}

/// First exclusion reason that applies to `job`, if any.
pub fn exclusion_for(job: &Job, selection: &JobSelection) -> Option<Exclusion> {
    let tags = job.tag_set();
    if !tags
        .iter()
        .any(|t| selection.tags_to_run.contains(*t))
    {
        return Some(Exclusion::NoMatchingTags);
    }
    if !selection.jobs_to_run.contains(&job.label) {
        return Some(Exclusion::NotInJobNames);
    }
    let avoided: BTreeSet<String> = tags
        .iter()
        .filter(|t| selection.tags_to_avoid.contains(**t))
        .map(|t| t.to_string())
        .collect();
    if !avoided.is_empty() {
        return Some(Exclusion::HasAvoidedTags(avoided));
    }
    None
}

/// Sorted, quoted rendering of a set, e.g. `'a', 'b'`.
pub fn printable_set<'a, I>(items: I) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    let sorted: BTreeSet<&String> = items.into_iter().collect();
    sorted
        .iter()
        .map(|item| format!("'{}'", item))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Filter `all_jobs` down to `selection`, keeping the declared phase order.
///
/// Phases missing from the selection are left out entirely. Selected phases
/// with no matching jobs are kept with an empty list.
pub fn filter_jobs(
    all_jobs: &PhaseGroupedJobs,
    selection: &JobSelection,
    console: &Console,
) -> PhaseGroupedJobs {
    let mut summary = Vec::new();
    if !selection.tags_to_run.is_empty() {
        summary.push(format!(
            "filtering for tags {}",
            printable_set(&selection.tags_to_run)
        ));
    }
    if !selection.tags_to_avoid.is_empty() {
        summary.push(format!(
            "excluding jobs with tags {}",
            printable_set(&selection.tags_to_avoid)
        ));
    }
    if !summary.is_empty() {
        console.log(summary.join(", "));
    }

    let mut filtered = PhaseGroupedJobs::new();
    for (phase, jobs) in all_jobs.iter() {
        if !selection.runs_phase(phase) {
            console.log(format!("skipping phase '{}'", phase));
            continue;
        }
        filtered.add_phase(phase);

        for job in jobs {
            match exclusion_for(job, selection) {
                None => {
                    filtered.add_job(job.clone());
                }
                Some(reason) => {
                    if selection.verbose {
                        console.log(exclusion_message(&job.label, &reason, selection));
                    }
                }
            }
        }

        let kept = filtered.jobs(phase).unwrap_or_default();
        if kept.is_empty() {
            console.log(format!(
                "No jobs for phase '{}' tags {}",
                phase,
                printable_set(&selection.tags_to_run)
            ));
            continue;
        }

        console.log(format!("will run {} jobs for phase '{}'", kept.len(), phase));
        let labels: Vec<String> = kept.iter().map(|j| format!("'{}'", j.label)).collect();
        console.log(format!("\t[{}]", labels.join(", ")));
    }
    filtered
}

fn exclusion_message(label: &str, reason: &Exclusion, selection: &JobSelection) -> String {
    match reason {
        Exclusion::NoMatchingTags => format!(
            "not running job '{}' because it doesn't have any of the following tags: {}",
            label,
            printable_set(&selection.tags_to_run)
        ),
        Exclusion::NotInJobNames => format!(
            "not running job '{}' because it isn't in the list of job names. See --jobs and --not-jobs",
            label
        ),
        Exclusion::HasAvoidedTags(tags) => format!(
            "not running job '{}' because it contains the following tags: {}",
            label,
            printable_set(tags)
        ),
    }
}
