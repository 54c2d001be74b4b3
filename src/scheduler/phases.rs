use std::sync::Arc;

use crate::scheduler::job::{Job, PhaseName};

/// Jobs grouped by phase, phases in run order, jobs in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseGroupedJobs {
    groups: Vec<(PhaseName, Vec<Arc<Job>>)>,
}

impl PhaseGroupedJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty groups for every phase in `order`.
    pub fn with_phases<I, S>(order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut grouped = Self::new();
        for phase in order {
            grouped.add_phase(phase);
        }
        grouped
    }

    /// Append a phase at the end of the order. Adding an existing phase is a no-op.
    pub fn add_phase(&mut self, phase: impl Into<String>) {
        let phase = phase.into();
        if !self.contains_phase(&phase) {
            self.groups.push((phase, Vec::new()));
        }
    }

    /// Append a job to its phase's group. Returns false if the phase is unknown.
    pub fn add_job(&mut self, job: Arc<Job>) -> bool {
        match self.groups.iter_mut().find(|(name, _)| *name == job.phase) {
            Some((_, jobs)) => {
                jobs.push(job);
                true
            }
            None => false,
        }
    }

    pub fn contains_phase(&self, phase: &str) -> bool {
        self.groups.iter().any(|(name, _)| name == phase)
    }

    pub fn jobs(&self, phase: &str) -> Option<&[Arc<Job>]> {
        self.groups
            .iter()
            .find(|(name, _)| name == phase)
            .map(|(_, jobs)| jobs.as_slice())
    }

    pub fn phases(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Arc<Job>])> {
        self.groups
            .iter()
            .map(|(name, jobs)| (name.as_str(), jobs.as_slice()))
    }

    /// Total number of jobs across every phase.
    pub fn job_count(&self) -> usize {
        self.groups.iter().map(|(_, jobs)| jobs.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
