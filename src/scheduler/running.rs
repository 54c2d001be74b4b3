use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

#[derive(Debug, Default)]
struct RunningState {
    running: HashMap<Uuid, String>,
    finished: BTreeSet<String>,
}

/// Point-in-time copy of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunningSnapshot {
    pub running: BTreeSet<String>,
    pub finished: BTreeSet<String>,
}

/// Shared record of which jobs are executing right now.
///
/// Display only: nothing in scheduling reads it. A job deregisters when its
/// [`RunningJobGuard`] drops, which also publishes its label as finished.
#[derive(Debug, Clone, Default)]
pub struct RunningJobs {
    state: Arc<Mutex<RunningState>>,
}

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RunningState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record `label` as running under a fresh run-id.
    pub fn register(&self, label: &str) -> RunningJobGuard {
        let run_id = Uuid::new_v4();
        self.lock().running.insert(run_id, label.to_string());
        tracing::trace!(run_id = %run_id, label, "Job registered as running");
        RunningJobGuard {
            registry: self.clone(),
            run_id,
        }
    }

    fn deregister(&self, run_id: &Uuid) {
        let mut state = self.lock();
        if let Some(label) = state.running.remove(run_id) {
            tracing::trace!(run_id = %run_id, label = %label, "Job deregistered");
            state.finished.insert(label);
        }
    }

    pub fn snapshot(&self) -> RunningSnapshot {
        let state = self.lock();
        RunningSnapshot {
            running: state.running.values().cloned().collect(),
            finished: state.finished.clone(),
        }
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }
}

/// Keeps a job registered as running until dropped.
#[derive(Debug)]
pub struct RunningJobGuard {
    registry: RunningJobs,
    run_id: Uuid,
}

impl RunningJobGuard {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

impl Drop for RunningJobGuard {
    fn drop(&mut self) {
        self.registry.deregister(&self.run_id);
    }
}
