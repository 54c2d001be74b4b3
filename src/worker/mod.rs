//! Job execution engine.
//!
//! - [`PhaseExecutor`]: runs one phase's jobs on a bounded pool and waits
//!   for all of them before returning
//! - [`ProgressMonitor`]: samples the running jobs while a phase runs
//! - [`RunCommand`]: runs and times one external tool from inside a job
//!
//! # Execution Flow
//!
//! 1. The runner hands each selected phase to [`PhaseExecutor::run_phase`]
//! 2. Each job gets a pool slot, its files and a [`JobContext`](crate::registry::JobContext)
//! 3. The job body runs; its duration and any sub-command timings are kept
//! 4. On failure, running jobs drain and nothing further is dispatched

pub mod command;
pub mod pool;
pub mod progress;

pub use command::{run_command, RunCommand, ShellJob};
pub use pool::{ExecutorSettings, PhaseExecutor, PhaseOutcome, PhaseState};
pub use progress::{ProgressMonitor, ProgressState};
