pub mod config;
pub mod console;
pub mod error;
pub mod files;
pub mod registry;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use error::{JobError, Result, RunemError};
